//! # Loki Rule Operator
//!
//! A Kubernetes operator that turns `LokiRule` resources into Loki ruler
//! configuration.
//!
//! ## Overview
//!
//! 1. **Compile** - each LokiRule becomes a rules file, optionally validated against Loki
//! 2. **Aggregate** - every rules file is stored in one ConfigMap
//! 3. **Mount** - the ConfigMap is mounted into the Loki StatefulSet selected by label
//! 4. **Roll** - a checksum annotation on the pod template restarts Loki when rules change
//!
//! ## Usage
//!
//! ```bash
//! loki-rule-operator --loki-label-selector app.kubernetes.io/name=loki --loki-namespace loki
//! loki-rule-operator --loki-label-selector app.kubernetes.io/name=loki teardown
//! ```

use anyhow::Result;
use clap::Parser;
use loki_rule_operator::config::{Command, OperatorConfig};
use loki_rule_operator::runtime::{self, initialization};

#[tokio::main]
async fn main() -> Result<()> {
    initialization::install_crypto_provider();

    let settings = OperatorConfig::parse().validate()?;
    initialization::init_tracing(&settings.log_level, settings.log_format)?;

    match settings.command {
        Command::Run => runtime::run(&settings).await,
        Command::Teardown => runtime::teardown(&settings).await,
    }
}
