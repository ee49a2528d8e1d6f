//! # CRD Generator
//!
//! Prints the `LokiRule` CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/lokirule.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::CustomResourceExt;
use loki_rule_operator::crd::LokiRule;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&LokiRule::crd())?);
    Ok(())
}
