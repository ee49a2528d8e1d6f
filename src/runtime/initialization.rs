//! # Initialization
//!
//! Process setup: rustls provider, tracing subscriber, metrics, HTTP server,
//! Kubernetes client and the reconciliation context.

use crate::config::{LogFormat, OperatorSettings};
use crate::controller::reconciler::Reconciler;
use crate::controller::target::TargetCache;
use crate::controller::validation::{ExpressionValidator, LokiQueryValidator};
use crate::crd::LokiRule;
use crate::observability;
use crate::runtime::watch_loop::ControllerContext;
use crate::server::{start_server, ServerState};
use crate::store::{ClusterStore, KubeStore};
use anyhow::{anyhow, Context, Result};
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Everything the watch loop needs
pub struct InitializationResult {
    pub rules: Api<LokiRule>,
    pub context: Arc<ControllerContext>,
    pub server_state: Arc<ServerState>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("context", &self.context)
            .field("server_state", &self.server_state)
            .finish_non_exhaustive()
    }
}

/// Configure the rustls crypto provider
///
/// Must run before any TLS connection is opened.
pub fn install_crypto_provider() {
    // Err only means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("loki_rule_operator={level},kube=warn")));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize tracing: {e}"))
}

/// Build the reconciliation context on top of a Kubernetes client
pub fn build_reconciler(client: Client, settings: &OperatorSettings) -> Result<Reconciler> {
    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client, settings.request_timeout));

    let validator = match &settings.loki {
        Some(endpoint) => {
            let validator = LokiQueryValidator::new(endpoint, settings.request_timeout)
                .context("Failed to configure LogQL validation")?;
            info!("LogQL validation enabled against {}", validator.base_url());
            Some(Arc::new(validator) as Arc<dyn ExpressionValidator>)
        }
        None => {
            info!("LogQL validation disabled (no Loki URL configured)");
            None
        }
    };

    Ok(Reconciler::new(
        store,
        settings,
        validator,
        Arc::new(TargetCache::new()),
    ))
}

/// Register metrics, start the HTTP server and connect to the cluster
pub async fn initialize(settings: &OperatorSettings) -> Result<InitializationResult> {
    info!("Starting Loki Rule Operator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Watching LokiRules; target selector '{}' in namespace {}, ConfigMap {}",
        settings.selector, settings.namespace, settings.config_map_name
    );
    if settings.only_reconcile_rules {
        info!("Only reconciling rules: the Loki StatefulSet will not be modified");
    }

    observability::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let server_state_clone = Arc::clone(&server_state);
    let server_port = settings.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let rules: Api<LokiRule> = Api::all(client.clone());
    let reconciler = build_reconciler(client.clone(), settings)?;

    Ok(InitializationResult {
        rules,
        context: Arc::new(ControllerContext { client, reconciler }),
        server_state,
    })
}
