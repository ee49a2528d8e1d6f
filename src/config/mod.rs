//! # Configuration
//!
//! Operator settings loaded from command-line flags, with every flag also
//! readable from an environment variable so the deployment can populate them
//! from a ConfigMap via `envFrom`.
//!
//! - `OperatorConfig`: raw flags as parsed by `clap`
//! - `OperatorSettings`: validated settings consumed by the runtime
//! - `selector`: label selector grammar for locating the Loki StatefulSet

pub mod selector;

pub use selector::{LabelSelector, SelectorError};

use crate::constants::{
    DEFAULT_LEADER_ELECTION_ID, DEFAULT_LEADER_ELECTION_NAMESPACE, DEFAULT_LOKI_NAMESPACE,
    DEFAULT_MAX_CONCURRENT_RECONCILIATIONS, DEFAULT_METRICS_PORT, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_RULE_CONFIG_MAP_NAME, DEFAULT_RULE_MOUNT_PATH,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid --loki-label-selector: {0}")]
    Selector(#[from] SelectorError),
    #[error("missing delimiter '=' in header pair: '{0}'")]
    InvalidHeader(String),
    #[error("invalid --loki-url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("--request-timeout-secs must be greater than zero")]
    ZeroTimeout,
    #[error("--leader-election-id must not be empty")]
    EmptyLeaderElectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Watch LokiRule resources and keep the Loki StatefulSet in sync (default)
    Run,
    /// Remove the rules volume, mount and checksum annotation from the Loki StatefulSet
    Teardown,
}

/// Raw operator flags
#[derive(Debug, Clone, Parser)]
#[command(
    name = "loki-rule-operator",
    version,
    about = "Aggregates LokiRule resources into a ConfigMap mounted into Loki"
)]
pub struct OperatorConfig {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Label selector used to find the Loki StatefulSet (e.g. "app=loki")
    #[arg(long, env = "LOKI_LABEL_SELECTOR", default_value = "")]
    pub loki_label_selector: String,

    /// Namespace of the target Loki instance; the rules ConfigMap lives there too
    #[arg(long, env = "LOKI_NAMESPACE", default_value = DEFAULT_LOKI_NAMESPACE)]
    pub loki_namespace: String,

    /// Path where the rules ConfigMap is mounted inside the Loki container
    #[arg(long, env = "LOKI_RULE_MOUNT_PATH", default_value = DEFAULT_RULE_MOUNT_PATH)]
    pub loki_rule_mount_path: String,

    /// Name of the aggregated rules ConfigMap
    #[arg(long, env = "LOKI_RULE_CONFIG_MAP_NAME", default_value = DEFAULT_RULE_CONFIG_MAP_NAME)]
    pub loki_rule_config_map_name: String,

    /// Container that receives the volume mount; defaults to the first container
    #[arg(long, env = "LOKI_CONTAINER")]
    pub loki_container: Option<String>,

    /// Loki base URL used to validate LogQL expressions; validation is disabled when unset
    #[arg(long, env = "LOKI_URL")]
    pub loki_url: Option<String>,

    /// Extra header sent to Loki, format KEY=VALUE; may be repeated
    #[arg(long = "loki-header")]
    pub loki_headers: Vec<String>,

    /// Comma separated KEY=VALUE headers; `--loki-header` wins on duplicate keys
    #[arg(long = "loki-headers", env = "LOKI_HEADERS", value_delimiter = ',', hide = true)]
    pub loki_header_list: Vec<String>,

    /// Only reconcile LokiRules into the ConfigMap, leaving the StatefulSet untouched
    #[arg(long, env = "ONLY_RECONCILE_RULES")]
    pub only_reconcile_rules: bool,

    /// Port of the metrics and health check server
    #[arg(long, env = "METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log level used when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Timeout applied to every API server and Loki request
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "MAX_CONCURRENT_RECONCILIATIONS", default_value_t = DEFAULT_MAX_CONCURRENT_RECONCILIATIONS)]
    pub max_concurrent_reconciliations: u16,

    /// Only reconcile while holding a Lease, so a single replica is active
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    /// Name of the Lease used for leader election
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = DEFAULT_LEADER_ELECTION_ID)]
    pub leader_election_id: String,

    /// Namespace of the leader election Lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = DEFAULT_LEADER_ELECTION_NAMESPACE)]
    pub leader_election_namespace: String,

    /// Identity recorded as Lease holder; defaults to the pod hostname
    #[arg(long, env = "POD_NAME")]
    pub leader_election_identity: Option<String>,
}

/// Lease used to elect the single active replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElection {
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
}

/// Where and how LogQL expressions are validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LokiEndpoint {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

/// Validated operator settings
#[derive(Debug, Clone)]
pub struct OperatorSettings {
    pub command: Command,
    pub selector: LabelSelector,
    pub namespace: String,
    pub mount_path: String,
    pub config_map_name: String,
    pub container: Option<String>,
    pub loki: Option<LokiEndpoint>,
    pub only_reconcile_rules: bool,
    pub metrics_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub request_timeout: Duration,
    pub max_concurrent_reconciliations: u16,
    pub leader_election: Option<LeaderElection>,
}

impl OperatorConfig {
    pub fn validate(self) -> Result<OperatorSettings, ConfigError> {
        let selector: LabelSelector = self.loki_label_selector.parse()?;

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let mut headers = parse_headers(&self.loki_header_list)?;
        headers.extend(parse_headers(&self.loki_headers)?);
        let loki = match self.loki_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => {
                reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
                Some(LokiEndpoint {
                    url: url.trim_end_matches('/').to_string(),
                    headers,
                })
            }
            _ => None,
        };

        let namespace = if self.loki_namespace.trim().is_empty() {
            DEFAULT_LOKI_NAMESPACE.to_string()
        } else {
            self.loki_namespace
        };

        let leader_election = if self.leader_elect {
            if self.leader_election_id.trim().is_empty() {
                return Err(ConfigError::EmptyLeaderElectionId);
            }
            let identity = self
                .leader_election_identity
                .filter(|identity| !identity.trim().is_empty())
                .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
                .unwrap_or_else(|| format!("loki-rule-operator-{}", std::process::id()));
            Some(LeaderElection {
                lease_name: self.leader_election_id,
                namespace: self.leader_election_namespace,
                identity,
            })
        } else {
            None
        };

        Ok(OperatorSettings {
            command: self.command.unwrap_or(Command::Run),
            selector,
            namespace,
            mount_path: self.loki_rule_mount_path,
            config_map_name: self.loki_rule_config_map_name,
            container: self.loki_container.filter(|c| !c.is_empty()),
            loki,
            only_reconcile_rules: self.only_reconcile_rules,
            metrics_port: self.metrics_port,
            log_level: self.log_level,
            log_format: self.log_format,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_concurrent_reconciliations: self.max_concurrent_reconciliations,
            leader_election,
        })
    }
}

/// Parse `KEY=VALUE` pairs; the value may itself contain `=`
pub fn parse_headers(pairs: &[String]) -> Result<BTreeMap<String, String>, ConfigError> {
    pairs
        .iter()
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| ConfigError::InvalidHeader(pair.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> OperatorConfig {
        let mut argv = vec!["loki-rule-operator"];
        argv.extend_from_slice(args);
        OperatorConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = parse(&["--loki-label-selector", "app=loki"])
            .validate()
            .unwrap();
        assert_eq!(settings.command, Command::Run);
        assert_eq!(settings.namespace, "default");
        assert_eq!(settings.mount_path, "/etc/loki/rules");
        assert_eq!(settings.config_map_name, "loki-rule-cfg");
        assert_eq!(settings.container, None);
        assert_eq!(settings.loki, None);
        assert!(!settings.only_reconcile_rules);
        assert_eq!(settings.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_loki_endpoint_with_headers() {
        let settings = parse(&[
            "--loki-label-selector",
            "app=loki",
            "--loki-url",
            "http://loki-gateway:3100/",
            "--loki-header",
            "X-Scope-OrgID=tenant-a",
            "--loki-header",
            "Authorization=Basic dXNlcjpwYXNz==",
        ])
        .validate()
        .unwrap();

        let loki = settings.loki.unwrap();
        assert_eq!(loki.url, "http://loki-gateway:3100");
        assert_eq!(loki.headers.get("X-Scope-OrgID").unwrap(), "tenant-a");
        assert_eq!(
            loki.headers.get("Authorization").unwrap(),
            "Basic dXNlcjpwYXNz=="
        );
    }

    #[test]
    fn test_header_without_delimiter_is_rejected() {
        let err = parse(&["--loki-label-selector", "app=loki", "--loki-header", "broken"])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHeader(h) if h == "broken"));
    }

    #[test]
    fn test_empty_selector_is_rejected() {
        let err = parse(&[]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Selector(SelectorError::Empty)));
    }

    #[test]
    fn test_empty_namespace_falls_back_to_default() {
        let settings = parse(&["--loki-label-selector", "app=loki", "--loki-namespace", ""])
            .validate()
            .unwrap();
        assert_eq!(settings.namespace, "default");
    }

    #[test]
    fn test_teardown_subcommand() {
        let settings = parse(&["--loki-label-selector", "app=loki", "teardown"])
            .validate()
            .unwrap();
        assert_eq!(settings.command, Command::Teardown);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let err = parse(&["--loki-label-selector", "app=loki", "--loki-url", "not a url"])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn test_header_flag_keeps_commas_in_values() {
        let settings = parse(&[
            "--loki-label-selector",
            "app=loki",
            "--loki-url",
            "http://loki:3100",
            "--loki-header",
            "Authorization=Basic a,b",
        ])
        .validate()
        .unwrap();
        let loki = settings.loki.unwrap();
        assert_eq!(loki.headers.len(), 1);
        assert_eq!(loki.headers.get("Authorization").unwrap(), "Basic a,b");
    }

    #[test]
    fn test_header_list_is_split_on_commas() {
        let settings = parse(&[
            "--loki-label-selector",
            "app=loki",
            "--loki-url",
            "http://loki:3100",
            "--loki-headers",
            "X-Scope-OrgID=tenant-a,X-Team=obs",
            "--loki-header",
            "X-Team=platform",
        ])
        .validate()
        .unwrap();
        let headers = settings.loki.unwrap().headers;
        assert_eq!(headers.get("X-Scope-OrgID").unwrap(), "tenant-a");
        assert_eq!(headers.get("X-Team").unwrap(), "platform");
    }

    #[test]
    fn test_leader_election_is_off_by_default() {
        let settings = parse(&["--loki-label-selector", "app=loki"])
            .validate()
            .unwrap();
        assert_eq!(settings.leader_election, None);
    }

    #[test]
    fn test_leader_election_settings() {
        let settings = parse(&[
            "--loki-label-selector",
            "app=loki",
            "--leader-elect",
            "--leader-election-namespace",
            "loki",
            "--leader-election-identity",
            "operator-0",
        ])
        .validate()
        .unwrap();
        assert_eq!(
            settings.leader_election,
            Some(LeaderElection {
                lease_name: "21ccfc3d.quero.com".to_string(),
                namespace: "loki".to_string(),
                identity: "operator-0".to_string(),
            })
        );
    }

    #[test]
    fn test_empty_leader_election_id_is_rejected() {
        let err = parse(&[
            "--loki-label-selector",
            "app=loki",
            "--leader-elect",
            "--leader-election-id",
            "",
        ])
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyLeaderElectionId));
    }
}
