//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! These values represent reasonable defaults and can be overridden via
//! command-line flags or environment variables where applicable.

/// Name of the aggregated rules ConfigMap
pub const DEFAULT_RULE_CONFIG_MAP_NAME: &str = "loki-rule-cfg";

/// Namespace of the target Loki instance
pub const DEFAULT_LOKI_NAMESPACE: &str = "default";

/// Path where the aggregated ConfigMap is mounted inside the Loki container
pub const DEFAULT_RULE_MOUNT_PATH: &str = "/etc/loki/rules";

/// Loki query endpoint used to check that a LogQL expression parses
pub const LOKI_QUERY_ENDPOINT: &str = "/loki/api/v1/query";

/// Label keys and values stamped on the aggregated ConfigMap
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const COMPONENT_LABEL_VALUE: &str = "loki-rule-cfg";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_LABEL_VALUE: &str = "loki-rule-operator";

/// ConfigMap annotation mapping each fragment key to the LokiRule that wrote it
pub const FRAGMENT_OWNERS_ANNOTATION: &str = "loki.quero.com/fragment-owners";

/// Prefix of the pod template annotation holding the ConfigMap content hash
pub const CHECKSUM_ANNOTATION_PREFIX: &str = "checksum/config-";

/// Suffix appended to the ConfigMap name to build the volume name
pub const VOLUME_NAME_SUFFIX: &str = "-volume";

/// Finalizer placed on every LokiRule so deletions are observed with their last state
pub const LOKI_RULE_FINALIZER: &str = "loki.quero.com/finalizer";

/// Field manager used for status patches
pub const FIELD_MANAGER: &str = "loki-rule-operator";

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default timeout applied to every API server and Loki request (seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default upper bound of reconciliations running at the same time
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: u16 = 10;

/// Error backoff bounds (seconds)
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 1;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Leader election Lease defaults
pub const DEFAULT_LEADER_ELECTION_ID: &str = "21ccfc3d.quero.com";
pub const DEFAULT_LEADER_ELECTION_NAMESPACE: &str = "default";

/// How long a Lease claim is valid after its last renewal (seconds)
pub const LEASE_DURATION_SECS: u64 = 15;

/// How long before expiry the holder renews its claim (seconds)
pub const LEASE_RENEW_GRACE_SECS: u64 = 5;
