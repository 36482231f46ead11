use std::env;
use std::time::Duration;

/// Timing and retry knobs for one room mesh.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// ICE-restart attempts allowed before a failing peer is left to eviction.
    pub max_reconnect_attempts: u32,
    /// Period of the per-session liveness probe.
    pub health_interval: Duration,
    /// How long a `disconnected` link may linger before eviction is considered.
    pub disconnected_grace: Duration,
    /// How long a `failed` link may linger before eviction is considered.
    pub failed_grace: Duration,
    /// Sustained disconnection after which an ICE restart is attempted.
    pub restart_after_disconnect: Duration,
    /// How long a fresh session may stay unconnected before its offer is sent again.
    pub negotiation_timeout: Duration,
    /// How long an offer/answer processing lock is held after processing completes.
    pub dedup_lock_hold: Duration,
    /// Lifetime of a remembered offer/answer fingerprint.
    pub fingerprint_ttl: Duration,
    /// Number of leading SDP characters that go into a fingerprint.
    pub fingerprint_prefix: usize,
    /// Label of the application data channel.
    pub data_channel_label: String,
    /// Whether the data channel delivers in order.
    pub ordered: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            health_interval: Duration::from_secs(5),
            disconnected_grace: Duration::from_secs(10),
            failed_grace: Duration::from_secs(5),
            restart_after_disconnect: Duration::from_secs(3),
            negotiation_timeout: Duration::from_secs(10),
            dedup_lock_hold: Duration::from_secs(2),
            fingerprint_ttl: Duration::from_secs(10),
            fingerprint_prefix: 100,
            data_channel_label: "mesh".to_string(),
            ordered: true,
        }
    }
}

impl MeshConfig {
    /// Defaults overridden by `MESH_*` environment variables.
    ///
    /// Durations are given in milliseconds. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_parse("MESH_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = value;
        }
        if let Some(value) = env_millis("MESH_HEALTH_INTERVAL_MS") {
            config.health_interval = value;
        }
        if let Some(value) = env_millis("MESH_DISCONNECTED_GRACE_MS") {
            config.disconnected_grace = value;
        }
        if let Some(value) = env_millis("MESH_FAILED_GRACE_MS") {
            config.failed_grace = value;
        }
        if let Some(value) = env_millis("MESH_RESTART_AFTER_DISCONNECT_MS") {
            config.restart_after_disconnect = value;
        }
        if let Some(value) = env_millis("MESH_NEGOTIATION_TIMEOUT_MS") {
            config.negotiation_timeout = value;
        }
        if let Some(value) = env_millis("MESH_DEDUP_LOCK_MS") {
            config.dedup_lock_hold = value;
        }
        if let Some(value) = env_millis("MESH_FINGERPRINT_TTL_MS") {
            config.fingerprint_ttl = value;
        }
        if let Ok(label) = env::var("MESH_CHANNEL_LABEL") {
            if !label.trim().is_empty() {
                config.data_channel_label = label;
            }
        }
        if let Some(value) = env_parse::<bool>("MESH_CHANNEL_ORDERED") {
            config.ordered = value;
        }
        config
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(var: &str) -> Option<Duration> {
    env_parse::<u64>(var).map(Duration::from_millis)
}
