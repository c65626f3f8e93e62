//! Runtime-configurable tuning parameters for rallypoint.
//!
//! All values have defaults. Override via environment variables
//! (prefixed `RALLYPOINT_`) or by constructing a custom `RallyConfig`.

use std::time::Duration;

/// Default upper bound on the variable part of one frame (1 GiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 30;

/// Timeouts and limits for the rendezvous connection and coordinator.
#[derive(Debug, Clone)]
pub struct RallyConfig {
    /// Total time a worker keeps retrying the chief before giving up.
    pub connect_timeout: Duration,

    /// Pause between two connection attempts.
    pub connect_retry_interval: Duration,

    /// Time allowed for the REGISTER/ACCEPT round trip.
    pub handshake_timeout: Duration,

    /// How long a worker waits for the chief to flush after SHUTDOWN.
    pub shutdown_timeout: Duration,

    /// How long a hosting coordinator waits for the other ranks to leave.
    pub shutdown_grace: Duration,

    /// Read-idle limit after which the chief treats a connection as dead.
    /// `None` leaves disconnect detection to the transport.
    pub liveness_timeout: Option<Duration>,

    /// Period at which workers send KEEPALIVE frames. `None` disables them.
    pub keepalive_interval: Option<Duration>,

    /// Largest series-plus-body section accepted in one frame.
    pub max_frame_bytes: usize,

    /// Worker threads of the runtime owned by a blocking context.
    pub runtime_threads: usize,

    /// Force hosting the coordinator on or off. `None` means rank 0 hosts.
    pub host_coordinator: Option<bool>,
}

impl Default for RallyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            connect_retry_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            liveness_timeout: None,
            keepalive_interval: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            runtime_threads: 2,
            host_coordinator: None,
        }
    }
}

impl RallyConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `RALLYPOINT_CONNECT_TIMEOUT_SECS`
    /// - `RALLYPOINT_CONNECT_RETRY_MS`
    /// - `RALLYPOINT_HANDSHAKE_TIMEOUT_SECS`
    /// - `RALLYPOINT_SHUTDOWN_TIMEOUT_SECS`
    /// - `RALLYPOINT_SHUTDOWN_GRACE_SECS`
    /// - `RALLYPOINT_LIVENESS_TIMEOUT_MS`
    /// - `RALLYPOINT_KEEPALIVE_MS`
    /// - `RALLYPOINT_MAX_FRAME_BYTES`
    /// - `RALLYPOINT_RUNTIME_THREADS`
    /// - `RALLYPOINT_HOST_COORDINATOR` (`1`/`true` or `0`/`false`)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads from an arbitrary source.
    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(s) = parse::<u64>(&get, "RALLYPOINT_CONNECT_TIMEOUT_SECS") {
            cfg.connect_timeout = Duration::from_secs(s);
        }
        if let Some(ms) = parse::<u64>(&get, "RALLYPOINT_CONNECT_RETRY_MS") {
            cfg.connect_retry_interval = Duration::from_millis(ms);
        }
        if let Some(s) = parse::<u64>(&get, "RALLYPOINT_HANDSHAKE_TIMEOUT_SECS") {
            cfg.handshake_timeout = Duration::from_secs(s);
        }
        if let Some(s) = parse::<u64>(&get, "RALLYPOINT_SHUTDOWN_TIMEOUT_SECS") {
            cfg.shutdown_timeout = Duration::from_secs(s);
        }
        if let Some(s) = parse::<u64>(&get, "RALLYPOINT_SHUTDOWN_GRACE_SECS") {
            cfg.shutdown_grace = Duration::from_secs(s);
        }
        if let Some(ms) = parse::<u64>(&get, "RALLYPOINT_LIVENESS_TIMEOUT_MS") {
            cfg.liveness_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse::<u64>(&get, "RALLYPOINT_KEEPALIVE_MS") {
            cfg.keepalive_interval = Some(Duration::from_millis(ms));
        }
        if let Some(n) = parse::<usize>(&get, "RALLYPOINT_MAX_FRAME_BYTES") {
            cfg.max_frame_bytes = n;
        }
        if let Some(n) = parse::<usize>(&get, "RALLYPOINT_RUNTIME_THREADS")
            && n > 0
        {
            cfg.runtime_threads = n;
        }
        if let Some(v) = get("RALLYPOINT_HOST_COORDINATOR") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => cfg.host_coordinator = Some(true),
                "0" | "false" | "no" => cfg.host_coordinator = Some(false),
                _ => {}
            }
        }

        cfg
    }
}

fn parse<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|v| v.trim().parse::<T>().ok())
}
