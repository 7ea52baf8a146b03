use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

/// Optimistic-write retry parameters. Passed to the write executor at
/// construction so tests can pin attempts and delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Multiplicative jitter bound: 0.25 means each delay lands in [0.75x, 1.25x].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before the retry that follows `attempts_made` attempts.
    pub fn nominal_delay(&self, attempts_made: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempts_made.min(16))
    }

    /// Delay before the next retry, with uniform multiplicative jitter.
    pub fn backoff_delay(&self, attempts_made: u32) -> Duration {
        let nominal = self.nominal_delay(attempts_made);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor.max(0.0))
    }
}

/// Retry budget for transport failures against the lock service or record
/// store. Independent of the optimistic-write policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(25),
        }
    }
}

impl TransportRetry {
    /// Linear backoff: `delay * attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay.saturating_mul(attempt.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorConfig {
    /// A unit is hot once contention events in the window exceed this.
    pub hot_threshold: usize,
    pub window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            hot_threshold: 5,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// Journal directory for the built-in record store. In-memory only when unset.
    pub data_dir: Option<PathBuf>,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub lock_ttl: Duration,
    pub retry: RetryPolicy,
    pub transport: TransportRetry,
    pub monitor: MonitorConfig,
    pub reaper_interval: Duration,
    pub compact_threshold: u64,
    pub event_channel: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            data_dir: None,
            max_connections: 256,
            metrics_port: None,
            lock_ttl: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
            transport: TransportRetry::default(),
            monitor: MonitorConfig::default(),
            reaper_interval: Duration::from_secs(5),
            compact_threshold: 1000,
            event_channel: "occupancy".into(),
        }
    }
}

impl Config {
    /// Build from `OCCUPANCY_*` environment variables. Unset or unparsable
    /// values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        fn parsed<T: FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.parse().ok())
        }

        Self {
            bind: get("OCCUPANCY_BIND").unwrap_or(d.bind),
            port: parsed(get("OCCUPANCY_PORT")).unwrap_or(d.port),
            data_dir: get("OCCUPANCY_DATA_DIR").map(PathBuf::from),
            max_connections: parsed(get("OCCUPANCY_MAX_CONNECTIONS")).unwrap_or(d.max_connections),
            metrics_port: parsed(get("OCCUPANCY_METRICS_PORT")),
            lock_ttl: parsed(get("OCCUPANCY_LOCK_TTL_SECS"))
                .map(Duration::from_secs)
                .unwrap_or(d.lock_ttl),
            retry: RetryPolicy {
                max_attempts: parsed(get("OCCUPANCY_WRITE_ATTEMPTS"))
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(d.retry.max_attempts),
                base_delay: parsed(get("OCCUPANCY_WRITE_BASE_DELAY_MS"))
                    .map(Duration::from_millis)
                    .unwrap_or(d.retry.base_delay),
                jitter: d.retry.jitter,
            },
            transport: TransportRetry {
                attempts: parsed(get("OCCUPANCY_TRANSPORT_ATTEMPTS"))
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(d.transport.attempts),
                delay: parsed(get("OCCUPANCY_TRANSPORT_DELAY_MS"))
                    .map(Duration::from_millis)
                    .unwrap_or(d.transport.delay),
            },
            monitor: MonitorConfig {
                hot_threshold: parsed(get("OCCUPANCY_HOT_THRESHOLD"))
                    .unwrap_or(d.monitor.hot_threshold),
                window: parsed(get("OCCUPANCY_HOT_WINDOW_SECS"))
                    .map(Duration::from_secs)
                    .unwrap_or(d.monitor.window),
            },
            reaper_interval: parsed(get("OCCUPANCY_REAPER_INTERVAL_SECS"))
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.reaper_interval),
            compact_threshold: parsed(get("OCCUPANCY_COMPACT_THRESHOLD"))
                .unwrap_or(d.compact_threshold),
            event_channel: get("OCCUPANCY_EVENT_CHANNEL").unwrap_or(d.event_channel),
        }
    }
}
