// Process-wide defaults, read once from the environment
use busline_transport::TransportLimits;
use once_cell::sync::Lazy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

// Environment variables for configuration
// BUSLINE_OOM_WAIT_MS: pause before retrying after an allocation failure (default: 500)
// BUSLINE_MAX_MESSAGE_SIZE: largest single message accepted, in bytes
// BUSLINE_MAX_MESSAGE_UNIX_FDS: most fds a single message may carry
// BUSLINE_MAX_LIVE_BYTES: received-but-unprocessed bytes before reading pauses
// BUSLINE_MAX_LIVE_UNIX_FDS: received-but-unprocessed fds before reading pauses
// BUSLINE_MAX_BYTES_PER_ITERATION: read and write budget of one watch callback

pub const DEFAULT_OOM_WAIT_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub oom_wait: Duration,
    pub limits: TransportLimits,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds settings from any name-to-value source; unset or unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn get<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            lookup(name).and_then(|s| s.trim().parse().ok())
        }

        let mut limits = TransportLimits::default();
        if let Some(v) = get(&lookup, "BUSLINE_MAX_MESSAGE_SIZE") {
            limits.max_message_size = v;
        }
        if let Some(v) = get(&lookup, "BUSLINE_MAX_MESSAGE_UNIX_FDS") {
            limits.max_message_unix_fds = v;
        }
        if let Some(v) = get(&lookup, "BUSLINE_MAX_LIVE_BYTES") {
            limits.max_live_bytes = v;
        }
        if let Some(v) = get(&lookup, "BUSLINE_MAX_LIVE_UNIX_FDS") {
            limits.max_live_unix_fds = v;
        }
        if let Some(v) = get(&lookup, "BUSLINE_MAX_BYTES_PER_ITERATION") {
            limits.max_bytes_read_per_iteration = v;
            limits.max_bytes_written_per_iteration = v;
        }

        let oom_wait_ms = get(&lookup, "BUSLINE_OOM_WAIT_MS").unwrap_or(DEFAULT_OOM_WAIT_MS);

        Settings {
            oom_wait: Duration::from_millis(oom_wait_ms),
            limits: limits.sanitized(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

// Global settings singleton - initialized lazily on first use
pub static SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let s = settings(&[]);
        assert_eq!(s.oom_wait, Duration::from_millis(DEFAULT_OOM_WAIT_MS));
        assert_eq!(s.limits, TransportLimits::default().sanitized());
    }

    #[test]
    fn values_override_defaults() {
        let s = settings(&[
            ("BUSLINE_OOM_WAIT_MS", "0"),
            ("BUSLINE_MAX_LIVE_BYTES", "4096"),
            ("BUSLINE_MAX_BYTES_PER_ITERATION", " 512 "),
        ]);
        assert_eq!(s.oom_wait, Duration::ZERO);
        assert_eq!(s.limits.max_live_bytes, 4096);
        assert_eq!(s.limits.max_bytes_read_per_iteration, 512);
        assert_eq!(s.limits.max_bytes_written_per_iteration, 512);
    }

    #[test]
    fn garbage_is_ignored() {
        let s = settings(&[("BUSLINE_OOM_WAIT_MS", "soon"), ("BUSLINE_MAX_MESSAGE_SIZE", "-1")]);
        assert_eq!(s.oom_wait, Duration::from_millis(DEFAULT_OOM_WAIT_MS));
        assert_eq!(s.limits.max_message_size, TransportLimits::default().sanitized().max_message_size);
    }
}
