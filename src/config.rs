use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ProxyError;
use crate::ts::FilterPolicy;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Loopback address the proxy listens on
    pub bind_addr: IpAddr,
    /// Listener port, 0 picks an ephemeral one
    pub port: u16,
    /// Live window duration in seconds (default: 300)
    pub live_window_secs: u64,
    /// Segment duration assumed when sizing the live window (default: 3)
    pub assumed_segment_secs: u64,
    /// Disk budget for spilled fragments, replaced by 20% of free space once measured
    pub disk_budget_bytes: u64,
    /// Parent of the per-instance scratch directories
    pub cache_dir: PathBuf,
    /// Multiplexer fragment size in bytes (default: 128 KB)
    pub fragment_size: usize,
    pub prefetch_enabled: bool,
    pub prefetch_max_concurrency: usize,
    /// Refuse segments that fell out of every live window with 204
    pub finish_outside_live_window: bool,
    pub packet_filter_policy: FilterPolicy,
    pub fetch_retries: u32,
    pub fetch_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub keepalive: bool,
    pub follow_redirect: bool,
    /// Page visited once when the origin answers 401/403
    pub auth_url: Option<String>,
    /// Prometheus exporter port (exporter disabled when unset)
    pub metrics_port: Option<u16>,
    /// Live source re-served by the standalone relay, when set
    pub relay_source: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            live_window_secs: 300,
            assumed_segment_secs: 3,
            disk_budget_bytes: 200 * 1024 * 1024,
            cache_dir: env::temp_dir().join("hlsmux"),
            fragment_size: 128 * 1024,
            prefetch_enabled: true,
            prefetch_max_concurrency: 1,
            finish_outside_live_window: false,
            packet_filter_policy: FilterPolicy::Trim,
            fetch_retries: 3,
            fetch_timeout_secs: 60,
            connect_timeout_secs: 5,
            keepalive: true,
            follow_redirect: true,
            auth_url: None,
            metrics_port: None,
            relay_source: None,
        }
    }
}

fn flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    /// Unset variables fall back to defaults; malformed values are an error.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Config::default();

        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1".to_string())
            .parse()?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "0".to_string())
            .parse()?;

        let live_window_secs = env::var("LIVE_WINDOW_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()?;

        let assumed_segment_secs = env::var("ASSUMED_SEGMENT_SECS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()?;

        let disk_budget_mb: u64 = env::var("DISK_BUDGET_MB")
            .unwrap_or_else(|_| "200".to_string())
            .parse()?;

        let cache_dir = env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let fragment_kb: usize = env::var("FRAGMENT_SIZE_KB")
            .unwrap_or_else(|_| "128".to_string())
            .parse()?;

        let prefetch_max_concurrency = env::var("PREFETCH_CONCURRENCY")
            .unwrap_or_else(|_| "1".to_string())
            .parse()?;

        // 0=bypass, 1=trim, 2=remove
        let policy_code: u8 = env::var("TS_PACKET_FILTER_POLICY")
            .unwrap_or_else(|_| "1".to_string())
            .parse()?;
        let packet_filter_policy = FilterPolicy::from_code(policy_code).ok_or_else(|| {
            ProxyError::Configuration(format!(
                "TS_PACKET_FILTER_POLICY must be 0, 1 or 2, got {}",
                policy_code
            ))
        })?;

        let fetch_retries = env::var("FETCH_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()?;

        let fetch_timeout_secs = env::var("FETCH_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()?;

        let connect_timeout_secs = env::var("CONNECT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()?;

        let metrics_port = env::var("METRICS_PORT")
            .ok()
            .map(|p| p.parse::<u16>())
            .transpose()?;

        let config = Config {
            bind_addr,
            port,
            live_window_secs,
            assumed_segment_secs,
            disk_budget_bytes: disk_budget_mb * 1024 * 1024,
            cache_dir,
            fragment_size: fragment_kb * 1024,
            prefetch_enabled: flag("HLS_PREFETCH", true),
            prefetch_max_concurrency,
            finish_outside_live_window: flag("FINISH_OUTSIDE_LIVE_WINDOW", false),
            packet_filter_policy,
            fetch_retries,
            fetch_timeout_secs,
            connect_timeout_secs,
            keepalive: flag("USE_KEEPALIVE", true),
            follow_redirect: flag("FOLLOW_REDIRECT", true),
            auth_url: env::var("AUTH_URL").ok().filter(|u| !u.is_empty()),
            metrics_port,
            relay_source: env::var("RELAY_SOURCE").ok().filter(|u| !u.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.fragment_size == 0 {
            return Err(ProxyError::Configuration(
                "FRAGMENT_SIZE_KB must be greater than 0".into(),
            ));
        }
        if self.live_window_secs == 0 || self.assumed_segment_secs == 0 {
            return Err(ProxyError::Configuration(
                "LIVE_WINDOW_SECS and ASSUMED_SEGMENT_SECS must be greater than 0".into(),
            ));
        }
        if self.disk_budget_bytes == 0 {
            return Err(ProxyError::Configuration(
                "DISK_BUDGET_MB must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Number of segments the live window is expected to hold.
    pub fn max_window_size(&self) -> usize {
        self.live_window_secs.div_ceil(self.assumed_segment_secs) as usize
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all env-var tests to prevent races between parallel test threads.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "BIND_ADDR",
        "PORT",
        "LIVE_WINDOW_SECS",
        "ASSUMED_SEGMENT_SECS",
        "DISK_BUDGET_MB",
        "CACHE_DIR",
        "FRAGMENT_SIZE_KB",
        "HLS_PREFETCH",
        "PREFETCH_CONCURRENCY",
        "FINISH_OUTSIDE_LIVE_WINDOW",
        "TS_PACKET_FILTER_POLICY",
        "FETCH_RETRIES",
        "FETCH_TIMEOUT_SECS",
        "CONNECT_TIMEOUT_SECS",
        "USE_KEEPALIVE",
        "FOLLOW_REDIRECT",
        "AUTH_URL",
        "METRICS_PORT",
        "RELAY_SOURCE",
    ];

    /// Set env vars, run `f`, then restore original state.
    ///
    /// Every known variable not listed in `set` is removed while `f` runs.
    fn with_env(set: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let saved: Vec<(&str, Option<String>)> = ALL_VARS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        for k in ALL_VARS {
            // SAFETY: serialized by ENV_LOCK, no other thread touches env vars concurrently.
            unsafe { std::env::remove_var(k) };
        }
        for (k, v) in set {
            unsafe { std::env::set_var(k, v) };
        }

        f();

        for (k, old) in saved {
            match old {
                Some(v) => unsafe { std::env::set_var(k, v) },
                None => unsafe { std::env::remove_var(k) },
            }
        }
    }

    #[test]
    fn defaults_when_unset() {
        with_env(&[], || {
            let config = Config::from_env().expect("defaults should load");
            assert_eq!(config.bind_addr, IpAddr::from([127, 0, 0, 1]));
            assert_eq!(config.port, 0);
            assert_eq!(config.live_window_secs, 300);
            assert_eq!(config.fragment_size, 128 * 1024);
            assert_eq!(config.disk_budget_bytes, 200 * 1024 * 1024);
            assert_eq!(config.packet_filter_policy, FilterPolicy::Trim);
            assert_eq!(config.prefetch_max_concurrency, 1);
            assert!(config.prefetch_enabled);
            assert!(!config.finish_outside_live_window);
            assert!(config.keepalive);
            assert!(config.auth_url.is_none());
            assert!(config.metrics_port.is_none());
        });
    }

    #[test]
    fn max_window_size_rounds_up() {
        with_env(
            &[("LIVE_WINDOW_SECS", "10"), ("ASSUMED_SEGMENT_SECS", "3")],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.max_window_size(), 4);
            },
        );
        assert_eq!(Config::default().max_window_size(), 100);
    }

    #[test]
    fn flags_parsed() {
        with_env(
            &[
                ("HLS_PREFETCH", "false"),
                ("FINISH_OUTSIDE_LIVE_WINDOW", "1"),
                ("USE_KEEPALIVE", "no"),
                ("FOLLOW_REDIRECT", "TRUE"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert!(!config.prefetch_enabled);
                assert!(config.finish_outside_live_window);
                assert!(!config.keepalive);
                assert!(config.follow_redirect);
            },
        );
    }

    #[test]
    fn filter_policy_must_be_known() {
        with_env(&[("TS_PACKET_FILTER_POLICY", "7")], || {
            assert!(Config::from_env().is_err());
        });
        with_env(&[("TS_PACKET_FILTER_POLICY", "2")], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.packet_filter_policy, FilterPolicy::Remove);
        });
    }

    #[test]
    fn zero_fragment_size_rejected() {
        with_env(&[("FRAGMENT_SIZE_KB", "0")], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn malformed_port_rejected() {
        with_env(&[("PORT", "not-a-port")], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn optional_urls_ignore_empty_values() {
        with_env(
            &[
                ("AUTH_URL", ""),
                ("RELAY_SOURCE", "http://cdn.example.com/live.ts"),
                ("METRICS_PORT", "9100"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert!(config.auth_url.is_none());
                assert_eq!(
                    config.relay_source.as_deref(),
                    Some("http://cdn.example.com/live.ts")
                );
                assert_eq!(config.metrics_port, Some(9100));
            },
        );
    }
}
