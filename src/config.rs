use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// --- Configuration ----------------------------------------------------------
//
// Everything is read from the environment once at startup:
//   TUNECACHE_BIND                   listener address (default 127.0.0.1:18911)
//   TUNECACHE_CACHE_DIR              cache root served over HTTP
//   TUNECACHE_OSD_HELPER             OSD helper program name or path
//   TUNECACHE_DOWNLOAD_TIMEOUT_SECS  per-mirror request timeout
//
// A value that fails to parse is logged and replaced by its default.

pub const DEFAULT_BIND: &str = "127.0.0.1:18911";
pub const DEFAULT_OSD_HELPER: &str = "osd_lyrics";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub cache_root: PathBuf,
    pub osd_helper: String,
    pub download_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind = match lookup("TUNECACHE_BIND") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
                tracing::warn!("config: invalid TUNECACHE_BIND {raw:?} ({e}), using {DEFAULT_BIND}");
                default_bind()
            }),
            None => default_bind(),
        };

        let cache_root = lookup("TUNECACHE_CACHE_DIR")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_root);

        let osd_helper = lookup("TUNECACHE_OSD_HELPER")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_OSD_HELPER.to_string());

        let timeout_secs = match lookup("TUNECACHE_DOWNLOAD_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => {
                    tracing::warn!(
                        "config: invalid TUNECACHE_DOWNLOAD_TIMEOUT_SECS {raw:?}, using {DEFAULT_DOWNLOAD_TIMEOUT_SECS}"
                    );
                    DEFAULT_DOWNLOAD_TIMEOUT_SECS
                }
            },
            None => DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        };

        Self {
            bind,
            cache_root,
            osd_helper,
            download_timeout: Duration::from_secs(timeout_secs),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 18911))
}

fn default_cache_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("tunecache")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.bind, default_bind());
        assert_eq!(cfg.osd_helper, DEFAULT_OSD_HELPER);
        assert_eq!(cfg.download_timeout, Duration::from_secs(30));
        assert!(cfg.cache_root.ends_with(".cache/tunecache"));
    }

    #[test]
    fn reads_overrides() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("TUNECACHE_BIND", "0.0.0.0:9000"),
            ("TUNECACHE_CACHE_DIR", "/tmp/tc"),
            ("TUNECACHE_OSD_HELPER", "/opt/osd/bin/osd_lyrics"),
            ("TUNECACHE_DOWNLOAD_TIMEOUT_SECS", "15"),
        ]));
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.cache_root, PathBuf::from("/tmp/tc"));
        assert_eq!(cfg.osd_helper, "/opt/osd/bin/osd_lyrics");
        assert_eq!(cfg.download_timeout, Duration::from_secs(15));
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("TUNECACHE_BIND", "not an address"),
            ("TUNECACHE_DOWNLOAD_TIMEOUT_SECS", "0"),
            ("TUNECACHE_OSD_HELPER", "   "),
        ]));
        assert_eq!(cfg.bind, default_bind());
        assert_eq!(cfg.download_timeout, Duration::from_secs(30));
        assert_eq!(cfg.osd_helper, DEFAULT_OSD_HELPER);
    }
}
