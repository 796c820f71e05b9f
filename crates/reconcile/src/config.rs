//! Runtime configuration, read from `TRELLIS_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Fixed delay before re-delivering an object with a missing or unready dependency.
    pub requeue_delay: Duration,
    pub workers: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Restrict reconciliation to one namespace. Cluster-scoped objects are always handled.
    pub namespace: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            requeue_delay: Duration::from_secs(5),
            workers: 4,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
            namespace: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            requeue_delay: env_parse::<u64>("TRELLIS_REQUEUE_SECS").map(Duration::from_secs).unwrap_or(d.requeue_delay),
            workers: env_parse::<usize>("TRELLIS_WORKERS").filter(|w| *w > 0).unwrap_or(d.workers),
            backoff_base: env_parse::<u64>("TRELLIS_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env_parse::<u64>("TRELLIS_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            namespace: std::env::var("TRELLIS_NAMESPACE").ok().filter(|s| !s.is_empty()),
        }
    }

    /// Exponential backoff for the `attempt`-th consecutive failure (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    /// Whether an object in `namespace` is in scope.
    pub fn watches(&self, namespace: Option<&str>) -> bool {
        match (&self.namespace, namespace) {
            (None, _) | (_, None) => true,
            (Some(want), Some(ns)) => want == ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let c = Config { backoff_base: Duration::from_millis(100), backoff_max: Duration::from_secs(1), ..Config::default() };
        assert_eq!(c.backoff(0), Duration::from_millis(100));
        assert_eq!(c.backoff(1), Duration::from_millis(200));
        assert_eq!(c.backoff(3), Duration::from_millis(800));
        assert_eq!(c.backoff(4), Duration::from_secs(1));
        assert_eq!(c.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn namespace_scope() {
        let all = Config::default();
        assert!(all.watches(Some("a")));
        let one = Config { namespace: Some("a".into()), ..Config::default() };
        assert!(one.watches(Some("a")));
        assert!(!one.watches(Some("b")));
        assert!(one.watches(None));
    }
}
