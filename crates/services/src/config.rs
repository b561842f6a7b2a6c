use std::time::Duration;

use storage::fallback::DEFAULT_STORE_TIMEOUT;

/// Session name used when the caller supplies none.
pub const DEFAULT_SESSION_NAME: &str = "PYQ Practice Session";

/// Tunables for the practice engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PracticeConfig {
    /// Bound on each durable-store and question-source call.
    pub store_timeout: Duration,
    pub default_session_name: String,
    /// Fixed seed for shuffles; `None` draws from the thread RNG.
    pub shuffle_seed: Option<u64>,
}

impl Default for PracticeConfig {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            default_session_name: DEFAULT_SESSION_NAME.to_owned(),
            shuffle_seed: None,
        }
    }
}

impl PracticeConfig {
    /// Defaults overridden by `PYQ_STORE_TIMEOUT_MS` and `PYQ_SHUFFLE_SEED`.
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = lookup("PYQ_STORE_TIMEOUT_MS").and_then(|v| v.trim().parse::<u64>().ok())
            && ms > 0
        {
            config.store_timeout = Duration::from_millis(ms);
        }
        config.shuffle_seed = lookup("PYQ_SHUFFLE_SEED").and_then(|v| v.trim().parse().ok());
        config
    }

    /// Lock wait for `SQLite` statements: three quarters of the store timeout,
    /// so a statement gives up before the store abandons the call.
    #[must_use]
    pub fn sqlite_busy_timeout(&self) -> Duration {
        self.store_timeout * 3 / 4
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_default_session_name(mut self, name: impl Into<String>) -> Self {
        self.default_session_name = name.into();
        self
    }
}
