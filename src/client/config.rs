use std::time::Duration;

use tracing::warn;

use crate::{
    backoff::BackoffConfig,
    client::error::{Error, Result},
};

/// Tuning knobs of the metadata cache.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataConfig {
    /// Max age of a cached topic before it is refreshed in the background.
    pub refresh_interval: Duration,

    /// Tick of the background task that retries unresolved subscriptions and
    /// failed refreshes.
    pub fast_refresh_interval: Duration,

    /// Deadline of a single topology query.
    pub request_timeout: Duration,

    /// How long a negative result for a subscribed topic is held back before
    /// it is reported to the application.
    ///
    /// Should exceed the expected duration of a full refresh.
    pub error_grace_window: Duration,

    /// Backoff between failed refreshes of the same scope.
    pub backoff: BackoffConfig,

    /// Refresh only the stale topics on max-age expiry instead of the whole
    /// cluster.
    pub sparse_refresh: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            fast_refresh_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(10),
            error_grace_window: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            sparse_refresh: true,
        }
    }
}

impl MetadataConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let durations = [
            ("refresh_interval", self.refresh_interval),
            ("fast_refresh_interval", self.fast_refresh_interval),
            ("request_timeout", self.request_timeout),
            ("error_grace_window", self.error_grace_window),
            ("backoff.init_backoff", self.backoff.init_backoff),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must not be zero")));
            }
        }

        if self.backoff.max_backoff < self.backoff.init_backoff {
            return Err(Error::InvalidConfig(
                "backoff.max_backoff must not be smaller than backoff.init_backoff".to_owned(),
            ));
        }
        if self.backoff.base.is_nan() || self.backoff.base < 1. {
            return Err(Error::InvalidConfig(format!(
                "backoff.base must be at least 1, got {}",
                self.backoff.base
            )));
        }

        if self.error_grace_window < self.request_timeout {
            warn!(
                grace_window_ms = self.error_grace_window.as_millis() as u64,
                request_timeout_ms = self.request_timeout.as_millis() as u64,
                "error grace window is shorter than a refresh may take, unknown topic errors may be reported spuriously",
            );
        }

        Ok(())
    }
}
