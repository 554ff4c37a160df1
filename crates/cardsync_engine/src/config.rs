//! Configuration for the sync engine.

use crate::network::NetworkQuality;
use cardsync_protocol::ConflictPolicy;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device ID, sent with every batch.
    pub device_id: String,
    /// Transmissions an operation gets before it is dead-lettered,
    /// counted across every round and every in-round retry.
    pub max_retries: u32,
    /// Retry configuration for individual network calls.
    pub retry: RetryConfig,
    /// Deadline of each network call.
    pub request_timeout: Duration,
    /// Gap since the last sync after which a full sync is forced.
    pub staleness_threshold: Duration,
    /// Open manual conflicts tolerated before a session fails.
    pub manual_conflict_threshold: usize,
    /// Lowest network quality a session keeps running at.
    pub quality_floor: NetworkQuality,
    /// Policy applied to detected conflicts.
    pub conflict_policy: ConflictPolicy,
    /// Number of session durations kept for the rolling average.
    pub metrics_window: usize,
    /// Capacity of the lossy progress channel.
    pub progress_buffer: usize,
    /// Upper bound on the network-derived batch size.
    pub max_batch_size: usize,
    /// Upper bound on the network-derived worker count.
    pub max_parallelism: usize,
    /// Failed automatic resolutions before a conflict waits for the user.
    pub resolution_max_attempts: u32,
    /// Ask the backup hook for a backup before each session.
    pub backup_before_sync: bool,
    /// Sync interval for automatic sync.
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            max_retries: 3,
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(60 * 60),
            manual_conflict_threshold: 10,
            quality_floor: NetworkQuality::Poor,
            conflict_policy: ConflictPolicy::NewestWins,
            metrics_window: 100,
            progress_buffer: 64,
            max_batch_size: 100,
            max_parallelism: 8,
            resolution_max_attempts: 5,
            backup_before_sync: false,
            sync_interval: None,
        }
    }

    /// Sets the transmission budget before dead-lettering.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the staleness threshold.
    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    /// Sets the manual conflict threshold.
    pub fn with_manual_conflict_threshold(mut self, threshold: usize) -> Self {
        self.manual_conflict_threshold = threshold;
        self
    }

    /// Sets the network quality floor.
    pub fn with_quality_floor(mut self, floor: NetworkQuality) -> Self {
        self.quality_floor = floor;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the metrics window.
    pub fn with_metrics_window(mut self, window: usize) -> Self {
        self.metrics_window = window.max(1);
        self
    }

    /// Sets the progress buffer capacity.
    pub fn with_progress_buffer(mut self, capacity: usize) -> Self {
        self.progress_buffer = capacity.max(1);
        self
    }

    /// Sets the batch size cap.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Sets the worker count cap.
    pub fn with_max_parallelism(mut self, parallelism: usize) -> Self {
        self.max_parallelism = parallelism.max(1);
        self
    }

    /// Sets the automatic resolution attempt limit.
    pub fn with_resolution_max_attempts(mut self, attempts: u32) -> Self {
        self.resolution_max_attempts = attempts;
        self
    }

    /// Enables or disables backup-before-sync.
    pub fn with_backup_before_sync(mut self, enabled: bool) -> Self {
        self.backup_before_sync = enabled;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Transmissions of one batch within a delivery round, further capped
    /// by the smallest remaining budget among the batch's operations.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Creates a configuration that retries `max_attempts` times without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::no_retry()
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before transmission number `attempt`, counted from zero.
    ///
    /// The first transmission goes out at once. Later ones back off
    /// geometrically from `initial_delay`, never beyond `max_delay`; jitter
    /// only shortens the wait, by at most a quarter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(step) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let exponent = i32::try_from(step).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if self.add_jitter {
            capped.mul_f64(1.0 - 0.25 * jitter_fraction())
        } else {
            capped
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A value in `[0, 1)` that spreads concurrent retries apart.
fn jitter_fraction() -> f64 {
    let seed = Uuid::new_v4().as_u128();
    (seed % 1024) as f64 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::new("laptop");
        assert_eq!(config.device_id, "laptop");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.staleness_threshold, Duration::from_secs(3600));
        assert_eq!(config.conflict_policy, ConflictPolicy::NewestWins);
        assert_eq!(config.quality_floor, NetworkQuality::Poor);
        assert!(!config.backup_before_sync);
        assert!(config.sync_interval.is_none());
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("phone")
            .with_max_retries(5)
            .with_conflict_policy(ConflictPolicy::Merge)
            .with_max_batch_size(0)
            .with_quality_floor(NetworkQuality::Fair)
            .with_sync_interval(Duration::from_secs(300));

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.conflict_policy, ConflictPolicy::Merge);
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.quality_floor, NetworkQuality::Fair);
        assert_eq!(config.sync_interval, Some(Duration::from_secs(300)));
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn retry_config_immediate() {
        let config = RetryConfig::immediate(4);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_only_shortens_the_delay() {
        let config = RetryConfig::new(5).with_initial_delay(Duration::from_millis(100));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(75));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn retry_delay_never_exceeds_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        for attempt in [2, 5, 64, 1_000, u32::MAX] {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_secs(5));
        }
        let steady = config.with_jitter(false);
        assert_eq!(steady.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }
}
