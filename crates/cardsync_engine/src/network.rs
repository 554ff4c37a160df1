//! The Network Adapter: connectivity reports and transfer parameters.

use crate::config::SyncConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::info;

/// Link quality as reported by the platform.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkQuality {
    /// Metered or very slow link.
    Poor,
    /// Usable but slow link.
    Fair,
    /// Typical broadband link.
    #[default]
    Good,
    /// Fast, unmetered link.
    Excellent,
}

impl NetworkQuality {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::Poor => "poor",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Good => "good",
            NetworkQuality::Excellent => "excellent",
        }
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poor" => Ok(NetworkQuality::Poor),
            "fair" => Ok(NetworkQuality::Fair),
            "good" => Ok(NetworkQuality::Good),
            "excellent" => Ok(NetworkQuality::Excellent),
            other => Err(format!("unknown network quality '{other}'")),
        }
    }
}

/// A connectivity report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// Whether the remote store is reachable.
    pub online: bool,
    /// Link quality; meaningless while offline.
    pub quality: NetworkQuality,
}

impl NetworkStatus {
    /// An online report.
    pub fn online(quality: NetworkQuality) -> Self {
        Self {
            online: true,
            quality,
        }
    }

    /// An offline report.
    pub fn offline() -> Self {
        Self {
            online: false,
            quality: NetworkQuality::Poor,
        }
    }

    /// Returns true if a session may start or keep running at this status.
    pub fn can_sync(&self, floor: NetworkQuality) -> bool {
        self.online && self.quality >= floor
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::online(NetworkQuality::default())
    }
}

/// How the transfer engine should shape traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    /// Operations per batch.
    pub batch_size: usize,
    /// Batches in flight at once.
    pub parallelism: usize,
    /// Whether to ask the transport for compression.
    pub compress: bool,
}

impl TransferParams {
    /// Parameters for `quality`, capped by the configuration.
    pub fn for_quality(quality: NetworkQuality, config: &SyncConfig) -> Self {
        let (batch_size, parallelism, compress) = match quality {
            NetworkQuality::Poor => (10, 1, true),
            NetworkQuality::Fair => (25, 2, true),
            NetworkQuality::Good => (50, 4, false),
            NetworkQuality::Excellent => (100, 8, false),
        };
        Self {
            batch_size: batch_size.min(config.max_batch_size).max(1),
            parallelism: parallelism.min(config.max_parallelism).max(1),
            compress,
        }
    }

    /// Operations admitted per scheduler round.
    pub fn round_size(&self) -> usize {
        self.batch_size.saturating_mul(self.parallelism)
    }
}

/// Source of connectivity reports that the engine polls.
pub trait NetworkProbe: Send + Sync {
    /// Returns the current status.
    fn probe(&self) -> NetworkStatus;
}

/// Tracks the latest connectivity report and fans it out to watchers.
#[derive(Debug)]
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    /// Creates a monitor with an initial status.
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Pushes a new report.
    pub fn report(&self, status: NetworkStatus) {
        let previous = self.tx.send_replace(status);
        if previous != status {
            info!(
                online = status.online,
                quality = %status.quality,
                was_online = previous.online,
                "network status changed"
            );
        }
    }

    /// Polls `probe` and records its answer.
    pub fn poll(&self, probe: &dyn NetworkProbe) -> NetworkStatus {
        let status = probe.probe();
        self.report(status);
        status
    }

    /// Returns the latest report.
    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// Subscribes to future reports.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(NetworkStatus);

    impl NetworkProbe for FixedProbe {
        fn probe(&self) -> NetworkStatus {
            self.0
        }
    }

    #[test]
    fn quality_ordering_and_floor() {
        assert!(NetworkQuality::Excellent > NetworkQuality::Good);
        assert!(NetworkQuality::Fair > NetworkQuality::Poor);

        let status = NetworkStatus::online(NetworkQuality::Fair);
        assert!(status.can_sync(NetworkQuality::Poor));
        assert!(status.can_sync(NetworkQuality::Fair));
        assert!(!status.can_sync(NetworkQuality::Good));
        assert!(!NetworkStatus::offline().can_sync(NetworkQuality::Poor));
    }

    #[test]
    fn params_scale_with_quality() {
        let config = SyncConfig::default();
        let poor = TransferParams::for_quality(NetworkQuality::Poor, &config);
        let excellent = TransferParams::for_quality(NetworkQuality::Excellent, &config);

        assert!(poor.compress);
        assert!(!excellent.compress);
        assert!(poor.batch_size < excellent.batch_size);
        assert!(poor.parallelism < excellent.parallelism);
        assert_eq!(excellent.round_size(), 800);
    }

    #[test]
    fn params_are_capped_by_config() {
        let config = SyncConfig::default()
            .with_max_batch_size(5)
            .with_max_parallelism(2);
        let params = TransferParams::for_quality(NetworkQuality::Excellent, &config);
        assert_eq!(params.batch_size, 5);
        assert_eq!(params.parallelism, 2);
    }

    #[test]
    fn quality_parses() {
        assert_eq!("fair".parse::<NetworkQuality>(), Ok(NetworkQuality::Fair));
        assert!("great".parse::<NetworkQuality>().is_err());
    }

    #[tokio::test]
    async fn watchers_see_reports() {
        let monitor = NetworkMonitor::new(NetworkStatus::offline());
        let mut rx = monitor.subscribe();

        monitor.report(NetworkStatus::online(NetworkQuality::Good));
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().online);

        let status = monitor.poll(&FixedProbe(NetworkStatus::online(NetworkQuality::Poor)));
        assert_eq!(status.quality, NetworkQuality::Poor);
        assert_eq!(monitor.current(), status);
    }
}
