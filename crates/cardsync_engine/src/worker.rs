//! Background sync driver.
//!
//! Triggers a session when the network comes back online and, if
//! configured, on a fixed interval. Sessions run inline on the worker task,
//! so the worker itself never starts two at once.

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::network::{NetworkProbe, NetworkStatus};
use crate::store::{LocalStore, RemoteStore};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handle to a running background worker.
#[derive(Debug)]
pub struct BackgroundSync {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundSync {
    /// Stops the worker and waits for it to exit.
    ///
    /// A session already running finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "background sync task ended abnormally");
        }
    }

    /// Returns true once the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<L: LocalStore + 'static, R: RemoteStore> SyncEngine<L, R> {
    /// Spawns a worker driven by network reports and `sync_interval`.
    pub fn spawn_background(&self) -> BackgroundSync {
        self.spawn_worker(None)
    }

    /// Like [`spawn_background`](Self::spawn_background), also polling
    /// `probe` every `every`.
    pub fn spawn_background_with_probe(
        &self,
        probe: Box<dyn NetworkProbe>,
        every: Duration,
    ) -> BackgroundSync {
        self.spawn_worker(Some((probe, every)))
    }

    fn spawn_worker(&self, probe: Option<(Box<dyn NetworkProbe>, Duration)>) -> BackgroundSync {
        let (shutdown, rx) = watch::channel(false);
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.worker_loop(rx, probe).await });
        BackgroundSync { shutdown, handle }
    }

    async fn worker_loop(
        self,
        mut shutdown: watch::Receiver<bool>,
        probe: Option<(Box<dyn NetworkProbe>, Duration)>,
    ) {
        let mut network = self.network().subscribe();
        let mut last = *network.borrow_and_update();
        let mut interval = self.config().sync_interval.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut poll = probe.as_ref().map(|(_, every)| {
            let mut poll = tokio::time::interval(*every);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            poll
        });
        info!(
            interval = ?self.config().sync_interval,
            probing = probe.is_some(),
            "background sync started"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *network.borrow_and_update();
                    let reconnected = !last.online && status.online;
                    last = status;
                    if reconnected {
                        info!(quality = %status.quality, "network back online");
                        self.background_sync("reconnect", status).await;
                    }
                }
                _ = tick(&mut interval) => {
                    let status = self.network().current();
                    self.background_sync("interval", status).await;
                }
                _ = tick(&mut poll) => {
                    if let Some((probe, _)) = &probe {
                        self.network().poll(probe.as_ref());
                    }
                }
            }
        }
        info!("background sync stopped");
    }

    async fn background_sync(&self, trigger: &'static str, status: NetworkStatus) {
        if !status.can_sync(self.config().quality_floor) {
            debug!(trigger, "skipping background sync: network below floor");
            return;
        }
        match self.sync().await {
            Ok(session) => debug!(
                trigger,
                session_id = %session.id,
                state = %session.state,
                "background sync finished"
            ),
            Err(SyncError::AlreadyInProgress { session_id }) => {
                debug!(trigger, %session_id, "sync already running");
            }
            Err(err) => warn!(trigger, error = %err, "background sync failed"),
        }
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
