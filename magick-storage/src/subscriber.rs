//! Invalidation listener.
//!
//! One long-lived task owns the pub/sub subscription. For each flag
//! name received it debounces repeats inside a 100 ms window, drops the
//! flag from the Local store, and asks the engine to reload the flag's
//! in-memory projection. Errors are logged and the task re-establishes
//! its subscription after 5 s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::local::LocalStore;
use crate::traits::RemoteBackend;

/// Repeated invalidations for one flag inside this window are dropped.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Callback into the engine: reload a registered flag's projection from
/// Remote → Durable. Unknown names are ignored.
#[async_trait]
pub trait FlagReloader: Send + Sync {
    async fn reload_flag(&self, name: &str);
}

/// Handle to the background invalidation task.
pub struct InvalidationListener {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl InvalidationListener {
    /// Spawn the listener task.
    pub fn spawn(
        remote: Arc<dyn RemoteBackend>,
        local: Arc<LocalStore>,
        reloader: Arc<dyn FlagReloader>,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(remote, local, reloader, stop_rx));
        Self { stop, handle }
    }

    /// Graceful shutdown: signal the task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

async fn run(
    remote: Arc<dyn RemoteBackend>,
    local: Arc<LocalStore>,
    reloader: Arc<dyn FlagReloader>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut debounce: HashMap<String, Instant> = HashMap::new();

    loop {
        let mut subscription = match remote.subscribe_invalidations().await {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(error = %err, "invalidation subscribe failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(RESTART_DELAY) => continue,
                    _ = stop_rx.changed() => return,
                }
            }
        };
        info!("invalidation listener running");

        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Some(name) => {
                        if is_debounced(&mut debounce, &name) {
                            debug!(flag = %name, "invalidation debounced");
                            continue;
                        }
                        local.delete(&name);
                        reloader.reload_flag(&name).await;
                        debug!(flag = %name, "flag invalidated");
                    }
                    None => {
                        warn!("invalidation subscription ended, restarting");
                        break;
                    }
                },
                _ = stop_rx.changed() => {
                    info!("invalidation listener stopped");
                    return;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RESTART_DELAY) => {}
            _ = stop_rx.changed() => return,
        }
    }
}

fn is_debounced(table: &mut HashMap<String, Instant>, name: &str) -> bool {
    let now = Instant::now();
    if table.len() > 1024 {
        table.retain(|_, seen| now.duration_since(*seen) < DEBOUNCE_WINDOW);
    }
    match table.get(name) {
        Some(seen) if now.duration_since(*seen) < DEBOUNCE_WINDOW => true,
        _ => {
            table.insert(name.to_string(), now);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use crate::traits::RemoteBackend as _;
    use parking_lot::Mutex;

    struct RecordingReloader {
        reloads: Mutex<Vec<String>>,
    }

    impl RecordingReloader {
        fn new() -> Self {
            Self {
                reloads: Mutex::new(Vec::new()),
            }
        }

        fn reloads(&self) -> Vec<String> {
            self.reloads.lock().clone()
        }
    }

    #[async_trait]
    impl FlagReloader for RecordingReloader {
        async fn reload_flag(&self, name: &str) {
            self.reloads.lock().push(name.to_string());
        }
    }

    #[tokio::test]
    async fn test_invalidation_evicts_local_and_reloads() {
        let remote = Arc::new(MemoryRemote::new());
        let local = Arc::new(LocalStore::new());
        let reloader = Arc::new(RecordingReloader::new());

        local.set("f", "value", "stale");

        let listener =
            InvalidationListener::spawn(remote.clone(), local.clone(), reloader.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        remote.publish_invalidation("f").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!local.exists("f"));
        assert_eq!(reloader.reloads(), ["f"]);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_debounce_drops_rapid_repeats() {
        let remote = Arc::new(MemoryRemote::new());
        let local = Arc::new(LocalStore::new());
        let reloader = Arc::new(RecordingReloader::new());

        let listener =
            InvalidationListener::spawn(remote.clone(), local.clone(), reloader.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..5 {
            remote.publish_invalidation("f").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(reloader.reloads(), ["f"]);

        // Outside the window the next message goes through.
        tokio::time::sleep(DEBOUNCE_WINDOW).await;
        remote.publish_invalidation("f").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(reloader.reloads(), ["f", "f"]);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_distinct_flags_are_not_debounced_together() {
        let remote = Arc::new(MemoryRemote::new());
        let local = Arc::new(LocalStore::new());
        let reloader = Arc::new(RecordingReloader::new());

        let listener =
            InvalidationListener::spawn(remote.clone(), local.clone(), reloader.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        remote.publish_invalidation("a").await.unwrap();
        remote.publish_invalidation("b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(reloader.reloads(), ["a", "b"]);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_terminates_task() {
        let remote = Arc::new(MemoryRemote::new());
        let local = Arc::new(LocalStore::new());
        let reloader = Arc::new(RecordingReloader::new());

        let listener = InvalidationListener::spawn(remote, local, reloader);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Completes promptly rather than hanging on the subscription.
        tokio::time::timeout(Duration::from_secs(1), listener.stop())
            .await
            .unwrap();
    }
}
