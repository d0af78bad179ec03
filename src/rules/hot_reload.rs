use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::domain::RuleConfig;

use super::source::{RuleError, SourceMarker};
use super::store::RuleStore;

/// Error type a reload callback may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked with each newly published configuration.
pub type ReloadCallback = Box<dyn Fn(&RuleConfig) -> Result<(), CallbackError> + Send + Sync>;

/// Handle to the background poller of a [`RuleStore`].
///
/// Dropping the handle stops the poller.
pub(crate) struct HotReloadHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HotReloadHandle {
    /// Spawn the poller thread.
    pub(crate) fn spawn(
        store: Weak<RuleStore>,
        interval: Duration,
        callback: Option<ReloadCallback>,
    ) -> Result<Self, RuleError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let mut poller = Poller {
            store,
            last_failed: None,
            callback,
        };

        let thread = thread::Builder::new()
            .name("rule-hot-reload".to_string())
            .spawn(move || {
                debug!("Rule poller started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Explicit stop or the handle went away
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if !poller.poll_once() {
                        break;
                    }
                }
                debug!("Rule poller stopped");
            })
            .map_err(|e| RuleError::HotReload(format!("failed to spawn poller: {e}")))?;

        Ok(HotReloadHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Signal the poller and wait for it to exit.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            // The last store reference can be released by the poller itself
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Rule poller thread panicked");
            }
        }
    }
}

impl Drop for HotReloadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Poller {
    store: Weak<RuleStore>,
    /// Marker of the last failed reload
    last_failed: Option<SourceMarker>,
    callback: Option<ReloadCallback>,
}

impl Poller {
    /// One poll cycle. Returns false once the store is gone.
    fn poll_once(&mut self) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        self.check(&store);
        true
    }

    fn check(&mut self, store: &Arc<RuleStore>) {
        let marker = match store.source_marker() {
            Ok(marker) => marker,
            Err(e) => {
                warn!(
                    source = %store.describe_source(),
                    error = %e,
                    "Failed to read rule source marker"
                );
                return;
            }
        };

        // Reloads run by callers advance the store's marker too
        if store.last_marker().as_ref() == Some(&marker)
            || self.last_failed.as_ref() == Some(&marker)
        {
            return;
        }

        let config = match store.reload() {
            Ok(config) => {
                self.last_failed = None;
                config
            }
            Err(_) => {
                // Not retried until the source changes again
                self.last_failed = Some(marker);
                return;
            }
        };

        info!(
            version = %config.version,
            generation = config.generation,
            "Rules hot reloaded"
        );

        if let Some(callback) = &self.callback {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&config))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Rule reload callback failed"),
                Err(_) => error!("Rule reload callback panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::source::MemoryRuleSource;
    use crate::rules::store::tests::document;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn test_poller_picks_up_changes() {
        let source = Arc::new(MemoryRuleSource::new(document("v1", &[("R1", "1", 1.0)])));
        let store = Arc::new(RuleStore::open(source.clone()).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store
            .enable_hot_reload(
                Duration::from_millis(10),
                Some(Box::new(move |config: &RuleConfig| {
                    assert_eq!(config.version, "v2");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
            )
            .unwrap();

        source.replace(document("v2", &[("R1", "1", 1.0), ("R2", "1", 2.0)]));

        assert!(wait_for(Duration::from_secs(2), || store.current().version == "v2"));
        assert!(wait_for(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));
        assert_eq!(store.current().rules.len(), 2);

        store.disable_hot_reload();
    }

    #[test]
    fn test_failed_marker_not_retried() {
        let source = Arc::new(MemoryRuleSource::new(document("v1", &[])));
        let store = Arc::new(RuleStore::open(source.clone()).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store
            .enable_hot_reload(
                Duration::from_millis(10),
                Some(Box::new(move |_: &RuleConfig| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
            )
            .unwrap();

        let mut bad = document("bad", &[]);
        bad.thresholds = Some(crate::domain::rule::ThresholdsDocument {
            approve_threshold: Some(90.0),
            review_threshold: Some(10.0),
        });
        source.replace(bad);

        assert!(wait_for(Duration::from_secs(2), || store.last_error().is_some()));
        assert_eq!(store.current().version, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        source.replace(document("v3", &[]));
        assert!(wait_for(Duration::from_secs(2), || store.current().version == "v3"));
        assert!(store.last_error().is_none());

        store.disable_hot_reload();
    }

    #[test]
    fn test_callback_failure_and_panic_are_contained() {
        let source = Arc::new(MemoryRuleSource::new(document("v1", &[])));
        let store = Arc::new(RuleStore::open(source.clone()).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store
            .enable_hot_reload(
                Duration::from_millis(10),
                Some(Box::new(move |config: &RuleConfig| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if config.version == "v2" {
                        return Err("downstream rejected".into());
                    }
                    panic!("callback blew up");
                })),
            )
            .unwrap();

        source.replace(document("v2", &[]));
        assert!(wait_for(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));

        source.replace(document("v3", &[]));
        assert!(wait_for(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 2));

        // Poller survives both and keeps publishing
        source.replace(document("v4", &[]));
        assert!(wait_for(Duration::from_secs(2), || store.current().version == "v4"));

        store.disable_hot_reload();
    }

    #[test]
    fn test_manual_reload_not_repeated_by_poller() {
        let source = Arc::new(MemoryRuleSource::new(document("v1", &[])));
        let store = Arc::new(RuleStore::open(source.clone()).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store
            .enable_hot_reload(
                Duration::from_millis(100),
                Some(Box::new(move |_: &RuleConfig| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
            )
            .unwrap();

        // Reloaded by hand well before the first poll
        source.replace(document("v2", &[]));
        let generation = store.reload().unwrap().generation;

        thread::sleep(Duration::from_millis(350));

        assert_eq!(store.current().version, "v2");
        assert_eq!(store.current().generation, generation);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        store.disable_hot_reload();
    }

    #[test]
    fn test_dropping_store_stops_poller() {
        let source = Arc::new(MemoryRuleSource::new(document("v1", &[])));
        let store = Arc::new(RuleStore::open(source.clone()).unwrap());
        store
            .enable_hot_reload(Duration::from_millis(5), None)
            .unwrap();

        let weak = Arc::downgrade(&store);
        drop(store);

        assert!(weak.upgrade().is_none());
    }
}
