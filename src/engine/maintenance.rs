//! Background compaction loop.
//!
//! A dedicated thread wakes every `interval`, runs compaction rounds until
//! a round reclaims nothing (or `max_rounds` is hit), then waits again.
//! Failures are logged and never reach request callers. [`Maintenance::stop`]
//! wakes the thread immediately and joins it.

use super::error::StoreError;
use parking_lot::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Something that can reclaim space from obsolete data.
pub trait Compact: Send + Sync + 'static {
    /// Run one compaction round, discarding files whose stale share is at
    /// least `discard_ratio`. Returns the number of bytes reclaimed; zero
    /// means there is nothing left worth doing right now.
    fn compact(&self, discard_ratio: f32) -> Result<u64, StoreError>;
}

/// Configuration for the maintenance loop.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Wait between compaction passes.
    pub interval: Duration,
    /// Stale-data threshold handed to [`Compact::compact`].
    pub discard_ratio: f32,
    /// Upper bound on back-to-back rounds in a single pass.
    pub max_rounds: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            discard_ratio: 0.7,
            max_rounds: 16,
        }
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Handle to a running (or stopped) maintenance thread.
pub struct Maintenance {
    worker: Mutex<Option<Worker>>,
}

impl Maintenance {
    /// Start the loop for `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<C: Compact>(target: C, config: MaintenanceConfig) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("delayq-maintenance".to_string())
            .spawn(move || {
                info!(
                    interval = ?config.interval,
                    discard_ratio = config.discard_ratio,
                    "Starting maintenance loop"
                );
                loop {
                    match stopped.recv_timeout(config.interval) {
                        Err(RecvTimeoutError::Timeout) => {},
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    compact_until_idle(&target, &config);
                }
                debug!("Maintenance loop stopped");
            })?;

        Ok(Self {
            worker: Mutex::new(Some(Worker { stop, handle })),
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stop the loop and wait for the thread to exit. Idempotent.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // The thread may already be gone; a closed channel also stops it.
        let _ = worker.stop.send(());
        if worker.handle.join().is_err() {
            warn!("Maintenance thread panicked");
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run rounds until one reclaims nothing, fails, or `max_rounds` is reached.
/// Returns the number of rounds that made progress.
pub fn compact_until_idle(target: &dyn Compact, config: &MaintenanceConfig) -> u32 {
    let mut productive = 0;
    while productive < config.max_rounds {
        match target.compact(config.discard_ratio) {
            Ok(0) => break,
            Ok(reclaimed) => {
                productive += 1;
                debug!(reclaimed, round = productive, "Compaction reclaimed space");
            },
            Err(e) => {
                warn!(error = %e, "Compaction failed");
                break;
            },
        }
    }
    productive
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reclaims from a fixed script, then nothing.
    struct Scripted {
        script: Vec<Result<u64, &'static str>>,
        calls: Arc<AtomicU32>,
    }

    impl Compact for Scripted {
        fn compact(&self, _discard_ratio: f32) -> Result<u64, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.script.get(call) {
                Some(Ok(bytes)) => Ok(*bytes),
                Some(Err(msg)) => Err(StoreError::Join((*msg).to_string())),
                None => Ok(0),
            }
        }
    }

    fn scripted(script: Vec<Result<u64, &'static str>>) -> (Scripted, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let target = Scripted {
            script,
            calls: Arc::clone(&calls),
        };
        (target, calls)
    }

    #[test]
    fn test_default_config() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert!((config.discard_ratio - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.max_rounds, 16);
    }

    #[test]
    fn test_repeats_while_progress_is_made() {
        let (target, calls) = scripted(vec![Ok(100), Ok(50), Ok(0), Ok(999)]);
        let rounds = compact_until_idle(&target, &MaintenanceConfig::default());
        assert_eq!(rounds, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failure_ends_pass() {
        let (target, calls) = scripted(vec![Ok(10), Err("io"), Ok(10)]);
        let rounds = compact_until_idle(&target, &MaintenanceConfig::default());
        assert_eq!(rounds, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_max_rounds_bounds_pass() {
        let (target, calls) = scripted(vec![Ok(1); 10]);
        let config = MaintenanceConfig {
            max_rounds: 3,
            ..MaintenanceConfig::default()
        };
        assert_eq!(compact_until_idle(&target, &config), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_loop_runs_and_stops() {
        let (target, calls) = scripted(Vec::new());
        let config = MaintenanceConfig {
            interval: Duration::from_millis(10),
            ..MaintenanceConfig::default()
        };
        let maintenance = Maintenance::spawn(target, config).unwrap();
        assert!(maintenance.is_running());

        thread::sleep(Duration::from_millis(100));
        maintenance.stop();
        assert!(!maintenance.is_running());

        let after_stop = calls.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);

        // Second stop is a no-op.
        maintenance.stop();
    }

    #[test]
    fn test_stop_does_not_wait_for_interval() {
        let (target, calls) = scripted(Vec::new());
        let config = MaintenanceConfig {
            interval: Duration::from_secs(3600),
            ..MaintenanceConfig::default()
        };
        let maintenance = Maintenance::spawn(target, config).unwrap();
        let started = std::time::Instant::now();
        maintenance.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
