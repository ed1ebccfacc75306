//! Debounced script-file watcher.
//!
//! A polling thread samples the script's metadata; any observed change
//! (modification, size change, rename, create) schedules a re-run after
//! the debounce window. Events arriving while a run is in progress
//! coalesce into at most one pending run. A manual trigger bypasses the
//! debounce entirely.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Delay between the last observed change and the scheduled run.
pub const DEBOUNCE: Duration = Duration::from_millis(400);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Modification signature of the watched file.
type FileSig = Option<(SystemTime, u64)>;

fn sample(path: &PathBuf) -> FileSig {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    Some((modified, metadata.len()))
}

/// Watches one script file and re-triggers the engine on change.
pub struct ScriptWatcher {
    stop: Arc<AtomicBool>,
    manual: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ScriptWatcher {
    /// Watch `path` with the standard debounce window.
    pub fn spawn<F>(path: PathBuf, on_change: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn_with(path, DEBOUNCE, on_change)
    }

    /// Watch `path` with a custom debounce window.
    pub fn spawn_with<F>(path: PathBuf, debounce: Duration, mut on_change: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let manual = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let manual_flag = manual.clone();

        let handle = thread::Builder::new()
            .name("script-watcher".into())
            .spawn(move || {
                let mut last_sig = sample(&path);
                let mut deadline: Option<Instant> = None;

                while !stop_flag.load(Ordering::SeqCst) {
                    let sig = sample(&path);
                    if sig != last_sig {
                        // Only a now-existing file can run; a deletion
                        // alone cancels nothing but schedules nothing.
                        if sig.is_some() {
                            debug!(path = %path.display(), "change observed");
                            deadline = Some(Instant::now() + debounce);
                        }
                        last_sig = sig;
                    }
                    if manual_flag.swap(false, Ordering::SeqCst) {
                        deadline = Some(Instant::now());
                    }

                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        deadline = None;
                        on_change();
                        // Changes made while the run was executing are
                        // picked up by the next sample; at most one run
                        // is ever pending.
                        last_sig = sample(&path);
                    }

                    thread::sleep(POLL_INTERVAL);
                }
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(error = %e, "watcher thread failed to start");
                None
            }
        };

        Self {
            stop,
            manual,
            handle,
        }
    }

    /// Schedule an immediate run, bypassing the debounce.
    pub fn trigger(&self) {
        self.manual.store(true, Ordering::SeqCst);
    }

    /// Stop the watcher and join its thread.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ScriptWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
