//! Background pin persistence.
//!
//! At most one save and one load run at a time. A request made while the
//! same kind of operation is in flight is dropped. Save failures are logged
//! and read as "nothing saved". A load hands back its `Result`, so a failed
//! load applies nothing on the caller's side.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use dl_core::PinRecord;
use tracing::{debug, error};

use crate::error::Result;
use crate::pins::{load_pins, save_pins};

/// Clears an in-flight flag when the worker finishes, even on panic.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PinStore {
    path: PathBuf,
    saving: Arc<AtomicBool>,
    loading: Arc<AtomicBool>,
    loaded_tx: mpsc::Sender<Result<Vec<PinRecord>>>,
    loaded_rx: mpsc::Receiver<Result<Vec<PinRecord>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PinStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (loaded_tx, loaded_rx) = mpsc::channel();
        Self {
            path: path.into(),
            saving: Arc::new(AtomicBool::new(false)),
            loading: Arc::new(AtomicBool::new(false)),
            loaded_tx,
            loaded_rx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    /// Write `records` on a worker thread. Returns false when a save is
    /// already running and this request was dropped.
    pub fn request_save(&self, records: Vec<PinRecord>) -> bool {
        if self.saving.swap(true, Ordering::AcqRel) {
            debug!(path = %self.path.display(), "save already in flight, request dropped");
            return false;
        }
        let guard = InFlight(Arc::clone(&self.saving));
        let path = self.path.clone();
        self.spawn(move || {
            let _guard = guard;
            if let Err(e) = save_pins(&path, &records) {
                error!(path = %path.display(), error = %e, "pin save failed, nothing saved");
            }
        });
        true
    }

    /// Read the pin file on a worker thread; collect the result with
    /// [`poll_load`](Self::poll_load). Returns false when a load is already
    /// running and this request was dropped.
    pub fn request_load(&self) -> bool {
        if self.loading.swap(true, Ordering::AcqRel) {
            debug!(path = %self.path.display(), "load already in flight, request dropped");
            return false;
        }
        let guard = InFlight(Arc::clone(&self.loading));
        let path = self.path.clone();
        let tx = self.loaded_tx.clone();
        self.spawn(move || {
            let result = load_pins(&path).inspect_err(|e| {
                error!(path = %path.display(), error = %e, "pin load failed, nothing loaded");
            });
            // Send before the flag clears so a caller that sees the load
            // finished also finds its result.
            let _ = tx.send(result);
            drop(guard);
        });
        true
    }

    /// A finished load's outcome, if one completed since the last poll.
    /// Apply the records only on `Ok`.
    pub fn poll_load(&self) -> Option<Result<Vec<PinRecord>>> {
        self.loaded_rx.try_recv().ok()
    }

    /// Block until every save and load requested so far has finished.
    pub fn wait_idle(&self) {
        let workers = std::mem::take(&mut *self.lock_workers());
        for handle in workers {
            let _ = handle.join();
        }
    }

    fn spawn(&self, work: impl FnOnce() + Send + 'static) {
        let mut workers = self.lock_workers();
        workers.retain(|h| !h.is_finished());
        workers.push(thread::spawn(work));
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PinStore {
    fn drop(&mut self) {
        self.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use dl_core::{AlignmentBlender, AlignmentMode, Pose, Vec3};

    fn record(name: &str) -> PinRecord {
        PinRecord {
            name: name.to_string(),
            virtual_pose: Pose::from_position(Vec3::new(1.0, 0.0, 2.0)),
            locked_pose: Pose::IDENTITY,
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinStore::new(dir.path().join("pins.bin"));

        assert!(store.request_save(vec![record("a"), record("b")]));
        store.wait_idle();
        assert!(!store.is_saving());
        assert!(store.path().exists());

        assert!(store.request_load());
        store.wait_idle();
        assert!(!store.is_loading());
        let loaded = store.poll_load().unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "a");
        assert!(store.poll_load().is_none());
    }

    #[test]
    fn test_missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinStore::new(dir.path().join("absent.bin"));
        assert!(store.request_load());
        store.wait_idle();
        assert!(matches!(store.poll_load(), Some(Err(StoreError::Io(_)))));
        assert!(store.poll_load().is_none());
    }

    #[test]
    fn test_failed_load_leaves_loaded_pins_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, [9u8, 0, 0, 0, 1, 0, 0, 0]).unwrap();

        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        blender.load_record(vec![record("door"), record("window")]);

        let store = PinStore::new(&path);
        assert!(store.request_load());
        store.wait_idle();
        match store.poll_load() {
            Some(Ok(records)) => blender.load_record(records),
            Some(Err(e)) => assert!(matches!(e, StoreError::UnsupportedVersion(9))),
            None => panic!("load finished without a result"),
        }
        assert_eq!(blender.saved_names().collect::<Vec<_>>(), ["door", "window"]);
    }

    #[test]
    fn test_drop_joins_pending_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pins.bin");
        {
            let store = PinStore::new(&path);
            assert!(store.request_save(vec![record("a")]));
        }
        assert!(path.exists());
    }

    #[test]
    fn test_overlapping_request_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinStore::new(dir.path().join("pins.bin"));
        store.saving.store(true, Ordering::Release);
        assert!(!store.request_save(vec![record("a")]));
        store.saving.store(false, Ordering::Release);
        assert!(!store.path().exists());

        store.loading.store(true, Ordering::Release);
        assert!(!store.request_load());
        store.loading.store(false, Ordering::Release);
        assert!(store.poll_load().is_none());
    }
}
