//! Failure-injecting storage wrapper.
//!
//! `FaultyStorage` forwards to an inner storage and can fail chosen
//! operations, either the n-th call of a kind or randomly with a seeded
//! probability. It also remembers which files were written but never synced
//! so that [`FaultyStorage::crash`] can drop them, which is what a power loss
//! does to an index.

use std::io::{self, Write};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, TesseraError};
use crate::storage::{Storage, StorageInput, StorageLock, StorageOutput};

/// The kinds of operations that can be failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `Storage::create_output`.
    CreateOutput,
    /// A `write` call on an output.
    Write,
    /// `Storage::sync` or `StorageOutput::flush_and_sync`.
    Sync,
    /// `Storage::rename_file`.
    Rename,
    /// `Storage::delete_file`.
    Delete,
}

#[derive(Debug)]
struct FaultState {
    rng: StdRng,
    random_rate: f64,
    random_points: AHashSet<FaultPoint>,
    countdowns: AHashMap<FaultPoint, usize>,
    unsynced: AHashSet<String>,
    injected: usize,
}

impl FaultState {
    fn should_fail(&mut self, point: FaultPoint) -> bool {
        if let Some(remaining) = self.countdowns.get_mut(&point) {
            if *remaining <= 1 {
                self.countdowns.remove(&point);
                self.injected += 1;
                return true;
            }
            *remaining -= 1;
        }
        if self.random_rate > 0.0
            && self.random_points.contains(&point)
            && self.rng.random::<f64>() < self.random_rate
        {
            self.injected += 1;
            return true;
        }
        false
    }
}

/// Storage wrapper that injects I/O failures.
#[derive(Debug, Clone)]
pub struct FaultyStorage {
    inner: Arc<dyn Storage>,
    state: Arc<Mutex<FaultState>>,
}

impl FaultyStorage {
    /// Wrap `inner`, seeding the random failure generator with `seed`.
    pub fn new(inner: Arc<dyn Storage>, seed: u64) -> Self {
        FaultyStorage {
            inner,
            state: Arc::new(Mutex::new(FaultState {
                rng: StdRng::seed_from_u64(seed),
                random_rate: 0.0,
                random_points: AHashSet::new(),
                countdowns: AHashMap::new(),
                unsynced: AHashSet::new(),
                injected: 0,
            })),
        }
    }

    /// The wrapped storage.
    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    /// Fail each operation of the given kinds with probability `rate`.
    pub fn set_random_failure_rate(&self, rate: f64, points: &[FaultPoint]) {
        let mut state = self.state.lock();
        state.random_rate = rate;
        state.random_points = points.iter().copied().collect();
    }

    /// Fail the `n`-th next operation of kind `point` (1-based), once.
    /// Zero fails the very next one.
    pub fn fail_after(&self, point: FaultPoint, n: usize) {
        self.state.lock().countdowns.insert(point, n);
    }

    /// Stop injecting failures.
    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.random_rate = 0.0;
        state.random_points.clear();
        state.countdowns.clear();
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> usize {
        self.state.lock().injected
    }

    /// Files written since their last sync.
    pub fn unsynced_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.state.lock().unsynced.iter().cloned().collect();
        files.sort();
        files
    }

    /// Simulate a power loss: every file that was never synced is lost.
    pub fn crash(&self) -> Result<()> {
        let lost: Vec<String> = self.state.lock().unsynced.drain().collect();
        for name in lost {
            if self.inner.file_exists(&name) {
                self.inner.delete_file(&name)?;
            }
        }
        Ok(())
    }

    fn check(&self, point: FaultPoint, name: &str) -> Result<()> {
        if self.state.lock().should_fail(point) {
            return Err(TesseraError::Io(io::Error::other(format!(
                "injected {point:?} failure on {name}"
            ))));
        }
        Ok(())
    }
}

impl Storage for FaultyStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.inner.open_input(name)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check(FaultPoint::CreateOutput, name)?;
        let output = self.inner.create_output(name)?;
        self.state.lock().unsynced.insert(name.to_string());
        Ok(Box::new(FaultyOutput {
            name: name.to_string(),
            inner: output,
            state: self.state.clone(),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check(FaultPoint::Delete, name)?;
        self.inner.delete_file(name)?;
        self.state.lock().unsynced.remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check(FaultPoint::Rename, old_name)?;
        self.inner.rename_file(old_name, new_name)?;
        let mut state = self.state.lock();
        if state.unsynced.remove(old_name) {
            state.unsynced.insert(new_name.to_string());
        } else {
            state.unsynced.remove(new_name);
        }
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.check(FaultPoint::Sync, name)?;
        }
        self.inner.sync(names)?;
        let mut state = self.state.lock();
        for name in names {
            state.unsynced.remove(name);
        }
        Ok(())
    }

    fn sync_meta_data(&self) -> Result<()> {
        self.inner.sync_meta_data()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.inner.obtain_lock(name)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

#[derive(Debug)]
struct FaultyOutput {
    name: String,
    inner: Box<dyn StorageOutput>,
    state: Arc<Mutex<FaultState>>,
}

impl Write for FaultyOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state.lock().should_fail(FaultPoint::Write) {
            return Err(io::Error::other(format!(
                "injected Write failure on {}",
                self.name
            )));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl StorageOutput for FaultyOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        if self.state.lock().should_fail(FaultPoint::Sync) {
            return Err(TesseraError::Io(io::Error::other(format!(
                "injected Sync failure on {}",
                self.name
            ))));
        }
        self.inner.flush_and_sync()?;
        self.state.lock().unsynced.remove(&self.name);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
