//! The write-path coordinator.
//!
//! A `Db` owns the active memtable, the at-most-one immutable memtable
//! sealed from it, and the current [`Version`]. A single mutex guards the
//! four coordination fields; a condition variable lets the writer wait for
//! background compaction to retire the immutable memtable.
//!
//! # Write path
//!
//! caller -> coordinator -> memtable insert. When the active memtable
//! fills, it is sealed as immutable, a fresh one takes its place, and a
//! background task flushes the sealed table to level 0 and then runs major
//! compactions to quiescence, publishing the resulting Version through the
//! manifest and CURRENT.
//!
//! A single writer is assumed; readers are unrestricted and snapshot the
//! `(mem, imm, version)` triple under the mutex, then probe without it.

use std::fs;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::files;
use crate::key::KeyType;
use crate::memtable::Memtable;
use crate::version::Version;

pub struct Db {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    mu: Mutex<Inner>,
    cond: Condvar,
}

struct Inner {
    mem: Arc<Memtable>,
    imm: Option<Arc<Memtable>>,
    current: Arc<Version>,
    bg_compaction_scheduled: bool,
}

impl Db {
    /// Open a database with default configuration.
    pub fn open(dir: &str) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    pub fn open_with_config(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let current = match files::read_current_file(&config.dir) {
            Some(number) => Version::load(&config, number)?,
            None => Version::new(&config)?,
        };

        let inner = Inner {
            mem: Arc::new(Memtable::new(config.memtable_size)),
            imm: None,
            current: Arc::new(current),
            bg_compaction_scheduled: false,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                mu: Mutex::new(inner),
                cond: Condvar::new(),
            }),
        })
    }

    pub fn put(&self, user_key: &[u8], user_value: &[u8]) -> Result<()> {
        let (seq, mem) = self.make_room_for_write()?;
        mem.add(seq, KeyType::Value, user_key, user_value);
        Ok(())
    }

    /// Record a tombstone for the key at a fresh sequence number. Deleting
    /// an absent key is not an error.
    pub fn delete(&self, user_key: &[u8]) -> Result<()> {
        let (seq, mem) = self.make_room_for_write()?;
        mem.add(seq, KeyType::Deletion, user_key, &[]);
        Ok(())
    }

    /// Read the freshest value for `user_key` visible at sequence number
    /// `seq`. Tombstones mask older values.
    pub fn get(&self, user_key: &[u8], seq: u64) -> Result<Option<Vec<u8>>> {
        // A snapshot can go stale mid-probe when compaction unlinks a file
        // it references; a fresh snapshot sees the merged replacement, so
        // IO failures are retried with a new one.
        let mut attempts = 0;
        loop {
            match self.get_snapshot(user_key, seq) {
                Err(Error::Io(_)) if attempts < 3 => attempts += 1,
                result => return result,
            }
        }
    }

    fn get_snapshot(&self, user_key: &[u8], seq: u64) -> Result<Option<Vec<u8>>> {
        let (mem, imm, current) = {
            let inner = self.shared.mu.lock()?;
            (
                Arc::clone(&inner.mem),
                inner.imm.clone(),
                Arc::clone(&inner.current),
            )
        };

        if let Some(result) = mem.get(user_key, seq) {
            return Ok(result);
        }
        if let Some(imm) = imm {
            if let Some(result) = imm.get(user_key, seq) {
                return Ok(result);
            }
        }
        match current.get(user_key, seq)? {
            Some(result) => Ok(result),
            None => Ok(None),
        }
    }

    /// Latest committed sequence number; `get` at this point sees every
    /// acknowledged write.
    pub fn latest_seq(&self) -> u64 {
        let inner = self.shared.mu.lock().unwrap();
        inner.current.seq()
    }

    /// Wait for any scheduled background compaction to quiesce.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.shared.mu.lock()?;
        while inner.bg_compaction_scheduled {
            inner = self.shared.cond.wait(inner)?;
        }
        Ok(())
    }

    /// Block until room exists in the active memtable and reserve a fresh
    /// sequence number. May seal the active memtable and schedule
    /// background compaction on the way.
    fn make_room_for_write(&self) -> Result<(u64, Arc<Memtable>)> {
        let shared = &self.shared;
        let mut inner = shared.mu.lock()?;
        loop {
            if inner.current.num_level_files(0) >= shared.config.l0_slowdown_writes_trigger {
                // Write slowdown: give compaction a chance to drain level
                // 0. Readers make progress while the lock is released.
                Self::maybe_schedule_compaction(shared, &mut inner);
                drop(inner);
                thread::sleep(Duration::from_millis(1));
                inner = shared.mu.lock()?;
            } else if !inner.mem.full() {
                return Ok((inner.current.next_seq(), Arc::clone(&inner.mem)));
            } else if inner.imm.is_some() {
                // The previous memtable is still being flushed. Reschedule
                // first in case the last background task failed.
                Self::maybe_schedule_compaction(shared, &mut inner);
                inner = shared.cond.wait(inner)?;
            } else {
                inner.imm = Some(Arc::clone(&inner.mem));
                inner.mem = Arc::new(Memtable::new(shared.config.memtable_size));
                Self::maybe_schedule_compaction(shared, &mut inner);
            }
        }
    }

    fn maybe_schedule_compaction(shared: &Arc<Shared>, inner: &mut MutexGuard<'_, Inner>) {
        if inner.bg_compaction_scheduled {
            return;
        }
        if inner.imm.is_none() && inner.current.num_level_files(0) < shared.config.l0_slowdown_writes_trigger {
            return;
        }
        inner.bg_compaction_scheduled = true;
        let shared = Arc::clone(shared);
        thread::spawn(move || background_call(shared));
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn background_call(shared: Arc<Shared>) {
    let (imm, mut version) = {
        let inner = shared.mu.lock().unwrap();
        (inner.imm.clone(), inner.current.copy())
    };

    let result = run_compaction(&shared, imm.as_deref(), &mut version);

    let mut inner = shared.mu.lock().unwrap();
    match result {
        Ok(()) => {
            inner.current = Arc::new(version);
            inner.imm = None;
            remove_obsolete_files(&shared.config, &inner.current);
        }
        Err(err) => {
            // The old version stays current and the immutable memtable
            // stays pending; the next write retriggers compaction.
            tracing::error!(error = %err, "background compaction failed");
        }
    }
    inner.bg_compaction_scheduled = false;
    shared.cond.notify_all();
}

fn run_compaction(shared: &Shared, imm: Option<&Memtable>, version: &mut Version) -> Result<()> {
    if let Some(imm) = imm {
        version.write_level0_table(imm)?;
    }
    while version.compact()? {
        tracing::debug!(levels = %version.levels_summary(), "compaction round finished");
    }

    // Publish: manifest first, CURRENT swap second. CURRENT never names a
    // partially written manifest.
    let number = version.save()?;
    files::set_current_file(&shared.config.dir, number)?;
    Ok(())
}

/// Unlink SSTable files no longer referenced by the installed version.
/// Called with the coordinator lock held, after publication.
fn remove_obsolete_files(config: &Config, current: &Version) {
    let live = current.live_files();
    let entries = match fs::read_dir(&config.dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(error = %err, "failed to list db dir for cleanup");
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(number) = files::parse_sstable_file_name(&name.to_string_lossy()) else {
            continue;
        };
        if live.contains(&number) {
            continue;
        }
        if let Err(err) = fs::remove_file(entry.path()) {
            tracing::warn!(file = number, error = %err, "failed to delete obsolete sstable");
        } else {
            tracing::debug!(file = number, "deleted obsolete sstable");
        }
    }
}
