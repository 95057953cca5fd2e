//! Cross-process coordination.
//!
//! Every open environment holds a shared lock on the lock file and owns one
//! slot of the reader table mapped from it. The slot publishes the oldest
//! snapshot pinned by that environment's readers, so a writer in another
//! process never recycles pages those readers can still reach. The first
//! environment to open the file clears the table, which drops slots left
//! behind by processes that died.
//!
//! Writers exclude each other with an exclusive lock on the data file, held
//! for the life of the write transaction.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};
use crate::types::TxnId;

/// "lumolock"
const LOCK_MAGIC: u64 = 0x6c75_6d6f_6c6f_636b;
/// Bytes of the reader table
const TABLE_SIZE: usize = 4096;
/// One header pair, then (owner, txnid) pairs
const TABLE_WORDS: usize = TABLE_SIZE / 8;
const TABLE_SLOTS: usize = TABLE_WORDS / 2 - 1;
/// Slot txnid of an environment with no live reader
const NO_READER: u64 = u64::MAX;
const OWNED: u64 = 1 << 63;
/// Pause between attempts on a contended writer lock with a deadline
const WRITER_POLL: Duration = Duration::from_millis(1);

/// Reader table shared through the lock file
struct ReaderSlots {
    map: MmapMut,
    slot: usize,
}

impl ReaderSlots {
    fn words(map: &MmapMut) -> &[AtomicU64] {
        // SAFETY: the map is page aligned and TABLE_SIZE long, and every
        // process touches it only through these atomics.
        unsafe { slice::from_raw_parts(map.as_ptr().cast::<AtomicU64>(), TABLE_WORDS) }
    }

    fn owner(words: &[AtomicU64], slot: usize) -> &AtomicU64 {
        &words[2 + slot * 2]
    }

    fn txnid(words: &[AtomicU64], slot: usize) -> &AtomicU64 {
        &words[3 + slot * 2]
    }

    fn reset(map: &MmapMut) {
        let words = Self::words(map);
        for slot in 0..TABLE_SLOTS {
            Self::txnid(words, slot).store(NO_READER, Ordering::SeqCst);
            Self::owner(words, slot).store(0, Ordering::SeqCst);
        }
        words[0].store(LOCK_MAGIC, Ordering::SeqCst);
    }

    /// Claim a free slot.
    fn claim(map: MmapMut) -> Result<Self> {
        let words = Self::words(&map);
        if words[0].load(Ordering::SeqCst) != LOCK_MAGIC {
            return Err(Error::Invalid);
        }
        let owner = OWNED | u64::from(std::process::id());
        let slot = (0..TABLE_SLOTS)
            .find(|&slot| {
                Self::owner(words, slot)
                    .compare_exchange(0, owner, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            })
            .ok_or(Error::ReadersFull)?;
        Ok(ReaderSlots { map, slot })
    }

    fn publish(&self, oldest: Option<TxnId>) {
        let words = Self::words(&self.map);
        Self::txnid(words, self.slot).store(oldest.unwrap_or(NO_READER), Ordering::SeqCst);
    }

    fn oldest(&self) -> Option<TxnId> {
        let words = Self::words(&self.map);
        (0..TABLE_SLOTS)
            .filter(|&slot| Self::owner(words, slot).load(Ordering::SeqCst) != 0)
            .map(|slot| Self::txnid(words, slot).load(Ordering::SeqCst))
            .filter(|&txnid| txnid != NO_READER)
            .min()
    }

    fn release(&self) {
        let words = Self::words(&self.map);
        Self::txnid(words, self.slot).store(NO_READER, Ordering::SeqCst);
        Self::owner(words, self.slot).store(0, Ordering::SeqCst);
    }
}

/// The lock file of an open environment
pub(crate) struct LockFile {
    file: File,
    /// Missing when the lock file could only be opened read-only
    slots: Option<ReaderSlots>,
    released: AtomicBool,
}

impl std::fmt::Debug for LockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFile")
            .field("slot", &self.slots.as_ref().map(|s| s.slot))
            .finish()
    }
}

impl LockFile {
    /// Open the lock file at `path`, take a shared lock on it and claim a
    /// reader slot.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let (file, writable) = match OpenOptions::new().read(true).write(true).create(true).open(path) {
            Ok(file) => (file, true),
            Err(e) if read_only => (OpenOptions::new().read(true).open(path).map_err(|_| e)?, false),
            Err(e) => return Err(e.into()),
        };

        // Nobody else holds the file, so no slot in it is live
        let alone = FileExt::try_lock_exclusive(&file).is_ok();
        let map = if writable {
            if file.metadata()?.len() < TABLE_SIZE as u64 {
                file.set_len(TABLE_SIZE as u64)?;
            }
            // SAFETY: the lock file stays open for the lifetime of the map.
            let map = unsafe { MmapOptions::new().len(TABLE_SIZE).map_mut(&file)? };
            if alone {
                ReaderSlots::reset(&map);
            }
            Some(map)
        } else {
            warn!(
                "lock file {} is read-only; readers here do not pin pages for other processes",
                path.display()
            );
            None
        };
        if alone {
            FileExt::unlock(&file)?;
        }
        // Slots are only claimed under the shared lock, so a reset by
        // another opener in between cannot clear a live one
        FileExt::lock_shared(&file)?;

        let slots = match map.map(ReaderSlots::claim).transpose() {
            Ok(slots) => slots,
            Err(e) => {
                let _ = FileExt::unlock(&file);
                return Err(e);
            }
        };
        debug!(
            "locked {} (reader slot {:?}, first opener: {})",
            path.display(),
            slots.as_ref().map(|s| s.slot),
            alone
        );
        Ok(LockFile {
            file,
            slots,
            released: AtomicBool::new(false),
        })
    }

    /// Publish the oldest snapshot pinned by this environment's readers.
    pub fn publish(&self, oldest: Option<TxnId>) {
        if let Some(slots) = &self.slots {
            slots.publish(oldest);
        }
    }

    /// Oldest snapshot pinned by any environment sharing the lock file
    pub fn oldest(&self) -> Option<TxnId> {
        self.slots.as_ref().and_then(ReaderSlots::oldest)
    }

    /// Give up the reader slot and the shared lock. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(slots) = &self.slots {
            slots.release();
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("unlocking the lock file failed: {}", e);
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive lock on the data file, held by a write transaction
#[derive(Debug)]
pub(crate) struct WriterLock<'a> {
    file: &'a File,
}

impl<'a> WriterLock<'a> {
    /// Lock `file`, giving up with `Timeout` at `deadline`.
    pub fn acquire(file: &'a File, deadline: Option<Instant>) -> Result<Self> {
        let Some(deadline) = deadline else {
            FileExt::lock_exclusive(file)?;
            return Ok(WriterLock { file });
        };
        let contended = fs2::lock_contended_error().kind();
        loop {
            match FileExt::try_lock_exclusive(file) {
                Ok(()) => return Ok(WriterLock { file }),
                Err(e) if e.kind() == contended => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            thread::sleep(WRITER_POLL);
        }
    }
}

impl Drop for WriterLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            warn!("releasing the writer lock failed: {}", e);
        }
    }
}
