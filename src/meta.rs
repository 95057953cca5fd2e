use std::thread::{self, ThreadId};

use crate::constants::{DbFlags, DATA_VERSION, MDB_MAGIC, PAGE_SIZE, PERSISTENT_DB_FLAGS};
use crate::error::{Error, Result};
use crate::types::{Pgno, Stat, TxnId, P_INVALID};

/// Encoded size of a database record
pub(crate) const DB_INFO_SIZE: usize = 48;
/// Encoded size of the meta header, checksum excluded
const META_BODY_SIZE: usize = 48 + DB_INFO_SIZE;

/// Database record matching MDB_db
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DbInfo {
    /// Persistent database flags
    pub flags: DbFlags,
    /// Depth of B-tree
    pub depth: u16,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data entries
    pub entries: u64,
    /// Root page number
    pub root: Pgno,
}

impl Default for DbInfo {
    fn default() -> Self {
        Self::empty(DbFlags::empty())
    }
}

impl DbInfo {
    pub fn empty(flags: DbFlags) -> Self {
        DbInfo {
            flags: flags & PERSISTENT_DB_FLAGS,
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: P_INVALID,
        }
    }

    pub fn is_dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUPSORT)
    }

    pub fn encode(&self) -> [u8; DB_INFO_SIZE] {
        let mut buf = [0u8; DB_INFO_SIZE];
        buf[0..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[4..6].copy_from_slice(&self.depth.to_le_bytes());
        buf[8..16].copy_from_slice(&self.branch_pages.to_le_bytes());
        buf[16..24].copy_from_slice(&self.leaf_pages.to_le_bytes());
        buf[24..32].copy_from_slice(&self.overflow_pages.to_le_bytes());
        buf[32..40].copy_from_slice(&self.entries.to_le_bytes());
        buf[40..48].copy_from_slice(&self.root.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != DB_INFO_SIZE {
            return Err(Error::Corrupted);
        }
        let flags = DbFlags::from_bits(read_u32(buf, 0)).ok_or(Error::Corrupted)?;
        let info = DbInfo {
            flags,
            depth: u16::from_le_bytes([buf[4], buf[5]]),
            branch_pages: read_u64(buf, 8),
            leaf_pages: read_u64(buf, 16),
            overflow_pages: read_u64(buf, 24),
            entries: read_u64(buf, 32),
            root: read_u64(buf, 40),
        };
        // An empty tree has no root and no depth, and vice versa
        if (info.root == P_INVALID) != (info.depth == 0) {
            return Err(Error::Corrupted);
        }
        Ok(info)
    }

    pub fn stat(&self) -> Stat {
        Stat {
            psize: PAGE_SIZE as u32,
            depth: u32::from(self.depth),
            branch_pages: self.branch_pages,
            leaf_pages: self.leaf_pages,
            overflow_pages: self.overflow_pages,
            entries: self.entries,
        }
    }
}

/// Meta header matching MDB_meta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Magic number identifying lumokv file
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Page size for this file
    pub page_size: u32,
    /// Size of mmap region when the meta was written
    pub map_size: u64,
    /// First never-used page in the data file
    pub next_pgno: Pgno,
    /// txnid that committed this meta
    pub txnid: TxnId,
    /// First page of the freelist chain
    pub free_root: Pgno,
    /// The unnamed default database
    pub main: DbInfo,
}

impl Default for MetaHeader {
    fn default() -> Self {
        Self {
            magic: MDB_MAGIC,
            version: DATA_VERSION,
            page_size: PAGE_SIZE as u32,
            map_size: 0,
            next_pgno: crate::constants::META_PAGES as Pgno,
            txnid: 0,
            free_root: P_INVALID,
            main: DbInfo::default(),
        }
    }
}

impl MetaHeader {
    /// Encoded size including the trailing checksum
    pub const SIZE: usize = META_BODY_SIZE + 4;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.map_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.next_pgno.to_le_bytes());
        buf[32..40].copy_from_slice(&self.txnid.to_le_bytes());
        buf[40..48].copy_from_slice(&self.free_root.to_le_bytes());
        buf[48..META_BODY_SIZE].copy_from_slice(&self.main.encode());
        let sum = checksum32(&buf[..META_BODY_SIZE]);
        buf[META_BODY_SIZE..].copy_from_slice(&sum.to_le_bytes());
        buf
    }

    /// Decode and validate a meta header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Invalid);
        }
        if read_u32(buf, 0) != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        let version = read_u32(buf, 4);
        if version != DATA_VERSION {
            return Err(Error::VersionMismatch {
                found: version,
                expected: DATA_VERSION,
            });
        }
        if read_u32(buf, META_BODY_SIZE) != checksum32(&buf[..META_BODY_SIZE]) {
            return Err(Error::Corrupted);
        }
        let meta = MetaHeader {
            magic: MDB_MAGIC,
            version,
            page_size: read_u32(buf, 8),
            map_size: read_u64(buf, 16),
            next_pgno: read_u64(buf, 24),
            txnid: read_u64(buf, 32),
            free_root: read_u64(buf, 40),
            main: DbInfo::decode(&buf[48..META_BODY_SIZE])?,
        };
        if meta.page_size as usize != PAGE_SIZE || meta.next_pgno < crate::constants::META_PAGES as Pgno {
            return Err(Error::Corrupted);
        }
        Ok(meta)
    }
}

/// FNV-1a over the meta body.
pub(crate) fn checksum32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Reader info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Process ID
    pub pid: u32,
    /// Thread that began the transaction
    pub thread: ThreadId,
    /// Snapshot the reader is pinned to
    pub txn_id: TxnId,
}

/// Reader lock table matching MDB_txninfo
#[derive(Debug, Default)]
pub(crate) struct ReaderTable {
    /// Array of reader slots
    slots: Vec<Option<ReaderInfo>>,
    /// Number of slots in use
    num_readers: u32,
}

impl ReaderTable {
    /// Claim a slot for a reader pinned to `txn_id`.
    pub fn register(&mut self, txn_id: TxnId, max_readers: u32) -> Result<usize> {
        if self.num_readers >= max_readers {
            return Err(Error::ReadersFull);
        }
        let info = ReaderInfo {
            pid: std::process::id(),
            thread: thread::current().id(),
            txn_id,
        };
        self.num_readers += 1;
        match self.slots.iter().position(Option::is_none) {
            Some(slot) => {
                self.slots[slot] = Some(info);
                Ok(slot)
            }
            None => {
                self.slots.push(Some(info));
                Ok(self.slots.len() - 1)
            }
        }
    }

    /// Release a reader slot
    pub fn release(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            if entry.take().is_some() {
                self.num_readers -= 1;
            }
        }
    }

    /// Oldest snapshot still pinned by a reader
    pub fn oldest(&self) -> Option<TxnId> {
        self.slots.iter().flatten().map(|r| r.txn_id).min()
    }

    pub fn num_readers(&self) -> u32 {
        self.num_readers
    }

    pub fn list(&self) -> Vec<ReaderInfo> {
        self.slots.iter().flatten().cloned().collect()
    }
}
