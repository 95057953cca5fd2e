use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::btree::Tree;
use crate::constants::{
    CopyFlags, DbFlags, EnvFlags, NodeFlags, CHANGEABLE, DATA_FILE_NAME, DEFAULT_MAP_SIZE,
    DEFAULT_MAX_DBS, DEFAULT_MAX_READERS, LOCK_FILE_NAME, LOCK_SUFFIX, MAX_KEY_SIZE, META_PAGES,
    PAGE_SIZE, PERSISTENT_DB_FLAGS, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use crate::database::{Database, DbRegistry};
use crate::error::{Error, Result};
use crate::lock::{LockFile, WriterLock};
use crate::meta::{DbInfo, MetaHeader, ReaderInfo, ReaderTable};
use crate::page::{LeafData, LeafDataRef, Page};
use crate::pager::{encode_meta_page, Pager};
use crate::transaction::Transaction;
use crate::types::{EnvInfo, Pgno, Stat, TxnId, MAIN_DBI, P_INVALID};

/// Pages copied per write by [`Environment::copy`]
const COPY_CHUNK_PAGES: u64 = 256;

/// Bit of the transaction count set once the environment is closed
const CLOSED: usize = 1 << (usize::BITS - 1);

/// Committed state shared by all transactions
#[derive(Debug)]
pub(crate) struct EnvState {
    /// Meta of the last committed transaction
    pub meta: MetaHeader,
    pub readers: ReaderTable,
}

/// Options for opening an [`Environment`]
#[derive(Debug, Clone, Copy)]
pub struct EnvBuilder {
    flags: EnvFlags,
    map_size: usize,
    max_dbs: u32,
    max_readers: u32,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        EnvBuilder {
            flags: EnvFlags::empty(),
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
        }
    }
}

impl EnvBuilder {
    pub fn set_flags(&mut self, flags: EnvFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Set the size of the memory map, which bounds the size of the data file.
    ///
    /// An existing file larger than this keeps its own size.
    pub fn set_map_size(&mut self, size: usize) -> &mut Self {
        self.map_size = size;
        self
    }

    /// Set the maximum number of named databases
    pub fn set_max_dbs(&mut self, dbs: u32) -> &mut Self {
        self.max_dbs = dbs;
        self
    }

    /// Set the maximum number of concurrent read transactions
    pub fn set_max_readers(&mut self, readers: u32) -> &mut Self {
        self.max_readers = readers;
        self
    }

    /// Open the environment
    ///
    /// `path` is a directory holding `data.mdb` and `lock.mdb` (created
    /// if missing), or with `NOSUBDIR` the data file itself.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Environment> {
        let path = path.as_ref();
        if self.max_readers == 0 {
            return Err(Error::EnvInvalidConfig("max_readers must be at least 1"));
        }
        let read_only = self.flags.contains(EnvFlags::RDONLY);
        let (data_path, lock_path) = if self.flags.contains(EnvFlags::NOSUBDIR) {
            let mut lock = path.as_os_str().to_owned();
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            if !read_only {
                fs::create_dir_all(path)?;
            }
            (path.join(DATA_FILE_NAME), path.join(LOCK_FILE_NAME))
        };

        let lock = if self.flags.contains(EnvFlags::NOLOCK) {
            None
        } else {
            Some(LockFile::open(&lock_path, read_only)?)
        };

        let pager = Pager::open(&data_path, self.map_size, read_only)?;
        let meta = if !read_only && pager.is_blank()? {
            // Another process may be setting up the same new file
            let _writer = match &lock {
                Some(_) => Some(WriterLock::acquire(pager.file(), None)?),
                None => None,
            };
            if pager.is_blank()? {
                let meta = MetaHeader {
                    map_size: pager.map_size() as u64,
                    ..MetaHeader::default()
                };
                pager.write_pages(&[(0, encode_meta_page(0, &meta)), (1, encode_meta_page(1, &meta))])?;
                pager.sync()?;
                meta
            } else {
                select_meta(&pager)?
            }
        } else {
            select_meta(&pager)?
        };
        if meta.next_pgno > pager.max_pgno() {
            return Err(Error::Corrupted);
        }
        debug!(
            "opened environment {} at txn {} ({} of {} pages used)",
            path.display(),
            meta.txnid,
            meta.next_pgno,
            pager.max_pgno()
        );

        Ok(Environment {
            path: path.to_path_buf(),
            flags: AtomicU32::new(self.flags.bits()),
            max_dbs: self.max_dbs,
            max_readers: self.max_readers,
            pager,
            lock,
            state: Mutex::new(EnvState {
                meta,
                readers: ReaderTable::default(),
            }),
            registry: Mutex::new(DbRegistry::default()),
            writer: Mutex::new(()),
            txns: AtomicUsize::new(0),
        })
    }
}

/// Pick the newest meta page that validates.
fn select_meta(pager: &Pager) -> Result<MetaHeader> {
    let [first, second] = pager.read_metas();
    match (first, second) {
        (Ok(a), Ok(b)) => Ok(if b.txnid > a.txnid { b } else { a }),
        (Ok(meta), Err(e)) | (Err(e), Ok(meta)) => {
            warn!("ignoring damaged meta page ({}), using txn {}", e, meta.txnid);
            Ok(meta)
        }
        (Err(a), Err(b)) => Err(match (a, b) {
            (e @ Error::VersionMismatch { .. }, _) | (_, e @ Error::VersionMismatch { .. }) => e,
            (Error::Invalid, Error::Invalid) => Error::Invalid,
            _ => Error::Corrupted,
        }),
    }
}

/// LMDB-style environment: one data file, many readers, one writer
///
/// The environment is `Sync`: share it between threads by reference and
/// begin a transaction per thread. Other processes, or other environments
/// in this one, may open the same files at the same time. Each transaction
/// starts from the newest commit made by any of them, and write
/// transactions wait for each other across all of them.
#[derive(Debug)]
pub struct Environment {
    /// Path to the environment directory
    path: PathBuf,
    /// Environment flags
    flags: AtomicU32,
    /// Maximum number of databases
    max_dbs: u32,
    /// Maximum number of readers
    max_readers: u32,
    pub(crate) pager: Pager,
    /// Lock file and reader slot, held until close; `None` with `NOLOCK`
    lock: Option<LockFile>,
    pub(crate) state: Mutex<EnvState>,
    pub(crate) registry: Mutex<DbRegistry>,
    /// Held by the single write transaction of this environment
    pub(crate) writer: Mutex<()>,
    /// Live transactions, plus the `CLOSED` bit
    txns: AtomicUsize,
}

impl Environment {
    /// Options for opening an environment
    pub fn builder() -> EnvBuilder {
        EnvBuilder::default()
    }

    /// Open an environment with room for `max_dbs` named databases in a
    /// map of `map_size` bytes.
    pub fn open<P: AsRef<Path>>(path: P, max_dbs: u32, map_size: usize) -> Result<Self> {
        Self::builder().set_max_dbs(max_dbs).set_map_size(map_size).open(path)
    }

    pub(crate) fn enter(&self) -> Result<()> {
        self.txns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n & CLOSED == 0).then(|| n + 1))
            .map(|_| ())
            .map_err(|_| Error::EnvClosed)
    }

    pub(crate) fn leave(&self) {
        self.txns.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn lock_file(&self) -> Option<&LockFile> {
        self.lock.as_ref()
    }

    /// Adopt a newer commit made through another handle on the same files.
    fn refresh_meta(&self, state: &mut EnvState) -> Result<()> {
        let Some(meta) = self.pager.latest_meta() else {
            return Ok(());
        };
        if meta.txnid > state.meta.txnid {
            if meta.next_pgno > self.pager.max_pgno() {
                return Err(Error::MapResized);
            }
            trace!("picked up txn {} committed elsewhere", meta.txnid);
            state.meta = meta;
        }
        Ok(())
    }

    /// The newest commit, best effort.
    fn current_meta(&self) -> MutexGuard<'_, EnvState> {
        let mut state = self.state.lock();
        if let Err(e) = self.refresh_meta(&mut state) {
            debug!("keeping txn {}: {}", state.meta.txnid, e);
        }
        state
    }

    /// Pin the newest commit for a new reader. Returns the snapshot and
    /// the reader's slot.
    pub(crate) fn register_reader(&self) -> Result<(MetaHeader, usize)> {
        let mut state = self.state.lock();
        loop {
            self.refresh_meta(&mut state)?;
            let meta = state.meta;
            let slot = state.readers.register(meta.txnid, self.max_readers)?;
            let Some(lock) = &self.lock else {
                return Ok((meta, slot));
            };
            lock.publish(state.readers.oldest());
            // Until the pin is visible a writer elsewhere may reuse pages of
            // `meta`, but only after a newer commit lands
            if self.pager.latest_meta().map_or(true, |m| m.txnid <= meta.txnid) {
                return Ok((meta, slot));
            }
            state.readers.release(slot);
        }
    }

    pub(crate) fn release_reader(&self, slot: usize) {
        let mut state = self.state.lock();
        state.readers.release(slot);
        if let Some(lock) = &self.lock {
            lock.publish(state.readers.oldest());
        }
    }

    /// Latest commit and the oldest snapshot any reader still needs, for a
    /// writer that holds the writer locks.
    pub(crate) fn writer_snapshot(&self) -> Result<(MetaHeader, Option<TxnId>)> {
        let mut state = self.state.lock();
        self.refresh_meta(&mut state)?;
        let shared = self.lock.as_ref().and_then(LockFile::oldest);
        let oldest = match (state.readers.oldest(), shared) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Ok((state.meta, oldest))
    }

    /// Begin a read-write transaction, waiting for the current writer.
    pub fn begin_rw_txn(&self) -> Result<Transaction<'_>> {
        Transaction::new_write(self, None)
    }

    /// Begin a read-write transaction, giving up with `Timeout` after `timeout`.
    pub fn begin_rw_txn_timeout(&self, timeout: Duration) -> Result<Transaction<'_>> {
        Transaction::new_write(self, Some(timeout))
    }

    /// Begin a new read-only transaction
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        Transaction::new_read(self)
    }

    /// Open a database: the main database for `None`, otherwise a named one.
    ///
    /// Handles are cached by name, so opening a name again returns the same
    /// handle. A named database must exist unless `DbFlags::CREATE` is given;
    /// its record is written by the first transaction that stores into it.
    /// Asking for flags that differ from the stored ones is `Incompatible`.
    pub fn open_db(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        if self.is_closed() {
            return Err(Error::EnvClosed);
        }
        let Some(name) = name else {
            if flags.contains(DbFlags::DUPSORT) {
                return Err(Error::Incompatible);
            }
            return Ok(Database::main());
        };
        let name = name.as_bytes();
        if name.is_empty() || name.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize);
        }
        let wanted = flags & PERSISTENT_DB_FLAGS;
        let explicit = flags.intersects(DbFlags::CREATE | DbFlags::DUPSORT);

        let mut registry = self.registry.lock();
        if let Some((dbi, stored)) = registry.lookup(name) {
            if explicit && stored != wanted {
                return Err(Error::Incompatible);
            }
            return Ok(Database::new(dbi));
        }
        if registry.len() >= self.max_dbs as usize {
            return Err(Error::DbsFull);
        }

        let record = {
            let txn = self.begin_ro_txn()?;
            let main = txn.db_info(MAIN_DBI)?;
            let found = Tree::new(&txn, MAIN_DBI).find_record(&main, name);
            txn.abort();
            found?
        };
        let stored = match record {
            Some(info) if explicit && info.flags != wanted => return Err(Error::Incompatible),
            Some(info) => info.flags,
            None if !flags.contains(DbFlags::CREATE) => return Err(Error::NotFound),
            None if self.flags().contains(EnvFlags::RDONLY) => return Err(Error::EnvReadOnly),
            None => wanted,
        };
        let dbi = registry.register(name, stored);
        debug!("opened database {:?} as dbi {}", String::from_utf8_lossy(name), dbi);
        Ok(Database::new(dbi))
    }

    /// Close the environment.
    ///
    /// Fails with `Busy`, changing nothing, while any transaction is
    /// alive. Afterwards new transactions fail with `EnvClosed`; data is
    /// synced and the lock file released. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        match self.txns.compare_exchange(0, CLOSED, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {}
            Err(n) if n & CLOSED != 0 => return Ok(()),
            Err(_) => return Err(Error::Busy("transactions are still open")),
        }
        self.pager.sync()?;
        if let Some(lock) = &self.lock {
            lock.release();
        }
        debug!("closed environment {}", self.path.display());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.txns.load(Ordering::SeqCst) & CLOSED != 0
    }

    /// Flush the data buffers to disk
    ///
    /// Commits sync on their own unless `NOSYNC` is set; with `force` the
    /// sync happens regardless of that flag.
    pub fn sync(&self, force: bool) -> Result<()> {
        if force || !self.flags().contains(EnvFlags::NOSYNC) {
            self.pager.sync()?;
        }
        Ok(())
    }

    /// Set or clear flags. Only `NOSYNC` and `NOMETASYNC` may change after open.
    pub fn set_flags(&self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::EnvInvalidConfig("only NOSYNC and NOMETASYNC can be changed"));
        }
        if onoff {
            self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn flags(&self) -> EnvFlags {
        EnvFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Get the path that was used to open the environment
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_dbs(&self) -> u32 {
        self.max_dbs
    }

    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    /// Get the maximum size of keys we can write
    pub fn max_key_size(&self) -> usize {
        MAX_KEY_SIZE
    }

    /// Statistics of the main database as last committed
    pub fn stat(&self) -> Stat {
        self.current_meta().meta.main.stat()
    }

    pub fn info(&self) -> EnvInfo {
        let state = self.current_meta();
        EnvInfo {
            map_size: self.pager.map_size(),
            last_pgno: state.meta.next_pgno - 1,
            last_txnid: state.meta.txnid,
            max_readers: self.max_readers,
            num_readers: state.readers.num_readers(),
        }
    }

    /// Readers currently holding a snapshot
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.state.lock().readers.list()
    }

    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    pub fn version_string() -> String {
        format!("lumokv {}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Copy the environment into the directory `path` as `data.mdb`.
    ///
    /// The copy is a consistent snapshot taken inside a read transaction,
    /// so writers may keep going. With `CopyFlags::COMPACT` only live pages
    /// are written, renumbered in tree order, and the copy has no free pages.
    /// No lock file is created; it is recreated on open.
    pub fn copy<P: AsRef<Path>>(&self, path: P, flags: CopyFlags) -> Result<()> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.join(DATA_FILE_NAME))?;
        let mut out = BufWriter::new(file);

        let txn = self.begin_ro_txn()?;
        let snapshot = *txn.snapshot();
        let meta = if flags.contains(CopyFlags::COMPACT) {
            // Meta pages are filled in once the tree has been written
            out.write_all(&vec![0u8; META_PAGES * PAGE_SIZE])?;
            let mut writer = CompactWriter {
                out: &mut out,
                next: META_PAGES as Pgno,
            };
            let mut main = snapshot.main;
            if main.root != P_INVALID {
                main.root = writer.copy_tree(&txn, main.root, true)?;
            }
            let meta = MetaHeader {
                next_pgno: writer.next,
                free_root: P_INVALID,
                main,
                ..snapshot
            };
            out.seek(SeekFrom::Start(0))?;
            meta
        } else {
            snapshot
        };
        out.write_all(&encode_meta_page(0, &meta))?;
        out.write_all(&encode_meta_page(1, &meta))?;
        if !flags.contains(CopyFlags::COMPACT) {
            let mut pgno = META_PAGES as Pgno;
            while pgno < snapshot.next_pgno {
                let count = COPY_CHUNK_PAGES.min(snapshot.next_pgno - pgno);
                out.write_all(self.pager.pages(pgno, count)?)?;
                pgno += count;
            }
        }
        txn.abort();

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        debug!(
            "copied txn {} to {} ({} pages{})",
            meta.txnid,
            path.display(),
            meta.next_pgno,
            if flags.contains(CopyFlags::COMPACT) { ", compacted" } else { "" }
        );
        Ok(())
    }
}

/// Appends pages in post-order, so children get numbers before parents.
struct CompactWriter<'a, W: Write> {
    out: &'a mut W,
    next: Pgno,
}

impl<W: Write> CompactWriter<'_, W> {
    fn append(&mut self, page: &Page) -> Result<Pgno> {
        let pgno = self.next;
        self.out.write_all(&page.encode(pgno))?;
        self.next += page.span();
        Ok(pgno)
    }

    /// Rewrite the subtree at `pgno`, and when `main` the trees of the
    /// named databases recorded in it. Returns the new root.
    fn copy_tree(&mut self, txn: &Transaction<'_>, pgno: Pgno, main: bool) -> Result<Pgno> {
        let mut page = txn.with_page(pgno, |p| p.to_page())?;
        match &mut page {
            Page::Branch(nodes) => {
                for node in nodes.iter_mut() {
                    node.child = self.copy_tree(txn, node.child, main)?;
                }
            }
            Page::Leaf(nodes) => {
                for node in nodes.iter_mut() {
                    match &mut node.data {
                        LeafData::Overflow { pgno, len } => {
                            let data = txn.read_value(LeafDataRef::Overflow { pgno: *pgno, len: *len })?;
                            *pgno = self.append(&Page::Overflow(data))?;
                        }
                        LeafData::Inline(record) if main && node.flags.contains(NodeFlags::SUBDATA) => {
                            let mut info = DbInfo::decode(record)?;
                            if info.root != P_INVALID {
                                info.root = self.copy_tree(txn, info.root, false)?;
                            }
                            *record = info.encode().to_vec();
                        }
                        LeafData::Inline(_) => {}
                    }
                }
            }
            Page::Overflow(_) => return Err(Error::Corrupted),
        }
        self.append(&page)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.pager.sync() {
                warn!("sync on drop failed for {}: {}", self.path.display(), e);
            }
        }
    }
}
