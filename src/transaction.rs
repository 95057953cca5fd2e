use std::cell::{Cell, RefCell, RefMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::MutexGuard;

use crate::btree::Tree;
use crate::constants::{EnvFlags, TransactionFlags, META_PAGES};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::lock::WriterLock;
use crate::meta::{DbInfo, MetaHeader};
use crate::midl::Idl;
use crate::page::{
    decode_freelist, encode_freelist, overflow_data, overflow_pages, pack_freelist, FreeRecord,
    LeafDataRef, Page, PageRef, PageView,
};
use crate::types::{Dbi, Pgno, TxnId, MAIN_DBI, P_INVALID};

/// Per-transaction view of one database
#[derive(Debug, Clone, Copy)]
pub(crate) struct DbState {
    pub info: DbInfo,
    /// Record must be written back on commit
    pub dirty: bool,
    /// Deleted by `Database::drop`
    pub dropped: bool,
}

/// Pages and free lists staged by a write transaction
#[derive(Debug, Default)]
pub(crate) struct WriteState {
    /// Modified pages, keyed by their new page number
    pub dirty: HashMap<Pgno, Page>,
    /// Committed pages released by this transaction
    pub freed: Idl,
    /// Pages allocated and released by this transaction
    pub loose: Idl,
    /// Free pages no reader can see any more
    pub reclaimed: Idl,
    /// Freelist records still pinned by live readers
    pub pending: Vec<FreeRecord>,
    /// First page past the end of the used file
    pub next_pgno: Pgno,
}

impl WriteState {
    fn alloc(&mut self, span: u64, max_pgno: Pgno) -> Result<Pgno> {
        if let Some(pgno) = self.loose.take_run(span as usize) {
            return Ok(pgno);
        }
        if let Some(pgno) = self.reclaimed.take_run(span as usize) {
            return Ok(pgno);
        }
        let pgno = self.next_pgno;
        if pgno + span > max_pgno {
            return Err(Error::MapFull);
        }
        self.next_pgno += span;
        Ok(pgno)
    }
}

/// Database transaction
///
/// A read transaction pins the snapshot that was committed when it began.
/// A write transaction holds the environment's writer lock, and the data
/// file's lock shared with other processes, until it is committed or
/// aborted; dropping an unfinished transaction aborts it.
pub struct Transaction<'env> {
    env: &'env Environment,
    flags: Cell<TransactionFlags>,
    /// Transaction ID; the snapshot id for readers
    txn_id: TxnId,
    /// Meta this transaction started from
    snapshot: MetaHeader,
    /// Reader table slot
    reader_slot: Option<usize>,
    /// Database records, loaded on first use
    dbs: RefCell<Vec<Option<DbState>>>,
    write: Option<RefCell<WriteState>>,
    /// Bumped by every mutation so cursors know to re-seek
    generation: Cell<u64>,
    /// Released before `writer`
    file_lock: Option<WriterLock<'env>>,
    writer: Option<MutexGuard<'env, ()>>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id)
            .field("flags", &self.flags.get())
            .finish()
    }
}

impl<'env> Transaction<'env> {
    pub(crate) fn new_read(env: &'env Environment) -> Result<Self> {
        env.enter()?;
        let (snapshot, slot) = match env.register_reader() {
            Ok(r) => r,
            Err(e) => {
                env.leave();
                return Err(e);
            }
        };
        trace!("read txn {} begins in slot {}", snapshot.txnid, slot);
        Ok(Transaction {
            env,
            flags: Cell::new(TransactionFlags::RDONLY),
            txn_id: snapshot.txnid,
            snapshot,
            reader_slot: Some(slot),
            dbs: RefCell::new(Vec::new()),
            write: None,
            generation: Cell::new(0),
            file_lock: None,
            writer: None,
        })
    }

    pub(crate) fn new_write(env: &'env Environment, timeout: Option<Duration>) -> Result<Self> {
        if env.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        env.enter()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let guard = match timeout {
            None => {
                if let Some(guard) = env.writer.try_lock() {
                    Some(guard)
                } else {
                    trace!("waiting for the writer lock");
                    Some(env.writer.lock())
                }
            }
            Some(timeout) => env.writer.try_lock_for(timeout),
        };
        let Some(guard) = guard else {
            env.leave();
            return Err(Error::Timeout);
        };

        let begun = Self::begin_write(env, deadline);
        let (file_lock, snapshot, ws) = match begun {
            Ok(begun) => begun,
            Err(e) => {
                env.leave();
                return Err(e);
            }
        };
        let txn_id = snapshot.txnid + 1;
        debug!(
            "write txn {} begins: {} pages reusable, {} pinned records",
            txn_id,
            ws.reclaimed.len(),
            ws.pending.len()
        );
        Ok(Transaction {
            env,
            flags: Cell::new(TransactionFlags::empty()),
            txn_id,
            snapshot,
            reader_slot: None,
            dbs: RefCell::new(Vec::new()),
            write: Some(RefCell::new(ws)),
            generation: Cell::new(0),
            file_lock,
            writer: Some(guard),
        })
    }

    /// Take the cross-process writer lock, then load the latest commit and
    /// the free pages no reader anywhere can still see.
    fn begin_write(
        env: &'env Environment,
        deadline: Option<Instant>,
    ) -> Result<(Option<WriterLock<'env>>, MetaHeader, WriteState)> {
        let file_lock = match env.lock_file() {
            Some(_) => Some(WriterLock::acquire(env.pager.file(), deadline)?),
            None => None,
        };
        let (snapshot, oldest) = env.writer_snapshot()?;
        let ws = Self::load_freelist(env, &snapshot, oldest.unwrap_or(snapshot.txnid))?;
        Ok((file_lock, snapshot, ws))
    }

    /// Read the freelist chain and split it into pages reusable now and
    /// records still visible to a reader at or before `oldest`.
    fn load_freelist(env: &Environment, meta: &MetaHeader, oldest: TxnId) -> Result<WriteState> {
        let mut ws = WriteState {
            next_pgno: meta.next_pgno,
            ..WriteState::default()
        };
        let mut pgno = meta.free_root;
        let mut reclaimed = Vec::new();
        while pgno != P_INVALID {
            if pgno < META_PAGES as Pgno || pgno >= meta.next_pgno || ws.freed.contains(pgno) {
                return Err(Error::Corrupted);
            }
            let (next, records) = decode_freelist(env.pager.page(pgno)?, pgno)?;
            // The chain itself is rewritten on commit
            ws.freed.insert(pgno);
            for (txnid, pgnos) in records {
                if txnid <= oldest {
                    reclaimed.extend(pgnos);
                } else {
                    ws.pending.push((txnid, pgnos));
                }
            }
            pgno = next;
        }
        ws.reclaimed = Idl::from_unsorted(reclaimed);
        Ok(ws)
    }

    /// Transaction ID. For a read transaction this is the snapshot version.
    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    pub fn is_readonly(&self) -> bool {
        self.write.is_none()
    }

    pub fn env(&self) -> &'env Environment {
        self.env
    }

    pub(crate) fn snapshot(&self) -> &MetaHeader {
        &self.snapshot
    }

    /// Commit the transaction.
    ///
    /// Returns the committed version: the new transaction id, or the
    /// unchanged snapshot id if nothing was written. On error nothing is
    /// published and the transaction is aborted.
    pub fn commit(mut self) -> Result<TxnId> {
        if self.flags.get().contains(TransactionFlags::ERROR) {
            warn!("txn {} refused to commit after an error", self.txn_id);
            self.finish();
            return Err(Error::BadTxn);
        }
        if self.is_readonly() || !self.flags.get().contains(TransactionFlags::DIRTY) {
            self.finish();
            return Ok(self.snapshot.txnid);
        }
        let result = self.commit_inner();
        if let Err(e) = &result {
            debug!("txn {} commit failed: {}", self.txn_id, e);
        }
        self.finish();
        result
    }

    fn commit_inner(&self) -> Result<TxnId> {
        let dropped = self.flush_db_records()?;

        if self.env.state.lock().meta.txnid != self.snapshot.txnid {
            return Err(Error::Conflict);
        }

        let main = self.db_info(MAIN_DBI)?;
        let max_pgno = self.env.pager.max_pgno();
        let mut ws = self.write_state()?;
        let (free_root, mut pages) = save_freelist(&mut ws, self.txn_id, max_pgno)?;
        pages.extend(ws.dirty.iter().map(|(pgno, page)| (*pgno, page.encode(*pgno))));
        pages.sort_unstable_by_key(|(pgno, _)| *pgno);

        let flags = self.env.flags();
        self.env.pager.write_pages(&pages)?;
        if !flags.contains(EnvFlags::NOSYNC) {
            self.env.pager.sync()?;
        }

        let meta = MetaHeader {
            map_size: self.env.pager.map_size() as u64,
            next_pgno: ws.next_pgno,
            txnid: self.txn_id,
            free_root,
            main,
            ..self.snapshot
        };
        self.env.pager.write_meta(&meta)?;
        if !flags.intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC) {
            self.env.pager.sync()?;
        }
        self.env.state.lock().meta = meta;

        if !dropped.is_empty() {
            let mut registry = self.env.registry.lock();
            for dbi in dropped {
                registry.remove(dbi);
            }
        }
        debug!(
            "txn {} committed: {} pages written, next_pgno {}",
            self.txn_id,
            pages.len(),
            meta.next_pgno
        );
        Ok(self.txn_id)
    }

    /// Write changed named-database records into the main tree.
    /// Returns the handles deleted by this transaction.
    fn flush_db_records(&self) -> Result<Vec<Dbi>> {
        let changed: Vec<(Dbi, DbState)> = self
            .dbs
            .borrow()
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(dbi, state)| state.map(|s| (dbi as Dbi, s)))
            .filter(|(_, s)| s.dirty || s.dropped)
            .collect();
        let mut dropped = Vec::new();
        for (dbi, state) in changed {
            let name = self.env.registry.lock().name(dbi).ok_or(Error::BadDbi)?;
            let main = Tree::new(self, MAIN_DBI);
            if state.dropped {
                match main.del_record(&name) {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
                dropped.push(dbi);
            } else {
                main.put_record(&name, &state.info)?;
            }
        }
        Ok(dropped)
    }

    /// Abort the transaction, discarding every staged change.
    pub fn abort(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let flags = self.flags.get();
        if flags.contains(TransactionFlags::FINISHED) {
            return;
        }
        self.flags.set(flags | TransactionFlags::FINISHED);
        if let Some(slot) = self.reader_slot.take() {
            self.env.release_reader(slot);
        }
        if let Some(write) = self.write.take() {
            let ws = write.into_inner();
            if !flags.contains(TransactionFlags::DIRTY) || ws.dirty.is_empty() {
                trace!("write txn {} finished", self.txn_id);
            } else {
                debug!("write txn {} released {} staged pages", self.txn_id, ws.dirty.len());
            }
        }
        self.file_lock = None;
        self.writer = None;
        self.env.leave();
    }

    // --- state used by trees and cursors ---

    /// Fail once the transaction hit corruption.
    pub(crate) fn check(&self) -> Result<()> {
        if self.flags.get().contains(TransactionFlags::ERROR) {
            Err(Error::BadTxn)
        } else {
            Ok(())
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.get()
    }

    pub(crate) fn mark_dirty(&self) {
        self.flags.set(self.flags.get() | TransactionFlags::DIRTY);
        self.generation.set(self.generation.get() + 1);
    }

    /// Poison the transaction if `result` reports corruption.
    pub(crate) fn poison<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::Corrupted) = &result {
            let flags = self.flags.get();
            if !flags.contains(TransactionFlags::ERROR) {
                warn!("txn {} hit a corrupted page and must abort", self.txn_id);
                self.flags.set(flags | TransactionFlags::ERROR);
            }
        }
        result
    }

    pub(crate) fn corrupted(&self) -> Error {
        let _ = self.poison::<()>(Err(Error::Corrupted));
        Error::Corrupted
    }

    pub(crate) fn write_state(&self) -> Result<RefMut<'_, WriteState>> {
        match &self.write {
            Some(write) => Ok(write.borrow_mut()),
            None => Err(Error::TxnReadOnly),
        }
    }

    /// Record for `dbi`, loaded on first use.
    pub(crate) fn db_state(&self, dbi: Dbi) -> Result<DbState> {
        if let Some(Some(state)) = self.dbs.borrow().get(dbi as usize) {
            return if state.dropped { Err(Error::BadDbi) } else { Ok(*state) };
        }
        let info = if dbi == MAIN_DBI {
            self.snapshot.main
        } else {
            let (name, flags) = {
                let registry = self.env.registry.lock();
                let entry = registry.entry(dbi).ok_or(Error::BadDbi)?;
                (entry.name.clone(), entry.flags)
            };
            let main = Tree::new(self, MAIN_DBI);
            let main_info = self.db_info(MAIN_DBI)?;
            self.poison(main.find_record(&main_info, &name))?
                .unwrap_or_else(|| DbInfo::empty(flags))
        };
        let state = DbState {
            info,
            dirty: false,
            dropped: false,
        };
        let mut dbs = self.dbs.borrow_mut();
        if dbs.len() <= dbi as usize {
            dbs.resize(dbi as usize + 1, None);
        }
        dbs[dbi as usize] = Some(state);
        Ok(state)
    }

    pub(crate) fn db_info(&self, dbi: Dbi) -> Result<DbInfo> {
        self.db_state(dbi).map(|s| s.info)
    }

    /// Stage a changed record for `dbi`.
    pub(crate) fn set_db_info(&self, dbi: Dbi, info: DbInfo) {
        let mut dbs = self.dbs.borrow_mut();
        if dbs.len() <= dbi as usize {
            dbs.resize(dbi as usize + 1, None);
        }
        dbs[dbi as usize] = Some(DbState {
            info,
            dirty: true,
            dropped: false,
        });
        drop(dbs);
        self.mark_dirty();
    }

    /// Mark `dbi` deleted; its record is removed on commit.
    pub(crate) fn set_db_dropped(&self, dbi: Dbi, info: DbInfo) {
        let mut dbs = self.dbs.borrow_mut();
        if dbs.len() <= dbi as usize {
            dbs.resize(dbi as usize + 1, None);
        }
        dbs[dbi as usize] = Some(DbState {
            info,
            dirty: false,
            dropped: true,
        });
        drop(dbs);
        self.mark_dirty();
    }

    // --- page access ---

    fn mapped(&self, pgno: Pgno) -> Result<PageView<'env>> {
        if pgno < META_PAGES as Pgno || pgno >= self.snapshot.next_pgno {
            return Err(Error::Corrupted);
        }
        PageView::parse(self.env.pager.page(pgno)?, pgno)
    }

    /// Run `f` against a branch or leaf page, staged copy first.
    pub(crate) fn with_page<R>(&self, pgno: Pgno, f: impl FnOnce(PageRef<'_>) -> R) -> Result<R> {
        if let Some(write) = &self.write {
            let ws = write.borrow();
            if let Some(page) = ws.dirty.get(&pgno) {
                if let Page::Overflow(_) = page {
                    return Err(self.corrupted());
                }
                return Ok(f(PageRef::Staged(page)));
            }
        }
        let view = self.poison(self.mapped(pgno))?;
        Ok(f(PageRef::Mapped(view)))
    }

    /// Resolve a leaf value, following overflow runs.
    pub(crate) fn read_value(&self, data: LeafDataRef<'_>) -> Result<Vec<u8>> {
        match data {
            LeafDataRef::Inline(bytes) => Ok(bytes.to_vec()),
            LeafDataRef::Overflow { pgno, len } => self.read_overflow(pgno, len as usize),
        }
    }

    fn read_overflow(&self, pgno: Pgno, len: usize) -> Result<Vec<u8>> {
        if let Some(write) = &self.write {
            if let Some(page) = write.borrow().dirty.get(&pgno) {
                return match page {
                    Page::Overflow(data) if data.len() == len => Ok(data.clone()),
                    _ => Err(self.corrupted()),
                };
            }
        }
        let span = overflow_pages(len);
        if pgno < META_PAGES as Pgno || pgno.saturating_add(span) > self.snapshot.next_pgno {
            return Err(self.corrupted());
        }
        let bytes = self.poison(self.env.pager.pages(pgno, span))?;
        self.poison(overflow_data(bytes, pgno, len)).map(<[u8]>::to_vec)
    }

    /// Make `pgno` writable, copying it to a fresh page unless it is
    /// already staged. Returns the page number to use from now on.
    pub(crate) fn touch(&self, pgno: Pgno) -> Result<Pgno> {
        let max_pgno = self.env.pager.max_pgno();
        let mut ws = self.write_state()?;
        if ws.dirty.contains_key(&pgno) {
            return Ok(pgno);
        }
        let page = self.poison(self.mapped(pgno))?.to_page();
        let new = ws.alloc(1, max_pgno)?;
        ws.freed.insert(pgno);
        ws.dirty.insert(new, page);
        Ok(new)
    }

    /// Stage a new page and return its page number.
    pub(crate) fn alloc_page(&self, page: Page) -> Result<Pgno> {
        let max_pgno = self.env.pager.max_pgno();
        let mut ws = self.write_state()?;
        let pgno = ws.alloc(page.span(), max_pgno)?;
        ws.dirty.insert(pgno, page);
        Ok(pgno)
    }

    /// Release `span` pages starting at `pgno`.
    pub(crate) fn free_page(&self, pgno: Pgno, span: u64) -> Result<()> {
        let mut ws = self.write_state()?;
        if ws.dirty.remove(&pgno).is_some() {
            ws.loose.insert_run(pgno, span);
        } else {
            ws.freed.insert_run(pgno, span);
        }
        Ok(())
    }

    /// Mutate a staged page.
    pub(crate) fn dirty_mut<R>(&self, pgno: Pgno, f: impl FnOnce(&mut Page) -> R) -> Result<R> {
        let mut ws = self.write_state()?;
        match ws.dirty.get_mut(&pgno) {
            Some(page) => Ok(f(page)),
            None => Err(self.corrupted()),
        }
    }

    /// Fail with `MapFull` unless `pages` single pages plus one run of
    /// `run` contiguous pages can still be allocated.
    pub(crate) fn ensure_room(&self, pages: u64, run: u64) -> Result<()> {
        let max_pgno = self.env.pager.max_pgno();
        let ws = self.write_state()?;
        let tail = max_pgno.saturating_sub(ws.next_pgno);
        let recycled = (ws.loose.len() + ws.reclaimed.len()) as u64;
        let enough = if run > 1 && !ws.loose.has_run(run as usize) && !ws.reclaimed.has_run(run as usize) {
            tail >= run && recycled + tail - run >= pages
        } else {
            recycled + tail >= pages + run
        };
        if enough {
            Ok(())
        } else {
            Err(Error::MapFull)
        }
    }
}

/// Encode the freelist for commit: records still pinned by readers,
/// pages reusable by the next writer under id 0, and the pages this
/// transaction freed under its own id.
fn save_freelist(ws: &mut WriteState, txn_id: TxnId, max_pgno: Pgno) -> Result<(Pgno, Vec<(Pgno, Vec<u8>)>)> {
    let mut chain: Vec<Pgno> = Vec::new();
    loop {
        let mut reusable = ws.reclaimed.clone();
        reusable.append_list(&ws.loose);
        let mut records: Vec<FreeRecord> = ws.pending.clone();
        if !reusable.is_empty() {
            records.push((0, reusable.as_slice().to_vec()));
        }
        if !ws.freed.is_empty() {
            records.push((txn_id, ws.freed.as_slice().to_vec()));
        }
        let packed = pack_freelist(&records);
        if chain.len() >= packed.len() {
            let mut pages = Vec::with_capacity(chain.len());
            for (i, &pgno) in chain.iter().enumerate() {
                let next = chain.get(i + 1).copied().unwrap_or(P_INVALID);
                let chunk = packed.get(i).map(Vec::as_slice).unwrap_or(&[]);
                pages.push((pgno, encode_freelist(pgno, next, chunk)));
            }
            return Ok((chain.first().copied().unwrap_or(P_INVALID), pages));
        }
        // Chain pages come out of the lists they describe, so re-pack after each
        let pgno = match ws.loose.pop() {
            Some(pgno) => pgno,
            None => match ws.reclaimed.pop() {
                Some(pgno) => pgno,
                None => ws.alloc(1, max_pgno)?,
            },
        };
        chain.push(pgno);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.flags.get().contains(TransactionFlags::FINISHED) {
            trace!("txn {} dropped without commit", self.txn_id);
            self.finish();
        }
    }
}
