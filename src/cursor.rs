use std::cmp::Ordering;

use crate::btree::{Stack, Target, Tree, ValBound};
use crate::constants::WriteFlags;
use crate::error::{Error, Result};
use crate::meta::DbInfo;
use crate::transaction::Transaction;
use crate::types::{CursorOp, Dbi};

/// Current entry of a positioned cursor
#[derive(Debug, Clone)]
struct Position {
    /// Path to the entry as of `generation`
    stack: Stack,
    key: Vec<u8>,
    value: Vec<u8>,
    /// Transaction generation the stack was taken at
    generation: u64,
    /// The entry was deleted after the cursor moved here
    deleted: bool,
}

/// Internal cursor state
#[derive(Debug, Clone)]
enum CursorState {
    /// Never positioned
    Unset,
    /// Moved off an end; `front` when it went before the first entry
    Off { front: bool },
    At(Position),
}

/// Where the current entry stands in the tree as it is now
enum Anchor {
    /// The entry still exists here
    Exact(Stack),
    /// The entry was deleted; this is the first entry after it, if any
    Gone(Option<Stack>),
}

/// Database cursor
///
/// Movement methods return `Ok(true)` when the cursor ends up on an entry.
/// Moving past either end leaves the cursor unpositioned: [`Cursor::item`]
/// then yields an empty key and value. After running off the end, `next`
/// stays put and `prev` goes to the last entry; after running off the
/// front it is the other way round.
///
/// A cursor on a write transaction sees every write made in that
/// transaction. If the transaction changed since the cursor last moved, the
/// cursor finds its entry again by key (and value) before stepping.
#[derive(Debug)]
pub struct Cursor<'txn, 'env> {
    /// The transaction this cursor belongs to
    txn: &'txn Transaction<'env>,
    /// The database this cursor operates on
    dbi: Dbi,
    dupsort: bool,
    state: CursorState,
}

impl<'txn, 'env> Cursor<'txn, 'env> {
    pub(crate) fn new(txn: &'txn Transaction<'env>, dbi: Dbi) -> Result<Self> {
        txn.check()?;
        let info = txn.db_info(dbi)?;
        Ok(Cursor {
            txn,
            dbi,
            dupsort: info.is_dupsort(),
            state: CursorState::Unset,
        })
    }

    fn tree(&self) -> Result<Tree<'txn, 'env>> {
        self.txn.check()?;
        Ok(Tree::new(self.txn, self.dbi))
    }

    fn info(&self) -> Result<DbInfo> {
        self.tree()?.info()
    }

    fn target<'a>(&self, key: &'a [u8], val: ValBound<'a>) -> Target<'a> {
        Target::new(key, val, self.dupsort)
    }

    fn set_at(&mut self, stack: Stack) -> Result<()> {
        let (key, value) = self.tree()?.entry_at(&stack)?;
        self.state = CursorState::At(Position {
            stack,
            key,
            value,
            generation: self.txn.generation(),
            deleted: false,
        });
        Ok(())
    }

    /// Bring the cached entry up to date with writes made since the cursor
    /// moved. A deleted entry keeps its key and value for re-anchoring.
    fn refresh(&mut self) -> Result<()> {
        let Some(pos) = self.position() else {
            return Ok(());
        };
        if pos.generation == self.txn.generation() {
            return Ok(());
        }
        match self.anchor(pos)? {
            Anchor::Exact(stack) => self.set_at(stack),
            Anchor::Gone(_) => {
                if let CursorState::At(pos) = &mut self.state {
                    pos.deleted = true;
                }
                Ok(())
            }
        }
    }

    fn position(&self) -> Option<&Position> {
        match &self.state {
            CursorState::At(pos) => Some(pos),
            _ => None,
        }
    }

    /// Locate the current entry in the tree as it is now.
    fn anchor(&self, pos: &Position) -> Result<Anchor> {
        if pos.generation == self.txn.generation() {
            return Ok(Anchor::Exact(pos.stack.clone()));
        }
        let tree = self.tree()?;
        let info = tree.info()?;
        let target = self.target(&pos.key, ValBound::Exact(&pos.value));
        match tree.seek(&info, &target)? {
            Some(stack) => {
                let (key, value) = tree.entry_at(&stack)?;
                if target.cmp_node(&key, &value) == Ordering::Equal {
                    Ok(Anchor::Exact(stack))
                } else {
                    Ok(Anchor::Gone(Some(stack)))
                }
            }
            None => Ok(Anchor::Gone(None)),
        }
    }

    /// The entry after the current one
    fn following(&self, pos: &Position) -> Result<Option<Stack>> {
        match self.anchor(pos)? {
            Anchor::Exact(mut stack) => Ok(self.tree()?.step_next(&mut stack)?.then_some(stack)),
            Anchor::Gone(next) => Ok(next),
        }
    }

    /// The entry before the current one
    fn preceding(&self, pos: &Position) -> Result<Option<Stack>> {
        let tree = self.tree()?;
        match self.anchor(pos)? {
            Anchor::Exact(mut stack) | Anchor::Gone(Some(mut stack)) => Ok(tree.step_prev(&mut stack)?.then_some(stack)),
            Anchor::Gone(None) => tree.last(&tree.info()?),
        }
    }

    // --- absolute positioning ---

    /// Position at the first entry
    pub fn first(&mut self) -> Result<bool> {
        let info = self.info()?;
        match self.tree()?.first(&info)? {
            Some(stack) => self.set_at(stack).map(|_| true),
            None => {
                self.state = CursorState::Unset;
                Ok(false)
            }
        }
    }

    /// Position at the last entry
    pub fn last(&mut self) -> Result<bool> {
        let info = self.info()?;
        match self.tree()?.last(&info)? {
            Some(stack) => self.set_at(stack).map(|_| true),
            None => {
                self.state = CursorState::Unset;
                Ok(false)
            }
        }
    }

    /// Position at the first entry of `key`.
    ///
    /// Fails with `NotFound` if the key is absent; the cursor does not move.
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        let tree = self.tree()?;
        let info = tree.info()?;
        let Some(stack) = tree.seek(&info, &self.target(key, ValBound::Min))? else {
            return Err(Error::NotFound);
        };
        if tree.key_at(&stack)? != key {
            return Err(Error::NotFound);
        }
        self.set_at(stack)
    }

    /// Position at the first entry whose key is not below `key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<bool> {
        let tree = self.tree()?;
        let info = tree.info()?;
        match tree.seek(&info, &self.target(key, ValBound::Min))? {
            Some(stack) => self.set_at(stack).map(|_| true),
            None => {
                self.state = CursorState::Off { front: false };
                Ok(false)
            }
        }
    }

    /// Position at the exact `(key, data)` entry.
    ///
    /// Fails with `NotFound` if it is absent; the cursor does not move.
    pub fn get_both(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        let tree = self.tree()?;
        let info = tree.info()?;
        let target = self.target(key, ValBound::Exact(data));
        let Some(stack) = tree.seek(&info, &target)? else {
            return Err(Error::NotFound);
        };
        let (found_key, found_value) = tree.entry_at(&stack)?;
        if found_key != key || found_value != data {
            return Err(Error::NotFound);
        }
        self.set_at(stack)
    }

    /// Position at the first value of `key` not below `data`.
    /// The cursor does not move if there is none.
    pub fn get_both_range(&mut self, key: &[u8], data: &[u8]) -> Result<bool> {
        let tree = self.tree()?;
        let info = tree.info()?;
        let target = self.target(key, ValBound::Exact(data));
        let Some(stack) = tree.seek(&info, &target)? else {
            return Ok(false);
        };
        let (found_key, found_value) = tree.entry_at(&stack)?;
        if found_key != key || found_value.as_slice() < data {
            return Ok(false);
        }
        self.set_at(stack).map(|_| true)
    }

    // --- relative movement ---

    /// Move to the next entry
    pub fn next(&mut self) -> Result<bool> {
        let next = match &self.state {
            CursorState::Unset | CursorState::Off { front: true } => return self.first(),
            CursorState::Off { front: false } => return Ok(false),
            CursorState::At(pos) => self.following(pos)?,
        };
        match next {
            Some(stack) => self.set_at(stack).map(|_| true),
            None => {
                self.state = CursorState::Off { front: false };
                Ok(false)
            }
        }
    }

    /// Move to the previous entry
    pub fn prev(&mut self) -> Result<bool> {
        let prev = match &self.state {
            CursorState::Unset | CursorState::Off { front: false } => return self.last(),
            CursorState::Off { front: true } => return Ok(false),
            CursorState::At(pos) => self.preceding(pos)?,
        };
        match prev {
            Some(stack) => self.set_at(stack).map(|_| true),
            None => {
                self.state = CursorState::Off { front: true };
                Ok(false)
            }
        }
    }

    // --- duplicates ---
    //
    // Outside DUPSORT databases these leave the cursor where it is and
    // report whether it is positioned.

    fn current_key(&self) -> Option<Vec<u8>> {
        self.position().map(|pos| pos.key.clone())
    }

    /// Move to the first value of the current key
    pub fn first_dup(&mut self) -> Result<bool> {
        let Some(key) = self.current_key().filter(|_| self.dupsort) else {
            return Ok(self.is_positioned());
        };
        let tree = self.tree()?;
        let info = tree.info()?;
        match tree.seek(&info, &self.target(&key, ValBound::Min))? {
            Some(stack) if tree.key_at(&stack)? == key => self.set_at(stack).map(|_| true),
            _ => Ok(false),
        }
    }

    /// Move to the last value of the current key
    pub fn last_dup(&mut self) -> Result<bool> {
        let Some(key) = self.current_key().filter(|_| self.dupsort) else {
            return Ok(self.is_positioned());
        };
        let tree = self.tree()?;
        let info = tree.info()?;
        let stack = match tree.seek(&info, &self.target(&key, ValBound::Max))? {
            Some(mut stack) => tree.step_prev(&mut stack)?.then_some(stack),
            None => tree.last(&info)?,
        };
        match stack {
            Some(stack) if tree.key_at(&stack)? == key => self.set_at(stack).map(|_| true),
            _ => Ok(false),
        }
    }

    /// Move to the next value of the current key. Past the last value the
    /// cursor stays where it is.
    pub fn next_dup(&mut self) -> Result<bool> {
        let Some(pos) = self.position().filter(|_| self.dupsort) else {
            return Ok(self.is_positioned());
        };
        let key = pos.key.clone();
        match self.following(pos)? {
            Some(stack) if self.tree()?.key_at(&stack)? == key => self.set_at(stack).map(|_| true),
            _ => Ok(false),
        }
    }

    /// Move to the previous value of the current key. Before the first
    /// value the cursor stays where it is.
    pub fn prev_dup(&mut self) -> Result<bool> {
        let Some(pos) = self.position().filter(|_| self.dupsort) else {
            return Ok(self.is_positioned());
        };
        let key = pos.key.clone();
        match self.preceding(pos)? {
            Some(stack) if self.tree()?.key_at(&stack)? == key => self.set_at(stack).map(|_| true),
            _ => Ok(false),
        }
    }

    /// Move to the first value of the next key
    pub fn next_nodup(&mut self) -> Result<bool> {
        let Some(key) = self.current_key().filter(|_| self.dupsort) else {
            return Ok(self.is_positioned());
        };
        let tree = self.tree()?;
        let info = tree.info()?;
        match tree.seek(&info, &self.target(&key, ValBound::Max))? {
            Some(stack) => self.set_at(stack).map(|_| true),
            None => {
                self.state = CursorState::Off { front: false };
                Ok(false)
            }
        }
    }

    /// Move to the last value of the previous key
    pub fn prev_nodup(&mut self) -> Result<bool> {
        let Some(key) = self.current_key().filter(|_| self.dupsort) else {
            return Ok(self.is_positioned());
        };
        let tree = self.tree()?;
        let info = tree.info()?;
        let stack = match tree.seek(&info, &self.target(&key, ValBound::Min))? {
            Some(mut stack) => tree.step_prev(&mut stack)?.then_some(stack),
            None => tree.last(&info)?,
        };
        match stack {
            Some(stack) => self.set_at(stack).map(|_| true),
            None => {
                self.state = CursorState::Off { front: true };
                Ok(false)
            }
        }
    }

    /// Number of values under the current key; 0 when unpositioned.
    pub fn count(&self) -> Result<u64> {
        let Some(pos) = self.position() else {
            return Ok(0);
        };
        let tree = self.tree()?;
        tree.dup_count(&tree.info()?, &pos.key)
    }

    // --- current entry ---

    pub fn is_positioned(&self) -> bool {
        matches!(&self.state, CursorState::At(pos) if !pos.deleted)
    }

    /// Key and value at the cursor.
    ///
    /// If the transaction changed since the cursor moved, the entry is read
    /// again first, so an overwrite through another handle shows up here.
    /// Both slices are empty when the cursor is unpositioned or its entry
    /// was deleted; movement then continues from where the entry was. A
    /// read error also empties the cursor, and the next call reports it.
    pub fn item(&mut self) -> (&[u8], &[u8]) {
        if self.refresh().is_err() {
            self.state = CursorState::Unset;
        }
        match &self.state {
            CursorState::At(pos) if !pos.deleted => (&pos.key, &pos.value),
            _ => (&[], &[]),
        }
    }

    pub fn key(&mut self) -> &[u8] {
        self.item().0
    }

    pub fn value(&mut self) -> &[u8] {
        self.item().1
    }

    /// Re-read the current entry. Returns false, leaving the cursor in
    /// place, if the entry was deleted since the cursor moved there.
    pub fn get_current(&mut self) -> Result<bool> {
        self.refresh()?;
        Ok(self.is_positioned())
    }

    /// Perform `op` and return the entry the cursor lands on.
    ///
    /// `key` and `data` are only read by the operations that take them. A
    /// miss is `Ok(None)` rather than `NotFound`.
    pub fn get(&mut self, op: CursorOp, key: Option<&[u8]>, data: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let key = key.unwrap_or(&[]);
        let data = data.unwrap_or(&[]);
        let found = |r: Result<()>| match r {
            Ok(()) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        };
        let positioned = match op {
            CursorOp::First => self.first()?,
            CursorOp::Last => self.last()?,
            CursorOp::Next => self.next()?,
            CursorOp::Prev => self.prev()?,
            CursorOp::SetKey => found(self.set_key(key))?,
            CursorOp::SetRange => self.set_range(key)?,
            CursorOp::GetBoth => found(self.get_both(key, data))?,
            CursorOp::GetBothRange => self.get_both_range(key, data)?,
            CursorOp::GetCurrent => self.get_current()?,
            CursorOp::FirstDup => self.first_dup()?,
            CursorOp::LastDup => self.last_dup()?,
            CursorOp::NextDup => self.next_dup()?,
            CursorOp::PrevDup => self.prev_dup()?,
            CursorOp::NextNoDup => self.next_nodup()?,
            CursorOp::PrevNoDup => self.prev_nodup()?,
        };
        if !positioned {
            return Ok(None);
        }
        let (key, value) = self.item();
        Ok(Some((key.to_vec(), value.to_vec())))
    }

    // --- writes ---

    /// Store a key/value pair and position the cursor on it.
    pub fn put(&mut self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        let tree = self.tree()?;
        self.txn.poison(tree.put(key, data, flags))?;
        let info = tree.info()?;
        let target = self.target(key, ValBound::Exact(data));
        let stack = tree.search(&info, &target)?.ok_or_else(|| self.txn.corrupted())?;
        self.set_at(stack)
    }

    /// Delete the entry at the cursor and move to the one after it.
    pub fn del(&mut self) -> Result<()> {
        let Some(pos) = self.position() else {
            return Err(Error::NotFound);
        };
        if let Anchor::Gone(_) = self.anchor(pos)? {
            return Err(Error::NotFound);
        }
        let (key, value) = (pos.key.clone(), pos.value.clone());
        let tree = self.tree()?;
        let data = if self.dupsort { Some(value.as_slice()) } else { None };
        self.txn.poison(tree.del(&key, data))?;
        let info = tree.info()?;
        match tree.seek(&info, &self.target(&key, ValBound::Exact(&value)))? {
            Some(stack) => self.set_at(stack),
            None => {
                self.state = CursorState::Off { front: false };
                Ok(())
            }
        }
    }

    // --- iteration ---

    /// Iterate over every entry from the first
    pub fn iter(&mut self) -> Iter<'_, 'txn, 'env> {
        Iter::new(self, Start::First)
    }

    /// Iterate from the first entry whose key is not below `key`
    pub fn iter_from(&mut self, key: &[u8]) -> Iter<'_, 'txn, 'env> {
        Iter::new(self, Start::From(key.to_vec()))
    }

    /// Iterate over the values of `key`
    pub fn iter_dup_of(&mut self, key: &[u8]) -> Iter<'_, 'txn, 'env> {
        Iter::new(self, Start::DupOf(key.to_vec()))
    }
}

enum Start {
    First,
    From(Vec<u8>),
    DupOf(Vec<u8>),
}

/// Iterator over cursor entries, yielding owned pairs
pub struct Iter<'c, 'txn, 'env> {
    cursor: &'c mut Cursor<'txn, 'env>,
    start: Option<Start>,
    dups_only: bool,
    done: bool,
}

impl<'c, 'txn, 'env> Iter<'c, 'txn, 'env> {
    fn new(cursor: &'c mut Cursor<'txn, 'env>, start: Start) -> Self {
        let dups_only = matches!(start, Start::DupOf(_));
        Iter {
            cursor,
            start: Some(start),
            dups_only,
            done: false,
        }
    }

    fn advance(&mut self) -> Result<bool> {
        match self.start.take() {
            Some(Start::First) => self.cursor.first(),
            Some(Start::From(key)) => self.cursor.set_range(&key),
            Some(Start::DupOf(key)) => match self.cursor.set_key(&key) {
                Ok(()) => Ok(true),
                Err(Error::NotFound) => Ok(false),
                Err(e) => Err(e),
            },
            None if self.dups_only && !self.cursor.dupsort => Ok(false),
            None if self.dups_only => self.cursor.next_dup(),
            None => self.cursor.next(),
        }
    }
}

impl Iterator for Iter<'_, '_, '_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(true) => {
                let (key, value) = self.cursor.item();
                Some(Ok((key.to_vec(), value.to_vec())))
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
