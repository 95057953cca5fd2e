//! Copy-on-write B+tree operations over a transaction's pages.
//!
//! Entries live only in leaves. In DUPSORT trees every `(key, value)` pair is
//! its own leaf entry, ordered by key and then by value, and branch
//! separators carry both parts. Any page a write touches is first copied to
//! a fresh page number, so the committed tree stays intact for readers.

use std::cmp::Ordering;
use std::mem;

use log::trace;

use crate::constants::{NodeFlags, WriteFlags, MAX_KEY_SIZE};
use crate::error::{Error, Result};
use crate::meta::DbInfo;
use crate::page::{
    fits_inline, overflow_pages, BranchNode, LeafData, LeafDataRef, LeafNode, Page, PageRef,
    FILL_THRESHOLD, PAGE_PAYLOAD, SLOT_SIZE,
};
use crate::transaction::Transaction;
use crate::types::{Dbi, Pgno, P_INVALID};
use crate::value::Lookup;

/// Path from the root to a leaf entry, one `(page, index)` per level.
/// Branch levels hold the child index taken.
pub(crate) type Stack = Vec<(Pgno, usize)>;

/// How the value part of a [`Target`] compares in DUPSORT trees
#[derive(Debug, Clone, Copy)]
pub(crate) enum ValBound<'a> {
    /// Before every value of the key
    Min,
    Exact(&'a [u8]),
    /// After every value of the key
    Max,
}

/// A search position in entry order
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    key: &'a [u8],
    val: ValBound<'a>,
    dupsort: bool,
}

impl<'a> Target<'a> {
    pub fn new(key: &'a [u8], val: ValBound<'a>, dupsort: bool) -> Self {
        Target { key, val, dupsort }
    }

    /// Order of the entry `(key, val)` relative to the target.
    pub fn cmp_node(&self, key: &[u8], val: &[u8]) -> Ordering {
        match key.cmp(self.key) {
            Ordering::Equal => match self.val {
                ValBound::Min if self.dupsort => Ordering::Greater,
                ValBound::Min => Ordering::Equal,
                ValBound::Exact(v) if self.dupsort => val.cmp(v),
                ValBound::Exact(_) => Ordering::Equal,
                ValBound::Max => Ordering::Less,
            },
            other => other,
        }
    }
}

/// First slot of a leaf whose entry is not below the target
fn lower_bound(page: &PageRef<'_>, target: &Target<'_>) -> usize {
    let (mut lo, mut hi) = (0, page.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if target.cmp_node(page.key(mid), page.sort_val(mid)) == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Last child of a branch whose separator is not above the target
fn child_index(page: &PageRef<'_>, target: &Target<'_>) -> usize {
    let (mut lo, mut hi) = (1, page.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if target.cmp_node(page.key(mid), page.sort_val(mid)) == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo - 1
}

/// Split an overfull page in two, keeping the left half in place.
///
/// Returns the separator for the parent and the new right page. The split
/// point balances byte usage while keeping both halves within a page.
fn split_page(page: &mut Page, dupsort: bool) -> Option<(Vec<u8>, Vec<u8>, Page)> {
    let sizes: Vec<usize> = match page {
        Page::Leaf(nodes) => nodes.iter().map(|n| n.size() + SLOT_SIZE).collect(),
        Page::Branch(nodes) => nodes.iter().map(|n| n.size() + SLOT_SIZE).collect(),
        Page::Overflow(_) => return None,
    };
    let total: usize = sizes.iter().sum();
    let mut left = 0;
    let mut best: Option<(usize, usize)> = None;
    for (i, size) in sizes.iter().enumerate().take(sizes.len().saturating_sub(1)) {
        left += size;
        let right = total - left;
        if left <= PAGE_PAYLOAD && right <= PAGE_PAYLOAD {
            let skew = left.abs_diff(right);
            if best.map_or(true, |(_, s)| skew < s) {
                best = Some((i + 1, skew));
            }
        }
    }
    let (at, _) = best?;
    match page {
        Page::Leaf(nodes) => {
            let right = nodes.split_off(at);
            let first = &right[0];
            let val = if dupsort { first.sort_val().to_vec() } else { Vec::new() };
            Some((first.key.clone(), val, Page::Leaf(right)))
        }
        Page::Branch(nodes) => {
            let mut right = nodes.split_off(at);
            let key = mem::take(&mut right[0].key);
            let val = mem::take(&mut right[0].val);
            Some((key, val, Page::Branch(right)))
        }
        Page::Overflow(_) => None,
    }
}

/// Remove a branch node; the new first node loses its separator.
fn remove_branch(nodes: &mut Vec<BranchNode>, index: usize) {
    nodes.remove(index);
    if index == 0 {
        if let Some(first) = nodes.first_mut() {
            first.key.clear();
            first.val.clear();
        }
    }
}

fn count_page(info: &mut DbInfo, leaf: bool, added: bool) {
    let counter = if leaf { &mut info.leaf_pages } else { &mut info.branch_pages };
    *counter = if added { *counter + 1 } else { counter.saturating_sub(1) };
}

/// One database tree inside a transaction
pub(crate) struct Tree<'t, 'env> {
    txn: &'t Transaction<'env>,
    dbi: Dbi,
}

impl<'t, 'env> Tree<'t, 'env> {
    pub fn new(txn: &'t Transaction<'env>, dbi: Dbi) -> Self {
        Tree { txn, dbi }
    }

    pub fn info(&self) -> Result<DbInfo> {
        self.txn.db_info(self.dbi)
    }

    // --- navigation ---

    /// Descend to the leaf that holds (or would hold) `target`.
    /// The leaf index may equal the leaf's length.
    pub fn search(&self, info: &DbInfo, target: &Target<'_>) -> Result<Option<Stack>> {
        if info.root == P_INVALID {
            return Ok(None);
        }
        let depth = usize::from(info.depth);
        let mut stack = Stack::with_capacity(depth);
        let mut pgno = info.root;
        loop {
            let step = self.txn.with_page(pgno, |p| {
                if p.len() == 0 {
                    None
                } else if p.is_leaf() {
                    Some((true, lower_bound(&p, target), P_INVALID))
                } else {
                    let i = child_index(&p, target);
                    Some((false, i, p.child(i)))
                }
            })?;
            let (leaf, idx, child) = step.ok_or_else(|| self.txn.corrupted())?;
            stack.push((pgno, idx));
            // Leaves sit exactly at the recorded depth
            if leaf != (stack.len() == depth) {
                return Err(self.txn.corrupted());
            }
            if leaf {
                return Ok(Some(stack));
            }
            pgno = child;
        }
    }

    /// Position at the first entry not below `target`.
    pub fn seek(&self, info: &DbInfo, target: &Target<'_>) -> Result<Option<Stack>> {
        let Some(mut stack) = self.search(info, target)? else {
            return Ok(None);
        };
        let (leaf, idx) = self.leaf_slot(&stack)?;
        let len = self.page_len(leaf)?;
        if idx < len {
            return Ok(Some(stack));
        }
        if let Some(last) = stack.last_mut() {
            last.1 = len - 1;
        }
        if self.step_next(&mut stack)? {
            Ok(Some(stack))
        } else {
            Ok(None)
        }
    }

    pub fn first(&self, info: &DbInfo) -> Result<Option<Stack>> {
        self.edge(info, false)
    }

    pub fn last(&self, info: &DbInfo) -> Result<Option<Stack>> {
        self.edge(info, true)
    }

    fn edge(&self, info: &DbInfo, rightmost: bool) -> Result<Option<Stack>> {
        if info.root == P_INVALID {
            return Ok(None);
        }
        let mut stack = Stack::with_capacity(usize::from(info.depth));
        self.descend(&mut stack, info.root, rightmost, usize::from(info.depth))?;
        Ok(Some(stack))
    }

    fn descend(&self, stack: &mut Stack, mut pgno: Pgno, rightmost: bool, depth: usize) -> Result<()> {
        loop {
            let step = self.txn.with_page(pgno, |p| {
                let n = p.len();
                if n == 0 {
                    return None;
                }
                let i = if rightmost { n - 1 } else { 0 };
                let child = if p.is_leaf() { P_INVALID } else { p.child(i) };
                Some((p.is_leaf(), i, child))
            })?;
            let (leaf, idx, child) = step.ok_or_else(|| self.txn.corrupted())?;
            stack.push((pgno, idx));
            if leaf != (stack.len() == depth) {
                return Err(self.txn.corrupted());
            }
            if leaf {
                return Ok(());
            }
            pgno = child;
        }
    }

    /// Move to the following entry. Leaves `stack` untouched at the end.
    pub fn step_next(&self, stack: &mut Stack) -> Result<bool> {
        let depth = stack.len();
        for level in (0..depth).rev() {
            let (pgno, idx) = stack[level];
            if idx + 1 < self.page_len(pgno)? {
                stack[level].1 = idx + 1;
                if level + 1 < depth {
                    let child = self.child_at(pgno, idx + 1)?;
                    stack.truncate(level + 1);
                    self.descend(stack, child, false, depth)?;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Move to the preceding entry. Leaves `stack` untouched at the start.
    pub fn step_prev(&self, stack: &mut Stack) -> Result<bool> {
        let depth = stack.len();
        for level in (0..depth).rev() {
            let (pgno, idx) = stack[level];
            if idx > 0 {
                stack[level].1 = idx - 1;
                if level + 1 < depth {
                    let child = self.child_at(pgno, idx - 1)?;
                    stack.truncate(level + 1);
                    self.descend(stack, child, true, depth)?;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn leaf_slot(&self, stack: &Stack) -> Result<(Pgno, usize)> {
        stack.last().copied().ok_or_else(|| self.txn.corrupted())
    }

    fn page_len(&self, pgno: Pgno) -> Result<usize> {
        self.txn.with_page(pgno, |p| p.len())
    }

    fn child_at(&self, pgno: Pgno, idx: usize) -> Result<Pgno> {
        let child = self.txn.with_page(pgno, |p| (!p.is_leaf() && idx < p.len()).then(|| p.child(idx)))?;
        child.ok_or_else(|| self.txn.corrupted())
    }

    /// Key and value at the leaf slot of `stack`
    pub fn entry_at(&self, stack: &Stack) -> Result<(Vec<u8>, Vec<u8>)> {
        let (key, _, data) = self.node_at(stack)?;
        let value = self.txn.read_value(data.borrowed())?;
        Ok((key, value))
    }

    pub fn key_at(&self, stack: &Stack) -> Result<Vec<u8>> {
        let (leaf, idx) = self.leaf_slot(stack)?;
        let key = self.txn.with_page(leaf, |p| (idx < p.len()).then(|| p.key(idx).to_vec()))?;
        key.ok_or_else(|| self.txn.corrupted())
    }

    fn node_at(&self, stack: &Stack) -> Result<(Vec<u8>, NodeFlags, LeafData)> {
        let (leaf, idx) = self.leaf_slot(stack)?;
        let node = self.txn.with_page(leaf, |p| {
            (p.is_leaf() && idx < p.len()).then(|| (p.key(idx).to_vec(), p.leaf_flags(idx), p.leaf_data(idx).to_owned()))
        })?;
        node.ok_or_else(|| self.txn.corrupted())
    }

    /// The leaf entry at `stack` if it matches `target` exactly
    fn exact_node(&self, stack: &Stack, target: &Target<'_>) -> Result<Option<(NodeFlags, LeafData)>> {
        let (leaf, idx) = self.leaf_slot(stack)?;
        self.txn.with_page(leaf, |p| {
            (idx < p.len() && target.cmp_node(p.key(idx), p.sort_val(idx)) == Ordering::Equal)
                .then(|| (p.leaf_flags(idx), p.leaf_data(idx).to_owned()))
        })
    }

    // --- point reads ---

    /// First value stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let info = self.info()?;
        let target = Target::new(key, ValBound::Min, info.is_dupsort());
        let Some(stack) = self.seek(&info, &target)? else {
            return Ok(None);
        };
        let (found, value) = self.entry_at(&stack)?;
        Ok((found == key).then_some(value))
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Lookup>> {
        let info = self.info()?;
        if !info.is_dupsort() {
            return Ok(self.get(key)?.map(Lookup::Single));
        }
        let values = self.values_of(&info, key)?;
        Ok((!values.is_empty()).then_some(Lookup::Duplicates(values)))
    }

    fn values_of(&self, info: &DbInfo, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let target = Target::new(key, ValBound::Min, info.is_dupsort());
        let mut values = Vec::new();
        let Some(mut stack) = self.seek(info, &target)? else {
            return Ok(values);
        };
        loop {
            let (found, value) = self.entry_at(&stack)?;
            if found != key {
                break;
            }
            values.push(value);
            if !info.is_dupsort() || !self.step_next(&mut stack)? {
                break;
            }
        }
        Ok(values)
    }

    /// Number of values stored under `key`
    pub fn dup_count(&self, info: &DbInfo, key: &[u8]) -> Result<u64> {
        let target = Target::new(key, ValBound::Min, info.is_dupsort());
        let Some(mut stack) = self.seek(info, &target)? else {
            return Ok(0);
        };
        let mut count = 0;
        while self.key_at(&stack)? == key {
            count += 1;
            if !info.is_dupsort() || !self.step_next(&mut stack)? {
                break;
            }
        }
        Ok(count)
    }

    /// Record of a named database stored in this (main) tree.
    ///
    /// A plain key with the same name is `Incompatible`.
    pub fn find_record(&self, info: &DbInfo, name: &[u8]) -> Result<Option<DbInfo>> {
        let target = Target::new(name, ValBound::Min, false);
        let Some(stack) = self.search(info, &target)? else {
            return Ok(None);
        };
        match self.exact_node(&stack, &target)? {
            None => Ok(None),
            Some((flags, LeafData::Inline(bytes))) if flags.contains(NodeFlags::SUBDATA) => {
                DbInfo::decode(&bytes).map(Some)
            }
            Some((flags, _)) if flags.contains(NodeFlags::SUBDATA) => Err(Error::Corrupted),
            Some(_) => Err(Error::Incompatible),
        }
    }

    // --- writes ---

    pub fn put(&self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.put_node(key, data, flags, NodeFlags::empty())
    }

    /// Store the record of a named database in this (main) tree.
    pub fn put_record(&self, name: &[u8], info: &DbInfo) -> Result<()> {
        self.put_node(name, &info.encode(), WriteFlags::empty(), NodeFlags::SUBDATA)
    }

    fn put_node(&self, key: &[u8], data: &[u8], flags: WriteFlags, node_flags: NodeFlags) -> Result<()> {
        if self.txn.is_readonly() {
            return Err(Error::TxnReadOnly);
        }
        let mut info = self.info()?;
        let dupsort = info.is_dupsort();
        if key.is_empty() || key.len() > MAX_KEY_SIZE || data.len() > u32::MAX as usize {
            return Err(Error::BadValSize);
        }
        if dupsort && data.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize);
        }
        let target = Target::new(key, ValBound::Exact(data), dupsort);

        if flags.contains(WriteFlags::APPEND) {
            if let Some(stack) = self.last(&info)? {
                let (k, v) = self.entry_at(&stack)?;
                if target.cmp_node(&k, &v) != Ordering::Less {
                    return Err(Error::KeyExist);
                }
            }
        }

        // Decide the outcome before touching any page
        let path = self.search(&info, &target)?;
        let mut replaced = None;
        if let Some(stack) = &path {
            match self.exact_node(stack, &target)? {
                Some((existing, old)) => {
                    if existing.contains(NodeFlags::SUBDATA) != node_flags.contains(NodeFlags::SUBDATA) {
                        return Err(Error::Incompatible);
                    }
                    if flags.contains(WriteFlags::NOOVERWRITE)
                        || (dupsort && flags.contains(WriteFlags::NODUPDATA))
                    {
                        return Err(Error::KeyExist);
                    }
                    if dupsort {
                        return Ok(());
                    }
                    replaced = Some(old);
                }
                None if dupsort && flags.contains(WriteFlags::NOOVERWRITE) => {
                    if self.dup_count(&info, key)? > 0 {
                        return Err(Error::KeyExist);
                    }
                }
                None => {}
            }
        }

        let run = if fits_inline(key.len(), data.len()) {
            0
        } else {
            overflow_pages(data.len())
        };
        self.txn.ensure_room(2 * u64::from(info.depth) + 1, run)?;

        let (node_flags, node_data) = if run == 0 {
            (node_flags, LeafData::Inline(data.to_vec()))
        } else {
            let pgno = self.txn.alloc_page(Page::Overflow(data.to_vec()))?;
            info.overflow_pages += run;
            (
                node_flags | NodeFlags::BIGDATA,
                LeafData::Overflow {
                    pgno,
                    len: data.len() as u32,
                },
            )
        };
        let node = LeafNode {
            flags: node_flags,
            key: key.to_vec(),
            data: node_data,
        };

        let Some(stack) = path else {
            info.root = self.txn.alloc_page(Page::Leaf(vec![node]))?;
            info.depth = 1;
            info.leaf_pages = 1;
            info.entries = 1;
            self.txn.set_db_info(self.dbi, info);
            return Ok(());
        };

        let stack = self.touch_path(&mut info, &stack)?;
        let (leaf, idx) = self.leaf_slot(&stack)?;
        match replaced {
            Some(old) => {
                if let LeafData::Overflow { pgno, len } = old {
                    let span = overflow_pages(len as usize);
                    self.txn.free_page(pgno, span)?;
                    info.overflow_pages = info.overflow_pages.saturating_sub(span);
                }
                self.with_leaf_mut(leaf, |nodes| nodes[idx] = node)?;
            }
            None => {
                self.with_leaf_mut(leaf, |nodes| nodes.insert(idx, node))?;
                info.entries += 1;
            }
        }
        self.split_overfull(&mut info, &stack)?;
        self.txn.set_db_info(self.dbi, info);
        Ok(())
    }

    /// Delete `key`: one exact pair when `data` is given (which must match
    /// the stored value outside DUPSORT trees), otherwise every value.
    pub fn del(&self, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        self.del_node(key, data, false)
    }

    /// Remove the record of a named database from this (main) tree.
    pub fn del_record(&self, name: &[u8]) -> Result<()> {
        self.del_node(name, None, true)
    }

    fn del_node(&self, key: &[u8], data: Option<&[u8]>, record: bool) -> Result<()> {
        if self.txn.is_readonly() {
            return Err(Error::TxnReadOnly);
        }
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize);
        }
        let mut info = self.info()?;
        let dupsort = info.is_dupsort();

        if dupsort && data.is_none() {
            let count = self.dup_count(&info, key)?;
            if count == 0 {
                return Err(Error::NotFound);
            }
            self.ensure_delete_room(&info, count)?;
            let target = Target::new(key, ValBound::Min, true);
            for _ in 0..count {
                let stack = self.seek(&info, &target)?.ok_or_else(|| self.txn.corrupted())?;
                self.delete_at(&mut info, &stack)?;
            }
        } else {
            let bound = data.map_or(ValBound::Min, ValBound::Exact);
            let target = Target::new(key, bound, dupsort);
            let stack = self.search(&info, &target)?.ok_or(Error::NotFound)?;
            let (flags, stored) = self.exact_node(&stack, &target)?.ok_or(Error::NotFound)?;
            if flags.contains(NodeFlags::SUBDATA) != record {
                return Err(Error::Incompatible);
            }
            if let (false, Some(expected)) = (dupsort, data) {
                if self.txn.read_value(stored.borrowed())? != expected {
                    return Err(Error::NotFound);
                }
            }
            self.ensure_delete_room(&info, 1)?;
            self.delete_at(&mut info, &stack)?;
        }
        self.txn.set_db_info(self.dbi, info);
        Ok(())
    }

    /// Deletes allocate only when copying pages; each committed page is
    /// copied at most once per transaction.
    fn ensure_delete_room(&self, info: &DbInfo, deletes: u64) -> Result<()> {
        let per_delete = 2 * u64::from(info.depth);
        let pages = deletes
            .saturating_mul(per_delete)
            .min(info.branch_pages + info.leaf_pages);
        self.txn.ensure_room(pages, 0)
    }

    fn delete_at(&self, info: &mut DbInfo, stack: &Stack) -> Result<()> {
        let stack = self.touch_path(info, stack)?;
        let (leaf, idx) = self.leaf_slot(&stack)?;
        let removed = self
            .with_leaf_mut(leaf, |nodes| (idx < nodes.len()).then(|| nodes.remove(idx)))?
            .ok_or_else(|| self.txn.corrupted())?;
        if let LeafData::Overflow { pgno, len } = removed.data {
            let span = overflow_pages(len as usize);
            self.txn.free_page(pgno, span)?;
            info.overflow_pages = info.overflow_pages.saturating_sub(span);
        }
        info.entries = info.entries.saturating_sub(1);
        self.rebalance(info, &stack)
    }

    /// Free every page of the tree and leave it empty.
    pub fn clear(&self) -> Result<DbInfo> {
        if self.txn.is_readonly() {
            return Err(Error::TxnReadOnly);
        }
        let info = self.info()?;
        if info.root != P_INVALID {
            self.free_subtree(info.root, usize::from(info.depth))?;
        }
        Ok(DbInfo::empty(info.flags))
    }

    fn free_subtree(&self, pgno: Pgno, depth: usize) -> Result<()> {
        if depth == 0 {
            return Err(self.txn.corrupted());
        }
        let (children, overflows) = self.txn.with_page(pgno, |p| {
            let mut children = Vec::new();
            let mut overflows = Vec::new();
            for i in 0..p.len() {
                if p.is_leaf() {
                    if let LeafDataRef::Overflow { pgno, len } = p.leaf_data(i) {
                        overflows.push((pgno, len));
                    }
                } else {
                    children.push(p.child(i));
                }
            }
            (children, overflows)
        })?;
        for (run, len) in overflows {
            self.txn.free_page(run, overflow_pages(len as usize))?;
        }
        for child in children {
            self.free_subtree(child, depth - 1)?;
        }
        self.txn.free_page(pgno, 1)
    }

    // --- structure maintenance ---

    /// Copy every page on the path and relink parents to the copies.
    fn touch_path(&self, info: &mut DbInfo, stack: &Stack) -> Result<Stack> {
        let mut touched = Stack::with_capacity(stack.len());
        for &(pgno, idx) in stack {
            let new = self.txn.touch(pgno)?;
            match touched.last() {
                None => info.root = new,
                Some(&(parent, pidx)) if new != pgno => {
                    self.with_branch_mut(parent, |nodes| nodes[pidx].child = new)?;
                }
                Some(_) => {}
            }
            touched.push((new, idx));
        }
        Ok(touched)
    }

    fn split_overfull(&self, info: &mut DbInfo, stack: &Stack) -> Result<()> {
        let dupsort = info.is_dupsort();
        for level in (0..stack.len()).rev() {
            let pgno = stack[level].0;
            if self.txn.dirty_mut(pgno, |p| p.fits())? {
                return Ok(());
            }
            let (key, val, right) = self
                .txn
                .dirty_mut(pgno, |p| split_page(p, dupsort))?
                .ok_or_else(|| self.txn.corrupted())?;
            let leaf = right.is_leaf();
            let right = self.txn.alloc_page(right)?;
            count_page(info, leaf, true);
            trace!("split page {} into {} at level {}", pgno, right, level);

            let sep = BranchNode { key, val, child: right };
            if level == 0 {
                let first = BranchNode {
                    key: Vec::new(),
                    val: Vec::new(),
                    child: pgno,
                };
                info.root = self.txn.alloc_page(Page::Branch(vec![first, sep]))?;
                info.depth += 1;
                info.branch_pages += 1;
                return Ok(());
            }
            let (parent, pidx) = stack[level - 1];
            self.with_branch_mut(parent, |nodes| nodes.insert(pidx + 1, sep))?;
        }
        Ok(())
    }

    /// Drop empty pages and merge underfilled ones upwards from the leaf.
    fn rebalance(&self, info: &mut DbInfo, stack: &Stack) -> Result<()> {
        for level in (1..stack.len()).rev() {
            let pgno = stack[level].0;
            let (parent, pidx) = stack[level - 1];
            let (len, used, leaf) = self.txn.dirty_mut(pgno, |p| (p.len(), p.used(), p.is_leaf()))?;
            if len == 0 {
                self.txn.free_page(pgno, 1)?;
                count_page(info, leaf, false);
                self.with_branch_mut(parent, |nodes| remove_branch(nodes, pidx))?;
                trace!("removed empty page {}", pgno);
                continue;
            }
            if used >= FILL_THRESHOLD || !self.merge_with_sibling(info, stack, level, used)? {
                break;
            }
        }
        self.collapse_root(info)
    }

    fn merge_with_sibling(&self, info: &mut DbInfo, stack: &Stack, level: usize, used: usize) -> Result<bool> {
        let pgno = stack[level].0;
        let (parent, pidx) = stack[level - 1];
        if self.txn.dirty_mut(parent, |p| p.len())? < 2 {
            return Ok(false);
        }
        let (li, ri) = if pidx > 0 { (pidx - 1, pidx) } else { (0, 1) };
        let sib_index = if li == pidx { ri } else { li };
        let (sibling, sep_key, sep_val) = self.with_branch_mut(parent, |nodes| {
            (nodes[sib_index].child, nodes[ri].key.clone(), nodes[ri].val.clone())
        })?;

        let sib_page = self.txn.with_page(sibling, |p| p.to_page())?;
        let sep_extra = if sib_page.is_leaf() { 0 } else { sep_key.len() + sep_val.len() };
        if used + sib_page.used() + sep_extra > PAGE_PAYLOAD {
            return Ok(false);
        }

        let sibling = self.txn.touch(sibling)?;
        self.with_branch_mut(parent, |nodes| nodes[sib_index].child = sibling)?;
        let (left, right) = if li == pidx { (pgno, sibling) } else { (sibling, pgno) };

        let moved = self.txn.dirty_mut(right, |p| mem::replace(p, Page::Leaf(Vec::new())))?;
        let leaf = moved.is_leaf();
        match moved {
            Page::Leaf(nodes) => self.with_leaf_mut(left, |l| l.extend(nodes))?,
            Page::Branch(mut nodes) => {
                if let Some(first) = nodes.first_mut() {
                    first.key = sep_key;
                    first.val = sep_val;
                }
                self.with_branch_mut(left, |l| l.extend(nodes))?
            }
            Page::Overflow(_) => return Err(self.txn.corrupted()),
        }
        self.txn.free_page(right, 1)?;
        count_page(info, leaf, false);
        self.with_branch_mut(parent, |nodes| remove_branch(nodes, ri))?;
        trace!("merged page {} into {}", right, left);
        Ok(true)
    }

    fn collapse_root(&self, info: &mut DbInfo) -> Result<()> {
        while info.root != P_INVALID {
            let (len, leaf, child) = self.txn.with_page(info.root, |p| {
                let child = if !p.is_leaf() && p.len() > 0 { p.child(0) } else { P_INVALID };
                (p.len(), p.is_leaf(), child)
            })?;
            if len == 0 {
                self.txn.free_page(info.root, 1)?;
                trace!("tree emptied");
                *info = DbInfo::empty(info.flags);
                return Ok(());
            }
            if leaf || len > 1 {
                return Ok(());
            }
            self.txn.free_page(info.root, 1)?;
            trace!("root {} collapsed into {}", info.root, child);
            info.root = child;
            info.depth = info.depth.saturating_sub(1);
            info.branch_pages = info.branch_pages.saturating_sub(1);
        }
        Ok(())
    }

    fn with_leaf_mut<R>(&self, pgno: Pgno, f: impl FnOnce(&mut Vec<LeafNode>) -> R) -> Result<R> {
        self.txn
            .dirty_mut(pgno, |p| match p {
                Page::Leaf(nodes) => Some(f(nodes)),
                _ => None,
            })?
            .ok_or_else(|| self.txn.corrupted())
    }

    fn with_branch_mut<R>(&self, pgno: Pgno, f: impl FnOnce(&mut Vec<BranchNode>) -> R) -> Result<R> {
        self.txn
            .dirty_mut(pgno, |p| match p {
                Page::Branch(nodes) => Some(f(nodes)),
                _ => None,
            })?
            .ok_or_else(|| self.txn.corrupted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &[u8], val: &[u8]) -> LeafNode {
        LeafNode {
            flags: NodeFlags::empty(),
            key: key.to_vec(),
            data: LeafData::Inline(val.to_vec()),
        }
    }

    #[test]
    fn dupsort_bounds_bracket_every_value_of_a_key() {
        let min = Target::new(b"k", ValBound::Min, true);
        let max = Target::new(b"k", ValBound::Max, true);
        let exact = Target::new(b"k", ValBound::Exact(b"m"), true);
        assert_eq!(min.cmp_node(b"k", b""), Ordering::Greater);
        assert_eq!(max.cmp_node(b"k", b"\xff\xff"), Ordering::Less);
        assert_eq!(exact.cmp_node(b"k", b"a"), Ordering::Less);
        assert_eq!(exact.cmp_node(b"k", b"m"), Ordering::Equal);
        assert_eq!(exact.cmp_node(b"j", b"z"), Ordering::Less);

        let plain = Target::new(b"k", ValBound::Exact(b"m"), false);
        assert_eq!(plain.cmp_node(b"k", b"anything"), Ordering::Equal);
    }

    #[test]
    fn split_balances_bytes_and_hands_up_separator() {
        let mut page = Page::Leaf((0u8..40).map(|i| leaf(&[b'a', i], &[i; 180])).collect());
        assert!(!page.fits());
        let (key, val, right) = split_page(&mut page, false).unwrap();
        assert!(page.fits() && right.fits());
        assert_eq!(page.len() + right.len(), 40);
        assert!(page.len().abs_diff(right.len()) <= 1);
        assert_eq!(key, vec![b'a', page.len() as u8]);
        assert!(val.is_empty());
    }

    #[test]
    fn branch_split_moves_first_right_key_up() {
        let mut nodes: Vec<BranchNode> = (0u8..200)
            .map(|i| BranchNode {
                key: vec![i; 20],
                val: Vec::new(),
                child: 100 + u64::from(i),
            })
            .collect();
        nodes[0].key.clear();
        let mut page = Page::Branch(nodes);
        let (key, _, right) = split_page(&mut page, false).unwrap();
        match right {
            Page::Branch(right) => {
                assert!(right[0].key.is_empty());
                assert_eq!(key, vec![page.len() as u8; 20]);
                assert_eq!(right[0].child, 100 + page.len() as u64);
            }
            _ => panic!("expected a branch page"),
        }
    }

    #[test]
    fn removing_first_branch_node_clears_new_first_separator() {
        let mut nodes = vec![
            BranchNode { key: Vec::new(), val: Vec::new(), child: 1 },
            BranchNode { key: b"m".to_vec(), val: b"x".to_vec(), child: 2 },
        ];
        remove_branch(&mut nodes, 0);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].key.is_empty() && nodes[0].val.is_empty());
        assert_eq!(nodes[0].child, 2);
    }
}
