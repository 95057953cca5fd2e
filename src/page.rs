//! Page format.
//!
//! Every page starts with a 24 byte header. Branch and leaf pages follow it
//! with an array of `u16` node offsets; node bodies are packed from the end
//! of the page downwards. Committed pages are read in place through
//! [`PageView`]; pages staged by a write transaction are held decoded as
//! [`Page`] and encoded again on commit.

use crate::constants::{NodeFlags, PageFlags, MAX_KEY_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::{read_u32, read_u64};
use crate::types::{Pgno, TxnId, P_INVALID};

pub(crate) const PAGE_HEADER_SIZE: usize = 24;
/// Bytes available for slots and nodes
pub(crate) const PAGE_PAYLOAD: usize = PAGE_SIZE - PAGE_HEADER_SIZE;
/// Largest leaf node kept inline; at least three always fit a page
pub(crate) const MAX_NODE_SIZE: usize = PAGE_PAYLOAD / 3 - SLOT_SIZE;
/// Pages filled below this are merged into a sibling when possible
pub(crate) const FILL_THRESHOLD: usize = PAGE_PAYLOAD / 4;

const LEAF_NODE_HEADER: usize = 7;
const BRANCH_NODE_HEADER: usize = 12;
pub(crate) const SLOT_SIZE: usize = 2;
const FREELIST_RECORD_HEADER: usize = 12;

/// Page header matching MDB_page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageHeader {
    /// Page number
    pub pgno: Pgno,
    /// Page type flags
    pub flags: PageFlags,
    /// Number of nodes or freelist records
    pub count: u16,
    /// Overflow run length, or next freelist page
    pub aux: u64,
}

impl PageHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(Error::Corrupted);
        }
        let flags = PageFlags::from_bits(u16::from_le_bytes([bytes[8], bytes[9]])).ok_or(Error::Corrupted)?;
        Ok(PageHeader {
            pgno: read_u64(bytes, 0),
            flags,
            count: u16::from_le_bytes([bytes[10], bytes[11]]),
            aux: read_u64(bytes, 16),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.pgno.to_le_bytes());
        buf[8..10].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[10..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].fill(0);
        buf[16..24].copy_from_slice(&self.aux.to_le_bytes());
    }
}

/// Number of pages in an overflow run holding `len` bytes.
pub(crate) fn overflow_pages(len: usize) -> u64 {
    ((PAGE_HEADER_SIZE + len + PAGE_SIZE - 1) / PAGE_SIZE) as u64
}

/// Leaf node value, owned
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeafData {
    Inline(Vec<u8>),
    Overflow { pgno: Pgno, len: u32 },
}

impl LeafData {
    pub fn borrowed(&self) -> LeafDataRef<'_> {
        match self {
            LeafData::Inline(data) => LeafDataRef::Inline(data),
            LeafData::Overflow { pgno, len } => LeafDataRef::Overflow { pgno: *pgno, len: *len },
        }
    }
}

/// Leaf node value, borrowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafDataRef<'a> {
    Inline(&'a [u8]),
    Overflow { pgno: Pgno, len: u32 },
}

impl LeafDataRef<'_> {
    pub fn to_owned(self) -> LeafData {
        match self {
            LeafDataRef::Inline(data) => LeafData::Inline(data.to_vec()),
            LeafDataRef::Overflow { pgno, len } => LeafData::Overflow { pgno, len },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafNode {
    pub flags: NodeFlags,
    pub key: Vec<u8>,
    pub data: LeafData,
}

impl LeafNode {
    pub fn size(&self) -> usize {
        leaf_node_size(self.key.len(), &self.data)
    }

    /// Bytes compared after the key in DUPSORT trees
    pub fn sort_val(&self) -> &[u8] {
        match &self.data {
            LeafData::Inline(data) => data,
            LeafData::Overflow { .. } => &[],
        }
    }
}

pub(crate) fn leaf_node_size(key_len: usize, data: &LeafData) -> usize {
    LEAF_NODE_HEADER
        + key_len
        + match data {
            LeafData::Inline(v) => v.len(),
            LeafData::Overflow { .. } => 8,
        }
}

/// Whether a value of `len` bytes under a key of `key_len` bytes is stored inline.
pub(crate) fn fits_inline(key_len: usize, len: usize) -> bool {
    LEAF_NODE_HEADER + key_len + len <= MAX_NODE_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BranchNode {
    /// Separator key; empty for the first node
    pub key: Vec<u8>,
    /// Separator value in DUPSORT trees
    pub val: Vec<u8>,
    pub child: Pgno,
}

impl BranchNode {
    pub fn size(&self) -> usize {
        BRANCH_NODE_HEADER + self.key.len() + self.val.len()
    }
}

/// A page staged by a write transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Page {
    Leaf(Vec<LeafNode>),
    Branch(Vec<BranchNode>),
    Overflow(Vec<u8>),
}

impl Page {
    /// Slot and node bytes in use
    pub fn used(&self) -> usize {
        match self {
            Page::Leaf(nodes) => nodes.iter().map(|n| n.size() + SLOT_SIZE).sum(),
            Page::Branch(nodes) => nodes.iter().map(|n| n.size() + SLOT_SIZE).sum(),
            Page::Overflow(data) => PAGE_HEADER_SIZE + data.len(),
        }
    }

    pub fn fits(&self) -> bool {
        match self {
            Page::Overflow(_) => true,
            _ => self.used() <= PAGE_PAYLOAD,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Page::Leaf(nodes) => nodes.len(),
            Page::Branch(nodes) => nodes.len(),
            Page::Overflow(_) => 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Page::Leaf(_))
    }

    /// Number of file pages this page occupies
    pub fn span(&self) -> u64 {
        match self {
            Page::Overflow(data) => overflow_pages(data.len()),
            _ => 1,
        }
    }

    /// Serialize the page for `pgno`.
    pub fn encode(&self, pgno: Pgno) -> Vec<u8> {
        match self {
            Page::Overflow(data) => {
                let span = overflow_pages(data.len());
                let mut buf = vec![0u8; span as usize * PAGE_SIZE];
                PageHeader {
                    pgno,
                    flags: PageFlags::OVERFLOW,
                    count: 0,
                    aux: span,
                }
                .write(&mut buf);
                buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data.len()].copy_from_slice(data);
                buf
            }
            Page::Leaf(nodes) => {
                let mut buf = vec![0u8; PAGE_SIZE];
                let mut upper = PAGE_SIZE;
                for (i, node) in nodes.iter().enumerate() {
                    upper -= node.size();
                    let body = &mut buf[upper..upper + node.size()];
                    let klen = node.key.len();
                    body[0] = node.flags.bits();
                    body[1..3].copy_from_slice(&(klen as u16).to_le_bytes());
                    body[LEAF_NODE_HEADER..LEAF_NODE_HEADER + klen].copy_from_slice(&node.key);
                    let payload = &mut body[LEAF_NODE_HEADER + klen..];
                    let dlen = match &node.data {
                        LeafData::Inline(data) => {
                            payload.copy_from_slice(data);
                            data.len() as u32
                        }
                        LeafData::Overflow { pgno, len } => {
                            payload.copy_from_slice(&pgno.to_le_bytes());
                            *len
                        }
                    };
                    body[3..7].copy_from_slice(&dlen.to_le_bytes());
                    write_slot(&mut buf, i, upper);
                }
                Self::write_tree_header(&mut buf, pgno, PageFlags::LEAF, nodes.len());
                buf
            }
            Page::Branch(nodes) => {
                let mut buf = vec![0u8; PAGE_SIZE];
                let mut upper = PAGE_SIZE;
                for (i, node) in nodes.iter().enumerate() {
                    upper -= node.size();
                    let body = &mut buf[upper..upper + node.size()];
                    let (klen, vlen) = (node.key.len(), node.val.len());
                    body[0..2].copy_from_slice(&(klen as u16).to_le_bytes());
                    body[2..4].copy_from_slice(&(vlen as u16).to_le_bytes());
                    body[4..12].copy_from_slice(&node.child.to_le_bytes());
                    body[BRANCH_NODE_HEADER..BRANCH_NODE_HEADER + klen].copy_from_slice(&node.key);
                    body[BRANCH_NODE_HEADER + klen..].copy_from_slice(&node.val);
                    write_slot(&mut buf, i, upper);
                }
                Self::write_tree_header(&mut buf, pgno, PageFlags::BRANCH, nodes.len());
                buf
            }
        }
    }

    fn write_tree_header(buf: &mut [u8], pgno: Pgno, flags: PageFlags, count: usize) {
        debug_assert!(count * SLOT_SIZE + PAGE_HEADER_SIZE <= PAGE_SIZE);
        PageHeader {
            pgno,
            flags,
            count: count as u16,
            aux: 0,
        }
        .write(buf);
    }
}

fn write_slot(buf: &mut [u8], index: usize, offset: usize) {
    let at = PAGE_HEADER_SIZE + index * SLOT_SIZE;
    buf[at..at + SLOT_SIZE].copy_from_slice(&(offset as u16).to_le_bytes());
}

/// A validated branch or leaf page read in place from the map
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageView<'a> {
    bytes: &'a [u8],
    leaf: bool,
    count: usize,
}

impl<'a> PageView<'a> {
    /// Validate a tree page. Every node is bounds-checked here so that
    /// accessors can slice without further checks.
    pub fn parse(bytes: &'a [u8], pgno: Pgno) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(Error::Corrupted);
        }
        let header = PageHeader::read(bytes)?;
        if header.pgno != pgno {
            return Err(Error::Corrupted);
        }
        let leaf = if header.flags == PageFlags::LEAF {
            true
        } else if header.flags == PageFlags::BRANCH {
            false
        } else {
            return Err(Error::Corrupted);
        };
        let count = header.count as usize;
        let lower = PAGE_HEADER_SIZE + count * SLOT_SIZE;
        if count == 0 || lower > PAGE_SIZE {
            return Err(Error::Corrupted);
        }
        let view = PageView { bytes, leaf, count };
        for i in 0..count {
            let off = view.offset(i);
            if off < lower {
                return Err(Error::Corrupted);
            }
            let end = if leaf {
                if off + LEAF_NODE_HEADER > PAGE_SIZE {
                    return Err(Error::Corrupted);
                }
                let flags = NodeFlags::from_bits(bytes[off]).ok_or(Error::Corrupted)?;
                let klen = u16::from_le_bytes([bytes[off + 1], bytes[off + 2]]) as usize;
                let dlen = read_u32(bytes, off + 3) as usize;
                if klen == 0 || klen > MAX_KEY_SIZE {
                    return Err(Error::Corrupted);
                }
                let stored = if flags.contains(NodeFlags::BIGDATA) { 8 } else { dlen };
                off + LEAF_NODE_HEADER + klen + stored
            } else {
                if off + BRANCH_NODE_HEADER > PAGE_SIZE {
                    return Err(Error::Corrupted);
                }
                let klen = u16::from_le_bytes([bytes[off], bytes[off + 1]]) as usize;
                let vlen = u16::from_le_bytes([bytes[off + 2], bytes[off + 3]]) as usize;
                if read_u64(bytes, off + 4) == P_INVALID {
                    return Err(Error::Corrupted);
                }
                off + BRANCH_NODE_HEADER + klen + vlen
            };
            if end > PAGE_SIZE {
                return Err(Error::Corrupted);
            }
        }
        Ok(view)
    }

    fn offset(&self, i: usize) -> usize {
        let at = PAGE_HEADER_SIZE + i * SLOT_SIZE;
        u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]]) as usize
    }

    fn leaf_key(&self, i: usize) -> &'a [u8] {
        let off = self.offset(i);
        let klen = u16::from_le_bytes([self.bytes[off + 1], self.bytes[off + 2]]) as usize;
        &self.bytes[off + LEAF_NODE_HEADER..off + LEAF_NODE_HEADER + klen]
    }

    fn leaf_flags(&self, i: usize) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.bytes[self.offset(i)])
    }

    fn leaf_data(&self, i: usize) -> LeafDataRef<'a> {
        let off = self.offset(i);
        let klen = u16::from_le_bytes([self.bytes[off + 1], self.bytes[off + 2]]) as usize;
        let dlen = read_u32(self.bytes, off + 3);
        let start = off + LEAF_NODE_HEADER + klen;
        if self.leaf_flags(i).contains(NodeFlags::BIGDATA) {
            LeafDataRef::Overflow {
                pgno: read_u64(self.bytes, start),
                len: dlen,
            }
        } else {
            LeafDataRef::Inline(&self.bytes[start..start + dlen as usize])
        }
    }

    fn branch_parts(&self, i: usize) -> (&'a [u8], &'a [u8], Pgno) {
        let off = self.offset(i);
        let klen = u16::from_le_bytes([self.bytes[off], self.bytes[off + 1]]) as usize;
        let vlen = u16::from_le_bytes([self.bytes[off + 2], self.bytes[off + 3]]) as usize;
        let child = read_u64(self.bytes, off + 4);
        let kstart = off + BRANCH_NODE_HEADER;
        (
            &self.bytes[kstart..kstart + klen],
            &self.bytes[kstart + klen..kstart + klen + vlen],
            child,
        )
    }

    /// Decode into an owned page for modification.
    pub fn to_page(&self) -> Page {
        if self.leaf {
            Page::Leaf(
                (0..self.count)
                    .map(|i| LeafNode {
                        flags: self.leaf_flags(i),
                        key: self.leaf_key(i).to_vec(),
                        data: self.leaf_data(i).to_owned(),
                    })
                    .collect(),
            )
        } else {
            Page::Branch(
                (0..self.count)
                    .map(|i| {
                        let (key, val, child) = self.branch_parts(i);
                        BranchNode {
                            key: if i == 0 { Vec::new() } else { key.to_vec() },
                            val: if i == 0 { Vec::new() } else { val.to_vec() },
                            child,
                        }
                    })
                    .collect(),
            )
        }
    }
}

/// A branch or leaf page, either mapped or staged
#[derive(Debug, Clone, Copy)]
pub(crate) enum PageRef<'a> {
    Mapped(PageView<'a>),
    Staged(&'a Page),
}

impl<'a> PageRef<'a> {
    pub fn is_leaf(&self) -> bool {
        match self {
            PageRef::Mapped(view) => view.leaf,
            PageRef::Staged(page) => page.is_leaf(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PageRef::Mapped(view) => view.count,
            PageRef::Staged(page) => page.len(),
        }
    }

    /// Key of a leaf node or separator key of a branch node
    pub fn key(&self, i: usize) -> &'a [u8] {
        match self {
            PageRef::Mapped(view) if view.leaf => view.leaf_key(i),
            PageRef::Mapped(view) => view.branch_parts(i).0,
            PageRef::Staged(Page::Leaf(nodes)) => &nodes[i].key,
            PageRef::Staged(Page::Branch(nodes)) => &nodes[i].key,
            PageRef::Staged(Page::Overflow(_)) => &[],
        }
    }

    /// Secondary sort bytes: inline value of a leaf node, separator value of a branch node
    pub fn sort_val(&self, i: usize) -> &'a [u8] {
        match self {
            PageRef::Mapped(view) if view.leaf => match view.leaf_data(i) {
                LeafDataRef::Inline(data) => data,
                LeafDataRef::Overflow { .. } => &[],
            },
            PageRef::Mapped(view) => view.branch_parts(i).1,
            PageRef::Staged(Page::Leaf(nodes)) => nodes[i].sort_val(),
            PageRef::Staged(Page::Branch(nodes)) => &nodes[i].val,
            PageRef::Staged(Page::Overflow(_)) => &[],
        }
    }

    pub fn child(&self, i: usize) -> Pgno {
        match self {
            PageRef::Mapped(view) => view.branch_parts(i).2,
            PageRef::Staged(Page::Branch(nodes)) => nodes[i].child,
            PageRef::Staged(_) => P_INVALID,
        }
    }

    pub fn leaf_flags(&self, i: usize) -> NodeFlags {
        match self {
            PageRef::Mapped(view) => view.leaf_flags(i),
            PageRef::Staged(Page::Leaf(nodes)) => nodes[i].flags,
            PageRef::Staged(_) => NodeFlags::empty(),
        }
    }

    pub fn leaf_data(&self, i: usize) -> LeafDataRef<'a> {
        match self {
            PageRef::Mapped(view) => view.leaf_data(i),
            PageRef::Staged(Page::Leaf(nodes)) => nodes[i].data.borrowed(),
            PageRef::Staged(_) => LeafDataRef::Inline(&[]),
        }
    }

    pub fn to_page(&self) -> Page {
        match self {
            PageRef::Mapped(view) => view.to_page(),
            PageRef::Staged(page) => Page::clone(page),
        }
    }
}

/// Read the payload of an overflow run starting at `bytes`.
pub(crate) fn overflow_data(bytes: &[u8], pgno: Pgno, len: usize) -> Result<&[u8]> {
    let header = PageHeader::read(bytes)?;
    if header.pgno != pgno || header.flags != PageFlags::OVERFLOW || header.aux != overflow_pages(len) {
        return Err(Error::Corrupted);
    }
    bytes
        .get(PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len)
        .ok_or(Error::Corrupted)
}

/// One `(freeing txn, pages)` record of the persisted freelist
pub(crate) type FreeRecord = (TxnId, Vec<Pgno>);

/// Pack freelist records into page-sized chunks, splitting long records.
pub(crate) fn pack_freelist(records: &[FreeRecord]) -> Vec<Vec<FreeRecord>> {
    let mut pages: Vec<Vec<FreeRecord>> = Vec::new();
    let mut current: Vec<FreeRecord> = Vec::new();
    let mut room = PAGE_PAYLOAD;
    for (txnid, pgnos) in records {
        let mut rest = pgnos.as_slice();
        while !rest.is_empty() {
            if room < FREELIST_RECORD_HEADER + 8 || current.len() == u16::MAX as usize {
                pages.push(std::mem::take(&mut current));
                room = PAGE_PAYLOAD;
            }
            let take = ((room - FREELIST_RECORD_HEADER) / 8).min(rest.len());
            current.push((*txnid, rest[..take].to_vec()));
            room -= FREELIST_RECORD_HEADER + take * 8;
            rest = &rest[take..];
        }
    }
    if !current.is_empty() {
        pages.push(current);
    }
    pages
}

pub(crate) fn encode_freelist(pgno: Pgno, next: Pgno, records: &[FreeRecord]) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE_SIZE];
    PageHeader {
        pgno,
        flags: PageFlags::FREELIST,
        count: records.len() as u16,
        aux: next,
    }
    .write(&mut buf);
    let mut at = PAGE_HEADER_SIZE;
    for (txnid, pgnos) in records {
        buf[at..at + 8].copy_from_slice(&txnid.to_le_bytes());
        buf[at + 8..at + 12].copy_from_slice(&(pgnos.len() as u32).to_le_bytes());
        at += FREELIST_RECORD_HEADER;
        for p in pgnos {
            buf[at..at + 8].copy_from_slice(&p.to_le_bytes());
            at += 8;
        }
    }
    buf
}

/// Decode a freelist page into its records and the next page of the chain.
pub(crate) fn decode_freelist(bytes: &[u8], pgno: Pgno) -> Result<(Pgno, Vec<FreeRecord>)> {
    let header = PageHeader::read(bytes)?;
    if header.pgno != pgno || header.flags != PageFlags::FREELIST || bytes.len() != PAGE_SIZE {
        return Err(Error::Corrupted);
    }
    let mut records = Vec::with_capacity(header.count as usize);
    let mut at = PAGE_HEADER_SIZE;
    for _ in 0..header.count {
        if at + FREELIST_RECORD_HEADER > PAGE_SIZE {
            return Err(Error::Corrupted);
        }
        let txnid = read_u64(bytes, at);
        let n = read_u32(bytes, at + 8) as usize;
        at += FREELIST_RECORD_HEADER;
        if at + n * 8 > PAGE_SIZE {
            return Err(Error::Corrupted);
        }
        let pgnos = (0..n).map(|j| read_u64(bytes, at + j * 8)).collect();
        at += n * 8;
        records.push((txnid, pgnos));
    }
    Ok((header.aux, records))
}
