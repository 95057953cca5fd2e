//! Storage pager: the data file, mapped read-only, plus positional writes.
//!
//! Committed pages are only ever read through the map. Writers stage pages in
//! memory and hand the encoded bytes to [`Pager::write_pages`] on commit, so a
//! page visible to a reader is never modified in place.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use log::debug;
use memmap2::{Mmap, MmapOptions};

use crate::constants::{PageFlags, META_PAGES, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::MetaHeader;
use crate::page::{PageHeader, PAGE_HEADER_SIZE};
use crate::types::Pgno;

#[derive(Debug)]
pub(crate) struct Pager {
    file: File,
    map: Mmap,
    read_only: bool,
}

impl Pager {
    /// Open (or create) the data file and map `map_size` bytes of it.
    pub fn open(path: &Path, map_size: usize, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if read_only && file_len < META_PAGES * PAGE_SIZE {
            return Err(Error::Invalid);
        }

        let map_len = if read_only {
            file_len - file_len % PAGE_SIZE
        } else {
            let wanted = round_to_page(map_size.max(file_len));
            if file_len < wanted {
                file.set_len(wanted as u64)?;
            }
            wanted
        };
        if map_len < META_PAGES * PAGE_SIZE {
            return Err(Error::EnvInvalidConfig("map size smaller than the meta pages"));
        }

        // SAFETY: the file stays open for the lifetime of the map, and pages
        // reachable from a published meta are never rewritten while mapped.
        let map = unsafe { MmapOptions::new().len(map_len).map(&file)? };
        debug!(
            "mapped {} ({} of {} bytes, read_only={})",
            path.display(),
            map_len,
            file_len,
            read_only
        );

        Ok(Pager { file, map, read_only })
    }

    /// Bytes mapped
    pub fn map_size(&self) -> usize {
        self.map.len()
    }

    /// First page number past the end of the map
    pub fn max_pgno(&self) -> Pgno {
        (self.map.len() / PAGE_SIZE) as Pgno
    }

    /// One mapped page
    pub fn page(&self, pgno: Pgno) -> Result<&[u8]> {
        self.pages(pgno, 1)
    }

    /// `count` consecutive mapped pages
    pub fn pages(&self, pgno: Pgno, count: u64) -> Result<&[u8]> {
        let end = pgno.checked_add(count).ok_or(Error::Corrupted)?;
        if end > self.max_pgno() {
            return Err(Error::Corrupted);
        }
        let start = pgno as usize * PAGE_SIZE;
        Ok(&self.map[start..end as usize * PAGE_SIZE])
    }

    /// Decode both meta pages.
    pub fn read_metas(&self) -> [Result<MetaHeader>; 2] {
        [self.read_meta(0), self.read_meta(1)]
    }

    /// Whether the meta pages were never written
    pub fn is_blank(&self) -> Result<bool> {
        Ok(self.pages(0, META_PAGES as u64)?.iter().all(|&b| b == 0))
    }

    /// Newest meta page that validates, if any
    pub fn latest_meta(&self) -> Option<MetaHeader> {
        let [first, second] = self.read_metas();
        match (first.ok(), second.ok()) {
            (Some(a), Some(b)) => Some(if b.txnid > a.txnid { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    fn read_meta(&self, slot: Pgno) -> Result<MetaHeader> {
        let bytes = self.page(slot)?;
        let header = PageHeader::read(bytes).map_err(|_| Error::Invalid)?;
        if header.pgno != slot || header.flags != PageFlags::META {
            return Err(Error::Invalid);
        }
        MetaHeader::decode(&bytes[PAGE_HEADER_SIZE..])
    }

    /// Write a meta page into slot `txnid % 2`.
    pub fn write_meta(&self, meta: &MetaHeader) -> Result<()> {
        let slot = meta.txnid % META_PAGES as u64;
        self.write_at(slot, &encode_meta_page(slot, meta))
    }

    /// Write encoded pages, each keyed by its first page number.
    pub fn write_pages(&self, pages: &[(Pgno, Vec<u8>)]) -> Result<()> {
        for (pgno, bytes) in pages {
            self.write_at(*pgno, bytes)?;
        }
        Ok(())
    }

    fn write_at(&self, pgno: Pgno, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::EnvReadOnly);
        }
        let pages = ((bytes.len() + PAGE_SIZE - 1) / PAGE_SIZE) as u64;
        if pgno + pages > self.max_pgno() {
            return Err(Error::MapFull);
        }
        write_all_at(&self.file, bytes, pgno * PAGE_SIZE as u64)?;
        Ok(())
    }

    /// Flush file data to stable storage
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data()?;
        Ok(())
    }
}

/// A full meta page: header followed by the meta body.
pub(crate) fn encode_meta_page(slot: Pgno, meta: &MetaHeader) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE_SIZE];
    PageHeader {
        pgno: slot,
        flags: PageFlags::META,
        count: 0,
        aux: 0,
    }
    .write(&mut buf);
    buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + MetaHeader::SIZE].copy_from_slice(&meta.encode());
    buf
}

fn round_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}
