//! Sorted page-number lists used for free page bookkeeping.

use crate::types::Pgno;

/// ID List - page numbers kept sorted in ascending order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Idl {
    ids: Vec<Pgno>,
}

impl Idl {
    /// Build a list from unsorted ids.
    pub fn from_unsorted(mut ids: Vec<Pgno>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Idl { ids }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: Pgno) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Insert an id, keeping the list sorted. Returns false if it was present.
    pub fn insert(&mut self, id: Pgno) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, id);
                true
            }
        }
    }

    /// Insert the run `first..first + count`.
    pub fn insert_run(&mut self, first: Pgno, count: u64) {
        for id in first..first + count {
            self.insert(id);
        }
    }

    /// Merge another list into this one
    pub fn append_list(&mut self, other: &Idl) {
        if other.is_empty() {
            return;
        }
        let mut merged = Vec::with_capacity(self.len() + other.len());
        let (mut a, mut b) = (self.ids.iter().peekable(), other.ids.iter().peekable());
        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(&&x), Some(&&y)) if x < y => a.next(),
                (Some(&&x), Some(&&y)) if x > y => b.next(),
                (Some(_), Some(_)) => {
                    b.next();
                    a.next()
                }
                (Some(_), None) => a.next(),
                (None, Some(_)) => b.next(),
                (None, None) => break,
            };
            if let Some(&id) = next {
                merged.push(id);
            }
        }
        self.ids = merged;
    }

    /// Take the lowest id.
    pub fn pop_lowest(&mut self) -> Option<Pgno> {
        if self.ids.is_empty() {
            None
        } else {
            Some(self.ids.remove(0))
        }
    }

    /// Take the highest id.
    pub fn pop(&mut self) -> Option<Pgno> {
        self.ids.pop()
    }

    /// Remove and return the first id of `count` consecutive ids, if any run is long enough.
    pub fn take_run(&mut self, count: usize) -> Option<Pgno> {
        if count == 0 || self.ids.len() < count {
            return None;
        }
        if count == 1 {
            return self.pop_lowest();
        }
        let mut start = 0;
        for i in 1..self.ids.len() {
            if self.ids[i] != self.ids[i - 1] + 1 {
                start = i;
            }
            if i + 1 - start == count {
                let first = self.ids[start];
                self.ids.drain(start..=i);
                return Some(first);
            }
        }
        None
    }

    /// Whether a run of `count` consecutive ids exists.
    pub fn has_run(&self, count: usize) -> bool {
        if count <= 1 {
            return count == 0 || !self.ids.is_empty();
        }
        let mut run = 1;
        for pair in self.ids.windows(2) {
            run = if pair[1] == pair[0] + 1 { run + 1 } else { 1 };
            if run >= count {
                return true;
            }
        }
        false
    }

    pub fn as_slice(&self) -> &[Pgno] {
        &self.ids
    }
}
