use std::collections::HashMap;

use crate::btree::Tree;
use crate::constants::{DbFlags, WriteFlags};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::types::{Dbi, Stat, MAIN_DBI};
use crate::value::Lookup;

/// Database handle
///
/// Handles are cheap to copy and stay valid for the lifetime of the
/// environment, unless the database is deleted with [`Database::drop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    /// Database identifier
    dbi: Dbi,
}

impl Database {
    pub(crate) fn new(dbi: Dbi) -> Self {
        Database { dbi }
    }

    /// The unnamed default database
    pub(crate) fn main() -> Self {
        Database { dbi: MAIN_DBI }
    }

    pub fn dbi(&self) -> Dbi {
        self.dbi
    }

    fn tree<'t, 'env>(&self, txn: &'t Transaction<'env>) -> Result<Tree<'t, 'env>> {
        txn.check()?;
        Ok(Tree::new(txn, self.dbi))
    }

    /// Get database statistics
    pub fn stat(&self, txn: &Transaction) -> Result<Stat> {
        Ok(self.tree(txn)?.info()?.stat())
    }

    /// Get persisted database flags
    pub fn flags(&self, txn: &Transaction) -> Result<DbFlags> {
        Ok(self.tree(txn)?.info()?.flags)
    }

    /// Empty the database, or with `del` delete it from the environment.
    ///
    /// A deleted handle returns `BadDbi` once the transaction commits (and
    /// already inside it). The main database can't be dropped.
    pub fn drop(&self, txn: &Transaction, del: bool) -> Result<()> {
        if self.dbi == MAIN_DBI {
            return Err(Error::Incompatible);
        }
        let tree = self.tree(txn)?;
        let emptied = txn.poison(tree.clear())?;
        if del {
            txn.set_db_dropped(self.dbi, emptied);
        } else {
            txn.set_db_info(self.dbi, emptied);
        }
        Ok(())
    }

    /// Get a value by key. In a DUPSORT database this is the first value.
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn.poison(self.tree(txn)?.get(key))
    }

    /// Get the value, or every value of a DUPSORT database, stored under `key`.
    pub fn lookup(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Lookup>> {
        txn.poison(self.tree(txn)?.lookup(key))
    }

    /// Put a key/value pair
    ///
    /// Without flags an existing value is replaced; in a DUPSORT database
    /// the value is added to the key's set, and an existing pair is left
    /// as it is.
    pub fn put(&self, txn: &Transaction, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        txn.poison(self.tree(txn)?.put(key, data, flags))
    }

    /// Delete a key/value pair, or with `data == None` every value of `key`.
    pub fn del(&self, txn: &Transaction, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        txn.poison(self.tree(txn)?.del(key, data))
    }

    /// Create a cursor for this database
    pub fn cursor<'txn, 'env>(&self, txn: &'txn Transaction<'env>) -> Result<Cursor<'txn, 'env>> {
        Cursor::new(txn, self.dbi)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DbEntry {
    pub name: Vec<u8>,
    pub flags: DbFlags,
}

/// Handles of the named databases opened in an environment.
///
/// Slot 0 stands for the main database. Slots of deleted databases are
/// not reused, so a stale handle can never reach another database.
#[derive(Debug)]
pub(crate) struct DbRegistry {
    slots: Vec<Option<DbEntry>>,
    by_name: HashMap<Vec<u8>, Dbi>,
}

impl Default for DbRegistry {
    fn default() -> Self {
        DbRegistry {
            slots: vec![None],
            by_name: HashMap::new(),
        }
    }
}

impl DbRegistry {
    pub fn lookup(&self, name: &[u8]) -> Option<(Dbi, DbFlags)> {
        let dbi = *self.by_name.get(name)?;
        self.entry(dbi).map(|entry| (dbi, entry.flags))
    }

    pub fn register(&mut self, name: &[u8], flags: DbFlags) -> Dbi {
        let dbi = self.slots.len() as Dbi;
        self.slots.push(Some(DbEntry {
            name: name.to_vec(),
            flags,
        }));
        self.by_name.insert(name.to_vec(), dbi);
        dbi
    }

    pub fn entry(&self, dbi: Dbi) -> Option<&DbEntry> {
        if dbi == MAIN_DBI {
            return None;
        }
        self.slots.get(dbi as usize)?.as_ref()
    }

    pub fn name(&self, dbi: Dbi) -> Option<Vec<u8>> {
        self.entry(dbi).map(|entry| entry.name.clone())
    }

    pub fn remove(&mut self, dbi: Dbi) {
        if let Some(entry) = self.slots.get_mut(dbi as usize).and_then(Option::take) {
            self.by_name.remove(&entry.name);
        }
    }

    /// Named databases currently open
    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_never_reuses_slots() {
        let mut registry = DbRegistry::default();
        let a = registry.register(b"a", DbFlags::empty());
        let b = registry.register(b"b", DbFlags::DUPSORT);
        assert_eq!((a, b), (1, 2));
        assert_eq!(registry.lookup(b"b"), Some((2, DbFlags::DUPSORT)));

        registry.remove(a);
        assert!(registry.entry(a).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.register(b"a", DbFlags::empty()), 3);
        assert!(registry.entry(MAIN_DBI).is_none());
    }
}
