// src/lib.rs
//! lumokv: an embedded, memory-mapped, transactional key-value store.
//!
//! One data file holds a copy-on-write B+tree per database. Any number of
//! read transactions see stable snapshots while a single write transaction
//! stages changes and publishes them atomically on commit.
//!
//! ```no_run
//! use lumokv::{DbFlags, Environment, WriteFlags};
//!
//! # fn main() -> lumokv::Result<()> {
//! let env = Environment::builder().set_max_dbs(4).open("/tmp/lumokv-demo")?;
//! let db = env.open_db(Some("fruit"), DbFlags::CREATE)?;
//!
//! let txn = env.begin_rw_txn()?;
//! db.put(&txn, b"apple", b"red", WriteFlags::empty())?;
//! txn.commit()?;
//!
//! let txn = env.begin_ro_txn()?;
//! assert_eq!(db.get(&txn, b"apple")?.as_deref(), Some(&b"red"[..]));
//! # Ok(())
//! # }
//! ```

mod btree;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod lock;
mod meta;
mod midl;
mod page;
mod pager;
mod transaction;
mod types;
mod value;

pub use constants::{
    CopyFlags, DbFlags, EnvFlags, WriteFlags, CHANGEABLE, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS,
    DEFAULT_MAX_READERS, MAX_KEY_SIZE, PAGE_SIZE,
};
pub use cursor::{Cursor, Iter};
pub use database::Database;
pub use env::{EnvBuilder, Environment};
pub use error::{Error, Result};
pub use meta::ReaderInfo;
pub use transaction::Transaction;
pub use types::{CursorOp, Dbi, EnvInfo, Pgno, Stat, TxnId};
pub use value::Lookup;
