use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// The path names the data file itself instead of a directory
        const NOSUBDIR = 0x4000;
        /// Don't fsync data pages on commit
        const NOSYNC = 0x10000;
        /// Open read-only; write transactions are refused
        const RDONLY = 0x20000;
        /// Don't fsync the meta page on commit
        const NOMETASYNC = 0x40000;
        /// Skip the cross-process lock file
        const NOLOCK = 0x400000;
    }
}

/// Flags that may be toggled after the environment is open
pub const CHANGEABLE: EnvFlags = EnvFlags::NOSYNC.union(EnvFlags::NOMETASYNC);

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// Keep several sorted values per key
        const DUPSORT = 0x04;
        /// Create the named database if it doesn't exist
        const CREATE = 0x40000;
    }
}

/// Database flags that are persisted in the database record
pub(crate) const PERSISTENT_DB_FLAGS: DbFlags = DbFlags::DUPSORT;

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExist` if the key already has a value
        const NOOVERWRITE = 0x10;
        /// Fail with `KeyExist` if the exact key/value pair exists (DUPSORT only)
        const NODUPDATA = 0x20;
        /// The entry must sort after every existing entry
        const APPEND = 0x20000;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransactionFlags: u32 {
        const RDONLY = EnvFlags::RDONLY.bits();

        const FINISHED = 0x01;
        const ERROR = 0x02;
        const DIRTY = 0x04;
    }
}

// Copy operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CopyFlags: u32 {
        /// Rewrite live pages only, renumbered from page 2
        const COMPACT = 0x01;
    }
}

// Leaf node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// Value lives in an overflow page run
        const BIGDATA = 0x01;
        /// Value is a sub-database record
        const SUBDATA = 0x02;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
        const FREELIST = 0x10;
    }
}

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Magic number for lumokv files
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 9;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 70;
/// On-disk format version
pub const DATA_VERSION: u32 = 1;
/// Number of meta pages at the start of the file
pub const META_PAGES: usize = 2;
/// Longest key accepted, also the longest DUPSORT value
pub const MAX_KEY_SIZE: usize = 511;

pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_DBS: u32 = 0;
pub const DEFAULT_MAX_READERS: u32 = 126;

/// File names used when the environment path is a directory
pub const DATA_FILE_NAME: &str = "data.mdb";
pub const LOCK_FILE_NAME: &str = "lock.mdb";
/// Suffix of the lock file when `NOSUBDIR` is set
pub const LOCK_SUFFIX: &str = "-lock";
