/// Page number inside the data file
pub type Pgno = u64;
/// Transaction id; committed ids double as snapshot versions
pub type TxnId = u64;
/// Database handle index
pub type Dbi = u32;

/// Marker for "no page" (empty tree, end of chain)
pub(crate) const P_INVALID: Pgno = u64::MAX;
/// Handle index of the unnamed default database
pub(crate) const MAIN_DBI: Dbi = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    First,
    FirstDup,
    GetBoth,
    GetBothRange,
    GetCurrent,
    Last,
    LastDup,
    Next,
    NextDup,
    NextNoDup,
    Prev,
    PrevDup,
    PrevNoDup,
    SetKey,
    SetRange,
}

/// Database statistics matching MDB_stat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data entries
    pub entries: u64,
}

/// Environment information matching MDB_envinfo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub map_size: usize,
    /// Last page in use
    pub last_pgno: Pgno,
    /// Id of the last committed transaction
    pub last_txnid: TxnId,
    pub max_readers: u32,
    pub num_readers: u32,
}
