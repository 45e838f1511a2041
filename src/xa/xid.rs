use std::fmt;

/// Global transaction id issued by the transaction manager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct GlobalId(pub u64);

/// Branch qualifier identifying one data source inside a global transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BranchId(pub u32);

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of one transaction branch: the global id plus the data source branch.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Xid {
    /// Global transaction.
    pub global: GlobalId,
    /// Branch of the data source.
    pub branch: BranchId,
}

/// Encoded length of an [`Xid`].
pub const XID_LEN: usize = 12;

impl Xid {
    /// Branch `branch` of global transaction `global`.
    pub fn new(global: GlobalId, branch: BranchId) -> Self {
        Self { global, branch }
    }

    /// Big-endian `[global u64][branch u32]`.
    pub fn encode(&self) -> [u8; XID_LEN] {
        let mut buf = [0u8; XID_LEN];
        buf[0..8].copy_from_slice(&self.global.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.branch.0.to_be_bytes());
        buf
    }

    /// Decodes an xid; `None` if `src` is too short.
    pub fn decode(src: &[u8]) -> Option<Self> {
        let global = src.get(0..8)?;
        let branch = src.get(8..12)?;
        let mut g = [0u8; 8];
        g.copy_from_slice(global);
        let mut b = [0u8; 4];
        b.copy_from_slice(branch);
        Some(Self {
            global: GlobalId(u64::from_be_bytes(g)),
            branch: BranchId(u32::from_be_bytes(b)),
        })
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.global, self.branch)
    }
}
