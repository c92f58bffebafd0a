//! Transaction branch identifiers and XA flags

use serde::{Deserialize, Serialize};
use std::fmt;

/// Global transaction branch identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch.into(),
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    bytes.iter().try_for_each(|b| write!(f, "{b:02x}"))
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        write_hex(f, &self.global_id)?;
        f.write_str(":")?;
        write_hex(f, &self.branch_qualifier)
    }
}

/// Flags accepted by `xa_start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartFlag {
    /// TMNOFLAGS: begin a new branch
    NoFlags,
    /// TMJOIN: join an existing branch
    Join,
    /// TMRESUME: resume a suspended branch
    Resume,
}

impl StartFlag {
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::NoFlags),
            0x0020_0000 => Some(Self::Join),
            0x0800_0000 => Some(Self::Resume),
            _ => None,
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            Self::NoFlags => 0,
            Self::Join => 0x0020_0000,
            Self::Resume => 0x0800_0000,
        }
    }
}

/// Flags accepted by `xa_end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndFlag {
    /// TMSUCCESS
    Success,
    /// TMFAIL: branch is marked rollback-only
    Fail,
    /// TMSUSPEND
    Suspend,
}

impl EndFlag {
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0x0400_0000 => Some(Self::Success),
            0x2000_0000 => Some(Self::Fail),
            0x0200_0000 => Some(Self::Suspend),
            _ => None,
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            Self::Success => 0x0400_0000,
            Self::Fail => 0x2000_0000,
            Self::Suspend => 0x0200_0000,
        }
    }
}

/// Resource manager vote returned from prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XaVote {
    /// XA_OK: branch prepared, awaiting commit
    Ok,
    /// XA_RDONLY: nothing to commit, branch already complete
    ReadOnly,
}
