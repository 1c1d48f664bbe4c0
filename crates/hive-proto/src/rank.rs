//! Cluster rank identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A cluster-unique membership slot assigned to an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rank(u32);

impl Rank {
    /// Sentinel meaning "no rank assigned yet".
    pub const NIL: Rank = Rank(u32::MAX);

    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

impl Default for Rank {
    fn default() -> Self {
        Self::NIL
    }
}

impl From<u32> for Rank {
    fn from(rank: u32) -> Self {
        Self(rank)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "NilRank")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
