use serde::{Deserialize, Serialize};
use std::fmt;

use crate::genid::Genid;

/// Identity of one schema change attempt.
///
/// A fresh seed keeps the low 32 bits of a genid and replaces the high 32
/// bits with a CRC32C tag of the node name, so the seed is unique and its
/// origin node can be recognised later. A resumed attempt reuses the seed it
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seed(u64);

impl Seed {
    pub fn from_raw(raw: u64) -> Self {
        Seed(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn synthesize(genid: Genid, node: &str) -> Self {
        let tag = Self::node_tag_for(node) as u64;
        Seed((tag << 32) | (genid.as_u64() & 0xffff_ffff))
    }

    pub fn node_tag_for(node: &str) -> u32 {
        crc32c::crc32c(node.as_bytes())
    }

    pub fn node_tag(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn originated_on(&self, node: &str) -> bool {
        self.node_tag() == Self::node_tag_for(node)
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
