//! Stable 32-bit identifiers derived from names.

use serde::{Deserialize, Serialize};
use std::fmt;

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x01000193;

/// 32-bit FNV-1a hash of a name. Zero is reserved, so a zero hash maps to 1.
pub const fn name_hash(name: &str) -> u32 {
    hash_bytes(FNV_OFFSET_BASIS, name.as_bytes())
}

/// Continue an FNV-1a hash over more bytes.
pub const fn hash_bytes(seed: u32, bytes: &[u8]) -> u32 {
    let mut hash = seed;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    if hash == 0 { 1 } else { hash }
}

/// Identity of a registered type: the hash of its fully-qualified name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(u32);

impl TypeId {
    pub const fn of_name(name: &str) -> Self {
        Self(name_hash(name))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({:08x})", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
