//! Function-local ids for nodes, pins and links.
//!
//! Ids are 1-based sequence numbers into their function's arrays. They are
//! never reused within a function.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! graph_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Id for the array slot at `index`.
            pub const fn from_index(index: usize) -> Self {
                Self(index as u32 + 1)
            }

            pub const fn get(self) -> u32 {
                self.0
            }

            /// Array slot of this id. Id 0 is never valid, so it maps past any array.
            pub const fn index(self) -> usize {
                (self.0 as usize).wrapping_sub(1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

graph_id!(
    /// Id of a node within its function
    NodeId,
    "node#"
);
graph_id!(
    /// Id of a pin within its function
    PinId,
    "pin#"
);
graph_id!(
    /// Id of a link within its function
    LinkId,
    "link#"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_one_based() {
        assert_eq!(NodeId::from_index(0).get(), 1);
        assert_eq!(PinId::new(3).index(), 2);
        assert_eq!(LinkId::new(0).index(), usize::MAX);
        assert_eq!(PinId::new(7).to_string(), "pin#7");
    }
}
