//! Identifier newtypes. Zero is reserved as "unknown" for every kind.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            pub const UNKNOWN: Self = Self(0);

            pub fn is_known(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_known() {
                    write!(f, concat!($prefix, "{}"), self.0)
                } else {
                    write!(f, concat!($prefix, "?"))
                }
            }
        }
    };
}

id_type!(
    /// Spatial anchor in the maintained graph. Issued in increasing order.
    AnchorId,
    "a"
);
id_type!(
    /// Connectivity island as reported by the optimizer.
    FragmentId,
    "f"
);
id_type!(
    /// Client handle to an attachment point.
    AttachmentId,
    "ap"
);
id_type!(
    /// Alignment pin issued by an alignment blender.
    PinId,
    "p"
);

/// Monotonic issuer for any of the id types above. Never hands out zero.
#[derive(Clone, Debug)]
pub struct IdSequence {
    next: u64,
}

impl Default for IdSequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdSequence {
    pub fn next_raw(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Unordered pair of anchors, stored with the smaller id first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub a: AnchorId,
    pub b: AnchorId,
}

impl Edge {
    pub fn new(a: AnchorId, b: AnchorId) -> Self {
        if a <= b { Self { a, b } } else { Self { a: b, b: a } }
    }

    pub fn touches(&self, id: AnchorId) -> bool {
        self.a == id || self.b == id
    }
}
