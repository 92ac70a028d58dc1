//! Block-layer primitives shared by the driver surface.

use core::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// log2 of the block-layer sector size.
pub const BDRV_SECTOR_BITS: u32 = 9;

/// Block-layer sector size in bytes.
pub const BDRV_SECTOR_SIZE: i64 = 1 << BDRV_SECTOR_BITS;

/// Converts a sector number or count to bytes.
pub fn sectors_to_bytes(sectors: i64) -> i64 {
    sectors << BDRV_SECTOR_BITS
}

/// Flags the block layer passes to `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdrvFlags(u32);

impl BdrvFlags {
    /// No flags: read-only, cached.
    pub const NONE: BdrvFlags = BdrvFlags(0);
    /// Open for writing.
    pub const RDWR: BdrvFlags = BdrvFlags(0x0002);
    /// Bypass the host page cache.
    pub const NOCACHE: BdrvFlags = BdrvFlags(0x0020);

    /// Builds flags from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        BdrvFlags(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(self, other: BdrvFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BdrvFlags {
    type Output = BdrvFlags;

    fn bitor(self, rhs: BdrvFlags) -> BdrvFlags {
        BdrvFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BdrvFlags {
    fn bitor_assign(&mut self, rhs: BdrvFlags) {
        self.0 |= rhs.0;
    }
}

/// Optional storage primitives the client library was built with.
///
/// Discard and zero-fill appeared in later library releases; they are
/// selected at build time through the `discard` and `zerofill` features and
/// decide which entries the driver table advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities {
    /// Asynchronous discard of a byte range.
    pub discard: bool,
    /// Synchronous and asynchronous zero-fill of a byte range.
    pub zerofill: bool,
}

impl Capabilities {
    /// Capabilities of this build.
    pub const BUILD: Capabilities = Capabilities {
        discard: cfg!(feature = "discard"),
        zerofill: cfg!(feature = "zerofill"),
    };

    /// Neither optional primitive.
    pub const NONE: Capabilities = Capabilities {
        discard: false,
        zerofill: false,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::BUILD
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "discard={} zerofill={}", self.discard, self.zerofill)
    }
}
