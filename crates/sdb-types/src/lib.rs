#![forbid(unsafe_code)]
//! Shared core types for SliceDB.
//!
//! Unit-carrying newtypes prevent mixing block ids, byte offsets, and
//! transaction ids, and the checked arithmetic helpers make every
//! offset computation an explicit overflow decision.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of a persistent block, assigned densely by the serializer.
///
/// Ids are totally ordered and unique for the lifetime of a cache bound
/// to that serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

/// Identifier of a cache transaction, unique per cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Byte offset into a serializer image (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

/// Validated block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

/// Access mode for transactions and per-block locks.
///
/// `Read` and `Write` are the ordinary shared/exclusive modes.
/// `IntentRead` and `IntentWrite` coexist with readers; at most one
/// intent of either kind is held at a time, and `IntentWrite` may
/// upgrade to `Write` once the readers drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    IntentRead,
    Write,
    IntentWrite,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("invalid field: {field} ({reason})")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, FieldError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(FieldError::Invalid {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size in bytes as a `usize` (infallible on supported targets).
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Byte offset of a block in an image, `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, block: BlockId) -> Option<ByteOffset> {
        block.0.checked_mul(u64::from(self.0)).map(ByteOffset)
    }
}

impl BlockId {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block for a given block size.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<ByteOffset> {
        block_size.block_to_byte(self)
    }
}

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `FieldError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, FieldError> {
        usize::try_from(self.0).map_err(|_| FieldError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

impl Access {
    /// True for the exclusive mode.
    #[must_use]
    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::Write)
    }

    /// True for either intent mode.
    #[must_use]
    pub fn is_intent(self) -> bool {
        matches!(self, Self::IntentRead | Self::IntentWrite)
    }

    /// True for modes that may modify block contents.
    #[must_use]
    pub fn is_write_mode(self) -> bool {
        matches!(self, Self::Write | Self::IntentWrite)
    }

    /// Whether a transaction opened in `self` may take a block lock in
    /// `requested`. A read transaction never escalates to a write mode.
    #[must_use]
    pub fn permits(self, requested: Access) -> bool {
        if self.is_write_mode() {
            true
        } else {
            !requested.is_write_mode()
        }
    }
}

/// Narrow a `u64` to `usize` with an explicit error path.
///
/// On 64-bit platforms this is infallible; on 32-bit it can fail.
/// The `field` label is included in the error for diagnostics.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, FieldError> {
    usize::try_from(value).map_err(|_| FieldError::IntegerConversion { field })
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Read => "read",
            Self::IntentRead => "intent-read",
            Self::Write => "write",
            Self::IntentWrite => "intent-write",
        };
        f.write_str(label)
    }
}
