//! The XM module file loader and validator (spec components B and C).
//!
//! [`load`] is the only entry point: it parses the FastTracker II v1.04 XM
//! on-disk format through [`xm_ir::Reader`]'s bounds-checked cursor, then
//! runs the post-load validator before handing back a [`xm_ir::Module`].
//! Either a fully valid module comes back, or no allocation survives.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod validate;
mod xm_format;

pub use validate::validate_postload;
pub use xm_format::load;

use xm_ir::Truncated;

/// Why a module failed to load (spec §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatError {
    /// Input ran out before a declared field or block could be read.
    Truncated,
    /// The `"Extended Module: "` magic text did not match.
    Magic,
    /// The version field was not the supported `0x0104`.
    Version,
    /// A declared dimension exceeds a hard limit or references an invalid
    /// index (pattern table entry, sample-of-note, instrument index...).
    OutOfRange,
    /// An envelope's points were not strictly increasing in frame.
    EnvelopeMalformed,
}

impl From<Truncated> for FormatError {
    fn from(_: Truncated) -> Self {
        Self::Truncated
    }
}

impl FormatError {
    /// Integer error code per spec §6 (`0=ok` is the caller's success path,
    /// so it is never produced here; `OutOfMemory` has no Rust-allocator
    /// analogue on the loader's path and is reserved for host FFI layers).
    pub fn code(self) -> u8 {
        match self {
            FormatError::Truncated => 3,
            FormatError::Magic | FormatError::Version | FormatError::OutOfRange | FormatError::EnvelopeMalformed => 1,
        }
    }
}
