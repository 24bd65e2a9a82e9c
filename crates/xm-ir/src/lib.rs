//! Core IR types for an XM tracked-music player.
//!
//! This crate defines the data model shared by the loader (`xm-formats`)
//! and the playback engine (`xm-engine`): the module/pattern/instrument/
//! sample graph, the bounds-checked byte reader both parsers build on, and
//! the `xmized` relocatable serialization codec.
//!
//! `no_std` compatible via the `alloc` crate; the `std` feature is enabled
//! by default for convenience in host binaries and tests.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod effects;
mod envelope;
mod instrument;
mod module;
mod pattern;
mod reader;
mod sample;
mod xmized;

pub use effects::{Effect, VolumeColumn};
pub use envelope::{Envelope, EnvelopePoint};
pub use instrument::{Instrument, Waveform};
pub use module::{FrequencyType, Module};
pub use pattern::{Pattern, Slot, KEY_OFF};
pub use reader::{Reader, Truncated};
pub use sample::{LoopType, Sample, SampleBytes};
pub use xmized::{decode_owned, decode_shared, encode, XmizedError};
