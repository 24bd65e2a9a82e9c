//! Tracked-module playback engine: tick/row state machine, per-channel
//! mixer, and the read-only query/control surface used to drive playback
//! from a host.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod channel;
mod envelope_cursor;
mod frequency;
mod mixer;
mod player;

pub use channel::{ChannelState, Lfo};
pub use envelope_cursor::EnvelopeCursor;
pub use frequency::{frequency_to_step, note_to_period, note_to_step, period_to_frequency};
pub use mixer::{render_channel, Interpolation, RAMP_STEP};
pub use player::Player;
