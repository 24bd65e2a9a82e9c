//! The top-level module graph.

use alloc::borrow::Cow;
use alloc::vec::Vec;
use arrayvec::ArrayString;

use crate::instrument::Instrument;
use crate::pattern::Pattern;

/// Selects the period-to-frequency formula (spec §3/§4.E).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrequencyType {
    #[default]
    Amiga,
    Linear,
}

/// A fully loaded (or restored) module. Generic over `'a` so the same type
/// serves both the XM loader's owned output and an `xmized` shared-const
/// restore, whose pattern/instrument collections borrow straight out of the
/// original image (Design Notes §9).
#[derive(Clone, Debug)]
pub struct Module<'a> {
    pub name: ArrayString<20>,
    pub tracker_name: ArrayString<20>,
    pub restart_position: u16,
    /// Number of valid entries in `pattern_table`.
    pub length: u16,
    pub pattern_table: Cow<'a, [u8]>,
    pub frequency_type: FrequencyType,
    pub num_channels: u8,
    /// Ticks per row, 1..31.
    pub default_tempo: u8,
    /// FT2 timebase parameter, 32..255.
    pub default_bpm: u8,
    pub patterns: Vec<Pattern<'a>>,
    pub instruments: Vec<Instrument<'a>>,
}

impl<'a> Module<'a> {
    pub fn num_patterns(&self) -> usize {
        self.patterns.len()
    }

    pub fn num_instruments(&self) -> usize {
        self.instruments.len()
    }

    /// The pattern played at pattern-table slot `table_index`, or `None` if
    /// the index is out of range or names an invalid pattern (should not
    /// happen post-validation, but the renderer never trusts this blindly).
    pub fn pattern_at(&self, table_index: u16) -> Option<&Pattern<'a>> {
        let pattern_index = *self.pattern_table.get(table_index as usize)? as usize;
        self.patterns.get(pattern_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn empty_module() -> Module<'static> {
        Module {
            name: ArrayString::new(),
            tracker_name: ArrayString::new(),
            restart_position: 0,
            length: 1,
            pattern_table: Cow::Owned(vec![0]),
            frequency_type: FrequencyType::Amiga,
            num_channels: 1,
            default_tempo: 6,
            default_bpm: 125,
            patterns: vec![Pattern::new(1, 1)],
            instruments: vec![],
        }
    }

    #[test]
    fn pattern_at_resolves_through_table() {
        let module = empty_module();
        assert!(module.pattern_at(0).is_some());
        assert!(module.pattern_at(5).is_none());
    }
}
