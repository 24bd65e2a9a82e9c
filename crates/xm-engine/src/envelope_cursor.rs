//! Per-channel envelope playback cursor.

use xm_ir::Envelope;

/// Tracks a single channel's position through a volume or panning
/// envelope. Grounded on the same segment/position split used elsewhere in
/// this engine for LFO-style state, generalized to drive [`Envelope`]
/// directly instead of a generic automation curve.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvelopeCursor {
    frame: u16,
}

impl EnvelopeCursor {
    pub fn new() -> Self {
        Self { frame: 0 }
    }

    pub fn reset(&mut self) {
        self.frame = 0;
    }

    /// Jump directly to `frame` (the `Lxx` set-envelope-position effect).
    pub fn set_frame(&mut self, frame: u16) {
        self.frame = frame;
    }

    /// Advance by one tick and return the envelope's value (0..64) at the
    /// new position. `sustained` freezes at the sustain point.
    pub fn advance(&mut self, envelope: &Envelope, sustained: bool) -> u8 {
        let value = envelope.value_at(self.frame, sustained);
        self.frame = self.frame.saturating_add(1);
        value
    }

    pub fn frame(&self) -> u16 {
        self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advances_and_reads_envelope_values() {
        let mut env = Envelope::new();
        env.add_point(0, 0);
        env.add_point(2, 64);
        let mut cursor = EnvelopeCursor::new();
        assert_eq!(cursor.advance(&env, false), 0);
        assert_eq!(cursor.advance(&env, false), 32);
        assert_eq!(cursor.advance(&env, false), 64);
    }

    #[test]
    fn reset_returns_to_frame_zero() {
        let mut env = Envelope::new();
        env.add_point(0, 10);
        let mut cursor = EnvelopeCursor::new();
        cursor.advance(&env, false);
        cursor.advance(&env, false);
        cursor.reset();
        assert_eq!(cursor.frame(), 0);
    }
}
