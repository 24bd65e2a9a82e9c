//! Volume/panning envelopes.

use arrayvec::ArrayVec;

/// A point in an envelope: frame position plus value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvelopePoint {
    /// Frame position (XM stores this as ticks since note trigger).
    pub frame: u16,
    /// Value, 0..64 for volume envelopes, 0..64 (centered at 32) for panning.
    pub value: u8,
}

/// Up to 12 points (the FT2 on-disk limit), with optional sustain and loop
/// point ranges.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub points: ArrayVec<EnvelopePoint, 12>,
    pub enabled: bool,
    pub sustain: bool,
    pub sustain_point: u8,
    pub loop_: bool,
    pub loop_start_point: u8,
    pub loop_end_point: u8,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, frame: u16, value: u8) {
        let _ = self.points.try_push(EnvelopePoint { frame, value });
    }

    /// Value at `frame`, honoring sustain (freeze at the sustain point while
    /// `sustained` is held) and loop wraparound (spec §4.E). Frame 0 if the
    /// envelope has no points.
    pub fn value_at(&self, frame: u16, sustained: bool) -> u8 {
        let Some(last) = self.points.last() else {
            return 0;
        };

        let mut frame = frame;
        if self.loop_ {
            let start = self
                .points
                .get(self.loop_start_point as usize)
                .map(|p| p.frame)
                .unwrap_or(0);
            let end = self
                .points
                .get(self.loop_end_point as usize)
                .map(|p| p.frame)
                .unwrap_or(last.frame);
            if end > start && frame >= end {
                let span = end - start;
                frame = start + (frame - start) % span.max(1);
            }
        }

        if self.sustain && sustained {
            if let Some(sp) = self.points.get(self.sustain_point as usize) {
                if frame >= sp.frame {
                    return sp.value;
                }
            }
        }

        if frame >= last.frame {
            return last.value;
        }

        let mut prev = self.points[0];
        for &point in self.points.iter() {
            if point.frame > frame {
                if point.frame == prev.frame {
                    return point.value;
                }
                let t = (frame - prev.frame) as i32;
                let d = (point.frame - prev.frame) as i32;
                let v = prev.value as i32
                    + (point.value as i32 - prev.value as i32) * t / d;
                return v as u8;
            }
            prev = point;
        }
        prev.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_envelope_is_zero() {
        assert_eq!(Envelope::new().value_at(10, false), 0);
    }

    #[test]
    fn linear_interpolation_between_points() {
        let mut env = Envelope::new();
        env.add_point(0, 64);
        env.add_point(100, 0);
        assert_eq!(env.value_at(0, false), 64);
        assert_eq!(env.value_at(50, false), 32);
        assert_eq!(env.value_at(100, false), 0);
        assert_eq!(env.value_at(200, false), 0);
    }

    #[test]
    fn sustain_freezes_at_sustain_point_while_held() {
        let mut env = Envelope::new();
        env.add_point(0, 64);
        env.add_point(10, 32);
        env.add_point(50, 0);
        env.sustain = true;
        env.sustain_point = 1;
        assert_eq!(env.value_at(30, true), 32);
        // once released, sustain no longer clamps
        assert_eq!(env.value_at(30, false), 26);
    }

    #[test]
    fn loop_wraps_between_loop_points() {
        let mut env = Envelope::new();
        env.add_point(0, 0);
        env.add_point(10, 64);
        env.add_point(20, 0);
        env.loop_ = true;
        env.loop_start_point = 0;
        env.loop_end_point = 2;
        // frame 25 wraps to (25-0)%20 = 5, which is halfway to point 1 -> 32
        assert_eq!(env.value_at(25, false), 32);
    }
}
