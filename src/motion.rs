//! Timed dancer trajectories.
//!
//! Every step of a plan records its dancers' movement as `Motion`
//! segments inside an `Interval`. Beats are an arbitrary measure of
//! call timing; merging intervals keeps the longest branch.

use crate::dancer::Facing;
use crate::transform::Transform;

pub type Beats = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionKind {
    /// Straight travel along the facing, possibly with lateral veer.
    Forward,
    /// Travel along a circular arc around a pivot point.
    Arc {
        center: (i32, i32),
        right_sixteenths: i32,
    },
    /// Turn in place.
    Face { right_quarters: i32 },
    /// Positional adjustment with no travel animation (breathing).
    Adjust,
}

#[derive(Debug, Clone, Copy)]
pub struct Motion {
    pub dancer: u8,
    pub beats: Beats,
    pub from: (i32, i32),
    pub to: (i32, i32),
    pub facing_from: Facing,
    pub facing_to: Facing,
    pub kind: MotionKind,
}

impl Motion {
    pub fn transformed(&self, t: &Transform) -> Motion {
        let kind = match self.kind {
            MotionKind::Arc {
                center,
                right_sixteenths,
            } => MotionKind::Arc {
                center: t.apply_point(center.0, center.1),
                right_sixteenths: if t.is_mirror() { -right_sixteenths } else { right_sixteenths },
            },
            other => other,
        };
        Motion {
            dancer: self.dancer,
            beats: self.beats,
            from: t.apply_point(self.from.0, self.from.1),
            to: t.apply_point(self.to.0, self.to.1),
            facing_from: t.apply_facing(self.facing_from),
            facing_to: t.apply_facing(self.facing_to),
            kind,
        }
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Motion {
        let kind = match self.kind {
            MotionKind::Arc {
                center,
                right_sixteenths,
            } => MotionKind::Arc {
                center: (center.0 + dx, center.1 + dy),
                right_sixteenths,
            },
            other => other,
        };
        Motion {
            from: (self.from.0 + dx, self.from.1 + dy),
            to: (self.to.0 + dx, self.to.1 + dy),
            kind,
            ..*self
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Interval {
    pub beats: Beats,
    pub motions: Vec<Motion>,
}

impl Interval {
    pub fn new() -> Interval {
        Interval {
            beats: 0,
            motions: Vec::new(),
        }
    }

    pub fn push(&mut self, motion: Motion) {
        self.beats = self.beats.max(motion.beats);
        self.motions.push(motion);
    }

    /// Merge a sub-interval whose motions are in a tile-local frame.
    pub fn merge(&mut self, other: &Interval, t: &Transform) {
        for m in &other.motions {
            self.motions.push(m.transformed(t));
        }
        self.beats = self.beats.max(other.beats);
    }

    /// Append a second interval that happens after this one.
    pub fn append(&mut self, other: &Interval) {
        self.motions.extend(other.motions.iter().copied());
        self.beats += other.beats;
    }

    pub fn is_empty(&self) -> bool {
        self.motions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform;

    fn motion(from: (i32, i32), to: (i32, i32)) -> Motion {
        Motion {
            dancer: 0,
            beats: 2,
            from,
            to,
            facing_from: Facing::Back,
            facing_to: Facing::Back,
            kind: MotionKind::Forward,
        }
    }

    #[test]
    fn interval_beats_track_longest_motion() {
        let mut i = Interval::new();
        i.push(motion((0, 0), (0, 2)));
        let mut long = motion((2, 0), (2, 4));
        long.beats = 4;
        i.push(long);
        assert_eq!(i.beats, 4);
        assert_eq!(i.motions.len(), 2);
    }

    #[test]
    fn merge_transforms_motions_into_the_outer_frame() {
        let mut outer = Interval::new();
        let mut inner = Interval::new();
        inner.push(motion((0, 0), (0, 2)));
        outer.merge(&inner, &transform::Transform::translate(4, 0));
        assert_eq!(outer.motions[0].from, (4, 0));
        assert_eq!(outer.motions[0].to, (4, 2));
    }

    #[test]
    fn arc_centers_transform_too() {
        let m = Motion {
            kind: MotionKind::Arc {
                center: (1, 1),
                right_sixteenths: 4,
            },
            ..motion((2, 0), (0, 2))
        };
        let t = transform::Transform::translate(-1, -1);
        match m.transformed(&t).kind {
            MotionKind::Arc { center, right_sixteenths } => {
                assert_eq!(center, (0, 0));
                assert_eq!(right_sixteenths, 4);
            }
            other => panic!("expected arc, got {:?}", other),
        }
    }

    #[test]
    fn mirrored_arcs_reverse_direction() {
        let m = Motion {
            kind: MotionKind::Arc {
                center: (0, 0),
                right_sixteenths: 4,
            },
            ..motion((2, 0), (0, 2))
        };
        match m.transformed(&transform::MIRROR).kind {
            MotionKind::Arc { right_sixteenths, .. } => assert_eq!(right_sixteenths, -4),
            other => panic!("expected arc, got {:?}", other),
        }
    }

    #[test]
    fn append_sums_beats() {
        let mut a = Interval::new();
        a.push(motion((0, 0), (0, 2)));
        let mut b = Interval::new();
        b.push(motion((0, 2), (0, 4)));
        a.append(&b);
        assert_eq!(a.beats, 4);
        assert_eq!(a.motions.len(), 2);
    }
}
