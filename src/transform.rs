//! Integer affine transforms between group coordinate frames.
//!
//! Only the compositions the matcher produces are representable: 90
//! degree rotations, the x-negating mirror, and translations. `apply`
//! maps local coordinates to the base frame; `revert` inverts.

use crate::dancer::{Dancer, Facing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
    x0: i32,
    x1: i32,
    x2: i32,
    y0: i32,
    y1: i32,
    y2: i32,
}

pub const IDENTITY: Transform = Transform::new(1, 0, 0, 0, 1, 0);
/// One left quarter turn: +x maps to +y.
pub const ROTATE_90: Transform = Transform::new(0, -1, 0, 1, 0, 0);
pub const ROTATE_180: Transform = Transform::new(-1, 0, 0, 0, -1, 0);
/// Three left quarter turns: +x maps to -y.
pub const ROTATE_270: Transform = Transform::new(0, 1, 0, -1, 0, 0);
pub const MIRROR: Transform = Transform::new(-1, 0, 0, 0, 1, 0);

impl Transform {
    pub const fn new(x0: i32, x1: i32, x2: i32, y0: i32, y1: i32, y2: i32) -> Transform {
        Transform { x0, x1, x2, y0, y1, y2 }
    }

    pub fn translate(offset_x: i32, offset_y: i32) -> Transform {
        Transform::new(1, 0, offset_x, 0, 1, offset_y)
    }

    /// Left quarter turns needed to rotate a local facing into the base
    /// frame. Derived from the image of the x unit vector.
    pub fn left_quarter_turns(&self) -> i32 {
        if self.x0 > 0 {
            0
        } else if self.x1 < 0 {
            1
        } else if self.x0 < 0 {
            2
        } else {
            3
        }
    }

    pub fn is_mirror(&self) -> bool {
        // reflections negate the determinant of the linear part
        self.x0 * self.y1 - self.x1 * self.y0 < 0
    }

    pub fn apply_point(&self, x: i32, y: i32) -> (i32, i32) {
        (self.x0 * x + self.x1 * y + self.x2, self.y0 * x + self.y1 * y + self.y2)
    }

    pub fn apply_facing(&self, facing: Facing) -> Facing {
        match facing {
            Facing::Right | Facing::Back | Facing::Left | Facing::Front => {
                let (vx, vy) = match facing {
                    Facing::Right => (self.x0, self.y0),
                    Facing::Left => (-self.x0, -self.y0),
                    Facing::Back => (self.x1, self.y1),
                    Facing::Front => (-self.x1, -self.y1),
                    _ => unreachable!(),
                };
                Facing::from_vector(vx, vy).unwrap_or(facing)
            }
            Facing::Head => {
                if self.x1 != 0 {
                    Facing::Side
                } else {
                    Facing::Head
                }
            }
            Facing::Side => {
                if self.y0 != 0 {
                    Facing::Head
                } else {
                    Facing::Side
                }
            }
            Facing::Any => Facing::Any,
        }
    }

    pub fn apply(&self, dancer: &Dancer) -> Dancer {
        let (x, y) = self.apply_point(dancer.x, dancer.y);
        Dancer::with_index(x, y, self.apply_facing(dancer.facing), dancer.gender, dancer.couple, dancer.index())
    }

    /// The inverse transform. The linear part is orthonormal so the
    /// inverse is its transpose with a back-rotated translation.
    pub fn inverse(&self) -> Transform {
        let ix0 = self.x0;
        let ix1 = self.y0;
        let iy0 = self.x1;
        let iy1 = self.y1;
        Transform {
            x0: ix0,
            x1: ix1,
            x2: -(ix0 * self.x2 + ix1 * self.y2),
            y0: iy0,
            y1: iy1,
            y2: -(iy0 * self.x2 + iy1 * self.y2),
        }
    }

    pub fn revert_point(&self, x: i32, y: i32) -> (i32, i32) {
        self.inverse().apply_point(x, y)
    }

    pub fn revert_facing(&self, facing: Facing) -> Facing {
        self.inverse().apply_facing(facing)
    }

    pub fn revert(&self, dancer: &Dancer) -> Dancer {
        self.inverse().apply(dancer)
    }

    /// `self` then `next`: the composed map `next(self(p))`.
    pub fn then(&self, next: &Transform) -> Transform {
        Transform {
            x0: next.x0 * self.x0 + next.x1 * self.y0,
            x1: next.x0 * self.x1 + next.x1 * self.y1,
            x2: next.x0 * self.x2 + next.x1 * self.y2 + next.x2,
            y0: next.y0 * self.x0 + next.y1 * self.y0,
            y1: next.y0 * self.x1 + next.y1 * self.y1,
            y2: next.y0 * self.x2 + next.y1 * self.y2 + next.y2,
        }
    }
}

impl Default for Transform {
    fn default() -> Transform {
        IDENTITY
    }
}

/// The four grid rotations in increasing left-quarter-turn order.
pub fn rotations() -> [Transform; 4] {
    [IDENTITY, ROTATE_90, ROTATE_180, ROTATE_270]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dancer::Gender;

    #[test]
    fn identity_leaves_points_alone() {
        assert_eq!(IDENTITY.apply_point(3, -2), (3, -2));
        assert_eq!(IDENTITY.apply_facing(Facing::Left), Facing::Left);
    }

    #[test]
    fn rotations_report_their_quarter_turns() {
        assert_eq!(IDENTITY.left_quarter_turns(), 0);
        assert_eq!(ROTATE_90.left_quarter_turns(), 1);
        assert_eq!(ROTATE_180.left_quarter_turns(), 2);
        assert_eq!(ROTATE_270.left_quarter_turns(), 3);
    }

    #[test]
    fn rotate_90_turns_points_counterclockwise() {
        assert_eq!(ROTATE_90.apply_point(2, 0), (0, 2));
        assert_eq!(ROTATE_90.apply_point(0, 2), (-2, 0));
        assert_eq!(ROTATE_90.apply_facing(Facing::Right), Facing::Back);
        assert_eq!(ROTATE_90.apply_facing(Facing::Back), Facing::Left);
    }

    #[test]
    fn revert_undoes_apply() {
        for t in rotations() {
            let t = t.then(&Transform::translate(3, -1));
            let (x, y) = t.apply_point(5, 7);
            assert_eq!(t.revert_point(x, y), (5, 7));
        }
        let m = MIRROR.then(&Transform::translate(-2, 4));
        let (x, y) = m.apply_point(1, 1);
        assert_eq!(m.revert_point(x, y), (1, 1));
    }

    #[test]
    fn facing_round_trips_through_revert() {
        for t in rotations() {
            for f in [Facing::Right, Facing::Back, Facing::Left, Facing::Front, Facing::Head, Facing::Side] {
                assert_eq!(t.revert_facing(t.apply_facing(f)), f);
            }
        }
    }

    #[test]
    fn mirror_is_self_inverse() {
        assert_eq!(MIRROR.inverse(), MIRROR);
        assert!(MIRROR.is_mirror());
        assert!(!ROTATE_180.is_mirror());
        assert_eq!(MIRROR.apply_facing(Facing::Left), Facing::Right);
    }

    #[test]
    fn composition_applies_in_order() {
        let t = ROTATE_90.then(&Transform::translate(10, 0));
        let p = t.apply_point(2, 0);
        let q = Transform::translate(10, 0).apply_point(ROTATE_90.apply_point(2, 0).0, ROTATE_90.apply_point(2, 0).1);
        assert_eq!(p, q);
    }

    #[test]
    fn transformed_dancer_keeps_identity() {
        let d = Dancer::new(1, -3, Facing::Back, Gender::Boy, 1);
        let r = ROTATE_180.apply(&d);
        assert_eq!(r.index(), d.index());
        assert_eq!((r.x, r.y), (-1, 3));
        assert_eq!(r.facing, Facing::Front);
    }
}
