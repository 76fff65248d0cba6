//! Breathing: the plane sweep that removes overlaps and gaps.
//!
//! After a step executes, its tiles may overlap or drift apart. The
//! breather works one axis at a time. Each tile contributes a lesser
//! edge, a greater edge, and a center plane; planes are ordered by
//! their positions before the call, and the sweep assigns each tile an
//! after-position no earlier than the previous tile's greater edge.
//! A tile's after-edge is computed once and never pulled back, so
//! relative order is preserved.

use crate::group::Rect;

#[derive(Debug, Clone, Copy)]
pub struct TileExtent {
    /// Bounding box before the step, in the enclosing frame.
    pub before: Rect,
    /// Bounding box after the step's motions, before breathing.
    pub now: Rect,
}

#[derive(Debug, Clone, Copy)]
struct Plane {
    before: i32,
    now: i32,
    after: i32,
}

struct TilePlanes {
    index: usize,
    lesser: Plane,
    greater: Plane,
    center: Plane,
}

fn axis_planes(tiles: &[TileExtent], horizontal: bool) -> Vec<TilePlanes> {
    tiles
        .iter()
        .enumerate()
        .map(|(index, t)| {
            let (b_lo, b_hi, n_lo, n_hi) = if horizontal {
                (t.before.left, t.before.right, t.now.left, t.now.right)
            } else {
                (t.before.bottom, t.before.top, t.now.bottom, t.now.top)
            };
            let lesser = Plane {
                before: b_lo,
                now: n_lo,
                after: i32::MAX,
            };
            let greater = Plane {
                before: b_hi,
                now: n_hi,
                after: i32::MAX,
            };
            let center = Plane {
                before: (b_lo + b_hi) / 2,
                now: (n_lo + n_hi) / 2,
                after: i32::MAX,
            };
            TilePlanes {
                index,
                lesser,
                greater,
                center,
            }
        })
        .collect()
}

/// One axis of the sweep. Returns the translation for each tile.
fn sweep_axis(tiles: &[TileExtent], horizontal: bool) -> Vec<i32> {
    let mut planes = axis_planes(tiles, horizontal);
    // stable order by position before the call, tiebreak by tile index
    planes.sort_by_key(|p| (p.center.before, p.lesser.before, p.index));
    let mut shifts = vec![0; tiles.len()];
    let mut bound = i32::MIN;
    let mut previous_before_hi = i32::MIN;
    for p in planes.iter_mut() {
        let width = p.greater.now - p.lesser.now;
        let touching_before = previous_before_hi != i32::MIN && p.lesser.before <= previous_before_hi;
        let after_lo = if bound == i32::MIN {
            p.now_lo()
        } else if touching_before {
            // they were adjacent before: close any gap and any overlap
            bound
        } else {
            p.now_lo().max(bound)
        };
        p.lesser.after = after_lo;
        p.greater.after = after_lo + width;
        p.center.after = (p.lesser.after + p.greater.after) / 2;
        log::trace!(
            "plane sweep tile {}: before {}..{} now {}..{} after {}..{} center {}",
            p.index,
            p.lesser.before,
            p.greater.before,
            p.lesser.now,
            p.greater.now,
            p.lesser.after,
            p.greater.after,
            p.center.after,
        );
        shifts[p.index] = after_lo - p.now_lo();
        bound = p.greater.after;
        previous_before_hi = p.greater.before;
    }
    shifts
}

impl TilePlanes {
    fn now_lo(&self) -> i32 {
        self.lesser.now
    }
}

/// Translate each tile so edge planes no longer overlap on either
/// axis. Tiles keep their relative order; the sweep works left to
/// right and front to back.
pub fn sweep(tiles: &[TileExtent]) -> Vec<(i32, i32)> {
    if tiles.len() < 2 {
        return vec![(0, 0); tiles.len()];
    }
    // only sweep an axis when tiles actually divide along it: tiles
    // stacked in one column must not get pushed apart horizontally
    let divides = |horizontal: bool| -> bool {
        for (i, a) in tiles.iter().enumerate() {
            for b in &tiles[i + 1..] {
                let (a_lo, a_hi, b_lo, b_hi) = if horizontal {
                    (a.before.left, a.before.right, b.before.left, b.before.right)
                } else {
                    (a.before.bottom, a.before.top, b.before.bottom, b.before.top)
                };
                if a_hi <= b_lo || b_hi <= a_lo {
                    return true;
                }
            }
        }
        false
    };
    let dx = if divides(true) {
        sweep_axis(tiles, true)
    } else {
        vec![0; tiles.len()]
    };
    let dy = if divides(false) {
        sweep_axis(tiles, false)
    } else {
        vec![0; tiles.len()]
    };
    let shifts: Vec<(i32, i32)> = dx.into_iter().zip(dy).collect();
    if shifts.iter().any(|s| *s != (0, 0)) {
        log::debug!("breathe shifts: {:?}", shifts);
    }
    shifts
}
