//! Positioned dancer sets.
//!
//! A `Group` keeps its dancers in formation reading order: back row
//! first (descending y), left to right within a row (ascending x).
//! Derived groups carry a base group id plus a transform mapping local
//! coordinates into the base frame; walking the base chain with
//! `revert` reaches the absolute frame.

use crate::config::{DanceType, PRECEDENCE_SHIFT};
use crate::dancer::{DancerMask, Dancer, Facing, Gender};
use crate::formation::{spot_matches, Formation, Geometry, PatternClosure, PositionType};
use crate::grammar::VariantRef;
use crate::stage::{Context, GroupId};
use crate::transform::{self, Transform};

/// Full circle in ring x units: 8 dancers, two half-units apart.
pub const RING_CIRCUMFERENCE: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// Normal alignment; home spots are really home.
    Unrotated,
    /// Counter-clockwise by an arbitrary small angle; no home spots.
    Rotated1,
    Rotated2,
    Rotated3,
    /// Counter-clockwise by 45 degrees; no home spots.
    Diagonal,
    Rotated5,
    Rotated6,
    Rotated7,
}

pub fn rotate_by(n: i32) -> Rotation {
    const ALL: [Rotation; 8] = [
        Rotation::Unrotated,
        Rotation::Rotated1,
        Rotation::Rotated2,
        Rotation::Rotated3,
        Rotation::Diagonal,
        Rotation::Rotated5,
        Rotation::Rotated6,
        Rotation::Rotated7,
    ];
    ALL[n.rem_euclid(8) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
    pub top: i32,
}

impl Rect {
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.top - self.bottom
    }

    pub fn center(&self) -> (i32, i32) {
        (
            (self.left + self.right).div_euclid(2),
            (self.bottom + self.top).div_euclid(2),
        )
    }

    /// Overlap requires shared area; touching edges do not count.
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.left < other.right && other.left < self.right && self.bottom < other.top && other.bottom < self.top
    }

    pub fn coincident(&self, other: &Rect) -> bool {
        self.center() == other.center()
    }

    pub fn enclose(&mut self, other: &Rect) {
        self.left = self.left.min(other.left);
        self.right = self.right.max(other.right);
        self.bottom = self.bottom.min(other.bottom);
        self.top = self.top.max(other.top);
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    dancers: Vec<Dancer>,
    geometry: Geometry,
    home_geometry: Geometry,
    rotation: Rotation,
    transform: Transform,
    base: Option<GroupId>,
    tiled: bool,
    /// For groups produced by a formation match: the spot kind each
    /// dancer landed on, keyed by dancer index.
    spot_kinds: Vec<(u8, PositionType)>,
}

impl Group {
    pub fn from_dancers(geometry: Geometry, dancers: Vec<Dancer>) -> Group {
        let mut g = Group {
            dancers,
            geometry,
            home_geometry: geometry,
            rotation: Rotation::Unrotated,
            transform: transform::IDENTITY,
            base: None,
            tiled: false,
            spot_kinds: Vec::new(),
        };
        g.done();
        g
    }

    /// Derived group: empty dancer list in the same frame family.
    pub fn derived(base_id: GroupId, base: &Group, transform: Transform) -> Group {
        Group {
            dancers: Vec::new(),
            geometry: base.geometry,
            home_geometry: base.home_geometry,
            rotation: base.rotation,
            transform,
            base: Some(base_id),
            tiled: false,
            spot_kinds: Vec::new(),
        }
    }

    /// The absolute squared-set starting arrangement.
    pub fn home(dance_type: DanceType) -> Group {
        let couples: &[(u8, i32, i32, Facing)] = match dance_type {
            DanceType::TwoCouple => &[(1, 0, -3, Facing::Back), (3, 0, 3, Facing::Front)],
            DanceType::SixCouple => &[
                (1, 0, -4, Facing::Back),
                (2, 4, -2, Facing::Left),
                (3, 4, 2, Facing::Left),
                (4, 0, 4, Facing::Front),
                (5, -4, 2, Facing::Right),
                (6, -4, -2, Facing::Right),
            ],
            _ => &[
                (1, 0, -3, Facing::Back),
                (2, 3, 0, Facing::Left),
                (3, 0, 3, Facing::Front),
                (4, -3, 0, Facing::Right),
            ],
        };
        let mut dancers = Vec::new();
        for &(couple, cx, cy, facing) in couples {
            // the girl dances on the boy's right
            let (rx, ry) = right_vector(facing);
            dancers.push(Dancer::new(cx - rx, cy - ry, facing, Gender::Boy, couple));
            dancers.push(Dancer::new(cx + rx, cy + ry, facing, Gender::Girl, couple));
        }
        let geometry = match dance_type {
            DanceType::Hexagonal => Geometry::Hexagonal,
            _ => Geometry::Grid,
        };
        Group::from_dancers(geometry, dancers)
    }

    /// Sort into reading order and freeze. Ring coordinates wrap.
    pub fn done(&mut self) {
        if self.geometry == Geometry::Ring {
            for d in &mut self.dancers {
                d.x = d.x.rem_euclid(RING_CIRCUMFERENCE);
            }
            self.dancers.sort_by_key(|d| (d.x, d.y));
        } else {
            self.dancers.sort_by_key(|d| (-d.y, d.x));
        }
    }

    pub fn dancers(&self) -> &[Dancer] {
        &self.dancers
    }

    pub fn dancer(&self, i: usize) -> &Dancer {
        &self.dancers[i]
    }

    pub fn dancer_count(&self) -> usize {
        self.dancers.len()
    }

    pub fn real_dancer_count(&self) -> usize {
        self.dancers.iter().filter(|d| !d.is_phantom()).count()
    }

    pub fn insert(&mut self, dancer: Dancer) {
        self.dancers.push(dancer);
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn set_geometry(&mut self, geometry: Geometry) {
        self.geometry = geometry;
    }

    pub fn home_geometry(&self) -> Geometry {
        self.home_geometry
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: Rotation) {
        self.rotation = rotation;
    }

    pub fn base(&self) -> Option<GroupId> {
        self.base
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn tiled(&self) -> bool {
        self.tiled
    }

    pub fn set_tiled(&mut self) {
        self.tiled = true;
    }

    pub fn spot_kinds(&self) -> &[(u8, PositionType)] {
        &self.spot_kinds
    }

    pub fn set_spot_kinds(&mut self, kinds: Vec<(u8, PositionType)>) {
        self.spot_kinds = kinds;
    }

    pub fn dancer_mask(&self) -> DancerMask {
        self.dancers.iter().map(|d| d.bit()).fold(0, |a, b| a | b)
    }

    pub fn dancer_by_index(&self, index: u8) -> Option<&Dancer> {
        self.dancers.iter().find(|d| d.index() == index)
    }

    pub fn dancer_by_location(&self, x: i32, y: i32) -> Option<&Dancer> {
        if self.geometry == Geometry::Ring {
            let x = x.rem_euclid(RING_CIRCUMFERENCE);
            self.dancers.iter().find(|d| d.x.rem_euclid(RING_CIRCUMFERENCE) == x && d.y == y)
        } else {
            self.dancers.iter().find(|d| d.x == x && d.y == y)
        }
    }

    pub fn contains_index(&self, index: u8) -> bool {
        self.dancer_by_index(index).is_some()
    }

    /// Bounding box including each dancer's half-unit extent.
    pub fn bounding_box(&self) -> Rect {
        if self.dancers.is_empty() {
            return Rect::default();
        }
        let mut r = Rect {
            left: i32::MAX,
            bottom: i32::MAX,
            right: i32::MIN,
            top: i32::MIN,
        };
        for d in &self.dancers {
            r.left = r.left.min(d.x - 1);
            r.right = r.right.max(d.x + 1);
            r.bottom = r.bottom.min(d.y - 1);
            r.top = r.top.max(d.y + 1);
        }
        r
    }

    pub fn center(&self) -> (i32, i32) {
        self.bounding_box().center()
    }

    /// Center of the half of the set this dancer occupies when the set
    /// splits across its longer axis; None when the split is ambiguous.
    pub fn split_center(&self, dancer: &Dancer) -> Option<(i32, i32)> {
        let r = self.bounding_box();
        let (cx, cy) = r.center();
        if r.width() >= r.height() {
            let side: Vec<&Dancer> = self
                .dancers
                .iter()
                .filter(|d| (d.x - cx).signum() == (dancer.x - cx).signum())
                .collect();
            if (dancer.x - cx).signum() == 0 || side.is_empty() {
                return None;
            }
            let min = side.iter().map(|d| d.x).min().unwrap();
            let max = side.iter().map(|d| d.x).max().unwrap();
            Some(((min + max).div_euclid(2), cy))
        } else {
            let side: Vec<&Dancer> = self
                .dancers
                .iter()
                .filter(|d| (d.y - cy).signum() == (dancer.y - cy).signum())
                .collect();
            if (dancer.y - cy).signum() == 0 || side.is_empty() {
                return None;
            }
            let min = side.iter().map(|d| d.y).min().unwrap();
            let max = side.iter().map(|d| d.y).max().unwrap();
            Some((cx, (min + max).div_euclid(2)))
        }
    }

    pub fn has_ambiguous_facing(&self) -> bool {
        self.dancers.iter().any(|d| d.facing.is_ambiguous())
    }

    /// 180-degree rotational symmetry of the dancer arrangement.
    pub fn is_symmetric(&self) -> bool {
        self.dancers.iter().all(|d| {
            self.dancers
                .iter()
                .any(|e| e.x == -d.x && e.y == -d.y && e.facing == d.facing.reverse())
        })
    }

    /// Normalize ring x coordinates into [0, 16), re-sorting.
    pub fn normalize_ring_coordinates(&self) -> Group {
        let mut g = self.clone();
        g.done();
        g
    }

    pub fn same_shape(&self, other: &Group) -> bool {
        self.dancers.len() == other.dancers.len()
            && self
                .dancers
                .iter()
                .zip(other.dancers.iter())
                .all(|(a, b)| a.x == b.x && a.y == b.y)
    }

    pub fn equals(&self, other: &Group) -> bool {
        self.dancers == other.dancers
    }
}

fn right_vector(facing: Facing) -> (i32, i32) {
    match facing {
        Facing::Right => (0, -1),
        Facing::Back => (1, 0),
        Facing::Left => (0, 1),
        Facing::Front => (-1, 0),
        _ => (0, 0),
    }
}

// ---------------------------------------------------------------------------
// Derivation helpers working through the stage arena
// ---------------------------------------------------------------------------

/// Apply a transform, producing a derived group whose dancers live in
/// the transformed frame and whose stored transform maps back to the
/// source group.
pub fn apply_transform(ctx: &mut Context, group_id: GroupId, t: &Transform) -> GroupId {
    let source = ctx.stage.group(group_id).clone();
    let mut derived = Group::derived(group_id, &source, t.inverse());
    for d in source.dancers() {
        derived.insert(t.apply(d));
    }
    derived.done();
    ctx.stage.add_group(derived)
}

/// Select the dancers covered by `mask` (dancer-index bits) into a new
/// group in the same coordinate frame.
pub fn extract(ctx: &mut Context, group_id: GroupId, mask: DancerMask) -> GroupId {
    let source = ctx.stage.group(group_id).clone();
    let mut derived = Group::derived(group_id, &source, transform::IDENTITY);
    for d in source.dancers() {
        if mask & d.bit() != 0 {
            derived.insert(*d);
        }
    }
    derived.done();
    ctx.stage.add_group(derived)
}

/// Drop the dancers covered by `mask`.
pub fn subtract(ctx: &mut Context, group_id: GroupId, mask: DancerMask) -> GroupId {
    let full = ctx.stage.group(group_id).dancer_mask();
    extract(ctx, group_id, full & !mask)
}

/// Remove phantom dancers, staying in the same frame.
pub fn remove_phantoms(ctx: &mut Context, group_id: GroupId) -> GroupId {
    let source = ctx.stage.group(group_id).clone();
    let mut derived = Group::derived(group_id, &source, transform::IDENTITY);
    for d in source.dancers() {
        if !d.is_phantom() {
            derived.insert(*d);
        }
    }
    derived.done();
    ctx.stage.add_group(derived)
}

/// Revert this group's dancers into its base frame. Dancers of the base
/// not present here are carried over unchanged.
pub fn merge(ctx: &mut Context, group_id: GroupId) -> GroupId {
    let source = ctx.stage.group(group_id).clone();
    let base_id = match source.base() {
        Some(b) => b,
        None => return group_id,
    };
    let base = ctx.stage.group(base_id).clone();
    let mut merged = base.clone();
    merged.spot_kinds.clear();
    let mut dancers: Vec<Dancer> = Vec::new();
    let moved: DancerMask = source.dancer_mask();
    for d in base.dancers() {
        if moved & d.bit() == 0 {
            dancers.push(*d);
        }
    }
    for d in source.dancers() {
        dancers.push(source.transform().apply(d));
    }
    merged.dancers = dancers;
    merged.done();
    ctx.stage.add_group(merged)
}

/// Revert dancers into the base frame, ignoring extra base dancers.
pub fn unwind(ctx: &mut Context, group_id: GroupId) -> GroupId {
    let source = ctx.stage.group(group_id).clone();
    let base_id = match source.base() {
        Some(b) => b,
        None => return group_id,
    };
    let base = ctx.stage.group(base_id).clone();
    let mut out = base.clone();
    out.spot_kinds.clear();
    out.dancers = source.dancers().iter().map(|d| source.transform().apply(d)).collect();
    out.done();
    ctx.stage.add_group(out)
}

/// Merge repeatedly until the result lives in `ancestor`'s frame.
pub fn merge_to(ctx: &mut Context, mut group_id: GroupId, ancestor: GroupId) -> GroupId {
    let mut guard = 0;
    while ctx.stage.group(group_id).base().is_some() && !same_frame(ctx, group_id, ancestor) {
        group_id = merge(ctx, group_id);
        guard += 1;
        if guard > 32 {
            break;
        }
    }
    group_id
}

fn same_frame(ctx: &Context, a: GroupId, b: GroupId) -> bool {
    if a == b {
        return true;
    }
    let ga = ctx.stage.group(a);
    ga.base() == ctx.stage.group(b).base() && *ga.transform() == *ctx.stage.group(b).transform()
}

/// Walk the base chain to the root (absolute) frame.
pub fn root(ctx: &Context, mut group_id: GroupId) -> GroupId {
    while let Some(base) = ctx.stage.group(group_id).base() {
        group_id = base;
    }
    group_id
}

/// Try to pin down ambiguous facings by copying each dancer's facing
/// from the root group's dancer with the same index.
pub fn disambiguate_from_root(ctx: &mut Context, group_id: GroupId) -> Option<GroupId> {
    let root_id = root(ctx, group_id);
    if root_id == group_id {
        return None;
    }
    let source = ctx.stage.group(group_id).clone();
    let rootg = ctx.stage.group(root_id).clone();
    let mut resolved = source.clone();
    for d in &mut resolved.dancers {
        if d.facing.is_ambiguous() {
            let facing = rootg.dancer_by_index(d.index())?.facing;
            if facing.is_ambiguous() {
                return None;
            }
            // the root facing is in the root frame; walk it down
            d.facing = facing_in_local_frame(ctx, group_id, facing);
        }
    }
    Some(ctx.stage.add_group(resolved))
}

fn facing_in_local_frame(ctx: &Context, group_id: GroupId, mut facing: Facing) -> Facing {
    // collect the transform chain root-to-local, then revert downwards
    let mut chain = Vec::new();
    let mut id = group_id;
    loop {
        let g = ctx.stage.group(id);
        match g.base() {
            Some(base) => {
                chain.push(*g.transform());
                id = base;
            }
            None => break,
        }
    }
    for t in chain.iter().rev() {
        facing = t.revert_facing(facing);
    }
    facing
}

// ---------------------------------------------------------------------------
// Formation matching
// ---------------------------------------------------------------------------

/// Walk a formation's significant spots anchored at `start_with`.
/// Returns the matched dancer mask and the spot kind each landed on.
fn match_spots(
    formation: &Formation,
    group: &Group,
    base: Option<&Group>,
    start_with: usize,
    closure: &PatternClosure,
) -> Option<(DancerMask, Vec<(u8, PositionType)>)> {
    let count = group.dancer_count();
    if start_with >= count {
        return None;
    }
    if count - start_with < formation.dancer_count() {
        return None;
    }
    match formation.geometry() {
        Geometry::Grid | Geometry::Ring | Geometry::Hexagonal => {
            if group.geometry() != formation.geometry() {
                return None;
            }
        }
        Geometry::Unspecified => {}
    }
    if formation.first_dancer_row() < 0 {
        return None;
    }
    let anchor = *group.dancer(start_with);
    let rows = formation.rows();
    let fdr = formation.first_dancer_row() as usize;
    let fdc = formation.first_dancer_column() as usize;
    let anchor_spot = rows[fdr][fdc];
    if !spot_matches(&anchor, &anchor_spot, closure) {
        return None;
    }
    // rows advance toward the front of the hall: spot (row, column)
    // corresponds to group coordinates (column - x_offset, y_offset - row)
    let x_offset = formation.first_dancer_column() - anchor.x;
    let y_offset = anchor.y + formation.first_dancer_row() as i32;
    let mut mask = anchor.bit();
    let mut kinds = vec![(anchor.index(), anchor_spot.position)];
    let mut row = 0usize;
    let mut column = formation.first_significant_column() as usize;
    for _ in 0..formation.significant_count() {
        if row >= rows.len() {
            return None;
        }
        let x1 = column as i32 - x_offset;
        let y1 = y_offset - row as i32;
        let spot = rows[row][column];
        match spot.position {
            PositionType::Inactive => {
                let base = base?;
                if group.dancer_by_location(x1, y1).is_some() {
                    // occupied by an active dancer
                    return None;
                }
                let (bx, by) = group.transform().apply_point(x1, y1);
                let bd = base.dancer_by_location(bx, by)?;
                let mut local = *bd;
                local.facing = group.transform().revert_facing(bd.facing);
                if !spot_matches(&local, &spot, closure) {
                    return None;
                }
            }
            _ => {
                if !(row == fdr && column == fdc) {
                    let d = *group.dancer_by_location(x1, y1)?;
                    if !spot_matches(&d, &spot, closure) {
                        return None;
                    }
                    if mask & d.bit() != 0 {
                        return None;
                    }
                    mask |= d.bit();
                    kinds.push((d.index(), spot.position));
                }
            }
        }
        formation.next_significant_spot(&mut row, &mut column);
    }
    Some((mask, kinds))
}

/// The orientations a formation must be tried in: all four for an
/// asymmetric formation, two at symmetry 2, one at symmetry 4.
pub fn orientations_for(formation: &Formation) -> usize {
    (4 / formation.rotational_symmetry().max(1)) as usize
}

struct Candidate {
    id: GroupId,
    group: Group,
}

fn rotated_candidates(ctx: &mut Context, group_id: GroupId, formation: &Formation) -> Vec<Candidate> {
    let tries = orientations_for(formation);
    let mut out = Vec::with_capacity(tries);
    for (k, t) in transform::rotations().into_iter().enumerate() {
        if k >= tries {
            break;
        }
        let id = if k == 0 { group_id } else { apply_transform(ctx, group_id, &t) };
        out.push(Candidate {
            id,
            group: ctx.stage.group(id).clone(),
        });
    }
    out
}

fn finish_match(
    ctx: &mut Context,
    candidate: &Candidate,
    mask: DancerMask,
    kinds: Vec<(u8, PositionType)>,
) -> GroupId {
    let mut matched: Vec<Dancer> = candidate
        .group
        .dancers()
        .iter()
        .filter(|d| mask & d.bit() != 0)
        .copied()
        .collect();
    let mut r = Rect {
        left: i32::MAX,
        bottom: i32::MAX,
        right: i32::MIN,
        top: i32::MIN,
    };
    for d in &matched {
        r.left = r.left.min(d.x);
        r.right = r.right.max(d.x);
        r.bottom = r.bottom.min(d.y);
        r.top = r.top.max(d.y);
    }
    let (cx, cy) = r.center();
    for d in &mut matched {
        d.x -= cx;
        d.y -= cy;
    }
    // local -> candidate frame: undo the recentering translation
    let mut derived = Group::derived(candidate.id, &candidate.group, Transform::translate(cx, cy));
    derived.dancers = matched;
    derived.done();
    derived.set_spot_kinds(kinds);
    derived.set_tiled();
    ctx.stage.add_group(derived)
}

/// Match a formation against the whole group. The oriented result is a
/// derived group normalized to a local coordinate system.
pub fn match_formation(
    ctx: &mut Context,
    group_id: GroupId,
    formation: &Formation,
    closure: &PatternClosure,
) -> Option<GroupId> {
    let base_id = ctx.stage.group(group_id).base();
    for candidate in rotated_candidates(ctx, group_id, formation) {
        let base = base_id.map(|b| ctx.stage.group(b).clone());
        let full = candidate.group.dancer_mask();
        for start in 0..candidate.group.dancer_count() {
            if let Some((mask, kinds)) = match_spots(formation, &candidate.group, base.as_ref(), start, closure) {
                if mask == full {
                    if ctx.config.verbose_matching {
                        log::debug!("formation {} matched whole group", formation.name());
                    }
                    return Some(finish_match(ctx, &candidate, mask, kinds));
                }
            }
        }
    }
    None
}

/// Like `match_formation`, but any covered subset is a hit. Returns the
/// oriented sub-group and the matched mask in group dancer-index terms.
pub fn match_some_formation(
    ctx: &mut Context,
    group_id: GroupId,
    formation: &Formation,
    closure: &PatternClosure,
    available: DancerMask,
) -> Option<(GroupId, DancerMask)> {
    let base_id = ctx.stage.group(group_id).base();
    for candidate in rotated_candidates(ctx, group_id, formation) {
        let base = base_id.map(|b| ctx.stage.group(b).clone());
        for start in 0..candidate.group.dancer_count() {
            if candidate.group.dancer(start).bit() & available == 0 {
                continue;
            }
            if let Some((mask, kinds)) = match_spots(formation, &candidate.group, base.as_ref(), start, closure) {
                if mask & !available != 0 {
                    continue;
                }
                return Some((finish_match(ctx, &candidate, mask, kinds), mask));
            }
        }
    }
    None
}

/// Phantom matching: anchor the formation's bounding box on the group's
/// center and fill unoccupied dancer spots with phantoms. Succeeds only
/// when at least one real dancer participates.
pub fn match_with_phantoms(
    ctx: &mut Context,
    group_id: GroupId,
    formation: &Formation,
    closure: &PatternClosure,
) -> Option<GroupId> {
    let group = ctx.stage.group(group_id).clone();
    match formation.geometry() {
        Geometry::Grid | Geometry::Ring | Geometry::Hexagonal => {
            if group.geometry() != formation.geometry() {
                return None;
            }
        }
        Geometry::Unspecified => {}
    }
    if formation.first_dancer_row() < 0 {
        return None;
    }
    let rows = formation.rows();
    let x_offset = (formation.max_positions() as i32) / 2;
    let y_offset = (rows.len() as i32) / 2;
    let mut row = 0usize;
    let mut column = formation.first_significant_column() as usize;
    let mut matched = 0;
    let mut out: Vec<Dancer> = Vec::new();
    let mut kinds: Vec<(u8, PositionType)> = Vec::new();
    let real = group.real_dancer_count() as u8;
    for _ in 0..formation.significant_count() {
        if row >= rows.len() {
            return None;
        }
        let x1 = column as i32 - x_offset;
        let y1 = y_offset - row as i32;
        let spot = rows[row][column];
        if spot.position != PositionType::Inactive {
            match group.dancer_by_location(x1, y1) {
                Some(d) if spot_matches(d, &spot, closure) => {
                    matched += 1;
                    out.push(*d);
                    kinds.push((d.index(), spot.position));
                }
                _ => {
                    let index = ctx.stage.next_phantom(real.max(8));
                    let phantom = Dancer::with_index(
                        x1,
                        y1,
                        spot.facing,
                        spot.position.implied_gender(),
                        0,
                        index,
                    );
                    out.push(phantom);
                    kinds.push((index, spot.position));
                }
            }
        }
        formation.next_significant_spot(&mut row, &mut column);
    }
    if matched == 0 {
        return None;
    }
    let mut derived = Group::derived(group_id, &group, transform::IDENTITY);
    derived.dancers = out;
    derived.done();
    derived.set_spot_kinds(kinds);
    derived.set_tiled();
    Some(ctx.stage.add_group(derived))
}

// ---------------------------------------------------------------------------
// Tiling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileAction {
    /// Unmatched dancers fail the tiling.
    All,
    /// Unmatched dancers are left out.
    AnyWhoCan,
    /// Unmatched positions are filled with phantoms.
    WithPhantoms,
}

/// One tileable pattern: a formation name plus its provenance.
#[derive(Debug, Clone)]
pub struct TileSpec {
    pub formation: String,
    pub variant: Option<VariantRef>,
    pub precedence: u32,
}

#[derive(Debug, Clone)]
pub struct TileMatch {
    pub dancers: GroupId,
    pub variant: Option<VariantRef>,
    pub mask: DancerMask,
    /// Index into the tile list, for declaration-order tie breaks.
    pub spec_index: usize,
    pub precedence: u32,
}

fn tiling_score(tiles: &[&TileMatch]) -> u64 {
    tiles
        .iter()
        .map(|t| 1u64 << (t.precedence * PRECEDENCE_SHIFT))
        .sum()
}

/// Partition the group into non-overlapping pattern matches.
///
/// Every maximal cover is enumerated; ties break by precedence score
/// (higher wins), then by earlier declaration order of the chosen
/// specs. With `TileAction::All` every dancer must be covered.
pub fn build_tiling(
    ctx: &mut Context,
    group_id: GroupId,
    specs: &[TileSpec],
    closure: &PatternClosure,
    action: TileAction,
) -> Option<Vec<TileMatch>> {
    let full = ctx.stage.group(group_id).dancer_mask();
    let order: Vec<DancerMask> = ctx.stage.group(group_id).dancers().iter().map(|d| d.bit()).collect();
    // gather every single-tile match up front
    let mut all: Vec<TileMatch> = Vec::new();
    for (spec_index, spec) in specs.iter().enumerate() {
        let grammar = ctx.grammar;
        let formation = match grammar.formation(&spec.formation) {
            Some(f) => f,
            None => continue,
        };
        // one probe per anchor dancer keeps overlapping alternatives
        for anchor_bit in &order {
            if let Some((dancers, mask)) =
                match_some_anchored(ctx, group_id, formation, closure, *anchor_bit)
            {
                if !all.iter().any(|t| t.mask == mask && t.spec_index == spec_index) {
                    all.push(TileMatch {
                        dancers,
                        variant: spec.variant,
                        mask,
                        spec_index,
                        precedence: spec.precedence,
                    });
                }
            }
        }
    }
    if all.is_empty() {
        return None;
    }
    let mut best: Option<(u64, Vec<usize>, Vec<TileMatch>)> = None;
    let mut chosen: Vec<usize> = Vec::new();
    search_cover(&order, &all, full, &mut chosen, action, &mut best);
    let (_, _, tiles) = best?;
    if tiles.is_empty() {
        None
    } else {
        Some(tiles)
    }
}

fn match_some_anchored(
    ctx: &mut Context,
    group_id: GroupId,
    formation: &Formation,
    closure: &PatternClosure,
    anchor_bit: DancerMask,
) -> Option<(GroupId, DancerMask)> {
    let base_id = ctx.stage.group(group_id).base();
    for candidate in rotated_candidates(ctx, group_id, formation) {
        let base = base_id.map(|b| ctx.stage.group(b).clone());
        for start in 0..candidate.group.dancer_count() {
            if candidate.group.dancer(start).bit() != anchor_bit {
                continue;
            }
            if let Some((mask, kinds)) = match_spots(formation, &candidate.group, base.as_ref(), start, closure) {
                return Some((finish_match(ctx, &candidate, mask, kinds), mask));
            }
        }
    }
    None
}

fn search_cover(
    order: &[DancerMask],
    all: &[TileMatch],
    remaining: DancerMask,
    chosen: &mut Vec<usize>,
    action: TileAction,
    best: &mut Option<(u64, Vec<usize>, Vec<TileMatch>)>,
) {
    if remaining == 0 {
        let tiles: Vec<&TileMatch> = chosen.iter().map(|&i| &all[i]).collect();
        if tiles.is_empty() {
            return;
        }
        let score = tiling_score(&tiles);
        let key: Vec<usize> = chosen.iter().map(|&i| all[i].spec_index).collect();
        let replace = match best {
            None => true,
            Some((s, k, _)) => score > *s || (score == *s && key < *k),
        };
        if replace {
            *best = Some((score, key, chosen.iter().map(|&i| all[i].clone()).collect()));
        }
        return;
    }
    // lowest uncovered dancer in reading order
    let next = match order.iter().find(|b| remaining & **b != 0) {
        Some(b) => *b,
        None => return,
    };
    let mut advanced = false;
    for (i, tile) in all.iter().enumerate() {
        if tile.mask & next != 0 && tile.mask & !remaining == 0 {
            chosen.push(i);
            search_cover(order, all, remaining & !tile.mask, chosen, action, best);
            chosen.pop();
            advanced = true;
        }
    }
    if !advanced && action != TileAction::All {
        // leave this dancer out
        search_cover(order, all, remaining & !next, chosen, action, best);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::grammar::Grammar;

    fn context(grammar: &Grammar) -> Context<'_> {
        Context::new(grammar, Config::default())
    }

    fn empty_grammar() -> Grammar {
        Grammar::new(&Config::default())
    }

    fn wave_formation() -> Formation {
        let mut f = Formation::new("wave", Geometry::Unspecified);
        assert!(f.add_row("a^ . av . a^ . av"));
        f
    }

    fn rh_wave_dancers() -> Vec<Dancer> {
        vec![
            Dancer::new(-3, 0, Facing::Back, Gender::Boy, 1),
            Dancer::new(-1, 0, Facing::Front, Gender::Girl, 2),
            Dancer::new(1, 0, Facing::Back, Gender::Boy, 3),
            Dancer::new(3, 0, Facing::Front, Gender::Girl, 4),
        ]
    }

    #[test]
    fn groups_sort_into_reading_order() {
        let g = Group::from_dancers(
            Geometry::Grid,
            vec![
                Dancer::new(1, -2, Facing::Back, Gender::Boy, 1),
                Dancer::new(-1, 2, Facing::Front, Gender::Girl, 2),
                Dancer::new(1, 2, Facing::Front, Gender::Boy, 2),
            ],
        );
        // back row first, left to right
        assert_eq!((g.dancer(0).x, g.dancer(0).y), (-1, 2));
        assert_eq!((g.dancer(1).x, g.dancer(1).y), (1, 2));
        assert_eq!((g.dancer(2).x, g.dancer(2).y), (1, -2));
    }

    #[test]
    fn home_squared_set_has_eight_dancers() {
        let home = Group::home(DanceType::FourCouple);
        assert_eq!(home.dancer_count(), 8);
        assert_eq!(home.real_dancer_count(), 8);
        // couple 1 stands at the front facing the back of the hall
        let boy1 = home.dancer_by_index(crate::dancer::dancer_index(1, Gender::Boy)).unwrap();
        assert_eq!((boy1.x, boy1.y), (-1, -3));
        assert_eq!(boy1.facing, Facing::Back);
        let girl1 = home.dancer_by_index(crate::dancer::dancer_index(1, Gender::Girl)).unwrap();
        assert_eq!((girl1.x, girl1.y), (1, -3));
    }

    #[test]
    fn bounding_box_covers_dancer_extent() {
        let home = Group::home(DanceType::FourCouple);
        let r = home.bounding_box();
        assert_eq!((r.left, r.right), (-4, 4));
        assert_eq!((r.bottom, r.top), (-4, 4));
        assert_eq!(r.center(), (0, 0));
    }

    #[test]
    fn wave_matches_identity_orientation() {
        let grammar = empty_grammar();
        let mut ctx = context(&grammar);
        let wave = ctx.stage.add_group(Group::from_dancers(Geometry::Grid, rh_wave_dancers()));
        let formation = wave_formation();
        let matched = match_formation(&mut ctx, wave, &formation, &PatternClosure::default());
        let matched = matched.expect("wave should match");
        let g = ctx.stage.group(matched);
        assert_eq!(g.dancer_count(), 4);
        assert!(g.tiled());
        // recentered on the local origin
        assert_eq!(g.center(), (0, 0));
    }

    #[test]
    fn wave_matches_rotated_group() {
        let grammar = empty_grammar();
        let mut ctx = context(&grammar);
        // the same wave turned a quarter left: a vertical column
        let dancers = vec![
            Dancer::new(0, -3, Facing::Left, Gender::Boy, 1),
            Dancer::new(0, -1, Facing::Right, Gender::Girl, 2),
            Dancer::new(0, 1, Facing::Left, Gender::Boy, 3),
            Dancer::new(0, 3, Facing::Right, Gender::Girl, 4),
        ];
        let column = ctx.stage.add_group(Group::from_dancers(Geometry::Grid, dancers));
        let formation = wave_formation();
        assert_eq!(formation.rotational_symmetry(), 2);
        let matched = match_formation(&mut ctx, column, &formation, &PatternClosure::default());
        assert!(matched.is_some(), "rotated wave should match via orientation enumeration");
    }

    #[test]
    fn mismatched_facing_fails() {
        let grammar = empty_grammar();
        let mut ctx = context(&grammar);
        let dancers = vec![
            Dancer::new(-3, 0, Facing::Back, Gender::Boy, 1),
            Dancer::new(-1, 0, Facing::Back, Gender::Girl, 2),
            Dancer::new(1, 0, Facing::Back, Gender::Boy, 3),
            Dancer::new(3, 0, Facing::Front, Gender::Girl, 4),
        ];
        let group = ctx.stage.add_group(Group::from_dancers(Geometry::Grid, dancers));
        let formation = wave_formation();
        assert!(match_formation(&mut ctx, group, &formation, &PatternClosure::default()).is_none());
    }

    #[test]
    fn extract_and_merge_round_trip() {
        let grammar = empty_grammar();
        let mut ctx = context(&grammar);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let mask = crate::dancer::couple_mask(1);
        let sub = extract(&mut ctx, home, mask);
        assert_eq!(ctx.stage.group(sub).dancer_count(), 2);
        let back = merge(&mut ctx, sub);
        assert_eq!(ctx.stage.group(back).dancer_count(), 8);
        assert!(ctx.stage.group(back).equals(ctx.stage.group(home)));
    }

    #[test]
    fn apply_transform_round_trips_through_merge() {
        let grammar = empty_grammar();
        let mut ctx = context(&grammar);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let mirrored = apply_transform(&mut ctx, home, &transform::MIRROR);
        assert_eq!(ctx.stage.group(mirrored).base(), Some(home));
        let back = merge(&mut ctx, mirrored);
        assert!(ctx.stage.group(back).equals(ctx.stage.group(home)));
    }

    #[test]
    fn tiling_splits_home_into_couples() {
        let config = Config::default();
        let mut grammar = Grammar::new(&config);
        let mut couple = Formation::new("couple", Geometry::Unspecified);
        assert!(couple.add_row("a? . a?"));
        grammar.add_formation(couple);
        let mut ctx = context(&grammar);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let specs = vec![TileSpec {
            formation: "couple".into(),
            variant: None,
            precedence: 0,
        }];
        let tiles = build_tiling(&mut ctx, home, &specs, &PatternClosure::default(), TileAction::All)
            .expect("home should tile into couples");
        assert_eq!(tiles.len(), 4);
        let mut covered = 0;
        for t in &tiles {
            assert_eq!(covered & t.mask, 0, "tiles must not overlap");
            covered |= t.mask;
            assert_eq!(ctx.stage.group(t.dancers).dancer_count(), 2);
        }
        assert_eq!(covered, ctx.stage.group(home).dancer_mask());
    }

    #[test]
    fn tiling_fails_when_all_required_but_uncoverable() {
        let config = Config::default();
        let mut grammar = Grammar::new(&config);
        let mut couple = Formation::new("couple", Geometry::Unspecified);
        assert!(couple.add_row("a? . a?"));
        grammar.add_formation(couple);
        let mut ctx = context(&grammar);
        // three dancers in a row cannot be covered by couples
        let dancers = vec![
            Dancer::new(-2, 0, Facing::Back, Gender::Boy, 1),
            Dancer::new(0, 0, Facing::Back, Gender::Girl, 1),
            Dancer::new(4, 0, Facing::Back, Gender::Boy, 2),
        ];
        let group = ctx.stage.add_group(Group::from_dancers(Geometry::Grid, dancers));
        let specs = vec![TileSpec {
            formation: "couple".into(),
            variant: None,
            precedence: 0,
        }];
        assert!(build_tiling(&mut ctx, group, &specs, &PatternClosure::default(), TileAction::All).is_none());
        let partial = build_tiling(
            &mut ctx,
            group,
            &specs,
            &PatternClosure::default(),
            TileAction::AnyWhoCan,
        );
        let tiles = partial.expect("any-who-can leaves the odd dancer out");
        assert_eq!(tiles.len(), 1);
    }

    #[test]
    fn phantom_match_fills_vacancies() {
        let grammar = empty_grammar();
        let mut ctx = context(&grammar);
        // two dancers of a would-be wave of four
        let dancers = vec![
            Dancer::new(-3, 0, Facing::Back, Gender::Boy, 1),
            Dancer::new(-1, 0, Facing::Front, Gender::Girl, 2),
        ];
        let group = ctx.stage.add_group(Group::from_dancers(Geometry::Grid, dancers));
        let formation = wave_formation();
        let matched = match_with_phantoms(&mut ctx, group, &formation, &PatternClosure::default());
        let matched = matched.expect("phantom fill should succeed");
        let g = ctx.stage.group(matched);
        assert_eq!(g.dancer_count(), 4);
        assert_eq!(g.real_dancer_count(), 2);
    }

    #[test]
    fn split_center_picks_the_near_half() {
        let home = Group::home(DanceType::FourCouple);
        let boy2 = *home.dancer_by_index(crate::dancer::dancer_index(2, Gender::Boy)).unwrap();
        let center = home.split_center(&boy2).expect("side dancer has a split half");
        assert!(center.0 > 0);
    }

    #[test]
    fn symmetric_home_is_symmetric() {
        let home = Group::home(DanceType::FourCouple);
        assert!(home.is_symmetric());
    }
}
