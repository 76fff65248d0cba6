//! Formation diagrams.
//!
//! A formation is a rectangular grid of spots parsed from rows of
//! two-character markers (position letter + facing glyph) with
//! single-character relational markers between them. Row 0 is the back
//! of the hall; columns advance toward the caller's right.

use std::cell::Cell;
use std::fmt::Write as _;

use crate::dancer::{DancerMask, Dancer, Facing, Gender};
use crate::group::Group;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionType {
    /// `a`
    Active,
    /// `b`
    ActiveBoy,
    /// `g`
    ActiveGirl,
    /// `d`
    ActiveDesignated,
    /// `n`
    ActiveNondesignated,
    /// `c`
    Center,
    /// `e`
    End,
    /// `C`
    VeryCenter,
    /// `E`
    VeryEnd,
    /// `i`
    Inactive,
    /// `.`
    Empty,
    /// `-`
    SameRow,
    /// `|`
    SameColumn,
    /// `<`
    ToTheLeft,
    /// `^`
    ToTheBack,
    /// `\` wraps to the beginning of a ring
    Wrap,
}

impl PositionType {
    /// Spots that stand for a dancer position.
    pub fn is_dancer(self) -> bool {
        matches!(
            self,
            PositionType::Active
                | PositionType::ActiveBoy
                | PositionType::ActiveGirl
                | PositionType::ActiveDesignated
                | PositionType::ActiveNondesignated
                | PositionType::Center
                | PositionType::End
                | PositionType::VeryCenter
                | PositionType::VeryEnd
        )
    }

    /// Spots that constrain the match (dancers plus inactive holes).
    pub fn is_significant(self) -> bool {
        self.is_dancer() || self == PositionType::Inactive
    }

    pub fn glyph(self) -> char {
        match self {
            PositionType::Active => 'a',
            PositionType::ActiveBoy => 'b',
            PositionType::ActiveGirl => 'g',
            PositionType::ActiveDesignated => 'd',
            PositionType::ActiveNondesignated => 'n',
            PositionType::Center => 'c',
            PositionType::End => 'e',
            PositionType::VeryCenter => 'C',
            PositionType::VeryEnd => 'E',
            PositionType::Inactive => 'i',
            PositionType::Empty => '.',
            PositionType::SameRow => '-',
            PositionType::SameColumn => '|',
            PositionType::ToTheLeft => '<',
            PositionType::ToTheBack => '^',
            PositionType::Wrap => '\\',
        }
    }

    pub fn implied_gender(self) -> Gender {
        match self {
            PositionType::ActiveBoy => Gender::Boy,
            PositionType::ActiveGirl => Gender::Girl,
            _ => Gender::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spot {
    pub position: PositionType,
    pub facing: Facing,
}

impl Spot {
    pub const EMPTY: Spot = Spot {
        position: PositionType::Empty,
        facing: Facing::Any,
    };

    pub fn new(position: PositionType, facing: Facing) -> Spot {
        Spot { position, facing }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    Unspecified,
    Grid,
    Hexagonal,
    Ring,
}

/// How a matched formation treats designated-dancer spots.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternClosure {
    /// True when the pattern's parameter list is non-empty.
    pub discriminates: bool,
    /// Dancers satisfying the current call's designator.
    pub designated_mask: DancerMask,
}

impl PatternClosure {
    pub fn designating(mask: DancerMask) -> PatternClosure {
        PatternClosure {
            discriminates: true,
            designated_mask: mask,
        }
    }

    pub fn designates(&self, dancer: &Dancer) -> bool {
        self.designated_mask & dancer.bit() != 0
    }
}

/// Does this dancer satisfy a spot's position and facing requirements?
pub fn spot_matches(dancer: &Dancer, spot: &Spot, closure: &PatternClosure) -> bool {
    let position_ok = match spot.position {
        PositionType::Active
        | PositionType::Center
        | PositionType::End
        | PositionType::VeryCenter
        | PositionType::VeryEnd
        | PositionType::Inactive => true,
        PositionType::ActiveBoy => dancer.is_phantom() || dancer.gender == Gender::Boy,
        PositionType::ActiveGirl => dancer.is_phantom() || dancer.gender == Gender::Girl,
        PositionType::ActiveDesignated => !closure.discriminates || closure.designates(dancer),
        PositionType::ActiveNondesignated => !closure.discriminates || !closure.designates(dancer),
        _ => false,
    };
    position_ok && dancer.facing.satisfies(spot.facing)
}

struct DiagramScanner<'a> {
    row: &'a [u8],
    cursor: usize,
}

impl<'a> DiagramScanner<'a> {
    fn new(row: &'a str) -> DiagramScanner<'a> {
        DiagramScanner {
            row: row.as_bytes(),
            cursor: 0,
        }
    }

    /// Next spot, None at end of row, Err on a malformed marker.
    fn scan(&mut self) -> Result<Option<Spot>, ()> {
        while self.cursor < self.row.len() {
            let c = self.row[self.cursor];
            self.cursor += 1;
            let position = match c {
                b'i' => PositionType::Inactive,
                b'a' => PositionType::Active,
                b'b' => PositionType::ActiveBoy,
                b'g' => PositionType::ActiveGirl,
                b'd' => PositionType::ActiveDesignated,
                b'n' => PositionType::ActiveNondesignated,
                b'c' => PositionType::Center,
                b'e' => PositionType::End,
                b'C' => PositionType::VeryCenter,
                b'E' => PositionType::VeryEnd,
                b' ' | b'\t' => continue,
                b'.' => return Ok(Some(Spot::new(PositionType::Empty, Facing::Any))),
                b'-' => return Ok(Some(Spot::new(PositionType::SameRow, Facing::Any))),
                b'|' => return Ok(Some(Spot::new(PositionType::SameColumn, Facing::Any))),
                b'<' => return Ok(Some(Spot::new(PositionType::ToTheLeft, Facing::Any))),
                b'^' => return Ok(Some(Spot::new(PositionType::ToTheBack, Facing::Any))),
                b'\\' => return Ok(Some(Spot::new(PositionType::Wrap, Facing::Any))),
                _ => return Err(()),
            };
            let facing = self.scan_facing()?;
            return Ok(Some(Spot::new(position, facing)));
        }
        Ok(None)
    }

    fn scan_facing(&mut self) -> Result<Facing, ()> {
        if self.cursor >= self.row.len() {
            return Err(());
        }
        let c = self.row[self.cursor];
        self.cursor += 1;
        match c {
            b'>' => Ok(Facing::Right),
            b'<' => Ok(Facing::Left),
            b'^' => Ok(Facing::Back),
            b'v' => Ok(Facing::Front),
            b'|' => Ok(Facing::Head),
            b'-' => Ok(Facing::Side),
            b'?' => Ok(Facing::Any),
            _ => Err(()),
        }
    }
}

pub const DANCER_POSITION_KINDS: usize = 10;

#[derive(Debug)]
pub struct Formation {
    name: String,
    geometry: Geometry,
    created: i64,
    modified: i64,
    rows: Vec<Vec<Spot>>,
    max_positions: usize,
    dancer_count: usize,
    significant_count: usize,
    first_significant_column: i32,
    first_dancer_row: i32,
    first_dancer_column: i32,
    dancer_types: [usize; DANCER_POSITION_KINDS],
    /// 0 until calculated; then 1, 2, or 4.
    symmetry: Cell<i32>,
    // bias_x/bias_y track leading blank prefixes inserted while editing,
    // so spot coordinates handed out earlier stay stable
    bias_x: i32,
    bias_y: i32,
}

impl Formation {
    pub fn new(name: impl Into<String>, geometry: Geometry) -> Formation {
        Formation {
            name: name.into(),
            geometry,
            created: 0,
            modified: 0,
            rows: Vec::new(),
            max_positions: 0,
            dancer_count: 0,
            significant_count: 0,
            first_significant_column: -1,
            first_dancer_row: -1,
            first_dancer_column: -1,
            dancer_types: [0; DANCER_POSITION_KINDS],
            symmetry: Cell::new(0),
            bias_x: 0,
            bias_y: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn set_geometry(&mut self, geometry: Geometry) {
        self.geometry = geometry;
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn modified(&self) -> i64 {
        self.modified
    }

    pub fn set_created(&mut self, value: i64) {
        self.created = value;
    }

    pub fn set_modified(&mut self, value: i64) {
        self.modified = value;
    }

    pub fn dancer_count(&self) -> usize {
        self.dancer_count
    }

    pub fn significant_count(&self) -> usize {
        self.significant_count
    }

    pub fn rows(&self) -> &[Vec<Spot>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn first_dancer_row(&self) -> i32 {
        self.first_dancer_row
    }

    pub fn first_dancer_column(&self) -> i32 {
        self.first_dancer_column
    }

    pub fn first_significant_column(&self) -> i32 {
        self.first_significant_column
    }

    /// Parse one diagram row. Metadata rows (`*C…`, `*M…`) update the
    /// timestamps. Returns false on a syntax error or when a diagram's
    /// top row carries no dancer.
    pub fn add_row(&mut self, text: &str) -> bool {
        let text = text.trim_end();
        if let Some(rest) = text.strip_prefix('*') {
            let mut chars = rest.chars();
            return match chars.next() {
                Some('C') => {
                    self.created = chars.as_str().trim().parse().unwrap_or(0);
                    true
                }
                Some('M') => {
                    self.modified = chars.as_str().trim().parse().unwrap_or(0);
                    true
                }
                _ => false,
            };
        }
        let row_index = self.rows.len();
        self.rows.push(Vec::new());
        let mut scanner = DiagramScanner::new(text);
        let mut positions = 0;
        loop {
            match scanner.scan() {
                Ok(Some(spot)) => {
                    if spot.position.is_significant() {
                        if self.first_significant_column < 0 {
                            self.first_significant_column = self.rows[row_index].len() as i32;
                        }
                        self.significant_count += 1;
                    }
                    if spot.position.is_dancer() {
                        if self.first_dancer_column < 0 {
                            self.first_dancer_column = self.rows[row_index].len() as i32;
                            self.first_dancer_row = row_index as i32;
                        }
                        self.dancer_count += 1;
                        self.dancer_types[dancer_type_slot(spot.position)] += 1;
                    }
                    self.rows[row_index].push(spot);
                    positions += 1;
                }
                Ok(None) => {
                    // the top row of a diagram must contain a dancer
                    if row_index == 0 && self.dancer_count == 0 {
                        return false;
                    }
                    if positions > self.max_positions {
                        self.max_positions = positions;
                    }
                    self.symmetry.set(0);
                    return true;
                }
                Err(()) => return false,
            }
        }
    }

    pub fn dancer_type_count(&self, position: PositionType) -> usize {
        self.dancer_types[dancer_type_slot(position)]
    }

    pub fn has_centers_or_ends(&self) -> bool {
        self.rows.iter().flatten().any(|s| {
            matches!(
                s.position,
                PositionType::Center | PositionType::End | PositionType::VeryCenter | PositionType::VeryEnd
            )
        })
    }

    /// Extract the dancers of a matched group that sit on spots of the
    /// given kind (or the fallback kind). The matched group records the
    /// spot kind each dancer landed on.
    pub fn extract(matched: &Group, pos: PositionType, alt_pos: Option<PositionType>) -> DancerMask {
        let mut mask = 0;
        for (index, kind) in matched.spot_kinds() {
            if *kind == pos || alt_pos == Some(*kind) {
                mask |= 1 << index;
            }
        }
        mask
    }

    /// Advance (row, column) to the next significant spot in reading
    /// order; leaves row past the end when exhausted.
    pub fn next_significant_spot(&self, row: &mut usize, column: &mut usize) {
        loop {
            *column += 1;
            while *row < self.rows.len() && *column >= self.rows[*row].len() {
                *row += 1;
                *column = 0;
                if *row >= self.rows.len() {
                    return;
                }
            }
            if *row >= self.rows.len() {
                return;
            }
            if self.rows[*row][*column].position.is_significant() {
                return;
            }
        }
    }

    /// Rotational symmetry: 1 (none), 2 (180 degrees), or 4 (square).
    pub fn rotational_symmetry(&self) -> i32 {
        if self.symmetry.get() == 0 {
            self.symmetry.set(self.calculate_symmetry());
            log::trace!("symmetry of {} = {}", self.name, self.symmetry.get());
        }
        self.symmetry.get()
    }

    fn calculate_symmetry(&self) -> i32 {
        if self.has_4fold_symmetry() {
            return 4;
        }
        let rows = self.rows.len();
        let check_rows = (rows + 1) / 2;
        for i in 0..check_rows {
            for j in 0..self.rows[i].len() {
                let spot = self.rows[i][j];
                let rotated_row = rows - i - 1;
                let rotated_column = self.rows[i].len() as i32 - j as i32 - 1;
                if rotated_column < 0 || self.rows[rotated_row].len() <= rotated_column as usize {
                    // trailing empty spots may be elided
                    if spot.position != PositionType::Empty {
                        return 1;
                    }
                    continue;
                }
                let rotated = self.rows[rotated_row][rotated_column as usize];
                match spot.position {
                    PositionType::Wrap | PositionType::ToTheLeft | PositionType::ToTheBack => return 1,
                    _ => {
                        if spot.position != rotated.position {
                            return 1;
                        }
                    }
                }
                if rotate_facing_180(spot.facing) != rotated.facing {
                    return 1;
                }
            }
        }
        2
    }

    fn has_4fold_symmetry(&self) -> bool {
        // only a square layout can map onto itself at 90 degrees
        if self.max_positions != self.rows.len() {
            return false;
        }
        let n = self.rows.len();
        for i in 0..n {
            for j in 0..self.rows[i].len() {
                let spot = self.rows[i][j];
                let rotated_row = j;
                let rotated_column = n as i32 - i as i32 - 1;
                if rotated_column < 0
                    || rotated_row >= self.rows.len()
                    || self.rows[rotated_row].len() <= rotated_column as usize
                {
                    if spot.position != PositionType::Empty {
                        return false;
                    }
                    continue;
                }
                let rotated = self.rows[rotated_row][rotated_column as usize];
                let position_ok = match spot.position {
                    PositionType::SameRow => rotated.position == PositionType::SameColumn,
                    PositionType::SameColumn => rotated.position == PositionType::SameRow,
                    PositionType::Wrap | PositionType::ToTheLeft | PositionType::ToTheBack => false,
                    p => rotated.position == p,
                };
                if !position_ok {
                    return false;
                }
                if rotate_facing_90(spot.facing) != rotated.facing {
                    return false;
                }
            }
        }
        true
    }

    pub fn spot(&self, x: i32, y: i32) -> Spot {
        let x = x - self.bias_x;
        let y = y - self.bias_y;
        if y >= 0 && (y as usize) < self.rows.len() {
            let row = &self.rows[y as usize];
            if x >= 0 && (x as usize) < row.len() {
                return row[x as usize];
            }
        }
        Spot::EMPTY
    }

    pub fn set_spot(&mut self, x: i32, y: i32, spot: Spot) {
        if spot.position == PositionType::Empty && (x < self.bias_x || y < self.bias_y) {
            return;
        }
        if spot.position != PositionType::Empty {
            if x < self.bias_x {
                let shift = (self.bias_x - x) as usize;
                for row in &mut self.rows {
                    for _ in 0..shift {
                        row.insert(0, Spot::EMPTY);
                    }
                }
                self.bias_x = x;
            }
            while y < self.bias_y {
                self.rows.insert(0, Vec::new());
                self.bias_y -= 1;
            }
        }
        let x = (x - self.bias_x) as usize;
        let y = (y - self.bias_y) as usize;
        while y >= self.rows.len() {
            self.rows.push(Vec::new());
        }
        let row = &mut self.rows[y];
        while x >= row.len() {
            row.push(Spot::EMPTY);
        }
        row[x] = spot;
        self.symmetry.set(0);
    }

    pub fn blocked(&self, x: i32, y: i32) -> bool {
        self.spot(x - 1, y).position != PositionType::Empty
            || self.spot(x + 1, y).position != PositionType::Empty
            || self.spot(x, y + 1).position != PositionType::Empty
            || self.spot(x, y - 1).position != PositionType::Empty
    }

    /// Trim empty rows and columns accumulated during editing.
    pub fn compact(&mut self) {
        for row in &mut self.rows {
            let last = row.iter().rposition(|s| s.position != PositionType::Empty);
            row.truncate(last.map(|i| i + 1).unwrap_or(0));
        }
        let last = self.rows.iter().rposition(|r| !r.is_empty());
        self.rows.truncate(last.map(|i| i + 1).unwrap_or(0));
        let leading = self.rows.iter().position(|r| !r.is_empty()).unwrap_or(0);
        if leading > 0 {
            self.rows.drain(0..leading);
            self.bias_y += leading as i32;
        }
        let mut min_start = usize::MAX;
        for row in &self.rows {
            if let Some(first) = row.iter().position(|s| s.position != PositionType::Empty) {
                min_start = min_start.min(first);
            }
        }
        if min_start != usize::MAX && min_start > 0 {
            for row in &mut self.rows {
                row.drain(0..min_start.min(row.len()));
            }
            self.bias_x += min_start as i32;
        }
        self.symmetry.set(0);
    }

    /// Serialize back into grammar-file form.
    pub fn write_to(&self, out: &mut String) {
        out.push('=');
        out.push_str(&self.name);
        match self.geometry {
            Geometry::Grid => out.push_str(" @grid"),
            Geometry::Hexagonal => out.push_str(" @hexagonal"),
            Geometry::Ring => out.push_str(" @ring"),
            Geometry::Unspecified => {}
        }
        out.push('\n');
        if self.created != 0 {
            let _ = writeln!(out, "*C{}", self.created);
        }
        if self.modified != 0 {
            let _ = writeln!(out, "*M{}", self.modified);
        }
        for row in &self.rows {
            for (j, spot) in row.iter().enumerate() {
                if j > 0 {
                    out.push(' ');
                }
                out.push(spot.position.glyph());
                if spot.position.is_significant() {
                    out.push(facing_glyph(spot.facing));
                }
            }
            out.push('\n');
        }
    }
}

fn dancer_type_slot(position: PositionType) -> usize {
    match position {
        PositionType::Active => 0,
        PositionType::ActiveBoy => 1,
        PositionType::ActiveGirl => 2,
        PositionType::ActiveDesignated => 3,
        PositionType::ActiveNondesignated => 4,
        PositionType::Center => 5,
        PositionType::End => 6,
        PositionType::VeryCenter => 7,
        PositionType::VeryEnd => 8,
        _ => 9,
    }
}

pub fn facing_glyph(facing: Facing) -> char {
    match facing {
        Facing::Right => '>',
        Facing::Back => '^',
        Facing::Left => '<',
        Facing::Front => 'v',
        Facing::Head => '|',
        Facing::Side => '-',
        Facing::Any => '?',
    }
}

fn rotate_facing_180(facing: Facing) -> Facing {
    match facing {
        Facing::Right => Facing::Left,
        Facing::Back => Facing::Front,
        Facing::Left => Facing::Right,
        Facing::Front => Facing::Back,
        other => other,
    }
}

fn rotate_facing_90(facing: Facing) -> Facing {
    match facing {
        Facing::Right => Facing::Front,
        Facing::Back => Facing::Right,
        Facing::Left => Facing::Back,
        Facing::Front => Facing::Left,
        Facing::Head => Facing::Side,
        Facing::Side => Facing::Head,
        Facing::Any => Facing::Any,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formation(rows: &[&str]) -> Formation {
        let mut f = Formation::new("test", Geometry::Unspecified);
        for row in rows {
            assert!(f.add_row(row), "row failed to parse: {}", row);
        }
        f
    }

    #[test]
    fn parses_two_char_spots() {
        let f = formation(&["a> a<"]);
        assert_eq!(f.dancer_count(), 2);
        assert_eq!(f.significant_count(), 2);
        assert_eq!(f.rows()[0][0], Spot::new(PositionType::Active, Facing::Right));
        assert_eq!(f.rows()[0][1], Spot::new(PositionType::Active, Facing::Left));
    }

    #[test]
    fn rejects_top_row_without_dancer() {
        let mut f = Formation::new("empty-top", Geometry::Unspecified);
        assert!(!f.add_row(". ."));
    }

    #[test]
    fn metadata_rows_set_timestamps() {
        let mut f = Formation::new("meta", Geometry::Unspecified);
        assert!(f.add_row("*C1234"));
        assert!(f.add_row("*M5678"));
        assert!(f.add_row("a^"));
        assert_eq!(f.created(), 1234);
        assert_eq!(f.modified(), 5678);
    }

    #[test]
    fn wave_has_2fold_symmetry() {
        // right-hand ocean wave: alternating facings along one row
        let f = formation(&["a^ av a^ av"]);
        assert_eq!(f.rotational_symmetry(), 2);
    }

    #[test]
    fn single_dancer_square_is_4fold() {
        let f = formation(&["a?"]);
        assert_eq!(f.rotational_symmetry(), 4);
    }

    #[test]
    fn box_circulate_is_4fold() {
        let f = formation(&["a> av", "a^ a<"]);
        assert_eq!(f.rotational_symmetry(), 4);
    }

    #[test]
    fn facing_couples_are_2fold_not_4fold() {
        let f = formation(&["av av", "a^ a^"]);
        assert_eq!(f.rotational_symmetry(), 2);
    }

    #[test]
    fn asymmetric_formation_reports_1() {
        let f = formation(&["a> a>"]);
        assert_eq!(f.rotational_symmetry(), 1);
    }

    #[test]
    fn next_significant_spot_skips_markers() {
        let f = formation(&["a> . a<", "a^ a^"]);
        let mut row = 0;
        let mut col = 0;
        f.next_significant_spot(&mut row, &mut col);
        assert_eq!((row, col), (0, 2));
        f.next_significant_spot(&mut row, &mut col);
        assert_eq!((row, col), (1, 0));
    }

    #[test]
    fn first_dancer_anchors_in_top_row() {
        let f = formation(&[". a>", "a^ a^"]);
        assert_eq!(f.first_dancer_row(), 0);
        assert_eq!(f.first_dancer_column(), 1);
    }

    #[test]
    fn centers_and_ends_detected() {
        let f = formation(&["e- c- c- e-"]);
        assert!(f.has_centers_or_ends());
        let g = formation(&["a> a<"]);
        assert!(!g.has_centers_or_ends());
    }

    #[test]
    fn spot_accessor_respects_bias() {
        let mut f = formation(&["a>"]);
        f.set_spot(-1, 0, Spot::new(PositionType::Active, Facing::Left));
        assert_eq!(f.spot(-1, 0).facing, Facing::Left);
        assert_eq!(f.spot(0, 0).facing, Facing::Right);
    }

    #[test]
    fn compact_trims_empty_border() {
        let mut f = Formation::new("pad", Geometry::Unspecified);
        assert!(f.add_row(". a> ."));
        assert!(f.add_row(". ."));
        f.compact();
        assert_eq!(f.rows().len(), 1);
        assert_eq!(f.rows()[0].len(), 1);
        assert_eq!(f.rows()[0][0].position, PositionType::Active);
    }

    #[test]
    fn write_round_trips_rows() {
        let f = formation(&["a> a<", "i? ."]);
        let mut out = String::new();
        f.write_to(&mut out);
        assert!(out.contains("=test"));
        assert!(out.contains("a> a<"));
        assert!(out.contains("i? ."));
    }

    #[test]
    fn designated_spot_consults_closure() {
        let closure = PatternClosure::designating(0b01);
        let designated = Dancer::new(0, 0, Facing::Back, Gender::Girl, 1);
        let other = Dancer::new(2, 0, Facing::Back, Gender::Boy, 1);
        let spot = Spot::new(PositionType::ActiveDesignated, Facing::Any);
        assert!(spot_matches(&designated, &spot, &closure));
        assert!(!spot_matches(&other, &spot, &closure));
        let non = Spot::new(PositionType::ActiveNondesignated, Facing::Any);
        assert!(!spot_matches(&designated, &non, &closure));
        assert!(spot_matches(&other, &non, &closure));
    }
}
