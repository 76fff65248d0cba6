//! Designator resolution.
//!
//! An `Anyone` selects a subset of the current group, resolved to a
//! dancer-index bitmask using geometry, facing, and formation-based
//! classification. Results are always intersected with the group's own
//! mask before return.

use crate::dancer::{boys_mask, couple_mask, girls_mask, DancerMask, Facing};
use crate::config::DanceType;
use crate::formation::{Geometry, PatternClosure, PositionType};
use crate::group::{build_tiling, match_formation, TileAction};
use crate::stage::{Context, GroupId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anyone {
    Centers,
    Ends,
    VeryCenters,
    VeryEnds,
    /// The dancers who moved in the most recent step.
    LastActive,
    /// The dancers who did not.
    Others,
    Leaders,
    Trailers,
    Heads,
    Sides,
    Boys,
    Girls,
    Beaus,
    Belles,
    FacingAcross,
    FacingAlong,
    InFacing,
    OutFacing,
    /// Exact dancers by index bits.
    Mask(DancerMask),
    Not(Box<Anyone>),
    And(Box<Anyone>, Box<Anyone>),
    Or(Box<Anyone>, Box<Anyone>),
    Xor(Box<Anyone>, Box<Anyone>),
}

pub fn heads_mask(dance_type: DanceType) -> DancerMask {
    match dance_type {
        DanceType::FourCouple => couple_mask(1) | couple_mask(3),
        DanceType::SixCouple => couple_mask(1) | couple_mask(2) | couple_mask(4) | couple_mask(5),
        DanceType::Hexagonal => couple_mask(1) | couple_mask(3) | couple_mask(5),
        _ => 0,
    }
}

pub fn sides_mask(dance_type: DanceType) -> DancerMask {
    match dance_type {
        DanceType::FourCouple => couple_mask(2) | couple_mask(4),
        DanceType::SixCouple => couple_mask(3) | couple_mask(6),
        DanceType::Hexagonal => couple_mask(2) | couple_mask(4) | couple_mask(6),
        _ => 0,
    }
}

impl Anyone {
    pub fn leaf_name(&self) -> &'static str {
        match self {
            Anyone::Centers => "centers",
            Anyone::Ends => "ends",
            Anyone::VeryCenters => "very centers",
            Anyone::VeryEnds => "very ends",
            Anyone::LastActive => "$last_active",
            Anyone::Others => "others",
            Anyone::Leaders => "leaders",
            Anyone::Trailers => "trailers",
            Anyone::Heads => "heads",
            Anyone::Sides => "sides",
            Anyone::Boys => "boys",
            Anyone::Girls => "girls",
            Anyone::Beaus => "beaus",
            Anyone::Belles => "belles",
            Anyone::FacingAcross => "facing across",
            Anyone::FacingAlong => "facing along",
            Anyone::InFacing => "in facing",
            Anyone::OutFacing => "out facing",
            Anyone::Mask(_) => "dancer_mask",
            _ => "",
        }
    }

    pub fn label(&self) -> String {
        match self {
            Anyone::Mask(mask) => {
                let mut s = String::new();
                for i in 0..crate::dancer::MAX_DANCERS as u8 {
                    if mask & (1 << i) != 0 {
                        let gender = match crate::dancer::gender_of(i) {
                            crate::dancer::Gender::Boy => "boy",
                            _ => "girl",
                        };
                        s.push_str(&format!("#{} {} ", crate::dancer::couple_of(i), gender));
                    }
                }
                s.trim_end().to_string()
            }
            Anyone::And(l, r) => format!("({})and({})", l.label(), r.label()),
            Anyone::Or(l, r) => format!("({})or({})", l.label(), r.label()),
            Anyone::Xor(l, r) => format!("({})xor({})", l.label(), r.label()),
            Anyone::Not(l) => format!("not({})", l.label()),
            leaf => leaf.leaf_name().to_string(),
        }
    }

    /// Resolve against `group`. `last_active` is the enclosing plan's
    /// record of who moved in the previous step.
    pub fn match_mask(&self, ctx: &mut Context, group: GroupId, last_active: DancerMask) -> DancerMask {
        let dancer_mask = ctx.stage.group(group).dancer_mask();
        let mask = match self {
            Anyone::LastActive => last_active,
            Anyone::Others => !last_active,
            Anyone::Heads => heads_mask(ctx.config.dance_type),
            Anyone::Sides => sides_mask(ctx.config.dance_type),
            Anyone::Boys => boys_mask(),
            Anyone::Girls => girls_mask(),
            Anyone::Mask(m) => *m,
            Anyone::FacingAcross | Anyone::FacingAlong => self.facing_axis_mask(ctx, group),
            Anyone::InFacing | Anyone::OutFacing => self.facing_center_mask(ctx, group),
            Anyone::Leaders | Anyone::Trailers => self.leaders_mask(ctx, group),
            Anyone::Centers | Anyone::Ends | Anyone::VeryCenters | Anyone::VeryEnds => {
                self.centers_mask(ctx, group)
            }
            Anyone::Beaus | Anyone::Belles => self.partnership_mask(ctx, group),
            Anyone::Not(x) => !x.match_mask(ctx, group, last_active),
            Anyone::And(x, y) => {
                let m = x.match_mask(ctx, group, last_active);
                if m == 0 {
                    return 0;
                }
                m & y.match_mask(ctx, group, last_active)
            }
            Anyone::Or(x, y) => {
                let m = x.match_mask(ctx, group, last_active);
                if m == dancer_mask {
                    return dancer_mask;
                }
                m | y.match_mask(ctx, group, last_active)
            }
            Anyone::Xor(x, y) => x.match_mask(ctx, group, last_active) ^ y.match_mask(ctx, group, last_active),
        };
        dancer_mask & mask
    }

    fn facing_axis_mask(&self, ctx: &Context, group: GroupId) -> DancerMask {
        let g = ctx.stage.group(group);
        let r = g.bounding_box();
        let mut mask = 0;
        for d in g.dancers() {
            let along = match d.facing {
                Facing::Right | Facing::Left => {
                    if r.width() > r.height() {
                        Some(true)
                    } else if r.width() < r.height() {
                        Some(false)
                    } else {
                        None
                    }
                }
                Facing::Front | Facing::Back => {
                    if r.width() > r.height() {
                        Some(false)
                    } else if r.width() < r.height() {
                        Some(true)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            let wanted = matches!(self, Anyone::FacingAlong);
            if along == Some(wanted) {
                mask |= d.bit();
            }
        }
        mask
    }

    fn facing_center_mask(&self, ctx: &Context, group: GroupId) -> DancerMask {
        let g = ctx.stage.group(group);
        let want_in = matches!(self, Anyone::InFacing);
        let mut mask = 0;
        if g.geometry() == Geometry::Ring {
            for d in g.dancers() {
                let inward = match d.facing {
                    Facing::Front => Some(true),
                    Facing::Back => Some(false),
                    _ => None,
                };
                if inward == Some(want_in) {
                    mask |= d.bit();
                }
            }
        } else {
            for d in g.dancers() {
                let inward = match d.facing {
                    Facing::Right => {
                        if d.x < 0 {
                            Some(true)
                        } else if d.x > 0 {
                            Some(false)
                        } else {
                            None
                        }
                    }
                    Facing::Left => {
                        if d.x < 0 {
                            Some(false)
                        } else if d.x > 0 {
                            Some(true)
                        } else {
                            None
                        }
                    }
                    Facing::Front => {
                        if d.y < 0 {
                            Some(false)
                        } else if d.y > 0 {
                            Some(true)
                        } else {
                            None
                        }
                    }
                    Facing::Back => {
                        if d.y < 0 {
                            Some(true)
                        } else if d.y > 0 {
                            Some(false)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                if inward == Some(want_in) {
                    mask |= d.bit();
                }
            }
        }
        mask
    }

    fn leaders_mask(&self, ctx: &mut Context, group: GroupId) -> DancerMask {
        let specs = ctx.grammar.leaders_trailers();
        let tiles = match build_tiling(ctx, group, &specs, &PatternClosure::default(), TileAction::All) {
            Some(t) => t,
            None => return 0,
        };
        // classification by (position within the oriented tile, facing)
        const BOX: [[Option<bool>; 4]; 4] = [
            // true = leader, false = trailer; facing order R B L F
            [Some(false), Some(true), Some(true), Some(false)],
            [Some(true), Some(true), Some(false), Some(false)],
            [Some(false), Some(false), Some(true), Some(true)],
            [Some(true), Some(false), Some(false), Some(true)],
        ];
        const TWOSOME: [[Option<bool>; 4]; 2] = [
            [Some(false), None, Some(true), None],
            [Some(true), None, Some(false), None],
        ];
        let want_leaders = matches!(self, Anyone::Leaders);
        let mut mask = 0;
        for tile in &tiles {
            let g = ctx.stage.group(tile.dancers).clone();
            for (j, d) in g.dancers().iter().enumerate() {
                let facing_index = match d.facing {
                    Facing::Right => 0,
                    Facing::Back => 1,
                    Facing::Left => 2,
                    Facing::Front => 3,
                    _ => continue,
                };
                let class = if g.dancer_count() == 4 {
                    BOX[j][facing_index]
                } else if g.dancer_count() == 2 {
                    TWOSOME[j][facing_index]
                } else {
                    None
                };
                if class == Some(want_leaders) {
                    mask |= d.bit();
                }
            }
        }
        mask
    }

    fn centers_mask(&self, ctx: &mut Context, group: GroupId) -> DancerMask {
        let names = ctx.grammar.centers_ends();
        let (pos, alt) = match self {
            Anyone::Centers => (PositionType::Center, Some(PositionType::VeryCenter)),
            Anyone::Ends => (PositionType::End, Some(PositionType::VeryEnd)),
            Anyone::VeryCenters => (PositionType::VeryCenter, None),
            Anyone::VeryEnds => (PositionType::VeryEnd, None),
            _ => return 0,
        };
        for name in names {
            let grammar = ctx.grammar;
            let formation = match grammar.formation(&name) {
                Some(f) => f,
                None => continue,
            };
            if let Some(matched) = match_formation(ctx, group, formation, &PatternClosure::default()) {
                let g = ctx.stage.group(matched);
                return crate::formation::Formation::extract(g, pos, alt);
            }
        }
        0
    }

    fn partnership_mask(&self, ctx: &mut Context, group: GroupId) -> DancerMask {
        let specs = ctx.grammar.partners();
        let tiles = match build_tiling(ctx, group, &specs, &PatternClosure::default(), TileAction::All) {
            Some(t) => t,
            None => return 0,
        };
        let want_beaus = matches!(self, Anyone::Beaus);
        let mut mask = 0;
        for tile in &tiles {
            let g = ctx.stage.group(tile.dancers).clone();
            for d in g.dancers() {
                // the beau's partner stands at their right hand
                let (rx, ry) = d.displaced(0, 2);
                let (lx, ly) = d.displaced(0, -2);
                let partner_right = g.dancer_by_location(rx, ry).is_some();
                let partner_left = g.dancer_by_location(lx, ly).is_some();
                if want_beaus && partner_right && !partner_left {
                    mask |= d.bit();
                }
                if !want_beaus && partner_left && !partner_right {
                    mask |= d.bit();
                }
            }
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dancer::{dancer_index, Dancer, Gender};
    use crate::formation::Formation;
    use crate::grammar::Grammar;
    use crate::group::Group;

    fn grammar_with_formations() -> Grammar {
        let mut grammar = Grammar::new(&Config::default());
        let mut wave = Formation::new("wave", Geometry::Unspecified);
        assert!(wave.add_row("e| . c| . c| . e|"));
        grammar.add_formation(wave);
        let mut boxf = Formation::new("box", Geometry::Unspecified);
        assert!(boxf.add_row("a^ . av"));
        assert!(boxf.add_row(". . ."));
        assert!(boxf.add_row("a^ . av"));
        grammar.add_formation(boxf);
        let mut twosome = Formation::new("twosome", Geometry::Unspecified);
        assert!(twosome.add_row("a- . a-"));
        grammar.add_formation(twosome);
        let mut couple = Formation::new("couple", Geometry::Unspecified);
        assert!(couple.add_row("a? . a?"));
        grammar.add_formation(couple);
        let mut rh = Formation::new("rh_mini_wave", Geometry::Unspecified);
        assert!(rh.add_row("a^ . av"));
        grammar.add_formation(rh);
        let mut lh = Formation::new("lh_mini_wave", Geometry::Unspecified);
        assert!(lh.add_row("av . a^"));
        grammar.add_formation(lh);
        grammar
    }

    fn wave_group(ctx: &mut Context) -> GroupId {
        ctx.stage.add_group(Group::from_dancers(
            Geometry::Grid,
            vec![
                Dancer::new(-3, 0, Facing::Back, Gender::Boy, 1),
                Dancer::new(-1, 0, Facing::Front, Gender::Girl, 2),
                Dancer::new(1, 0, Facing::Back, Gender::Boy, 3),
                Dancer::new(3, 0, Facing::Front, Gender::Girl, 4),
            ],
        ))
    }

    #[test]
    fn heads_and_sides_split_the_home_set() {
        let grammar = grammar_with_formations();
        let mut ctx = Context::new(&grammar, Config::default());
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let heads = Anyone::Heads.match_mask(&mut ctx, home, 0);
        let sides = Anyone::Sides.match_mask(&mut ctx, home, 0);
        assert_eq!(heads, couple_mask(1) | couple_mask(3));
        assert_eq!(sides, couple_mask(2) | couple_mask(4));
        assert_eq!(heads & sides, 0);
        assert_eq!(heads | sides, ctx.stage.group(home).dancer_mask());
    }

    #[test]
    fn boys_and_girls_are_complementary_on_home() {
        let grammar = grammar_with_formations();
        let mut ctx = Context::new(&grammar, Config::default());
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let boys = Anyone::Boys.match_mask(&mut ctx, home, 0);
        let girls = Anyone::Girls.match_mask(&mut ctx, home, 0);
        assert_eq!(boys & girls, 0);
        assert_eq!(boys | girls, ctx.stage.group(home).dancer_mask());
    }

    #[test]
    fn everyone_faces_in_at_home() {
        let grammar = grammar_with_formations();
        let mut ctx = Context::new(&grammar, Config::default());
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let full = ctx.stage.group(home).dancer_mask();
        assert_eq!(Anyone::InFacing.match_mask(&mut ctx, home, 0), full);
        assert_eq!(Anyone::OutFacing.match_mask(&mut ctx, home, 0), 0);
    }

    #[test]
    fn centers_of_a_wave_are_the_inside_dancers() {
        let grammar = grammar_with_formations();
        let mut ctx = Context::new(&grammar, Config::default());
        let wave = wave_group(&mut ctx);
        let centers = Anyone::Centers.match_mask(&mut ctx, wave, 0);
        let expected = (1 << dancer_index(2, Gender::Girl)) | (1 << dancer_index(3, Gender::Boy));
        assert_eq!(centers, expected);
        let ends = Anyone::Ends.match_mask(&mut ctx, wave, 0);
        let expected_ends = (1 << dancer_index(1, Gender::Boy)) | (1 << dancer_index(4, Gender::Girl));
        assert_eq!(ends, expected_ends);
    }

    #[test]
    fn leaders_and_trailers_partition_a_box() {
        let grammar = grammar_with_formations();
        let mut ctx = Context::new(&grammar, Config::default());
        // right-hand box circulate: left column faces back, right front
        let group = ctx.stage.add_group(Group::from_dancers(
            Geometry::Grid,
            vec![
                Dancer::new(0, 2, Facing::Back, Gender::Boy, 1),
                Dancer::new(2, 2, Facing::Front, Gender::Girl, 2),
                Dancer::new(0, 0, Facing::Back, Gender::Boy, 3),
                Dancer::new(2, 0, Facing::Front, Gender::Girl, 4),
            ],
        ));
        let leaders = Anyone::Leaders.match_mask(&mut ctx, group, 0);
        let trailers = Anyone::Trailers.match_mask(&mut ctx, group, 0);
        assert_ne!(leaders, 0);
        assert_eq!(leaders & trailers, 0);
        assert_eq!(leaders | trailers, ctx.stage.group(group).dancer_mask());
        // the back-left boy leads; the front-left boy trails him
        assert!(leaders & (1 << dancer_index(1, Gender::Boy)) != 0);
        assert!(trailers & (1 << dancer_index(3, Gender::Boy)) != 0);
    }

    #[test]
    fn beaus_in_a_right_hand_wave_are_everyone() {
        let grammar = grammar_with_formations();
        let mut ctx = Context::new(&grammar, Config::default());
        // one right-hand mini wave
        let group = ctx.stage.add_group(Group::from_dancers(
            Geometry::Grid,
            vec![
                Dancer::new(0, 0, Facing::Back, Gender::Boy, 1),
                Dancer::new(2, 0, Facing::Front, Gender::Girl, 1),
            ],
        ));
        let beaus = Anyone::Beaus.match_mask(&mut ctx, group, 0);
        assert_eq!(beaus, ctx.stage.group(group).dancer_mask());
        assert_eq!(Anyone::Belles.match_mask(&mut ctx, group, 0), 0);
    }

    #[test]
    fn combinators_short_circuit_and_compose() {
        let grammar = grammar_with_formations();
        let mut ctx = Context::new(&grammar, Config::default());
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let full = ctx.stage.group(home).dancer_mask();
        let boys = Anyone::Boys;
        let heads = Anyone::Heads;
        let head_boys = Anyone::And(Box::new(heads.clone()), Box::new(boys.clone()));
        let m = head_boys.match_mask(&mut ctx, home, 0);
        assert_eq!(
            m,
            (1 << dancer_index(1, Gender::Boy)) | (1 << dancer_index(3, Gender::Boy))
        );
        let not_boys = Anyone::Not(Box::new(boys.clone()));
        assert_eq!(not_boys.match_mask(&mut ctx, home, 0), Anyone::Girls.match_mask(&mut ctx, home, 0));
        let either = Anyone::Or(Box::new(boys.clone()), Box::new(Anyone::Girls));
        assert_eq!(either.match_mask(&mut ctx, home, 0), full);
        let xor = Anyone::Xor(Box::new(boys), Box::new(heads));
        let expected = (Anyone::Boys.match_mask(&mut ctx, home, 0)) ^ (Anyone::Heads.match_mask(&mut ctx, home, 0));
        assert_eq!(xor.match_mask(&mut ctx, home, 0), expected & full);
    }

    #[test]
    fn last_active_and_others_split_by_history() {
        let grammar = grammar_with_formations();
        let mut ctx = Context::new(&grammar, Config::default());
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let full = ctx.stage.group(home).dancer_mask();
        let last = couple_mask(1);
        assert_eq!(Anyone::LastActive.match_mask(&mut ctx, home, last), last);
        assert_eq!(Anyone::Others.match_mask(&mut ctx, home, last), full & !last);
    }

    #[test]
    fn facing_along_and_across_use_the_long_axis() {
        let grammar = grammar_with_formations();
        let mut ctx = Context::new(&grammar, Config::default());
        let wave = wave_group(&mut ctx);
        // the wave is wider than tall; its dancers face front/back
        let full = ctx.stage.group(wave).dancer_mask();
        assert_eq!(Anyone::FacingAcross.match_mask(&mut ctx, wave, 0), full);
        assert_eq!(Anyone::FacingAlong.match_mask(&mut ctx, wave, 0), 0);
    }
}
