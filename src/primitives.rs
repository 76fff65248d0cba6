//! The built-in motion and control operators.
//!
//! Primitives are the closed vocabulary definitions bottom out in.
//! Each has a static signature: the largest denominator it can be
//! fractionalized by (0 forbids fractionalizing, ANY allows all) and
//! up to five argument kinds, checked when a plan is constructed and
//! dispatched when it executes.

use crate::anyone::Anyone;
use crate::dancer::{dancer_index, DancerMask, Dancer, Facing, Gender};
use crate::explain::ExplanationKind;
use crate::formation::{Geometry, PatternClosure};
use crate::group::{self, Group, TileAction, RING_CIRCUMFERENCE};
use crate::motion::{Interval, Motion, MotionKind};
use crate::plan::{self, PlanId, StepId};
use crate::stage::{Context, GroupId, TermId};
use crate::term::{Direction, Fraction, Pivot, Term};
use crate::transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Nothing,
    In,
    Activate,
    MoveIn,
    Circle,
    CircleFraction,
    CircleHome,
    Rotate,
    FormRing,
    FormSet,
    FormPromenade,
    FormThar,
    ForwardAndBack,
    PullBy,
    Face,
    Definition,
    BackOut,
    AnyWhoCan,
    ThoseWhoCan,
    Forward,
    Arc,
    StartTogether,
    Run,
    RunTo,
    ForwardVeer,
    ForwardVeerFace,
    ForwardPeel,
    Veer,
    Displace,
    ArcFace,
    Mirror,
    Fractionalize,
    If,
    CanStart,
    Reduce,
    CheckSequence,
    Roll,
    CanRoll,
    CloserToCenter,
    HasLateralFlow,
    Stretch,
    DontBreathe,
    Normalize,
    Breathe,
    ConjurePhantom,
    Phantom,
}

impl Primitive {
    pub const ALL: [Primitive; 46] = [
        Primitive::Nothing,
        Primitive::In,
        Primitive::Activate,
        Primitive::MoveIn,
        Primitive::Circle,
        Primitive::CircleFraction,
        Primitive::CircleHome,
        Primitive::Rotate,
        Primitive::FormRing,
        Primitive::FormSet,
        Primitive::FormPromenade,
        Primitive::FormThar,
        Primitive::ForwardAndBack,
        Primitive::PullBy,
        Primitive::Face,
        Primitive::Definition,
        Primitive::BackOut,
        Primitive::AnyWhoCan,
        Primitive::ThoseWhoCan,
        Primitive::Forward,
        Primitive::Arc,
        Primitive::StartTogether,
        Primitive::Run,
        Primitive::RunTo,
        Primitive::ForwardVeer,
        Primitive::ForwardVeerFace,
        Primitive::ForwardPeel,
        Primitive::Veer,
        Primitive::Displace,
        Primitive::ArcFace,
        Primitive::Mirror,
        Primitive::Fractionalize,
        Primitive::If,
        Primitive::CanStart,
        Primitive::Reduce,
        Primitive::CheckSequence,
        Primitive::Roll,
        Primitive::CanRoll,
        Primitive::CloserToCenter,
        Primitive::HasLateralFlow,
        Primitive::Stretch,
        Primitive::DontBreathe,
        Primitive::Normalize,
        Primitive::Breathe,
        Primitive::ConjurePhantom,
        Primitive::Phantom,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Nothing => "$nothing",
            Primitive::In => "$in",
            Primitive::Activate => "$activate",
            Primitive::MoveIn => "$move_in",
            Primitive::Circle => "$circle",
            Primitive::CircleFraction => "$circle_fraction",
            Primitive::CircleHome => "$circle_home",
            Primitive::Rotate => "$rotate",
            Primitive::FormRing => "$form_ring",
            Primitive::FormSet => "$form_set",
            Primitive::FormPromenade => "$form_promenade",
            Primitive::FormThar => "$form_thar",
            Primitive::ForwardAndBack => "$forward_and_back",
            Primitive::PullBy => "$pull_by",
            Primitive::Face => "$face",
            Primitive::Definition => "$definition",
            Primitive::BackOut => "$back_out",
            Primitive::AnyWhoCan => "$any_who_can",
            Primitive::ThoseWhoCan => "$those_who_can",
            Primitive::Forward => "$forward",
            Primitive::Arc => "$arc",
            Primitive::StartTogether => "$start_together",
            Primitive::Run => "$run",
            Primitive::RunTo => "$run_to",
            Primitive::ForwardVeer => "$forward_veer",
            Primitive::ForwardVeerFace => "$forward_veer_face",
            Primitive::ForwardPeel => "$forward_peel",
            Primitive::Veer => "$veer",
            Primitive::Displace => "$displace",
            Primitive::ArcFace => "$arc_face",
            Primitive::Mirror => "$mirror",
            Primitive::Fractionalize => "$fractionalize",
            Primitive::If => "$if",
            Primitive::CanStart => "$can_start",
            Primitive::Reduce => "$reduce",
            Primitive::CheckSequence => "$check_sequence",
            Primitive::Roll => "$roll",
            Primitive::CanRoll => "$can_roll",
            Primitive::CloserToCenter => "$closer_to_center",
            Primitive::HasLateralFlow => "$has_lateral_flow",
            Primitive::Stretch => "$stretch",
            Primitive::DontBreathe => "$dont_breathe",
            Primitive::Normalize => "$normalize",
            Primitive::Breathe => "$breathe",
            Primitive::ConjurePhantom => "$conjure_phantom",
            Primitive::Phantom => "$phantom",
        }
    }
}

/// Argument kinds a primitive's signature may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Any term at all ($if's test).
    Term,
    Word,
    Anyone,
    Anything,
    Direction,
    Pivot,
    Fraction,
    Group,
}

/// Fractionalization sentinel: any fraction allowed.
pub const ANY: i32 = -1;

pub struct Descriptor {
    pub largest_denominator: i32,
    pub args: &'static [ArgKind],
}

pub fn descriptor(p: Primitive) -> Descriptor {
    use ArgKind::*;
    let (largest_denominator, args): (i32, &'static [ArgKind]) = match p {
        Primitive::Nothing => (ANY, &[]),
        Primitive::In => (0, &[Word]),
        Primitive::Activate => (0, &[Anyone, Anything]),
        Primitive::MoveIn => (0, &[Anyone]),
        Primitive::Circle => (ANY, &[Direction]),
        Primitive::CircleFraction => (0, &[Direction, Fraction]),
        Primitive::CircleHome => (0, &[Direction]),
        Primitive::Rotate => (0, &[Fraction, Anything]),
        Primitive::FormRing => (0, &[]),
        Primitive::FormSet => (0, &[]),
        Primitive::FormPromenade => (0, &[Direction]),
        Primitive::FormThar => (0, &[]),
        Primitive::ForwardAndBack => (0, &[]),
        Primitive::PullBy => (2, &[Direction]),
        Primitive::Face => (0, &[Direction, Pivot]),
        Primitive::Definition => (0, &[Anything, Word]),
        Primitive::BackOut => (0, &[Anyone, Group]),
        Primitive::AnyWhoCan => (ANY, &[Anything]),
        Primitive::ThoseWhoCan => (0, &[Anything]),
        Primitive::Forward => (2, &[Fraction]),
        Primitive::Arc => (2, &[Pivot, Direction, Fraction]),
        Primitive::StartTogether => (ANY, &[Anything, Anything]),
        Primitive::Run => (0, &[Anyone]),
        Primitive::RunTo => (0, &[Anyone, Direction]),
        Primitive::ForwardVeer => (2, &[Fraction, Fraction]),
        Primitive::ForwardVeerFace => (2, &[Fraction, Fraction, Fraction]),
        Primitive::ForwardPeel => (2, &[Fraction, Direction]),
        Primitive::Veer => (2, &[Fraction, Direction]),
        Primitive::Displace => (0, &[Fraction, Direction]),
        Primitive::ArcFace => (2, &[Pivot, Direction, Fraction, Fraction]),
        Primitive::Mirror => (ANY, &[Anything]),
        Primitive::Fractionalize => (0, &[Fraction, Anything]),
        Primitive::If => (0, &[Term, Anything, Anything]),
        Primitive::CanStart => (0, &[Anything]),
        Primitive::Reduce => (ANY, &[Word, Word, Anything]),
        Primitive::CheckSequence => (0, &[Direction]),
        Primitive::Roll => (0, &[]),
        Primitive::CanRoll => (0, &[]),
        Primitive::CloserToCenter => (0, &[Anyone, Anyone]),
        Primitive::HasLateralFlow => (0, &[Direction]),
        Primitive::Stretch => (0, &[Anything]),
        Primitive::DontBreathe => (0, &[]),
        Primitive::Normalize => (0, &[]),
        Primitive::Breathe => (0, &[Anything]),
        Primitive::ConjurePhantom => (0, &[Fraction, Fraction]),
        Primitive::Phantom => (0, &[Anything]),
    };
    Descriptor {
        largest_denominator,
        args,
    }
}

fn arg_matches(term: &Term, kind: ArgKind) -> bool {
    match kind {
        ArgKind::Term => true,
        ArgKind::Word => matches!(term, Term::Word(_)),
        ArgKind::Anyone => matches!(term, Term::Anyone(_)),
        ArgKind::Anything => matches!(term, Term::Call(_)),
        ArgKind::Direction => matches!(term, Term::Direction(_)),
        ArgKind::Pivot => matches!(term, Term::Pivot(_)),
        // integers widen to fractions wherever a fraction is expected
        ArgKind::Fraction => matches!(term, Term::Fraction(_) | Term::Integer(_)),
        ArgKind::Group => matches!(term, Term::Group(_)),
    }
}

/// Type-check a primitive invocation against its signature. Returns an
/// error message on mismatch.
pub fn check_arguments(ctx: &Context, p: Primitive, args: &[TermId]) -> Result<(), String> {
    let d = descriptor(p);
    if args.len() > d.args.len() {
        return Err("Too many variables in the call".to_string());
    }
    if args.len() < d.args.len() {
        return Err("Too few variables in the call".to_string());
    }
    for (i, (arg, kind)) in args.iter().zip(d.args.iter()).enumerate() {
        if !arg_matches(ctx.term(*arg), *kind) {
            return Err(format!("Variable {} is not a {:?}", i + 1, kind));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Argument access
// ---------------------------------------------------------------------------

fn arg_fraction(ctx: &Context, args: &[TermId], i: usize) -> Option<Fraction> {
    match ctx.term(*args.get(i)?) {
        Term::Fraction(f) => Some(*f),
        Term::Integer(v) => Some(Fraction::whole(*v)),
        _ => None,
    }
}

fn arg_direction(ctx: &Context, args: &[TermId], i: usize) -> Option<Direction> {
    match ctx.term(*args.get(i)?) {
        Term::Direction(d) => Some(*d),
        _ => None,
    }
}

fn arg_pivot(ctx: &Context, args: &[TermId], i: usize) -> Option<Pivot> {
    match ctx.term(*args.get(i)?) {
        Term::Pivot(p) => Some(*p),
        _ => None,
    }
}

fn arg_anyone(ctx: &Context, args: &[TermId], i: usize) -> Option<Anyone> {
    match ctx.term(*args.get(i)?) {
        Term::Anyone(a) => Some(a.set.clone()),
        _ => None,
    }
}

fn arg_word(ctx: &Context, args: &[TermId], i: usize) -> Option<String> {
    match ctx.term(*args.get(i)?) {
        Term::Word(w) => Some(w.clone()),
        _ => None,
    }
}

fn arg_call(ctx: &Context, args: &[TermId], i: usize) -> Option<TermId> {
    let id = *args.get(i)?;
    match ctx.term(id) {
        Term::Call(_) => Some(id),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Motion helpers
// ---------------------------------------------------------------------------

fn rebuild(ctx: &mut Context, source: GroupId, dancers: Vec<Dancer>) -> GroupId {
    let mut g = ctx.stage.group(source).clone();
    g.set_spot_kinds(Vec::new());
    let mut out = Group::derived(source, &g, transform::IDENTITY);
    for d in dancers {
        out.insert(d);
    }
    out.done();
    ctx.stage.add_group(out)
}

fn forward_veer(
    ctx: &mut Context,
    group_id: GroupId,
    amount: i32,
    veer: i32,
    right_quarters: i32,
    interval: &mut Interval,
) -> GroupId {
    let g = ctx.stage.group(group_id).clone();
    let mut out = Vec::new();
    for d in g.dancers() {
        let (x, y) = d.displaced(amount, veer);
        let facing = d.facing.quarter_right(right_quarters);
        interval.push(Motion {
            dancer: d.index(),
            beats: amount.abs().max(veer.abs()).max(1),
            from: (d.x, d.y),
            to: (x, y),
            facing_from: d.facing,
            facing_to: facing,
            kind: MotionKind::Forward,
        });
        let mut moved = *d;
        moved.x = x;
        moved.y = y;
        moved.facing = facing;
        out.push(moved);
    }
    rebuild(ctx, group_id, out)
}

/// Rotate dancers around a pivot point by whole right quarter turns.
fn arc_quarters(
    ctx: &mut Context,
    group_id: GroupId,
    center: (i32, i32),
    right_quarters: i32,
    nose_quarters: i32,
    interval: &mut Interval,
) -> GroupId {
    let g = ctx.stage.group(group_id).clone();
    let q = right_quarters.rem_euclid(4);
    let mut out = Vec::new();
    for d in g.dancers() {
        let mut dx = d.x - center.0;
        let mut dy = d.y - center.1;
        for _ in 0..q {
            let (nx, ny) = (dy, -dx);
            dx = nx;
            dy = ny;
        }
        let facing = d.facing.quarter_right(right_quarters + nose_quarters);
        let to = (center.0 + dx, center.1 + dy);
        interval.push(Motion {
            dancer: d.index(),
            beats: right_quarters.abs().max(1) * 2,
            from: (d.x, d.y),
            to,
            facing_from: d.facing,
            facing_to: facing,
            kind: MotionKind::Arc {
                center,
                right_sixteenths: right_quarters * 4,
            },
        });
        let mut moved = *d;
        moved.x = to.0;
        moved.y = to.1;
        moved.facing = facing;
        out.push(moved);
    }
    rebuild(ctx, group_id, out)
}

fn face_turn_each(
    ctx: &mut Context,
    group_id: GroupId,
    interval: &mut Interval,
    turns: impl Fn(&Dancer) -> Option<i32>,
) -> Option<GroupId> {
    let g = ctx.stage.group(group_id).clone();
    let mut out = Vec::new();
    for d in g.dancers() {
        let q = turns(d)?;
        let facing = d.facing.quarter_right(q);
        if q != 0 {
            interval.push(Motion {
                dancer: d.index(),
                beats: 1,
                from: (d.x, d.y),
                to: (d.x, d.y),
                facing_from: d.facing,
                facing_to: facing,
                kind: MotionKind::Face { right_quarters: q },
            });
        }
        let mut moved = *d;
        moved.facing = facing;
        out.push(moved);
    }
    Some(rebuild(ctx, group_id, out))
}

/// Quarter turns (to the right) that point a definite facing at the
/// target direction vector's dominant axis.
fn quarters_toward(facing: Facing, dx: i32, dy: i32) -> Option<i32> {
    let target = if dx.abs() >= dy.abs() {
        Facing::from_vector(dx.signum(), 0)?
    } else {
        Facing::from_vector(0, dy.signum())?
    };
    for q in 0..4 {
        if facing.quarter_right(q) == target {
            return Some(q);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Fractionalizing
// ---------------------------------------------------------------------------

/// Whether and how a primitive step accepts a fraction of itself.
pub fn fractionalize_check(p: Primitive, fraction: &Fraction) -> Result<(), (ExplanationKind, &'static str)> {
    let d = descriptor(p);
    if d.largest_denominator == 0 {
        return Err((ExplanationKind::UserError, "Cannot fractionalize this call"));
    }
    if d.largest_denominator != ANY && fraction.improper_numerator(d.largest_denominator, None).is_none() {
        return Err((ExplanationKind::UserError, "Improper fraction for this call"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Execute one primitive step against the live group. Motions land in
/// `interval`; the returned group is the step's result. Failures
/// attach an explanation to the step and return None.
#[allow(clippy::too_many_arguments)]
pub fn execute(
    ctx: &mut Context,
    plan_id: PlanId,
    step_id: StepId,
    p: Primitive,
    args: &[TermId],
    current: GroupId,
    fraction: Option<Fraction>,
    action: TileAction,
    interval: &mut Interval,
) -> Option<GroupId> {
    match p {
        Primitive::Nothing => Some(current),

        Primitive::In => {
            let name = arg_word(ctx, args, 0)?;
            let grammar = ctx.grammar;
            let formation = match grammar.formation(&name) {
                Some(f) => f,
                None => {
                    plan::fail_step(ctx, step_id, ExplanationKind::DefinitionError, &format!("Unknown formation name: {}", name));
                    return None;
                }
            };
            group::match_formation(ctx, current, formation, &PatternClosure::default())
        }

        Primitive::Definition => {
            let call = arg_call(ctx, args, 0)?;
            let name = arg_word(ctx, args, 1)?;
            let matches = match ctx.term(call) {
                Term::Call(c) => match c.definition {
                    Some(dref) => ctx.grammar.definition(dref).name == name,
                    None => false,
                },
                _ => false,
            };
            if matches {
                Some(current)
            } else {
                None
            }
        }

        Primitive::Activate => {
            let anyone = arg_anyone(ctx, args, 0)?;
            let call = arg_call(ctx, args, 1)?;
            let last_active = ctx.stage.plan(plan_id).last_active;
            let mask = anyone.match_mask(ctx, current, last_active);
            if mask == 0 {
                plan::fail_step(ctx, step_id, ExplanationKind::UserError, "No one matched the designated dancers");
                return None;
            }
            let subset = group::extract(ctx, current, mask);
            let sub = plan::new_sub_plan(ctx, plan_id, subset, call);
            if !plan::construct_plan(ctx, sub, action) {
                plan::adopt_failure(ctx, sub, step_id);
                return None;
            }
            let result = match plan::perform_plan(ctx, sub) {
                Some(r) => r,
                None => {
                    plan::adopt_failure(ctx, sub, step_id);
                    return None;
                }
            };
            plan::collect_motions(ctx, sub, interval);
            ctx.stage.step_mut(step_id).breathe = plan::BreatheAction::DontBreathe;
            ctx.stage.plan_mut(plan_id).last_active = mask;
            Some(group::merge_to(ctx, result, current))
        }

        Primitive::AnyWhoCan | Primitive::ThoseWhoCan => {
            let call = arg_call(ctx, args, 0)?;
            let sub = plan::new_sub_plan(ctx, plan_id, current, call);
            if plan::construct_plan(ctx, sub, TileAction::AnyWhoCan) {
                if let Some(result) = plan::perform_plan(ctx, sub) {
                    plan::collect_motions(ctx, sub, interval);
                    let mask = ctx.stage.plan(sub).last_active;
                    ctx.stage.plan_mut(plan_id).last_active = mask;
                    return Some(group::merge_to(ctx, result, current));
                }
            }
            if p == Primitive::ThoseWhoCan {
                plan::fail_step(ctx, step_id, ExplanationKind::UserError, "No one can do the call");
                None
            } else {
                // those who cannot simply do nothing
                Some(current)
            }
        }

        Primitive::CanStart => {
            let call = arg_call(ctx, args, 0)?;
            let sub = plan::new_sub_plan(ctx, plan_id, current, call);
            if plan::construct_plan(ctx, sub, TileAction::All) {
                Some(current)
            } else {
                let cause = plan::failure_text(ctx, sub).unwrap_or_else(|| "unknown".to_string());
                plan::fail_step(ctx, step_id, ExplanationKind::DefinitionError, &format!("$can_start failed: {}", cause));
                None
            }
        }

        Primitive::If => {
            let test = *args.first()?;
            let outcome = match ctx.term(test).clone() {
                Term::Integer(v) => v != 0,
                Term::Fraction(f) => !f.is_magic() && (f.whole != 0 || f.num != 0),
                Term::Call(_) => {
                    let sub = plan::new_sub_plan(ctx, plan_id, current, test);
                    plan::construct_plan(ctx, sub, TileAction::All) && plan::perform_plan(ctx, sub).is_some()
                }
                _ => {
                    plan::fail_step(
                        ctx,
                        step_id,
                        ExplanationKind::DefinitionError,
                        "Variable 0 is neither an integer or a call",
                    );
                    return None;
                }
            };
            log::debug!("$if test = {}", outcome);
            let chosen = if outcome { *args.get(1)? } else { *args.get(2)? };
            let sub = plan::new_sub_plan(ctx, plan_id, current, chosen);
            if !plan::construct_plan(ctx, sub, TileAction::All) {
                plan::adopt_failure(ctx, sub, step_id);
                return None;
            }
            let result = plan::perform_plan(ctx, sub).or_else(|| {
                plan::adopt_failure(ctx, sub, step_id);
                None
            })?;
            plan::collect_motions(ctx, sub, interval);
            Some(group::merge_to(ctx, result, current))
        }

        Primitive::StartTogether => {
            let first = arg_call(ctx, args, 0)?;
            let second = arg_call(ctx, args, 1)?;
            let before = ctx.stage.group(current).clone();
            let sub1 = plan::new_sub_plan(ctx, plan_id, current, first);
            if !plan::construct_plan(ctx, sub1, action) {
                plan::adopt_failure(ctx, sub1, step_id);
                return None;
            }
            let r1 = plan::perform_plan(ctx, sub1).or_else(|| {
                plan::adopt_failure(ctx, sub1, step_id);
                None
            })?;
            let r1 = group::merge_to(ctx, r1, current);
            let m1 = plan::moved_mask(ctx, &before, r1);
            let sub2 = plan::new_sub_plan(ctx, plan_id, current, second);
            if !plan::construct_plan(ctx, sub2, action) {
                plan::adopt_failure(ctx, sub2, step_id);
                return None;
            }
            let r2 = plan::perform_plan(ctx, sub2).or_else(|| {
                plan::adopt_failure(ctx, sub2, step_id);
                None
            })?;
            let r2 = group::merge_to(ctx, r2, current);
            let m2 = plan::moved_mask(ctx, &before, r2);
            if m1 & m2 != 0 {
                plan::fail_step(
                    ctx,
                    step_id,
                    ExplanationKind::DefinitionError,
                    "Cannot direct the same people to do two things at the same time",
                );
                return None;
            }
            plan::collect_motions(ctx, sub1, interval);
            plan::collect_motions(ctx, sub2, interval);
            ctx.stage.plan_mut(plan_id).last_active = m1 | m2;
            // splice the two outcomes over the unmoved dancers
            let g1 = ctx.stage.group(r1).clone();
            let g2 = ctx.stage.group(r2).clone();
            let mut dancers = Vec::new();
            for d in before.dancers() {
                if m1 & d.bit() != 0 {
                    dancers.push(*g1.dancer_by_index(d.index())?);
                } else if m2 & d.bit() != 0 {
                    dancers.push(*g2.dancer_by_index(d.index())?);
                } else {
                    dancers.push(*d);
                }
            }
            Some(rebuild(ctx, current, dancers))
        }

        Primitive::Mirror => {
            let call = arg_call(ctx, args, 0)?;
            let mirrored = group::apply_transform(ctx, current, &transform::MIRROR);
            let sub = plan::new_sub_plan(ctx, plan_id, mirrored, call);
            if !plan::construct_plan(ctx, sub, action) {
                plan::adopt_failure(ctx, sub, step_id);
                return None;
            }
            let result = plan::perform_plan(ctx, sub).or_else(|| {
                plan::adopt_failure(ctx, sub, step_id);
                None
            })?;
            plan::collect_motions(ctx, sub, interval);
            let back = group::merge_to(ctx, result, mirrored);
            Some(group::merge(ctx, back))
        }

        Primitive::Fractionalize => {
            let f = arg_fraction(ctx, args, 0)?.normalize();
            let call = arg_call(ctx, args, 1)?;
            if f.whole < 0 || f.denom == 0 {
                plan::fail_step(
                    ctx,
                    step_id,
                    ExplanationKind::DefinitionError,
                    "Only positive fractions allowed with this call",
                );
                return None;
            }
            let mut running = current;
            for _ in 0..f.whole {
                let sub = plan::new_sub_plan(ctx, plan_id, running, call);
                if !plan::construct_plan(ctx, sub, action) {
                    plan::adopt_failure(ctx, sub, step_id);
                    return None;
                }
                let r = plan::perform_plan(ctx, sub).or_else(|| {
                    plan::adopt_failure(ctx, sub, step_id);
                    None
                })?;
                plan::collect_motions(ctx, sub, interval);
                running = group::merge_to(ctx, r, running);
            }
            if f.num != 0 {
                let part = Fraction::new(0, f.num, f.denom);
                let sub = plan::new_sub_plan(ctx, plan_id, running, call);
                ctx.stage.plan_mut(sub).fraction = Some(part);
                if !plan::construct_plan(ctx, sub, action) {
                    plan::adopt_failure(ctx, sub, step_id);
                    return None;
                }
                if !plan::plan_fractionalize(ctx, sub, part) {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Cannot fractionalize this call");
                    return None;
                }
                let r = plan::perform_plan(ctx, sub).or_else(|| {
                    plan::adopt_failure(ctx, sub, step_id);
                    None
                })?;
                plan::collect_motions(ctx, sub, interval);
                running = group::merge_to(ctx, r, running);
            }
            Some(running)
        }

        Primitive::Rotate => {
            let f = arg_fraction(ctx, args, 0)?;
            let call = arg_call(ctx, args, 1)?;
            let adjust = match f.improper_numerator(16, None) {
                Some(a) => a,
                None => {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Rotation must be in 1/16ths");
                    return None;
                }
            };
            let sub = plan::new_sub_plan(ctx, plan_id, current, call);
            if !plan::construct_plan(ctx, sub, action) {
                plan::adopt_failure(ctx, sub, step_id);
                return None;
            }
            let result = plan::perform_plan(ctx, sub).or_else(|| {
                plan::adopt_failure(ctx, sub, step_id);
                None
            })?;
            plan::collect_motions(ctx, sub, interval);
            let merged = group::merge_to(ctx, result, current);
            let rotated = group::rotate_by(adjust / 2);
            ctx.stage.group_mut(merged).set_rotation(rotated);
            Some(merged)
        }

        Primitive::Breathe => {
            let call = arg_call(ctx, args, 0)?;
            let sub = plan::new_sub_plan(ctx, plan_id, current, call);
            if !plan::construct_plan(ctx, sub, action) {
                plan::adopt_failure(ctx, sub, step_id);
                return None;
            }
            let result = plan::perform_plan(ctx, sub).or_else(|| {
                plan::adopt_failure(ctx, sub, step_id);
                None
            })?;
            plan::collect_motions(ctx, sub, interval);
            let merged = group::merge_to(ctx, result, current);
            Some(plan::breathe_group(ctx, merged))
        }

        Primitive::Phantom => {
            let call = arg_call(ctx, args, 0)?;
            let sub = plan::new_sub_plan(ctx, plan_id, current, call);
            if !plan::construct_plan(ctx, sub, TileAction::WithPhantoms) {
                plan::adopt_failure(ctx, sub, step_id);
                return None;
            }
            let result = plan::perform_plan(ctx, sub).or_else(|| {
                plan::adopt_failure(ctx, sub, step_id);
                None
            })?;
            plan::collect_motions(ctx, sub, interval);
            let merged = group::merge_to(ctx, result, current);
            Some(group::remove_phantoms(ctx, merged))
        }

        Primitive::Stretch => {
            let call = arg_call(ctx, args, 0)?;
            let sub = plan::new_sub_plan(ctx, plan_id, current, call);
            if !plan::construct_plan(ctx, sub, action) {
                plan::adopt_failure(ctx, sub, step_id);
                return None;
            }
            let result = plan::perform_plan(ctx, sub).or_else(|| {
                plan::adopt_failure(ctx, sub, step_id);
                None
            })?;
            plan::collect_motions(ctx, sub, interval);
            let merged = group::merge_to(ctx, result, current);
            stretch_centers(ctx, merged, interval)
        }

        Primitive::Reduce => {
            let form_in = arg_word(ctx, args, 0)?;
            let form_out = arg_word(ctx, args, 1)?;
            let call = arg_call(ctx, args, 2)?;
            let grammar = ctx.grammar;
            let fin = match grammar.formation(&form_in) {
                Some(f) => f,
                None => {
                    plan::fail_step(ctx, step_id, ExplanationKind::DefinitionError, &format!("Unknown formation name: {}", form_in));
                    return None;
                }
            };
            let reduced = match group::match_formation(ctx, current, fin, &PatternClosure::default()) {
                Some(g) => g,
                None => {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, &format!("Not in formation {}", form_in));
                    return None;
                }
            };
            let sub = plan::new_sub_plan(ctx, plan_id, reduced, call);
            if !plan::construct_plan(ctx, sub, action) {
                plan::adopt_failure(ctx, sub, step_id);
                return None;
            }
            let result = plan::perform_plan(ctx, sub).or_else(|| {
                plan::adopt_failure(ctx, sub, step_id);
                None
            })?;
            plan::collect_motions(ctx, sub, interval);
            let merged = group::merge_to(ctx, result, reduced);
            let restored = group::merge(ctx, merged);
            let grammar = ctx.grammar;
            let fout = grammar.formation(&form_out);
            if let Some(fout) = fout {
                if group::match_formation(ctx, restored, fout, &PatternClosure::default()).is_none() {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, &format!("Did not resolve to formation {}", form_out));
                    return None;
                }
            }
            Some(restored)
        }

        Primitive::Forward => {
            let f = arg_fraction(ctx, args, 0)?;
            let amount = match f.improper_numerator(2, fraction.as_ref()) {
                Some(a) => a,
                None => {
                    plan::fail_step(
                        ctx,
                        step_id,
                        ExplanationKind::DefinitionError,
                        "Forward/back amount must be in 1/2 increments",
                    );
                    return None;
                }
            };
            Some(forward_veer(ctx, current, amount, 0, 0, interval))
        }

        Primitive::PullBy => {
            let amount = match fraction {
                Some(f) => match f.improper_numerator(2, None) {
                    Some(a) if a <= 2 => a,
                    _ => {
                        plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Improper fraction for this call");
                        return None;
                    }
                },
                None => 2,
            };
            Some(forward_veer(ctx, current, amount, 0, 0, interval))
        }

        Primitive::ForwardAndBack => {
            let g = ctx.stage.group(current).clone();
            for d in g.dancers() {
                interval.push(Motion {
                    dancer: d.index(),
                    beats: 4,
                    from: (d.x, d.y),
                    to: (d.x, d.y),
                    facing_from: d.facing,
                    facing_to: d.facing,
                    kind: MotionKind::Forward,
                });
            }
            Some(current)
        }

        Primitive::ForwardVeer => {
            let amount = require_half_units(ctx, step_id, args, 0)?;
            let veer = require_half_units(ctx, step_id, args, 1)?;
            Some(forward_veer(ctx, current, amount, veer, 0, interval))
        }

        Primitive::ForwardVeerFace => {
            let amount = require_half_units(ctx, step_id, args, 0)?;
            let veer = require_half_units(ctx, step_id, args, 1)?;
            let f = arg_fraction(ctx, args, 2)?;
            let turns = match f.improper_numerator(4, None) {
                Some(t) => t,
                None => {
                    plan::fail_step(ctx, step_id, ExplanationKind::DefinitionError, "Turn amount must be in 1/4 increments");
                    return None;
                }
            };
            Some(forward_veer(ctx, current, amount, veer, turns, interval))
        }

        Primitive::ForwardPeel => {
            let amount = require_half_units(ctx, step_id, args, 0)?;
            let dir = arg_direction(ctx, args, 1)?;
            let (veer, turns) = match dir {
                Direction::Left => (-1, -2),
                Direction::Right => (1, 2),
                _ => {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Direction must be 'left' or 'right'");
                    return None;
                }
            };
            Some(forward_veer(ctx, current, amount, veer, turns, interval))
        }

        Primitive::Veer => {
            let veer = require_half_units(ctx, step_id, args, 0)?;
            let dir = arg_direction(ctx, args, 1)?;
            match dir {
                Direction::In | Direction::Out => veer_in_out(ctx, current, veer, dir, interval),
                Direction::Left => Some(forward_veer(ctx, current, 0, -veer, 0, interval)),
                Direction::Right => Some(forward_veer(ctx, current, 0, veer, 0, interval)),
                _ => {
                    plan::fail_step(
                        ctx,
                        step_id,
                        ExplanationKind::UserError,
                        "Direction limited to 'in', 'out', 'left', 'right'",
                    );
                    None
                }
            }
        }

        Primitive::Displace => {
            let amount = require_half_units(ctx, step_id, args, 0)?;
            let dir = arg_direction(ctx, args, 1)?;
            match dir {
                Direction::In | Direction::Out => displace_in_out(ctx, current, amount, dir, interval),
                _ => {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Direction limited to 'in', 'out'");
                    None
                }
            }
        }

        Primitive::Arc => arc_primitive(ctx, step_id, args, current, fraction, interval, 0),

        Primitive::ArcFace => {
            let nose = arg_fraction(ctx, args, 3)?;
            let nose_quarters = match nose.improper_numerator(4, None) {
                Some(n) => n,
                None => {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Nose turning needs a fraction in quarters");
                    return None;
                }
            };
            arc_primitive(ctx, step_id, args, current, None, interval, nose_quarters)
        }

        Primitive::Face => {
            let dir = arg_direction(ctx, args, 0)?;
            let pivot = arg_pivot(ctx, args, 1)?;
            face_primitive(ctx, step_id, current, dir, pivot, interval)
        }

        Primitive::Run | Primitive::RunTo => {
            let anyone = arg_anyone(ctx, args, 0)?;
            let dir = if p == Primitive::RunTo {
                let d = arg_direction(ctx, args, 1)?;
                if !matches!(d, Direction::Left | Direction::Right) {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Run direction must be left or right");
                    return None;
                }
                Some(d)
            } else {
                None
            };
            let last_active = ctx.stage.plan(plan_id).last_active;
            let mask = anyone.match_mask(ctx, current, last_active);
            if mask == 0 {
                plan::fail_step(ctx, step_id, ExplanationKind::UserError, "No dancers can run");
                return None;
            }
            match run(ctx, current, mask, dir, interval) {
                Some(g) => {
                    ctx.stage.plan_mut(plan_id).last_active = mask;
                    Some(g)
                }
                None => {
                    plan::fail_step(
                        ctx,
                        step_id,
                        ExplanationKind::UserError,
                        "Not all the designated dancers have unique partners",
                    );
                    None
                }
            }
        }

        Primitive::MoveIn => {
            let anyone = arg_anyone(ctx, args, 0)?;
            let last_active = ctx.stage.plan(plan_id).last_active;
            let mask = anyone.match_mask(ctx, current, last_active);
            move_in(ctx, current, mask, interval)
        }

        Primitive::BackOut => {
            let anyone = arg_anyone(ctx, args, 0)?;
            let last_active = ctx.stage.plan(plan_id).last_active;
            let mask = anyone.match_mask(ctx, current, last_active);
            back_out(ctx, step_id, current, mask, interval)
        }

        Primitive::Circle => {
            let dir = arg_direction(ctx, args, 0)?;
            let amount = match fraction {
                Some(f) => match f.improper_numerator(8, None) {
                    Some(a) => a,
                    None => return None,
                },
                None => 3,
            };
            circle(ctx, step_id, current, dir, amount, interval)
        }

        Primitive::CircleFraction => {
            let dir = arg_direction(ctx, args, 0)?;
            let f = arg_fraction(ctx, args, 1)?;
            let amount = match f.improper_numerator(8, None) {
                Some(a) => a,
                None => return None,
            };
            circle(ctx, step_id, current, dir, amount, interval)
        }

        Primitive::CircleHome => {
            let dir = arg_direction(ctx, args, 0)?;
            circle_home(ctx, step_id, current, dir, interval)
        }

        Primitive::FormRing => form_ring(ctx, current, interval),

        Primitive::FormSet => form_set(ctx, step_id, current, interval),

        Primitive::FormPromenade => {
            let dir = arg_direction(ctx, args, 0)?;
            form_promenade(ctx, step_id, current, dir, interval)
        }

        Primitive::FormThar => form_thar(ctx, step_id, current, interval),

        Primitive::CheckSequence => {
            let dir = arg_direction(ctx, args, 0)?;
            if in_sequence(ctx, current, dir) {
                Some(current)
            } else {
                plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Dancers are not in sequence");
                None
            }
        }

        Primitive::Roll => roll(ctx, plan_id, step_id, current, false, interval),

        Primitive::CanRoll => roll(ctx, plan_id, step_id, current, true, interval),

        Primitive::CloserToCenter => {
            let a = arg_anyone(ctx, args, 0)?;
            let b = arg_anyone(ctx, args, 1)?;
            let last_active = ctx.stage.plan(plan_id).last_active;
            let ma = a.match_mask(ctx, current, last_active);
            let mb = b.match_mask(ctx, current, last_active);
            let g = ctx.stage.group(current).clone();
            let dist = |mask: DancerMask| -> Option<i32> {
                g.dancers()
                    .iter()
                    .filter(|d| mask & d.bit() != 0)
                    .map(|d| d.x * d.x + d.y * d.y)
                    .min()
            };
            match (dist(ma), dist(mb)) {
                (Some(da), Some(db)) if da < db => Some(current),
                _ => None,
            }
        }

        Primitive::HasLateralFlow => {
            let dir = arg_direction(ctx, args, 0)?;
            if has_lateral_flow(ctx, plan_id, current, dir) {
                Some(current)
            } else {
                let text = match dir {
                    Direction::AsYouAre => "Not all dancers moving in a consistent direction",
                    Direction::Left => "Not all dancers moving leftward",
                    Direction::Right => "Not all dancers moving rightward",
                    _ => {
                        plan::fail_step(
                            ctx,
                            step_id,
                            ExplanationKind::DefinitionError,
                            "$has_lateral_flow must use 'left', 'right', or '$as_you_are'",
                        );
                        return None;
                    }
                };
                plan::fail_step(ctx, step_id, ExplanationKind::UserError, text);
                None
            }
        }

        Primitive::DontBreathe => {
            plan::suppress_breathing(ctx, step_id, plan::BreatheAction::DontBreathe);
            Some(current)
        }

        Primitive::Normalize => {
            plan::suppress_breathing(ctx, step_id, plan::BreatheAction::Normalize);
            Some(current)
        }

        Primitive::ConjurePhantom => {
            plan::fail_step(ctx, step_id, ExplanationKind::ProgramBug, "Unfinished: $conjure_phantom()");
            None
        }
    }
}

fn require_half_units(ctx: &mut Context, step_id: StepId, args: &[TermId], i: usize) -> Option<i32> {
    let f = arg_fraction(ctx, args, i)?;
    match f.improper_numerator(2, None) {
        Some(v) => Some(v),
        None => {
            plan::fail_step(
                ctx,
                step_id,
                ExplanationKind::DefinitionError,
                "Amount must be in 1/2 increments",
            );
            None
        }
    }
}

fn arc_primitive(
    ctx: &mut Context,
    step_id: StepId,
    args: &[TermId],
    current: GroupId,
    fraction: Option<Fraction>,
    interval: &mut Interval,
    nose_quarters: i32,
) -> Option<GroupId> {
    let pivot = arg_pivot(ctx, args, 0)?;
    let dir = arg_direction(ctx, args, 1)?;
    let f = arg_fraction(ctx, args, 2)?;
    let mut current = current;

    // sixteenth turns: a full circle is sixteen
    let sixteenths = if f.is_magic() {
        if !f.is_until_home() {
            return None;
        }
        if pivot != Pivot::Center {
            plan::fail_step(
                ctx,
                step_id,
                ExplanationKind::DefinitionError,
                "Can only arc $until_home around $center",
            );
            return None;
        }
        while ctx.stage.group(current).base().is_some() {
            current = group::unwind(ctx, current);
        }
        match until_home_sixteenths(ctx, current) {
            Some(a) => a,
            None => return None,
        }
    } else if pivot == Pivot::Center {
        match f.improper_numerator(8, fraction.as_ref()) {
            Some(a) => a * 2,
            None => {
                plan::fail_step(
                    ctx,
                    step_id,
                    ExplanationKind::UserError,
                    "Turning around the center needs a fraction in eighths",
                );
                return None;
            }
        }
    } else {
        match f.improper_numerator(4, fraction.as_ref()) {
            Some(a) => a * 4,
            None => {
                plan::fail_step(
                    ctx,
                    step_id,
                    ExplanationKind::UserError,
                    "Turning needs a fraction in quarters",
                );
                return None;
            }
        }
    };
    let signed = match dir {
        Direction::Right => sixteenths,
        Direction::Left => -sixteenths,
        _ => sixteenths,
    };
    if ctx.stage.group(current).geometry() == Geometry::Ring && pivot == Pivot::Center {
        // each sixteenth is one angular x unit
        return ring_shift(ctx, current, signed, interval);
    }
    if signed.rem_euclid(4) != 0 {
        plan::fail_step(
            ctx,
            step_id,
            ExplanationKind::UserError,
            "Turning needs a fraction in quarters",
        );
        return None;
    }
    let quarters = signed / 4;
    let center = match arc_center(ctx, current, pivot) {
        Some(c) => c,
        None => {
            plan::fail_step(ctx, step_id, ExplanationKind::UserError, "No pivot for this arc");
            return None;
        }
    };
    match center {
        ArcCenter::Shared(point) => Some(arc_quarters(ctx, current, point, quarters, nose_quarters, interval)),
        ArcCenter::PerDancer(points) => {
            let g = ctx.stage.group(current).clone();
            let mut out = Vec::new();
            for d in g.dancers() {
                let c = points
                    .iter()
                    .find(|(i, _)| *i == d.index())
                    .map(|(_, c)| *c)
                    .unwrap_or((d.x, d.y));
                let mut dx = d.x - c.0;
                let mut dy = d.y - c.1;
                for _ in 0..quarters.rem_euclid(4) {
                    let (nx, ny) = (dy, -dx);
                    dx = nx;
                    dy = ny;
                }
                let facing = d.facing.quarter_right(quarters + nose_quarters);
                interval.push(Motion {
                    dancer: d.index(),
                    beats: quarters.abs().max(1) * 2,
                    from: (d.x, d.y),
                    to: (c.0 + dx, c.1 + dy),
                    facing_from: d.facing,
                    facing_to: facing,
                    kind: MotionKind::Arc {
                        center: c,
                        right_sixteenths: quarters * 4,
                    },
                });
                let mut moved = *d;
                moved.x = c.0 + dx;
                moved.y = c.1 + dy;
                moved.facing = facing;
                out.push(moved);
            }
            Some(rebuild(ctx, current, out))
        }
    }
}

enum ArcCenter {
    Shared((i32, i32)),
    PerDancer(Vec<(u8, (i32, i32))>),
}

fn arc_center(ctx: &mut Context, current: GroupId, pivot: Pivot) -> Option<ArcCenter> {
    let g = ctx.stage.group(current).clone();
    match pivot {
        Pivot::Center | Pivot::LineCenter => Some(ArcCenter::Shared(g.center())),
        Pivot::BoxCenter => Some(ArcCenter::Shared(g.center())),
        Pivot::SplitCenter => {
            let mut centers = Vec::new();
            for d in g.dancers() {
                centers.push((d.index(), g.split_center(d)?));
            }
            Some(ArcCenter::PerDancer(centers))
        }
        Pivot::Zelf | Pivot::Nose | Pivot::Tail => {
            let centers = g.dancers().iter().map(|d| (d.index(), (d.x, d.y))).collect();
            Some(ArcCenter::PerDancer(centers))
        }
        Pivot::RightHand | Pivot::RightDancer => {
            let centers = g
                .dancers()
                .iter()
                .map(|d| {
                    let (x, y) = d.displaced(0, 1);
                    (d.index(), (x, y))
                })
                .collect();
            Some(ArcCenter::PerDancer(centers))
        }
        Pivot::LeftHand | Pivot::LeftDancer => {
            let centers = g
                .dancers()
                .iter()
                .map(|d| {
                    let (x, y) = d.displaced(0, -1);
                    (d.index(), (x, y))
                })
                .collect();
            Some(ArcCenter::PerDancer(centers))
        }
        Pivot::InsideHand | Pivot::InsideDancer | Pivot::InsideShoulder => {
            let (cx, cy) = g.center();
            let mut centers = Vec::new();
            for d in g.dancers() {
                let toward_center = ((cx - d.x).signum(), (cy - d.y).signum());
                centers.push((d.index(), (d.x + toward_center.0, d.y + toward_center.1)));
            }
            Some(ArcCenter::PerDancer(centers))
        }
        Pivot::OutsideHand | Pivot::OutsideDancer => {
            let (cx, cy) = g.center();
            let mut centers = Vec::new();
            for d in g.dancers() {
                let away = ((d.x - cx).signum(), (d.y - cy).signum());
                centers.push((d.index(), (d.x + away.0, d.y + away.1)));
            }
            Some(ArcCenter::PerDancer(centers))
        }
        Pivot::Hand | Pivot::LastHand | Pivot::LeftTwoDancers => None,
    }
}

/// Sixteenths of right turn that bring the #1 boy back to his home
/// spot, from a promenade-like arrangement.
fn until_home_sixteenths(ctx: &Context, current: GroupId) -> Option<i32> {
    let g = ctx.stage.group(current);
    let boy1 = g.dancer_by_index(dancer_index(1, Gender::Boy))?;
    if g.geometry() == Geometry::Ring {
        let amount = if boy1.facing == Facing::Left {
            boy1.x + 2
        } else {
            14 - boy1.x
        };
        let amount = if amount < 4 { amount + 16 } else { amount };
        return Some(amount);
    }
    if boy1.x == 0 {
        if boy1.y > 0 {
            Some(8)
        } else if boy1.y < 0 {
            Some(0)
        } else {
            None
        }
    } else if boy1.y == 0 {
        if boy1.x > 0 {
            if boy1.facing == Facing::Back {
                Some(12)
            } else {
                Some(4)
            }
        } else if boy1.facing == Facing::Front {
            Some(4)
        } else {
            Some(12)
        }
    } else {
        None
    }
}

fn face_primitive(
    ctx: &mut Context,
    step_id: StepId,
    current: GroupId,
    dir: Direction,
    pivot: Pivot,
    interval: &mut Interval,
) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    let (cx, cy) = g.center();
    let result = match dir {
        Direction::Right => face_turn_each(ctx, current, interval, |_| Some(1)),
        Direction::Left => face_turn_each(ctx, current, interval, |_| Some(3)),
        Direction::Back => face_turn_each(ctx, current, interval, |_| Some(2)),
        Direction::In => face_turn_each(ctx, current, interval, |d| {
            let (px, py) = match pivot {
                Pivot::SplitCenter => g.split_center(d).unwrap_or((cx, cy)),
                _ => (cx, cy),
            };
            quarters_toward(d.facing, px - d.x, py - d.y)
        }),
        Direction::Out => face_turn_each(ctx, current, interval, |d| {
            let (px, py) = match pivot {
                Pivot::SplitCenter => g.split_center(d).unwrap_or((cx, cy)),
                _ => (cx, cy),
            };
            quarters_toward(d.facing, d.x - px, d.y - py)
        }),
        Direction::AsYouAre => Some(current),
        _ => None,
    };
    if result.is_none() {
        plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Cannot face that way");
    }
    result
}

fn run(
    ctx: &mut Context,
    current: GroupId,
    runners: DancerMask,
    dir: Option<Direction>,
    interval: &mut Interval,
) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    let runner_list: Vec<Dancer> = g.dancers().iter().filter(|d| runners & d.bit() != 0).copied().collect();
    // assign each runner a distinct adjacent partner to run around
    fn assign(
        g: &Group,
        runners: &[Dancer],
        i: usize,
        used: DancerMask,
        all_runners: DancerMask,
        dir: Option<Direction>,
        out: &mut Vec<(Dancer, Dancer)>,
    ) -> bool {
        if i == runners.len() {
            return true;
        }
        let r = runners[i];
        let mut sides: Vec<i32> = Vec::new();
        match dir {
            Some(Direction::Right) => sides.push(1),
            Some(Direction::Left) => sides.push(-1),
            _ => {
                sides.push(1);
                sides.push(-1);
            }
        }
        for side in sides {
            let (px, py) = r.displaced(0, 2 * side);
            if let Some(p) = g.dancer_by_location(px, py) {
                if all_runners & p.bit() == 0 && used & p.bit() == 0 {
                    out.push((r, *p));
                    if assign(g, runners, i + 1, used | p.bit(), all_runners, dir, out) {
                        return true;
                    }
                    out.pop();
                }
            }
        }
        false
    }
    let mut pairs = Vec::new();
    if !assign(&g, &runner_list, 0, 0, runners, dir, &mut pairs) {
        return None;
    }
    let mut dancers: Vec<Dancer> = Vec::new();
    for d in g.dancers() {
        if let Some((r, p)) = pairs.iter().find(|(r, _)| r.index() == d.index()) {
            // the runner crosses into the partner's spot, turning around
            let center = ((r.x + p.x) / 2, (r.y + p.y) / 2);
            let facing = r.facing.reverse();
            interval.push(Motion {
                dancer: r.index(),
                beats: 4,
                from: (r.x, r.y),
                to: (p.x, p.y),
                facing_from: r.facing,
                facing_to: facing,
                kind: MotionKind::Arc {
                    center,
                    right_sixteenths: 8,
                },
            });
            let mut moved = *d;
            moved.x = p.x;
            moved.y = p.y;
            moved.facing = facing;
            dancers.push(moved);
        } else if let Some((r, _)) = pairs.iter().find(|(_, p)| p.index() == d.index()) {
            // the partner slides into the runner's spot without turning
            interval.push(Motion {
                dancer: d.index(),
                beats: 2,
                from: (d.x, d.y),
                to: (r.x, r.y),
                facing_from: d.facing,
                facing_to: d.facing,
                kind: MotionKind::Forward,
            });
            let mut moved = *d;
            moved.x = r.x;
            moved.y = r.y;
            dancers.push(moved);
        } else {
            dancers.push(*d);
        }
    }
    Some(rebuild(ctx, current, dancers))
}

fn veer_in_out(
    ctx: &mut Context,
    current: GroupId,
    amount: i32,
    dir: Direction,
    interval: &mut Interval,
) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    let (cx, cy) = g.center();
    let mut out = Vec::new();
    for d in g.dancers() {
        // lateral motion toward (in) or away from (out) the center
        let toward = ((cx - d.x).signum(), (cy - d.y).signum());
        let sign = if dir == Direction::In { 1 } else { -1 };
        let (rx, ry) = d.displaced(0, 1);
        let lateral_axis = (rx - d.x, ry - d.y);
        let dot = lateral_axis.0 * toward.0 + lateral_axis.1 * toward.1;
        let veer = amount * dot.signum() * sign;
        let (x, y) = d.displaced(0, veer);
        interval.push(Motion {
            dancer: d.index(),
            beats: amount.abs().max(1),
            from: (d.x, d.y),
            to: (x, y),
            facing_from: d.facing,
            facing_to: d.facing,
            kind: MotionKind::Forward,
        });
        let mut moved = *d;
        moved.x = x;
        moved.y = y;
        out.push(moved);
    }
    Some(rebuild(ctx, current, out))
}

fn displace_in_out(
    ctx: &mut Context,
    current: GroupId,
    amount: i32,
    dir: Direction,
    interval: &mut Interval,
) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    let (cx, cy) = g.center();
    let mut out = Vec::new();
    for d in g.dancers() {
        let toward = ((cx - d.x).signum(), (cy - d.y).signum());
        let sign = if dir == Direction::In { 1 } else { -1 };
        let (x, y) = (d.x + toward.0 * amount * sign, d.y + toward.1 * amount * sign);
        interval.push(Motion {
            dancer: d.index(),
            beats: amount.abs().max(1),
            from: (d.x, d.y),
            to: (x, y),
            facing_from: d.facing,
            facing_to: d.facing,
            kind: MotionKind::Adjust,
        });
        let mut moved = *d;
        moved.x = x;
        moved.y = y;
        out.push(moved);
    }
    Some(rebuild(ctx, current, out))
}

fn move_in(ctx: &mut Context, current: GroupId, mask: DancerMask, interval: &mut Interval) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    let (cx, cy) = g.center();
    let mut out = Vec::new();
    for d in g.dancers() {
        if mask & d.bit() != 0 {
            let step = ((cx - d.x).signum() * 2, (cy - d.y).signum() * 2);
            let (x, y) = (d.x + step.0, d.y + step.1);
            if g.dancer_by_location(x, y).is_none() {
                interval.push(Motion {
                    dancer: d.index(),
                    beats: 2,
                    from: (d.x, d.y),
                    to: (x, y),
                    facing_from: d.facing,
                    facing_to: d.facing,
                    kind: MotionKind::Adjust,
                });
                let mut moved = *d;
                moved.x = x;
                moved.y = y;
                out.push(moved);
                continue;
            }
        }
        out.push(*d);
    }
    Some(rebuild(ctx, current, out))
}

fn back_out(
    ctx: &mut Context,
    step_id: StepId,
    current: GroupId,
    mask: DancerMask,
    interval: &mut Interval,
) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    let mut out = Vec::new();
    for d in g.dancers() {
        if mask & d.bit() != 0 {
            let (x, y) = d.displaced(-2, 0);
            if g.dancer_by_location(x, y).is_some() {
                plan::fail_step(ctx, step_id, ExplanationKind::UserError, "No room to back out");
                return None;
            }
            interval.push(Motion {
                dancer: d.index(),
                beats: 2,
                from: (d.x, d.y),
                to: (x, y),
                facing_from: d.facing,
                facing_to: d.facing,
                kind: MotionKind::Forward,
            });
            let mut moved = *d;
            moved.x = x;
            moved.y = y;
            out.push(moved);
        } else {
            out.push(*d);
        }
    }
    Some(rebuild(ctx, current, out))
}

fn ring_shift(ctx: &mut Context, current: GroupId, sixteenths: i32, interval: &mut Interval) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    let mut out = Vec::new();
    for d in g.dancers() {
        let x = (d.x + sixteenths).rem_euclid(RING_CIRCUMFERENCE);
        interval.push(Motion {
            dancer: d.index(),
            beats: sixteenths.abs().max(1),
            from: (d.x, d.y),
            to: (x, d.y),
            facing_from: d.facing,
            facing_to: d.facing,
            kind: MotionKind::Forward,
        });
        let mut moved = *d;
        moved.x = x;
        out.push(moved);
    }
    Some(rebuild(ctx, current, out))
}

fn circle(
    ctx: &mut Context,
    step_id: StepId,
    current: GroupId,
    dir: Direction,
    positions: i32,
    interval: &mut Interval,
) -> Option<GroupId> {
    if ctx.stage.group(current).geometry() != Geometry::Ring {
        plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Dancers are not in a ring");
        return None;
    }
    let amount = match dir {
        Direction::Right => positions * 2,
        Direction::Left => -positions * 2,
        _ => {
            plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Circle direction must be left or right");
            return None;
        }
    };
    ring_shift(ctx, current, amount, interval)
}

fn circle_home(
    ctx: &mut Context,
    step_id: StepId,
    current: GroupId,
    dir: Direction,
    interval: &mut Interval,
) -> Option<GroupId> {
    let normalized = ctx.stage.group(current).normalize_ring_coordinates();
    let normalized_id = ctx.stage.add_group(normalized);
    let g = ctx.stage.group(normalized_id).clone();
    if g.geometry() != Geometry::Ring {
        plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Dancers are not in a ring");
        return None;
    }
    let boy1 = g.dancer_by_index(dancer_index(1, Gender::Boy))?;
    // shift so the head boy lands on the x=0 slot
    let mut amount = (-boy1.x).rem_euclid(RING_CIRCUMFERENCE);
    if dir == Direction::Left && amount != 0 {
        amount -= RING_CIRCUMFERENCE;
    }
    ring_shift(ctx, normalized_id, amount, interval)
}

/// The eight ring slots in angular order, paired with the squared-set
/// spot each returns to.
const RING_HOME_SPOTS: [(i32, (i32, i32)); 8] = [
    (0, (1, -3)),
    (2, (3, -1)),
    (4, (3, 1)),
    (6, (1, 3)),
    (8, (-1, 3)),
    (10, (-3, 1)),
    (12, (-3, -1)),
    (14, (-1, -3)),
];

fn form_ring(ctx: &mut Context, current: GroupId, interval: &mut Interval) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    if g.dancer_count() != 8 {
        return None;
    }
    // order dancers by angle and assign them consecutive ring slots
    let mut ordered: Vec<Dancer> = g.dancers().to_vec();
    ordered.sort_by(|a, b| {
        let aa = (a.y as f64).atan2(a.x as f64);
        let ab = (b.y as f64).atan2(b.x as f64);
        aa.partial_cmp(&ab).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut out = Vec::new();
    for (slot, d) in ordered.iter().enumerate() {
        let x = (slot as i32 * 2 + RING_HOME_SPOTS[0].0).rem_euclid(RING_CIRCUMFERENCE);
        let (cx, cy) = (0, 0);
        let facing = if quarters_toward(d.facing, cx - d.x, cy - d.y) == Some(0) {
            Facing::Front
        } else if quarters_toward(d.facing, d.x - cx, d.y - cy) == Some(0) {
            Facing::Back
        } else {
            d.facing
        };
        interval.push(Motion {
            dancer: d.index(),
            beats: 2,
            from: (d.x, d.y),
            to: (x, 3),
            facing_from: d.facing,
            facing_to: facing,
            kind: MotionKind::Adjust,
        });
        out.push(Dancer::with_index(x, 3, facing, d.gender, d.couple, d.index()));
    }
    let source = ctx.stage.group(current).clone();
    let mut ring = Group::derived(current, &source, transform::IDENTITY);
    for d in out {
        ring.insert(d);
    }
    ring.set_geometry(Geometry::Ring);
    ring.done();
    Some(ctx.stage.add_group(ring))
}

fn form_set(ctx: &mut Context, step_id: StepId, current: GroupId, interval: &mut Interval) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    if g.geometry() != Geometry::Ring || g.dancer_count() != 8 {
        plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Dancers are not in a ring");
        return None;
    }
    let mut out = Vec::new();
    for d in g.dancers() {
        let slot = d.x.rem_euclid(RING_CIRCUMFERENCE);
        let spot = RING_HOME_SPOTS
            .iter()
            .min_by_key(|(sx, _)| {
                let diff = (slot - sx).rem_euclid(RING_CIRCUMFERENCE);
                diff.min(RING_CIRCUMFERENCE - diff)
            })
            .map(|(_, spot)| *spot)?;
        let facing = match d.facing {
            Facing::Front => {
                // facing the center of the ring keeps facing the center
                Facing::from_vector(-spot.0.signum(), -spot.1.signum()).unwrap_or(d.facing)
            }
            Facing::Back => Facing::from_vector(spot.0.signum(), spot.1.signum()).unwrap_or(d.facing),
            other => other,
        };
        interval.push(Motion {
            dancer: d.index(),
            beats: 2,
            from: (d.x, d.y),
            to: spot,
            facing_from: d.facing,
            facing_to: facing,
            kind: MotionKind::Adjust,
        });
        out.push(Dancer::with_index(spot.0, spot.1, facing, d.gender, d.couple, d.index()));
    }
    let source = ctx.stage.group(current).clone();
    let mut set = Group::derived(current, &source, transform::IDENTITY);
    for d in out {
        set.insert(d);
    }
    set.set_geometry(Geometry::Grid);
    set.done();
    Some(ctx.stage.add_group(set))
}

fn form_promenade(
    ctx: &mut Context,
    step_id: StepId,
    current: GroupId,
    dir: Direction,
    interval: &mut Interval,
) -> Option<GroupId> {
    if ctx.stage.group(current).geometry() != Geometry::Ring {
        plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Dancers are not in a ring");
        return None;
    }
    // promenade faces the ring tangentially; reverse goes the other way
    let facing = match dir {
        Direction::ReversePromenade => Facing::Right,
        _ => Facing::Left,
    };
    face_turn_each(ctx, current, interval, |d| {
        for q in 0..4 {
            if d.facing.quarter_right(q) == facing {
                return Some(q);
            }
        }
        Some(0)
    })
}

fn form_thar(ctx: &mut Context, step_id: StepId, current: GroupId, interval: &mut Interval) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    if g.dancer_count() != 8 {
        plan::fail_step(ctx, step_id, ExplanationKind::UserError, "A thar needs eight dancers");
        return None;
    }
    // four spokes; each couple stands along one, boys in the middle
    const SPOKES: [(i32, i32); 4] = [(0, 1), (1, 0), (0, -1), (-1, 0)];
    let mut out = Vec::new();
    for couple in 1..=4u8 {
        let (sx, sy) = SPOKES[(couple - 1) as usize];
        for (gender, radius) in [(Gender::Boy, 1), (Gender::Girl, 3)] {
            let index = dancer_index(couple, gender);
            let d = match g.dancer_by_index(index) {
                Some(d) => *d,
                None => {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, "A thar needs four full couples");
                    return None;
                }
            };
            let to = (sx * radius, sy * radius);
            let facing = if gender == Gender::Boy {
                Facing::from_vector(-sy, sx).unwrap_or(d.facing)
            } else {
                Facing::from_vector(sy, -sx).unwrap_or(d.facing)
            };
            interval.push(Motion {
                dancer: index,
                beats: 2,
                from: (d.x, d.y),
                to,
                facing_from: d.facing,
                facing_to: facing,
                kind: MotionKind::Adjust,
            });
            out.push(Dancer::with_index(to.0, to.1, facing, d.gender, d.couple, index));
        }
    }
    Some(rebuild(ctx, current, out))
}

fn in_sequence(ctx: &Context, current: GroupId, dir: Direction) -> bool {
    let g = ctx.stage.group(current);
    let mut boys: Vec<&Dancer> = g
        .dancers()
        .iter()
        .filter(|d| d.gender == Gender::Boy && !d.is_phantom())
        .collect();
    if boys.len() < 2 {
        return true;
    }
    boys.sort_by(|a, b| {
        let aa = (a.y as f64).atan2(a.x as f64);
        let ab = (b.y as f64).atan2(b.x as f64);
        aa.partial_cmp(&ab).unwrap_or(std::cmp::Ordering::Equal)
    });
    let couples: Vec<i32> = boys.iter().map(|d| d.couple as i32).collect();
    let n = couples.len() as i32;
    // counterclockwise order carries ascending couple numbers
    let ascending = (0..couples.len()).all(|i| {
        let next = couples[(i + 1) % couples.len()];
        (next - couples[i]).rem_euclid(n) == 1
    });
    let descending = (0..couples.len()).all(|i| {
        let next = couples[(i + 1) % couples.len()];
        (couples[i] - next).rem_euclid(n) == 1
    });
    match dir {
        Direction::Right => descending,
        Direction::Left => ascending,
        _ => ascending || descending,
    }
}

fn roll(
    ctx: &mut Context,
    plan_id: PlanId,
    step_id: StepId,
    current: GroupId,
    fail_on_cant: bool,
    interval: &mut Interval,
) -> Option<GroupId> {
    let history = ctx.stage.plan(plan_id).last_motions.clone();
    let g = ctx.stage.group(current).clone();
    let mut out = Vec::new();
    for d in g.dancers() {
        let turn = history
            .iter()
            .rev()
            .find(|m| m.dancer == d.index() && m.facing_from != m.facing_to)
            .and_then(|m| {
                for q in [1, 3] {
                    if m.facing_from.quarter_right(q) == m.facing_to {
                        return Some(if q == 1 { 1 } else { -1 });
                    }
                }
                if m.facing_from.reverse() == m.facing_to {
                    match m.kind {
                        MotionKind::Arc { right_sixteenths, .. } => Some(right_sixteenths.signum()),
                        _ => None,
                    }
                } else {
                    None
                }
            });
        match turn {
            Some(q) => {
                let facing = d.facing.quarter_right(q);
                interval.push(Motion {
                    dancer: d.index(),
                    beats: 1,
                    from: (d.x, d.y),
                    to: (d.x, d.y),
                    facing_from: d.facing,
                    facing_to: facing,
                    kind: MotionKind::Face { right_quarters: q },
                });
                let mut moved = *d;
                moved.facing = facing;
                out.push(moved);
            }
            None => {
                if fail_on_cant {
                    plan::fail_step(ctx, step_id, ExplanationKind::UserError, "Cannot roll");
                    return None;
                }
                out.push(*d);
            }
        }
    }
    Some(rebuild(ctx, current, out))
}

fn has_lateral_flow(ctx: &Context, plan_id: PlanId, current: GroupId, dir: Direction) -> bool {
    let history = &ctx.stage.plan(plan_id).last_motions;
    if history.is_empty() {
        return false;
    }
    let g = ctx.stage.group(current);
    let mut sign: Option<i32> = None;
    for d in g.dancers() {
        let m = match history.iter().rev().find(|m| m.dancer == d.index()) {
            Some(m) => m,
            None => return false,
        };
        // lateral component of the displacement, in the dancer's frame
        let (dx, dy) = (m.to.0 - m.from.0, m.to.1 - m.from.1);
        let (rx, ry) = match m.facing_from {
            Facing::Right => (0, -1),
            Facing::Back => (1, 0),
            Facing::Left => (0, 1),
            Facing::Front => (-1, 0),
            _ => return false,
        };
        let lateral = dx * rx + dy * ry;
        if lateral == 0 {
            return false;
        }
        match sign {
            None => sign = Some(lateral.signum()),
            Some(s) if s != lateral.signum() => return false,
            _ => {}
        }
    }
    match (dir, sign) {
        (Direction::AsYouAre, Some(_)) => true,
        (Direction::Right, Some(s)) => s > 0,
        (Direction::Left, Some(s)) => s < 0,
        _ => false,
    }
}

fn stretch_centers(ctx: &mut Context, current: GroupId, interval: &mut Interval) -> Option<GroupId> {
    let g = ctx.stage.group(current).clone();
    let r = g.bounding_box();
    let horizontal = r.width() >= r.height();
    let mut out: Vec<Dancer> = g.dancers().to_vec();
    // the two dancers nearest the centerline trade across it
    let mut near: Vec<usize> = (0..out.len())
        .filter(|&i| {
            let d = &out[i];
            if horizontal {
                d.x.abs() == 1
            } else {
                d.y.abs() == 1
            }
        })
        .collect();
    if near.len() != 2 {
        return Some(current);
    }
    near.sort();
    let (a, b) = (near[0], near[1]);
    let (pa, pb) = ((out[a].x, out[a].y), (out[b].x, out[b].y));
    out[a].x = pb.0;
    out[a].y = pb.1;
    out[b].x = pa.0;
    out[b].y = pa.1;
    for (i, from) in [(a, pa), (b, pb)] {
        interval.push(Motion {
            dancer: out[i].index(),
            beats: 2,
            from,
            to: (out[i].x, out[i].y),
            facing_from: out[i].facing,
            facing_to: out[i].facing,
            kind: MotionKind::Adjust,
        });
    }
    Some(rebuild(ctx, current, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DanceType};
    use crate::grammar::Grammar;

    fn setup() -> (Grammar, Config) {
        let config = Config::default();
        (Grammar::new(&config), config)
    }

    #[test]
    fn all_primitives_have_distinct_names() {
        let mut names: Vec<&str> = Primitive::ALL.iter().map(|p| p.name()).collect();
        names.sort();
        let before = names.len();
        names.dedup();
        assert_eq!(names.len(), before);
        assert!(Primitive::ALL.iter().all(|p| p.name().starts_with('$')));
    }

    #[test]
    fn descriptors_cover_every_primitive() {
        for p in Primitive::ALL {
            let d = descriptor(p);
            assert!(d.args.len() <= 5, "{:?} takes too many args", p);
        }
        assert_eq!(descriptor(Primitive::Forward).largest_denominator, 2);
        assert_eq!(descriptor(Primitive::Nothing).largest_denominator, ANY);
        assert_eq!(descriptor(Primitive::Face).args.len(), 2);
    }

    #[test]
    fn check_arguments_counts_and_types() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let frac = ctx.stage.terms.alloc(Term::Fraction(Fraction::new(0, 1, 2)));
        assert!(check_arguments(&ctx, Primitive::Forward, &[frac]).is_ok());
        assert!(check_arguments(&ctx, Primitive::Forward, &[]).is_err());
        assert!(check_arguments(&ctx, Primitive::Forward, &[frac, frac]).is_err());
        let word = ctx.stage.terms.alloc(Term::Word("wave".into()));
        assert!(check_arguments(&ctx, Primitive::Forward, &[word]).is_err());
        assert!(check_arguments(&ctx, Primitive::In, &[word]).is_ok());
    }

    #[test]
    fn integers_satisfy_fraction_arguments() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let int = ctx.stage.terms.alloc(Term::Integer(2));
        assert!(check_arguments(&ctx, Primitive::Forward, &[int]).is_ok());
    }

    #[test]
    fn fractionalize_check_respects_denominators() {
        let half = Fraction::new(0, 1, 2);
        let third = Fraction::new(0, 1, 3);
        assert!(fractionalize_check(Primitive::Forward, &half).is_ok());
        assert!(fractionalize_check(Primitive::Forward, &third).is_err());
        assert!(fractionalize_check(Primitive::Face, &half).is_err());
        assert!(fractionalize_check(Primitive::Mirror, &third).is_ok());
    }

    #[test]
    fn quarters_toward_picks_shortest_right_turn() {
        assert_eq!(quarters_toward(Facing::Back, 0, 4), Some(0));
        assert_eq!(quarters_toward(Facing::Back, 4, 0), Some(1));
        assert_eq!(quarters_toward(Facing::Back, 0, -4), Some(2));
        assert_eq!(quarters_toward(Facing::Back, -4, 0), Some(3));
        assert_eq!(quarters_toward(Facing::Any, 0, 4), None);
    }

    #[test]
    fn until_home_is_undefined_from_a_squared_set() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        // #1 boy stands at (-1, -3): neither axis is zero, so the
        // until-home arc is undefined from a squared set
        assert_eq!(until_home_sixteenths(&ctx, home), None);
    }

    #[test]
    fn in_sequence_accepts_home_order() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        assert!(in_sequence(&ctx, home, Direction::AsYouAre));
    }
}
