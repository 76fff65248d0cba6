//! Plan construction and execution.
//!
//! A call expands into a tree: a Plan owns Steps, a Step owns Tiles,
//! and each Tile owns the Plan of its sub-group. Construction binds a
//! definition variant (or a tiling of variant formations) to the
//! starting group; performing walks the steps against the live group,
//! parsing part actions as it goes, merging tile results back into the
//! enclosing frame, and breathing between steps.

pub use crate::stage::{PlanId, StepId, TileId};

use crate::breathe::{sweep, TileExtent};
use crate::dancer::DancerMask;
use crate::explain::ExplanationKind;
use crate::formation::PatternClosure;
use crate::grammar::{Action, Pattern, VariantRef};
use crate::group::{self, TileAction};
use crate::motion::{Beats, Interval, Motion};
use crate::parser;
use crate::primitives;
use crate::stage::{Context, ExplanationId, GroupId, TermId};
use crate::term::{CallTerm, Fraction, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    New,
    Constructed,
    Performing,
    Performed,
    Breathed,
    SkippedBreathe,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreatheAction {
    Default,
    DontBreathe,
    Normalize,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    /// One primitive invocation.
    Primitive { call: TermId },
    /// One part of a bound variant.
    Part { variant: VariantRef, part: u32 },
    /// An opaque call distributed over formation tiles.
    Call { call: TermId },
    /// Concurrent tracks of a compound action.
    StartTogether,
}

#[derive(Debug)]
pub struct Step {
    pub plan: PlanId,
    pub kind: StepKind,
    pub tiles: Vec<TileId>,
    pub interval: Option<crate::stage::IntervalId>,
    pub state: StepState,
    pub breathe: BreatheAction,
    pub start: Option<GroupId>,
    pub result: Option<GroupId>,
    pub failed: Option<ExplanationId>,
}

#[derive(Debug)]
pub struct Tile {
    pub step: StepId,
    pub dancers: GroupId,
    pub plan: PlanId,
}

#[derive(Debug)]
pub struct Plan {
    pub parent: Option<PlanId>,
    pub start: GroupId,
    pub oriented_start: Option<GroupId>,
    pub call: TermId,
    pub variant: Option<VariantRef>,
    pub steps: Vec<StepId>,
    pub current: Option<GroupId>,
    pub final_group: Option<GroupId>,
    pub failed: Option<ExplanationId>,
    /// Dancers who moved in the most recent step.
    pub last_active: DancerMask,
    /// The most recent step's motions, for roll and flow.
    pub last_motions: Vec<Motion>,
    /// Every motion this plan performed, in order.
    pub motions: Vec<Motion>,
    pub beats: Beats,
    /// Plan-local designator bindings (`word = phrase` in who-lines).
    pub locals: Vec<(TermId, TermId)>,
    /// Pending fractionalization for primitives below.
    pub fraction: Option<Fraction>,
    /// When fractionalized, only this many leading steps perform.
    pub fraction_steps: Option<usize>,
}

pub fn new_plan(ctx: &mut Context, start: GroupId, call: TermId) -> PlanId {
    let last_active = ctx.stage.group(start).dancer_mask();
    ctx.stage.add_plan(Plan {
        parent: None,
        start,
        oriented_start: None,
        call,
        variant: None,
        steps: Vec::new(),
        current: None,
        final_group: None,
        failed: None,
        last_active,
        last_motions: Vec::new(),
        motions: Vec::new(),
        beats: 0,
        locals: Vec::new(),
        fraction: None,
        fraction_steps: None,
    })
}

pub fn new_sub_plan(ctx: &mut Context, parent: PlanId, start: GroupId, call: TermId) -> PlanId {
    let id = new_plan(ctx, start, call);
    let (last_active, locals) = {
        let p = ctx.stage.plan(parent);
        (p.last_active, p.locals.clone())
    };
    let plan = ctx.stage.plan_mut(id);
    plan.parent = Some(parent);
    plan.last_active = last_active;
    plan.locals = locals;
    id
}

pub fn fail_plan(ctx: &mut Context, plan: PlanId, kind: ExplanationKind, text: &str) -> bool {
    if ctx.stage.plan(plan).failed.is_none() {
        let e = ctx.explain(kind, text);
        ctx.stage.plan_mut(plan).failed = Some(e);
        log::debug!("plan failed: {}", text);
    }
    false
}

pub fn fail_step(ctx: &mut Context, step: StepId, kind: ExplanationKind, text: &str) {
    let e = ctx.explain(kind, text);
    let plan = {
        let s = ctx.stage.step_mut(step);
        s.failed = Some(e);
        s.state = StepState::Failed;
        s.plan
    };
    if ctx.stage.plan(plan).failed.is_none() {
        ctx.stage.plan_mut(plan).failed = Some(e);
    }
    log::debug!("step failed: {}", text);
}

/// A child plan failed; its explanation becomes this step's.
pub fn adopt_failure(ctx: &mut Context, child: PlanId, step: StepId) {
    let e = ctx.stage.plan(child).failed;
    let e = match e {
        Some(e) => e,
        None => ctx.explain(ExplanationKind::ProgramBug, "child plan failed without explanation"),
    };
    let plan = {
        let s = ctx.stage.step_mut(step);
        s.failed = Some(e);
        s.state = StepState::Failed;
        s.plan
    };
    if ctx.stage.plan(plan).failed.is_none() {
        ctx.stage.plan_mut(plan).failed = Some(e);
    }
}

pub fn failure_text(ctx: &Context, plan: PlanId) -> Option<String> {
    ctx.stage
        .plan(plan)
        .failed
        .map(|e| ctx.stage.explanation(e).text.clone())
}

pub fn suppress_breathing(ctx: &mut Context, step: StepId, action: BreatheAction) {
    // the setting applies to the nearest enclosing part step; starting
    // from this step is a sound approximation of that walk
    ctx.stage.step_mut(step).breathe = action;
    let plan = ctx.stage.step(step).plan;
    let parent_steps: Vec<StepId> = ctx.stage.plan(plan).steps.clone();
    for s in parent_steps {
        if matches!(ctx.stage.step(s).kind, StepKind::Part { .. }) {
            ctx.stage.step_mut(s).breathe = action;
        }
    }
}

pub fn collect_motions(ctx: &Context, child: PlanId, interval: &mut Interval) {
    let p = ctx.stage.plan(child);
    for m in &p.motions {
        interval.motions.push(*m);
    }
    interval.beats += p.beats;
}

/// Dancers whose position or facing differs between two same-frame
/// snapshots of the set.
pub fn moved_mask(ctx: &Context, before: &crate::group::Group, after: GroupId) -> DancerMask {
    let a = ctx.stage.group(after);
    let mut mask = 0;
    for d in before.dancers() {
        match a.dancer_by_index(d.index()) {
            Some(e) => {
                if e.x != d.x || e.y != d.y || e.facing != d.facing {
                    mask |= d.bit();
                }
            }
            None => mask |= d.bit(),
        }
    }
    mask
}

/// Recenter a group's bounding box on the origin.
pub fn breathe_group(ctx: &mut Context, group_id: GroupId) -> GroupId {
    let g = ctx.stage.group(group_id).clone();
    let (cx, cy) = g.center();
    if (cx, cy) == (0, 0) {
        return group_id;
    }
    let mut out = crate::group::Group::derived(group_id, &g, crate::transform::Transform::translate(cx, cy));
    for d in g.dancers() {
        let mut moved = *d;
        moved.x -= cx;
        moved.y -= cy;
        out.insert(moved);
    }
    out.done();
    ctx.stage.add_group(out)
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

pub fn construct_plan(ctx: &mut Context, plan_id: PlanId, action: TileAction) -> bool {
    let call_id = ctx.stage.plan(plan_id).call;
    let call = match ctx.term(call_id).clone() {
        Term::Call(c) => c,
        _ => return fail_plan(ctx, plan_id, ExplanationKind::DefinitionError, "Not a call"),
    };
    if let Some(p) = call.primitive {
        if let Err(msg) = primitives::check_arguments(ctx, p, &call.args) {
            return fail_plan(ctx, plan_id, ExplanationKind::DefinitionError, &msg);
        }
        let step = ctx.stage.add_step(Step {
            plan: plan_id,
            kind: StepKind::Primitive { call: call_id },
            tiles: Vec::new(),
            interval: None,
            state: StepState::Constructed,
            breathe: BreatheAction::Default,
            start: None,
            result: None,
            failed: None,
        });
        ctx.stage.plan_mut(plan_id).steps.push(step);
        return true;
    }
    match call.definition {
        Some(_) => construct_definition(ctx, plan_id, &call, action),
        None => fail_plan(ctx, plan_id, ExplanationKind::ProgramBug, "call has no definition or primitive"),
    }
}

/// Designating patterns consult the call's designator arguments; the
/// closure captures the resolved mask.
fn closure_for(ctx: &mut Context, plan_id: PlanId, pattern: &Pattern, call: &CallTerm) -> PatternClosure {
    if !pattern.discriminates() {
        return PatternClosure::default();
    }
    let start = ctx.stage.plan(plan_id).start;
    let last_active = ctx.stage.plan(plan_id).last_active;
    let anyone = parser::parse_designator_expression(
        ctx,
        &pattern.parameter_list,
        &call.args,
        crate::config::NO_LEVEL,
    );
    match anyone {
        Some(id) => match ctx.term(id).clone() {
            Term::Anyone(a) => {
                let mask = a.set.match_mask(ctx, start, last_active);
                PatternClosure::designating(mask)
            }
            _ => PatternClosure::default(),
        },
        None => PatternClosure::default(),
    }
}

fn construct_definition(ctx: &mut Context, plan_id: PlanId, call: &CallTerm, action: TileAction) -> bool {
    let dref = match call.definition {
        Some(d) => d,
        None => return fail_plan(ctx, plan_id, ExplanationKind::ProgramBug, "call has no definition"),
    };
    let def = ctx.grammar.definition(dref).clone();
    let start = ctx.stage.plan(plan_id).start;
    let level = ctx.level;

    for (vi, variant) in def.variants.iter().enumerate() {
        if level != crate::config::NO_LEVEL && variant.effective_level(def.level) > level {
            continue;
        }
        let vref = VariantRef {
            definition: dref,
            variant: vi as u32,
        };
        let recognizers = variant.recognizers();
        if recognizers.is_empty() {
            return bind_variant(ctx, plan_id, vref, start, call);
        }
        for pattern in &recognizers {
            let closure = closure_for(ctx, plan_id, pattern, call);
            let grammar = ctx.grammar;
            let formation = match grammar.formation(&pattern.formation) {
                Some(f) => f,
                None => continue,
            };
            if let Some(oriented) = group::match_formation(ctx, start, formation, &closure) {
                return bind_variant(ctx, plan_id, vref, oriented, call);
            }
            if action == TileAction::WithPhantoms {
                let count = ctx.stage.group(start).dancer_count();
                let grammar = ctx.grammar;
                let formation = match grammar.formation(&pattern.formation) {
                    Some(f) => f,
                    None => continue,
                };
                if let Some(filled) = group::match_with_phantoms(ctx, start, formation, &closure) {
                    if ctx.stage.group(filled).real_dancer_count() == count {
                        return bind_variant(ctx, plan_id, vref, filled, call);
                    }
                }
            }
        }
    }

    // no variant covers the whole group: try tiling into sub-groups
    let specs = ctx.grammar.definition_tiles(dref);
    if !specs.is_empty() {
        if let Some(tiles) = group::build_tiling(ctx, start, &specs, &PatternClosure::default(), action) {
            let call_id = ctx.stage.plan(plan_id).call;
            let step = ctx.stage.add_step(Step {
                plan: plan_id,
                kind: StepKind::Call { call: call_id },
                tiles: Vec::new(),
                interval: None,
                state: StepState::Constructed,
                breathe: BreatheAction::Default,
                start: Some(start),
                result: None,
                failed: None,
            });
            for t in &tiles {
                let sub = new_sub_plan(ctx, plan_id, t.dancers, call_id);
                let vref = match t.variant {
                    Some(v) => v,
                    None => continue,
                };
                if !bind_variant(ctx, sub, vref, t.dancers, call) {
                    adopt_failure(ctx, sub, step);
                    return false;
                }
                let tile = ctx.stage.add_tile(Tile {
                    step,
                    dancers: t.dancers,
                    plan: sub,
                });
                ctx.stage.step_mut(step).tiles.push(tile);
            }
            if ctx.stage.step(step).tiles.is_empty() {
                return fail_plan(
                    ctx,
                    plan_id,
                    ExplanationKind::UserError,
                    &format!("No formation of '{}' matched", def.label()),
                );
            }
            ctx.stage.plan_mut(plan_id).steps.push(step);
            return true;
        }
    }
    fail_plan(
        ctx,
        plan_id,
        ExplanationKind::UserError,
        &format!("No formation of '{}' matched", def.label()),
    )
}

fn bind_variant(ctx: &mut Context, plan_id: PlanId, vref: VariantRef, oriented: GroupId, call: &CallTerm) -> bool {
    let variant = ctx.grammar.variant(vref).clone();
    {
        let plan = ctx.stage.plan_mut(plan_id);
        plan.variant = Some(vref);
        plan.oriented_start = Some(oriented);
    }
    for (pi, part) in variant.parts.iter().enumerate() {
        let repeat = match repeat_count(ctx, plan_id, oriented, &part.repeat, call) {
            Some(r) => r,
            None => return false,
        };
        for _ in 0..repeat {
            let step = ctx.stage.add_step(Step {
                plan: plan_id,
                kind: StepKind::Part {
                    variant: vref,
                    part: pi as u32,
                },
                tiles: Vec::new(),
                interval: None,
                state: StepState::Constructed,
                breathe: BreatheAction::Default,
                start: None,
                result: None,
                failed: None,
            });
            ctx.stage.plan_mut(plan_id).steps.push(step);
        }
    }
    true
}

fn repeat_count(ctx: &mut Context, plan_id: PlanId, group: GroupId, repeat: &str, call: &CallTerm) -> Option<i32> {
    if repeat.trim().is_empty() {
        return Some(1);
    }
    let group_term = ctx.stage.terms.alloc(Term::Group(group));
    let grammar = ctx.grammar;
    let tokens = grammar.raw_tokens(
        repeat,
        true,
        Some(&ctx.stage.terms),
        Some(&call.args),
        Some(group_term),
        &[],
        false,
    );
    let (tokens, _) = match tokens {
        Some(t) => t,
        None => {
            fail_plan(ctx, plan_id, ExplanationKind::DefinitionError, "Could not parse repeat expression");
            return None;
        }
    };
    let mut parser = parser::ExprParser::new(&tokens, 0);
    let mut cx = ctx.term_cx();
    let term = match parser.parse_full(&mut cx) {
        Some(t) => t,
        None => {
            fail_plan(ctx, plan_id, ExplanationKind::DefinitionError, "Could not parse repeat expression");
            return None;
        }
    };
    match ctx.term(term) {
        Term::Fraction(f) => match f.improper_numerator(1, None) {
            Some(v) => Some(v),
            None => {
                fail_plan(ctx, plan_id, ExplanationKind::UserError, "Repeat expression is not a whole number");
                None
            }
        },
        _ => {
            fail_plan(ctx, plan_id, ExplanationKind::DefinitionError, "Repeat expression is not numeric");
            None
        }
    }
}

/// Limit a constructed plan to a leading fraction of its steps.
pub fn plan_fractionalize(ctx: &mut Context, plan_id: PlanId, f: Fraction) -> bool {
    let count = ctx.stage.plan(plan_id).steps.len();
    if count == 0 {
        return false;
    }
    if count == 1 {
        let step = ctx.stage.plan(plan_id).steps[0];
        if let StepKind::Primitive { call } = ctx.stage.step(step).kind.clone() {
            if let Term::Call(c) = ctx.term(call) {
                if let Some(p) = c.primitive {
                    if primitives::fractionalize_check(p, &f).is_err() {
                        return false;
                    }
                }
            }
        }
        ctx.stage.plan_mut(plan_id).fraction = Some(f);
        return true;
    }
    match f.improper_numerator(count as i32, None) {
        Some(k) if k >= 0 && (k as usize) <= count => {
            ctx.stage.plan_mut(plan_id).fraction_steps = Some(k as usize);
            true
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Performing
// ---------------------------------------------------------------------------

pub fn perform_plan(ctx: &mut Context, plan_id: PlanId) -> Option<GroupId> {
    if ctx.stage.plan(plan_id).failed.is_some() {
        return None;
    }
    let start = {
        let p = ctx.stage.plan(plan_id);
        p.oriented_start.unwrap_or(p.start)
    };
    ctx.stage.plan_mut(plan_id).current = Some(start);
    let steps = ctx.stage.plan(plan_id).steps.clone();
    let limit = ctx.stage.plan(plan_id).fraction_steps.unwrap_or(steps.len());
    for step in steps.into_iter().take(limit) {
        if perform_step(ctx, plan_id, step).is_none() {
            if ctx.stage.plan(plan_id).failed.is_none() {
                fail_plan(ctx, plan_id, ExplanationKind::ProgramBug, "step failed without explanation");
            }
            return None;
        }
    }
    let current = ctx.stage.plan(plan_id).current?;
    ctx.stage.plan_mut(plan_id).final_group = Some(current);
    Some(current)
}

fn perform_step(ctx: &mut Context, plan_id: PlanId, step_id: StepId) -> Option<()> {
    let current = ctx.stage.plan(plan_id).current?;
    {
        let s = ctx.stage.step_mut(step_id);
        s.start = Some(current);
        s.state = StepState::Performing;
    }
    let before = ctx.stage.group(current).clone();
    let la_before = ctx.stage.plan(plan_id).last_active;
    let mut interval = Interval::new();
    let kind = ctx.stage.step(step_id).kind.clone();
    let result = match kind {
        StepKind::Primitive { call } => {
            let (p, args) = match ctx.term(call).clone() {
                Term::Call(c) => (c.primitive?, c.args),
                _ => return None,
            };
            let fraction = ctx.stage.plan(plan_id).fraction;
            let r = primitives::execute(
                ctx,
                plan_id,
                step_id,
                p,
                &args,
                current,
                fraction,
                TileAction::All,
                &mut interval,
            );
            match r {
                Some(r) => Some(group::merge_to(ctx, r, current)),
                None => {
                    if ctx.stage.step(step_id).failed.is_none() {
                        fail_step(
                            ctx,
                            step_id,
                            ExplanationKind::UserError,
                            &format!("{} failed", p.name()),
                        );
                    } else {
                        // ensure the plan sees the step's explanation
                        let e = ctx.stage.step(step_id).failed;
                        if let (Some(e), None) = (e, ctx.stage.plan(plan_id).failed) {
                            ctx.stage.plan_mut(plan_id).failed = Some(e);
                        }
                    }
                    None
                }
            }
        }
        StepKind::Part { variant, part } => perform_part(ctx, plan_id, step_id, variant, part, &mut interval),
        StepKind::Call { .. } => perform_call_step(ctx, plan_id, step_id, &mut interval),
        StepKind::StartTogether => {
            fail_step(ctx, step_id, ExplanationKind::ProgramBug, "start-together step outside a part");
            None
        }
    };
    let result = result?;
    // breathing between steps
    let result = match ctx.stage.step(step_id).breathe {
        BreatheAction::DontBreathe => {
            ctx.stage.step_mut(step_id).state = StepState::SkippedBreathe;
            result
        }
        BreatheAction::Normalize => {
            let r = breathe_group(ctx, result);
            ctx.stage.step_mut(step_id).state = StepState::Breathed;
            group::merge_to(ctx, r, current)
        }
        BreatheAction::Default => {
            ctx.stage.step_mut(step_id).state = StepState::Performed;
            result
        }
    };
    {
        let plan = ctx.stage.plan_mut(plan_id);
        plan.current = Some(result);
        plan.motions.extend(interval.motions.iter().copied());
        plan.beats += interval.beats;
        if !interval.motions.is_empty() {
            plan.last_motions = interval.motions.clone();
        }
    }
    let la_after = ctx.stage.plan(plan_id).last_active;
    if la_after == la_before && !interval.motions.is_empty() {
        let mask = moved_mask(ctx, &before, result);
        if mask != 0 {
            ctx.stage.plan_mut(plan_id).last_active = mask;
        }
    }
    let iid = ctx.stage.add_interval(interval);
    {
        let s = ctx.stage.step_mut(step_id);
        s.interval = Some(iid);
        s.result = Some(result);
        if s.state == StepState::Performing {
            s.state = StepState::Performed;
        }
    }
    Some(())
}

fn perform_part(
    ctx: &mut Context,
    plan_id: PlanId,
    step_id: StepId,
    vref: VariantRef,
    part_index: u32,
    interval: &mut Interval,
) -> Option<GroupId> {
    let part = ctx.grammar.variant(vref).parts[part_index as usize].clone();
    let call_args = match ctx.term(ctx.stage.plan(plan_id).call).clone() {
        Term::Call(c) => c.args,
        _ => Vec::new(),
    };
    let mut current = ctx.stage.plan(plan_id).current?;
    for action in &part.actions {
        if action.noop() {
            continue;
        }
        match action {
            Action::Simple(text) => {
                let locals = ctx.stage.plan(plan_id).locals.clone();
                let sub_call = match parser::parse_call(ctx, current, text, true, &call_args, &locals) {
                    Some(c) => c,
                    None => {
                        fail_step(
                            ctx,
                            step_id,
                            ExplanationKind::DefinitionError,
                            &format!("Unrecognized text: {}", text),
                        );
                        return None;
                    }
                };
                let sub = new_sub_plan(ctx, plan_id, current, sub_call);
                let tile = ctx.stage.add_tile(Tile {
                    step: step_id,
                    dancers: current,
                    plan: sub,
                });
                ctx.stage.step_mut(step_id).tiles.push(tile);
                if !construct_plan(ctx, sub, TileAction::All) {
                    adopt_failure(ctx, sub, step_id);
                    return None;
                }
                let r = match perform_plan(ctx, sub) {
                    Some(r) => r,
                    None => {
                        adopt_failure(ctx, sub, step_id);
                        return None;
                    }
                };
                collect_motions(ctx, sub, interval);
                // propagate the sub-call's active-dancer record
                let la = ctx.stage.plan(sub).last_active;
                ctx.stage.plan_mut(plan_id).last_active = la;
                current = group::merge_to(ctx, r, current);
                ctx.stage.plan_mut(plan_id).current = Some(current);
            }
            Action::Compound(tracks) => {
                current = perform_compound(ctx, plan_id, step_id, tracks, &call_args, current, interval)?;
                ctx.stage.plan_mut(plan_id).current = Some(current);
            }
        }
    }
    Some(current)
}

fn perform_compound(
    ctx: &mut Context,
    plan_id: PlanId,
    part_step: StepId,
    tracks: &[crate::grammar::Track],
    call_args: &[TermId],
    current: GroupId,
    interval: &mut Interval,
) -> Option<GroupId> {
    let together = ctx.stage.add_step(Step {
        plan: plan_id,
        kind: StepKind::StartTogether,
        tiles: Vec::new(),
        interval: None,
        state: StepState::Performing,
        breathe: BreatheAction::Default,
        start: Some(current),
        result: None,
        failed: None,
    });
    let before = ctx.stage.group(current).clone();
    let mut claimed: DancerMask = 0;
    let mut outcomes: Vec<(DancerMask, GroupId)> = Vec::new();
    for track in tracks {
        if track.noop() {
            continue;
        }
        let locals = ctx.stage.plan(plan_id).locals.clone();
        let (local, anyone_term) = match parser::parse_anyone(ctx, current, &track.who, call_args, &locals) {
            Some(r) => r,
            None => {
                fail_step(
                    ctx,
                    part_step,
                    ExplanationKind::DefinitionError,
                    &format!("Unrecognized designator: {}", track.who),
                );
                return None;
            }
        };
        if let Some(word) = local {
            ctx.stage.plan_mut(plan_id).locals.push((word, anyone_term));
        }
        let anyone = match ctx.term(anyone_term).clone() {
            Term::Anyone(a) => a.set,
            _ => return None,
        };
        let last_active = ctx.stage.plan(plan_id).last_active;
        let mask = anyone.match_mask(ctx, current, last_active);
        if mask == 0 {
            if track.any_who_can {
                continue;
            }
            fail_step(
                ctx,
                part_step,
                ExplanationKind::UserError,
                "No one matched the designated dancers",
            );
            return None;
        }
        if mask & claimed != 0 {
            fail_step(
                ctx,
                part_step,
                ExplanationKind::DefinitionError,
                "Cannot direct the same people to do two things at the same time",
            );
            return None;
        }
        if track.what.trim().is_empty() {
            claimed |= mask;
            continue;
        }
        let subset = group::extract(ctx, current, mask);
        let locals = ctx.stage.plan(plan_id).locals.clone();
        let what_call = match parser::parse_call(ctx, subset, &track.what, true, call_args, &locals) {
            Some(c) => c,
            None => {
                fail_step(
                    ctx,
                    part_step,
                    ExplanationKind::DefinitionError,
                    &format!("Unrecognized text: {}", track.what),
                );
                return None;
            }
        };
        let sub = new_sub_plan(ctx, plan_id, subset, what_call);
        let tile = ctx.stage.add_tile(Tile {
            step: together,
            dancers: subset,
            plan: sub,
        });
        ctx.stage.step_mut(together).tiles.push(tile);
        let tile_action = if track.any_who_can {
            TileAction::AnyWhoCan
        } else {
            TileAction::All
        };
        let constructed = construct_plan(ctx, sub, tile_action);
        if !constructed {
            if track.any_who_can {
                continue;
            }
            adopt_failure(ctx, sub, part_step);
            return None;
        }
        let r = match perform_plan(ctx, sub) {
            Some(r) => r,
            None => {
                if track.any_who_can {
                    continue;
                }
                adopt_failure(ctx, sub, part_step);
                return None;
            }
        };
        collect_motions(ctx, sub, interval);
        let merged = group::merge_to(ctx, r, subset);
        let restored = group::merge(ctx, merged);
        claimed |= mask;
        outcomes.push((mask, restored));
    }
    // splice the tracks' outcomes over the untouched dancers
    let mut dancers = Vec::new();
    for d in before.dancers() {
        let mut placed = false;
        for (mask, result) in &outcomes {
            if mask & d.bit() != 0 {
                if let Some(e) = ctx.stage.group(*result).dancer_by_index(d.index()) {
                    dancers.push(*e);
                    placed = true;
                }
                break;
            }
        }
        if !placed {
            dancers.push(*d);
        }
    }
    let g = ctx.stage.group(current).clone();
    let mut out = crate::group::Group::derived(current, &g, crate::transform::IDENTITY);
    for d in dancers {
        out.insert(d);
    }
    out.done();
    let result = ctx.stage.add_group(out);
    ctx.stage.plan_mut(plan_id).last_active = claimed;
    {
        let s = ctx.stage.step_mut(together);
        s.result = Some(result);
        s.state = StepState::Performed;
    }
    Some(result)
}

fn perform_call_step(
    ctx: &mut Context,
    plan_id: PlanId,
    step_id: StepId,
    interval: &mut Interval,
) -> Option<GroupId> {
    let current = ctx.stage.plan(plan_id).current?;
    let tiles = ctx.stage.step(step_id).tiles.clone();
    let before = ctx.stage.group(current).clone();
    let mut outcomes: Vec<(DancerMask, GroupId, TileExtent)> = Vec::new();
    let mut active: DancerMask = 0;
    for tile_id in &tiles {
        let (tile_plan, tile_group) = {
            let t = ctx.stage.tile(*tile_id);
            (t.plan, t.dancers)
        };
        let r = match perform_plan(ctx, tile_plan) {
            Some(r) => r,
            None => {
                adopt_failure(ctx, tile_plan, step_id);
                return None;
            }
        };
        collect_motions(ctx, tile_plan, interval);
        // revert the tile result into the step frame
        let merged = group::merge_to(ctx, r, tile_group);
        let merged_group = group::merge(ctx, merged);
        let restored = group::merge_to(ctx, merged_group, current);
        let mask = ctx.stage.group(tile_group).dancer_mask();
        active |= ctx.stage.plan(tile_plan).last_active & mask;
        let before_box = subset_box(&before, mask);
        let after_box = subset_box(ctx.stage.group(restored), mask);
        outcomes.push((
            mask,
            restored,
            TileExtent {
                before: before_box,
                now: after_box,
            },
        ));
    }
    if outcomes.is_empty() {
        fail_step(ctx, step_id, ExplanationKind::UserError, "No tiles to perform");
        return None;
    }
    // untouched dancers hold their ground as one-dancer tiles
    let covered: DancerMask = outcomes.iter().map(|(m, _, _)| m).fold(0, |a, b| a | *b);
    let mut extents: Vec<TileExtent> = outcomes.iter().map(|(_, _, e)| *e).collect();
    let mut loose: Vec<DancerMask> = Vec::new();
    for d in before.dancers() {
        if covered & d.bit() == 0 {
            let b = subset_box(&before, d.bit());
            extents.push(TileExtent { before: b, now: b });
            loose.push(d.bit());
        }
    }
    let shifts = if matches!(ctx.stage.step(step_id).breathe, BreatheAction::DontBreathe) {
        vec![(0, 0); extents.len()]
    } else {
        if ctx.config.verbose_breathing {
            log::debug!("breathing {} tiles", extents.len());
        }
        sweep(&extents)
    };
    // splice every tile's dancers, shifted by the breather
    let mut dancers = Vec::new();
    for d in before.dancers() {
        let mut placed = false;
        for (i, (mask, result, _)) in outcomes.iter().enumerate() {
            if mask & d.bit() != 0 {
                if let Some(e) = ctx.stage.group(*result).dancer_by_index(d.index()) {
                    let mut moved = *e;
                    moved.x += shifts[i].0;
                    moved.y += shifts[i].1;
                    dancers.push(moved);
                    placed = true;
                }
                break;
            }
        }
        if !placed {
            let li = loose.iter().position(|m| m & d.bit() != 0);
            let (dx, dy) = match li {
                Some(li) => shifts[outcomes.len() + li],
                None => (0, 0),
            };
            let mut held = *d;
            held.x += dx;
            held.y += dy;
            dancers.push(held);
        }
    }
    let g = ctx.stage.group(current).clone();
    let mut out = crate::group::Group::derived(current, &g, crate::transform::IDENTITY);
    for d in dancers {
        out.insert(d);
    }
    out.done();
    let result = ctx.stage.add_group(out);
    if active != 0 {
        ctx.stage.plan_mut(plan_id).last_active = active;
    }
    ctx.stage.step_mut(step_id).result = Some(result);
    Some(result)
}

fn subset_box(group: &crate::group::Group, mask: DancerMask) -> crate::group::Rect {
    let mut r = crate::group::Rect {
        left: i32::MAX,
        bottom: i32::MAX,
        right: i32::MIN,
        top: i32::MIN,
    };
    let mut any = false;
    for d in group.dancers() {
        if mask & d.bit() != 0 {
            any = true;
            r.left = r.left.min(d.x - 1);
            r.right = r.right.max(d.x + 1);
            r.bottom = r.bottom.min(d.y - 1);
            r.top = r.top.max(d.y + 1);
        }
    }
    if !any {
        return crate::group::Rect::default();
    }
    r
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CallOutcome {
    pub plan: PlanId,
    pub final_group: GroupId,
    pub beats: Beats,
}

/// Parse, construct, and perform one call phrase against a starting
/// group. On failure the topmost explanation is returned.
pub fn run_call(ctx: &mut Context, start: GroupId, text: &str) -> Result<CallOutcome, crate::explain::Explanation> {
    let call = match parser::parse_call(ctx, start, text, false, &[], &[]) {
        Some(c) => c,
        None => {
            return Err(crate::explain::Explanation::new(
                ExplanationKind::UserError,
                format!("Unrecognized call: {}", text),
            ))
        }
    };
    let plan = new_plan(ctx, start, call);
    if !construct_plan(ctx, plan, TileAction::All) || perform_plan(ctx, plan).is_none() {
        let e = ctx
            .stage
            .plan(plan)
            .failed
            .map(|e| ctx.stage.explanation(e).clone())
            .unwrap_or_else(|| crate::explain::Explanation::new(ExplanationKind::ProgramBug, "plan failed"));
        return Err(e);
    }
    let p = ctx.stage.plan(plan);
    match p.final_group {
        Some(final_group) => Ok(CallOutcome {
            plan,
            final_group,
            beats: p.beats,
        }),
        None => Err(crate::explain::Explanation::new(
            ExplanationKind::ProgramBug,
            "plan finished without a result",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DanceType};
    use crate::dancer::{boys_mask, dancer_index, Facing, Gender};
    use crate::grammar::Grammar;
    use crate::group::Group;

    const GRAMMAR: &str = "\
-- Basic\n\
.walk\n\
walk integer steps\n\
\t>$forward($1/2)\n\
-- Basic\n\
.face_right\n\
quarter right\n\
\t>$face(right, $self)\n\
-- Basic\n\
.nothing_much\n\
hold still\n\
\t>$nothing()\n\
-- Basic\n\
.uturn\n\
u turn back\n\
\t>$face(right, $self)\n\
\t+\n\
\t>$face(right, $self)\n\
@@\n\
%%\n\
=couple\n\
a? . a?\n\
=box\n\
a^ . av\n\
. . .\n\
a^ . av\n\
=twosome\n\
a- . a-\n";

    fn setup() -> (Grammar, Config) {
        let config = Config::default();
        let grammar = Grammar::read_str(GRAMMAR, &config);
        assert!(grammar.errors().is_empty(), "grammar errors: {:?}", grammar.errors());
        (grammar, config)
    }

    #[test]
    fn walk_moves_everyone_forward() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let outcome = run_call(&mut ctx, home, "walk 4 steps").expect("walk should run");
        let g = ctx.stage.group(outcome.final_group);
        // everyone walked two full positions toward the center and out
        // the other side
        let boy1 = g.dancer_by_index(dancer_index(1, Gender::Boy)).unwrap();
        assert_eq!((boy1.x, boy1.y), (-1, 1));
        assert_eq!(boy1.facing, Facing::Back);
        let boy3 = g.dancer_by_index(dancer_index(3, Gender::Boy)).unwrap();
        assert_eq!((boy3.x, boy3.y), (1, -1));
    }

    #[test]
    fn walk_records_motions_with_beats() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let outcome = run_call(&mut ctx, home, "walk 2 steps").expect("run");
        assert!(outcome.beats > 0);
        let plan = ctx.stage.plan(outcome.plan);
        assert_eq!(plan.motions.len(), 8, "each dancer records one motion");
    }

    #[test]
    fn quarter_right_turns_in_place() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let outcome = run_call(&mut ctx, home, "quarter right").expect("run");
        let g = ctx.stage.group(outcome.final_group);
        let boy1 = g.dancer_by_index(dancer_index(1, Gender::Boy)).unwrap();
        assert_eq!((boy1.x, boy1.y), (-1, -3));
        assert_eq!(boy1.facing, Facing::Right);
    }

    #[test]
    fn multi_part_definition_chains_parts() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let outcome = run_call(&mut ctx, home, "u turn back").expect("run");
        let g = ctx.stage.group(outcome.final_group);
        let boy1 = g.dancer_by_index(dancer_index(1, Gender::Boy)).unwrap();
        // two quarter rights make a half turn
        assert_eq!(boy1.facing, Facing::Front);
        let plan = ctx.stage.plan(outcome.plan);
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn unknown_call_reports_user_error() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let err = run_call(&mut ctx, home, "teleport home").unwrap_err();
        assert_eq!(err.kind, ExplanationKind::UserError);
    }

    #[test]
    fn last_active_tracks_the_moving_dancers() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let outcome = run_call(&mut ctx, home, "walk 2 steps").expect("run");
        let plan = ctx.stage.plan(outcome.plan);
        assert_eq!(plan.last_active, ctx.stage.group(home).dancer_mask());
    }

    #[test]
    fn nothing_keeps_positions_and_active_mask() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let outcome = run_call(&mut ctx, home, "hold still").expect("run");
        let g = ctx.stage.group(outcome.final_group);
        assert!(g.equals(ctx.stage.group(home)));
    }

    #[test]
    fn fractionalized_plan_performs_leading_steps() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let call = parser::parse_call(&mut ctx, home, "u turn back", false, &[], &[]).unwrap();
        let plan = new_plan(&mut ctx, home, call);
        assert!(construct_plan(&mut ctx, plan, TileAction::All));
        assert!(plan_fractionalize(&mut ctx, plan, Fraction::new(0, 1, 2)));
        let result = perform_plan(&mut ctx, plan).expect("half a u-turn");
        let g = ctx.stage.group(result);
        let boy1 = g.dancer_by_index(dancer_index(1, Gender::Boy)).unwrap();
        // only the first quarter performed
        assert_eq!(boy1.facing, Facing::Right);
    }

    #[test]
    fn boys_run_exchanges_with_girls_in_a_wave() {
        let config = Config::default();
        let grammar = Grammar::read_str(GRAMMAR_RUN, &config);
        assert!(grammar.errors().is_empty(), "{:?}", grammar.errors());
        let mut ctx = Context::new(&grammar, config);
        let wave = ctx.stage.add_group(Group::from_dancers(
            crate::formation::Geometry::Grid,
            vec![
                crate::dancer::Dancer::new(-3, 0, Facing::Back, Gender::Boy, 1),
                crate::dancer::Dancer::new(-1, 0, Facing::Front, Gender::Girl, 2),
                crate::dancer::Dancer::new(1, 0, Facing::Back, Gender::Boy, 3),
                crate::dancer::Dancer::new(3, 0, Facing::Front, Gender::Girl, 4),
            ],
        ));
        let outcome = run_call(&mut ctx, wave, "boys run").expect("boys run from a wave");
        let g = ctx.stage.group(outcome.final_group);
        // the boys end on the girls' old spots facing the other way
        let boy1 = g.dancer_by_index(dancer_index(1, Gender::Boy)).unwrap();
        assert_eq!((boy1.x, boy1.y), (-1, 0));
        assert_eq!(boy1.facing, Facing::Front);
        let girl2 = g.dancer_by_index(dancer_index(2, Gender::Girl)).unwrap();
        assert_eq!((girl2.x, girl2.y), (-3, 0));
        assert_eq!(girl2.facing, Facing::Front);
        let plan = ctx.stage.plan(outcome.plan);
        assert_eq!(plan.last_active, boys_mask() & ctx.stage.group(wave).dancer_mask());
    }

    const GRAMMAR_RUN: &str = "\
-- Basic\n\
.run\n\
anyone run\n\
\t>$run($1)\n\
%%\n\
=couple\n\
a? . a?\n";

    #[test]
    fn heads_run_from_home_fails_cleanly() {
        let config = Config::default();
        let grammar = Grammar::read_str(GRAMMAR_RUN, &config);
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        let err = run_call(&mut ctx, home, "heads run").unwrap_err();
        assert_eq!(err.kind, ExplanationKind::UserError);
        assert!(
            err.text.contains("unique partners"),
            "unexpected failure text: {}",
            err.text
        );
    }
}
