//! The per-call arena and compile context.
//!
//! A `Stage` owns every term, group, plan, step, tile, interval, and
//! explanation produced while resolving one top-level call; the whole
//! graph is dropped together when the call is replaced. Objects refer
//! to each other through typed indices, never owning pointers, so the
//! group DAG and the plan tree need no shared ownership.
//!
//! Terms live in one of two spaces: the grammar's own store (dictionary
//! words and trie literals, long-lived) or the stage (everything a
//! parse produces). The space is encoded in the id's high bit.

use crate::config::{Config, Level, NO_LEVEL};

use crate::explain::{Explanation, ExplanationKind};
use crate::grammar::Grammar;
use crate::group::Group;
use crate::motion::Interval;
use crate::plan::{Plan, Step, Tile};
use crate::term::{Term, TermCx};

const GRAMMAR_SPACE: u32 = 1 << 31;

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(GroupId);
arena_id!(PlanId);
arena_id!(StepId);
arena_id!(TileId);
arena_id!(IntervalId);
arena_id!(ExplanationId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermId(u32);

impl TermId {
    pub fn is_grammar_space(self) -> bool {
        self.0 & GRAMMAR_SPACE != 0
    }

    pub fn index(self) -> usize {
        (self.0 & !GRAMMAR_SPACE) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSpace {
    Grammar,
    Call,
}

#[derive(Debug, Default)]
pub struct TermStore {
    grammar_space: bool,
    terms: Vec<Term>,
}

impl TermStore {
    pub fn new(space: TermSpace) -> TermStore {
        TermStore {
            grammar_space: matches!(space, TermSpace::Grammar),
            terms: Vec::new(),
        }
    }

    pub fn alloc(&mut self, term: Term) -> TermId {
        let index = self.terms.len() as u32;
        self.terms.push(term);
        if self.grammar_space {
            TermId(index | GRAMMAR_SPACE)
        } else {
            TermId(index)
        }
    }

    pub fn get(&self, id: TermId) -> &Term {
        debug_assert_eq!(id.is_grammar_space(), self.grammar_space);
        &self.terms[id.index()]
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn clear(&mut self) {
        self.terms.clear();
    }
}

/// Arena for one top-level call.
#[derive(Debug, Default)]
pub struct Stage {
    pub terms: TermStore,
    groups: Vec<Group>,
    plans: Vec<Plan>,
    steps: Vec<Step>,
    tiles: Vec<Tile>,
    intervals: Vec<Interval>,
    explanations: Vec<Explanation>,
    next_phantom: u8,
}

impl Stage {
    pub fn new() -> Stage {
        Stage {
            terms: TermStore::new(TermSpace::Call),
            groups: Vec::new(),
            plans: Vec::new(),
            steps: Vec::new(),
            tiles: Vec::new(),
            intervals: Vec::new(),
            explanations: Vec::new(),
            next_phantom: 0,
        }
    }

    pub fn add_group(&mut self, group: Group) -> GroupId {
        let id = GroupId(self.groups.len() as u32);
        self.groups.push(group);
        id
    }

    pub fn group(&self, id: GroupId) -> &Group {
        &self.groups[id.index()]
    }

    pub fn group_mut(&mut self, id: GroupId) -> &mut Group {
        &mut self.groups[id.index()]
    }

    pub fn add_plan(&mut self, plan: Plan) -> PlanId {
        let id = PlanId(self.plans.len() as u32);
        self.plans.push(plan);
        id
    }

    pub fn plan(&self, id: PlanId) -> &Plan {
        &self.plans[id.index()]
    }

    pub fn plan_mut(&mut self, id: PlanId) -> &mut Plan {
        &mut self.plans[id.index()]
    }

    pub fn add_step(&mut self, step: Step) -> StepId {
        let id = StepId(self.steps.len() as u32);
        self.steps.push(step);
        id
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.index()]
    }

    pub fn step_mut(&mut self, id: StepId) -> &mut Step {
        &mut self.steps[id.index()]
    }

    pub fn add_tile(&mut self, tile: Tile) -> TileId {
        let id = TileId(self.tiles.len() as u32);
        self.tiles.push(tile);
        id
    }

    pub fn tile(&self, id: TileId) -> &Tile {
        &self.tiles[id.index()]
    }

    pub fn tile_mut(&mut self, id: TileId) -> &mut Tile {
        &mut self.tiles[id.index()]
    }

    pub fn add_interval(&mut self, interval: Interval) -> IntervalId {
        let id = IntervalId(self.intervals.len() as u32);
        self.intervals.push(interval);
        id
    }

    pub fn interval(&self, id: IntervalId) -> &Interval {
        &self.intervals[id.index()]
    }

    pub fn interval_mut(&mut self, id: IntervalId) -> &mut Interval {
        &mut self.intervals[id.index()]
    }

    pub fn add_explanation(&mut self, explanation: Explanation) -> ExplanationId {
        let id = ExplanationId(self.explanations.len() as u32);
        self.explanations.push(explanation);
        id
    }

    pub fn explanation(&self, id: ExplanationId) -> &Explanation {
        &self.explanations[id.index()]
    }

    /// Dancer index for the next synthesized phantom. Real dancers in a
    /// four-couple set use indices 0..8; phantoms cycle through the
    /// remainder.
    pub fn next_phantom(&mut self, real_dancers: u8) -> u8 {
        let slots = crate::dancer::MAX_DANCERS as u8 - real_dancers;
        let index = real_dancers + (self.next_phantom % slots.max(1));
        self.next_phantom = self.next_phantom.wrapping_add(1);
        index
    }
}

/// Everything a compile session needs: the shared grammar, the session
/// configuration, and the stage being filled.
pub struct Context<'g> {
    pub grammar: &'g Grammar,
    pub config: Config,
    pub stage: Stage,
    /// Level the sequence dances at; productions above it are invisible.
    pub level: Level,
}

impl<'g> Context<'g> {
    pub fn new(grammar: &'g Grammar, config: Config) -> Context<'g> {
        Context {
            grammar,
            config,
            stage: Stage::new(),
            level: NO_LEVEL,
        }
    }

    pub fn with_level(grammar: &'g Grammar, config: Config, level: Level) -> Context<'g> {
        Context {
            grammar,
            config,
            stage: Stage::new(),
            level,
        }
    }

    pub fn term(&self, id: TermId) -> &Term {
        if id.is_grammar_space() {
            self.grammar.terms().get(id)
        } else {
            self.stage.terms.get(id)
        }
    }

    pub fn term_cx(&mut self) -> TermCx<'_> {
        TermCx {
            grammar_terms: self.grammar.terms(),
            stage_terms: &mut self.stage.terms,
        }
    }

    pub fn explain(&mut self, kind: ExplanationKind, text: impl Into<String>) -> ExplanationId {
        self.stage.add_explanation(Explanation::new(kind, text))
    }

    /// Fresh stage for the next top-level call; grammar and config stay.
    pub fn reset(&mut self) {
        self.stage = Stage::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_ids_remember_their_space() {
        let mut grammar_store = TermStore::new(TermSpace::Grammar);
        let mut call_store = TermStore::new(TermSpace::Call);
        let g = grammar_store.alloc(Term::Integer(1));
        let c = call_store.alloc(Term::Integer(2));
        assert!(g.is_grammar_space());
        assert!(!c.is_grammar_space());
        assert_eq!(g.index(), 0);
        assert_eq!(c.index(), 0);
        assert_ne!(g, c);
    }

    #[test]
    fn stores_round_trip_terms() {
        let mut store = TermStore::new(TermSpace::Call);
        let id = store.alloc(Term::Word("wheel".into()));
        match store.get(id) {
            Term::Word(w) => assert_eq!(w, "wheel"),
            other => panic!("expected word, got {:?}", other),
        }
    }

    #[test]
    fn phantom_indices_avoid_real_dancers() {
        let mut stage = Stage::new();
        let a = stage.next_phantom(8);
        let b = stage.next_phantom(8);
        assert!(a >= 8 && (a as usize) < crate::dancer::MAX_DANCERS);
        assert!(b >= 8 && (b as usize) < crate::dancer::MAX_DANCERS);
        assert_ne!(a, b);
    }
}
