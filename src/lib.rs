//! quadrille: a square dance choreography compiler.
//!
//! The crate loads a caller-authored grammar of calls, formations, and
//! designators, parses call phrases, and expands each call into a tree
//! of plans, steps, and tiles whose leaves are timed dancer motions.

pub mod anyone;
pub mod breathe;
pub mod config;
pub mod dancer;
pub mod explain;
pub mod formation;
pub mod grammar;
pub mod group;
pub mod lexer;
pub mod motion;
pub mod parser;
pub mod plan;
pub mod primitives;
pub mod stage;
pub mod term;
pub mod transform;

#[cfg(feature = "cli")]
pub mod cli;

pub use anyone::Anyone;
pub use config::{Config, DanceType, Level};
pub use dancer::{Dancer, DancerMask, Facing, Gender, MAX_DANCERS};
pub use explain::{Explanation, ExplanationKind, GrammarFileError};
pub use formation::{Formation, Geometry, PatternClosure};
pub use grammar::{Definition, Designator, Grammar, Pattern, Synonym, Variant};
pub use group::{Group, Rect, Rotation, TileAction};
pub use motion::{Interval, Motion, MotionKind};
pub use plan::{run_call, BreatheAction, CallOutcome, Plan, Step, StepKind, StepState, Tile};
pub use primitives::Primitive;
pub use stage::{Context, Stage};
pub use term::{Direction, Fraction, Pivot, Term};
pub use transform::Transform;
