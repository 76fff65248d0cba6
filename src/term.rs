//! The term algebra.
//!
//! Every value the parser produces is a `Term`: typed, immutable, and
//! arena-allocated in either the grammar's term store (dictionary words,
//! trie literals) or the per-call stage. Arithmetic and boolean
//! operators return a fresh term or fail; mismatched variants fail.

use crate::anyone::Anyone;
use crate::config::Level;
use crate::primitives::Primitive;
use crate::stage::{GroupId, TermId, TermStore};

/// Comparison result for terms that are the same kind but carry no
/// ordering (two words, two calls). Equality tests treat it as
/// "not equal"; relational tests reject it.
pub const UNORDERED: i32 = i32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AsYouAre,
    Left,
    Right,
    Forward,
    Back,
    In,
    Out,
    Promenade,
    ReversePromenade,
    Partner,
    Corner,
    OriginalPartner,
    OriginalCorner,
    Last,
    AwayFromPartner,
}

pub const DIRECTION_NAMES: [(&str, Direction); 15] = [
    ("$as_you_are", Direction::AsYouAre),
    ("left", Direction::Left),
    ("right", Direction::Right),
    ("forward", Direction::Forward),
    ("back", Direction::Back),
    ("in", Direction::In),
    ("out", Direction::Out),
    ("promenade", Direction::Promenade),
    ("$reverse_promenade", Direction::ReversePromenade),
    ("partner", Direction::Partner),
    ("corner", Direction::Corner),
    ("$original_partner", Direction::OriginalPartner),
    ("$original_corner", Direction::OriginalCorner),
    ("$last", Direction::Last),
    ("$away_from_partner", Direction::AwayFromPartner),
];

impl Direction {
    pub fn name(self) -> &'static str {
        DIRECTION_NAMES
            .iter()
            .find(|(_, d)| *d == self)
            .map(|(n, _)| *n)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pivot {
    Center,
    BoxCenter,
    SplitCenter,
    LineCenter,
    InsideHand,
    OutsideHand,
    LastHand,
    LeftHand,
    InsideDancer,
    OutsideDancer,
    LeftDancer,
    RightHand,
    RightDancer,
    Hand,
    Zelf,
    Nose,
    Tail,
    InsideShoulder,
    LeftTwoDancers,
}

pub const PIVOT_NAMES: [(&str, Pivot); 19] = [
    ("$center", Pivot::Center),
    ("$box_center", Pivot::BoxCenter),
    ("$split_center", Pivot::SplitCenter),
    ("$line_center", Pivot::LineCenter),
    ("$inside_hand", Pivot::InsideHand),
    ("$outside_hand", Pivot::OutsideHand),
    ("$last_hand", Pivot::LastHand),
    ("$left_hand", Pivot::LeftHand),
    ("$inside_dancer", Pivot::InsideDancer),
    ("$outside_dancer", Pivot::OutsideDancer),
    ("$left_dancer", Pivot::LeftDancer),
    ("$right_hand", Pivot::RightHand),
    ("$right_dancer", Pivot::RightDancer),
    ("$hand", Pivot::Hand),
    ("$self", Pivot::Zelf),
    ("$nose", Pivot::Nose),
    ("$tail", Pivot::Tail),
    ("$inside_shoulder", Pivot::InsideShoulder),
    ("$left_2_dancers", Pivot::LeftTwoDancers),
];

impl Pivot {
    pub fn name(self) -> &'static str {
        PIVOT_NAMES
            .iter()
            .find(|(_, p)| *p == self)
            .map(|(n, _)| *n)
            .unwrap_or("")
    }
}

/// (whole, numerator, denominator). Denominator 0 marks a magic,
/// non-numeric fraction used as an enumerated constant; `$until_home`
/// is Fraction(0, 1, 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub whole: i32,
    pub num: i32,
    pub denom: i32,
}

impl Fraction {
    pub fn new(whole: i32, num: i32, denom: i32) -> Fraction {
        Fraction { whole, num, denom }
    }

    pub fn whole(value: i32) -> Fraction {
        Fraction::new(value, 0, 1)
    }

    pub fn until_home() -> Fraction {
        Fraction::new(0, 1, 0)
    }

    pub fn is_magic(&self) -> bool {
        self.denom == 0
    }

    pub fn is_until_home(&self) -> bool {
        self.denom == 0 && self.num == 1 && self.whole == 0
    }

    /// A normalized fraction has a positive denominator and a numerator
    /// in [0, denominator). The GCD of numerator and denominator may
    /// still exceed 1.
    pub fn normalize(self) -> Fraction {
        let mut f = self;
        if f.denom == 0 {
            return f;
        }
        if f.denom < 0 {
            f.denom = -f.denom;
            f.num = -f.num;
        }
        if f.num >= f.denom {
            f.whole += f.num / f.denom;
            f.num %= f.denom;
        }
        if f.num < 0 {
            let borrow = (-f.num + f.denom - 1) / f.denom;
            f.num += borrow * f.denom;
            f.whole -= borrow;
        }
        f
    }

    /// Numerator of the improper fraction formed when the value is
    /// expressed over `denominator`; fails unless that numerator is a
    /// whole integer. `multiplier`, when present, scales this value
    /// first and must be a proper (whole-free, non-magic) fraction.
    pub fn improper_numerator(&self, denominator: i32, multiplier: Option<&Fraction>) -> Option<i32> {
        if self.denom == 0 || denominator == 0 {
            return None;
        }
        let mut num = self.num;
        let mut denom = self.denom;
        let mut whole = self.whole;
        if let Some(m) = multiplier {
            if m.whole != 0 || m.denom == 0 {
                return None;
            }
            num *= m.num;
            num += whole % m.denom;
            denom *= m.denom;
            whole /= m.denom;
        }
        let p = num * denominator;
        if p % denom != 0 {
            return None;
        }
        Some(whole * denominator + p / denom)
    }

    pub fn negate(self) -> Option<Fraction> {
        if self.denom == 0 {
            return None;
        }
        Some(Fraction::new(-self.whole, -self.num, self.denom).normalize())
    }

    pub fn not(self) -> Option<Fraction> {
        if self.denom == 0 || self.num != 0 {
            return None;
        }
        Some(Fraction::whole((self.whole == 0) as i32))
    }

    pub fn positive(self) -> Option<Fraction> {
        if self.denom == 0 {
            return None;
        }
        Some(self)
    }

    pub fn add(self, f: Fraction) -> Option<Fraction> {
        if self.denom == 0 || f.denom == 0 {
            return None;
        }
        Some(
            Fraction::new(
                self.whole + f.whole,
                self.num * f.denom + f.num * self.denom,
                self.denom * f.denom,
            )
            .normalize(),
        )
    }

    pub fn subtract(self, f: Fraction) -> Option<Fraction> {
        if self.denom == 0 || f.denom == 0 {
            return None;
        }
        Some(
            Fraction::new(
                self.whole - f.whole,
                self.num * f.denom - f.num * self.denom,
                self.denom * f.denom,
            )
            .normalize(),
        )
    }

    pub fn multiply(self, f: Fraction) -> Option<Fraction> {
        if self.denom == 0 || f.denom == 0 {
            return None;
        }
        let imp0 = self.whole * self.denom + self.num;
        let imp1 = f.whole * f.denom + f.num;
        Some(Fraction::new(0, imp0 * imp1, self.denom * f.denom).normalize())
    }

    pub fn divide(self, f: Fraction) -> Option<Fraction> {
        if self.denom == 0 || f.denom == 0 {
            return None;
        }
        let imp0 = self.whole * self.denom + self.num;
        let imp1 = f.whole * f.denom + f.num;
        if imp1 == 0 {
            return None;
        }
        Some(Fraction::new(0, imp0 * f.denom, self.denom * imp1).normalize())
    }

    pub fn remainder(self, f: Fraction) -> Option<Fraction> {
        if self.denom == 0 || f.denom == 0 {
            return None;
        }
        // remainder only makes sense on whole numbers
        if self.num != 0 || f.num != 0 || f.whole == 0 {
            return None;
        }
        Some(Fraction::whole(self.whole % f.whole))
    }

    fn boolean_pair(self, f: Fraction) -> Option<(i32, i32)> {
        if self.denom == 0 || f.denom == 0 {
            return None;
        }
        // boolean operations only make sense on whole numbers
        if self.num != 0 || f.num != 0 {
            return None;
        }
        Some((self.whole, f.whole))
    }

    pub fn or(self, f: Fraction) -> Option<Fraction> {
        self.boolean_pair(f).map(|(a, b)| Fraction::whole(a | b))
    }

    pub fn and(self, f: Fraction) -> Option<Fraction> {
        self.boolean_pair(f).map(|(a, b)| Fraction::whole(a & b))
    }

    pub fn xor(self, f: Fraction) -> Option<Fraction> {
        self.boolean_pair(f).map(|(a, b)| Fraction::whole(a ^ b))
    }

    pub fn compare(self, f: Fraction) -> Option<i32> {
        if self.denom == 0 || f.denom == 0 {
            // magic fractions are only unordered-comparable
            return if self.denom == 0 && f.denom == 0 {
                Some(if self == f { 0 } else { UNORDERED })
            } else {
                Some(UNORDERED)
            };
        }
        let imp0 = (self.whole * self.denom + self.num) * f.denom;
        let imp1 = (f.whole * f.denom + f.num) * self.denom;
        Some((imp0 - imp1).signum())
    }

    pub fn equals_value(self, f: Fraction) -> bool {
        self.compare(f) == Some(0)
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_until_home() {
            return write!(f, "$until_home");
        }
        if self.num == 0 && self.denom != 0 {
            return write!(f, "{}", self.whole);
        }
        if self.whole != 0 {
            write!(f, "{} and ", self.whole)?;
        }
        write!(f, "{}/{}", self.num, self.denom)
    }
}

/// Built-in non-terminals recognized inside productions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonTerminal {
    RightLeft,
    PartnerCorner,
    Anyone,
    Anything,
    Anycall,
    Anydirection,
    Integer,
    Fraction,
    CoupleNumber,
    Ordinal,
    Primitive,
    DancerName,
}

impl NonTerminal {
    pub fn name(self) -> &'static str {
        match self {
            NonTerminal::RightLeft => "r_l",
            NonTerminal::PartnerCorner => "p_c",
            NonTerminal::Anyone => "anyone",
            NonTerminal::Anything => "anything",
            NonTerminal::Anycall => "anycall",
            NonTerminal::Anydirection => "anydirection",
            NonTerminal::Integer => "integer",
            NonTerminal::Fraction => "fraction",
            NonTerminal::CoupleNumber => "couple_number",
            NonTerminal::Ordinal => "ordinal",
            NonTerminal::Primitive => "$primitive",
            NonTerminal::DancerName => "$dancer_name",
        }
    }
}

/// Reference to a definition somewhere in the grammar chain:
/// `depth` hops through backup grammars, then `index` into that
/// grammar's definition list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefinitionRef {
    pub depth: u8,
    pub index: u32,
}

/// A call instance: a reference to a Definition or a Primitive plus its
/// argument terms. Exactly one of `definition`/`primitive` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTerm {
    pub definition: Option<DefinitionRef>,
    pub primitive: Option<Primitive>,
    pub args: Vec<TermId>,
    /// True when parsed from definition text (operators and `$n`
    /// variables permitted), false for user-entered call phrases.
    pub in_definition: bool,
}

impl CallTerm {
    pub fn of_definition(def: DefinitionRef, in_definition: bool) -> CallTerm {
        CallTerm {
            definition: Some(def),
            primitive: None,
            args: Vec::new(),
            in_definition,
        }
    }

    pub fn of_primitive(primitive: Primitive) -> CallTerm {
        CallTerm {
            definition: None,
            primitive: Some(primitive),
            args: Vec::new(),
            in_definition: true,
        }
    }
}

/// A designator expression term with the level it requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyoneTerm {
    pub set: Anyone,
    pub level: Level,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Call(CallTerm),
    Anyone(AnyoneTerm),
    Integer(i32),
    Fraction(Fraction),
    Word(String),
    Direction(Direction),
    Pivot(Pivot),
    BuiltIn(NonTerminal),
    Primitive(Primitive),
    DancerName(u8),
    Group(GroupId),
}

impl Term {
    /// The spelling used for dictionary lookup and partial-match
    /// suggestion; empty for terms that are never typed literally.
    pub fn spelling(&self) -> &str {
        match self {
            Term::Word(w) => w,
            Term::Direction(d) => d.name(),
            Term::Pivot(p) => p.name(),
            Term::BuiltIn(b) => b.name(),
            Term::Primitive(p) => p.name(),
            Term::Anyone(a) => a.set.leaf_name(),
            _ => "",
        }
    }

    /// Trie ordering: literals first, then integer and fraction
    /// non-terminals, then the recursive non-terminals, so the most
    /// specific edges are tried before recursion.
    pub fn sort_index(&self) -> i32 {
        match self {
            Term::BuiltIn(NonTerminal::Integer) => 0,
            Term::BuiltIn(NonTerminal::Fraction) => 1,
            Term::BuiltIn(_) => 2,
            _ => -1,
        }
    }
}

/// Read access across the two term spaces, mutation into the stage.
pub struct TermCx<'a> {
    pub grammar_terms: &'a TermStore,
    pub stage_terms: &'a mut TermStore,
}

impl<'a> TermCx<'a> {
    pub fn get(&self, id: TermId) -> &Term {
        if id.is_grammar_space() {
            self.grammar_terms.get(id)
        } else {
            self.stage_terms.get(id)
        }
    }

    pub fn alloc(&mut self, term: Term) -> TermId {
        self.stage_terms.alloc(term)
    }

    fn fraction_of(&self, id: TermId) -> Option<Fraction> {
        match self.get(id) {
            Term::Fraction(f) => Some(*f),
            _ => None,
        }
    }

    pub fn unary_op(&mut self, op: UnaryOp, id: TermId) -> Option<TermId> {
        match self.get(id).clone() {
            Term::Fraction(f) => {
                let r = match op {
                    UnaryOp::Negate => f.negate(),
                    UnaryOp::Not => f.not(),
                    UnaryOp::Positive => f.positive(),
                }?;
                Some(self.alloc(Term::Fraction(r)))
            }
            Term::Anyone(a) => match op {
                UnaryOp::Not => Some(self.alloc(Term::Anyone(AnyoneTerm {
                    set: Anyone::Not(Box::new(a.set)),
                    level: a.level,
                }))),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn binary_op(&mut self, op: BinaryOp, left: TermId, right: TermId) -> Option<TermId> {
        match (self.get(left).clone(), self.get(right).clone()) {
            (Term::Fraction(a), Term::Fraction(b)) => {
                let r = match op {
                    BinaryOp::Add => a.add(b),
                    BinaryOp::Subtract => a.subtract(b),
                    BinaryOp::Multiply => a.multiply(b),
                    BinaryOp::Divide => a.divide(b),
                    BinaryOp::Remainder => a.remainder(b),
                    BinaryOp::And => a.and(b),
                    BinaryOp::Or => a.or(b),
                    BinaryOp::Xor => a.xor(b),
                }?;
                Some(self.alloc(Term::Fraction(r)))
            }
            (Term::Anyone(a), Term::Anyone(b)) => {
                let level = a.level.max(b.level);
                let set = match op {
                    BinaryOp::And => Anyone::And(Box::new(a.set), Box::new(b.set)),
                    BinaryOp::Or => Anyone::Or(Box::new(a.set), Box::new(b.set)),
                    BinaryOp::Xor => Anyone::Xor(Box::new(a.set), Box::new(b.set)),
                    _ => return None,
                };
                Some(self.alloc(Term::Anyone(AnyoneTerm { set, level })))
            }
            _ => None,
        }
    }

    /// Three-way comparison; `UNORDERED` for same-kind terms with no
    /// ordering, None when the kinds are incomparable.
    pub fn compare(&self, left: TermId, right: TermId) -> Option<i32> {
        if left == right {
            return Some(0);
        }
        match (self.get(left), self.get(right)) {
            (Term::Integer(a), Term::Integer(b)) => Some((a - b).signum()),
            (Term::Integer(a), Term::Fraction(f)) => {
                if f.is_magic() {
                    None
                } else {
                    Fraction::whole(*a).compare(*f)
                }
            }
            (Term::Fraction(f), Term::Integer(b)) => {
                if f.is_magic() {
                    None
                } else {
                    f.compare(Fraction::whole(*b))
                }
            }
            (Term::Fraction(a), Term::Fraction(b)) => a.compare(*b),
            (a, b) => {
                if std::mem::discriminant(a) == std::mem::discriminant(b) {
                    Some(UNORDERED)
                } else {
                    None
                }
            }
        }
    }

    /// `$n` argument substitution inside expressions: integers widen to
    /// fractions so arithmetic composes.
    pub fn widen_argument(&mut self, id: TermId) -> TermId {
        if let Term::Integer(v) = self.get(id) {
            let f = Fraction::whole(*v);
            self.alloc(Term::Fraction(f))
        } else {
            id
        }
    }

    pub fn fraction(&self, id: TermId) -> Option<Fraction> {
        self.fraction_of(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    Positive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    And,
    Or,
    Xor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let cases = [
            Fraction::new(0, 7, 4),
            Fraction::new(2, -1, 4),
            Fraction::new(0, -9, -4),
            Fraction::new(1, 4, 4),
        ];
        for f in cases {
            let once = f.normalize();
            assert_eq!(once.normalize(), once, "normalize not idempotent for {:?}", f);
            assert!(once.denom > 0);
            assert!(once.num >= 0 && once.num < once.denom);
        }
    }

    #[test]
    fn normalize_carries_improper_numerator_into_whole() {
        let f = Fraction::new(0, 7, 4).normalize();
        assert_eq!((f.whole, f.num, f.denom), (1, 3, 4));
    }

    #[test]
    fn normalize_borrows_for_negative_numerator() {
        let f = Fraction::new(2, -1, 4).normalize();
        assert_eq!((f.whole, f.num, f.denom), (1, 3, 4));
    }

    #[test]
    fn add_uses_common_denominator() {
        let a = Fraction::new(0, 1, 2);
        let b = Fraction::new(0, 2, 3);
        let c = a.add(b).unwrap();
        assert!(c.equals_value(Fraction::new(1, 1, 6)));
    }

    #[test]
    fn magic_fraction_refuses_arithmetic() {
        let home = Fraction::until_home();
        assert!(home.add(Fraction::whole(1)).is_none());
        assert!(home.negate().is_none());
        assert!(home.improper_numerator(4, None).is_none());
    }

    #[test]
    fn improper_numerator_scales() {
        let f = Fraction::new(1, 1, 2);
        assert_eq!(f.improper_numerator(2, None), Some(3));
        assert_eq!(f.improper_numerator(4, None), Some(6));
        assert_eq!(Fraction::new(0, 1, 3).improper_numerator(2, None), None);
    }

    #[test]
    fn improper_numerator_applies_multiplier() {
        // 2 of a call, fractionalized by 1/2: one whole invocation
        let f = Fraction::whole(2);
        let half = Fraction::new(0, 1, 2);
        assert_eq!(f.improper_numerator(1, Some(&half)), Some(1));
    }

    #[test]
    fn remainder_and_booleans_require_whole_numbers() {
        let five = Fraction::whole(5);
        let three = Fraction::whole(3);
        assert_eq!(five.remainder(three).unwrap().whole, 2);
        assert_eq!(five.and(three).unwrap().whole, 1);
        assert_eq!(five.or(three).unwrap().whole, 7);
        assert_eq!(five.xor(three).unwrap().whole, 6);
        let half = Fraction::new(0, 1, 2);
        assert!(five.remainder(half).is_none());
        assert!(half.and(three).is_none());
    }

    #[test]
    fn compare_cross_multiplies() {
        let a = Fraction::new(0, 1, 2);
        let b = Fraction::new(0, 2, 3);
        assert_eq!(a.compare(b), Some(-1));
        assert_eq!(b.compare(a), Some(1));
        assert_eq!(a.compare(Fraction::new(0, 2, 4)), Some(0));
    }

    #[test]
    fn until_home_displays_by_name() {
        assert_eq!(Fraction::until_home().to_string(), "$until_home");
        assert_eq!(Fraction::new(1, 1, 2).to_string(), "1 and 1/2");
        assert_eq!(Fraction::whole(3).to_string(), "3");
    }

    #[test]
    fn sort_index_orders_literals_before_nonterminals() {
        assert_eq!(Term::Word("swing".into()).sort_index(), -1);
        assert_eq!(Term::BuiltIn(NonTerminal::Integer).sort_index(), 0);
        assert_eq!(Term::BuiltIn(NonTerminal::Fraction).sort_index(), 1);
        assert_eq!(Term::BuiltIn(NonTerminal::Anything).sort_index(), 2);
    }

    #[test]
    fn direction_and_pivot_names_round_trip() {
        for (name, d) in DIRECTION_NAMES {
            assert_eq!(d.name(), name);
        }
        for (name, p) in PIVOT_NAMES {
            assert_eq!(p.name(), name);
        }
    }
}
