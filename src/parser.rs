//! Grammar compilation and call parsing.
//!
//! Productions compile into a trie of parse states per start symbol.
//! Each state either tests a term against the input (match/miss edges)
//! or reduces: pops consumed non-terminals and builds a call or
//! designator value. The driver is a single-threaded backtracking
//! machine over explicit stacks; reductions are undone on backtrack by
//! re-expanding the reduced term's children.

use crate::anyone::Anyone;
use crate::dancer::DancerMask;
use crate::grammar::{DesignatorRef, Grammar};
use crate::lexer::{Token, TokenKind};
use crate::stage::{Context, GroupId, TermId};
use crate::term::{
    AnyoneTerm, BinaryOp, CallTerm, DefinitionRef, Direction, Fraction, NonTerminal, Term, TermCx, UnaryOp,
    UNORDERED,
};

pub const NULL_STATE: i32 = -1;
pub const REDUCE_TOS: i32 = -1;

/// Divergent grammars abort after this many nested reductions.
const MAX_REDUCE_DEPTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSymbol {
    Anyone,
    Anything,
    Anycall,
}

impl StartSymbol {
    pub fn index(self) -> usize {
        self as usize
    }

    fn non_terminal(self) -> NonTerminal {
        match self {
            StartSymbol::Anyone => NonTerminal::Anyone,
            StartSymbol::Anything => NonTerminal::Anything,
            StartSymbol::Anycall => NonTerminal::Anycall,
        }
    }

    fn of_non_terminal(nt: NonTerminal) -> Option<StartSymbol> {
        match nt {
            NonTerminal::Anyone => Some(StartSymbol::Anyone),
            NonTerminal::Anything => Some(StartSymbol::Anything),
            NonTerminal::Anycall => Some(StartSymbol::Anycall),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseState {
    /// None marks a reduce state.
    pub term: Option<TermId>,
    /// For a match state: where to go on a hit. For a reduce state:
    /// how many non-terminals the reduction consumes.
    pub match_state: i32,
    /// For a match state: the next alternative edge. For a reduce
    /// state: the reduction index, or REDUCE_TOS.
    pub miss_state: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meaning {
    Definition(DefinitionRef),
    Designator(DesignatorRef),
}

#[derive(Debug, Clone)]
pub struct Reduction {
    pub symbol: StartSymbol,
    pub meaning: Option<Meaning>,
    pub production: String,
    pub definitions_only: bool,
}

#[derive(Debug)]
pub struct Machine {
    pub states: Vec<ParseState>,
    pub initial: [i32; 3],
    pub suffixes: [i32; 3],
    pub reductions: Vec<Reduction>,
    pub compiled: bool,
}

impl Default for Machine {
    fn default() -> Machine {
        Machine {
            states: Vec::new(),
            initial: [NULL_STATE; 3],
            suffixes: [NULL_STATE; 3],
            reductions: Vec::new(),
            compiled: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

pub fn compile_state_machines(grammar: &mut Grammar) {
    grammar.machine = Machine::default();
    include_production(grammar, StartSymbol::Anycall, "anything", None);
    include_production(grammar, StartSymbol::Anything, "$primitive", None);
    include_production(grammar, StartSymbol::Anyone, "$dancer_name", None);

    // deepest backup first, so the last loaded grammar wins conflicts
    let mut depth_count = 0u8;
    {
        let mut g = Some(&*grammar);
        while let Some(gr) = g {
            depth_count += 1;
            g = gr.backup();
        }
    }
    for depth in (0..depth_count).rev() {
        let productions: Vec<(String, Meaning)> = {
            let g = grammar.grammar_at_depth(depth);
            let mut list = Vec::new();
            for (index, def) in g.definitions().iter().enumerate() {
                for p in &def.productions {
                    list.push((
                        p.clone(),
                        Meaning::Definition(DefinitionRef {
                            depth,
                            index: index as u32,
                        }),
                    ));
                }
            }
            for (index, des) in g.designators().iter().enumerate() {
                for p in &des.phrases {
                    list.push((
                        p.clone(),
                        Meaning::Designator(DesignatorRef {
                            depth,
                            index: index as u32,
                        }),
                    ));
                }
            }
            list
        };
        for (production, meaning) in productions {
            let symbol = match meaning {
                Meaning::Definition(_) => StartSymbol::Anything,
                Meaning::Designator(_) => StartSymbol::Anyone,
            };
            include_production(grammar, symbol, &production, Some(meaning));
        }
    }
    grammar.machine.compiled = true;
}

fn meaning_depth(meaning: &Meaning) -> u8 {
    match meaning {
        Meaning::Definition(d) => d.depth,
        Meaning::Designator(d) => d.depth,
    }
}

fn include_production(grammar: &mut Grammar, symbol: StartSymbol, production: &str, meaning: Option<Meaning>) {
    let tokens = match grammar.tokenize_production(production) {
        Some(t) => t,
        None => {
            log::warn!("could not tokenize '{}'", production);
            return;
        }
    };
    if tokens.is_empty() {
        return;
    }
    let mut symbol = symbol;
    let mut definitions_only = production.starts_with('$');
    // productions ending in the anycall non-terminal start that symbol
    if symbol == StartSymbol::Anything {
        if let Some(last) = tokens.last() {
            if last.kind == TokenKind::Word {
                if let Some(id) = last.term {
                    if matches!(grammar.terms().get(id), Term::BuiltIn(NonTerminal::Anycall)) {
                        symbol = StartSymbol::Anycall;
                    }
                }
            }
        }
    }
    let reduce_state = match build_production_tables(grammar, symbol, &tokens, production, &mut definitions_only) {
        Some(s) => s,
        None => return,
    };
    let miss = grammar.machine.states[reduce_state].miss_state;
    if (miss as usize) < grammar.machine.reductions.len() {
        let r = &mut grammar.machine.reductions[miss as usize];
        let type_ok = match symbol {
            StartSymbol::Anyone => r.symbol == StartSymbol::Anyone,
            _ => r.symbol != StartSymbol::Anyone,
        };
        if !type_ok {
            log::warn!("confusion of anyone and anything reductions: '{}'", production);
            return;
        }
        // an existing reduction from the same grammar is a duplicate;
        // from a backup grammar, the later (local) definition wins
        if let (Some(old), Some(new)) = (&r.meaning, &meaning) {
            if meaning_depth(old) == meaning_depth(new) {
                log::warn!("duplicate production '{}'", production);
            }
        }
        r.meaning = meaning;
    } else {
        grammar.machine.reductions.push(Reduction {
            symbol,
            meaning,
            production: production.to_string(),
            definitions_only,
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum Link {
    Initial(usize),
    Suffix(usize),
    Match(usize),
    Miss(usize),
}

fn get_link(machine: &Machine, link: Link) -> i32 {
    match link {
        Link::Initial(i) => machine.initial[i],
        Link::Suffix(i) => machine.suffixes[i],
        Link::Match(s) => machine.states[s].match_state,
        Link::Miss(s) => machine.states[s].miss_state,
    }
}

fn set_link(machine: &mut Machine, link: Link, value: i32) {
    match link {
        Link::Initial(i) => machine.initial[i] = value,
        Link::Suffix(i) => machine.suffixes[i] = value,
        Link::Match(s) => machine.states[s].match_state = value,
        Link::Miss(s) => machine.states[s].miss_state = value,
    }
}

fn trie_terms_equal(a: &Term, b: &Term) -> bool {
    match (a, b) {
        (Term::Integer(x), Term::Integer(y)) => x == y,
        (Term::Fraction(x), Term::Fraction(y)) => x == y,
        (Term::Word(x), Term::Word(y)) => x == y,
        _ => a == b,
    }
}

/// Extend the trie with one production's tokens. Returns the index of
/// the production's reduce state.
fn build_production_tables(
    grammar: &mut Grammar,
    symbol: StartSymbol,
    tokens: &[Token],
    production: &str,
    definitions_only: &mut bool,
) -> Option<usize> {
    let mut previous = Link::Initial(symbol.index());
    let mut non_terminal_count: i32 = 0;
    let mut start = 0;

    let is_own_symbol = |grammar: &Grammar, t: &Token| -> bool {
        t.kind == TokenKind::Word
            && t.term
                .map(|id| matches!(grammar.terms().get(id), Term::BuiltIn(nt) if *nt == symbol.non_terminal()))
                .unwrap_or(false)
    };

    if is_own_symbol(grammar, &tokens[0]) {
        // P ::= P alone is a trivial reduction
        if tokens.len() == 1 {
            return None;
        }
        // left recursion extends the suffix trie
        previous = Link::Suffix(symbol.index());
        if grammar.machine.suffixes[symbol.index()] == NULL_STATE {
            grammar.machine.states.push(ParseState {
                term: None,
                match_state: 1,
                miss_state: REDUCE_TOS,
            });
            let s = (grammar.machine.states.len() - 1) as i32;
            grammar.machine.suffixes[symbol.index()] = s;
        }
        start = 1;
        non_terminal_count = 1;
    }

    for token in &tokens[start..] {
        let term_id = match token.kind {
            TokenKind::Integer => grammar.alloc_term(Term::Integer(token.value)),
            TokenKind::Fraction => grammar.alloc_term(Term::Fraction(token.frac.unwrap_or(Fraction::whole(0)))),
            TokenKind::Word => {
                let id = match token.term {
                    Some(id) => id,
                    None => return None,
                };
                match grammar.terms().get(id) {
                    Term::BuiltIn(_) => non_terminal_count += 1,
                    _ => {
                        if token
                            .text
                            .chars()
                            .any(|c| !crate::lexer::valid_word_content(c, false))
                        {
                            *definitions_only = true;
                        }
                    }
                }
                id
            }
            TokenKind::Comma => continue,
            _ => {
                log::warn!("could not process '{}': unexpected token {:?}", production, token.kind);
                return None;
            }
        };

        let new_sort = grammar.terms().get(term_id).sort_index();
        let reuse;
        loop {
            let j = get_link(&grammar.machine, previous);
            if j == NULL_STATE
                || grammar.machine.states[j as usize].term.is_none()
                || grammar
                    .machine
                    .states[j as usize]
                    .term
                    .map(|t| grammar.terms().get(t).sort_index() > new_sort)
                    .unwrap_or(false)
            {
                let new_state = grammar.machine.states.len() as i32;
                grammar.machine.states.push(ParseState {
                    term: Some(term_id),
                    match_state: NULL_STATE,
                    miss_state: j,
                });
                set_link(&mut grammar.machine, previous, new_state);
                reuse = new_state as usize;
                break;
            }
            let existing = grammar.machine.states[j as usize].term.unwrap();
            if trie_terms_equal(grammar.terms().get(existing), grammar.terms().get(term_id)) {
                reuse = j as usize;
                break;
            }
            previous = Link::Miss(j as usize);
        }
        previous = Link::Match(reuse);
    }

    // walk to the end of the final miss chain; an existing reduce state
    // there means this production already has a reduction
    loop {
        let j = get_link(&grammar.machine, previous);
        if j == NULL_STATE {
            break;
        }
        if grammar.machine.states[j as usize].term.is_none() {
            return Some(j as usize);
        }
        previous = Link::Miss(j as usize);
    }
    let new_state = grammar.machine.states.len();
    grammar.machine.states.push(ParseState {
        term: None,
        match_state: non_terminal_count,
        miss_state: grammar.machine.reductions.len() as i32,
    });
    set_link(&mut grammar.machine, previous, new_state as i32);
    Some(new_state)
}

// ---------------------------------------------------------------------------
// Expression parsing
// ---------------------------------------------------------------------------

fn precedence(kind: TokenKind) -> i32 {
    match kind {
        TokenKind::Slash | TokenKind::Asterisk | TokenKind::Remainder => 5,
        TokenKind::Dash | TokenKind::Plus => 4,
        TokenKind::NotEq | TokenKind::EqEq => 3,
        TokenKind::Gtr | TokenKind::GtrEq | TokenKind::Lss | TokenKind::LssEq => 2,
        TokenKind::Or | TokenKind::And | TokenKind::Xor => 1,
        TokenKind::RParen | TokenKind::Comma | TokenKind::Eq | TokenKind::EndOfString => 0,
        _ => -1,
    }
}

pub struct ExprParser<'t> {
    tokens: &'t [Token],
    at: usize,
    token: Token,
}

impl<'t> ExprParser<'t> {
    pub fn new(tokens: &'t [Token], start_at: usize) -> ExprParser<'t> {
        ExprParser {
            tokens,
            at: start_at,
            token: Token::end_of_string(),
        }
    }

    fn scan(&mut self) {
        self.token = self
            .tokens
            .get(self.at)
            .cloned()
            .unwrap_or_else(Token::end_of_string);
        self.at += 1;
    }

    /// Index of the current lookahead token.
    pub fn lookahead_index(&self) -> usize {
        self.at.saturating_sub(1)
    }

    /// Parse a complete expression: everything must be consumed.
    pub fn parse_full(&mut self, cx: &mut TermCx) -> Option<TermId> {
        let t = self.parse_expression(0, cx)?;
        if self.token.kind == TokenKind::EndOfString {
            Some(t)
        } else {
            None
        }
    }

    /// Parse a leading expression, leaving the rest as lookahead.
    pub fn parse_prefix(&mut self, cx: &mut TermCx) -> Option<TermId> {
        self.parse_expression(0, cx)
    }

    fn parse_expression(&mut self, old_precedence: i32, cx: &mut TermCx) -> Option<TermId> {
        let mut x = self.parse_term(cx)?;
        self.scan();
        loop {
            let op = self.token.kind;
            let prec = precedence(op);
            if prec < 0 {
                return None;
            }
            if prec <= old_precedence {
                return Some(x);
            }
            let y = self.parse_expression(prec, cx)?;
            x = match op {
                TokenKind::Dash => cx.binary_op(BinaryOp::Subtract, x, y)?,
                TokenKind::Plus => cx.binary_op(BinaryOp::Add, x, y)?,
                TokenKind::Asterisk => cx.binary_op(BinaryOp::Multiply, x, y)?,
                TokenKind::Slash => cx.binary_op(BinaryOp::Divide, x, y)?,
                TokenKind::Remainder => cx.binary_op(BinaryOp::Remainder, x, y)?,
                TokenKind::And => cx.binary_op(BinaryOp::And, x, y)?,
                TokenKind::Or => cx.binary_op(BinaryOp::Or, x, y)?,
                TokenKind::Xor => cx.binary_op(BinaryOp::Xor, x, y)?,
                TokenKind::EqEq => {
                    let c = cx.compare(x, y)?;
                    cx.alloc(Term::Integer((c == 0) as i32))
                }
                TokenKind::NotEq => {
                    let c = cx.compare(x, y)?;
                    cx.alloc(Term::Integer((c != 0) as i32))
                }
                TokenKind::Gtr => {
                    let c = cx.compare(x, y)?;
                    if c == UNORDERED {
                        return None;
                    }
                    cx.alloc(Term::Integer((c > 0) as i32))
                }
                TokenKind::GtrEq => {
                    let c = cx.compare(x, y)?;
                    if c == UNORDERED {
                        return None;
                    }
                    cx.alloc(Term::Integer((c >= 0) as i32))
                }
                TokenKind::Lss => {
                    let c = cx.compare(x, y)?;
                    if c == UNORDERED {
                        return None;
                    }
                    cx.alloc(Term::Integer((c < 0) as i32))
                }
                TokenKind::LssEq => {
                    let c = cx.compare(x, y)?;
                    if c == UNORDERED {
                        return None;
                    }
                    cx.alloc(Term::Integer((c <= 0) as i32))
                }
                _ => return None,
            };
        }
    }

    fn parse_term(&mut self, cx: &mut TermCx) -> Option<TermId> {
        self.scan();
        match self.token.kind {
            TokenKind::Dash => {
                let x = self.parse_term(cx)?;
                cx.unary_op(UnaryOp::Negate, x)
            }
            TokenKind::Not => {
                let x = self.parse_term(cx)?;
                cx.unary_op(UnaryOp::Not, x)
            }
            TokenKind::Plus => {
                let x = self.parse_term(cx)?;
                cx.unary_op(UnaryOp::Positive, x)
            }
            TokenKind::Integer => Some(cx.alloc(Term::Fraction(Fraction::whole(self.token.value)))),
            TokenKind::Fraction => Some(cx.alloc(Term::Fraction(self.token.frac?))),
            TokenKind::LParen => {
                let x = self.parse_expression(0, cx)?;
                if self.token.kind == TokenKind::RParen {
                    Some(x)
                } else {
                    None
                }
            }
            TokenKind::Word => {
                let id = self.token.term?;
                // arguments substituted from integers widen to fractions
                Some(cx.widen_argument(id))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// The non-deterministic driver
// ---------------------------------------------------------------------------

struct Alternative {
    state: i32,
    t_index: usize,
    nt_depth: usize,
    rs_depth: usize,
    rs_state: i32,
    /// For reduction alternatives: the non-terminals the reduction
    /// consumed, to restore on backtrack.
    restore: Option<Vec<TermId>>,
}

/// Poisoned token index marking a reduction alternative.
const NO_INDEX: usize = usize::MAX;

pub struct ParseOutcome {
    pub term: TermId,
    pub matched: usize,
}

pub fn state_machine(
    ctx: &mut Context,
    symbol: StartSymbol,
    in_definition: bool,
    tokens: &[Token],
    start_index: usize,
    full_match: bool,
    mut partial_states: Option<&mut Vec<usize>>,
    group: Option<GroupId>,
) -> Option<ParseOutcome> {
    let grammar: &Grammar = ctx.grammar;
    if !grammar.machine.compiled {
        log::warn!("parse attempted before state machines were compiled");
        return None;
    }
    let mut state = grammar.machine.initial[symbol.index()];
    let mut t_index = start_index;
    let mut non_terminals: Vec<TermId> = Vec::new();
    let mut reduce_state: Vec<i32> = Vec::new();
    let mut alternatives: Vec<Alternative> = Vec::new();

    loop {
        if full_match {
            while t_index < tokens.len() && tokens[t_index].kind == TokenKind::Comma {
                t_index += 1;
            }
        }
        while state == NULL_STATE {
            let alt = alternatives.pop()?;
            state = alt.state;
            t_index = alt.t_index;
            if alt.rs_depth > reduce_state.len() {
                reduce_state.push(alt.rs_state);
            } else {
                reduce_state.truncate(alt.rs_depth);
            }
            if alt.t_index == NO_INDEX && alt.rs_depth > 0 {
                // undo a reduction: replace the product with what it consumed
                if non_terminals.is_empty() {
                    return None;
                }
                non_terminals.pop();
                match alt.restore {
                    Some(children) => non_terminals.extend(children),
                    None => return None,
                }
            } else {
                non_terminals.truncate(alt.nt_depth);
            }
            if ctx.config.verbose_parsing {
                log::debug!("backtrack to state {} at token {}", state, t_index as i64);
            }
        }
        let ps = grammar.machine.states[state as usize];
        if let Some(edge) = ps.term {
            if t_index < tokens.len() {
                state = ps.miss_state;
                let nt_depth = non_terminals.len();
                if let Term::BuiltIn(nt) = grammar.terms().get(edge) {
                    if let Some(sub) = StartSymbol::of_non_terminal(*nt) {
                        // a production that loops indefinitely would
                        // recurse forever; kill the parse
                        if reduce_state.len() > MAX_REDUCE_DEPTH {
                            return None;
                        }
                        alternatives.push(Alternative {
                            state: ps.miss_state,
                            t_index,
                            nt_depth,
                            rs_depth: reduce_state.len(),
                            rs_state: NULL_STATE,
                            restore: None,
                        });
                        state = grammar.machine.initial[sub.index()];
                        reduce_state.push(ps.match_state);
                        continue;
                    }
                }
                let result = match_edge(ctx, edge, tokens, t_index, &mut non_terminals, in_definition, group);
                if result >= 0 {
                    alternatives.push(Alternative {
                        state: ps.miss_state,
                        t_index,
                        nt_depth,
                        rs_depth: reduce_state.len(),
                        rs_state: NULL_STATE,
                        restore: None,
                    });
                    t_index += result as usize;
                    state = ps.match_state;
                }
            } else if let Some(p) = partial_states.as_mut() {
                // the full tokens reach this state; reductions past it
                // are completion candidates
                p.push(state as usize);
                state = ps.miss_state;
            } else {
                state = ps.miss_state;
            }
        } else {
            let mut consumed_for_restore: Vec<TermId> = Vec::new();
            if ps.miss_state != REDUCE_TOS {
                let reduction = grammar.machine.reductions[ps.miss_state as usize].clone();
                let consumed_count = ps.match_state as usize;
                let var_base = match non_terminals.len().checked_sub(consumed_count) {
                    Some(v) => v,
                    None => {
                        state = NULL_STATE;
                        continue;
                    }
                };
                consumed_for_restore = non_terminals[var_base..].to_vec();
                match (&reduction.symbol, &reduction.meaning) {
                    (StartSymbol::Anyone, Some(Meaning::Designator(dref))) => {
                        let designator = grammar.designator(*dref);
                        let expression = designator.expression.clone();
                        let level = designator.level;
                        let anyone = parse_designator_expression(ctx, &expression, &consumed_for_restore, level)?;
                        non_terminals.truncate(var_base);
                        non_terminals.push(anyone);
                    }
                    (_, Some(Meaning::Definition(dref))) => {
                        let mut call = CallTerm::of_definition(*dref, in_definition);
                        call.args = consumed_for_restore.clone();
                        let id = ctx.stage.terms.alloc(Term::Call(call));
                        non_terminals.truncate(var_base);
                        non_terminals.push(id);
                    }
                    (_, None) => {}
                    _ => return None,
                }
                if grammar.machine.suffixes[reduction.symbol.index()] != NULL_STATE {
                    state = grammar.machine.suffixes[reduction.symbol.index()];
                    continue;
                }
            }
            let rs_len = reduce_state.len();
            if rs_len == 0 {
                if !full_match || t_index >= tokens.len() {
                    let term = non_terminals.pop()?;
                    return Some(ParseOutcome {
                        term,
                        matched: t_index.saturating_sub(start_index),
                    });
                }
                reduce_state.push(NULL_STATE);
            }
            let target = reduce_state.pop().unwrap_or(NULL_STATE);
            alternatives.push(Alternative {
                state: NULL_STATE,
                t_index: NO_INDEX,
                nt_depth: non_terminals.len(),
                rs_depth: rs_len,
                rs_state: target,
                restore: Some(consumed_for_restore),
            });
            state = target;
        }
    }
}

/// Match one trie edge against the input. Returns tokens consumed, or
/// -1 on a miss. Matched non-terminal values are pushed.
fn match_edge(
    ctx: &mut Context,
    edge: TermId,
    tokens: &[Token],
    t: usize,
    non_terminals: &mut Vec<TermId>,
    in_definition: bool,
    group: Option<GroupId>,
) -> i32 {
    let grammar: &Grammar = ctx.grammar;
    let token = &tokens[t];
    match grammar.terms().get(edge) {
        Term::BuiltIn(nt) => match nt {
            NonTerminal::RightLeft => {
                if token.kind == TokenKind::Word {
                    if let Some(id) = token.term {
                        if let Term::Direction(d) = ctx.term(id) {
                            if matches!(d, Direction::Left | Direction::Right) {
                                non_terminals.push(id);
                                return 1;
                            }
                        }
                    }
                }
                -1
            }
            NonTerminal::PartnerCorner => {
                if token.kind == TokenKind::Word {
                    if let Some(id) = token.term {
                        if let Term::Direction(d) = ctx.term(id) {
                            if matches!(d, Direction::Partner | Direction::Corner) {
                                non_terminals.push(id);
                                return 1;
                            }
                        }
                    }
                }
                -1
            }
            NonTerminal::Anydirection => {
                if token.kind == TokenKind::Word {
                    if let Some(id) = token.term {
                        if matches!(ctx.term(id), Term::Direction(_)) {
                            non_terminals.push(id);
                            return 1;
                        }
                    }
                }
                -1
            }
            NonTerminal::Anyone | NonTerminal::Anything | NonTerminal::Anycall => -1,
            NonTerminal::DancerName => {
                if token.kind == TokenKind::Word {
                    if let Some(id) = token.term {
                        if matches!(ctx.term(id), Term::Anyone(_)) {
                            non_terminals.push(id);
                            return 1;
                        }
                    }
                }
                if token.kind == TokenKind::DancerName {
                    if let Some(gid) = group {
                        let position = token.value as usize;
                        let g = ctx.stage.group(gid);
                        if position < g.dancer_count() {
                            let mask: DancerMask = g.dancer(position).bit();
                            let id = ctx.stage.terms.alloc(Term::Anyone(AnyoneTerm {
                                set: Anyone::Mask(mask),
                                level: crate::config::NO_LEVEL,
                            }));
                            non_terminals.push(id);
                            return 1;
                        }
                    }
                }
                -1
            }
            NonTerminal::Primitive => match match_primitive(ctx, tokens, t, in_definition, group) {
                Some((call, consumed)) => {
                    non_terminals.push(call);
                    consumed
                }
                None => -1,
            },
            NonTerminal::Integer => {
                if token.kind == TokenKind::Integer {
                    let id = ctx.stage.terms.alloc(Term::Integer(token.value));
                    non_terminals.push(id);
                    return 1;
                }
                if token.kind == TokenKind::LParen {
                    let mut parser = ExprParser::new(tokens, t + 1);
                    let mut cx = ctx.term_cx();
                    let term = match parser.parse_prefix(&mut cx) {
                        Some(x) => x,
                        None => return -1,
                    };
                    let i = parser.lookahead_index();
                    if i >= tokens.len() || tokens[i].kind != TokenKind::RParen {
                        return -1;
                    }
                    if let Term::Fraction(f) = ctx.term(term) {
                        if let Some(value) = f.improper_numerator(1, None) {
                            let id = ctx.stage.terms.alloc(Term::Integer(value));
                            non_terminals.push(id);
                            return (i + 1 - t) as i32;
                        }
                    }
                    return -1;
                }
                -1
            }
            NonTerminal::Fraction => match_fraction_non_terminal(ctx, tokens, t, non_terminals),
            NonTerminal::CoupleNumber | NonTerminal::Ordinal => -1,
        },
        Term::Integer(v) => {
            if token.kind == TokenKind::Integer && token.value == *v {
                1
            } else {
                -1
            }
        }
        Term::Fraction(f) => match_fraction_literal(*f, tokens, t, grammar),
        Term::Word(w) => {
            if token.kind == TokenKind::Word
                && (token.term == Some(edge) || (token.term.is_none() && token.text == *w))
            {
                1
            } else {
                -1
            }
        }
        _ => {
            if token.kind == TokenKind::Word && token.term == Some(edge) {
                1
            } else {
                -1
            }
        }
    }
}

fn match_fraction_non_terminal(
    ctx: &mut Context,
    tokens: &[Token],
    t: usize,
    non_terminals: &mut Vec<TermId>,
) -> i32 {
    let token = &tokens[t];
    if token.kind == TokenKind::Fraction {
        if let Some(f) = token.frac {
            let id = ctx.stage.terms.alloc(Term::Fraction(f));
            non_terminals.push(id);
            return 1;
        }
        return -1;
    }
    if token.kind == TokenKind::LParen {
        let mut parser = ExprParser::new(tokens, t + 1);
        let mut cx = ctx.term_cx();
        let term = match parser.parse_prefix(&mut cx) {
            Some(x) => x,
            None => return -1,
        };
        let i = parser.lookahead_index();
        if i >= tokens.len() || tokens[i].kind != TokenKind::RParen {
            return -1;
        }
        if matches!(ctx.term(term), Term::Fraction(_)) {
            non_terminals.push(term);
            return (i + 1 - t) as i32;
        }
        return -1;
    }
    // bare integers also satisfy a fraction non-terminal
    if token.kind == TokenKind::Integer {
        let id = ctx.stage.terms.alloc(Term::Fraction(Fraction::whole(token.value)));
        non_terminals.push(id);
        return 1;
    }
    -1
}

fn match_fraction_literal(f: Fraction, tokens: &[Token], t: usize, _grammar: &Grammar) -> i32 {
    let token = &tokens[t];
    if token.kind == TokenKind::Fraction {
        let tf = match token.frac {
            Some(tf) => tf,
            None => return -1,
        };
        if f.is_magic() {
            return if tf == f { 1 } else { -1 };
        }
        if tf.is_magic() {
            return -1;
        }
        return if f.compare(tf) == Some(0) { 1 } else { -1 };
    }
    -1
}

fn match_primitive(
    ctx: &mut Context,
    tokens: &[Token],
    t: usize,
    _in_definition: bool,
    group: Option<GroupId>,
) -> Option<(TermId, i32)> {
    let token = &tokens[t];
    if token.kind != TokenKind::Word {
        return None;
    }
    let id = token.term?;
    match ctx.term(id).clone() {
        // an argument substituted from $n may already be a call
        Term::Call(_) => Some((id, 1)),
        Term::Primitive(p) => {
            if t + 1 >= tokens.len() || tokens[t + 1].kind != TokenKind::LParen {
                return None;
            }
            let i = t + 2;
            if i >= tokens.len() {
                return None;
            }
            let (args, m) = match_primitive_parameters(ctx, tokens, i, group)?;
            let mut call = CallTerm::of_primitive(p);
            call.args = args;
            let call_id = ctx.stage.terms.alloc(Term::Call(call));
            Some((call_id, 2 + m))
        }
        _ => None,
    }
}

/// Parse a primitive's comma-separated arguments up to the closing
/// paren. Each argument is an expression, a sub-call, or a bare word.
pub fn match_primitive_parameters(
    ctx: &mut Context,
    tokens: &[Token],
    start: usize,
    group: Option<GroupId>,
) -> Option<(Vec<TermId>, i32)> {
    let mut args = Vec::new();
    let mut i = start;
    if tokens[i].kind == TokenKind::RParen {
        return Some((args, 1));
    }
    while i < tokens.len() {
        let mut matched_arg = false;
        {
            let mut parser = ExprParser::new(tokens, i);
            let mut cx = ctx.term_cx();
            if let Some(term) = parser.parse_prefix(&mut cx) {
                if !matches!(ctx.term(term), Term::Word(_)) {
                    i = parser.lookahead_index();
                    args.push(term);
                    matched_arg = true;
                }
            }
        }
        if !matched_arg {
            let mut m = 0usize;
            let sub = match_anycall(ctx, tokens, i, false, &mut m, group);
            if let Some(call) = sub {
                if m > 0 && m <= tokens.len() - i {
                    i += m;
                    args.push(call);
                    matched_arg = true;
                }
            }
            if !matched_arg {
                match tokens[i].kind {
                    TokenKind::Word => match tokens[i].term {
                        Some(id) => args.push(id),
                        None => {
                            let id = ctx.stage.terms.alloc(Term::Word(tokens[i].text.clone()));
                            args.push(id);
                        }
                    },
                    _ => return None,
                }
                i += 1;
            }
        }
        if i >= tokens.len() {
            return None;
        }
        match tokens[i].kind {
            TokenKind::RParen => return Some((args, (i + 1 - start) as i32)),
            TokenKind::Comma => i += 1,
            _ => return None,
        }
    }
    None
}

pub fn match_anycall(
    ctx: &mut Context,
    tokens: &[Token],
    t_index: usize,
    full_match: bool,
    matched: &mut usize,
    group: Option<GroupId>,
) -> Option<TermId> {
    *matched = 0;
    let outcome = state_machine(ctx, StartSymbol::Anycall, true, tokens, t_index, full_match, None, group)?;
    *matched = outcome.matched;
    Some(outcome.term)
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse a call phrase into a call term.
pub fn parse_call(
    ctx: &mut Context,
    group: GroupId,
    text: &str,
    in_definition: bool,
    call_args: &[TermId],
    locals: &[(TermId, TermId)],
) -> Option<TermId> {
    let group_term = ctx.stage.terms.alloc(Term::Group(group));
    let grammar: &Grammar = ctx.grammar;
    let (tokens, _) = grammar.raw_tokens(
        text,
        in_definition,
        Some(&ctx.stage.terms),
        Some(call_args),
        Some(group_term),
        locals,
        false,
    )?;
    log::debug!("parse '{}' in_definition={}", text, in_definition);
    let outcome = state_machine(
        ctx,
        StartSymbol::Anycall,
        in_definition,
        &tokens,
        0,
        true,
        None,
        Some(group),
    )?;
    if outcome.matched == tokens.len() {
        Some(outcome.term)
    } else {
        None
    }
}

/// Parse a designator phrase. `word = phrase` binds a plan-local name;
/// the bound word term is returned alongside the designator.
pub fn parse_anyone(
    ctx: &mut Context,
    group: GroupId,
    text: &str,
    call_args: &[TermId],
    locals: &[(TermId, TermId)],
) -> Option<(Option<TermId>, TermId)> {
    let group_term = ctx.stage.terms.alloc(Term::Group(group));
    let grammar: &Grammar = ctx.grammar;
    let (tokens, _) = grammar.raw_tokens(
        text,
        true,
        Some(&ctx.stage.terms),
        Some(call_args),
        Some(group_term),
        locals,
        false,
    )?;
    let mut t_index = 0;
    let mut local = None;
    if tokens.len() > 2 && tokens[1].kind == TokenKind::Eq && tokens[0].kind == TokenKind::Word {
        local = tokens[0].term;
        t_index = 2;
    }
    let outcome = state_machine(
        ctx,
        StartSymbol::Anyone,
        true,
        &tokens,
        t_index,
        true,
        None,
        Some(group),
    )?;
    if outcome.matched + t_index != tokens.len() {
        return None;
    }
    if matches!(ctx.term(outcome.term), Term::Anyone(_)) {
        Some((local, outcome.term))
    } else {
        None
    }
}

/// Compile a designator's stored expression against the non-terminals
/// its phrase consumed.
pub fn parse_designator_expression(
    ctx: &mut Context,
    expression: &str,
    variables: &[TermId],
    level: crate::config::Level,
) -> Option<TermId> {
    let grammar: &Grammar = ctx.grammar;
    let (tokens, _) = grammar.raw_tokens(
        expression,
        true,
        Some(&ctx.stage.terms),
        Some(variables),
        None,
        &[],
        false,
    )?;
    let mut parser = ExprParser::new(&tokens, 0);
    let mut cx = ctx.term_cx();
    let term = parser.parse_full(&mut cx)?;
    match ctx.term(term).clone() {
        Term::Anyone(mut a) => {
            if level != crate::config::NO_LEVEL && a.level < level {
                a.level = level;
                Some(ctx.stage.terms.alloc(Term::Anyone(a)))
            } else {
                Some(term)
            }
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Partial matching (autocomplete)
// ---------------------------------------------------------------------------

fn partial_match_term(ctx: &mut Context, edge: TermId, text: &str, output: &mut Vec<String>) -> bool {
    let grammar: &Grammar = ctx.grammar;
    match grammar.terms().get(edge) {
        Term::BuiltIn(nt) => match nt {
            NonTerminal::RightLeft => starts_with_ci("left", text) || starts_with_ci("right", text),
            NonTerminal::PartnerCorner => starts_with_ci("partner", text) || starts_with_ci("corner", text),
            NonTerminal::Anyone | NonTerminal::Anything | NonTerminal::Anycall => {
                let symbol = StartSymbol::of_non_terminal(*nt).unwrap();
                partial_match_symbol(ctx, symbol, text, output);
                false
            }
            NonTerminal::DancerName => starts_with_ci("$dancer", text),
            NonTerminal::Primitive => crate::primitives::Primitive::ALL
                .iter()
                .any(|p| starts_with_ci(p.name(), text)),
            NonTerminal::Integer => false,
            NonTerminal::Fraction => {
                match grammar.raw_tokens(text, false, None, None, None, &[], true) {
                    Some((tokens, partial)) => {
                        tokens.is_empty() && partial.kind != TokenKind::EndOfString && partial.text != text
                    }
                    None => false,
                }
            }
            _ => false,
        },
        term => {
            let spelling = term.spelling();
            if spelling.is_empty() {
                return false;
            }
            starts_with_ci(spelling, text)
        }
    }
}

fn starts_with_ci(candidate: &str, prefix: &str) -> bool {
    candidate.len() >= prefix.len() && candidate[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn meaning_level(ctx: &Context, meaning: &Meaning) -> crate::config::Level {
    match meaning {
        Meaning::Definition(d) => ctx.grammar.definition(*d).level,
        Meaning::Designator(d) => ctx.grammar.designator(*d).level,
    }
}

fn collect_reductions(ctx: &mut Context, state: i32, final_partial: &Token, output: &mut Vec<String>) -> bool {
    let grammar: &Grammar = ctx.grammar;
    if state < 0 || state as usize >= grammar.machine.states.len() {
        return false;
    }
    let ps = grammar.machine.states[state as usize];
    if let Some(edge) = ps.term {
        if final_partial.kind != TokenKind::EndOfString && !partial_match_term(ctx, edge, &final_partial.text, output)
        {
            return false;
        }
        collect_reductions_anon(ctx, ps.match_state, output);
        true
    } else {
        if ps.miss_state < 0 {
            return false;
        }
        let r = grammar.machine.reductions[ps.miss_state as usize].clone();
        if ctx.level != crate::config::NO_LEVEL {
            if let Some(meaning) = &r.meaning {
                if meaning_level(ctx, meaning) > ctx.level {
                    return false;
                }
            }
        }
        if !r.production.is_empty() && !r.definitions_only {
            output.push(r.production);
        }
        false
    }
}

fn collect_reductions_anon(ctx: &mut Context, mut state: i32, output: &mut Vec<String>) {
    let end = Token::end_of_string();
    while state != NULL_STATE {
        if !collect_reductions(ctx, state, &end, output) {
            break;
        }
        state = ctx.grammar.machine.states[state as usize].miss_state;
    }
}

fn partial_match_symbol(ctx: &mut Context, symbol: StartSymbol, text: &str, output: &mut Vec<String>) {
    let mut partial = Token::simple(TokenKind::Word);
    partial.text = text.to_string();
    let mut state = ctx.grammar.machine.initial[symbol.index()];
    while state != NULL_STATE {
        collect_reductions(ctx, state, &partial, output);
        state = ctx.grammar.machine.states[state as usize].miss_state;
    }
}

/// Completion candidates for a partially typed call phrase.
pub fn parse_partial(ctx: &mut Context, goal: Option<NonTerminal>, text: &str, group: GroupId) -> Vec<String> {
    let mut output: Vec<String> = Vec::new();
    match goal {
        Some(NonTerminal::RightLeft) => {
            output.push("left".into());
            output.push("right".into());
        }
        Some(NonTerminal::PartnerCorner) => {
            output.push("partner".into());
            output.push("corner".into());
        }
        Some(NonTerminal::Fraction) => {
            output.push("INTEGER".into());
            output.push("INTEGER/INTEGER".into());
            output.push("INTEGER and INTEGER/INTEGER".into());
        }
        Some(NonTerminal::Integer) => {
            for i in 1..=10 {
                output.push(i.to_string());
            }
        }
        Some(NonTerminal::CoupleNumber) => {
            for i in 1..=4 {
                output.push(format!("#{}", i));
            }
        }
        Some(NonTerminal::Ordinal) => {
            for (i, suffix) in [(1, "st"), (2, "nd"), (3, "rd")] {
                output.push(format!("{}{}", i, suffix));
            }
            for i in 4..=10 {
                output.push(format!("{}th", i));
            }
        }
        Some(NonTerminal::Anydirection) => {
            for d in ["left", "right", "in", "out", "as you are"] {
                output.push(d.into());
            }
        }
        _ => {
            let grammar: &Grammar = ctx.grammar;
            match grammar.raw_tokens(text, false, Some(&ctx.stage.terms), None, None, &[], true) {
                Some((tokens, final_partial)) => {
                    let mut partial_states = Vec::new();
                    let _ = state_machine(
                        ctx,
                        StartSymbol::Anycall,
                        false,
                        &tokens,
                        0,
                        true,
                        Some(&mut partial_states),
                        Some(group),
                    );
                    for state in partial_states {
                        collect_reductions(ctx, state as i32, &final_partial, &mut output);
                    }
                }
                None => {
                    let initial = ctx.grammar.machine.initial[StartSymbol::Anycall.index()];
                    collect_reductions_anon(ctx, initial, &mut output);
                }
            }
            // the bare "anything" suggestion expands to its productions
            if let Some(pos) = output.iter().position(|s| s.eq_ignore_ascii_case("anything")) {
                output.remove(pos);
                let initial = ctx.grammar.machine.initial[StartSymbol::Anything.index()];
                collect_reductions_anon(ctx, initial, &mut output);
            }
        }
    }
    output.sort();
    output.dedup();
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DanceType};
    use crate::group::Group;

    const GRAMMAR: &str = "\
-- Basic\n\
.walk\n\
walk integer steps\n\
\t>$forward($1/2)\n\
-- Basic\n\
.and_then\n\
anything and anything\n\
\t>$1\n\
\t+\n\
\t>$2\n\
-- Basic\n\
.face_right\n\
quarter right\n\
\t>$face(right, $self)\n\
@@\n\
++ Basic\n\
.boys|girls\n\
everyone\n\
%%\n\
=couple\n\
a? . a?\n";

    fn setup() -> (Grammar, Config) {
        let config = Config::default();
        let grammar = Grammar::read_str(GRAMMAR, &config);
        assert!(grammar.errors().is_empty(), "grammar errors: {:?}", grammar.errors());
        (grammar, config)
    }

    fn home(ctx: &mut Context) -> GroupId {
        ctx.stage.add_group(Group::home(DanceType::FourCouple))
    }

    #[test]
    fn machine_compiles_with_initial_states() {
        let (grammar, _) = setup();
        assert!(grammar.machine.compiled);
        assert_ne!(grammar.machine.initial[StartSymbol::Anything.index()], NULL_STATE);
        assert_ne!(grammar.machine.initial[StartSymbol::Anycall.index()], NULL_STATE);
        assert_ne!(grammar.machine.initial[StartSymbol::Anyone.index()], NULL_STATE);
        // "anything and anything" is left-recursive: it compiles into
        // the anything suffix trie
        assert_ne!(grammar.machine.suffixes[StartSymbol::Anything.index()], NULL_STATE);
    }

    #[test]
    fn miss_chains_are_sorted_by_sort_index() {
        let (grammar, _) = setup();
        for symbol in [StartSymbol::Anything, StartSymbol::Anycall, StartSymbol::Anyone] {
            let mut state = grammar.machine.initial[symbol.index()];
            let mut last = i32::MIN;
            while state != NULL_STATE {
                let ps = grammar.machine.states[state as usize];
                match ps.term {
                    Some(t) => {
                        let s = grammar.terms().get(t).sort_index();
                        assert!(s >= last, "miss chain out of order: {} after {}", s, last);
                        last = s;
                        state = ps.miss_state;
                    }
                    None => break,
                }
            }
        }
    }

    #[test]
    fn parses_a_simple_call_with_an_integer_argument() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        let call = parse_call(&mut ctx, home, "walk 4 steps", false, &[], &[]).expect("parse");
        match ctx.term(call) {
            Term::Call(c) => {
                assert!(c.definition.is_some());
                assert!(c.primitive.is_none());
                assert!(!c.in_definition);
                assert_eq!(c.args.len(), 1);
                assert!(matches!(ctx.term(c.args[0]), Term::Integer(4)));
            }
            other => panic!("expected a call, got {:?}", other),
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        assert!(parse_call(&mut ctx, home, "walk 4 steps quickly", false, &[], &[]).is_none());
    }

    #[test]
    fn left_recursion_parses_and_chains() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        let call = parse_call(&mut ctx, home, "walk 2 steps and walk 4 steps", false, &[], &[]).expect("parse");
        match ctx.term(call).clone() {
            Term::Call(c) => {
                assert_eq!(c.args.len(), 2, "and-chain takes two calls");
                for arg in c.args {
                    assert!(matches!(ctx.term(arg), Term::Call(_)));
                }
            }
            other => panic!("expected a call, got {:?}", other),
        }
    }

    #[test]
    fn primitive_text_is_definition_only() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        // users cannot type primitives directly
        assert!(parse_call(&mut ctx, home, "$forward(1/2)", false, &[], &[]).is_none());
        let call = parse_call(&mut ctx, home, "$forward(1/2)", true, &[], &[]).expect("definition text parses");
        match ctx.term(call) {
            Term::Call(c) => {
                assert!(c.primitive.is_some());
                assert_eq!(c.args.len(), 1);
                assert!(matches!(ctx.term(c.args[0]), Term::Fraction(f) if f.num == 1 && f.denom == 2));
            }
            other => panic!("expected a primitive call, got {:?}", other),
        }
    }

    #[test]
    fn primitive_arguments_take_directions_and_pivots() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        let call = parse_call(&mut ctx, home, "$face(right, $self)", true, &[], &[]).expect("parse");
        match ctx.term(call) {
            Term::Call(c) => {
                assert_eq!(c.args.len(), 2);
                assert!(matches!(ctx.term(c.args[0]), Term::Direction(Direction::Right)));
                assert!(matches!(ctx.term(c.args[1]), Term::Pivot(crate::term::Pivot::Zelf)));
            }
            other => panic!("expected a call, got {:?}", other),
        }
    }

    #[test]
    fn variables_substitute_into_definition_text() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        let four = ctx.stage.terms.alloc(Term::Integer(4));
        let call = parse_call(&mut ctx, home, "$forward($1/2)", true, &[four], &[]).expect("parse");
        match ctx.term(call) {
            Term::Call(c) => {
                assert!(matches!(ctx.term(c.args[0]), Term::Fraction(f) if f.whole == 2 && f.num == 0));
            }
            other => panic!("expected a call, got {:?}", other),
        }
    }

    #[test]
    fn anyone_phrases_compile_designator_expressions() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        let (local, anyone) = parse_anyone(&mut ctx, home, "everyone", &[], &[]).expect("parse");
        assert!(local.is_none());
        match ctx.term(anyone) {
            Term::Anyone(a) => assert!(matches!(a.set, Anyone::Or(_, _))),
            other => panic!("expected anyone, got {:?}", other),
        }
    }

    #[test]
    fn builtin_designator_words_parse_as_anyone() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        // expressions over designators work inside definitions
        let anyone = parse_designator_expression(&mut ctx, "boys & centers", &[], crate::config::NO_LEVEL)
            .expect("expression compiles");
        match ctx.term(anyone) {
            Term::Anyone(a) => assert!(matches!(a.set, Anyone::And(_, _))),
            other => panic!("expected anyone, got {:?}", other),
        }
    }

    #[test]
    fn expression_comparisons_yield_integers() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let (tokens, _) = ctx
            .grammar
            .raw_tokens("1/2 < 3/4", true, None, None, None, &[], false)
            .unwrap();
        let mut parser = ExprParser::new(&tokens, 0);
        let mut cx = ctx.term_cx();
        let t = parser.parse_full(&mut cx).expect("expression");
        assert!(matches!(ctx.term(t), Term::Integer(1)));
    }

    #[test]
    fn partial_match_suggests_productions() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        let suggestions = parse_partial(&mut ctx, None, "wal", home);
        assert!(
            suggestions.iter().any(|s| s.contains("walk")),
            "expected walk suggestion in {:?}",
            suggestions
        );
    }

    #[test]
    fn partial_match_shortcut_goals() {
        let (grammar, config) = setup();
        let mut ctx = Context::new(&grammar, config);
        let home = home(&mut ctx);
        let out = parse_partial(&mut ctx, Some(NonTerminal::RightLeft), "", home);
        assert_eq!(out, vec!["left".to_string(), "right".to_string()]);
        let out = parse_partial(&mut ctx, Some(NonTerminal::Fraction), "", home);
        assert!(out.contains(&"INTEGER/INTEGER".to_string()));
    }

    #[test]
    fn reduce_depth_guard_stops_divergence() {
        let config = Config::default();
        // a grammar whose only production recurses without consuming
        let grammar = Grammar::read_str("--\n.loop\ndo anything\n\t>$nothing()\n", &config);
        let mut ctx = Context::new(&grammar, config);
        let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
        // "do do do ..." forces nested recursion; the guard must stop it
        let mut text = String::new();
        for _ in 0..60 {
            text.push_str("do ");
        }
        assert!(parse_call(&mut ctx, home, text.trim_end(), false, &[], &[]).is_none());
    }
}
