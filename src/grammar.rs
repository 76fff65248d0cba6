//! The call grammar.
//!
//! A `Grammar` owns the caller-authored corpus: synonyms, call
//! definitions (productions, variants, parts, actions), designators,
//! and formation diagrams, plus the built-in word dictionary the lexer
//! consults. Grammars chain: a local grammar may name a backup whose
//! definitions it inherits, with local productions winning.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::anyone::Anyone;
use crate::config::{Config, Level, NO_LEVEL};
use crate::explain::GrammarFileError;
use crate::formation::{Formation, Geometry};
use crate::lexer::{Scanner, TermLook, Token, TokenKind, WordSource};
use crate::parser::Machine;
use crate::primitives::Primitive;
use crate::stage::{TermId, TermSpace, TermStore};
use crate::term::{AnyoneTerm, DefinitionRef, Fraction, NonTerminal, Term, DIRECTION_NAMES, PIVOT_NAMES};

/// A variant of a definition somewhere in the grammar chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantRef {
    pub definition: DefinitionRef,
    pub variant: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DesignatorRef {
    pub depth: u8,
    pub index: u32,
}

/// A formation name plus the designating parameter list, as written in
/// a variant's `*` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub formation: String,
    pub parameter_list: String,
}

impl Pattern {
    pub fn parse(expression: &str) -> Pattern {
        let expression = expression.trim();
        match expression.split_once(char::is_whitespace) {
            Some((name, params)) => Pattern {
                formation: name.to_string(),
                parameter_list: params.trim().to_string(),
            },
            None => Pattern {
                formation: expression.to_string(),
                parameter_list: String::new(),
            },
        }
    }

    /// A pattern discriminates designated dancers when parameterized.
    pub fn discriminates(&self) -> bool {
        !self.parameter_list.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Synonym {
    pub synonym: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Track {
    pub who: String,
    pub what: String,
    pub finish_together: bool,
    pub any_who_can: bool,
}

impl Track {
    pub fn noop(&self) -> bool {
        self.who.is_empty() && self.what.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    Simple(String),
    Compound(Vec<Track>),
}

impl Action {
    pub fn noop(&self) -> bool {
        match self {
            Action::Simple(text) => text.is_empty(),
            Action::Compound(tracks) => tracks.iter().all(|t| t.noop()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Part {
    pub repeat: String,
    pub actions: Vec<Action>,
}

impl Part {
    fn compound_who(&mut self, finish_together: bool, who: &str) -> bool {
        match self.actions.last_mut() {
            Some(Action::Compound(tracks)) => {
                tracks.push(Track {
                    who: who.to_string(),
                    finish_together,
                    ..Track::default()
                });
                true
            }
            _ => false,
        }
    }

    fn compound_what(&mut self, any_who_can: bool, what: &str) -> bool {
        match self.actions.last_mut() {
            Some(Action::Compound(tracks)) => match tracks.last_mut() {
                Some(track) => {
                    track.what = what.to_string();
                    track.any_who_can = any_who_can;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variant {
    pub level: Level,
    pub level_name: String,
    pub precedence: u32,
    pub precedence_name: String,
    pub patterns: Vec<String>,
    pub parts: Vec<Part>,
}

impl Default for Variant {
    fn default() -> Variant {
        Variant {
            level: NO_LEVEL,
            level_name: String::new(),
            precedence: 0,
            precedence_name: String::new(),
            patterns: Vec::new(),
            parts: Vec::new(),
        }
    }
}

impl Variant {
    pub fn recognizers(&self) -> Vec<Pattern> {
        self.patterns.iter().map(|p| Pattern::parse(p)).collect()
    }

    fn last_part(&mut self) -> &mut Part {
        if self.parts.is_empty() {
            self.parts.push(Part::default());
        }
        self.parts.last_mut().unwrap()
    }

    /// A variant with no level of its own dances at its definition's.
    pub fn effective_level(&self, definition_level: Level) -> Level {
        if self.level != NO_LEVEL {
            self.level
        } else {
            definition_level
        }
    }
}

#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    pub level: Level,
    pub level_name: String,
    pub created: i64,
    pub modified: i64,
    pub productions: Vec<String>,
    pub variants: Vec<Variant>,
}

impl Default for Definition {
    fn default() -> Definition {
        Definition {
            name: String::new(),
            level: NO_LEVEL,
            level_name: String::new(),
            created: 0,
            modified: 0,
            productions: Vec::new(),
            variants: Vec::new(),
        }
    }
}

impl Definition {
    pub fn label(&self) -> &str {
        self.productions.first().map(|s| s.as_str()).unwrap_or("<new>")
    }

    fn last_variant(&mut self) -> &mut Variant {
        if self.variants.is_empty() {
            self.variants.push(Variant::default());
        }
        self.variants.last_mut().unwrap()
    }

    /// Every definition keeps at least one (possibly empty) part.
    fn verify(&mut self) {
        for v in &mut self.variants {
            if v.parts.is_empty() {
                v.parts.push(Part::default());
            }
        }
        if self.variants.is_empty() {
            self.variants.push(Variant {
                parts: vec![Part::default()],
                ..Variant::default()
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct Designator {
    pub level: Level,
    pub created: i64,
    pub modified: i64,
    pub expression: String,
    pub phrases: Vec<String>,
}

impl Designator {
    pub fn label(&self) -> &str {
        self.phrases.first().map(|s| s.as_str()).unwrap_or(&self.expression)
    }
}

pub struct Grammar {
    config: Config,
    terms: TermStore,
    words: HashMap<String, TermId>,
    synonyms: Vec<Synonym>,
    synonym_map: HashMap<String, String>,
    definitions: Vec<Definition>,
    formations: Vec<Formation>,
    formation_names: HashMap<String, usize>,
    designators: Vec<Designator>,
    backup: Option<Box<Grammar>>,
    errors: Vec<GrammarFileError>,
    and_term: TermId,
    pub(crate) machine: Machine,
}

impl WordSource for Grammar {
    fn synonym_body(&self, word: &str) -> Option<&str> {
        match self.synonym_map.get(word) {
            Some(body) => Some(body),
            None => self.backup.as_ref().and_then(|b| b.synonym_body(word)),
        }
    }

    fn lookup_word(&self, word: &str) -> Option<TermId> {
        self.words.get(word).copied()
    }
}

impl Grammar {
    pub fn new(config: &Config) -> Grammar {
        let mut terms = TermStore::new(TermSpace::Grammar);
        let mut words = HashMap::new();
        let and_term = terms.alloc(Term::Word("and".into()));
        words.insert("and".to_string(), and_term);
        let mut g = Grammar {
            config: config.clone(),
            terms,
            words,
            synonyms: Vec::new(),
            synonym_map: HashMap::new(),
            definitions: Vec::new(),
            formations: Vec::new(),
            formation_names: HashMap::new(),
            designators: Vec::new(),
            backup: None,
            errors: Vec::new(),
            and_term,
            machine: Machine::default(),
        };
        g.seed_dictionary();
        g
    }

    fn define(&mut self, word: &str, term: Term) -> TermId {
        let id = self.terms.alloc(term);
        self.words.insert(word.to_string(), id);
        id
    }

    fn seed_dictionary(&mut self) {
        for (name, d) in DIRECTION_NAMES {
            self.define(name, Term::Direction(d));
        }
        for (name, p) in PIVOT_NAMES {
            self.define(name, Term::Pivot(p));
        }
        self.define("$until_home", Term::Fraction(Fraction::until_home()));

        for nt in [
            NonTerminal::RightLeft,
            NonTerminal::PartnerCorner,
            NonTerminal::Anyone,
            NonTerminal::Anything,
            NonTerminal::Anycall,
            NonTerminal::Anydirection,
            NonTerminal::Integer,
            NonTerminal::Fraction,
            NonTerminal::CoupleNumber,
            NonTerminal::Ordinal,
            NonTerminal::Primitive,
            NonTerminal::DancerName,
        ] {
            self.define(nt.name(), Term::BuiltIn(nt));
        }

        for p in Primitive::ALL {
            self.define(p.name(), Term::Primitive(p));
        }

        let adv1 = self.config.level_value("Advanced-1");
        let leaves: &[(&str, Anyone, Level)] = &[
            ("$last_active", Anyone::LastActive, NO_LEVEL),
            ("boys", Anyone::Boys, NO_LEVEL),
            ("girls", Anyone::Girls, NO_LEVEL),
            ("heads", Anyone::Heads, NO_LEVEL),
            ("sides", Anyone::Sides, NO_LEVEL),
            ("others", Anyone::Others, NO_LEVEL),
            ("centers", Anyone::Centers, NO_LEVEL),
            ("ends", Anyone::Ends, NO_LEVEL),
            ("leaders", Anyone::Leaders, NO_LEVEL),
            ("trailers", Anyone::Trailers, NO_LEVEL),
            ("beaus", Anyone::Beaus, adv1),
            ("belles", Anyone::Belles, adv1),
            ("$very_centers", Anyone::VeryCenters, NO_LEVEL),
            ("$very_ends", Anyone::VeryEnds, NO_LEVEL),
            ("$facing_across", Anyone::FacingAcross, NO_LEVEL),
            ("$facing_along", Anyone::FacingAlong, NO_LEVEL),
            ("$in_facing", Anyone::InFacing, NO_LEVEL),
            ("$out_facing", Anyone::OutFacing, NO_LEVEL),
        ];
        for (word, set, level) in leaves {
            self.define(
                word,
                Term::Anyone(AnyoneTerm {
                    set: set.clone(),
                    level: *level,
                }),
            );
        }

        for i in 0..crate::dancer::MAX_DANCERS {
            let name = format!("$dancer{}", (b'a' + i as u8) as char);
            self.define(&name, Term::DancerName(i as u8));
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn terms(&self) -> &TermStore {
        &self.terms
    }

    pub fn and_term(&self) -> TermId {
        self.and_term
    }

    pub fn errors(&self) -> &[GrammarFileError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn synonyms(&self) -> &[Synonym] {
        &self.synonyms
    }

    pub fn definitions(&self) -> &[Definition] {
        &self.definitions
    }

    pub fn designators(&self) -> &[Designator] {
        &self.designators
    }

    pub fn formations(&self) -> &[Formation] {
        &self.formations
    }

    pub fn add_definition(&mut self, definition: Definition) -> DefinitionRef {
        self.definitions.push(definition);
        DefinitionRef {
            depth: 0,
            index: (self.definitions.len() - 1) as u32,
        }
    }

    pub fn add_designator(&mut self, designator: Designator) -> DesignatorRef {
        self.designators.push(designator);
        DesignatorRef {
            depth: 0,
            index: (self.designators.len() - 1) as u32,
        }
    }

    pub fn add_formation(&mut self, formation: Formation) {
        let name = formation.name().to_string();
        let index = self.formations.len();
        self.formations.push(formation);
        if !name.is_empty() {
            self.formation_names.entry(name).or_insert(index);
        }
    }

    pub fn add_synonym(&mut self, synonym: &str, value: &str) -> bool {
        if self.synonym_map.contains_key(synonym) {
            return false;
        }
        self.synonyms.push(Synonym {
            synonym: synonym.to_string(),
            value: value.to_string(),
        });
        self.synonym_map.insert(synonym.to_string(), value.to_string());
        true
    }

    pub fn set_backup(&mut self, backup: Grammar) {
        self.backup = Some(Box::new(backup));
        self.machine = Machine::default();
    }

    pub fn backup(&self) -> Option<&Grammar> {
        self.backup.as_deref()
    }

    /// Invalidate compiled parse state after edits.
    pub fn touch(&mut self) {
        self.machine = Machine::default();
    }

    pub fn grammar_at_depth(&self, depth: u8) -> &Grammar {
        let mut g = self;
        for _ in 0..depth {
            g = g.backup.as_deref().unwrap_or(g);
        }
        g
    }

    pub fn definition(&self, r: DefinitionRef) -> &Definition {
        &self.grammar_at_depth(r.depth).definitions[r.index as usize]
    }

    pub fn designator(&self, r: DesignatorRef) -> &Designator {
        &self.grammar_at_depth(r.depth).designators[r.index as usize]
    }

    pub fn variant(&self, r: VariantRef) -> &Variant {
        &self.definition(r.definition).variants[r.variant as usize]
    }

    pub fn formation(&self, name: &str) -> Option<&Formation> {
        match self.formation_names.get(name) {
            Some(&i) => Some(&self.formations[i]),
            None => self.backup.as_deref().and_then(|b| b.formation(name)),
        }
    }

    /// The formation patterns backing leader/trailer classification.
    pub fn leaders_trailers(&self) -> Vec<crate::group::TileSpec> {
        ["box", "twosome"]
            .iter()
            .map(|name| crate::group::TileSpec {
                formation: name.to_string(),
                variant: None,
                precedence: 0,
            })
            .collect()
    }

    pub fn partners(&self) -> Vec<crate::group::TileSpec> {
        ["box", "couple", "rh_mini_wave", "lh_mini_wave"]
            .iter()
            .map(|name| crate::group::TileSpec {
                formation: name.to_string(),
                variant: None,
                precedence: 0,
            })
            .collect()
    }

    pub fn couples(&self) -> Vec<crate::group::TileSpec> {
        vec![crate::group::TileSpec {
            formation: "couple".to_string(),
            variant: None,
            precedence: 0,
        }]
    }

    /// Every visible formation carrying center/end markers; local names
    /// shadow backup names.
    pub fn centers_ends(&self) -> Vec<String> {
        let mut seen = HashMap::new();
        let mut chain: Vec<&Grammar> = Vec::new();
        let mut g = Some(self);
        while let Some(gr) = g {
            chain.push(gr);
            g = gr.backup.as_deref();
        }
        for gr in &chain {
            for f in &gr.formations {
                if !f.name().is_empty() && !seen.contains_key(f.name()) {
                    seen.insert(f.name().to_string(), f.has_centers_or_ends());
                }
            }
        }
        let mut out: Vec<String> = seen.into_iter().filter(|(_, has)| *has).map(|(n, _)| n).collect();
        out.sort();
        out
    }

    /// All variant patterns of a definition as tiling specs, largest
    /// formations first.
    pub fn definition_tiles(&self, r: DefinitionRef) -> Vec<crate::group::TileSpec> {
        let def = self.definition(r);
        let mut specs: Vec<(usize, crate::group::TileSpec)> = Vec::new();
        for (vi, variant) in def.variants.iter().enumerate() {
            for pattern in variant.recognizers() {
                if let Some(f) = self.formation(&pattern.formation) {
                    specs.push((
                        f.dancer_count(),
                        crate::group::TileSpec {
                            formation: pattern.formation.clone(),
                            variant: Some(VariantRef {
                                definition: r,
                                variant: vi as u32,
                            }),
                            precedence: variant.precedence,
                        },
                    ));
                }
            }
        }
        specs.sort_by_key(|(count, _)| std::cmp::Reverse(*count));
        specs.into_iter().map(|(_, s)| s).collect()
    }

    fn intern_word(&mut self, word: &str) -> TermId {
        if let Some(&id) = self.words.get(word) {
            return id;
        }
        self.define(word, Term::Word(word.to_string()))
    }

    pub(crate) fn alloc_term(&mut self, term: Term) -> TermId {
        self.terms.alloc(term)
    }

    // -----------------------------------------------------------------
    // Tokenizing
    // -----------------------------------------------------------------

    /// Scan and assemble tokens: fraction forms are folded, `$n`
    /// variables substituted, dancer names passed through. Returns the
    /// token list and, when autocompleting, the trailing partial token.
    pub(crate) fn raw_tokens(
        &self,
        text: &str,
        in_definition: bool,
        stage: Option<&TermStore>,
        variables: Option<&[TermId]>,
        group_term: Option<TermId>,
        locals: &[(TermId, TermId)],
        want_partial: bool,
    ) -> Option<(Vec<Token>, Token)> {
        let look = TermLook {
            grammar_terms: &self.terms,
            stage_terms: stage,
        };
        let mut scanner = Scanner::new(text, in_definition, Some(self as &dyn WordSource), look, locals, want_partial);
        let mut raw: Vec<Token> = Vec::new();
        let mut final_partial = Token::end_of_string();
        loop {
            let t = scanner.scan().clone();
            match t.kind {
                TokenKind::EndOfString => break,
                TokenKind::Error => return None,
                TokenKind::FinalPartial => {
                    final_partial = t;
                    final_partial.kind = TokenKind::Word;
                    break;
                }
                _ => raw.push(t),
            }
        }

        let mut tokens: Vec<Token> = Vec::new();
        let mut i = 0;
        while i < raw.len() {
            let t = &raw[i];
            match t.kind {
                TokenKind::UnknownWord => {
                    if !in_definition {
                        return None;
                    }
                    let mut tok = Token::simple(TokenKind::Word);
                    tok.text = t.text.clone();
                    tokens.push(tok);
                    i += 1;
                }
                TokenKind::Variable => {
                    let value = t.value as usize;
                    match variables {
                        Some(_) if value == 0 => {
                            tokens.push(Token::word(group_term?));
                        }
                        Some(vars) if value <= vars.len() => {
                            tokens.push(look.token_for(vars[value - 1]));
                        }
                        _ => return None,
                    }
                    i += 1;
                }
                TokenKind::Integer => {
                    let whole = t.value;
                    // N/M, or N and N/M, or a bare integer
                    if i + 2 < raw.len()
                        && raw[i + 1].kind == TokenKind::Slash
                        && raw[i + 2].kind == TokenKind::Integer
                    {
                        if raw[i + 2].value == 0 {
                            return None;
                        }
                        tokens.push(Token::fraction(Fraction::new(0, whole, raw[i + 2].value)));
                        i += 3;
                    } else if i + 1 < raw.len()
                        && raw[i + 1].kind == TokenKind::Slash
                        && want_partial
                        && final_partial.kind == TokenKind::EndOfString
                        && i + 2 == raw.len()
                    {
                        final_partial = Token::simple(TokenKind::Word);
                        final_partial.text = format!("{}/", whole);
                        return Some((tokens, final_partial));
                    } else if i + 4 < raw.len()
                        && raw[i + 1].kind == TokenKind::Word
                        && raw[i + 1].term == Some(self.and_term)
                        && raw[i + 2].kind == TokenKind::Integer
                        && raw[i + 3].kind == TokenKind::Slash
                        && raw[i + 4].kind == TokenKind::Integer
                    {
                        if raw[i + 4].value == 0 {
                            return None;
                        }
                        tokens.push(Token::fraction(Fraction::new(whole, raw[i + 2].value, raw[i + 4].value)));
                        i += 5;
                    } else {
                        tokens.push(t.clone());
                        i += 1;
                    }
                }
                _ => {
                    tokens.push(t.clone());
                    i += 1;
                }
            }
        }
        if tokens.is_empty() && final_partial.kind == TokenKind::EndOfString {
            return None;
        }
        Some((tokens, final_partial))
    }

    /// Tokenize a production at grammar-compile time, interning any
    /// words the dictionary has not seen.
    pub(crate) fn tokenize_production(&mut self, text: &str) -> Option<Vec<Token>> {
        let (mut tokens, _) = self.raw_tokens(text, true, None, None, None, &[], false)?;
        for tok in &mut tokens {
            if tok.kind == TokenKind::Word && tok.term.is_none() {
                tok.term = Some(self.intern_word(&tok.text.clone()));
            }
        }
        Some(tokens)
    }

    // -----------------------------------------------------------------
    // Grammar file reading
    // -----------------------------------------------------------------

    pub fn read(path: &Path, config: &Config) -> std::io::Result<Grammar> {
        let text = std::fs::read_to_string(path)?;
        Ok(Grammar::read_str(&text, config))
    }

    /// Parse the three-section grammar file. Problems are recorded as
    /// line-tagged errors; parsing continues past them.
    pub fn read_str(text: &str, config: &Config) -> Grammar {
        let mut grammar = Grammar::new(config);
        grammar.process_text(text);
        for def in &mut grammar.definitions {
            def.verify();
        }
        crate::parser::compile_state_machines(&mut grammar);
        grammar
    }

    fn error(&mut self, line: usize, message: impl Into<String>) {
        let e = GrammarFileError::new(line, message);
        log::warn!("grammar: {}", e);
        self.errors.push(e);
    }

    fn process_text(&mut self, text: &str) {
        let mut lines = text.lines().enumerate();
        let mut current: Option<usize> = None;
        while let Some((number, line)) = lines.next() {
            let number = number + 1;
            let trimmed = line.trim_start();
            if trimmed == "@@" {
                self.process_designators(&mut lines);
                return;
            }
            if trimmed == "%%" {
                self.process_diagrams(&mut lines);
                return;
            }
            self.process_line(number, trimmed, &mut current);
        }
    }

    fn process_line(&mut self, number: usize, line: &str, current: &mut Option<usize>) {
        if line.is_empty() || line.starts_with('/') {
            return;
        }
        if let Some(rest) = line.strip_prefix(':') {
            match rest.split_once('=') {
                Some((synonym, value)) => {
                    if !self.add_synonym(synonym, value) {
                        self.error(number, "Duplicate synonym");
                    }
                }
                None => self.error(number, "Synonym missing ="),
            }
            return;
        }
        if let Some(rest) = line.strip_prefix("--") {
            let mut def = Definition::default();
            let level_name = rest.trim();
            if !level_name.is_empty() {
                def.level = self.config.level_value(level_name);
                def.level_name = level_name.to_string();
            }
            self.definitions.push(def);
            *current = Some(self.definitions.len() - 1);
            return;
        }
        let index = match *current {
            Some(i) => i,
            None => {
                self.error(number, "Unexpected call text");
                return;
            }
        };
        let mut head = line.chars();
        match head.next() {
            Some('.') => self.definitions[index].name = head.as_str().to_string(),
            Some('C') => self.definitions[index].created = head.as_str().trim().parse().unwrap_or(0),
            Some('M') => self.definitions[index].modified = head.as_str().trim().parse().unwrap_or(0),
            Some('+') => self.definitions[index].last_variant().parts.push(Part {
                repeat: head.as_str().trim().to_string(),
                actions: Vec::new(),
            }),
            Some('|') => self.definitions[index].variants.push(Variant::default()),
            Some('!') => {
                let name = head.as_str().trim().to_string();
                let level = self.config.level_value(&name);
                let v = self.definitions[index].last_variant();
                v.level_name = name;
                v.level = level;
            }
            Some('^') => {
                let name = head.as_str().trim().to_string();
                let precedence = self.config.precedence_value(&name);
                let v = self.definitions[index].last_variant();
                v.precedence_name = name;
                v.precedence = precedence;
            }
            Some('>') => self.definitions[index]
                .last_variant()
                .last_part()
                .actions
                .push(Action::Simple(head.as_str().to_string())),
            Some('<') => self.definitions[index]
                .last_variant()
                .last_part()
                .actions
                .push(Action::Compound(Vec::new())),
            Some('@') => {
                let rest = head.as_str().to_string();
                let ok = match rest.chars().next() {
                    Some('T') => self.definitions[index]
                        .last_variant()
                        .last_part()
                        .compound_who(true, rest[1..].trim_start()),
                    Some('F') => self.definitions[index]
                        .last_variant()
                        .last_part()
                        .compound_who(false, rest[1..].trim_start()),
                    _ => {
                        self.error(number, "Compound who line needs T or F");
                        return;
                    }
                };
                if !ok {
                    self.error(number, "Compound who outside a compound action");
                }
            }
            Some('#') => {
                let rest = head.as_str().to_string();
                let ok = match rest.chars().next() {
                    Some('T') => self.definitions[index]
                        .last_variant()
                        .last_part()
                        .compound_what(true, rest[1..].trim_start()),
                    Some('F') => self.definitions[index]
                        .last_variant()
                        .last_part()
                        .compound_what(false, rest[1..].trim_start()),
                    _ => {
                        self.error(number, "Compound what line needs T or F");
                        return;
                    }
                };
                if !ok {
                    self.error(number, "Compound what outside a compound action");
                }
            }
            Some('*') => {
                let pattern = head.as_str().trim();
                if !pattern.is_empty() {
                    self.definitions[index].last_variant().patterns.push(pattern.to_string());
                }
            }
            Some(_) => self.definitions[index].productions.push(line.to_string()),
            None => {}
        }
    }

    fn process_designators<'a>(&mut self, lines: &mut impl Iterator<Item = (usize, &'a str)>) {
        let mut current: Option<usize> = None;
        while let Some((number, line)) = lines.next() {
            let number = number + 1;
            let line = line.trim_start();
            if line == "%%" {
                self.process_diagrams(lines);
                return;
            }
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("++") {
                let mut des = Designator {
                    level: NO_LEVEL,
                    created: 0,
                    modified: 0,
                    expression: String::new(),
                    phrases: Vec::new(),
                };
                let level_name = rest.trim();
                if !level_name.is_empty() {
                    des.level = self.config.level_value(level_name);
                }
                self.designators.push(des);
                current = Some(self.designators.len() - 1);
                continue;
            }
            let index = match current {
                Some(i) => i,
                None => {
                    self.error(number, "Expecting ++ at beginning of designator");
                    continue;
                }
            };
            let des = &mut self.designators[index];
            let mut head = line.chars();
            match head.next() {
                Some('.') => des.expression = head.as_str().to_string(),
                Some('C') => des.created = head.as_str().trim().parse().unwrap_or(0),
                Some('M') => des.modified = head.as_str().trim().parse().unwrap_or(0),
                _ => {
                    if des.expression.is_empty() {
                        self.error(number, "Designator phrase before its expression");
                    } else {
                        des.phrases.push(line.to_string());
                    }
                }
            }
        }
        if let Some(i) = current {
            if self.designators[i].expression.is_empty() {
                self.error(0, "Last designator is empty");
            }
        }
    }

    fn process_diagrams<'a>(&mut self, lines: &mut impl Iterator<Item = (usize, &'a str)>) {
        let mut current: Option<usize> = None;
        while let Some((number, line)) = lines.next() {
            let number = number + 1;
            if let Some(rest) = line.strip_prefix('=') {
                let rest = rest.trim();
                let (name, geometry) = match rest.split_once('@') {
                    Some((name, geo)) => {
                        let geometry = match geo.trim() {
                            "ring" => Geometry::Ring,
                            "grid" => Geometry::Grid,
                            "hexagonal" => Geometry::Hexagonal,
                            other => {
                                self.error(number, format!("Unexpected geometry '{}'", other));
                                Geometry::Unspecified
                            }
                        };
                        (name.trim(), geometry)
                    }
                    None => (rest, Geometry::Unspecified),
                };
                if self.formation_names.contains_key(name) {
                    self.error(number, format!("Duplicate formation name '{}'", name));
                }
                self.add_formation(Formation::new(name, geometry));
                current = Some(self.formations.len() - 1);
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            match current {
                Some(i) => {
                    if !self.formations[i].add_row(line) {
                        self.error(number, "Diagram syntax error");
                    }
                }
                None => self.error(number, "Expecting = at beginning of diagram name"),
            }
        }
    }

    // -----------------------------------------------------------------
    // Grammar file writing
    // -----------------------------------------------------------------

    pub fn write_contents(&self) -> String {
        let mut out = String::new();
        for s in &self.synonyms {
            let _ = writeln!(out, ":{}={}", s.synonym, s.value);
        }
        for def in &self.definitions {
            out.push_str("--");
            if !def.level_name.is_empty() {
                out.push(' ');
                out.push_str(&def.level_name);
            }
            out.push('\n');
            if def.created != 0 {
                let _ = writeln!(out, "C{}", def.created);
            }
            if def.modified != 0 {
                let _ = writeln!(out, "M{}", def.modified);
            }
            if !def.name.is_empty() {
                let _ = writeln!(out, ".{}", def.name);
            }
            for p in &def.productions {
                let _ = writeln!(out, "{}", p);
            }
            for (vi, v) in def.variants.iter().enumerate() {
                for p in &v.patterns {
                    let _ = writeln!(out, "\t*{}", p);
                }
                if !v.level_name.is_empty() {
                    let _ = writeln!(out, "\t!{}", v.level_name);
                }
                if v.precedence > 0 {
                    let _ = writeln!(out, "\t^{}", v.precedence_name);
                }
                for (pi, part) in v.parts.iter().enumerate() {
                    if pi > 0 || !part.repeat.is_empty() {
                        if part.repeat.is_empty() {
                            let _ = writeln!(out, "\t+");
                        } else {
                            let _ = writeln!(out, "\t+ {}", part.repeat);
                        }
                    }
                    for action in &part.actions {
                        match action {
                            Action::Simple(text) => {
                                if !text.is_empty() {
                                    let _ = writeln!(out, "\t\t>{}", text);
                                }
                            }
                            Action::Compound(tracks) => {
                                if tracks.iter().all(|t| t.noop() && !t.any_who_can && !t.finish_together) {
                                    continue;
                                }
                                out.push_str("\t\t<\n");
                                for t in tracks {
                                    if t.noop() && !t.any_who_can && !t.finish_together {
                                        continue;
                                    }
                                    let _ = writeln!(out, "\t\t\t@{} {}", if t.finish_together { "T" } else { "F" }, t.who);
                                    let _ = writeln!(out, "\t\t\t#{} {}", if t.any_who_can { "T" } else { "F" }, t.what);
                                }
                            }
                        }
                    }
                }
                if vi < def.variants.len() - 1 {
                    out.push_str("|\n");
                }
            }
        }
        if !self.designators.is_empty() {
            out.push_str("@@\n");
            for d in &self.designators {
                out.push_str("++");
                if d.level != NO_LEVEL {
                    out.push(' ');
                    out.push_str(self.config.level_name(d.level));
                }
                out.push('\n');
                if d.created != 0 {
                    let _ = writeln!(out, "C{}", d.created);
                }
                if d.modified != 0 {
                    let _ = writeln!(out, "M{}", d.modified);
                }
                let _ = writeln!(out, ".{}", d.expression);
                for p in &d.phrases {
                    let _ = writeln!(out, "{}", p);
                }
            }
        }
        if !self.formations.is_empty() {
            out.push_str("%%\n");
            for f in &self.formations {
                f.write_to(&mut out);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    const SMALL_GRAMMAR: &str = "\
:u-turn=u turn\n\
-- Basic\n\
.walk\n\
C100\n\
walk integer steps\n\
\t>$forward($1/2)\n\
@@\n\
++ Basic\n\
.boys|girls\n\
everyone\n\
%%\n\
=couple\n\
a? . a?\n\
=wave @grid\n\
a^ . av . a^ . av\n";

    #[test]
    fn reads_all_three_sections() {
        let g = Grammar::read_str(SMALL_GRAMMAR, &config());
        assert!(g.errors().is_empty(), "unexpected errors: {:?}", g.errors());
        assert_eq!(g.synonyms().len(), 1);
        assert_eq!(g.definitions().len(), 1);
        assert_eq!(g.designators().len(), 1);
        assert_eq!(g.formations().len(), 2);
        assert_eq!(g.definitions()[0].name, "walk");
        assert_eq!(g.definitions()[0].created, 100);
        assert_eq!(g.definitions()[0].productions, vec!["walk integer steps"]);
    }

    #[test]
    fn formation_lookup_sees_geometry() {
        let g = Grammar::read_str(SMALL_GRAMMAR, &config());
        let wave = g.formation("wave").expect("wave formation");
        assert_eq!(wave.geometry(), Geometry::Grid);
        assert_eq!(wave.dancer_count(), 4);
        assert!(g.formation("missing").is_none());
    }

    #[test]
    fn duplicate_synonym_is_an_error() {
        let text = ":a=b\n:a=c\n";
        let g = Grammar::read_str(text, &config());
        assert_eq!(g.errors().len(), 1);
    }

    #[test]
    fn call_text_outside_definition_is_an_error() {
        let g = Grammar::read_str("stray text\n", &config());
        assert!(!g.errors().is_empty());
    }

    #[test]
    fn dictionary_knows_builtins_and_designators() {
        let g = Grammar::new(&config());
        assert!(g.lookup_word("anything").is_some());
        assert!(g.lookup_word("boys").is_some());
        assert!(g.lookup_word("$center").is_some());
        assert!(g.lookup_word("$forward").is_some());
        assert!(g.lookup_word("$dancera").is_some());
        assert!(g.lookup_word("$until_home").is_some());
        assert!(g.lookup_word("made-up-call").is_none());
    }

    #[test]
    fn backup_grammar_supplies_formations_and_synonyms() {
        let backup = Grammar::read_str("%%\n=couple\na? . a?\n", &config());
        let mut local = Grammar::read_str(":x=y\n", &config());
        local.set_backup(backup);
        assert!(local.formation("couple").is_some());
        assert!(local.synonym_body("x").is_some());
    }

    #[test]
    fn raw_tokens_fold_fractions() {
        let g = Grammar::new(&config());
        let (tokens, _) = g.raw_tokens("1/2", false, None, None, None, &[], false).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Fraction);
        assert_eq!(tokens[0].frac.unwrap(), Fraction::new(0, 1, 2));

        let (tokens, _) = g.raw_tokens("1 and 1/2", false, None, None, None, &[], false).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].frac.unwrap(), Fraction::new(1, 1, 2));
    }

    #[test]
    fn raw_tokens_reject_zero_denominator() {
        let g = Grammar::new(&config());
        assert!(g.raw_tokens("1/0", false, None, None, None, &[], false).is_none());
    }

    #[test]
    fn integer_followed_by_and_stays_separate() {
        let g = Grammar::new(&config());
        let (tokens, _) = g.raw_tokens("2 and centers", true, None, None, None, &[], false).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Integer);
        assert_eq!(tokens[1].kind, TokenKind::Word);
        assert_eq!(tokens[2].kind, TokenKind::Word);
    }

    #[test]
    fn unknown_word_fails_user_text_but_not_definitions() {
        let g = Grammar::new(&config());
        assert!(g.raw_tokens("gibberish", false, None, None, None, &[], false).is_none());
        let (tokens, _) = g.raw_tokens("gibberish", true, None, None, None, &[], false).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Word);
        assert!(tokens[0].term.is_none());
    }

    #[test]
    fn tokenize_production_interns_new_words() {
        let mut g = Grammar::new(&config());
        let tokens = g.tokenize_production("swing your partner").unwrap();
        assert!(tokens.iter().all(|t| t.kind == TokenKind::Word && t.term.is_some()));
        assert!(g.lookup_word("swing").is_some());
        // the same word maps to the same term
        let tokens2 = g.tokenize_production("swing").unwrap();
        assert_eq!(tokens2[0].term, tokens.iter().find(|t| t.text == "swing").unwrap().term);
    }

    #[test]
    fn write_contents_round_trips() {
        let g = Grammar::read_str(SMALL_GRAMMAR, &config());
        let text = g.write_contents();
        let g2 = Grammar::read_str(&text, &config());
        assert!(g2.errors().is_empty(), "round trip errors: {:?}", g2.errors());
        assert_eq!(g2.definitions().len(), 1);
        assert_eq!(g2.definitions()[0].productions, g.definitions()[0].productions);
        assert_eq!(g2.formations().len(), 2);
        assert_eq!(g2.synonyms().len(), 1);
        assert_eq!(g2.designators().len(), 1);
    }

    #[test]
    fn pattern_parse_splits_parameters() {
        let p = Pattern::parse("wave");
        assert_eq!(p.formation, "wave");
        assert!(!p.discriminates());
        let p = Pattern::parse("wave $1");
        assert_eq!(p.formation, "wave");
        assert_eq!(p.parameter_list, "$1");
        assert!(p.discriminates());
    }
}
