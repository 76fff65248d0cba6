//! Grammar-file loading, backup chaining, and autocomplete.

use std::io::Write;

use quadrille::grammar::Grammar;
use quadrille::group::Group;
use quadrille::parser;
use quadrille::stage::Context;
use quadrille::{Config, DanceType};

const BASE_GRAMMAR: &str = "\
:spin=quarter right\n\
-- Basic\n\
.walk\n\
walk integer steps\n\
\t>$forward($1/2)\n\
-- Basic\n\
.face_right\n\
quarter right\n\
\t>$face(right, $self)\n\
%%\n\
=couple\n\
a? . a?\n";

const LOCAL_GRAMMAR: &str = "\
-- Plus\n\
.saunter\n\
saunter integer steps\n\
\t>$forward($1/2)\n";

#[test]
fn grammar_loads_from_a_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("calls.grammar");
    let mut f = std::fs::File::create(&path).expect("create");
    f.write_all(BASE_GRAMMAR.as_bytes()).expect("write");
    drop(f);

    let config = Config::default();
    let grammar = Grammar::read(&path, &config).expect("read");
    assert!(grammar.errors().is_empty(), "{:?}", grammar.errors());
    assert_eq!(grammar.definitions().len(), 2);
    assert!(grammar.formation("couple").is_some());
}

#[test]
fn backup_definitions_parse_through_the_local_grammar() {
    let config = Config::default();
    let backup = Grammar::read_str(BASE_GRAMMAR, &config);
    let mut local = Grammar::read_str(LOCAL_GRAMMAR, &config);
    local.set_backup(backup);
    parser::compile_state_machines(&mut local);

    let mut ctx = Context::new(&local, config);
    let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
    // a phrase defined only in the backup still resolves
    let call = parser::parse_call(&mut ctx, home, "walk 2 steps", false, &[], &[]);
    assert!(call.is_some(), "backup production should parse");
    // and so does the local one
    let call = parser::parse_call(&mut ctx, home, "saunter 2 steps", false, &[], &[]);
    assert!(call.is_some(), "local production should parse");
}

#[test]
fn synonyms_expand_inside_call_phrases() {
    let config = Config::default();
    let grammar = Grammar::read_str(BASE_GRAMMAR, &config);
    let mut ctx = Context::new(&grammar, config);
    let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
    // ":spin=quarter right" makes the single word parse as the call
    let call = parser::parse_call(&mut ctx, home, "spin", false, &[], &[]);
    assert!(call.is_some(), "synonym should expand to a full phrase");
}

#[test]
fn round_trip_preserves_parseability() {
    let config = Config::default();
    let grammar = Grammar::read_str(BASE_GRAMMAR, &config);
    let text = grammar.write_contents();
    let again = Grammar::read_str(&text, &config);
    assert!(again.errors().is_empty(), "{:?}", again.errors());
    let mut ctx = Context::new(&again, config);
    let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
    assert!(parser::parse_call(&mut ctx, home, "walk 3 steps", false, &[], &[]).is_some());
}

#[test]
fn completion_suggests_known_productions() {
    let config = Config::default();
    let grammar = Grammar::read_str(BASE_GRAMMAR, &config);
    let mut ctx = Context::new(&grammar, config);
    let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
    let suggestions = parser::parse_partial(&mut ctx, None, "wal", home);
    assert!(
        suggestions.iter().any(|s| s.starts_with("walk")),
        "expected a walk suggestion, got {:?}",
        suggestions
    );
}

#[test]
fn level_filter_hides_high_level_calls_from_completion() {
    let config = Config::default();
    let text = "\
-- Challenge-1\n\
.hard\n\
hardest call\n\
\t>$nothing()\n\
-- Basic\n\
.easy\n\
easy call\n\
\t>$nothing()\n";
    let grammar = Grammar::read_str(text, &config);
    let basic = config.level_value("Basic");
    let mut ctx = Context::with_level(&grammar, config, basic);
    let home = ctx.stage.add_group(Group::home(DanceType::FourCouple));
    let suggestions = parser::parse_partial(&mut ctx, None, "", home);
    assert!(
        suggestions.iter().any(|s| s.contains("easy")),
        "basic call should appear: {:?}",
        suggestions
    );
    assert!(
        !suggestions.iter().any(|s| s.contains("hardest")),
        "challenge call should be filtered: {:?}",
        suggestions
    );
}
