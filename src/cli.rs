//! Command-line interface.
//!
//! Three commands cover the workflow: `check` loads a grammar and
//! reports diagnostics, `run` executes call phrases against a squared
//! set, and `complete` suggests continuations of a partial phrase.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;
use crate::grammar::Grammar;
use crate::group::Group;
use crate::plan;
use crate::stage::Context;

#[derive(Parser)]
#[command(name = "quadrille")]
#[command(about = "Square dance choreography compiler", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Grammar file with call definitions, designators, and diagrams
    #[arg(long, short)]
    pub grammar: PathBuf,

    /// Backup grammar whose definitions the main grammar inherits
    #[arg(long)]
    pub backup: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse the grammar and report diagnostics
    Check,
    /// Run call phrases against a squared set
    Run {
        /// Call phrases, one per argument
        calls: Vec<String>,
        /// Trace parsing, matching, and breathing
        #[arg(long, short)]
        verbose: bool,
    },
    /// Suggest completions for a partial call phrase
    Complete {
        /// The partial phrase
        text: String,
    },
}

fn load(cli: &Cli, config: &Config) -> Result<Grammar, String> {
    let mut grammar =
        Grammar::read(&cli.grammar, config).map_err(|e| format!("{}: {}", cli.grammar.display(), e))?;
    if let Some(backup) = &cli.backup {
        let backup_grammar =
            Grammar::read(backup, config).map_err(|e| format!("{}: {}", backup.display(), e))?;
        grammar.set_backup(backup_grammar);
        crate::parser::compile_state_machines(&mut grammar);
    }
    Ok(grammar)
}

pub fn run_cli() -> Result<(), String> {
    let cli = Cli::parse();
    let mut config = Config::default();
    if let Commands::Run { verbose: true, .. } = &cli.command {
        config.verbose_parsing = true;
        config.verbose_matching = true;
        config.verbose_breathing = true;
    }
    let grammar = load(&cli, &config)?;

    match &cli.command {
        Commands::Check => {
            for e in grammar.errors() {
                println!("{}", e);
            }
            println!(
                "{} definitions, {} designators, {} formations, {} synonyms",
                grammar.definitions().len(),
                grammar.designators().len(),
                grammar.formations().len(),
                grammar.synonyms().len()
            );
            if grammar.has_errors() {
                Err(format!("{} grammar errors", grammar.errors().len()))
            } else {
                Ok(())
            }
        }
        Commands::Run { calls, .. } => {
            let mut ctx = Context::new(&grammar, config);
            let mut group = ctx.stage.add_group(Group::home(ctx.config.dance_type));
            for call in calls {
                match plan::run_call(&mut ctx, group, call) {
                    Ok(outcome) => {
                        println!("{} ({} beats)", call, outcome.beats);
                        let g = ctx.stage.group(outcome.final_group);
                        for d in g.dancers() {
                            println!(
                                "  #{}{} at ({}, {}) facing {:?}",
                                d.couple,
                                match d.gender {
                                    crate::dancer::Gender::Boy => "B",
                                    crate::dancer::Gender::Girl => "G",
                                    crate::dancer::Gender::Unspecified => "?",
                                },
                                d.x,
                                d.y,
                                d.facing
                            );
                        }
                        // the result of one call is the start of the next
                        let dancers = g.dancers().to_vec();
                        let geometry = g.geometry();
                        ctx.reset();
                        group = ctx.stage.add_group(Group::from_dancers(geometry, dancers));
                    }
                    Err(e) => return Err(format!("{}: {}", call, e)),
                }
            }
            Ok(())
        }
        Commands::Complete { text } => {
            let mut ctx = Context::new(&grammar, config);
            let home = ctx.stage.add_group(Group::home(ctx.config.dance_type));
            for suggestion in crate::parser::parse_partial(&mut ctx, None, text, home) {
                println!("{}", suggestion);
            }
            Ok(())
        }
    }
}
