// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rulebase::unstable::{Ast, Lexer, Source, SymbolTable, TokenKind};
use rulebase::{Binding, EngineConfig, EngineContext, Tier, Value};
use tracing_subscriber::EnvFilter;

fn read_source(file: &str) -> Result<Source> {
    let contents = std::fs::read_to_string(file).with_context(|| format!("Failed to read {file}"))?;
    Source::from_contents(file.to_string(), contents)
}

fn load_config(config: &Option<String>) -> Result<EngineConfig> {
    match config {
        Some(file) => EngineConfig::from_file(file),
        None => Ok(EngineConfig::default()),
    }
}

/// Context with the rules of `files` in the core tier, or of `set_id`
/// through the compiled-rule cache.
fn context(config: EngineConfig, files: &[String], set_id: &Option<String>) -> Result<EngineContext> {
    let mut ctx = EngineContext::new(config);
    if let Some(set_id) = set_id {
        ctx.load(set_id)?;
    }
    for file in files {
        let contents = std::fs::read_to_string(file).with_context(|| format!("Failed to read {file}"))?;
        ctx.add_rules(&contents, Tier::Core)?;
    }
    Ok(ctx)
}

/// `label=value`, where value is JSON or a plain string.
fn parse_binding(text: &str) -> Result<Binding> {
    let Some((label, value)) = text.split_once('=') else {
        bail!("invalid binding `{text}`. Expected label=value.");
    };
    Ok(Binding::new(label, Value::from_input(value)))
}

fn rules_lex(file: String, verbose: bool) -> Result<()> {
    let source = read_source(&file)?;
    let mut lexer = Lexer::new(&source);
    loop {
        let token = lexer.next_token()?;
        if token.kind == TokenKind::Eof {
            break;
        }
        if verbose {
            println!("{}", token.span.message("", ""));
        }
        println!("{:?} {:?}", token.kind, token.span);
    }
    Ok(())
}

fn rules_parse(file: String, config: EngineConfig) -> Result<()> {
    let source = read_source(&file)?;
    let mut ast = Ast::with_limit(config.region_limit);
    let mut symbols = SymbolTable::new();
    let rules = rulebase::unstable::parse_rule_base(&source, config.default_dialect, &mut symbols, &mut ast)?;
    for r in rules {
        println!("{}", ast.dump(r.node));
    }
    Ok(())
}

fn rules_check(file: String, config: EngineConfig) -> Result<()> {
    let source = read_source(&file)?;
    let base = rulebase::CompiledRuleBase::from_source(&source, &config)?;
    print!("{}", base.render());
    println!("# {} rules type-checked", base.rules().len());
    Ok(())
}

fn rules_eval(ctx: &mut EngineContext, text: String) -> Result<()> {
    let r = ctx.eval(&text)?;
    print!("{}", r.stdout);
    eprint!("{}", r.stderr);
    println!("{}", r.value.to_json_str()?);
    Ok(())
}

fn rules_hook(ctx: &mut EngineContext, name: String, inputs: &[String]) -> Result<()> {
    let mut bindings = inputs.iter().map(|i| parse_binding(i)).collect::<Result<Vec<_>>>()?;
    let outcome = ctx.apply_hook(&name, &mut bindings);
    print!("{}", outcome.stdout);
    eprint!("{}", outcome.stderr);
    for b in &bindings {
        println!("{} = {}", b.label, b.value);
    }
    if !outcome.errors.is_empty() {
        eprintln!("{}", outcome.errors);
    }
    println!("status {}", outcome.status);
    Ok(())
}

#[derive(Subcommand)]
enum RulesCommand {
    /// Tokenize a rule file.
    Lex {
        /// Rule file.
        file: String,

        /// Verbose output.
        #[arg(long, short)]
        verbose: bool,
    },

    /// Parse a rule file.
    Parse {
        file: String,
    },

    /// Parse and type-check a rule file.
    Check {
        file: String,
    },

    /// Evaluate an action sequence.
    Eval {
        /// Rule files.
        #[arg(long, short, value_name = "rules.re")]
        rules: Vec<String>,

        /// Rule base to load through the compiled-rule cache.
        #[arg(long, short)]
        set_id: Option<String>,

        /// Actions, such as `writeLine("stdout", 1 + 2)`.
        text: String,
    },

    /// Apply the rules of a hook.
    Hook {
        #[arg(long, short, value_name = "rules.re")]
        rules: Vec<String>,

        #[arg(long, short)]
        set_id: Option<String>,

        /// Bindings, as label=value. `$` labels are session variables.
        #[arg(long, short, value_name = "label=value")]
        input: Vec<String>,

        /// Hook name.
        name: String,
    },
}

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration. json or yaml.
    #[arg(long, short, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: RulesCommand,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("RULEBASE_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    match cli.command {
        RulesCommand::Lex { file, verbose } => rules_lex(file, verbose),
        RulesCommand::Parse { file } => rules_parse(file, config),
        RulesCommand::Check { file } => rules_check(file, config),
        RulesCommand::Eval {
            rules,
            set_id,
            text,
        } => rules_eval(&mut context(config, &rules, &set_id)?, text),
        RulesCommand::Hook {
            rules,
            set_id,
            input,
            name,
        } => rules_hook(&mut context(config, &rules, &set_id)?, name, &input),
    }
}
