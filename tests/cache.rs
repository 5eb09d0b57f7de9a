// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Result;
use rulebase::*;

struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    fn new(name: &str) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("rulebase-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("rules"))?;
        fs::create_dir_all(dir.join("shm"))?;
        Ok(Self { dir })
    }

    fn config(&self) -> EngineConfig {
        EngineConfig {
            rule_base_dir: self.dir.join("rules"),
            cache_dir: Some(self.dir.join("shm")),
            ..EngineConfig::default()
        }
    }

    fn write_rules(&self, name: &str, text: &str) -> Result<()> {
        fs::write(self.dir.join("rules").join(format!("{name}.re")), text)?;
        Ok(())
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

const CORE: &str = r#"
test(*X) {
  *Y = *X + 1;
  writeLine("stdout", *Y);
}
"#;

#[test]
fn unchanged_files_are_compiled_once() -> Result<()> {
    let scratch = Scratch::new("once")?;
    scratch.write_rules("core", CORE)?;
    let counter = Rc::new(BuildCount::default());
    let mut cache = RuleCache::new(scratch.config(), Box::new(MemorySegment::new()), counter.clone());

    let first = cache.load("core")?;
    let second = cache.load("core")?;
    assert_eq!(counter.count(), 1);
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(first.set_id(), "core");
    Ok(())
}

#[test]
fn modified_files_are_recompiled() -> Result<()> {
    let scratch = Scratch::new("modified")?;
    scratch.write_rules("core", CORE)?;
    let counter = Rc::new(BuildCount::default());
    let mut cache = RuleCache::new(scratch.config(), Box::new(MemorySegment::new()), counter.clone());

    cache.load("core")?;
    scratch.write_rules("core", &format!("{CORE}\nextra {{ nop; }}\n"))?;
    let base = cache.load("core")?;
    assert_eq!(counter.count(), 2);
    assert_eq!(base.names_in_tier(Tier::Core).len(), 2);
    Ok(())
}

#[test]
fn set_id_lists_several_files() -> Result<()> {
    let scratch = Scratch::new("several")?;
    scratch.write_rules("core", CORE)?;
    scratch.write_rules("site", "site { writeLine(\"stdout\", \"site\"); }\n")?;
    let counter = Rc::new(BuildCount::default());
    let mut cache = RuleCache::new(scratch.config(), Box::new(MemorySegment::new()), counter.clone());

    let base = cache.load("core,site")?;
    assert_eq!(base.names_in_tier(Tier::Core).len(), 2);

    // Each set id is compiled on its own.
    cache.load("core")?;
    assert_eq!(counter.count(), 2);
    Ok(())
}

#[test]
fn second_worker_reads_the_shared_segment() -> Result<()> {
    let scratch = Scratch::new("shared")?;
    scratch.write_rules("core", CORE)?;
    let config = scratch.config();

    let first_count = Rc::new(BuildCount::default());
    let mut first = RuleCache::new(config.clone(), Box::new(FileSegment::new(&config)), first_count.clone());
    first.load("core")?;
    assert_eq!(first_count.count(), 1);

    let second_count = Rc::new(BuildCount::default());
    let mut second = RuleCache::new(config.clone(), Box::new(FileSegment::new(&config)), second_count.clone());
    let base = second.load("core")?;
    assert_eq!(second_count.count(), 0);
    assert_eq!(base.names_in_tier(Tier::Core).len(), 1);
    Ok(())
}

#[test]
fn stale_segment_is_rebuilt() -> Result<()> {
    let scratch = Scratch::new("stale")?;
    scratch.write_rules("core", CORE)?;
    let config = scratch.config();

    let mut first = RuleCache::new(config.clone(), Box::new(FileSegment::new(&config)), Rc::new(NoCount));
    first.load("core")?;

    scratch.write_rules("core", "other { nop; }\n")?;
    let counter = Rc::new(BuildCount::default());
    let mut second = RuleCache::new(config.clone(), Box::new(FileSegment::new(&config)), counter.clone());
    let base = second.load("core")?;
    assert_eq!(counter.count(), 1);
    assert_eq!(base.names_in_tier(Tier::Core), vec![Rc::<str>::from("other")]);
    Ok(())
}

#[test]
fn editing_an_included_file_triggers_a_rebuild() -> Result<()> {
    let scratch = Scratch::new("included")?;
    scratch.write_rules("core", "@include helper\n")?;
    scratch.write_rules("helper", "greet { writeLine(\"stdout\", \"old\"); }\n")?;
    let config = scratch.config();
    let counter = Rc::new(BuildCount::default());
    let cache = RuleCache::new(config.clone(), Box::new(MemorySegment::new()), counter.clone());
    let mut ctx = EngineContext::with_cache(config, cache);

    ctx.load("core")?;
    assert_eq!(ctx.apply_hook("greet", &mut []).stdout, "old\n");
    assert_eq!(counter.count(), 1);

    scratch.write_rules("helper", "greet { writeLine(\"stdout\", \"new\"); }\n")?;
    ctx.load("core")?;
    assert_eq!(counter.count(), 2);
    assert_eq!(ctx.apply_hook("greet", &mut []).stdout, "new\n");
    Ok(())
}

#[test]
fn included_files_are_checked_by_other_workers() -> Result<()> {
    let scratch = Scratch::new("included-shared")?;
    scratch.write_rules("core", "@include helper\n")?;
    scratch.write_rules("helper", "one { nop; }\n")?;
    let config = scratch.config();

    let mut first = RuleCache::new(config.clone(), Box::new(FileSegment::new(&config)), Rc::new(NoCount));
    let base = first.load("core")?;
    assert_eq!(base.files(), vec![config.rule_file("core"), config.rule_file("helper")]);

    scratch.write_rules("helper", "one { nop; }\ntwo { nop; }\n")?;
    let counter = Rc::new(BuildCount::default());
    let mut second = RuleCache::new(config.clone(), Box::new(FileSegment::new(&config)), counter.clone());
    let base = second.load("core")?;
    assert_eq!(counter.count(), 1);
    assert_eq!(base.names_in_tier(Tier::Core).len(), 2);
    Ok(())
}

#[test]
fn include_cycles_are_parse_errors() -> Result<()> {
    let scratch = Scratch::new("cycle")?;
    scratch.write_rules("a", "@include b\nfromA { nop; }\n")?;
    scratch.write_rules("b", "@include a\nfromB { nop; }\n")?;
    let mut cache = RuleCache::new(scratch.config(), Box::new(MemorySegment::new()), Rc::new(NoCount));
    let err = match cache.load("a") {
        Ok(_) => anyhow::bail!("cyclic include was accepted"),
        Err(e) => e,
    };
    assert_eq!(RuleError::from_anyhow(&err).code(), codes::RE_PARSER_ERROR);
    assert!(err.to_string().contains("circular @include of `a`"), "{err}");
    Ok(())
}

#[test]
fn included_files_respect_the_size_limit() -> Result<()> {
    let scratch = Scratch::new("include-size")?;
    scratch.write_rules("core", "@include big\n")?;
    scratch.write_rules("big", &"# padding\n".repeat(64))?;
    let config = EngineConfig {
        max_rule_text: 100,
        ..scratch.config()
    };
    let mut cache = RuleCache::new(config, Box::new(MemorySegment::new()), Rc::new(NoCount));
    let code = cache.load("core").err().map(|e| RuleError::from_anyhow(&e).code());
    assert_eq!(code, Some(codes::RE_BUFFER_OVERFLOW));
    Ok(())
}

#[test]
fn missing_rule_file() -> Result<()> {
    let scratch = Scratch::new("missing")?;
    let mut cache = RuleCache::new(scratch.config(), Box::new(MemorySegment::new()), Rc::new(NoCount));
    let err = cache.load("absent").err();
    let code = err.map(|e| RuleError::from_anyhow(&e).code());
    assert_eq!(code, Some(codes::RE_FILE_STAT_ERROR));
    Ok(())
}

#[test]
fn engine_runs_hooks_of_a_loaded_rule_base() -> Result<()> {
    let scratch = Scratch::new("engine")?;
    scratch.write_rules("core", CORE)?;
    let config = scratch.config();
    let cache = RuleCache::new(config.clone(), Box::new(MemorySegment::new()), Rc::new(NoCount));
    let mut ctx = EngineContext::with_cache(config, cache);
    ctx.load("core")?;

    let mut bindings = [Binding::new("*X", 5)];
    let outcome = ctx.apply_hook("test", &mut bindings);
    assert_eq!(outcome.status, 0);
    assert_eq!(outcome.stdout, "6\n");
    Ok(())
}
