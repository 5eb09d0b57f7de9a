// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::lexer::Dialect;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Engine settings. Every field has a default, so a configuration file only
/// needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory holding `<name>.re` rule-base files.
    pub rule_base_dir: PathBuf,
    /// Directory of the shared compiled-rule segment. `/dev/shm` is used
    /// when unset and present.
    pub cache_dir: Option<PathBuf>,
    pub segment_name: String,
    /// Byte limit of one evaluation region.
    pub region_limit: usize,
    /// Footprint above which the environment is compacted between loop
    /// iterations.
    pub compaction_threshold: usize,
    /// Largest accepted rule text, in bytes.
    pub max_rule_text: usize,
    pub max_call_depth: usize,
    pub default_dialect: Dialect,
    /// Emit per-rule trace events.
    pub logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rule_base_dir: PathBuf::from("."),
            cache_dir: None,
            segment_name: "rulebase".to_string(),
            region_limit: 64 * 1024 * 1024,
            compaction_threshold: 1024 * 1024,
            max_rule_text: 1024 * 1024,
            max_call_depth: 1000,
            default_dialect: Dialect::Auto,
            logging: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a `.json` file, or a `.yaml`/`.yml` file when built with the
    /// `yaml` feature.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => bail!("Failed to read {}. {e}", path.display()),
        };
        match path.extension().and_then(|e| e.to_str()) {
            #[cfg(feature = "yaml")]
            Some("yaml" | "yml") => Self::from_yaml_str(&contents),
            _ => Self::from_json_str(&contents),
        }
    }

    /// Directory of the shared segment.
    pub fn segment_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(d) => d.clone(),
            None => {
                let shm = Path::new("/dev/shm");
                if shm.is_dir() {
                    shm.to_path_buf()
                } else {
                    std::env::temp_dir()
                }
            }
        }
    }

    /// Path of the rule file `name` of a set id.
    pub fn rule_file(&self, name: &str) -> PathBuf {
        self.rule_base_dir.join(format!("{name}.re"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() -> Result<()> {
        let c = EngineConfig::from_json_str(r#"{"max_call_depth": 10, "default_dialect": "legacy"}"#)?;
        assert_eq!(c.max_call_depth, 10);
        assert_eq!(c.default_dialect, Dialect::Legacy);
        assert_eq!(c.segment_name, EngineConfig::default().segment_name);
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(EngineConfig::from_json_str(r#"{"max_depth": 10}"#).is_err());
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn yaml_config() -> Result<()> {
        let c = EngineConfig::from_yaml_str("rule_base_dir: /etc/rules\nlogging: false\n")?;
        assert_eq!(c.rule_base_dir, PathBuf::from("/etc/rules"));
        assert!(!c.logging);
        Ok(())
    }
}
