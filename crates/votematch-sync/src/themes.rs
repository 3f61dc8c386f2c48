use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const BUILTIN_RULES: &str = include_str!("../../../rules/themes.yaml");

#[derive(Debug, Clone, Deserialize)]
struct ThemeRulesFile {
    #[allow(dead_code)]
    version: u32,
    fallback: String,
    #[serde(default)]
    rules: Vec<ThemeRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct ThemeRule {
    theme: String,
    contains_any: Vec<String>,
}

/// Priority-ordered mapping from upstream topic labels to one display theme.
#[derive(Debug, Clone)]
pub struct ThemeRules {
    fallback: String,
    rules: Vec<ThemeRule>,
}

impl ThemeRules {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: ThemeRulesFile = serde_yaml::from_str(yaml).context("parsing theme rules")?;
        Ok(Self {
            fallback: file.fallback,
            rules: file
                .rules
                .into_iter()
                .map(|r| ThemeRule {
                    theme: r.theme,
                    contains_any: r.contains_any.iter().map(|n| n.to_lowercase()).collect(),
                })
                .collect(),
        })
    }

    /// Rules shipped in the repository's `rules/themes.yaml` at build time.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_RULES)
    }

    /// `themes.yaml` from `rules_dir`, or the built-in rules when the file is absent.
    pub fn from_rules_dir(rules_dir: &Path) -> Result<Self> {
        let path = rules_dir.join("themes.yaml");
        if !path.exists() {
            tracing::warn!(path = %path.display(), "theme rules not found; using built-in rules");
            return Self::builtin();
        }
        let yaml = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    pub fn classify(&self, topics: &[String]) -> &str {
        if topics.is_empty() {
            return &self.fallback;
        }
        let text = topics.join(" ").to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.contains_any.iter().any(|needle| text.contains(needle.as_str())))
            .map(|rule| rule.theme.as_str())
            .unwrap_or(&self.fallback)
    }

    /// All themes in rule order, fallback last.
    pub fn themes(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.rules.iter().map(|r| r.theme.as_str()).collect();
        out.push(&self.fallback);
        out
    }
}
