//! Rule-based payload obfuscation
//!
//! Outgoing harvest payloads are rewritten against an ordered rule list
//! before transmission, removing sensitive substrings (tokens, emails,
//! internal hostnames) from everything that leaves the agent.
//!
//! Rules fail closed: a rule set containing a single invalid pattern is
//! rejected wholesale, and a previously installed valid set stays active.
//! An obfuscator never ships unobfuscated output because its configuration
//! was malformed.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One obfuscation rule from configuration.
///
/// Rules are ordered; each rule rewrites the output of the previous one, so
/// list order decides the final text when patterns overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationRule {
    /// Regular expression to match
    pub pattern: String,

    /// Replacement text (regex capture groups like `$1` are honored)
    pub replacement: String,

    /// Disabled rules stay in the list but are skipped
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Compiled rule: the source rule plus its validated regex.
#[derive(Debug, Clone)]
struct CompiledRule {
    regex: Regex,
    replacement: String,
    enabled: bool,
}

/// Applies an ordered, validated rule list to outgoing payload text.
#[derive(Debug, Clone, Default)]
pub struct Obfuscator {
    rules: Vec<CompiledRule>,
    enabled_count: usize,
}

impl Obfuscator {
    /// Compile and install a rule set.
    ///
    /// Fails closed: any invalid pattern rejects the entire set. Callers that
    /// hold a previously compiled `Obfuscator` keep using it on error.
    pub fn compile(rules: &[ObfuscationRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = Regex::new(&rule.pattern).map_err(|e| {
                Error::InvalidRuleSet(format!("pattern {:?}: {}", rule.pattern, e))
            })?;
            compiled.push(CompiledRule {
                regex,
                replacement: rule.replacement.clone(),
                enabled: rule.enabled,
            });
        }

        let enabled_count = compiled.iter().filter(|r| r.enabled).count();
        Ok(Self {
            rules: compiled,
            enabled_count,
        })
    }

    /// Validate a rule set without installing it.
    pub fn validate_rules(rules: &[ObfuscationRule]) -> bool {
        rules
            .iter()
            .all(|rule| Regex::new(&rule.pattern).is_ok())
    }

    /// True when at least one enabled rule exists.
    ///
    /// Callers can skip the rewrite (and the copy it implies) entirely when
    /// this returns false.
    pub fn should_obfuscate(&self) -> bool {
        self.enabled_count > 0
    }

    /// Rewrite `payload` through every enabled rule in list order.
    ///
    /// Each rule replaces all non-overlapping matches in the output of the
    /// previous rule. The input is never mutated.
    pub fn obfuscate(&self, payload: &str) -> String {
        if !self.should_obfuscate() {
            return payload.to_string();
        }

        let mut output = payload.to_string();
        for rule in self.rules.iter().filter(|r| r.enabled) {
            output = rule
                .regex
                .replace_all(&output, rule.replacement.as_str())
                .into_owned();
        }
        output
    }
}
