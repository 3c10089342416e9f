//! Parameter key rewriting.
//!
//! Checkpoint conversion starts by translating every parameter name of the
//! original checkpoint into this library's naming scheme. The translation is
//! an ordered table of regex rules applied to a newline-joined corpus of all
//! keys at once, so a rule sees the output of every rule before it and
//! anchoring applies per key line.
//!
//! Policy: a key matched by no rule passes through unchanged; a key matched
//! by a [`RuleAction::Drop`] rule is removed from the output mapping. The
//! output always has exactly one entry per input key, in input order.

use crate::error::{GraftError, Result};
use regex::{Captures, Regex};

/// Replacement half of a rewrite rule.
#[derive(Clone)]
pub enum RuleAction {
    /// Static template with `$n` back-references.
    Template(String),
    /// Derived name computed from the captures, e.g. integer-indexed layer
    /// renumbering.
    Rename(fn(&Captures) -> String),
    /// Delete the matched key from the converted state dict.
    Drop,
}

impl std::fmt::Debug for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Template(t) => f.debug_tuple("Template").field(t).finish(),
            Self::Rename(_) => f.debug_tuple("Rename").field(&"<fn>").finish(),
            Self::Drop => write!(f, "Drop"),
        }
    }
}

/// A single ordered rewrite rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    action: RuleAction,
}

impl Rule {
    /// Rule substituting a static template (supports `$1`-style groups).
    pub fn template(pattern: &str, replacement: &str) -> Result<Self> {
        Ok(Self {
            pattern: compile(pattern)?,
            action: RuleAction::Template(replacement.to_string()),
        })
    }

    /// Rule substituting a name derived from the captures.
    pub fn rename(pattern: &str, derive: fn(&Captures) -> String) -> Result<Self> {
        Ok(Self {
            pattern: compile(pattern)?,
            action: RuleAction::Rename(derive),
        })
    }

    /// Rule deleting every key it matches.
    pub fn drop(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: compile(pattern)?,
            action: RuleAction::Drop,
        })
    }

    /// The source pattern of this rule.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| GraftError::Checkpoint(format!("invalid mapping pattern {pattern:?}: {e}")))
}

/// Ordered table of rewrite rules.
///
/// Order is semantically significant: each rule rewrites the running corpus,
/// so later rules operate on the output of earlier ones.
#[derive(Debug, Clone, Default)]
pub struct KeyMapping {
    rules: Vec<Rule>,
}

impl KeyMapping {
    /// Create a mapping from an ordered rule list.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Number of rules in the table.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite a full key list in one pass.
    ///
    /// Joins the keys with newlines, folds the rule table over the blob and
    /// zips the result back to the original keys positionally.
    pub fn apply(&self, keys: &[String]) -> RenameMap {
        if keys.is_empty() {
            return RenameMap::default();
        }

        let old_text = keys.join("\n");
        let mut new_text = old_text.clone();
        for rule in &self.rules {
            new_text = match &rule.action {
                RuleAction::Template(t) => {
                    rule.pattern.replace_all(&new_text, t.as_str()).into_owned()
                }
                RuleAction::Rename(derive) => rule
                    .pattern
                    .replace_all(&new_text, |caps: &Captures| derive(caps))
                    .into_owned(),
                // A dropped key leaves an empty line so positions stay aligned.
                RuleAction::Drop => rule.pattern.replace_all(&new_text, "").into_owned(),
            };
        }

        let entries = old_text
            .split('\n')
            .zip(new_text.split('\n'))
            .map(|(old, new)| {
                let new = if new.is_empty() {
                    None
                } else {
                    Some(new.to_string())
                };
                (old.to_string(), new)
            })
            .collect();

        RenameMap { entries }
    }
}

/// Order-preserving result of applying a [`KeyMapping`].
///
/// Each original key maps to `Some(new_name)` or `None` (dropped).
#[derive(Debug, Clone, Default)]
pub struct RenameMap {
    entries: Vec<(String, Option<String>)>,
}

impl RenameMap {
    /// Look up the rewritten name for an original key.
    ///
    /// Outer `None` means the key was never in the input; inner `None` means
    /// it was dropped by the table.
    pub fn get(&self, old: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|(k, _)| k == old)
            .map(|(_, v)| v.as_deref())
    }

    /// Iterate entries in original key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Number of entries (equals the input key count).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
