//! Merge policies applied by the session coordinator
//!
//! A policy decides what content a submission produces when the document has
//! moved on since the submitter's base revision. Whatever it returns, the
//! coordinator advances the revision by one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which merge policy a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Submitted content replaces current content
    #[default]
    LastAppliedWins,
    /// Non-overlapping concurrent splices are combined
    Splice,
}

impl MergeStrategy {
    /// Build the policy object for this strategy
    pub fn policy(self) -> Arc<dyn MergePolicy> {
        match self {
            MergeStrategy::LastAppliedWins => Arc::new(LastAppliedWins),
            MergeStrategy::Splice => Arc::new(SpliceMerge::default()),
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStrategy::LastAppliedWins => write!(f, "last-applied-wins"),
            MergeStrategy::Splice => write!(f, "splice"),
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "last-applied-wins" | "lww" | "overwrite" => Ok(MergeStrategy::LastAppliedWins),
            "splice" => Ok(MergeStrategy::Splice),
            _ => Err(format!("Unknown merge strategy: {}", s)),
        }
    }
}

/// Inputs to a merge decision
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    pub base_revision: u64,
    /// Content at `base_revision`, if the session still remembers it
    pub base: Option<&'a str>,
    pub current_revision: u64,
    pub current: &'a str,
    pub submitted: &'a str,
}

impl MergeInput<'_> {
    pub fn is_concurrent(&self) -> bool {
        self.base_revision < self.current_revision
    }
}

/// Outcome of a merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub content: String,
    /// A concurrent edit was discarded in favour of the submission
    pub overwrote: bool,
}

/// Pluggable merge policy behind `submit`
pub trait MergePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// How many past revisions the session must remember for `MergeInput::base`
    fn history_depth(&self) -> usize {
        0
    }

    fn merge(&self, input: MergeInput<'_>) -> Merged;
}

/// Accept and overwrite
#[derive(Debug, Clone, Copy, Default)]
pub struct LastAppliedWins;

impl MergePolicy for LastAppliedWins {
    fn name(&self) -> &'static str {
        "last-applied-wins"
    }

    fn merge(&self, input: MergeInput<'_>) -> Merged {
        Merged {
            content: input.submitted.to_string(),
            overwrote: input.is_concurrent() && input.current != input.submitted,
        }
    }
}

/// Three-way merge of single contiguous splices
///
/// Each side's change against the base is reduced to one splice (common
/// prefix and suffix stripped). Disjoint splices are both applied; anything
/// else falls back to last-applied-wins.
#[derive(Debug, Clone, Copy)]
pub struct SpliceMerge {
    pub history: usize,
}

impl Default for SpliceMerge {
    fn default() -> Self {
        Self { history: 64 }
    }
}

/// Replace `base[start..end]` (char indices) with `insert`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Splice {
    start: usize,
    end: usize,
    insert: Vec<char>,
}

impl Splice {
    fn between(base: &[char], other: &[char]) -> Option<Splice> {
        if base == other {
            return None;
        }

        let prefix = base
            .iter()
            .zip(other.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = base.len().min(other.len()) - prefix;
        let suffix = base
            .iter()
            .rev()
            .zip(other.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        Some(Splice {
            start: prefix,
            end: base.len() - suffix,
            insert: other[prefix..other.len() - suffix].to_vec(),
        })
    }

    fn disjoint(&self, other: &Splice) -> bool {
        if self.start == other.start {
            return false;
        }
        self.end <= other.start || other.end <= self.start
    }
}

impl MergePolicy for SpliceMerge {
    fn name(&self) -> &'static str {
        "splice"
    }

    fn history_depth(&self) -> usize {
        self.history
    }

    fn merge(&self, input: MergeInput<'_>) -> Merged {
        let base = match input.base {
            Some(base) if input.is_concurrent() => base,
            _ => return LastAppliedWins.merge(input),
        };

        let base: Vec<char> = base.chars().collect();
        let current: Vec<char> = input.current.chars().collect();
        let submitted: Vec<char> = input.submitted.chars().collect();

        let theirs = match Splice::between(&base, &current) {
            Some(splice) => splice,
            None => return LastAppliedWins.merge(input),
        };
        let ours = match Splice::between(&base, &submitted) {
            Some(splice) => splice,
            // The submission changed nothing relative to its base
            None => {
                return Merged {
                    content: input.current.to_string(),
                    overwrote: false,
                }
            }
        };

        if !ours.disjoint(&theirs) {
            return LastAppliedWins.merge(input);
        }

        // Apply the later splice first so earlier indices stay valid
        let (first, second) = if ours.start > theirs.start {
            (ours, theirs)
        } else {
            (theirs, ours)
        };
        let mut merged = base;
        merged.splice(first.start..first.end, first.insert);
        merged.splice(second.start..second.end, second.insert);

        Merged {
            content: merged.into_iter().collect(),
            overwrote: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(
        base_revision: u64,
        base: Option<&'a str>,
        current_revision: u64,
        current: &'a str,
        submitted: &'a str,
    ) -> MergeInput<'a> {
        MergeInput {
            base_revision,
            base,
            current_revision,
            current,
            submitted,
        }
    }

    #[test]
    fn test_last_applied_wins_replaces() {
        let merged = LastAppliedWins.merge(input(3, None, 3, "old", "new"));
        assert_eq!(merged.content, "new");
        assert!(!merged.overwrote);
    }

    #[test]
    fn test_last_applied_wins_tags_concurrent_overwrite() {
        let merged = LastAppliedWins.merge(input(1, None, 2, "Hello there", "Hello world"));
        assert_eq!(merged.content, "Hello world");
        assert!(merged.overwrote);
    }

    #[test]
    fn test_splice_merges_disjoint_edits() {
        let merged = SpliceMerge::default().merge(input(
            1,
            Some("Hello world"),
            2,
            "Hello brave world",
            "Hello world!",
        ));
        assert_eq!(merged.content, "Hello brave world!");
        assert!(!merged.overwrote);
    }

    #[test]
    fn test_splice_merges_when_submission_is_earlier_in_text() {
        let merged = SpliceMerge::default().merge(input(
            4,
            Some("abc def ghi"),
            5,
            "abc def GHI",
            "ABC def ghi",
        ));
        assert_eq!(merged.content, "ABC def GHI");
    }

    #[test]
    fn test_splice_overlap_falls_back_to_overwrite() {
        let merged = SpliceMerge::default().merge(input(
            1,
            Some("Hello world"),
            2,
            "Hello there",
            "Hello friend",
        ));
        assert_eq!(merged.content, "Hello friend");
        assert!(merged.overwrote);
    }

    #[test]
    fn test_splice_without_base_overwrites() {
        let merged = SpliceMerge::default().merge(input(1, None, 9, "current", "mine"));
        assert_eq!(merged.content, "mine");
        assert!(merged.overwrote);
    }

    #[test]
    fn test_splice_handles_multibyte_text() {
        let merged = SpliceMerge::default().merge(input(
            1,
            Some("héllo wörld"),
            2,
            "héllo wörld ✓",
            "¡héllo wörld",
        ));
        assert_eq!(merged.content, "¡héllo wörld ✓");
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("lww".parse::<MergeStrategy>().unwrap(), MergeStrategy::LastAppliedWins);
        assert_eq!("splice".parse::<MergeStrategy>().unwrap(), MergeStrategy::Splice);
        assert!("ot".parse::<MergeStrategy>().is_err());
    }
}
