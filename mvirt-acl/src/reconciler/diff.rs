//! Diffing of old and new rule declarations.
//!
//! Two rules are equal when their declared fields are equal; remote ids are
//! ignored. The default [`DiffMode::Positional`] compares the two sequences
//! index by index and only up to the shorter length, so trailing entries of
//! the longer sequence are neither added nor removed; old trailing entries are
//! reported as `ignored` so they stay tracked. [`DiffMode::Set`]
//! compares both sequences as multisets instead.

use tracing::warn;

use crate::config::DiffMode;
use crate::rule::LogicalRule;

/// Result of comparing two declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    /// Old rules (with their ids) no longer declared, with their position
    /// in the old sequence
    pub removed: Vec<(usize, LogicalRule)>,
    /// New rules with their position in the new sequence
    pub added: Vec<(usize, LogicalRule)>,
    /// Old rules (with their ids) still declared, with their position in the
    /// new sequence
    pub unchanged: Vec<(usize, LogicalRule)>,
    /// Old rules past the compared range (positional mode only)
    pub ignored: Vec<LogicalRule>,
}

impl RuleDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Compare `old` against `new`.
pub fn diff_rules(old: &[LogicalRule], new: &[LogicalRule], mode: DiffMode) -> RuleDiff {
    match mode {
        DiffMode::Positional => positional(old, new),
        DiffMode::Set => set_based(old, new),
    }
}

fn positional(old: &[LogicalRule], new: &[LogicalRule]) -> RuleDiff {
    let mut diff = RuleDiff::default();

    for (index, (o, n)) in old.iter().zip(new).enumerate() {
        if o.same_declaration(n) {
            diff.unchanged.push((index, o.clone()));
        } else {
            diff.removed.push((index, o.clone()));
            diff.added.push((index, n.clone()));
        }
    }
    diff.ignored = old.iter().skip(new.len()).cloned().collect();

    match truncation(old.len(), new.len()) {
        Some(Truncation::OldKept(count)) => warn!(
            "Positional diff leaves {} old rules beyond index {} untouched",
            count,
            new.len()
        ),
        Some(Truncation::NewSkipped(count)) => warn!(
            "Positional diff skips {} new rules beyond index {}",
            count,
            old.len()
        ),
        None => {}
    }

    diff
}

/// Which side of a positional comparison has entries past the shorter one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Truncation {
    /// Old rules that stay tracked without being compared
    OldKept(usize),
    /// New rules that are neither created nor tracked
    NewSkipped(usize),
}

fn truncation(old_len: usize, new_len: usize) -> Option<Truncation> {
    if old_len > new_len {
        Some(Truncation::OldKept(old_len - new_len))
    } else if new_len > old_len {
        Some(Truncation::NewSkipped(new_len - old_len))
    } else {
        None
    }
}

fn set_based(old: &[LogicalRule], new: &[LogicalRule]) -> RuleDiff {
    let mut diff = RuleDiff::default();
    let mut matched = vec![false; new.len()];

    for (old_index, o) in old.iter().enumerate() {
        let hit = new
            .iter()
            .enumerate()
            .find(|(i, n)| !matched[*i] && o.same_declaration(n))
            .map(|(i, _)| i);
        match hit {
            Some(i) => {
                matched[i] = true;
                diff.unchanged.push((i, o.clone()));
            }
            None => diff.removed.push((old_index, o.clone())),
        }
    }

    diff.added = new
        .iter()
        .enumerate()
        .filter(|(i, _)| !matched[*i])
        .map(|(i, n)| (i, n.clone()))
        .collect();

    diff
}
