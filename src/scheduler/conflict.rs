//! Per-kind conflict and supersede rules.

use crate::error::{ArbiterError, ArbiterResult};
use crate::instruction::InstructionKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Rule attached to one instruction kind.
///
/// `conflicts_with` kinds are arbitrated by producer and instruction
/// priority. `supersedes` kinds are replaced unconditionally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRule {
    #[serde(default)]
    pub conflicts_with: BTreeSet<InstructionKind>,
    #[serde(default)]
    pub supersedes: BTreeSet<InstructionKind>,
}

impl ConflictRule {
    pub fn conflicting(kinds: impl IntoIterator<Item = InstructionKind>) -> Self {
        Self {
            conflicts_with: kinds.into_iter().collect(),
            supersedes: BTreeSet::new(),
        }
    }

    pub fn superseding(kinds: impl IntoIterator<Item = InstructionKind>) -> Self {
        Self {
            conflicts_with: BTreeSet::new(),
            supersedes: kinds.into_iter().collect(),
        }
    }
}

/// Conflict rules for every kind. Kinds without a rule never conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictTable {
    rules: BTreeMap<InstructionKind, ConflictRule>,
}

impl ConflictTable {
    /// A table with no rules at all.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Build a table and reject it if `conflicts_with` is not symmetric.
    pub fn from_rules(rules: BTreeMap<InstructionKind, ConflictRule>) -> ArbiterResult<Self> {
        let table = Self { rules };
        table.check_symmetry()?;
        Ok(table)
    }

    /// Set the rule for `kind` (builder style, unchecked).
    pub fn with_rule(mut self, kind: InstructionKind, rule: ConflictRule) -> Self {
        self.rules.insert(kind, rule);
        self
    }

    pub fn rule(&self, kind: InstructionKind) -> Option<&ConflictRule> {
        self.rules.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InstructionKind, &ConflictRule)> {
        self.rules.iter()
    }

    /// Whether a new `incoming` instruction conflicts with an `existing` one.
    pub fn conflicts(&self, incoming: InstructionKind, existing: InstructionKind) -> bool {
        self.rule(incoming)
            .is_some_and(|r| r.conflicts_with.contains(&existing))
    }

    /// Whether a new `incoming` instruction supersedes an `existing` one.
    pub fn supersedes(&self, incoming: InstructionKind, existing: InstructionKind) -> bool {
        self.rule(incoming)
            .is_some_and(|r| r.supersedes.contains(&existing))
    }

    /// Pairs `(a, b)` where `a` conflicts with `b` but not the other way round.
    pub fn asymmetric_pairs(&self) -> Vec<(InstructionKind, InstructionKind)> {
        self.rules
            .iter()
            .flat_map(|(kind, rule)| rule.conflicts_with.iter().map(move |other| (*kind, *other)))
            .filter(|(a, b)| !self.conflicts(*b, *a))
            .collect()
    }

    /// Reject tables where `conflicts_with` is declared in one direction only.
    /// `supersedes` is directional and not checked.
    pub fn check_symmetry(&self) -> ArbiterResult<()> {
        let pairs = self.asymmetric_pairs();
        if pairs.is_empty() {
            return Ok(());
        }

        let listed = pairs
            .iter()
            .map(|(a, b)| format!("{} -> {} (missing {} -> {})", a, b, b, a))
            .collect::<Vec<_>>()
            .join(", ");
        Err(ArbiterError::Config(format!(
            "Asymmetric conflict rules: {}",
            listed
        )))
    }
}

impl Default for ConflictTable {
    fn default() -> Self {
        use InstructionKind::*;

        Self::empty()
            .with_rule(
                ShowFileUpload,
                ConflictRule::conflicting([ShowFileUpload, DisplayForm]),
            )
            .with_rule(RequestEmail, ConflictRule::conflicting([RequestEmail, DisplayForm]))
            .with_rule(
                DisplayForm,
                ConflictRule::conflicting([DisplayForm, ShowFileUpload, RequestEmail]),
            )
            .with_rule(ShowAuthPrompt, ConflictRule::conflicting([ShowAuthPrompt]))
            .with_rule(ShowSelectionMenu, ConflictRule::conflicting([ShowSelectionMenu]))
            .with_rule(
                ShowProgressIndicator,
                ConflictRule::superseding([ShowProgressIndicator]),
            )
            .with_rule(
                ShowConfirmationDialog,
                ConflictRule::conflicting([ShowConfirmationDialog]),
            )
    }
}
