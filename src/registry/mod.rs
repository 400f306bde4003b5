//! Producer registry.
//!
//! Catalog of the producers (agents) allowed to drive the interactive
//! surface: their priority for conflict arbitration, the instruction kinds
//! they may issue and their per-minute rate limit.

mod verifier;

pub use verifier::Verifier;

use crate::config::ProducerConfig;
use crate::instruction::InstructionKind;
use crate::types::{ProducerId, ProducerName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// A registered producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    /// Unique producer identifier
    pub id: ProducerId,
    /// Display name
    pub name: ProducerName,
    /// Arbitration priority; higher wins conflicts
    pub priority: i32,
    /// Instruction kinds this producer may issue
    pub permitted_kinds: BTreeSet<InstructionKind>,
    /// Accepted instructions per rolling minute, if limited
    pub rate_limit_per_minute: Option<u32>,
}

impl ProducerInfo {
    pub fn new(id: impl Into<ProducerId>, name: impl Into<ProducerName>, priority: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            permitted_kinds: BTreeSet::new(),
            rate_limit_per_minute: None,
        }
    }

    /// Allow this producer to issue `kinds`.
    pub fn permit(mut self, kinds: impl IntoIterator<Item = InstructionKind>) -> Self {
        self.permitted_kinds.extend(kinds);
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    pub fn may_issue(&self, kind: InstructionKind) -> bool {
        self.permitted_kinds.contains(&kind)
    }
}

/// Registry of known producers.
///
/// Built up front and then shared read-only (behind an `Arc`) by the
/// verifier and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ProducerRegistry {
    producers: BTreeMap<ProducerId, ProducerInfo>,
}

impl ProducerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured producers.
    pub fn from_config(producers: &BTreeMap<String, ProducerConfig>) -> Self {
        producers
            .iter()
            .fold(Self::new(), |registry, (id, cfg)| registry.register(cfg.to_info(id)))
    }

    /// Register a producer (builder style).
    pub fn register(mut self, info: ProducerInfo) -> Self {
        self.insert(info);
        self
    }

    /// Register a producer, replacing any previous entry with the same id.
    pub fn insert(&mut self, info: ProducerInfo) {
        if self.producers.contains_key(&info.id) {
            warn!("Producer {} is already registered and will be overwritten", info.id);
        }
        info!(
            "Registered producer: {} ({}, priority {})",
            info.id, info.name, info.priority
        );
        self.producers.insert(info.id.clone(), info);
    }

    /// Remove a producer. Returns the removed entry, if any.
    pub fn unregister(&mut self, id: &str) -> Option<ProducerInfo> {
        let removed = self.producers.remove(id);
        if removed.is_some() {
            info!("Unregistered producer: {}", id);
        }
        removed
    }

    /// Look up a producer by id.
    pub fn get(&self, id: &str) -> Option<&ProducerInfo> {
        self.producers.get(id)
    }

    /// All registered producers, ordered by id.
    pub fn list(&self) -> impl Iterator<Item = &ProducerInfo> {
        self.producers.values()
    }

    /// Whether `id` is registered and may issue `kind`.
    pub fn can_issue(&self, id: &str, kind: InstructionKind) -> bool {
        self.get(id).is_some_and(|p| p.may_issue(kind))
    }

    /// Arbitration priority of a producer; 0 when unknown.
    pub fn priority_of(&self, id: &str) -> i32 {
        self.get(id).map_or(0, |p| p.priority)
    }

    /// Every producer permitted to issue `kind`.
    pub fn find_by_kind(&self, kind: InstructionKind) -> Vec<&ProducerInfo> {
        self.producers.values().filter(|p| p.may_issue(kind)).collect()
    }

    /// Return the number of registered producers.
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Return `true` if no producers are registered.
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProducerRegistry {
        ProducerRegistry::new()
            .register(
                ProducerInfo::new("form_collector", "Form Collection Agent", 2)
                    .permit([
                        InstructionKind::ShowFileUpload,
                        InstructionKind::RequestEmail,
                        InstructionKind::DisplayForm,
                    ])
                    .with_rate_limit(5),
            )
            .register(
                ProducerInfo::new("email_verifier", "Email Verifier", 1)
                    .permit([InstructionKind::RequestEmail]),
            )
    }

    #[test]
    fn test_lookup_and_permissions() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert!(registry.can_issue("form_collector", InstructionKind::DisplayForm));
        assert!(!registry.can_issue("email_verifier", InstructionKind::DisplayForm));
        assert!(!registry.can_issue("ghost", InstructionKind::RequestEmail));
        assert_eq!(
            registry.get("form_collector").and_then(|p| p.rate_limit_per_minute),
            Some(5)
        );
    }

    #[test]
    fn test_priority_defaults_to_zero() {
        let registry = registry();
        assert_eq!(registry.priority_of("form_collector"), 2);
        assert_eq!(registry.priority_of("ghost"), 0);
    }

    #[test]
    fn test_find_by_kind() {
        let registry = registry();
        let ids: Vec<&str> = registry
            .find_by_kind(InstructionKind::RequestEmail)
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["email_verifier", "form_collector"]);
        assert!(registry.find_by_kind(InstructionKind::ShowAuthPrompt).is_empty());
    }

    #[test]
    fn test_register_overwrites_and_unregister() {
        let mut registry = registry();
        registry.insert(ProducerInfo::new("email_verifier", "Email Verifier v2", 3));
        assert_eq!(registry.priority_of("email_verifier"), 3);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister("email_verifier").is_some());
        assert!(registry.unregister("email_verifier").is_none());
        assert_eq!(registry.len(), 1);
    }
}
