use crate::instruction::InstructionKind;
use crate::registry::{ProducerInfo, ProducerRegistry};
use crate::scheduler::{ConflictRule, ConflictTable, SchedulerSettings};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, fs, path::Path, path::PathBuf};
use tracing::{debug, info};

const CONFIG_FILE: &str = "arbiter.json";

/// Contents of `arbiter.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbiterConfig {
    #[serde(default)]
    pub producers: BTreeMap<String, ProducerConfig>,
    /// Replaces the built-in conflict table when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_rules: Option<BTreeMap<InstructionKind, ConflictRule>>,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerConfig {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub permitted_kinds: Vec<InstructionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
}

impl ProducerConfig {
    pub fn to_info(&self, id: &str) -> ProducerInfo {
        let info = ProducerInfo::new(id, self.name.as_str(), self.priority)
            .permit(self.permitted_kinds.iter().copied());
        match self.rate_limit_per_minute {
            Some(limit) => info.with_rate_limit(limit),
            None => info,
        }
    }
}

impl ArbiterConfig {
    pub fn registry(&self) -> ProducerRegistry {
        ProducerRegistry::from_config(&self.producers)
    }

    /// The configured conflict table, or the built-in one. Configured tables
    /// must declare every `conflictsWith` pair in both directions.
    pub fn conflict_table(&self) -> anyhow::Result<ConflictTable> {
        match &self.conflict_rules {
            Some(rules) => Ok(ConflictTable::from_rules(rules.clone())?),
            None => Ok(ConflictTable::default()),
        }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let cfg: ArbiterConfig = serde_json::from_str(&expand_env_vars(raw))
            .map_err(|e| anyhow::anyhow!("Invalid arbiter configuration: {}", e))?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Could not read {}: {}", path.display(), e))?;
        let cfg = Self::from_json(&raw)?;
        info!(
            "Loaded configuration from {} ({} producers)",
            path.display(),
            cfg.producers.len()
        );
        Ok(cfg)
    }
}

/// Locate the configuration file. `None` when no candidate exists.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("ARBITER_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg)
            .join("instruction-arbiter")
            .join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from(CONFIG_FILE);
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Load `path`, or the resolved configuration file. Falls back to defaults
/// when no file is found.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ArbiterConfig> {
    if let Some(path) = path {
        return ArbiterConfig::load_from(path);
    }

    match resolve_config_path() {
        Some(path) => ArbiterConfig::load_from(&path),
        None => {
            debug!("No {} found, using built-in defaults", CONFIG_FILE);
            Ok(ArbiterConfig::default())
        }
    }
}

/// Replace `${VAR}` with the variable's value. Unset variables are left as
/// written.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) if closed => out.push_str(&val),
                _ => {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "producers": {
            "form_collector": {
                "name": "Form Collection Agent",
                "priority": 2,
                "permittedKinds": ["show_file_upload", "request_email", "display_form"],
                "rateLimitPerMinute": 5
            },
            "progress": {
                "name": "Progress Reporter",
                "permittedKinds": ["show_progress_indicator"]
            }
        },
        "scheduler": { "maxQueueSize": 10, "globalRateLimitPerMinute": null }
    }"#;

    #[test]
    fn test_parse_producers_and_settings() {
        let cfg = ArbiterConfig::from_json(SAMPLE).unwrap();
        let registry = cfg.registry();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.priority_of("form_collector"), 2);
        assert_eq!(registry.priority_of("progress"), 0);
        assert!(registry.can_issue("form_collector", InstructionKind::DisplayForm));
        assert!(!registry.can_issue("progress", InstructionKind::RequestEmail));
        assert_eq!(
            registry.get("form_collector").unwrap().rate_limit_per_minute,
            Some(5)
        );

        assert_eq!(cfg.scheduler.max_queue_size, 10);
        assert_eq!(cfg.scheduler.global_rate_limit_per_minute, None);
        // Unspecified settings keep their defaults.
        assert_eq!(cfg.scheduler.staleness_secs, 3600);
        assert_eq!(cfg.conflict_table().unwrap(), ConflictTable::default());
    }

    #[test]
    fn test_asymmetric_rules_are_rejected() {
        let raw = r#"{
            "conflictRules": {
                "show_file_upload": { "conflictsWith": ["display_form"] },
                "display_form": { "conflictsWith": [] }
            }
        }"#;
        let cfg = ArbiterConfig::from_json(raw).unwrap();
        let err = cfg.conflict_table().unwrap_err().to_string();
        assert!(err.contains("show_file_upload"), "{}", err);
    }

    #[test]
    fn test_unknown_kind_is_a_parse_error() {
        let raw = r#"{ "producers": { "x": { "name": "X", "permittedKinds": ["launch_rocket"] } } }"#;
        assert!(ArbiterConfig::from_json(raw).is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: test-local variable name, not read elsewhere.
        unsafe { env::set_var("ARBITER_TEST_TENANT", "acme") };
        assert_eq!(expand_env_vars("state_${ARBITER_TEST_TENANT}"), "state_acme");
        assert_eq!(
            expand_env_vars("${ARBITER_TEST_UNSET_VAR}/x"),
            "${ARBITER_TEST_UNSET_VAR}/x"
        );
        assert_eq!(expand_env_vars("cost: $5"), "cost: $5");
        assert_eq!(expand_env_vars("${open"), "${open");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let cfg = load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.producers.len(), 2);
        assert_eq!(cfg.producers["form_collector"].name, "Form Collection Agent");
    }

    #[test]
    fn test_missing_file_is_an_error_when_named() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.json"))).is_err());
    }
}
