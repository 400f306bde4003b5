//! Semantic validation of decoded instructions.
//!
//! Pure functions: no registry lookups, no state. Authorization lives in
//! `registry::Verifier`, which calls [`validate`] first.

use super::{Instruction, InstructionKind, InstructionParams};
use crate::error::ValidationError;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

static SEMVER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*)?(?:\+[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*)?$",
    )
    .expect("semver pattern compiles")
});

/// Check whether `version` is a semantic version string (e.g. "1.0.0").
pub fn is_semver(version: &str) -> bool {
    SEMVER.is_match(version)
}

/// Validate an instruction's metadata and per-kind parameters.
pub fn validate(instruction: &Instruction) -> Result<(), ValidationError> {
    let metadata = instruction.metadata();
    if !is_semver(&metadata.version) {
        return Err(ValidationError::InvalidVersion(metadata.version.clone()));
    }

    let kind = instruction.kind();
    match instruction.params() {
        InstructionParams::FileUpload(p) => {
            if p.max_files == 0 {
                return Err(ValidationError::invalid(kind, "max_files", "must be positive"));
            }
            if p.max_size_mb == 0 {
                return Err(ValidationError::invalid(kind, "max_size_mb", "must be positive"));
            }
            if p.accepted_types.is_empty() {
                return Err(ValidationError::invalid(kind, "accepted_types", "must not be empty"));
            }
            if p.accepted_types.iter().any(|t| t.trim().is_empty()) {
                return Err(ValidationError::invalid(
                    kind,
                    "accepted_types",
                    "must not contain empty entries",
                ));
            }
            check_destination_url(kind, "upload_url", &p.upload_url)?;
        }
        InstructionParams::EmailRequest(p) => {
            require_text(kind, "prompt", &p.prompt)?;
            if let Some(pattern) = &p.validation_regex {
                Regex::new(pattern).map_err(|e| {
                    ValidationError::invalid(kind, "validation_regex", e.to_string())
                })?;
            }
        }
        InstructionParams::FormDisplay(p) => {
            require_text(kind, "title", &p.title)?;
            if p.fields.is_empty() {
                return Err(ValidationError::invalid(kind, "fields", "must not be empty"));
            }
            let mut seen = HashSet::new();
            for (index, field) in p.fields.iter().enumerate() {
                require_text(kind, &format!("fields[{}].name", index), &field.name)?;
                require_text(kind, &format!("fields[{}].label", index), &field.label)?;
                require_text(kind, &format!("fields[{}].type", index), &field.field_type)?;
                if !seen.insert(field.name.as_str()) {
                    return Err(ValidationError::invalid(
                        kind,
                        format!("fields[{}].name", index),
                        format!("duplicate field name '{}'", field.name),
                    ));
                }
            }
        }
        InstructionParams::AuthPrompt(p) => {
            require_text(kind, "provider", &p.provider)?;
            require_text(kind, "message", &p.message)?;
            check_absolute_url(kind, "auth_url", &p.auth_url)?;
        }
        InstructionParams::SelectionMenu(p) => {
            require_text(kind, "prompt", &p.prompt)?;
            if p.options.is_empty() {
                return Err(ValidationError::invalid(kind, "options", "must not be empty"));
            }
            let mut seen = HashSet::new();
            for (index, option) in p.options.iter().enumerate() {
                require_text(kind, &format!("options[{}].value", index), &option.value)?;
                require_text(kind, &format!("options[{}].label", index), &option.label)?;
                if !seen.insert(option.value.as_str()) {
                    return Err(ValidationError::invalid(
                        kind,
                        format!("options[{}].value", index),
                        format!("duplicate option value '{}'", option.value),
                    ));
                }
            }
        }
        InstructionParams::ProgressIndicator(p) => {
            require_text(kind, "message", &p.message)?;
            if let Some(progress) = p.progress {
                if progress > 100 {
                    return Err(ValidationError::invalid(kind, "progress", "must be at most 100"));
                }
            }
        }
        InstructionParams::ConfirmationDialog(p) => {
            require_text(kind, "title", &p.title)?;
            require_text(kind, "message", &p.message)?;
        }
    }

    Ok(())
}

fn require_text(kind: InstructionKind, field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::invalid(kind, field, "must not be empty"));
    }
    Ok(())
}

/// Upload destinations may be absolute http(s) URLs or root-relative paths
/// served by the widget's own backend (e.g. "/api/upload").
fn check_destination_url(
    kind: InstructionKind,
    field: &str,
    value: &str,
) -> Result<(), ValidationError> {
    require_text(kind, field, value)?;

    if value.starts_with('/') && !value.starts_with("//") {
        Url::parse("http://localhost/")
            .and_then(|base| base.join(value))
            .map_err(|e| ValidationError::invalid(kind, field, format!("invalid path: {}", e)))?;
        return Ok(());
    }

    check_absolute_url(kind, field, value)
}

fn check_absolute_url(
    kind: InstructionKind,
    field: &str,
    value: &str,
) -> Result<(), ValidationError> {
    let parsed = Url::parse(value)
        .map_err(|e| ValidationError::invalid(kind, field, format!("invalid URL: {}", e)))?;

    if !["http", "https"].contains(&parsed.scheme()) {
        return Err(ValidationError::invalid(kind, field, "URL must use HTTP or HTTPS"));
    }
    if parsed.host_str().is_none() {
        return Err(ValidationError::invalid(kind, field, "URL must have a host"));
    }

    if parsed.scheme() == "http"
        && !parsed
            .host_str()
            .is_some_and(|h| h.starts_with("localhost") || h.starts_with("127.0.0.1"))
    {
        tracing::warn!("{} for {} uses plain HTTP (non-localhost): {}", field, kind, value);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{FormField, SelectionOption};

    fn upload(url: &str) -> Instruction {
        Instruction::file_upload(
            3,
            10,
            vec!["image/png".to_string(), "application/pdf".to_string()],
            url,
        )
    }

    #[test]
    fn test_semver() {
        assert!(is_semver("1.0.0"));
        assert!(is_semver("2.10.3-beta.1+build.5"));
        assert!(!is_semver("1.0"));
        assert!(!is_semver("01.0.0"));
        assert!(!is_semver("v1.0.0"));
    }

    #[test]
    fn test_invalid_version_rejected() {
        let instruction = upload("/api/upload").with_version("latest");
        assert_eq!(
            validate(&instruction),
            Err(ValidationError::InvalidVersion("latest".to_string()))
        );
    }

    #[test]
    fn test_file_upload_urls() {
        assert!(validate(&upload("/api/upload")).is_ok());
        assert!(validate(&upload("https://uploads.example.com/v1")).is_ok());
        assert!(validate(&upload("not a url")).is_err());
        assert!(validate(&upload("ftp://example.com/drop")).is_err());
        assert!(validate(&upload("")).is_err());
    }

    #[test]
    fn test_file_upload_counts_must_be_positive() {
        let instruction = Instruction::file_upload(0, 10, vec!["image/png".into()], "/api/upload");
        assert!(matches!(
            validate(&instruction),
            Err(ValidationError::InvalidParameter { field, .. }) if field == "max_files"
        ));

        let instruction = Instruction::file_upload(1, 0, vec!["image/png".into()], "/api/upload");
        assert!(validate(&instruction).is_err());

        let instruction = Instruction::file_upload(1, 5, vec![], "/api/upload");
        assert!(validate(&instruction).is_err());
    }

    #[test]
    fn test_email_request_pattern_must_compile() {
        let ok = Instruction::email_request(
            "Please enter your email address:",
            Some(r"^[^@\s]+@[^@\s]+\.[^@\s]+$".to_string()),
        );
        assert!(validate(&ok).is_ok());

        let bad = Instruction::email_request("Email?", Some("([unclosed".to_string()));
        assert!(matches!(
            validate(&bad),
            Err(ValidationError::InvalidParameter { field, .. }) if field == "validation_regex"
        ));

        let empty = Instruction::email_request("   ", None);
        assert!(validate(&empty).is_err());
    }

    #[test]
    fn test_form_display_fields() {
        let ok = Instruction::form_display(
            "Bug report",
            vec![
                FormField::new("summary", "Summary", "text").required(),
                FormField::new("email", "Email", "email"),
            ],
        );
        assert!(validate(&ok).is_ok());

        let empty = Instruction::form_display("Bug report", vec![]);
        assert!(validate(&empty).is_err());

        let missing_label = Instruction::form_display(
            "Bug report",
            vec![FormField::new("summary", "", "text")],
        );
        assert!(matches!(
            validate(&missing_label),
            Err(ValidationError::InvalidParameter { field, .. }) if field == "fields[0].label"
        ));

        let duplicate = Instruction::form_display(
            "Bug report",
            vec![
                FormField::new("summary", "Summary", "text"),
                FormField::new("summary", "Again", "text"),
            ],
        );
        assert!(validate(&duplicate).is_err());
    }

    #[test]
    fn test_auth_prompt_requires_absolute_url() {
        let ok = Instruction::auth_prompt("zendesk", "https://example.zendesk.com/oauth", "Sign in");
        assert!(validate(&ok).is_ok());

        let relative = Instruction::auth_prompt("zendesk", "/oauth", "Sign in");
        assert!(validate(&relative).is_err());
    }

    #[test]
    fn test_selection_menu_options() {
        let ok = Instruction::selection_menu(
            "Which product?",
            vec![SelectionOption::new("web", "Web app"), SelectionOption::new("ios", "iOS")],
            false,
        );
        assert!(validate(&ok).is_ok());

        let dup = Instruction::selection_menu(
            "Which product?",
            vec![SelectionOption::new("web", "Web"), SelectionOption::new("web", "Web 2")],
            true,
        );
        assert!(validate(&dup).is_err());
    }

    #[test]
    fn test_progress_bounds() {
        assert!(validate(&Instruction::progress_indicator("Scanning", Some(100))).is_ok());
        assert!(validate(&Instruction::progress_indicator("Scanning", Some(101))).is_err());
        assert!(validate(&Instruction::progress_indicator("Scanning", None)).is_ok());
    }

    #[test]
    fn test_confirmation_dialog_requires_text() {
        assert!(validate(&Instruction::confirmation_dialog("Submit?", "File it now?")).is_ok());
        assert!(validate(&Instruction::confirmation_dialog("", "File it now?")).is_err());
    }
}
