//! Instruction model.
//!
//! An instruction is an immutable request from a producer to drive the shared
//! interactive surface: show an upload widget, ask for an email, display a
//! form, and so on. Instructions travel in a loose wire form
//! ([`InstructionEnvelope`]) and are decoded into the typed [`Instruction`]
//! before anything else looks at them.
//!
//! Admission checks happen in two stages, both raising [`ValidationError`]:
//!
//! - **Decode** (`Instruction::try_from(envelope)`): known kind, known
//!   priority, non-negative sequence, parameters decode into the kind's record.
//! - **Validate** ([`validate`]): semantic version, positive counts, usable
//!   URLs, compilable patterns, well-formed field lists.

mod params;
mod validation;

pub use params::{
    AuthPromptParams, ConfirmationDialogParams, EmailRequestParams, FileUploadParams,
    FormDisplayParams, FormField, InstructionParams, ProgressIndicatorParams,
    SelectionMenuParams, SelectionOption,
};
pub use validation::{is_semver, validate};

use crate::error::ValidationError;
use crate::types::ProducerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version stamped on instructions built through the constructors below.
pub const INSTRUCTION_VERSION: &str = "1.0.0";

/// Kinds of interactive request a producer may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    ShowFileUpload,
    RequestEmail,
    DisplayForm,
    ShowAuthPrompt,
    ShowSelectionMenu,
    ShowProgressIndicator,
    ShowConfirmationDialog,
}

impl InstructionKind {
    pub const ALL: [InstructionKind; 7] = [
        Self::ShowFileUpload,
        Self::RequestEmail,
        Self::DisplayForm,
        Self::ShowAuthPrompt,
        Self::ShowSelectionMenu,
        Self::ShowProgressIndicator,
        Self::ShowConfirmationDialog,
    ];

    /// Convert to the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShowFileUpload => "show_file_upload",
            Self::RequestEmail => "request_email",
            Self::DisplayForm => "display_form",
            Self::ShowAuthPrompt => "show_auth_prompt",
            Self::ShowSelectionMenu => "show_selection_menu",
            Self::ShowProgressIndicator => "show_progress_indicator",
            Self::ShowConfirmationDialog => "show_confirmation_dialog",
        }
    }

    /// Parse from the wire string.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instruction-level priority. Ordered low < normal < high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata carried by every instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionMetadata {
    pub priority: Priority,
    /// Explicit ordering pin; only compared when both entries carry one
    pub sequence: Option<u64>,
    /// Protocol version of the instruction (semver)
    pub version: String,
    /// Submitting producer
    pub producer_id: Option<ProducerId>,
}

impl Default for InstructionMetadata {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            sequence: None,
            version: INSTRUCTION_VERSION.to_string(),
            producer_id: None,
        }
    }
}

/// Loose wire form of an instruction.
///
/// This is what producers send and what gets persisted. It can hold
/// anything; converting it into an [`Instruction`] performs the decode stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionEnvelope {
    pub kind: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub metadata: EnvelopeMetadata,
}

/// Loose wire form of [`InstructionMetadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    pub version: String,
    #[serde(
        default,
        alias = "producerId",
        alias = "agent_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub producer_id: Option<String>,
}

fn default_priority() -> String {
    Priority::Normal.as_str().to_string()
}

/// A typed, immutable instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "InstructionEnvelope", try_from = "InstructionEnvelope")]
pub struct Instruction {
    params: InstructionParams,
    metadata: InstructionMetadata,
}

impl Instruction {
    pub fn new(params: InstructionParams, metadata: InstructionMetadata) -> Self {
        Self { params, metadata }
    }

    pub fn kind(&self) -> InstructionKind {
        self.params.kind()
    }

    pub fn params(&self) -> &InstructionParams {
        &self.params
    }

    pub fn metadata(&self) -> &InstructionMetadata {
        &self.metadata
    }

    pub fn priority(&self) -> Priority {
        self.metadata.priority
    }

    pub fn sequence(&self) -> Option<u64> {
        self.metadata.sequence
    }

    pub fn producer_id(&self) -> Option<&ProducerId> {
        self.metadata.producer_id.as_ref()
    }

    /// Set the submitting producer.
    pub fn with_producer(mut self, producer_id: impl Into<ProducerId>) -> Self {
        self.metadata.producer_id = Some(producer_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.metadata.sequence = Some(sequence);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.version = version.into();
        self
    }

    /// Serialize to JSON in wire form.
    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }

    /// Parse and decode a JSON instruction.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let envelope: InstructionEnvelope = serde_json::from_str(json)
            .map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
        Self::try_from(envelope)
    }

    fn build(params: InstructionParams, priority: Priority) -> Self {
        Self {
            params,
            metadata: InstructionMetadata {
                priority,
                ..Default::default()
            },
        }
    }

    /// File upload widget.
    pub fn file_upload(
        max_files: u32,
        max_size_mb: u32,
        accepted_types: Vec<String>,
        upload_url: impl Into<String>,
    ) -> Self {
        Self::build(
            InstructionParams::FileUpload(FileUploadParams {
                max_files,
                max_size_mb,
                accepted_types,
                upload_url: upload_url.into(),
            }),
            Priority::Normal,
        )
    }

    /// Email address request with an optional validation pattern.
    pub fn email_request(prompt: impl Into<String>, validation_regex: Option<String>) -> Self {
        Self::build(
            InstructionParams::EmailRequest(EmailRequestParams {
                prompt: prompt.into(),
                validation_regex,
            }),
            Priority::Normal,
        )
    }

    /// Structured form.
    pub fn form_display(title: impl Into<String>, fields: Vec<FormField>) -> Self {
        Self::build(
            InstructionParams::FormDisplay(FormDisplayParams {
                title: title.into(),
                fields,
                submit_label: "Submit".to_string(),
            }),
            Priority::Normal,
        )
    }

    /// Out-of-band authentication prompt.
    pub fn auth_prompt(
        provider: impl Into<String>,
        auth_url: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::build(
            InstructionParams::AuthPrompt(AuthPromptParams {
                provider: provider.into(),
                auth_url: auth_url.into(),
                message: message.into(),
            }),
            Priority::Normal,
        )
    }

    pub fn selection_menu(
        prompt: impl Into<String>,
        options: Vec<SelectionOption>,
        multi_select: bool,
    ) -> Self {
        Self::build(
            InstructionParams::SelectionMenu(SelectionMenuParams {
                prompt: prompt.into(),
                options,
                multi_select,
            }),
            Priority::Normal,
        )
    }

    /// Progress indicator; a concrete `progress` makes it determinate.
    pub fn progress_indicator(message: impl Into<String>, progress: Option<u8>) -> Self {
        Self::build(
            InstructionParams::ProgressIndicator(ProgressIndicatorParams {
                message: message.into(),
                progress,
                indeterminate: progress.is_none(),
            }),
            Priority::Normal,
        )
    }

    /// Confirmation dialog. Defaults to high priority.
    pub fn confirmation_dialog(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(
            InstructionParams::ConfirmationDialog(ConfirmationDialogParams {
                title: title.into(),
                message: message.into(),
                confirm_label: "Confirm".to_string(),
                cancel_label: "Cancel".to_string(),
            }),
            Priority::High,
        )
    }
}

impl TryFrom<InstructionEnvelope> for Instruction {
    type Error = ValidationError;

    fn try_from(envelope: InstructionEnvelope) -> Result<Self, Self::Error> {
        let kind = InstructionKind::parse(&envelope.kind)
            .ok_or_else(|| ValidationError::UnknownKind(envelope.kind.clone()))?;

        let priority = Priority::parse(&envelope.metadata.priority)
            .ok_or_else(|| ValidationError::InvalidPriority(envelope.metadata.priority.clone()))?;

        let sequence = match envelope.metadata.sequence {
            Some(s) if s < 0 => return Err(ValidationError::NegativeSequence(s)),
            Some(s) => Some(s as u64),
            None => None,
        };

        let params = InstructionParams::from_value(kind, envelope.parameters)?;

        Ok(Self {
            params,
            metadata: InstructionMetadata {
                priority,
                sequence,
                version: envelope.metadata.version,
                producer_id: envelope.metadata.producer_id.map(ProducerId::from),
            },
        })
    }
}

impl From<Instruction> for InstructionEnvelope {
    fn from(instruction: Instruction) -> Self {
        Self {
            kind: instruction.kind().as_str().to_string(),
            parameters: instruction.params.to_value(),
            metadata: EnvelopeMetadata {
                priority: instruction.metadata.priority.as_str().to_string(),
                sequence: instruction.metadata.sequence.map(|s| s as i64),
                version: instruction.metadata.version,
                producer_id: instruction.metadata.producer_id.map(ProducerId::into_inner),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_wire_string() {
        for kind in InstructionKind::ALL {
            assert_eq!(InstructionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(InstructionKind::parse("show_fireworks"), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_from_json_with_agent_id_alias() {
        let json = r#"{
            "kind": "request_email",
            "parameters": { "prompt": "Please enter your email address:" },
            "metadata": { "priority": "high", "version": "1.0.0", "agent_id": "form_collector" }
        }"#;

        let instruction = Instruction::from_json(json).unwrap();
        assert_eq!(instruction.kind(), InstructionKind::RequestEmail);
        assert_eq!(instruction.priority(), Priority::High);
        assert_eq!(instruction.producer_id().map(|p| p.as_str()), Some("form_collector"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = r#"{"kind": "show_fireworks", "parameters": {}, "metadata": {"version": "1.0.0"}}"#;
        assert_eq!(
            Instruction::from_json(json).unwrap_err(),
            ValidationError::UnknownKind("show_fireworks".to_string())
        );
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let json = r#"{"kind": "request_email", "parameters": {"prompt": "x"}, "metadata": {"priority": "urgent", "version": "1.0.0"}}"#;
        assert!(matches!(
            Instruction::from_json(json),
            Err(ValidationError::InvalidPriority(p)) if p == "urgent"
        ));
    }

    #[test]
    fn test_negative_sequence_rejected() {
        let json = r#"{"kind": "request_email", "parameters": {"prompt": "x"}, "metadata": {"sequence": -3, "version": "1.0.0"}}"#;
        assert_eq!(
            Instruction::from_json(json).unwrap_err(),
            ValidationError::NegativeSequence(-3)
        );
    }

    #[test]
    fn test_serializes_in_wire_form() {
        let instruction = Instruction::progress_indicator("Uploading", Some(40))
            .with_producer("uploader")
            .with_sequence(2);

        let value = serde_json::to_value(&instruction).unwrap();
        assert_eq!(value["kind"], "show_progress_indicator");
        assert_eq!(value["parameters"]["progress"], 40);
        assert_eq!(value["parameters"]["indeterminate"], false);
        assert_eq!(value["metadata"]["producer_id"], "uploader");
        assert_eq!(value["metadata"]["sequence"], 2);

        let back: Instruction = serde_json::from_value(value).unwrap();
        assert_eq!(back, instruction);
    }

    #[test]
    fn test_confirmation_dialog_defaults_to_high() {
        let instruction = Instruction::confirmation_dialog("Submit?", "File the ticket now?");
        assert_eq!(instruction.priority(), Priority::High);
        assert_eq!(instruction.metadata().version, INSTRUCTION_VERSION);
    }
}
