//! Strongly-typed parameter records, one per instruction kind.

use super::InstructionKind;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters for `show_file_upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadParams {
    /// Maximum number of files the user may attach
    pub max_files: u32,
    /// Maximum size per file in megabytes
    pub max_size_mb: u32,
    /// Accepted MIME types (e.g. "image/png")
    pub accepted_types: Vec<String>,
    /// Absolute http(s) URL or root-relative path the widget uploads to
    pub upload_url: String,
}

/// Parameters for `request_email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRequestParams {
    /// Prompt text shown above the input
    pub prompt: String,
    /// Optional pattern the entered address must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_regex: Option<String>,
}

/// A single field of a `display_form` instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub label: String,
    /// Input type understood by the renderer ("text", "email", "select", ...)
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl FormField {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        field_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            field_type: field_type.into(),
            required: false,
            placeholder: None,
            options: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Parameters for `display_form`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDisplayParams {
    pub title: String,
    pub fields: Vec<FormField>,
    #[serde(default = "default_submit_label")]
    pub submit_label: String,
}

/// Parameters for `show_auth_prompt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPromptParams {
    /// Identity provider name (e.g. "zendesk", "github")
    pub provider: String,
    /// URL the user is sent to in order to authenticate
    pub auth_url: String,
    /// Explanation shown to the user
    pub message: String,
}

/// One choice in a `show_selection_menu` instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOption {
    pub value: String,
    pub label: String,
}

impl SelectionOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Parameters for `show_selection_menu`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionMenuParams {
    pub prompt: String,
    pub options: Vec<SelectionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// Parameters for `show_progress_indicator`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressIndicatorParams {
    pub message: String,
    /// Completion percentage (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default = "default_true")]
    pub indeterminate: bool,
}

/// Parameters for `show_confirmation_dialog`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationDialogParams {
    pub title: String,
    pub message: String,
    #[serde(default = "default_confirm_label")]
    pub confirm_label: String,
    #[serde(default = "default_cancel_label")]
    pub cancel_label: String,
}

fn default_submit_label() -> String {
    "Submit".to_string()
}

fn default_confirm_label() -> String {
    "Confirm".to_string()
}

fn default_cancel_label() -> String {
    "Cancel".to_string()
}

fn default_true() -> bool {
    true
}

/// Instruction parameters, keyed by kind.
///
/// Renderers match on this exhaustively instead of probing a loose
/// parameter bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionParams {
    FileUpload(FileUploadParams),
    EmailRequest(EmailRequestParams),
    FormDisplay(FormDisplayParams),
    AuthPrompt(AuthPromptParams),
    SelectionMenu(SelectionMenuParams),
    ProgressIndicator(ProgressIndicatorParams),
    ConfirmationDialog(ConfirmationDialogParams),
}

impl InstructionParams {
    /// The instruction kind these parameters belong to.
    pub fn kind(&self) -> InstructionKind {
        match self {
            Self::FileUpload(_) => InstructionKind::ShowFileUpload,
            Self::EmailRequest(_) => InstructionKind::RequestEmail,
            Self::FormDisplay(_) => InstructionKind::DisplayForm,
            Self::AuthPrompt(_) => InstructionKind::ShowAuthPrompt,
            Self::SelectionMenu(_) => InstructionKind::ShowSelectionMenu,
            Self::ProgressIndicator(_) => InstructionKind::ShowProgressIndicator,
            Self::ConfirmationDialog(_) => InstructionKind::ShowConfirmationDialog,
        }
    }

    /// Decode a loose JSON parameter object into the record for `kind`.
    pub fn from_value(kind: InstructionKind, value: Value) -> Result<Self, ValidationError> {
        fn decode<T: serde::de::DeserializeOwned>(
            kind: InstructionKind,
            value: Value,
        ) -> Result<T, ValidationError> {
            serde_json::from_value(value).map_err(|e| ValidationError::MalformedParameters {
                kind,
                message: e.to_string(),
            })
        }

        Ok(match kind {
            InstructionKind::ShowFileUpload => Self::FileUpload(decode(kind, value)?),
            InstructionKind::RequestEmail => Self::EmailRequest(decode(kind, value)?),
            InstructionKind::DisplayForm => Self::FormDisplay(decode(kind, value)?),
            InstructionKind::ShowAuthPrompt => Self::AuthPrompt(decode(kind, value)?),
            InstructionKind::ShowSelectionMenu => Self::SelectionMenu(decode(kind, value)?),
            InstructionKind::ShowProgressIndicator => {
                Self::ProgressIndicator(decode(kind, value)?)
            }
            InstructionKind::ShowConfirmationDialog => {
                Self::ConfirmationDialog(decode(kind, value)?)
            }
        })
    }

    /// Encode back into a JSON object.
    pub fn to_value(&self) -> Value {
        let encoded = match self {
            Self::FileUpload(p) => serde_json::to_value(p),
            Self::EmailRequest(p) => serde_json::to_value(p),
            Self::FormDisplay(p) => serde_json::to_value(p),
            Self::AuthPrompt(p) => serde_json::to_value(p),
            Self::SelectionMenu(p) => serde_json::to_value(p),
            Self::ProgressIndicator(p) => serde_json::to_value(p),
            Self::ConfirmationDialog(p) => serde_json::to_value(p),
        };
        // Plain structs of strings and integers always encode.
        encoded.unwrap_or_default()
    }
}
