//! Structured output formatting for CLI commands.
//!
//! Human-readable text by default; `--json` wraps every result (and every
//! error) in a versioned envelope so scripts can consume it.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use std::io::{self, Write};

use crate::errors::DomainError;

/// Version of the JSON output format
const OUTPUT_VERSION: &str = "0.1.0";

/// Where command output goes, given `--quiet` and `--json`.
///
/// Data lines are the command's result and survive `--quiet`; info lines
/// are commentary around them. In JSON mode only [`print_json`] writes to
/// stdout.
///
/// [`print_json`]: OutputContext::print_json
pub struct OutputContext {
    quiet: bool,
    json: bool,
}

impl OutputContext {
    pub fn new(quiet: bool, json: bool) -> Self {
        Self { quiet, json }
    }

    pub fn print_data(&self, msg: impl Display) -> io::Result<()> {
        if self.json {
            return Ok(());
        }
        write_line(&mut io::stdout(), msg)
    }

    pub fn print_info(&self, msg: impl Display) -> io::Result<()> {
        if self.json || self.quiet {
            return Ok(());
        }
        write_line(&mut io::stdout(), msg)
    }

    /// Errors go to stderr whatever the mode.
    pub fn print_error(&self, msg: impl Display) -> io::Result<()> {
        write_line(&mut io::stderr(), format_args!("Error: {}", msg))
    }

    pub fn print_json<T: Serialize>(&self, output: &JsonOutput<T>) -> io::Result<()> {
        if !self.json {
            return Ok(());
        }
        let text = output.to_json_string().map_err(io::Error::other)?;
        write_line(&mut io::stdout(), text)
    }

    pub fn is_json(&self) -> bool {
        self.json
    }
}

/// A closed pipe (`cardwall compile ... | head -1`) ends the process quietly.
fn write_line(stream: &mut impl Write, msg: impl Display) -> io::Result<()> {
    match writeln!(stream, "{}", msg) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => std::process::exit(0),
        result => result,
    }
}

// ============================================================================
// JSON Output Types
// ============================================================================

/// Wrapper for successful command output with metadata
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: T,
    pub metadata: Metadata,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn success(data: T, command: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            metadata: Metadata::new(command),
        }
    }

    /// Serialize to JSON string with pretty formatting
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Wrapper for error output with suggestions
#[derive(Debug, Serialize)]
pub struct JsonError {
    pub success: bool,
    pub error: ErrorDetail,
    pub metadata: Metadata,
}

impl JsonError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
                suggestions: Vec::new(),
            },
            metadata: Metadata::new(command),
        }
    }

    /// Build the JSON form of an error, keeping validation messages and
    /// remedies as structured fields.
    pub fn from_error(error: &anyhow::Error, command: impl Into<String>) -> Self {
        let Some(domain) = error.downcast_ref::<DomainError>() else {
            return JsonError::new(ErrorCode::for_error(error), format!("{:#}", error), command);
        };
        let actionable = domain.to_actionable();
        let mut json = JsonError::new(ErrorCode::for_error(error), domain.to_string(), command)
            .with_suggestions(actionable.remedies().to_vec());
        if let DomainError::Validation(messages) = domain {
            json = json.with_details(serde_json::json!({ "errors": messages }));
        }
        json
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.error.suggestions.extend(suggestions);
        self
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn exit_code(&self) -> ExitCode {
        ErrorCode::to_exit_code(&self.error.code)
    }
}

/// Error details including code, message, and suggestions
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code (e.g., "INVALID_QUERY", "VALIDATION_FAILED")
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Suggested actions to resolve the error
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

/// Metadata included with every JSON response
#[derive(Debug, Serialize)]
pub struct Metadata {
    pub timestamp: String,
    pub version: String,
    pub command: String,
}

impl Metadata {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            version: OUTPUT_VERSION.to_string(),
            command: command.into(),
        }
    }
}

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit codes of the `cardwall` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Command succeeded (0)
    Success = 0,
    /// Generic error (1)
    GenericError = 1,
    /// Invalid arguments, MQL syntax or an uncompilable query (2)
    InvalidArgument = 2,
    /// Configuration file, tree or property not found (3)
    NotFound = 3,
    /// Project configuration failed validation (4)
    ValidationFailed = 4,
    /// File system failure (10)
    ExternalError = 10,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

// ============================================================================
// Error Codes (String constants for JSON responses)
// ============================================================================

pub struct ErrorCode;

impl ErrorCode {
    pub const MQL_SYNTAX: &'static str = "MQL_SYNTAX";
    pub const INVALID_QUERY: &'static str = "INVALID_QUERY";
    pub const VALIDATION_FAILED: &'static str = "VALIDATION_FAILED";
    pub const NOT_FOUND: &'static str = "NOT_FOUND";
    pub const IO_ERROR: &'static str = "IO_ERROR";
    pub const INVALID_CONFIG: &'static str = "INVALID_CONFIG";
    pub const GENERIC_ERROR: &'static str = "GENERIC_ERROR";

    /// Classify an error raised by a command.
    pub fn for_error(error: &anyhow::Error) -> &'static str {
        if let Some(domain) = error.downcast_ref::<DomainError>() {
            return match domain {
                DomainError::Parse(_) => Self::MQL_SYNTAX,
                DomainError::InvalidQuery(_) => Self::INVALID_QUERY,
                DomainError::Validation(_) => Self::VALIDATION_FAILED,
                DomainError::NotFound { .. } => Self::NOT_FOUND,
            };
        }
        for cause in error.chain() {
            if let Some(io_error) = cause.downcast_ref::<io::Error>() {
                return if io_error.kind() == io::ErrorKind::NotFound {
                    Self::NOT_FOUND
                } else {
                    Self::IO_ERROR
                };
            }
            if cause.downcast_ref::<toml::de::Error>().is_some() {
                return Self::INVALID_CONFIG;
            }
        }
        Self::GENERIC_ERROR
    }

    pub fn to_exit_code(code: &str) -> ExitCode {
        match code {
            Self::MQL_SYNTAX | Self::INVALID_QUERY | Self::INVALID_CONFIG => {
                ExitCode::InvalidArgument
            }
            Self::VALIDATION_FAILED => ExitCode::ValidationFailed,
            Self::NOT_FOUND => ExitCode::NotFound,
            Self::IO_ERROR => ExitCode::ExternalError,
            _ => ExitCode::GenericError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MqlError;
    use anyhow::Context;

    #[test]
    fn test_domain_errors_map_to_exit_codes() {
        let syntax: anyhow::Error = DomainError::Parse(MqlError::syntax("Unexpected ')'", 4)).into();
        assert_eq!(ErrorCode::for_error(&syntax), ErrorCode::MQL_SYNTAX);
        assert_eq!(
            JsonError::from_error(&syntax, "compile").exit_code(),
            ExitCode::InvalidArgument
        );

        let invalid: anyhow::Error =
            DomainError::Validation(vec!["Tree Planning does not exist.".into()]).into();
        let json = JsonError::from_error(&invalid, "validate");
        assert_eq!(json.exit_code(), ExitCode::ValidationFailed);
        assert_eq!(
            json.error.details,
            Some(serde_json::json!({ "errors": ["Tree Planning does not exist."] }))
        );
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = std::fs::read_to_string("/nonexistent/cardwall.toml")
            .context("Failed to read /nonexistent/cardwall.toml")
            .unwrap_err();
        assert_eq!(ErrorCode::for_error(&err), ErrorCode::NOT_FOUND);
        assert_eq!(ErrorCode::to_exit_code(ErrorCode::NOT_FOUND).code(), 3);
    }

    #[test]
    fn test_json_output_envelope() {
        let output = JsonOutput::success(serde_json::json!({ "count": 2 }), "compile");
        let text = output.to_json_string().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["count"], 2);
        assert_eq!(value["metadata"]["command"], "compile");
        assert_eq!(value["metadata"]["version"], OUTPUT_VERSION);
    }
}
