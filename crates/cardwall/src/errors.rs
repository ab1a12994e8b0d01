//! Error taxonomy and actionable error formatting.
//!
//! Three layers of failure show up in this crate:
//! - [`MqlError`]: malformed MQL text, always recoverable by re-prompting.
//! - [`DomainError`]: semantic failures raised while binding a query or
//!   mutating project metadata (unknown names, illegal clause combinations,
//!   blocking validation lists).
//! - `anyhow::Error`: storage and engine failures, fatal for the current
//!   operation and propagated unchanged.
//!
//! [`ActionableError`] renders any of these with causes and remedies for the
//! command-line tool.

use std::fmt;
use thiserror::Error;

/// Failure while tokenizing or parsing MQL text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MqlError {
    /// Generic syntax failure at a character offset.
    #[error("parse error at position {position}: {message}")]
    Syntax { message: String, position: usize },
    /// Input ended while more tokens were expected.
    #[error("unexpected end of MQL: {expected}")]
    UnexpectedEnd { expected: String },
    /// A keyword appeared where a property, tag or variable name was expected.
    #[error(
        "parse error on value '{word}' ({keyword}) at position {position}. You may have a project \
         variable, property, or tag with a name shared by a MQL keyword. If this is the case, you \
         will need to surround the variable, property, or tags with quotes."
    )]
    ReservedWord {
        word: String,
        keyword: String,
        position: usize,
    },
}

impl MqlError {
    pub fn syntax(message: impl Into<String>, position: usize) -> Self {
        MqlError::Syntax {
            message: message.into(),
            position,
        }
    }

    /// Wrap this parse failure in an actionable error with quoting hints.
    pub fn to_actionable(&self) -> ActionableError {
        match self {
            MqlError::ReservedWord { word, keyword, .. } => {
                ActionableError::new(self.to_string())
                    .with_cause(format!("'{}' collides with the MQL keyword {}", word, keyword))
                    .with_remedy(format!("Quote the name: '{}'", word))
            }
            MqlError::UnexpectedEnd { .. } => ActionableError::new(self.to_string())
                .with_cause("The query stops in the middle of a clause")
                .with_remedy("Complete the last condition or remove the dangling keyword"),
            MqlError::Syntax { .. } => ActionableError::new(self.to_string())
                .with_cause("A property or value name may contain spaces or punctuation")
                .with_remedy("Surround multi-word names and values with single quotes"),
        }
    }
}

/// Semantic failure raised by the query compiler or the project model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DomainError {
    #[error(transparent)]
    Parse(#[from] MqlError),
    /// Query is well-formed but cannot be compiled against this project.
    #[error("{0}")]
    InvalidQuery(String),
    /// Blocking validation list; every reason is reported.
    #[error("{}", .0.join(" "))]
    Validation(Vec<String>),
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
}

impl DomainError {
    pub fn invalid(message: impl Into<String>) -> Self {
        DomainError::InvalidQuery(message.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        DomainError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Validation messages carried by this error, or the error itself as a
    /// single message.
    pub fn messages(&self) -> Vec<String> {
        match self {
            DomainError::Validation(messages) => messages.clone(),
            other => vec![other.to_string()],
        }
    }

    pub fn to_actionable(&self) -> ActionableError {
        match self {
            DomainError::Parse(err) => err.to_actionable(),
            DomainError::InvalidQuery(message) => ActionableError::new(message.clone())
                .with_remedy("Check property names and clause combinations in the query"),
            DomainError::Validation(messages) => {
                let mut error = ActionableError::new("Validation failed");
                for message in messages {
                    error = error.with_cause(message.clone());
                }
                error
            }
            DomainError::NotFound { kind, name } => {
                ActionableError::new(self.to_string()).with_remedy(format!(
                    "Check the spelling of {} '{}' (names are case-insensitive)",
                    kind, name
                ))
            }
        }
    }
}

/// An error with diagnostic context and remediation steps.
///
/// # Example
///
/// ```
/// use cardwall::errors::ActionableError;
///
/// let error = ActionableError::new("Property 'Pointz' not found")
///     .with_cause("The property may have been renamed")
///     .with_remedy("List properties: cardwall validate --config cardwall.toml");
///
/// assert!(error.to_error_message().contains("To fix:"));
/// ```
#[derive(Debug, Clone)]
pub struct ActionableError {
    error: String,
    causes: Vec<String>,
    remediation: Vec<String>,
}

impl ActionableError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            causes: Vec::new(),
            remediation: Vec::new(),
        }
    }

    /// Add a possible cause (diagnostic hint).
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a remediation step.
    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.remediation.push(remedy.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.error
    }

    pub fn causes(&self) -> &[String] {
        &self.causes
    }

    pub fn remedies(&self) -> &[String] {
        &self.remediation
    }

    pub fn to_error_message(&self) -> String {
        let mut msg = format!("Error: {}\n", self.error);

        if !self.causes.is_empty() {
            msg.push_str("\nPossible causes:\n");
            for cause in &self.causes {
                msg.push_str(&format!("  • {}\n", cause));
            }
        }

        if !self.remediation.is_empty() {
            msg.push_str("\nTo fix:\n");
            for remedy in &self.remediation {
                msg.push_str(&format!("  • {}\n", remedy));
            }
        }

        msg
    }
}

impl fmt::Display for ActionableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_error_message())
    }
}

impl std::error::Error for ActionableError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_word_message_mentions_quoting() {
        let err = MqlError::ReservedWord {
            word: "Order".to_string(),
            keyword: "ORDER".to_string(),
            position: 6,
        };
        let msg = err.to_string();
        assert!(msg.contains("'Order'"));
        assert!(msg.contains("surround the variable, property, or tags with quotes"));

        let actionable = err.to_actionable();
        assert_eq!(actionable.remedies(), &["Quote the name: 'Order'".to_string()]);
    }

    #[test]
    fn test_validation_error_joins_all_reasons() {
        let err = DomainError::Validation(vec!["first.".to_string(), "second.".to_string()]);
        assert_eq!(err.to_string(), "first. second.");
        assert_eq!(err.messages().len(), 2);
        assert_eq!(err.to_actionable().causes().len(), 2);
    }

    #[test]
    fn test_parse_error_converts_into_domain_error() {
        let err: DomainError = MqlError::syntax("unexpected ')'", 4).into();
        assert!(matches!(err, DomainError::Parse(_)));
        assert!(err.to_string().contains("position 4"));
    }

    #[test]
    fn test_error_message_format() {
        let error = ActionableError::new("Card type 'Bug' not found")
            .with_cause("The card type may have been deleted")
            .with_remedy("Create it first");

        let msg = error.to_error_message();
        assert!(msg.contains("Error: Card type 'Bug' not found"));
        assert!(msg.contains("Possible causes:"));
        assert!(msg.contains("  • The card type may have been deleted"));
        assert!(msg.contains("To fix:"));
    }

    #[test]
    fn test_error_without_causes_or_remedies() {
        let msg = ActionableError::new("Simple error").to_error_message();
        assert_eq!(msg, "Error: Simple error\n");
    }
}
