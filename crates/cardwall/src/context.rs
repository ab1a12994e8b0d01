//! Explicit evaluation context passed into every compiler and engine call.

use chrono::{NaiveDate, Utc};

use crate::domain::{Card, Project};
use crate::errors::DomainError;

/// What is being rendered when a query is evaluated. Decides how
/// `THIS CARD` references resolve.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentProvider {
    /// No rendering context (command line, background work).
    None,
    /// A saved card; `THIS CARD` is substituted with its values.
    Card(Card),
    /// Card defaults of a card type; no card exists yet, so `THIS CARD`
    /// comparisons compile to `IS NULL`.
    CardDefaults { card_type: String },
    /// A wiki-style page; `THIS CARD` has no meaning there.
    Page { name: String },
}

/// Resolution of a `THIS CARD` reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThisCard<'c> {
    Card(&'c Card),
    /// Structurally unavailable; the comparison becomes `IS NULL`.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct EvaluationContext<'a> {
    pub project: &'a Project,
    pub acting_user: Option<String>,
    pub today: NaiveDate,
    pub content: ContentProvider,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(project: &'a Project) -> Self {
        EvaluationContext {
            project,
            acting_user: None,
            today: Utc::now().date_naive(),
            content: ContentProvider::None,
        }
    }

    pub fn with_user(mut self, login: impl Into<String>) -> Self {
        self.acting_user = Some(login.into());
        self
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn with_content(mut self, content: ContentProvider) -> Self {
        self.content = content;
        self
    }

    pub fn this_card(&self) -> Result<ThisCard<'_>, DomainError> {
        match &self.content {
            ContentProvider::Card(card) => Ok(ThisCard::Card(card)),
            ContentProvider::CardDefaults { .. } => Ok(ThisCard::Unavailable),
            ContentProvider::Page { name } => Err(DomainError::invalid(format!(
                "THIS CARD is not supported on page '{}'.",
                name
            ))),
            ContentProvider::None => Err(DomainError::invalid(
                "THIS CARD is only available while rendering a card.",
            )),
        }
    }

    pub fn current_user(&self) -> Result<&str, DomainError> {
        self.acting_user
            .as_deref()
            .ok_or_else(|| DomainError::invalid("CURRENT USER requires a signed-in user."))
    }
}
