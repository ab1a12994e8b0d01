//! MQL: the card query language.
//!
//! Text is tokenized by [`lexer`], parsed into the [`ast`] by [`parser`],
//! and rendered back to canonical text through `Display`. Renames are
//! applied to the tree and re-serialized, never spliced into strings.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{
    quote_name, AggregateFunction, Condition, Direction, OrderBy, ParsedQuery, SelectColumn,
    Value,
};
pub use lexer::{is_keyword, Keyword, Operator};
pub use parser::Parser;

use crate::errors::MqlError;

/// Parse a full MQL statement.
pub fn parse(input: &str) -> Result<ParsedQuery, MqlError> {
    Parser::parse_query(input)
}

/// Parse a condition without the `WHERE` keyword.
pub fn parse_condition(input: &str) -> Result<Condition, MqlError> {
    Parser::parse_condition(input)
}

/// Rename a property inside stored condition text. Returns the rewritten
/// text, or `None` when the condition does not mention the property.
pub fn rename_property_in_condition(
    text: &str,
    old: &str,
    new: &str,
) -> Result<Option<String>, MqlError> {
    let mut condition = parse_condition(text)?;
    Ok(condition
        .rename_property(old, new)
        .then(|| condition.to_string()))
}
