//! Card Wall Query Engine Library
//!
//! MQL parsing and compilation to SQL over a project's card tables, tree
//! membership with cascaded tree filters, and incremental recomputation of
//! aggregate and formula properties. The `cardwall` binary is a thin layer
//! over this library.

pub mod aggregate;
pub mod cards;
pub mod cli;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod filters;
pub mod formula;
pub mod graph;
pub mod mql;
pub mod output;
pub mod properties;
pub mod query;
pub mod schema;
pub mod selection;
pub mod storage;
pub mod tree;

// Re-export commonly used types
pub use aggregate::{RecomputeEngine, RecomputeStats};
pub use config::ProjectConfig;
pub use context::EvaluationContext;
pub use domain::{Card, Project, PropertyDefinition, PropertyKind};
pub use errors::{DomainError, MqlError};
pub use output::{ExitCode, JsonError, JsonOutput};
pub use query::CardQuery;
pub use selection::{BulkUpdateResult, CardSelection};
pub use storage::{CardStore, InMemoryWorkQueue, SqliteCardStore, VersionStore, WorkQueue};
