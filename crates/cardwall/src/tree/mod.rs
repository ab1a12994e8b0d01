//! Card trees: configurations, relationship maps, membership and cascaded
//! filters.

pub mod config;
pub mod filters;
pub mod membership;
pub mod relationships;

pub use config::{relationship_name, TreeConfiguration};
pub use filters::TreeFilters;
pub use membership::{MembershipChange, RemovalMode, TreeMembership};
pub use relationships::RelationshipsMap;
