//! # AWS Integration
//!
//! Execution-context management and dynamic target discovery for
//! multi-account operation.

pub mod context;
pub mod discovery;

pub use context::{CallerIdentity, ExecutionContext, OrganizationInfo};
pub use discovery::DiscoveryService;

/// Basic AWS account information, as surfaced by Organizations and the
/// discovery sources.
#[derive(Debug, Clone, Default)]
pub struct AccountInfo {
    pub id: String,
    pub name: String,
    pub email: String,
    pub status: String,
    pub tags: std::collections::BTreeMap<String, String>,
}
