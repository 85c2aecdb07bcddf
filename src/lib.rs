//! Client-side access to an LDAP directory that survives dropped connections:
//! transparent paging, one reconnect-and-retry per operation, and typed
//! entries and modifications.

pub mod audit;
pub mod cache;
pub mod client;
pub mod config;
pub mod directory;
pub mod dn;
pub mod error;
pub mod filetime;
pub mod filter;
pub mod ldap;
pub mod ldif;
pub mod memory;
pub mod mutation;
pub mod retry;
pub mod search;
pub mod session;


pub use crate::client::DirectoryClient;
pub use crate::config::DirectoryConfig;
pub use crate::directory::{
    dedup_by_dn, Attributes, DirectoryEntry, ModKind, Modification, Scope, SearchRequest, Value,
};
pub use crate::error::{DirectoryError, Failure, Result};
pub use crate::filter::{escape_filter_value, Filter};
pub use crate::mutation::MutationOutcome;
