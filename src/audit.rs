//! Write-behind record of who changed what, fired after a mutation succeeds.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AuditAction {
    Add,
    Modify,
    Delete,
    Rename,
}
impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
            Self::Rename => write!(f, "rename"),
        }
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuditEvent {
    pub operator: String,
    pub action: AuditAction,
    pub dn: String,
    /// For renames, where the entry ended up.
    pub new_dn: Option<String>,
    pub timestamp: DateTime<Utc>,
}
impl AuditEvent {
    pub fn new<O: Into<String>, D: Into<String>>(operator: O, action: AuditAction, dn: D) -> Self {
        Self {
            operator: operator.into(),
            action,
            dn: dn.into(),
            new_dn: None,
            timestamp: Utc::now(),
        }
    }
}


#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}


/// Emits every event as an `info` log line.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;
#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        info!(
            operator = %event.operator,
            action = %event.action,
            dn = %event.dn,
            new_dn = ?event.new_dn,
            timestamp = %event.timestamp.to_rfc3339(),
            "directory audit"
        );
    }
}


/// Keeps events in memory, for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}
impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}
#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
