//! The handle callers hold: one shared session, serialized.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::cache::SearchCache;
use crate::config::DirectoryConfig;
use crate::directory::{Attributes, Connector, DirectoryEntry, Modification, SearchRequest, DEFAULT_PAGE_SIZE};
use crate::dn::rename_target;
use crate::error::Result;
use crate::ldap::LdapConnector;
use crate::mutation::{self, MutationOutcome};
use crate::search;
use crate::session::Session;


/// Cheap to clone; all clones share the one session.
///
/// Every call holds the session lock until it has finished, retries
/// included, so protocol calls never interleave on the connection.
#[derive(Clone)]
pub struct DirectoryClient {
    session: Arc<Mutex<Session>>,
    base_dn: String,
    page_size: u32,
    cache: Option<Arc<SearchCache>>,
    audit: Option<(Arc<dyn AuditSink>, String)>,
}
impl DirectoryClient {
    pub fn new<B: Into<String>>(connector: Arc<dyn Connector>, base_dn: B) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session::new(connector))),
            base_dn: base_dn.into(),
            page_size: DEFAULT_PAGE_SIZE,
            cache: None,
            audit: None,
        }
    }

    /// A client for the LDAP server the configuration names. Does not
    /// connect yet.
    pub fn from_config(config: &DirectoryConfig) -> Result<Self> {
        config.validate()?;
        let connector = Arc::new(LdapConnector::new(config.clone()));
        Ok(Self::new(connector, config.base_dn.clone()).with_page_size(config.page_size))
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Caches search results for `ttl`; mutations through this client
    /// invalidate what they touch.
    pub fn with_cache(mut self, ttl: Duration) -> Self {
        self.cache = Some(Arc::new(SearchCache::new(ttl)));
        self
    }

    pub fn with_audit<O: Into<String>>(mut self, sink: Arc<dyn AuditSink>, operator: O) -> Self {
        self.audit = Some((sink, operator.into()));
        self
    }

    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub async fn connect(&self) -> Result<()> {
        self.session.lock().await.connect().await
    }

    pub async fn disconnect(&self) {
        self.session.lock().await.disconnect().await
    }

    pub async fn is_bound(&self) -> bool {
        self.session.lock().await.is_bound()
    }

    pub async fn reconnect_count(&self) -> u64 {
        self.session.lock().await.reconnect_count()
    }

    /// Searches the subtree below `base_dn` (the configured base if empty).
    /// An empty attribute list requests all user attributes.
    pub async fn search(&self, base_dn: &str, filter: &str, attributes: &[&str]) -> Result<Vec<DirectoryEntry>> {
        let base_dn = if base_dn.is_empty() { self.base_dn.as_str() } else { base_dn };
        let request = SearchRequest::new(base_dn, filter)
            .attributes(attributes.iter().copied())
            .page_size(self.page_size);
        self.search_with(&request).await
    }

    pub async fn search_with(&self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>> {
        if let Some(cache) = &self.cache {
            if let Some(entries) = cache.get(request) {
                debug!(base = %request.base_dn, filter = %request.filter, "search answered from cache");
                return Ok(entries);
            }
        }

        // cache inserts and invalidations both happen under the session lock
        let mut session = self.session.lock().await;
        let entries = search::search(&mut session, request).await?;
        if let Some(cache) = &self.cache {
            cache.insert(request, entries.clone());
        }
        Ok(entries)
    }

    pub async fn add_entry(&self, dn: &str, attributes: &Attributes) -> Result<MutationOutcome> {
        let mut session = self.session.lock().await;
        let outcome = mutation::add_entry(&mut session, dn, attributes).await?;
        self.invalidate(dn, None);
        drop(session);
        self.audit(AuditAction::Add, dn, None).await;
        Ok(outcome)
    }

    pub async fn modify_entry(&self, dn: &str, modifications: &[Modification]) -> Result<MutationOutcome> {
        let mut session = self.session.lock().await;
        let outcome = mutation::modify_entry(&mut session, dn, modifications).await?;
        if modifications.is_empty() {
            return Ok(outcome);
        }
        self.invalidate(dn, None);
        drop(session);
        self.audit(AuditAction::Modify, dn, None).await;
        Ok(outcome)
    }

    pub async fn delete_entry(&self, dn: &str) -> Result<MutationOutcome> {
        let mut session = self.session.lock().await;
        let outcome = mutation::delete_entry(&mut session, dn).await?;
        self.invalidate(dn, None);
        drop(session);
        self.audit(AuditAction::Delete, dn, None).await;
        Ok(outcome)
    }

    pub async fn rename_entry(&self, dn: &str, new_rdn: &str, new_parent: Option<&str>) -> Result<MutationOutcome> {
        let mut session = self.session.lock().await;
        let outcome = mutation::rename_entry(&mut session, dn, new_rdn, new_parent).await?;
        let new_dn = rename_target(dn, new_rdn, new_parent);
        self.invalidate(dn, Some(&new_dn));
        drop(session);
        self.audit(AuditAction::Rename, dn, Some(new_dn)).await;
        Ok(outcome)
    }

    /// Called with the session lock held, like the cache insert in
    /// [`Self::search_with`].
    fn invalidate(&self, dn: &str, new_dn: Option<&str>) {
        if let Some(cache) = &self.cache {
            cache.invalidate(dn);
            if let Some(new_dn) = new_dn {
                cache.invalidate(new_dn);
            }
        }
    }

    async fn audit(&self, action: AuditAction, dn: &str, new_dn: Option<String>) {
        if let Some((sink, operator)) = &self.audit {
            let mut event = AuditEvent::new(operator.clone(), action, dn);
            event.new_dn = new_dn;
            sink.record(event).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::error::DirectoryError;
    use crate::memory::{MemoryDirectory, OpKind};

    fn client() -> (MemoryDirectory, DirectoryClient) {
        let directory = MemoryDirectory::new();
        directory.seed_dn("DC=x");
        directory.seed_dn("OU=People,DC=x");
        let client = DirectoryClient::new(Arc::new(directory.clone()), "DC=x");
        (directory, client)
    }

    #[tokio::test]
    async fn test_empty_base_uses_configured_base() {
        let (_directory, client) = client();
        let entries = client.search("", "(ou=People)", &["ou"]).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dn, "OU=People,DC=x");
        assert!(client.is_bound().await);
    }

    #[tokio::test]
    async fn test_audit_only_after_success() {
        let (_directory, client) = client();
        let sink = Arc::new(MemoryAuditSink::new());
        let client = client.with_audit(sink.clone(), "alice");

        client.delete_entry("OU=People,DC=x").await.unwrap();
        let result = client.delete_entry("OU=People,DC=x").await;
        assert!(matches!(result, Err(DirectoryError::Mutation { .. })));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operator, "alice");
        assert_eq!(events[0].action, AuditAction::Delete);
    }

    #[tokio::test]
    async fn test_cache_is_invalidated_by_writes() {
        let (directory, client) = client();
        let client = client.with_cache(Duration::from_secs(300));

        let before = client.search("OU=People,DC=x", "(objectClass=*)", &[]).await.unwrap();
        client.search("OU=People,DC=x", "(objectClass=*)", &[]).await.unwrap();
        assert_eq!(directory.calls(OpKind::Search), 1);

        client.add_entry("CN=carol,OU=People,DC=x", &Attributes::new().with("cn", "carol")).await.unwrap();
        let after = client.search("OU=People,DC=x", "(objectClass=*)", &[]).await.unwrap();
        assert_eq!(directory.calls(OpKind::Search), 2);
        assert_eq!(after.len(), before.len() + 1);
    }

    #[tokio::test]
    async fn test_rename_invalidates_destination() {
        let (directory, client) = client();
        directory.seed_dn("OU=Staff,DC=x");
        directory.seed_dn("CN=bob,OU=People,DC=x");
        let client = client.with_cache(Duration::from_secs(300));

        let staff = client.search("OU=Staff,DC=x", "(cn=*)", &[]).await.unwrap();
        assert!(staff.is_empty());

        client.rename_entry("CN=bob,OU=People,DC=x", "CN=bob", Some("OU=Staff,DC=x")).await.unwrap();
        let staff = client.search("OU=Staff,DC=x", "(cn=*)", &[]).await.unwrap();
        assert_eq!(staff.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_search_queued_before_write_leaves_no_stale_cache() {
        let (directory, client) = client();
        directory.seed_dn("CN=bob,OU=People,DC=x");
        let client = client.with_cache(Duration::from_secs(300));

        let held = client.session.lock().await;
        let search = {
            let client = client.clone();
            tokio::spawn(async move { client.search("CN=bob,OU=People,DC=x", "(cn=*)", &["description"]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let write = {
            let client = client.clone();
            tokio::spawn(async move {
                client.modify_entry("CN=bob,OU=People,DC=x", &[Modification::replace("description", "new")]).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let before = search.await.unwrap().unwrap();
        write.await.unwrap().unwrap();
        assert!(before[0].attributes.get("description").is_empty());

        let after = client.search("CN=bob,OU=People,DC=x", "(cn=*)", &["description"]).await.unwrap();
        assert_eq!(after[0].attributes.texts("description"), vec!["new"]);
        assert_eq!(directory.calls(OpKind::Search), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_connection() {
        let (directory, client) = client();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let dn = format!("CN=user{},OU=People,DC=x", i);
                client.add_entry(&dn, &Attributes::new().with("cn", format!("user{}", i))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(directory.connect_count(), 1);
        assert_eq!(directory.calls(OpKind::Add), 8);
    }
}
