//! An in-memory directory speaking the same traits as the LDAP transport.
//!
//! Entries are kept in insertion order, which is the order searches return
//! them in. Paging, result codes and scripted failures behave the way a real
//! server would look to the client, so it doubles as the fake server in tests
//! and as the backend of `dirctl --offline`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::directory::{
    AttributeChanges, Attributes, Connector, Directory, DirectoryEntry, ModKind, PageCookie, Paging, Scope,
    SearchPage, SearchRequest, Value,
};
use crate::dn::{dn_to_rdns, is_valid_dn, is_valid_rdn, is_within, leaf_rdn, parent_dn, rename_target, same_dn};
use crate::error::{
    Failure, RC_ATTRIBUTE_OR_VALUE_EXISTS, RC_ENTRY_ALREADY_EXISTS, RC_FILTER_ERROR, RC_INVALID_DN_SYNTAX,
    RC_NOT_ALLOWED_ON_NON_LEAF, RC_NO_SUCH_ATTRIBUTE, RC_NO_SUCH_OBJECT, RC_UNWILLING_TO_PERFORM,
};
use crate::filter::Filter;
use crate::ldif::parse_ldif;


pub const DEFAULT_PAGE_CAP: usize = 1000;

const RC_PROTOCOL_ERROR: u32 = 2;


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OpKind {
    Search,
    Add,
    Modify,
    Delete,
    Rename,
}


#[derive(Debug)]
struct PendingFailure {
    kind: OpKind,
    skip: usize,
    failure: Failure,
}


#[derive(Debug)]
struct Server {
    entries: Vec<DirectoryEntry>,
    page_cap: usize,
    paging_control: bool,
    pending: Vec<PendingFailure>,
    connect_failures: VecDeque<Failure>,
    connects: u64,
    calls: HashMap<OpKind, u64>,
    generation: u64,
}
impl Server {
    fn position(&self, dn: &str) -> Option<usize> {
        self.entries.iter().position(|e| same_dn(&e.dn, dn))
    }

    fn begin(&mut self, kind: OpKind, generation: u64) -> Result<(), Failure> {
        if generation != self.generation {
            return Err(Failure::new("socket closed by peer"));
        }
        *self.calls.entry(kind).or_insert(0) += 1;

        let Some(index) = self.pending.iter().position(|p| p.kind == kind) else {
            return Ok(());
        };
        if self.pending[index].skip > 0 {
            self.pending[index].skip -= 1;
            return Ok(());
        }
        Err(self.pending.remove(index).failure)
    }

    fn search(&self, request: &SearchRequest, cookie: Option<&PageCookie>) -> Result<SearchPage, Failure> {
        let filter = Filter::parse(&request.filter)
            .map_err(|e| Failure::with_code(RC_FILTER_ERROR, e.to_string()))?;
        if !request.base_dn.is_empty() && self.position(&request.base_dn).is_none() {
            return Err(Failure::with_code(RC_NO_SUCH_OBJECT, format!("base {} does not exist", request.base_dn)));
        }

        let matched: Vec<&DirectoryEntry> = self.entries
            .iter()
            .filter(|e| in_scope(&e.dn, &request.base_dn, request.scope))
            .filter(|e| filter.matches(&e.attributes))
            .collect();

        if !self.paging_control {
            return Ok(SearchPage {
                entries: matched.into_iter().map(|e| project(e, &request.attributes)).collect(),
                paging: Paging::Unsupported,
            });
        }

        let offset = match cookie {
            None => 0,
            Some(cookie) => {
                let bytes: [u8; 8] = cookie.as_bytes()
                    .try_into()
                    .map_err(|_| Failure::with_code(RC_PROTOCOL_ERROR, "invalid paging cookie"))?;
                u64::from_be_bytes(bytes) as usize
            },
        };
        let size = (request.page_size.max(1) as usize).min(self.page_cap);
        let start = offset.min(matched.len());
        let end = (start + size).min(matched.len());

        let entries = matched[start..end]
            .iter()
            .map(|e| project(e, &request.attributes))
            .collect();
        let paging = if end < matched.len() {
            match PageCookie::from_server((end as u64).to_be_bytes().to_vec()) {
                Some(next) => Paging::More(next),
                None => Paging::Done,
            }
        } else {
            Paging::Done
        };
        Ok(SearchPage { entries, paging })
    }

    fn add(&mut self, dn: &str, attributes: &Attributes) -> Result<(), Failure> {
        if !is_valid_dn(dn) || dn.trim().is_empty() {
            return Err(Failure::with_code(RC_INVALID_DN_SYNTAX, format!("invalid DN {:?}", dn)));
        }
        if self.position(dn).is_some() {
            return Err(Failure::with_code(RC_ENTRY_ALREADY_EXISTS, ""));
        }
        let parent = parent_dn(dn);
        if !parent.is_empty() && self.position(parent).is_none() {
            return Err(Failure::with_code(RC_NO_SUCH_OBJECT, format!("parent {} does not exist", parent)));
        }
        self.entries.push(DirectoryEntry::new(dn, attributes.clone()));
        Ok(())
    }

    fn modify(&mut self, dn: &str, changes: &[AttributeChanges]) -> Result<(), Failure> {
        let index = self.position(dn)
            .ok_or_else(|| Failure::with_code(RC_NO_SUCH_OBJECT, ""))?;

        // all or nothing
        let mut attributes = self.entries[index].attributes.clone();
        for change in changes {
            for (kind, values) in &change.changes {
                apply_change(&mut attributes, &change.attribute, *kind, values)?;
            }
        }
        self.entries[index].attributes = attributes;
        Ok(())
    }

    fn delete(&mut self, dn: &str) -> Result<(), Failure> {
        let index = self.position(dn)
            .ok_or_else(|| Failure::with_code(RC_NO_SUCH_OBJECT, ""))?;
        let has_children = self.entries
            .iter()
            .any(|e| same_dn(parent_dn(&e.dn), dn));
        if has_children {
            return Err(Failure::with_code(RC_NOT_ALLOWED_ON_NON_LEAF, ""));
        }
        self.entries.remove(index);
        Ok(())
    }

    fn rename(&mut self, dn: &str, new_rdn: &str, new_parent: Option<&str>) -> Result<(), Failure> {
        let index = self.position(dn)
            .ok_or_else(|| Failure::with_code(RC_NO_SUCH_OBJECT, ""))?;
        if !is_valid_rdn(new_rdn) {
            return Err(Failure::with_code(RC_INVALID_DN_SYNTAX, format!("invalid RDN {:?}", new_rdn)));
        }
        if let Some(parent) = new_parent {
            if !parent.is_empty() && self.position(parent).is_none() {
                return Err(Failure::with_code(RC_NO_SUCH_OBJECT, format!("new parent {} does not exist", parent)));
            }
            if is_within(parent, dn) {
                return Err(Failure::with_code(RC_UNWILLING_TO_PERFORM, "cannot move an entry below itself"));
            }
        }
        let old_dn = self.entries[index].dn.clone();
        let target = rename_target(&old_dn, new_rdn, new_parent);
        if !same_dn(&target, &old_dn) && self.position(&target).is_some() {
            return Err(Failure::with_code(RC_ENTRY_ALREADY_EXISTS, ""));
        }

        // naming attribute follows the RDN
        let entry = &mut self.entries[index];
        if let Some(old) = dn_to_rdns(leaf_rdn(&old_dn)).and_then(|r| r.into_iter().next()) {
            if let Some(values) = entry.attributes.values_mut(&old.key) {
                values.retain(|v| v.as_bytes() != old.value.as_slice());
            }
            if entry.attributes.get(&old.key).is_empty() {
                entry.attributes.remove(&old.key);
            }
        }
        if let Some(new) = dn_to_rdns(new_rdn).and_then(|r| r.into_iter().next()) {
            entry.attributes.push(new.key, Value::from_bytes(new.value));
        }
        entry.dn = target.clone();

        let old_depth = dn_to_rdns(&old_dn).map(|r| r.len()).unwrap_or(0);
        for other in self.entries.iter_mut() {
            if same_dn(&other.dn, &target) || !is_within(&other.dn, &old_dn) {
                continue;
            }
            let depth = dn_to_rdns(&other.dn).map(|r| r.len()).unwrap_or(0);
            let mut rest = other.dn.as_str();
            for _ in 0..depth.saturating_sub(old_depth) {
                rest = parent_dn(rest);
            }
            let prefix = other.dn[..other.dn.len() - rest.len()].trim_end().trim_end_matches(',');
            other.dn = format!("{},{}", prefix, target);
        }
        Ok(())
    }
}

fn in_scope(dn: &str, base: &str, scope: Scope) -> bool {
    match scope {
        Scope::Base => same_dn(dn, base),
        Scope::OneLevel => same_dn(parent_dn(dn), base) && !same_dn(dn, base),
        Scope::Subtree => is_within(dn, base),
    }
}

fn project(entry: &DirectoryEntry, requested: &[String]) -> DirectoryEntry {
    if requested.is_empty() || requested.iter().any(|r| r == "*") {
        return entry.clone();
    }
    let mut attributes = Attributes::new();
    for name in requested {
        let values = entry.attributes.get(name);
        if !values.is_empty() {
            attributes.set(name.clone(), values.to_vec());
        }
    }
    DirectoryEntry::new(entry.dn.clone(), attributes)
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_text(), b.as_text()) {
        (Some(a), Some(b)) => a.to_lowercase() == b.to_lowercase(),
        _ => a.as_bytes() == b.as_bytes(),
    }
}

fn apply_change(attributes: &mut Attributes, attribute: &str, kind: ModKind, values: &[Value]) -> Result<(), Failure> {
    match kind {
        ModKind::Replace => {
            attributes.set(attribute, values.to_vec());
        },
        ModKind::Add => {
            if values.is_empty() {
                return Err(Failure::with_code(RC_PROTOCOL_ERROR, format!("no values to add to {}", attribute)));
            }
            for value in values {
                if attributes.get(attribute).iter().any(|v| same_value(v, value)) {
                    return Err(Failure::with_code(RC_ATTRIBUTE_OR_VALUE_EXISTS, format!("{} already has that value", attribute)));
                }
                attributes.push(attribute, value.clone());
            }
        },
        ModKind::Delete => {
            if !attributes.contains(attribute) {
                return Err(Failure::with_code(RC_NO_SUCH_ATTRIBUTE, attribute));
            }
            if values.is_empty() {
                attributes.remove(attribute);
                return Ok(());
            }
            for value in values {
                let Some(existing) = attributes.values_mut(attribute) else {
                    return Err(Failure::with_code(RC_NO_SUCH_ATTRIBUTE, attribute));
                };
                let Some(position) = existing.iter().position(|v| same_value(v, value)) else {
                    return Err(Failure::with_code(RC_NO_SUCH_ATTRIBUTE, format!("{} does not have that value", attribute)));
                };
                existing.remove(position);
                if existing.is_empty() {
                    attributes.remove(attribute);
                }
            }
        },
    }
    Ok(())
}


/// Handle to an in-memory directory; clones share the same data.
#[derive(Clone, Debug)]
pub struct MemoryDirectory {
    server: Arc<Mutex<Server>>,
}
impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            server: Arc::new(Mutex::new(Server {
                entries: Vec::new(),
                page_cap: DEFAULT_PAGE_CAP,
                paging_control: true,
                pending: Vec::new(),
                connect_failures: VecDeque::new(),
                connects: 0,
                calls: HashMap::new(),
                generation: 0,
            })),
        }
    }

    /// Loads the content records of an LDIF document.
    pub fn from_ldif(ldif: &str) -> Self {
        let directory = Self::new();
        for entry in parse_ldif(ldif) {
            directory.seed(entry);
        }
        directory
    }

    /// Inserts an entry directly, bypassing all server-side checks.
    pub fn seed(&self, entry: DirectoryEntry) {
        self.server.lock().entries.push(entry);
    }

    /// Inserts a bare entry carrying only its naming attribute.
    pub fn seed_dn(&self, dn: &str) {
        let mut attributes = Attributes::new().with("objectClass", "top");
        if let Some(rdn) = dn_to_rdns(leaf_rdn(dn)).and_then(|r| r.into_iter().next()) {
            attributes.push(rdn.key, Value::from_bytes(rdn.value));
        }
        self.seed(DirectoryEntry::new(dn, attributes));
    }

    /// Largest page the server hands out regardless of the requested size.
    pub fn set_page_cap(&self, page_cap: usize) {
        self.server.lock().page_cap = page_cap.max(1);
    }

    /// Whether search responses carry a paging control.
    pub fn set_paging_control(&self, enabled: bool) {
        self.server.lock().paging_control = enabled;
    }

    /// Makes the next call of the given kind fail.
    pub fn fail_next(&self, kind: OpKind, failure: Failure) {
        self.fail_after(kind, 0, failure);
    }

    /// Makes a call of the given kind fail after `skip` more successful ones.
    pub fn fail_after(&self, kind: OpKind, skip: usize, failure: Failure) {
        self.server.lock().pending.push(PendingFailure { kind, skip, failure });
    }

    pub fn fail_next_connect(&self, failure: Failure) {
        self.server.lock().connect_failures.push_back(failure);
    }

    /// Severs every open connection, as if the server dropped its sockets.
    pub fn drop_connections(&self) {
        self.server.lock().generation += 1;
    }

    pub fn connect_count(&self) -> u64 {
        self.server.lock().connects
    }

    /// Physical calls of the given kind, failed ones included.
    pub fn calls(&self, kind: OpKind) -> u64 {
        self.server.lock().calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn entry(&self, dn: &str) -> Option<DirectoryEntry> {
        let server = self.server.lock();
        server.position(dn).map(|i| server.entries[i].clone())
    }

    pub fn len(&self) -> usize {
        self.server.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
impl Default for MemoryDirectory {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Connector for MemoryDirectory {
    fn address(&self) -> String {
        "memory".to_owned()
    }

    async fn connect(&self) -> Result<Box<dyn Directory>, Failure> {
        let mut server = self.server.lock();
        if let Some(failure) = server.connect_failures.pop_front() {
            return Err(failure);
        }
        server.connects += 1;
        Ok(Box::new(MemoryConnection {
            server: Arc::clone(&self.server),
            generation: server.generation,
        }))
    }
}


struct MemoryConnection {
    server: Arc<Mutex<Server>>,
    generation: u64,
}
#[async_trait]
impl Directory for MemoryConnection {
    async fn search_page(&mut self, request: &SearchRequest, cookie: Option<&PageCookie>) -> Result<SearchPage, Failure> {
        let mut server = self.server.lock();
        server.begin(OpKind::Search, self.generation)?;
        server.search(request, cookie)
    }

    async fn add(&mut self, dn: &str, attributes: &Attributes) -> Result<Option<String>, Failure> {
        let mut server = self.server.lock();
        server.begin(OpKind::Add, self.generation)?;
        server.add(dn, attributes).map(|()| None)
    }

    async fn modify(&mut self, dn: &str, changes: &[AttributeChanges]) -> Result<Option<String>, Failure> {
        let mut server = self.server.lock();
        server.begin(OpKind::Modify, self.generation)?;
        server.modify(dn, changes).map(|()| None)
    }

    async fn delete(&mut self, dn: &str) -> Result<Option<String>, Failure> {
        let mut server = self.server.lock();
        server.begin(OpKind::Delete, self.generation)?;
        server.delete(dn).map(|()| None)
    }

    async fn rename(&mut self, dn: &str, new_rdn: &str, new_parent: Option<&str>) -> Result<Option<String>, Failure> {
        let mut server = self.server.lock();
        server.begin(OpKind::Rename, self.generation)?;
        server.rename(dn, new_rdn, new_parent).map(|()| None)
    }

    async fn unbind(&mut self) -> Result<(), Failure> {
        if self.server.lock().generation != self.generation {
            return Err(Failure::new("socket closed by peer"));
        }
        Ok(())
    }
}
