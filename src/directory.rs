use std::collections::BTreeMap;
use std::collections::btree_map;

use async_trait::async_trait;
use unicase::UniCase;

use crate::error::Failure;


pub const DEFAULT_PAGE_SIZE: u32 = 1000;


/// A single attribute value as delivered by the server.
///
/// Values that are valid UTF-8 are kept as text; anything else is preserved
/// byte-for-byte.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Value {
    Text(String),
    Binary(Vec<u8>),
}
impl Value {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Binary(e.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self { Self::Text(value.to_owned()) }
}
impl From<String> for Value {
    fn from(value: String) -> Self { Self::Text(value) }
}
impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self { Self::Binary(value) }
}


/// Anything that can stand in for an attribute's value list.
///
/// A bare scalar becomes a one-element list, `None` becomes an empty list.
pub trait IntoValues {
    fn into_values(self) -> Vec<Value>;
}
impl IntoValues for Value {
    fn into_values(self) -> Vec<Value> { vec![self] }
}
impl IntoValues for &str {
    fn into_values(self) -> Vec<Value> { vec![Value::from(self)] }
}
impl IntoValues for String {
    fn into_values(self) -> Vec<Value> { vec![Value::from(self)] }
}
impl<T: Into<Value>> IntoValues for Vec<T> {
    fn into_values(self) -> Vec<Value> { self.into_iter().map(Into::into).collect() }
}
impl<T: Into<Value> + Clone> IntoValues for &[T] {
    fn into_values(self) -> Vec<Value> { self.iter().cloned().map(Into::into).collect() }
}
impl<T: IntoValues> IntoValues for Option<T> {
    fn into_values(self) -> Vec<Value> {
        match self {
            Some(values) => values.into_values(),
            None => Vec::new(),
        }
    }
}


/// Attribute names are ASCII alphanumerics and hyphens starting with a letter,
/// or a numeric OID.
pub fn is_valid_attribute_name(name: &str) -> bool {
    let Some(first) = name.chars().next() else { return false };
    if first.is_ascii_alphabetic() {
        name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    } else if first.is_ascii_digit() {
        name.split('.').all(|arc| arc.len() > 0 && arc.chars().all(|c| c.is_ascii_digit()))
    } else {
        false
    }
}


/// Case-insensitive mapping from attribute name to its ordered values.
///
/// Missing attributes read as an empty list; an attribute is never stored
/// with zero values.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Attributes {
    values: BTreeMap<UniCase<String>, Vec<Value>>,
}
impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<N: Into<String>, V: IntoValues>(mut self, name: N, values: V) -> Self {
        self.set(name, values);
        self
    }

    pub fn get(&self, name: &str) -> &[Value] {
        self.values
            .get(&UniCase::new(name.to_owned()))
            .map(|values| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&UniCase::new(name.to_owned()))
    }

    /// The text values of the attribute, in server order.
    pub fn texts(&self, name: &str) -> Vec<&str> {
        self.get(name)
            .iter()
            .filter_map(|v| v.as_text())
            .collect()
    }

    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .iter()
            .find_map(|v| v.as_text())
    }

    /// Replaces the values of an attribute; an empty list removes it.
    pub fn set<N: Into<String>, V: IntoValues>(&mut self, name: N, values: V) {
        let values = values.into_values();
        let key = UniCase::new(name.into());
        if values.is_empty() {
            self.values.remove(&key);
        } else {
            self.values.insert(key, values);
        }
    }

    pub fn push<N: Into<String>, V: Into<Value>>(&mut self, name: N, value: V) {
        self.values
            .entry(UniCase::new(name.into()))
            .or_insert_with(Vec::new)
            .push(value.into());
    }

    pub fn remove(&mut self, name: &str) -> Vec<Value> {
        self.values
            .remove(&UniCase::new(name.to_owned()))
            .unwrap_or_default()
    }

    pub(crate) fn values_mut(&mut self, name: &str) -> Option<&mut Vec<Value>> {
        self.values.get_mut(&UniCase::new(name.to_owned()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.values.iter().map(|(k, v)| (k.as_ref(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
impl<N: Into<String>> FromIterator<(N, Vec<Value>)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (N, Vec<Value>)>>(iter: T) -> Self {
        let mut attributes = Self::new();
        for (name, values) in iter {
            let name: String = name.into();
            for value in values {
                attributes.push(name.clone(), value);
            }
        }
        attributes
    }
}
impl IntoIterator for Attributes {
    type Item = (UniCase<String>, Vec<Value>);
    type IntoIter = btree_map::IntoIter<UniCase<String>, Vec<Value>>;
    fn into_iter(self) -> Self::IntoIter { self.values.into_iter() }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: Attributes,
}
impl DirectoryEntry {
    pub fn new<D: Into<String>>(dn: D, attributes: Attributes) -> Self {
        Self { dn: dn.into(), attributes }
    }
}


/// Drops every entry whose DN was already seen, keeping the first occurrence.
///
/// A paged search that had to restart after a reconnect re-emits entries from
/// the pages it had already read; callers that need each entry once apply this.
pub fn dedup_by_dn(entries: Vec<DirectoryEntry>) -> Vec<DirectoryEntry> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.dn.to_lowercase()))
        .collect()
}


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Scope {
    Base,
    OneLevel,
    #[default]
    Subtree,
}


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: Scope,
    pub filter: String,
    /// Requested attribute names; empty means all user attributes.
    pub attributes: Vec<String>,
    pub page_size: u32,
}
impl SearchRequest {
    pub fn new<B: Into<String>, F: Into<String>>(base_dn: B, filter: F) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: Scope::Subtree,
            filter: filter.into(),
            attributes: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn attributes<I: IntoIterator<Item = S>, S: Into<String>>(mut self, attributes: I) -> Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}


/// Opaque continuation token issued by the server between pages.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PageCookie(Vec<u8>);
impl PageCookie {
    /// Wraps a server cookie; an empty cookie means there is no next page.
    pub fn from_server(bytes: Vec<u8>) -> Option<Self> {
        if bytes.is_empty() {
            None
        } else {
            Some(Self(bytes))
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Paging {
    More(PageCookie),
    Done,
    /// The server did not return a paging control at all.
    Unsupported,
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchPage {
    pub entries: Vec<DirectoryEntry>,
    pub paging: Paging,
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ModKind {
    Add,
    Replace,
    Delete,
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Modification {
    pub kind: ModKind,
    pub attribute: String,
    pub values: Vec<Value>,
}
impl Modification {
    pub fn new<N: Into<String>, V: IntoValues>(kind: ModKind, attribute: N, values: V) -> Self {
        Self { kind, attribute: attribute.into(), values: values.into_values() }
    }

    pub fn add<N: Into<String>, V: IntoValues>(attribute: N, values: V) -> Self {
        Self::new(ModKind::Add, attribute, values)
    }

    pub fn replace<N: Into<String>, V: IntoValues>(attribute: N, values: V) -> Self {
        Self::new(ModKind::Replace, attribute, values)
    }

    pub fn delete<N: Into<String>, V: IntoValues>(attribute: N, values: V) -> Self {
        Self::new(ModKind::Delete, attribute, values)
    }

    /// Replace with no values, which removes the attribute.
    pub fn clear<N: Into<String>>(attribute: N) -> Self {
        Self::new(ModKind::Replace, attribute, Vec::<Value>::new())
    }
}


/// All changes to one attribute within a modify request, in request order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeChanges {
    pub attribute: String,
    pub changes: Vec<(ModKind, Vec<Value>)>,
}

/// Groups modifications by attribute name (first appearance wins the
/// position). Consecutive adds are merged; every replace and delete stays
/// its own step, since merging those changes the result.
pub fn group_modifications(modifications: &[Modification]) -> Vec<AttributeChanges> {
    let mut grouped: Vec<AttributeChanges> = Vec::new();
    for modification in modifications {
        let position = grouped
            .iter()
            .position(|g| g.attribute.eq_ignore_ascii_case(&modification.attribute));
        let index = match position {
            Some(p) => p,
            None => {
                grouped.push(AttributeChanges {
                    attribute: modification.attribute.clone(),
                    changes: Vec::new(),
                });
                grouped.len() - 1
            },
        };
        let group = &mut grouped[index];
        match group.changes.last_mut() {
            Some((ModKind::Add, values)) if modification.kind == ModKind::Add => {
                values.extend(modification.values.iter().cloned());
            },
            _ => {
                group.changes.push((modification.kind, modification.values.clone()));
            },
        }
    }
    grouped
}


/// Opens bound connections to a directory.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable address of the directory, for logging.
    fn address(&self) -> String;

    /// Connects and performs the bind handshake.
    async fn connect(&self) -> Result<Box<dyn Directory>, Failure>;
}


/// Raw protocol calls on one bound connection.
///
/// Successful mutations return the server's diagnostic text, if any.
#[async_trait]
pub trait Directory: Send {
    async fn search_page(&mut self, request: &SearchRequest, cookie: Option<&PageCookie>) -> Result<SearchPage, Failure>;
    /// The LDAP transport sends each attribute's values as a set, so value
    /// order and duplicate values are not preserved on the wire.
    async fn add(&mut self, dn: &str, attributes: &Attributes) -> Result<Option<String>, Failure>;
    /// Same as [`Directory::add`] for the values of each step: they travel as
    /// a set over LDAP. The steps themselves keep their order.
    async fn modify(&mut self, dn: &str, changes: &[AttributeChanges]) -> Result<Option<String>, Failure>;
    async fn delete(&mut self, dn: &str) -> Result<Option<String>, Failure>;
    async fn rename(&mut self, dn: &str, new_rdn: &str, new_parent: Option<&str>) -> Result<Option<String>, Failure>;
    async fn unbind(&mut self) -> Result<(), Failure>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_attribute_is_empty() {
        let attributes = Attributes::new().with("cn", "alice");
        assert!(attributes.get("mail").is_empty());
        assert_eq!(attributes.texts("CN"), vec!["alice"]);
        assert_eq!(attributes.first_text("Cn"), Some("alice"));
    }

    #[test]
    fn test_scalar_normalized_to_list() {
        let attributes = Attributes::new()
            .with("objectClass", vec!["top", "person"])
            .with("sn", "Smith")
            .with("description", None::<&str>);
        assert_eq!(attributes.get("objectclass").len(), 2);
        assert_eq!(attributes.get("sn"), &[Value::Text("Smith".to_owned())]);
        assert!(!attributes.contains("description"));
    }

    #[test]
    fn test_value_from_bytes() {
        assert_eq!(Value::from_bytes(b"abc".to_vec()), Value::Text("abc".to_owned()));
        assert_eq!(Value::from_bytes(vec![0xFF, 0x00]), Value::Binary(vec![0xFF, 0x00]));
        assert_eq!(Value::Binary(vec![0xFF]).as_bytes(), &[0xFF]);
    }

    #[test]
    fn test_attribute_names() {
        assert!(is_valid_attribute_name("sAMAccountName"));
        assert!(is_valid_attribute_name("msDS-UserPasswordExpiryTimeComputed"));
        assert!(is_valid_attribute_name("2.5.4.3"));
        assert!(!is_valid_attribute_name(""));
        assert!(!is_valid_attribute_name("cn=x"));
        assert!(!is_valid_attribute_name("-cn"));
        assert!(!is_valid_attribute_name("2..5"));
    }

    #[test]
    fn test_group_modifications() {
        let grouped = group_modifications(&[
            Modification::add("member", "CN=a"),
            Modification::replace("description", "x"),
            Modification::add("Member", "CN=b"),
            Modification::delete("member", "CN=c"),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].attribute, "member");
        assert_eq!(grouped[0].changes, vec![
            (ModKind::Add, vec![Value::from("CN=a"), Value::from("CN=b")]),
            (ModKind::Delete, vec![Value::from("CN=c")]),
        ]);
        assert_eq!(grouped[1].changes, vec![(ModKind::Replace, vec![Value::from("x")])]);
    }

    #[test]
    fn test_group_keeps_replace_and_delete_steps() {
        let grouped = group_modifications(&[
            Modification::replace("description", "tmp"),
            Modification::clear("description"),
            Modification::replace("description", "a"),
            Modification::replace("description", "b"),
            Modification::delete("description", None::<&str>),
            Modification::delete("description", "v"),
        ]);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].changes, vec![
            (ModKind::Replace, vec![Value::from("tmp")]),
            (ModKind::Replace, vec![]),
            (ModKind::Replace, vec![Value::from("a")]),
            (ModKind::Replace, vec![Value::from("b")]),
            (ModKind::Delete, vec![]),
            (ModKind::Delete, vec![Value::from("v")]),
        ]);
    }

    #[test]
    fn test_dedup_by_dn() {
        let entries = vec![
            DirectoryEntry::new("CN=a,DC=x", Attributes::new()),
            DirectoryEntry::new("CN=b,DC=x", Attributes::new()),
            DirectoryEntry::new("cn=A,DC=x", Attributes::new()),
        ];
        let deduped = dedup_by_dn(entries);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].dn, "CN=a,DC=x");
    }

    #[test]
    fn test_page_cookie_empty_is_none() {
        assert!(PageCookie::from_server(Vec::new()).is_none());
        assert_eq!(PageCookie::from_server(vec![1, 2]).unwrap().as_bytes(), &[1, 2]);
    }
}
