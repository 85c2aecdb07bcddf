//! The real transport: `ldap3` behind the `Connector`/`Directory` traits.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapResult, Mod, SearchEntry};
use ldap3::controls::{Control, ControlType, PagedResults};
use tracing::{debug, warn};

use crate::config::DirectoryConfig;
use crate::directory::{
    AttributeChanges, Attributes, Connector, Directory, DirectoryEntry, ModKind, PageCookie, Paging, Scope,
    SearchPage, SearchRequest, Value,
};
use crate::error::{Failure, RC_SUCCESS};


fn ldap_scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::OneLevel => ldap3::Scope::OneLevel,
        Scope::Subtree => ldap3::Scope::Subtree,
    }
}

/// Turns a non-success result into a failure; a success yields the
/// diagnostic text, if any.
fn check_result(result: LdapResult) -> Result<Option<String>, Failure> {
    if result.rc != RC_SUCCESS {
        return Err(Failure::with_code(result.rc, &result.text));
    }
    if result.text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(result.text))
    }
}

fn convert_entry(search_entry: SearchEntry) -> DirectoryEntry {
    let mut attributes = Attributes::new();
    for (key, string_values) in search_entry.attrs {
        for string_value in string_values {
            attributes.push(key.clone(), Value::Text(string_value));
        }
    }
    for (key, bytes_values) in search_entry.bin_attrs {
        for bytes_value in bytes_values {
            attributes.push(key.clone(), Value::from_bytes(bytes_value));
        }
    }
    DirectoryEntry::new(search_entry.dn, attributes)
}

// ldap3 takes a set; order and duplicates are lost here
fn value_set(values: &[Value]) -> HashSet<Vec<u8>> {
    values
        .iter()
        .map(|v| v.as_bytes().to_vec())
        .collect()
}


/// Connects to the server named in a [`DirectoryConfig`] and binds.
pub struct LdapConnector {
    config: DirectoryConfig,
}
impl LdapConnector {
    pub fn new(config: DirectoryConfig) -> Self {
        Self { config }
    }
}
#[async_trait]
impl Connector for LdapConnector {
    fn address(&self) -> String {
        self.config.url.clone()
    }

    async fn connect(&self) -> Result<Box<dyn Directory>, Failure> {
        let mut settings = LdapConnSettings::new()
            .set_starttls(self.config.starttls)
            .set_no_tls_verify(!self.config.tls_verify);
        if let Some(timeout) = self.config.timeout() {
            settings = settings.set_conn_timeout(timeout);
        }

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.config.url).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        debug!(bind_dn = %self.config.bind_dn, "performing simple bind");
        if let Some(timeout) = self.config.timeout() {
            ldap.with_timeout(timeout);
        }
        let result = ldap.simple_bind(&self.config.bind_dn, &self.config.bind_password).await?;
        check_result(result)?;

        Ok(Box::new(LdapConnection {
            ldap,
            timeout: self.config.timeout(),
        }))
    }
}


pub struct LdapConnection {
    ldap: Ldap,
    timeout: Option<Duration>,
}
impl LdapConnection {
    /// The handle for the next operation, with the per-call deadline armed.
    fn handle(&mut self) -> &mut Ldap {
        if let Some(timeout) = self.timeout {
            self.ldap.with_timeout(timeout);
        }
        &mut self.ldap
    }
}
#[async_trait]
impl Directory for LdapConnection {
    async fn search_page(&mut self, request: &SearchRequest, cookie: Option<&PageCookie>) -> Result<SearchPage, Failure> {
        let paged = PagedResults {
            size: i32::try_from(request.page_size).unwrap_or(i32::MAX),
            cookie: cookie.map(|c| c.as_bytes().to_vec()).unwrap_or_default(),
        };
        let attributes: Vec<&str> = request.attributes
            .iter()
            .map(|a| a.as_str())
            .collect();

        let search_result = self.handle()
            .with_controls(paged)
            .search(&request.base_dn, ldap_scope(request.scope), &request.filter, attributes)
            .await?;
        let (result_entries, ldap_result) = (search_result.0, search_result.1);

        let mut paging = Paging::Unsupported;
        for Control(control_type, raw) in &ldap_result.ctrls {
            if let Some(ControlType::PagedResults) = control_type {
                let returned: PagedResults = raw.parse();
                paging = match PageCookie::from_server(returned.cookie) {
                    Some(next) => Paging::More(next),
                    None => Paging::Done,
                };
            }
        }
        check_result(ldap_result)?;

        let entries = result_entries
            .into_iter()
            .filter(|re| !re.is_ref())
            .map(|re| convert_entry(SearchEntry::construct(re)))
            .collect();
        Ok(SearchPage { entries, paging })
    }

    async fn add(&mut self, dn: &str, attributes: &Attributes) -> Result<Option<String>, Failure> {
        let ldap_attributes: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attributes
            .iter()
            .map(|(name, values)| (name.as_bytes().to_vec(), value_set(values)))
            .collect();
        let result = self.handle().add(dn, ldap_attributes).await?;
        check_result(result)
    }

    async fn modify(&mut self, dn: &str, changes: &[AttributeChanges]) -> Result<Option<String>, Failure> {
        let mut mods: Vec<Mod<Vec<u8>>> = Vec::new();
        for change in changes {
            let name = change.attribute.as_bytes().to_vec();
            for (kind, values) in &change.changes {
                let values = value_set(values);
                mods.push(match kind {
                    ModKind::Add => Mod::Add(name.clone(), values),
                    ModKind::Replace => Mod::Replace(name.clone(), values),
                    ModKind::Delete => Mod::Delete(name.clone(), values),
                });
            }
        }
        let result = self.handle().modify(dn, mods).await?;
        check_result(result)
    }

    async fn delete(&mut self, dn: &str) -> Result<Option<String>, Failure> {
        let result = self.handle().delete(dn).await?;
        check_result(result)
    }

    async fn rename(&mut self, dn: &str, new_rdn: &str, new_parent: Option<&str>) -> Result<Option<String>, Failure> {
        let result = self.handle().modifydn(dn, new_rdn, true, new_parent).await?;
        check_result(result)
    }

    async fn unbind(&mut self) -> Result<(), Failure> {
        self.ldap.unbind().await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_value_set_drops_duplicates() {
        let set = value_set(&[Value::from("b"), Value::from("a"), Value::from("b")]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(b"a".as_slice()));
        assert!(set.contains(b"b".as_slice()));
    }

    #[test]
    fn test_convert_entry_merges_binary_values() {
        let search_entry = SearchEntry {
            dn: "CN=a,DC=x".to_owned(),
            attrs: HashMap::from([("cn".to_owned(), vec!["a".to_owned()])]),
            bin_attrs: HashMap::from([("objectGUID".to_owned(), vec![vec![0xFF, 0x00]])]),
        };
        let entry = convert_entry(search_entry);
        assert_eq!(entry.dn, "CN=a,DC=x");
        assert_eq!(entry.attributes.texts("CN"), vec!["a"]);
        assert_eq!(entry.attributes.get("objectguid"), &[Value::Binary(vec![0xFF, 0x00])]);
    }

    #[test]
    fn test_check_result() {
        let ok = LdapResult { rc: 0, matched: String::new(), text: String::new(), refs: Vec::new(), ctrls: Vec::new() };
        assert_eq!(check_result(ok), Ok(None));

        let busy = LdapResult { rc: 51, matched: String::new(), text: "try later".to_owned(), refs: Vec::new(), ctrls: Vec::new() };
        let failure = check_result(busy).unwrap_err();
        assert_eq!(failure.result_code, Some(51));
        assert!(failure.is_transient());
    }
}
