//! Add, modify, delete and rename, each one protocol call under the retry
//! policy.

use async_trait::async_trait;
use tracing::debug;

use crate::directory::{
    group_modifications, is_valid_attribute_name, AttributeChanges, Attributes, Directory, Modification,
};
use crate::dn::{is_valid_dn, is_valid_rdn};
use crate::error::{DirectoryError, Failure, Result};
use crate::retry::{self, Operation};
use crate::session::Session;


/// A successful mutation, with whatever diagnostic text the server sent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MutationOutcome {
    pub diagnostic: Option<String>,
}


fn check_dn(dn: &str) -> Result<()> {
    if dn.trim().is_empty() {
        return Err(DirectoryError::InvalidArgument("DN must not be empty".to_owned()));
    }
    if !is_valid_dn(dn) {
        return Err(DirectoryError::InvalidArgument(format!("malformed DN {:?}", dn)));
    }
    Ok(())
}

fn check_attribute_name(name: &str) -> Result<()> {
    if !is_valid_attribute_name(name) {
        return Err(DirectoryError::InvalidArgument(format!("invalid attribute name {:?}", name)));
    }
    Ok(())
}

fn rejected(dn: &str, failure: Failure) -> DirectoryError {
    DirectoryError::Mutation { dn: dn.to_owned(), cause: failure.message }
}


struct AddEntry<'a> {
    dn: &'a str,
    attributes: &'a Attributes,
}
#[async_trait]
impl<'a> Operation for AddEntry<'a> {
    type Output = Option<String>;
    fn name(&self) -> &'static str { "add" }
    fn target(&self) -> &str { self.dn }
    async fn attempt(&mut self, connection: &mut dyn Directory) -> std::result::Result<Self::Output, Failure> {
        connection.add(self.dn, self.attributes).await
    }
    fn reject(&self, failure: Failure) -> DirectoryError { rejected(self.dn, failure) }
}

struct ModifyEntry<'a> {
    dn: &'a str,
    changes: Vec<AttributeChanges>,
}
#[async_trait]
impl<'a> Operation for ModifyEntry<'a> {
    type Output = Option<String>;
    fn name(&self) -> &'static str { "modify" }
    fn target(&self) -> &str { self.dn }
    async fn attempt(&mut self, connection: &mut dyn Directory) -> std::result::Result<Self::Output, Failure> {
        connection.modify(self.dn, &self.changes).await
    }
    fn reject(&self, failure: Failure) -> DirectoryError { rejected(self.dn, failure) }
}

struct DeleteEntry<'a> {
    dn: &'a str,
}
#[async_trait]
impl<'a> Operation for DeleteEntry<'a> {
    type Output = Option<String>;
    fn name(&self) -> &'static str { "delete" }
    fn target(&self) -> &str { self.dn }
    async fn attempt(&mut self, connection: &mut dyn Directory) -> std::result::Result<Self::Output, Failure> {
        connection.delete(self.dn).await
    }
    fn reject(&self, failure: Failure) -> DirectoryError { rejected(self.dn, failure) }
}

struct RenameEntry<'a> {
    dn: &'a str,
    new_rdn: &'a str,
    new_parent: Option<&'a str>,
}
#[async_trait]
impl<'a> Operation for RenameEntry<'a> {
    type Output = Option<String>;
    fn name(&self) -> &'static str { "rename" }
    fn target(&self) -> &str { self.dn }
    async fn attempt(&mut self, connection: &mut dyn Directory) -> std::result::Result<Self::Output, Failure> {
        connection.rename(self.dn, self.new_rdn, self.new_parent).await
    }
    fn reject(&self, failure: Failure) -> DirectoryError { rejected(self.dn, failure) }
}


pub async fn add_entry(session: &mut Session, dn: &str, attributes: &Attributes) -> Result<MutationOutcome> {
    check_dn(dn)?;
    if attributes.is_empty() {
        return Err(DirectoryError::InvalidArgument(format!("no attributes given for new entry {:?}", dn)));
    }
    for name in attributes.names() {
        check_attribute_name(name)?;
    }

    let mut operation = AddEntry { dn, attributes };
    let diagnostic = retry::run(session, &mut operation).await?;
    Ok(MutationOutcome { diagnostic })
}

/// Applies all modifications in one request, grouped by attribute.
///
/// An empty list is a no-op and does not contact the server.
pub async fn modify_entry(session: &mut Session, dn: &str, modifications: &[Modification]) -> Result<MutationOutcome> {
    check_dn(dn)?;
    for modification in modifications {
        check_attribute_name(&modification.attribute)?;
    }
    if modifications.is_empty() {
        debug!(dn, "nothing to modify");
        return Ok(MutationOutcome::default());
    }

    let mut operation = ModifyEntry { dn, changes: group_modifications(modifications) };
    let diagnostic = retry::run(session, &mut operation).await?;
    Ok(MutationOutcome { diagnostic })
}

pub async fn delete_entry(session: &mut Session, dn: &str) -> Result<MutationOutcome> {
    check_dn(dn)?;

    let mut operation = DeleteEntry { dn };
    let diagnostic = retry::run(session, &mut operation).await?;
    Ok(MutationOutcome { diagnostic })
}

/// Renames the entry in place, or moves it below `new_parent` when given.
pub async fn rename_entry(session: &mut Session, dn: &str, new_rdn: &str, new_parent: Option<&str>) -> Result<MutationOutcome> {
    check_dn(dn)?;
    if !is_valid_rdn(new_rdn) {
        return Err(DirectoryError::InvalidArgument(format!("malformed RDN {:?}", new_rdn)));
    }
    if let Some(parent) = new_parent {
        check_dn(parent)?;
    }

    let mut operation = RenameEntry { dn, new_rdn, new_parent };
    let diagnostic = retry::run(session, &mut operation).await?;
    Ok(MutationOutcome { diagnostic })
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::directory::DirectoryEntry;
    use crate::error::RC_ENTRY_ALREADY_EXISTS;
    use crate::memory::{MemoryDirectory, OpKind};

    fn setup() -> (MemoryDirectory, Session) {
        let directory = MemoryDirectory::new();
        directory.seed_dn("DC=x");
        directory.seed_dn("OU=People,DC=x");
        let session = Session::new(Arc::new(directory.clone()));
        (directory, session)
    }

    #[tokio::test]
    async fn test_add_then_duplicate() {
        let (directory, mut session) = setup();
        let attributes = Attributes::new()
            .with("objectClass", vec!["top", "person"])
            .with("cn", "alice");

        add_entry(&mut session, "CN=alice,OU=People,DC=x", &attributes).await.unwrap();
        assert!(directory.entry("CN=alice,OU=People,DC=x").is_some());

        let result = add_entry(&mut session, "CN=alice,OU=People,DC=x", &attributes).await;
        match result {
            Err(DirectoryError::Mutation { cause, .. }) => assert!(cause.contains(&RC_ENTRY_ALREADY_EXISTS.to_string())),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(directory.calls(OpKind::Add), 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_server() {
        let (directory, mut session) = setup();
        let attributes = Attributes::new().with("cn", "x");

        assert!(matches!(
            add_entry(&mut session, "", &attributes).await,
            Err(DirectoryError::InvalidArgument(_))
        ));
        assert!(matches!(
            add_entry(&mut session, "CN=x,DC=x", &Attributes::new().with("bad name", "x")).await,
            Err(DirectoryError::InvalidArgument(_))
        ));
        assert!(matches!(
            rename_entry(&mut session, "OU=People,DC=x", "no-equals-sign", None).await,
            Err(DirectoryError::InvalidArgument(_))
        ));
        assert_eq!(directory.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_modification_list_is_noop() {
        let (directory, mut session) = setup();
        let outcome = modify_entry(&mut session, "OU=People,DC=x", &[]).await.unwrap();
        assert_eq!(outcome, MutationOutcome::default());
        assert_eq!(directory.calls(OpKind::Modify), 0);
    }

    #[tokio::test]
    async fn test_modifications_sent_as_one_call() {
        let (directory, mut session) = setup();
        directory.seed_dn("CN=admins,DC=x");

        modify_entry(&mut session, "CN=admins,DC=x", &[
            Modification::add("member", "CN=a,DC=x"),
            Modification::replace("description", "admins"),
            Modification::add("member", "CN=b,DC=x"),
        ]).await.unwrap();

        assert_eq!(directory.calls(OpKind::Modify), 1);
        let entry = directory.entry("CN=admins,DC=x").unwrap();
        assert_eq!(entry.attributes.texts("member"), vec!["CN=a,DC=x", "CN=b,DC=x"]);
    }

    #[tokio::test]
    async fn test_steps_on_one_attribute_apply_in_order() {
        let (directory, mut session) = setup();
        let dn = "CN=bob,OU=People,DC=x";
        directory.seed(DirectoryEntry::new(dn, Attributes::new().with("cn", "bob").with("description", "old")));

        modify_entry(&mut session, dn, &[
            Modification::replace("description", "tmp"),
            Modification::clear("description"),
        ]).await.unwrap();
        assert!(!directory.entry(dn).unwrap().attributes.contains("description"));

        modify_entry(&mut session, dn, &[
            Modification::replace("description", "a"),
            Modification::replace("description", "b"),
        ]).await.unwrap();
        assert_eq!(directory.entry(dn).unwrap().attributes.texts("description"), vec!["b"]);
        assert_eq!(directory.calls(OpKind::Modify), 2);
    }

    #[tokio::test]
    async fn test_delete_value_after_delete_all_fails_whole_request() {
        let (directory, mut session) = setup();
        let dn = "CN=bob,OU=People,DC=x";
        directory.seed(DirectoryEntry::new(dn, Attributes::new().with("cn", "bob").with("mail", vec!["a@x", "b@x"])));

        let result = modify_entry(&mut session, dn, &[
            Modification::delete("mail", None::<&str>),
            Modification::delete("mail", "b@x"),
        ]).await;
        assert!(matches!(result, Err(DirectoryError::Mutation { .. })));
        assert_eq!(directory.entry(dn).unwrap().attributes.texts("mail"), vec!["a@x", "b@x"]);
    }

    #[tokio::test]
    async fn test_rename_with_new_parent() {
        let (directory, mut session) = setup();
        directory.seed_dn("OU=Staff,DC=x");
        directory.seed_dn("CN=bob,OU=People,DC=x");

        rename_entry(&mut session, "CN=bob,OU=People,DC=x", "CN=robert", Some("OU=Staff,DC=x")).await.unwrap();
        assert!(directory.entry("CN=bob,OU=People,DC=x").is_none());
        let moved = directory.entry("CN=robert,OU=Staff,DC=x").unwrap();
        assert_eq!(moved.attributes.texts("cn"), vec!["robert"]);
    }
}
