//! Connection configuration.
//!
//! Example config file:
//! ```toml
//! url = "ldaps://dc01.example.com"
//! base_dn = "DC=example,DC=com"
//! bind_dn = "CN=svc-admin,OU=Service,DC=example,DC=com"
//! bind_password = "secret"
//! tls_verify = false
//! page_size = 1000
//! timeout_secs = 30
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::DEFAULT_PAGE_SIZE;
use crate::error::DirectoryError;


#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
pub struct DirectoryConfig {
    /// `ldap://`, `ldaps://` or `ldapi://` URL of the server.
    pub url: String,

    pub base_dn: String,

    pub bind_dn: String,

    #[serde(default)]
    pub bind_password: String,

    /// Whether server certificates are validated. Turning this off accepts
    /// self-signed certificates; it is independent of the URL scheme.
    #[serde(default = "default_true")]
    pub tls_verify: bool,

    #[serde(default)]
    pub starttls: bool,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Deadline for connecting and for every single protocol call.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl DirectoryConfig {
    pub fn new<U: Into<String>, B: Into<String>, D: Into<String>, P: Into<String>>(url: U, base_dn: B, bind_dn: D, bind_password: P) -> Self {
        Self {
            url: url.into(),
            base_dn: base_dn.into(),
            bind_dn: bind_dn.into(),
            bind_password: bind_password.into(),
            tls_verify: true,
            starttls: false,
            page_size: DEFAULT_PAGE_SIZE,
            timeout_secs: None,
        }
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, DirectoryError> {
        toml::from_str(toml_str)
            .map_err(|e| DirectoryError::Config(format!("failed to parse configuration: {}", e)))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let toml_str = std::fs::read_to_string(path)
            .map_err(|e| DirectoryError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&toml_str)
    }

    /// Checks that every required value is present.
    pub fn validate(&self) -> Result<(), DirectoryError> {
        if self.url.is_empty() {
            return Err(DirectoryError::Config("server URL is required".to_owned()));
        }
        let known_scheme = ["ldap://", "ldaps://", "ldapi://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme));
        if !known_scheme {
            return Err(DirectoryError::Config("server URL must start with ldap://, ldaps:// or ldapi://".to_owned()));
        }
        if self.base_dn.is_empty() {
            return Err(DirectoryError::Config("base DN is required".to_owned()));
        }
        if self.bind_dn.is_empty() {
            return Err(DirectoryError::Config("bind DN is required".to_owned()));
        }
        if self.page_size == 0 {
            return Err(DirectoryError::Config("page size must be positive".to_owned()));
        }
        Ok(())
    }

    /// Whether the transport is encrypted, either by scheme or by StartTLS.
    pub fn is_encrypted(&self) -> bool {
        self.url.starts_with("ldaps://") || self.starttls
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
impl fmt::Debug for DirectoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryConfig")
            .field("url", &self.url)
            .field("base_dn", &self.base_dn)
            .field("bind_dn", &self.bind_dn)
            .field("bind_password", &"<redacted>")
            .field("tls_verify", &self.tls_verify)
            .field("starttls", &self.starttls)
            .field("page_size", &self.page_size)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config = DirectoryConfig::from_toml_str(r#"
            url = "ldaps://dc01.example.com"
            base_dn = "DC=example,DC=com"
            bind_dn = "CN=svc,DC=example,DC=com"
            bind_password = "hunter2"
        "#).unwrap();
        assert!(config.tls_verify);
        assert!(!config.starttls);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.timeout(), None);
        assert!(config.is_encrypted());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_verify_independent_of_scheme() {
        let config = DirectoryConfig::from_toml_str(r#"
            url = "ldap://dc01.example.com"
            base_dn = "DC=example,DC=com"
            bind_dn = "CN=svc,DC=example,DC=com"
            tls_verify = false
            timeout_secs = 5
        "#).unwrap();
        assert!(!config.tls_verify);
        assert!(!config.is_encrypted());
        assert_eq!(config.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_validation() {
        let mut config = DirectoryConfig::new("ldap://localhost", "DC=x", "CN=admin,DC=x", "pw");
        assert!(config.validate().is_ok());

        config.url = "http://localhost".to_owned();
        assert!(matches!(config.validate(), Err(DirectoryError::Config(_))));

        config.url = "ldap://localhost".to_owned();
        config.bind_dn = String::new();
        assert!(matches!(config.validate(), Err(DirectoryError::Config(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = DirectoryConfig::new("ldap://localhost", "DC=x", "CN=admin,DC=x", "hunter2");
        let debugged = format!("{:?}", config);
        assert!(!debugged.contains("hunter2"));
        assert!(debugged.contains("<redacted>"));
    }
}
