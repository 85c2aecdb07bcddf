//! Error types for the directory access layer.
//!
//! Raw protocol calls report a [`Failure`]; the retry policy classifies it and
//! turns it into a [`DirectoryError`] for the caller.

use std::fmt;

use thiserror::Error;


pub type Result<T> = std::result::Result<T, DirectoryError>;


/// Message fragments that mark a failure as a dropped or refused connection.
const TRANSIENT_SIGNATURES: [&str; 9] = [
    "socket",
    "connection",
    "reset by peer",
    "broken pipe",
    "refused",
    "end of stream",
    "channel closed",
    "unavailable",
    "server down",
];

pub const RC_SUCCESS: u32 = 0;
pub const RC_NO_SUCH_ATTRIBUTE: u32 = 16;
pub const RC_ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;
pub const RC_INVALID_DN_SYNTAX: u32 = 34;
pub const RC_NO_SUCH_OBJECT: u32 = 32;
pub const RC_INVALID_CREDENTIALS: u32 = 49;
pub const RC_BUSY: u32 = 51;
pub const RC_UNAVAILABLE: u32 = 52;
pub const RC_UNWILLING_TO_PERFORM: u32 = 53;
pub const RC_NOT_ALLOWED_ON_NON_LEAF: u32 = 66;
pub const RC_ENTRY_ALREADY_EXISTS: u32 = 68;
pub const RC_SERVER_DOWN: u32 = 81;
pub const RC_FILTER_ERROR: u32 = 87;


#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DirectoryError {
    #[error("unable to bind: {0}")]
    Connect(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("directory rejected change to {dn:?}: {cause}")]
    Mutation { dn: String, cause: String },

    #[error("invalid filter: {0}")]
    FilterValidation(String),

    #[error("search below {base:?} failed: {cause}")]
    Search { base: String, cause: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),
}
impl DirectoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}


/// The outcome of a failed protocol call: an optional LDAP result code plus
/// the human-readable detail reported by the server or the transport.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Failure {
    pub result_code: Option<u32>,
    pub message: String,
}
impl Failure {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self { result_code: None, message: message.into() }
    }

    pub fn with_code<T: AsRef<str>>(result_code: u32, text: T) -> Self {
        let text = text.as_ref();
        let message = if text.is_empty() {
            format!("{} ({})", result_code_name(result_code), result_code)
        } else {
            format!("{} ({}): {}", result_code_name(result_code), result_code, text)
        };
        Self { result_code: Some(result_code), message }
    }

    /// Whether this failure was caused by network or session disruption
    /// rather than by the request itself.
    pub fn is_transient(&self) -> bool {
        if let Some(rc) = self.result_code {
            if rc == RC_BUSY || rc == RC_UNAVAILABLE || rc == RC_SERVER_DOWN {
                return true;
            }
        }
        let lower = self.message.to_lowercase();
        TRANSIENT_SIGNATURES
            .iter()
            .any(|signature| lower.contains(signature))
    }
}
impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl From<ldap3::LdapError> for Failure {
    fn from(value: ldap3::LdapError) -> Self {
        match value {
            ldap3::LdapError::LdapResult { result } => Self::with_code(result.rc, &result.text),
            other => Self::new(other.to_string()),
        }
    }
}


pub fn result_code_name(rc: u32) -> &'static str {
    match rc {
        0 => "success",
        1 => "operationsError",
        2 => "protocolError",
        3 => "timeLimitExceeded",
        4 => "sizeLimitExceeded",
        16 => "noSuchAttribute",
        17 => "undefinedAttributeType",
        19 => "constraintViolation",
        20 => "attributeOrValueExists",
        21 => "invalidAttributeSyntax",
        32 => "noSuchObject",
        34 => "invalidDNSyntax",
        49 => "invalidCredentials",
        50 => "insufficientAccessRights",
        51 => "busy",
        52 => "unavailable",
        53 => "unwillingToPerform",
        64 => "namingViolation",
        65 => "objectClassViolation",
        66 => "notAllowedOnNonLeaf",
        67 => "notAllowedOnRDN",
        68 => "entryAlreadyExists",
        80 => "other",
        81 => "serverDown",
        85 => "timeout",
        87 => "filterError",
        _ => "unknownResult",
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_by_message() {
        assert!(Failure::new("socket sending error").is_transient());
        assert!(Failure::new("I/O error: Connection reset by peer (os error 104)").is_transient());
        assert!(Failure::new("premature end of stream").is_transient());
        assert!(Failure::new("Server refused the request").is_transient());
        assert!(!Failure::new("timeout: deadline has elapsed").is_transient());
    }

    #[test]
    fn test_transient_by_code() {
        assert!(Failure::with_code(RC_UNAVAILABLE, "").is_transient());
        assert!(Failure::with_code(RC_BUSY, "try later").is_transient());
        assert!(!Failure::with_code(RC_ENTRY_ALREADY_EXISTS, "").is_transient());
        assert!(!Failure::with_code(RC_NO_SUCH_OBJECT, "0000208D: NameErr").is_transient());
    }

    #[test]
    fn test_with_code_message() {
        let failure = Failure::with_code(RC_NO_SUCH_OBJECT, "");
        assert_eq!(failure.message, "noSuchObject (32)");
        let failure = Failure::with_code(RC_ENTRY_ALREADY_EXISTS, "exists");
        assert_eq!(failure.message, "entryAlreadyExists (68): exists");
        assert_eq!(failure.result_code, Some(68));
    }

    #[test]
    fn test_error_display() {
        let error = DirectoryError::Mutation { dn: "CN=x".to_owned(), cause: "nope".to_owned() };
        assert_eq!(error.to_string(), "directory rejected change to \"CN=x\": nope");
        assert!(!error.is_transient());
        assert!(DirectoryError::TransientNetwork("socket".to_owned()).is_transient());
    }
}
