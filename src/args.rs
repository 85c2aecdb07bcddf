use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};

use dirsync::directory::Scope;


#[derive(Clone, Debug, Parser)]
#[command(name = "dirctl", version, about = "Search and change entries in an LDAP directory")]
#[command(group(ArgGroup::new("source").required(true).args(["bind_dn", "config", "offline"])))]
pub struct Opts {
    /// Server URL; overrides the configuration file.
    #[arg(short = 'H', long)]
    pub ldap_uri: Option<String>,

    /// Default search base; overrides the configuration file.
    #[arg(short = 'b', long)]
    pub base_dn: Option<String>,

    /// Bind as this DN, prompting for the password.
    #[arg(short = 'D', long)]
    pub bind_dn: Option<String>,

    /// TOML configuration file with server and credentials.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Work on an in-memory directory loaded from this LDIF file instead of a
    /// server. Changes are not written back.
    #[arg(long)]
    pub offline: Option<PathBuf>,

    /// Name recorded in the audit log; defaults to the bind DN.
    #[arg(long)]
    pub operator: Option<String>,

    /// Accept any server certificate.
    #[arg(long)]
    pub no_tls_verify: bool,

    /// Deadline in seconds for connecting and for each request.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}


#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Print matching entries as LDIF.
    Search(SearchOpts),

    /// Create an entry, or every entry in an LDIF file.
    Add(AddOpts),

    /// Change attributes of an entry in one request.
    Modify(ModifyOpts),

    Delete(DeleteOpts),

    /// Rename an entry, optionally moving it below a new parent.
    Rename(RenameOpts),
}


#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum ScopeArg {
    Base,
    One,
    #[default]
    Sub,
}
impl From<ScopeArg> for Scope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Base => Scope::Base,
            ScopeArg::One => Scope::OneLevel,
            ScopeArg::Sub => Scope::Subtree,
        }
    }
}


#[derive(Args, Clone, Debug)]
pub struct SearchOpts {
    pub filter: String,

    /// Attribute to return; repeat for more. All user attributes if absent.
    #[arg(short = 'a', long = "attr")]
    pub attributes: Vec<String>,

    #[arg(long)]
    pub base: Option<String>,

    #[arg(short = 's', long, value_enum, default_value_t)]
    pub scope: ScopeArg,

    /// Print each DN at most once.
    #[arg(long)]
    pub dedup: bool,
}

#[derive(Args, Clone, Debug)]
pub struct AddOpts {
    #[arg(required_unless_present = "ldif", conflicts_with = "ldif")]
    pub dn: Option<String>,

    /// `name=value`; repeat for more values or attributes.
    #[arg(long = "attr", value_parser = parse_assignment)]
    pub attributes: Vec<(String, String)>,

    #[arg(long, conflicts_with = "attributes")]
    pub ldif: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
pub struct ModifyOpts {
    pub dn: String,

    /// `name=value` to add.
    #[arg(long, value_parser = parse_assignment)]
    pub add: Vec<(String, String)>,

    /// `name=value` to replace the attribute with.
    #[arg(long, value_parser = parse_assignment)]
    pub replace: Vec<(String, String)>,

    /// `name=value` to remove one value, or `name` to remove the attribute.
    #[arg(long)]
    pub delete: Vec<String>,

    /// Attribute to remove if present.
    #[arg(long)]
    pub clear: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct DeleteOpts {
    pub dn: String,
}

#[derive(Args, Clone, Debug)]
pub struct RenameOpts {
    pub dn: String,

    /// For example `CN=New Name`.
    pub new_rdn: String,

    #[arg(long)]
    pub parent: Option<String>,
}


pub fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_owned(), value.to_owned())),
        _ => Err(format!("expected name=value, got {:?}", s)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(parse_assignment("member=CN=bob,DC=x"), Ok(("member".to_owned(), "CN=bob,DC=x".to_owned())));
        assert_eq!(parse_assignment("description="), Ok(("description".to_owned(), String::new())));
        assert!(parse_assignment("=x").is_err());
        assert!(parse_assignment("novalue").is_err());
    }

    #[test]
    fn test_parse_modify() {
        let opts = Opts::try_parse_from([
            "dirctl", "--offline", "seed.ldif",
            "modify", "CN=admins,DC=x", "--add", "member=CN=bob,DC=x", "--clear", "description",
        ]).unwrap();
        let Command::Modify(modify) = opts.command else { panic!("expected modify") };
        assert_eq!(modify.add, vec![("member".to_owned(), "CN=bob,DC=x".to_owned())]);
        assert_eq!(modify.clear, vec!["description".to_owned()]);
    }

    #[test]
    fn test_source_is_required() {
        assert!(Opts::try_parse_from(["dirctl", "delete", "CN=a,DC=x"]).is_err());
        assert!(Opts::try_parse_from(["dirctl", "-D", "CN=admin,DC=x", "-c", "x.toml", "delete", "CN=a,DC=x"]).is_err());
    }
}
