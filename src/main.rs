mod args;


use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dirsync::{dedup_by_dn, Attributes, DirectoryClient, DirectoryConfig, Modification, MutationOutcome, SearchRequest};
use dirsync::audit::TracingAuditSink;
use dirsync::ldif::{parse_ldif, write_entry};
use dirsync::memory::MemoryDirectory;

use crate::args::{AddOpts, Command, ModifyOpts, Opts, SearchOpts};


fn load_config(opts: &Opts) -> anyhow::Result<DirectoryConfig> {
    let mut config = if let Some(config_path) = &opts.config {
        DirectoryConfig::from_file(config_path)?
    } else {
        let bind_dn = opts.bind_dn.clone()
            .context("either a bind DN or a configuration file is required")?;
        let url = opts.ldap_uri.clone()
            .context("a server URL (-H) is required when binding with -D")?;
        let base_dn = opts.base_dn.clone()
            .context("a base DN (-b) is required when binding with -D")?;
        let password = rpassword::prompt_password("LDAP password: ")
            .context("failed to read LDAP password")?;
        DirectoryConfig::new(url, base_dn, bind_dn, password)
    };

    if let Some(ldap_uri) = &opts.ldap_uri {
        config.url = ldap_uri.clone();
    }
    if let Some(base_dn) = &opts.base_dn {
        config.base_dn = base_dn.clone();
    }
    if opts.no_tls_verify {
        config.tls_verify = false;
    }
    if let Some(timeout) = opts.timeout {
        config.timeout_secs = Some(timeout);
    }
    Ok(config)
}

fn build_client(opts: &Opts) -> anyhow::Result<DirectoryClient> {
    if let Some(ldif_path) = &opts.offline {
        let ldif_string = std::fs::read_to_string(ldif_path)
            .with_context(|| format!("failed to load LDIF file {}", ldif_path.display()))?;
        let directory = MemoryDirectory::from_ldif(&ldif_string);
        info!(entries = directory.len(), path = %ldif_path.display(), "working offline");

        let base_dn = opts.base_dn.clone().unwrap_or_default();
        let operator = opts.operator.clone().unwrap_or_else(|| "offline".to_owned());
        return Ok(DirectoryClient::new(Arc::new(directory), base_dn)
            .with_audit(Arc::new(TracingAuditSink), operator));
    }

    let config = load_config(opts)?;
    debug!(config = ?config, "directory configuration");
    let operator = opts.operator.clone().unwrap_or_else(|| config.bind_dn.clone());
    Ok(DirectoryClient::from_config(&config)?
        .with_audit(Arc::new(TracingAuditSink), operator))
}


fn report(dn: &str, outcome: &MutationOutcome) {
    match &outcome.diagnostic {
        Some(diagnostic) => info!(dn, diagnostic = %diagnostic, "done"),
        None => info!(dn, "done"),
    }
}

async fn search(client: &DirectoryClient, opts: &SearchOpts) -> anyhow::Result<()> {
    let base_dn = opts.base.as_deref().unwrap_or(client.base_dn());
    let request = SearchRequest::new(base_dn, opts.filter.as_str())
        .scope(opts.scope.into())
        .attributes(opts.attributes.iter().cloned())
        .page_size(client.page_size());

    let mut entries = client.search_with(&request).await?;
    if opts.dedup {
        entries = dedup_by_dn(entries);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for entry in &entries {
        write_entry(&mut out, entry)?;
    }
    out.flush()?;
    info!(entries = entries.len(), "search finished");
    Ok(())
}

async fn add(client: &DirectoryClient, opts: &AddOpts) -> anyhow::Result<()> {
    if let Some(ldif_path) = &opts.ldif {
        let ldif_string = std::fs::read_to_string(ldif_path)
            .with_context(|| format!("failed to load LDIF file {}", ldif_path.display()))?;
        for entry in parse_ldif(&ldif_string) {
            let outcome = client.add_entry(&entry.dn, &entry.attributes).await?;
            report(&entry.dn, &outcome);
        }
        return Ok(());
    }

    let dn = opts.dn.as_deref().context("a DN or an LDIF file is required")?;
    let mut attributes = Attributes::new();
    for (name, value) in &opts.attributes {
        attributes.push(name.as_str(), value.as_str());
    }
    let outcome = client.add_entry(dn, &attributes).await?;
    report(dn, &outcome);
    Ok(())
}

fn modifications(opts: &ModifyOpts) -> Vec<Modification> {
    let mut modifications = Vec::new();
    for (name, value) in &opts.add {
        modifications.push(Modification::add(name.as_str(), value.as_str()));
    }
    for (name, value) in &opts.replace {
        modifications.push(Modification::replace(name.as_str(), value.as_str()));
    }
    for delete in &opts.delete {
        let modification = match delete.split_once('=') {
            Some((name, value)) => Modification::delete(name, value),
            None => Modification::delete(delete.as_str(), None::<&str>),
        };
        modifications.push(modification);
    }
    for name in &opts.clear {
        modifications.push(Modification::clear(name.as_str()));
    }
    modifications
}

async fn run(client: &DirectoryClient, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Search(opts) => search(client, opts).await,
        Command::Add(opts) => add(client, opts).await,
        Command::Modify(opts) => {
            let outcome = client.modify_entry(&opts.dn, &modifications(opts)).await?;
            report(&opts.dn, &outcome);
            Ok(())
        },
        Command::Delete(opts) => {
            let outcome = client.delete_entry(&opts.dn).await?;
            report(&opts.dn, &outcome);
            Ok(())
        },
        Command::Rename(opts) => {
            let outcome = client.rename_entry(&opts.dn, &opts.new_rdn, opts.parent.as_deref()).await?;
            report(&opts.dn, &outcome);
            Ok(())
        },
    }
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&opts.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    let client = build_client(&opts)?;
    let result = run(&client, &opts.command).await;
    client.disconnect().await;
    result
}
