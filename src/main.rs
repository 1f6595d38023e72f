use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use gitsync::cache::{CacheDirectoryRegistry, CacheSlot};
use gitsync::changes::{ChangeFilter, ChangeSetExtractor};
use gitsync::checkout::CheckoutEngine;
use gitsync::config::SyncConfig;
use gitsync::error::{DefaultErrorText, ErrorText, SyncError};
use gitsync::fetch::FetchEngine;
use gitsync::git::BackendKind;
use gitsync::sink::{DefaultCredentialStore, LogSink};
use gitsync::sync::{BuildSync, SyncRequest};
use gitsync::types::{CacheSignature, CancelToken, RepositoryAccessData};

#[derive(Parser)]
#[command(
    name = "gitsync",
    about = "Keep build working copies in sync with remote git repositories"
)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured base directory
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Override the configured backend (library or cli)
    #[arg(long, global = true, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the cache slot for a repository, creating it if needed
    Slot {
        #[command(flatten)]
        access: AccessArgs,
    },

    /// Fetch a branch into the repository's cache slot
    Fetch {
        #[command(flatten)]
        access: AccessArgs,
    },

    /// Convert a shallow cache slot to full history
    Unshallow {
        #[command(flatten)]
        access: AccessArgs,
    },

    /// Check out a revision into a working directory
    Checkout {
        #[command(flatten)]
        source: SourceArgs,
        /// Working directory to update
        #[arg(long)]
        work_dir: PathBuf,
        /// Revision to check out
        #[arg(long)]
        revision: String,
        /// Revision currently checked out, if known
        #[arg(long)]
        previous: Option<String>,
    },

    /// Print the commits between two revisions as JSON
    Changes {
        #[command(flatten)]
        source: SourceArgs,
        /// Newest revision of the range
        #[arg(long)]
        revision: String,
        /// Exclusive lower bound of the range
        #[arg(long)]
        previous: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Delete the cache slot of a repository
    Delete {
        #[command(flatten)]
        access: AccessArgs,
    },

    /// List cache slots
    List,

    /// Fetch, compute changes and check out in one step
    Sync {
        #[command(flatten)]
        access: AccessArgs,
        /// Working directory to update
        #[arg(long)]
        work_dir: PathBuf,
        /// Revision to check out (defaults to the branch head)
        #[arg(long)]
        revision: Option<String>,
        /// Revision of the previous build
        #[arg(long)]
        previous: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
    },
}

/// How to reach the remote repository.
#[derive(Args)]
struct AccessArgs {
    /// JSON file with access data; flags override its fields
    #[arg(long)]
    access: Option<PathBuf>,

    /// Repository URL
    #[arg(long)]
    url: Option<String>,

    /// Branch to fetch (defaults to the remote's HEAD)
    #[arg(long)]
    branch: Option<String>,

    #[arg(long)]
    username: Option<String>,

    /// Password reference: env:NAME, file:PATH or a literal
    #[arg(long)]
    password: Option<String>,

    /// Private key reference: env:NAME, file:PATH or a literal
    #[arg(long)]
    ssh_key: Option<String>,

    #[arg(long)]
    ssh_passphrase: Option<String>,

    /// Keep only the latest commit of the branch
    #[arg(long)]
    shallow: bool,

    /// Bound for network operations, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Log every line of transport output
    #[arg(long)]
    verbose_logs: bool,
}

/// A history directory given directly, or the cache slot of a repository.
#[derive(Args)]
struct SourceArgs {
    /// Git directory holding the history
    #[arg(long, conflicts_with_all = ["url", "access"])]
    source: Option<PathBuf>,

    #[command(flatten)]
    access: AccessArgs,
}

#[derive(Args)]
struct FilterArgs {
    /// Maximum number of commits to list
    #[arg(long, default_value_t = 100)]
    limit: usize,

    /// Only list files matching this regex
    #[arg(long)]
    include: Option<String>,

    /// Do not list files matching this regex
    #[arg(long)]
    exclude: Option<String>,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        log::warn!("Failed to install Ctrl-C handler: {}", e);
    }

    let result = load_config(&cli).and_then(|config| match cli.command {
        Commands::Slot { access } => cmd_slot(&config, access, &cancel),
        Commands::Fetch { access } => cmd_fetch(&config, access, false, &cancel),
        Commands::Unshallow { access } => cmd_fetch(&config, access, true, &cancel),
        Commands::Checkout {
            source,
            work_dir,
            revision,
            previous,
        } => cmd_checkout(&config, source, &work_dir, &revision, previous.as_deref(), &cancel),
        Commands::Changes {
            source,
            revision,
            previous,
            filter,
        } => cmd_changes(&config, source, &revision, previous.as_deref(), filter, &cancel),
        Commands::Delete { access } => cmd_delete(&config, access, &cancel),
        Commands::List => cmd_list(&config),
        Commands::Sync {
            access,
            work_dir,
            revision,
            previous,
            filter,
        } => cmd_sync(&config, access, work_dir, revision, previous, filter, &cancel),
    });

    if let Err(e) = result {
        match e.downcast_ref::<SyncError>() {
            Some(err) => eprintln!(
                "Error: {}",
                DefaultErrorText.lookup(err.code(), &err.arguments())
            ),
            None => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig, Box<dyn Error>> {
    let mut config = SyncConfig::load(cli.config.as_deref())?;
    if let Some(base_dir) = &cli.base_dir {
        config.base_dir = base_dir.clone();
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    Ok(config)
}

fn parse_backend(value: &str) -> Result<BackendKind, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown backend '{}' (expected library or cli)", value))
}

impl AccessArgs {
    fn resolve(self) -> Result<RepositoryAccessData, Box<dyn Error>> {
        let mut access = match &self.access {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
                serde_json::from_str(&text)
                    .map_err(|e| format!("Invalid access file {}: {}", path.display(), e))?
            }
            None => RepositoryAccessData::default(),
        };

        if let Some(url) = self.url {
            access.url = url;
        }
        if let Some(branch) = self.branch {
            access.branch = branch;
        }
        if self.username.is_some() {
            access.username = self.username;
        }
        if self.password.is_some() {
            access.password = self.password;
        }
        if self.ssh_key.is_some() {
            access.ssh_key = self.ssh_key;
        }
        if self.ssh_passphrase.is_some() {
            access.ssh_passphrase = self.ssh_passphrase;
        }
        if let Some(secs) = self.timeout {
            access.command_timeout = Duration::from_secs(secs);
        }
        access.use_shallow_clones |= self.shallow;
        access.verbose_logs |= self.verbose_logs;

        if access.url.trim().is_empty() {
            return Err("a repository URL is required (--url or --access)".into());
        }
        Ok(access)
    }
}

fn find_slot(
    registry: &CacheDirectoryRegistry,
    access: &RepositoryAccessData,
    cancel: &CancelToken,
) -> Result<CacheSlot, Box<dyn Error>> {
    let signature = CacheSignature::from_access(access);
    registry
        .find(signature.as_str(), cancel)?
        .ok_or_else(|| format!("No cache slot for {}", signature.as_str().replace('\n', ", ")).into())
}

fn fetch_engine(config: &SyncConfig) -> FetchEngine {
    FetchEngine::new(config.backend(), Arc::new(DefaultCredentialStore))
        .with_branch_switch(config.shallow_branch_switch)
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_slot(config: &SyncConfig, access: AccessArgs, cancel: &CancelToken) -> Result<(), Box<dyn Error>> {
    let access = access.resolve()?;
    let signature = CacheSignature::from_access(&access);
    let slot = config.registry().acquire(signature.as_str(), cancel)?;
    println!("{}", slot.root.display());
    Ok(())
}

fn cmd_fetch(
    config: &SyncConfig,
    access: AccessArgs,
    unshallow: bool,
    cancel: &CancelToken,
) -> Result<(), Box<dyn Error>> {
    let access = access.resolve()?;
    let registry = config.registry();
    let slot = registry.acquire(CacheSignature::from_access(&access).as_str(), cancel)?;
    let _guard = registry.lock_slot(&slot, cancel)?;

    let engine = fetch_engine(config);
    let outcome = if unshallow {
        engine.unshallow(&slot.repository(), &access, &LogSink, cancel)?
    } else {
        engine.fetch(
            &slot.repository(),
            &access,
            access.use_shallow_clones,
            &LogSink,
            cancel,
        )?
    };
    print_json(&outcome)
}

fn cmd_checkout(
    config: &SyncConfig,
    source: SourceArgs,
    work_dir: &Path,
    revision: &str,
    previous: Option<&str>,
    cancel: &CancelToken,
) -> Result<(), Box<dyn Error>> {
    let engine = CheckoutEngine::new(config.backend());
    let commit = match source.source {
        Some(dir) => {
            engine.checkout_with_cancel(&dir, work_dir, revision, previous, &LogSink, cancel)?
        }
        None => {
            let access = source.access.resolve()?;
            let registry = config.registry();
            let slot = find_slot(&registry, &access, cancel)?;
            let _guard = registry.lock_slot(&slot, cancel)?;
            engine.checkout_with_cancel(
                &slot.repository(),
                work_dir,
                revision,
                previous,
                &LogSink,
                cancel,
            )?
        }
    };
    println!("{}", commit);
    Ok(())
}

fn cmd_changes(
    config: &SyncConfig,
    source: SourceArgs,
    revision: &str,
    previous: Option<&str>,
    filter: FilterArgs,
    cancel: &CancelToken,
) -> Result<(), Box<dyn Error>> {
    let change_filter = ChangeFilter::new(filter.include.as_deref(), filter.exclude.as_deref())?;
    let extractor = ChangeSetExtractor::new();
    let changes = match source.source {
        Some(dir) => extractor.extract(&dir, previous, revision, filter.limit)?,
        None => {
            let access = source.access.resolve()?;
            let registry = config.registry();
            let slot = find_slot(&registry, &access, cancel)?;
            let _guard = registry.lock_slot(&slot, cancel)?;
            extractor.extract(&slot.repository(), previous, revision, filter.limit)?
        }
    };
    print_json(&changes.filtered(&change_filter))
}

fn cmd_delete(config: &SyncConfig, access: AccessArgs, cancel: &CancelToken) -> Result<(), Box<dyn Error>> {
    let access = access.resolve()?;
    let registry = config.registry();
    let slot = find_slot(&registry, &access, cancel)?;
    if registry.delete(&slot, cancel)? {
        println!("Deleted {}", slot.root.display());
    } else {
        println!("{} was already gone", slot.root.display());
    }
    Ok(())
}

fn cmd_list(config: &SyncConfig) -> Result<(), Box<dyn Error>> {
    let slots = config.registry().list()?;

    if slots.is_empty() {
        println!("No cache slots in {}", config.base_dir.display());
        return Ok(());
    }

    println!("{:<72} {}", "SLOT", "REPOSITORY");
    println!("{}", "-".repeat(100));

    for slot in slots {
        let name = slot
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let url = slot
            .signature
            .lines()
            .find_map(|line| line.strip_prefix("url: "))
            .unwrap_or("?");
        let shallow = slot
            .signature
            .lines()
            .find_map(|line| line.strip_prefix("shallow-branch: "))
            .map(|branch| format!(" (shallow {})", branch))
            .unwrap_or_default();
        println!("{:<72} {}{}", name, url, shallow);
    }

    Ok(())
}

fn cmd_sync(
    config: &SyncConfig,
    access: AccessArgs,
    work_dir: PathBuf,
    revision: Option<String>,
    previous: Option<String>,
    filter: FilterArgs,
    cancel: &CancelToken,
) -> Result<(), Box<dyn Error>> {
    let change_filter = ChangeFilter::new(filter.include.as_deref(), filter.exclude.as_deref())?;
    let request = SyncRequest {
        access: access.resolve()?,
        work_dir,
        revision,
        previous,
        change_limit: filter.limit,
    };

    let sync = BuildSync::from_config(config, Arc::new(DefaultCredentialStore));
    let mut report = sync.sync(&request, &LogSink, cancel)?;
    if report.recovered {
        log::warn!("Cache slot {} was rebuilt", report.slot.display());
    }
    report.changes = report.changes.filtered(&change_filter);
    print_json(&report)
}
