use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use safekeep::{
    app::App,
    command::Command,
    config::Config,
    model::{Entry, Field},
    notify::ChangeEvent,
    secure::SecureBuffer,
    storage::VaultFile,
    store::EntryStore,
};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const MIN_PASSPHRASE_LEN: usize = 8;

#[derive(Parser)]
#[command(name = "safekeep")]
#[command(about = "An encrypted credential store for the command line", long_about = None)]
struct Cli {
    /// Database file (defaults to the configured or platform location)
    #[arg(long, global = true, value_name = "PATH")]
    vault: Option<PathBuf>,

    /// Config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty database
    Init,
    /// List entries
    List {
        /// Only entries whose title, user, URL or group contain this text
        #[arg(short, long)]
        search: Option<String>,

        /// Only entries in this group or its subgroups
        #[arg(short, long)]
        group: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Add an entry; the password is prompted for
    Add {
        title: String,

        #[arg(short, long, default_value = "")]
        user: String,

        #[arg(long)]
        url: Option<String>,

        #[arg(short, long)]
        group: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },
    /// Show one entry
    Show {
        /// UUID or title
        entry: String,

        /// Print the password and notes
        #[arg(long)]
        reveal: bool,
    },
    /// Change one field; secret fields are prompted for when no value is given
    Edit {
        entry: String,

        /// title, user, password, url, notes or group
        field: String,

        value: Option<String>,
    },
    /// Change the title of an entry
    Rename { entry: String, title: String },
    /// Move entries into a group
    Mv {
        group: String,

        #[arg(required = true)]
        entries: Vec<String>,
    },
    /// Set or clear an expiry time
    Expire {
        entry: String,

        /// RFC 3339 timestamp, e.g. 2027-01-31T00:00:00Z
        #[arg(long, conflicts_with = "clear", required_unless_present = "clear")]
        at: Option<String>,

        #[arg(long)]
        clear: bool,
    },
    /// Delete entries
    Rm {
        #[arg(required = true)]
        entries: Vec<String>,
    },
    /// Change the master passphrase
    Passwd,
}

/// Non-secret view of an entry for `list --json`
#[derive(Serialize)]
struct EntrySummary<'a> {
    uuid: Uuid,
    title: &'a str,
    user: &'a str,
    url: &'a str,
    group: &'a str,
    modified: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
}

impl<'a> From<&'a Entry> for EntrySummary<'a> {
    fn from(entry: &'a Entry) -> Self {
        Self {
            uuid: entry.uuid(),
            title: entry.title(),
            user: entry.user(),
            url: entry.url(),
            group: entry.group(),
            modified: entry.modified(),
            expires: entry.expires(),
        }
    }
}

fn main() {
    // RUST_LOG=safekeep=debug for verbose output; nothing secret is ever logged
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("safekeep=warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path()?)?,
    };
    let vault_path = match cli.vault {
        Some(path) => path,
        None => config.vault_path()?,
    };

    if let Commands::Init = cli.command {
        if VaultFile::exists(&vault_path) {
            bail!("A database already exists at {}", vault_path.display());
        }
        let passphrase = prompt_new_password()?;
        let mut app = App::create(passphrase, config.codec_config(), config.engine_config())?;
        VaultFile::save(&vault_path, &mut app)?;
        println!("✓ Created database at {}", vault_path.display());
        return Ok(());
    }

    if !VaultFile::exists(&vault_path) {
        bail!(
            "No database at {}. Run `safekeep init` first.",
            vault_path.display()
        );
    }
    let passphrase = prompt_password("Enter master password: ")?;
    let mut app = VaultFile::load(
        &vault_path,
        passphrase,
        config.codec_config(),
        config.engine_config(),
    )?;
    app.engine_mut()?.subscribe(Rc::new(
        |store: &EntryStore, event: &ChangeEvent| {
            info!(
                kind = %event.kind,
                entries = event.uuids.len(),
                total = store.len(),
                "store changed"
            );
        },
    ));

    match cli.command {
        // Handled before unlocking
        Commands::Init => {}
        Commands::List {
            search,
            group,
            json,
        } => list(&app, search.as_deref(), group.as_deref(), json)?,
        Commands::Show { entry, reveal } => {
            let uuid = resolve(app.store(), &entry)?;
            show(app.store().get(&uuid)?, reveal)?;
        }
        Commands::Add {
            title,
            user,
            url,
            group,
            notes,
        } => {
            let password = prompt_password("Entry password: ")?;
            let mut entry = Entry::new(&title, &user, password);
            if let Some(url) = url {
                entry = entry.with_url(&url);
            }
            if let Some(group) = group {
                entry = entry.with_group(&group);
            }
            if let Some(notes) = notes {
                entry = entry.with_notes(SecureBuffer::from(notes));
            }
            let command = Command::add_entry(app.store(), entry)?;
            commit(&mut app, &vault_path, command)?;
        }
        Commands::Edit {
            entry,
            field,
            value,
        } => {
            let field = Field::parse_field(&field)
                .ok_or_else(|| anyhow!("Unknown field '{}'", field))?;
            let uuid = resolve(app.store(), &entry)?;
            let value = match value {
                Some(value) => SecureBuffer::from(value),
                None if field.is_secret() => prompt_password(&format!("New {}: ", field))?,
                None => bail!("A value is required for {}", field),
            };
            let command = Command::edit_field(app.store(), uuid, field, value)?;
            commit(&mut app, &vault_path, command)?;
        }
        Commands::Rename { entry, title } => {
            let uuid = resolve(app.store(), &entry)?;
            let command = Command::rename(app.store(), uuid, &title)?;
            commit(&mut app, &vault_path, command)?;
        }
        Commands::Mv { group, entries } => {
            let uuids = resolve_all(app.store(), &entries)?;
            let command = Command::move_group(app.store(), &uuids, &group)?;
            commit(&mut app, &vault_path, command)?;
        }
        Commands::Expire { entry, at, clear } => {
            let uuid = resolve(app.store(), &entry)?;
            let expires = match (at, clear) {
                (_, true) | (None, _) => None,
                (Some(at), false) => Some(
                    DateTime::parse_from_rfc3339(&at)
                        .with_context(|| format!("Invalid timestamp '{}'", at))?
                        .with_timezone(&Utc),
                ),
            };
            let command = Command::set_expiry(app.store(), uuid, expires)?;
            commit(&mut app, &vault_path, command)?;
        }
        Commands::Rm { entries } => {
            let uuids = resolve_all(app.store(), &entries)?;
            let command = Command::delete_many(app.store(), &uuids)?;
            commit(&mut app, &vault_path, command)?;
        }
        Commands::Passwd => {
            let current = prompt_password("Confirm current master password: ")?;
            let new = prompt_new_password()?;
            app.change_passphrase(&current, new)?;
            VaultFile::save(&vault_path, &mut app)?;
            println!("✓ Master password changed");
        }
    }

    app.lock();
    Ok(())
}

/// Execute a command and write the database back
fn commit(app: &mut App, path: &std::path::Path, command: Command) -> Result<()> {
    let description = command.description().to_string();
    app.execute(command)?;
    VaultFile::save(path, app)?;
    println!("✓ {}", description);
    Ok(())
}

fn list(app: &App, search: Option<&str>, group: Option<&str>, json: bool) -> Result<()> {
    let entries: Vec<&Entry> = app
        .store()
        .find_by(|entry| {
            search.map_or(true, |query| entry.matches(query))
                && group.map_or(true, |group| entry.in_group(group))
        })
        .collect();

    if json {
        let summaries: Vec<EntrySummary> = entries.iter().map(|e| EntrySummary::from(*e)).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No entries");
        return Ok(());
    }
    let now = Utc::now();
    for entry in entries {
        let marker = if entry.is_expired(now) { " (expired)" } else { "" };
        println!(
            "{}  {:<24} {:<24} {}{}",
            entry.uuid(),
            entry.title(),
            entry.user(),
            entry.group(),
            marker
        );
    }
    Ok(())
}

fn show(entry: &Entry, reveal: bool) -> Result<()> {
    println!("Title:    {}", entry.title());
    println!("User:     {}", entry.user());
    if reveal {
        println!("Password: {}", entry.password().as_str()?);
    } else {
        println!("Password: ********");
    }
    if !entry.url().is_empty() {
        println!("URL:      {}", entry.url());
    }
    if !entry.group().is_empty() {
        println!("Group:    {}", entry.group());
    }
    if !entry.notes().is_empty() {
        if reveal {
            println!("Notes:    {}", entry.notes().as_str()?);
        } else {
            println!("Notes:    (hidden, use --reveal)");
        }
    }
    println!("Created:  {}", entry.created().to_rfc3339());
    println!("Modified: {}", entry.modified().to_rfc3339());
    if let Some(expires) = entry.expires() {
        println!("Expires:  {}", expires.to_rfc3339());
    }
    println!("UUID:     {}", entry.uuid());
    Ok(())
}

/// Find an entry by UUID or by exact title
fn resolve(store: &EntryStore, selector: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(selector) {
        if store.contains(&uuid) {
            return Ok(uuid);
        }
    }
    let matches: Vec<Uuid> = store
        .find_by(|entry| entry.title() == selector)
        .map(|entry| entry.uuid())
        .collect();
    match matches.as_slice() {
        [uuid] => Ok(*uuid),
        [] => Err(anyhow!("No entry matches '{}'", selector)),
        _ => Err(anyhow!(
            "'{}' matches {} entries; use the UUID instead",
            selector,
            matches.len()
        )),
    }
}

fn resolve_all(store: &EntryStore, selectors: &[String]) -> Result<Vec<Uuid>> {
    selectors.iter().map(|s| resolve(store, s)).collect()
}

/// Prompt for password (without echo)
fn prompt_password(prompt: &str) -> Result<SecureBuffer> {
    eprint!("{}", prompt);
    io::Write::flush(&mut io::stderr())?;
    let password = rpassword::read_password()?;
    Ok(SecureBuffer::from(password))
}

/// Prompt for new password with confirmation
fn prompt_new_password() -> Result<SecureBuffer> {
    loop {
        let password1 = prompt_password("Enter new master password: ")?;
        if password1.len() < MIN_PASSPHRASE_LEN {
            eprintln!(
                "Password must be at least {} characters long.",
                MIN_PASSPHRASE_LEN
            );
            continue;
        }

        let password2 = prompt_password("Confirm master password: ")?;
        if password1 == password2 {
            return Ok(password1);
        } else {
            eprintln!("Passwords do not match. Try again.");
        }
    }
}
