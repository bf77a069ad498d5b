use std::fmt::Write as _;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Args;
use time::OffsetDateTime;

use crate::config::AppConfig;
use crate::error::SyncError;
use crate::model::EntryId;
use crate::storage::{LocalCollection, LocalSession, SqliteKeyValueStore, StorageHandle};
use crate::store::{GroupedEntry, TimeGroup};
use crate::sync::{Collaborators, EngineUpdate, SyncEngine};

#[derive(Args, Debug, Clone, Default)]
pub struct ListArgs {
    /// Keep loading pages until every entry is listed
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    /// Word or phrase to learn (prompted if omitted)
    #[arg()]
    pub original: Option<String>,
    /// Translation; defaults to the original text
    #[arg()]
    pub translation: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    /// Entry identifier
    pub id: String,
    /// Replace the original text
    #[arg(long)]
    pub text: Option<String>,
    /// Replace the translation (blank resets it to the original text)
    #[arg(long)]
    pub translation: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct IdArgs {
    /// Entry identifier
    pub id: String,
}

/// Wires a sync engine to the local database and loads the first page.
pub fn open_engine(config: &AppConfig, storage: StorageHandle) -> Result<SyncEngine> {
    let collection = Arc::new(LocalCollection::new(storage.clone()));
    let sources = Collaborators {
        pages: collection.clone(),
        stats: collection.clone(),
        auth: Arc::new(LocalSession::new(config.user_id.clone())),
        batches: collection,
        key_values: Arc::new(SqliteKeyValueStore::new(storage)),
    };
    let mut engine = SyncEngine::new(config.sync.clone(), sources, now());
    engine.start();
    settle(&mut engine)?;
    Ok(engine)
}

pub fn list_entries(engine: &mut SyncEngine, args: &ListArgs) -> Result<String> {
    if args.all {
        while engine.load_more() {
            settle(engine)?;
        }
    }
    let mut out = format_groups(&engine.time_groups());
    if engine.has_more() {
        out.push_str("(more entries available, use --all)\n");
    }
    Ok(out)
}

pub fn add_entry(engine: &mut SyncEngine, args: AddArgs) -> Result<String> {
    let original = match args.original {
        Some(text) => text,
        None => prompt("Word")?,
    };
    let original = original.trim();
    if original.is_empty() {
        bail!("entry text cannot be empty");
    }
    let translation = args.translation.unwrap_or_default();
    let entry = engine
        .add_entry(original, translation.trim(), now())
        .context("adding entry")?;
    Ok(format!(
        "Added {}: {} = {}\n",
        entry.id, entry.original_text, entry.translation
    ))
}

pub fn edit_entry(engine: &mut SyncEngine, args: EditArgs) -> Result<String> {
    if args.text.is_none() && args.translation.is_none() {
        bail!("nothing to change, pass --text or --translation");
    }
    let id = EntryId::new(args.id);
    let mut entry = find_loaded(engine, &id)?.entry;
    if let Some(text) = args.text {
        let text = text.trim();
        if text.is_empty() {
            bail!("entry text cannot be empty");
        }
        entry.original_text = text.to_string();
    }
    if let Some(translation) = args.translation {
        entry.translation = if translation.trim().is_empty() {
            entry.original_text.clone()
        } else {
            translation.trim().to_string()
        };
    }
    entry.updated_on = now();
    engine
        .update_entry(entry)
        .with_context(|| format!("updating entry {id}"))?;
    Ok(format!("Updated {id}\n"))
}

pub fn delete_entry(engine: &mut SyncEngine, args: &IdArgs) -> Result<String> {
    let id = EntryId::from(args.id.as_str());
    find_loaded(engine, &id)?;
    engine
        .delete_entry(&id)
        .with_context(|| format!("deleting entry {id}"))?;
    Ok(format!("Deleted {id}\n"))
}

pub fn toggle_learned(engine: &mut SyncEngine, args: &IdArgs) -> Result<String> {
    let id = EntryId::from(args.id.as_str());
    find_loaded(engine, &id)?;
    let learned = engine
        .toggle_learned(&id)
        .with_context(|| format!("toggling entry {id}"))?;
    let state = if learned { "learned" } else { "not learned" };
    Ok(format!("Marked {id} as {state}\n"))
}

pub fn next_random(engine: &mut SyncEngine) -> Result<String> {
    match engine.next_random() {
        Ok(Some(entry)) => Ok(format!("{} = {}\n", entry.original_text, entry.translation)),
        Ok(None) => Ok("Nothing to review.\n".to_string()),
        Err(SyncError::NotLoggedIn) => bail!("random review needs a user_id in the config"),
        Err(err) => Err(err).context("picking a random entry"),
    }
}

pub fn show_stats(engine: &mut SyncEngine) -> Result<String> {
    if !engine.is_logged_in() {
        bail!("stats need a user_id in the config");
    }
    let stats = engine.settle_stats().or(engine.stats());
    let Some(stats) = stats else {
        return Ok("No stats yet.\n".to_string());
    };
    Ok(format!(
        "entries  {}\nlearned  {}\n",
        stats.total_entry_count, stats.learned_entry_count
    ))
}

fn settle(engine: &mut SyncEngine) -> Result<EngineUpdate> {
    let update = engine.pump(Instant::now());
    if let Some(err) = update.errors.first() {
        return Err(anyhow::Error::new(err.clone())).context("syncing with the local store");
    }
    Ok(update)
}

/// Pages through the collection until `id` is loaded.
fn find_loaded(engine: &mut SyncEngine, id: &EntryId) -> Result<GroupedEntry> {
    loop {
        if let Some(found) = engine.store().entry(id) {
            return Ok(found);
        }
        if !engine.load_more() {
            bail!("entry {id} not found");
        }
        settle(engine)?;
    }
}

fn format_groups(groups: &[TimeGroup]) -> String {
    if groups.iter().all(TimeGroup::is_empty) {
        return "No entries yet.\n".to_string();
    }
    let mut out = String::new();
    for group in groups.iter().filter(|group| !group.is_empty()) {
        let _ = writeln!(&mut out, "{}", group.name);
        for item in &group.entries {
            let _ = write!(
                &mut out,
                "  {}  {} = {}",
                item.entry.id, item.entry.original_text, item.entry.translation
            );
            if item.ui.is_learned {
                out.push_str("  [learned]");
            }
            out.push('\n');
        }
    }
    out
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    let mut stdout = io::stdout();
    write!(stdout, "{}: ", label)?;
    stdout.flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end().to_owned())
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}
