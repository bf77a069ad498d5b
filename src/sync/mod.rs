use std::sync::Arc;
use std::time::Instant;

use time::OffsetDateTime;

use crate::config::SyncOptions;
use crate::error::{SyncError, SyncResult};
use crate::model::{Entry, EntryId};
use crate::random::RandomItemCache;
use crate::sources::{
    AuthSource, BatchSource, EntriesResult, KeyValueStore, Mutation, PageKey, PageRequest,
    PageSource, PageToken, StatsSource, Subscription,
};
use crate::stats::{EntryStats, StatsDelta, StatsReconciler};
use crate::store::{EntryListStore, TimeGroup};

#[derive(Clone)]
pub struct Collaborators {
    pub pages: Arc<dyn PageSource>,
    pub stats: Arc<dyn StatsSource>,
    pub auth: Arc<dyn AuthSource>,
    pub batches: Arc<dyn BatchSource>,
    pub key_values: Arc<dyn KeyValueStore>,
}

/// What changed during one [`SyncEngine::pump`].
#[derive(Debug, Default)]
pub struct EngineUpdate {
    pub groups_changed: bool,
    pub stats: Vec<EntryStats>,
    /// Groups left without entries; the presentation layer releases them
    /// with [`SyncEngine::release_group`] once its exit animation is done.
    pub emptied_groups: Vec<String>,
    pub errors: Vec<SyncError>,
}

struct PageWindow {
    key: PageKey,
    subscription: Subscription<EntriesResult>,
}

pub struct SyncEngine {
    options: SyncOptions,
    sources: Collaborators,
    store: EntryListStore,
    stats: StatsReconciler,
    random: Option<RandomItemCache>,
    login: Option<Subscription<bool>>,
    logged_in: bool,
    windows: Vec<PageWindow>,
    next_page: Option<PageToken>,
    has_more: bool,
    queued_stats: Vec<EntryStats>,
    last_random: Option<EntryId>,
}

impl SyncEngine {
    pub fn new(options: SyncOptions, sources: Collaborators, now: OffsetDateTime) -> Self {
        let stats = StatsReconciler::new(options.stats_debounce());
        Self {
            options,
            sources,
            store: EntryListStore::new(now),
            stats,
            random: None,
            login: None,
            logged_in: false,
            windows: Vec::new(),
            next_page: None,
            has_more: false,
            queued_stats: Vec::new(),
            last_random: None,
        }
    }

    pub fn start(&mut self) {
        if self.login.is_none() {
            self.login = Some(self.sources.auth.login_state());
        }
        if self.windows.is_empty() {
            self.subscribe_page(None);
        }
    }

    pub fn shutdown(&mut self) {
        tracing::debug!(windows = self.windows.len(), "shutting down sync engine");
        self.windows.clear();
        self.login = None;
        self.apply_login(false);
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn store(&self) -> &EntryListStore {
        &self.store
    }

    pub fn time_groups(&self) -> Vec<TimeGroup> {
        self.store.time_groups()
    }

    pub fn stats(&self) -> Option<EntryStats> {
        self.stats.current()
    }

    pub fn release_group(&mut self, name: &str) -> bool {
        self.store.release_group(name)
    }

    pub fn refresh_reference(&mut self, now: OffsetDateTime) {
        self.store.set_reference(now);
    }

    /// Subscribes the next page window. Returns false when there is nothing more to load.
    pub fn load_more(&mut self) -> bool {
        if !self.has_more {
            return false;
        }
        let Some(token) = self.next_page.take() else {
            return false;
        };
        if self
            .windows
            .iter()
            .any(|window| window.key.token() == Some(&token))
        {
            return false;
        }
        self.has_more = false;
        self.subscribe_page(Some(token));
        true
    }

    pub fn pump(&mut self, now: Instant) -> EngineUpdate {
        let mut update = EngineUpdate::default();

        let login = self.login.as_mut().map(|subscription| subscription.latest());
        if let Some((latest, errors)) = login {
            update.errors.extend(errors);
            if let Some(logged_in) = latest {
                self.apply_login(logged_in);
            }
        }

        let mut windows = std::mem::take(&mut self.windows);
        let last = windows.len().saturating_sub(1);
        for (index, window) in windows.iter_mut().enumerate() {
            for item in window.subscription.drain() {
                match item {
                    Ok(result) => self.apply_page(&window.key, result, index == last, &mut update),
                    Err(err) => {
                        tracing::warn!(%err, page = ?window.key, "page subscription error");
                        update.errors.push(err);
                    }
                }
            }
        }
        windows.retain(|window| !window.subscription.is_closed());
        self.windows = windows;

        update.stats.append(&mut self.queued_stats);
        match self.stats.pump(now) {
            Ok(emitted) => update.stats.extend(emitted),
            Err(err) => update.errors.push(err),
        }

        if let Some(random) = self.random.as_mut() {
            if let Err(err) = random.run_refill() {
                tracing::warn!(%err, "random batch refill failed");
                update.errors.push(err);
            }
        }
        update
    }

    /// Emits any debounced stats value immediately.
    pub fn settle_stats(&mut self) -> Option<EntryStats> {
        self.stats.flush()
    }

    pub fn add_entry(
        &mut self,
        original_text: &str,
        translation: &str,
        now: OffsetDateTime,
    ) -> SyncResult<Entry> {
        let entry = Entry::new(original_text, translation, now);
        self.store.add_entry(entry.clone());
        if let Err(err) = self.sources.pages.mutate(Mutation::Add(entry.clone())) {
            tracing::error!(%err, id = %entry.id, "failed to add entry");
            self.store.discard_entry(&entry.id);
            return Err(err);
        }
        self.queue_stats(StatsDelta::Added);
        Ok(entry)
    }

    pub fn update_entry(&mut self, entry: Entry) -> SyncResult<()> {
        let outcome = self.store.update_entry(entry.clone())?;
        if let Err(err) = self.sources.pages.mutate(Mutation::Update(entry.clone())) {
            tracing::error!(%err, id = %entry.id, "failed to update entry");
            self.store.update_entry(outcome.previous)?;
            return Err(err);
        }
        if let Some(random) = self.random.as_mut() {
            random.on_entry_updated(&entry);
        }
        Ok(())
    }

    /// Returns the name of the group the delete emptied, if any.
    pub fn delete_entry(&mut self, id: &EntryId) -> SyncResult<Option<String>> {
        let outcome = self.store.delete_entry(id)?;
        if let Err(err) = self.sources.pages.mutate(Mutation::Delete(id.clone())) {
            tracing::error!(%err, %id, "failed to delete entry");
            self.store.restore_entry(outcome.removed);
            return Err(err);
        }
        if let Some(random) = self.random.as_mut() {
            random.on_entry_deleted(id);
        }
        self.queue_stats(StatsDelta::Deleted {
            was_learned: outcome.removed.ui.is_learned,
        });
        Ok(outcome.emptied_group)
    }

    pub fn toggle_learned(&mut self, id: &EntryId) -> SyncResult<bool> {
        let learned = self.store.toggle_is_learned(id)?;
        let mutation = if learned {
            Mutation::Archive(id.clone())
        } else {
            Mutation::Unarchive(id.clone())
        };
        if let Err(err) = self.sources.pages.mutate(mutation) {
            tracing::error!(%err, %id, learned, "failed to toggle learned state");
            self.store.toggle_is_learned(id)?;
            return Err(err);
        }
        self.queue_stats(if learned {
            StatsDelta::Archived
        } else {
            StatsDelta::Unarchived
        });
        Ok(learned)
    }

    /// Next item from the random batch, retrying once if it repeats the previous pick.
    pub fn next_random(&mut self) -> SyncResult<Option<Entry>> {
        let random = self.random.as_mut().ok_or(SyncError::NotLoggedIn)?;
        let mut next = random.get_next()?;
        let repeated = matches!(
            (&next, &self.last_random),
            (Some(entry), Some(last)) if &entry.id == last
        );
        if repeated {
            tracing::debug!("random pick repeated the previous one, retrying");
            if let Some(retry) = random.get_next()? {
                next = Some(retry);
            }
        }
        self.last_random = next.as_ref().map(|entry| entry.id.clone());
        Ok(next)
    }

    fn subscribe_page(&mut self, token: Option<PageToken>) {
        let request = PageRequest {
            token,
            page_size: self.options.page_size,
        };
        tracing::debug!(page = ?request.token, size = request.page_size, "subscribing to page");
        let key = request.key();
        let subscription = self.sources.pages.subscribe(request);
        self.windows.push(PageWindow { key, subscription });
    }

    fn apply_page(
        &mut self,
        key: &PageKey,
        result: EntriesResult,
        is_last_window: bool,
        update: &mut EngineUpdate,
    ) {
        let provenance = result.provenance();
        if is_last_window {
            self.has_more = result.has_more;
            self.next_page = result.next_page_token.clone();
        }
        let outcome = self
            .store
            .merge_page(key.clone(), result.entries, provenance, result.has_more);
        update.groups_changed |= outcome.changed_membership() || !outcome.refreshed.is_empty();
        update.emptied_groups.extend(outcome.emptied_groups);

        let Some(random) = self.random.as_mut() else {
            return;
        };
        for id in &outcome.removed {
            random.on_entry_deleted(id);
        }
        for id in &outcome.refreshed {
            if let Some(current) = self.store.entry(id) {
                random.on_entry_updated(&current.entry);
            }
        }
    }

    fn apply_login(&mut self, logged_in: bool) {
        self.stats
            .set_logged_in(logged_in, self.sources.stats.as_ref());
        if !logged_in {
            self.random = None;
            self.last_random = None;
            self.logged_in = false;
            return;
        }
        self.logged_in = true;
        if self.random.is_some() {
            return;
        }
        match self.sources.auth.current_user_id() {
            Ok(user_id) => {
                self.random = Some(RandomItemCache::new(
                    self.options.random_batch_size,
                    &self.options.random_cache_prefix,
                    &user_id,
                    self.sources.batches.clone(),
                    self.sources.key_values.clone(),
                ));
            }
            Err(err) => tracing::warn!(%err, "logged in without a user id"),
        }
    }

    fn queue_stats(&mut self, delta: StatsDelta) {
        self.queued_stats.extend(self.stats.apply_optimistic(delta));
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.windows.clear();
    }
}
