use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use indexmap::{IndexMap, IndexSet};
use time::OffsetDateTime;

use crate::bucketing::{classify, Bucket};
use crate::error::{SyncError, SyncResult};
use crate::model::{Entry, EntryId, EntryRecord, EntryUiState};
use crate::sources::{PageKey, Provenance};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedEntry {
    pub entry: Entry,
    pub ui: EntryUiState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeGroup {
    pub bucket_order: i32,
    pub name: String,
    pub entries: Vec<GroupedEntry>,
}

impl TimeGroup {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: Vec<EntryId>,
    pub refreshed: Vec<EntryId>,
    pub removed: Vec<EntryId>,
    pub emptied_groups: Vec<String>,
}

impl MergeOutcome {
    pub fn changed_membership(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub previous: Entry,
    pub moved: bool,
    pub emptied_group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub removed: GroupedEntry,
    /// Set when the delete left its group without entries. The group stays in
    /// [`EntryListStore::time_groups`] until [`EntryListStore::release_group`].
    pub emptied_group: Option<String>,
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    ui: EntryUiState,
    bucket: Bucket,
    seq: u64,
}

/// Id-to-entry table plus the time-bucketed view. Snapshot merges are a union
/// over every page window seen in the session.
#[derive(Debug, Clone)]
pub struct EntryListStore {
    entries: IndexMap<EntryId, Slot>,
    groups: BTreeMap<Bucket, Vec<EntryId>>,
    pages: IndexMap<PageKey, IndexSet<EntryId>>,
    tombstones: HashMap<EntryId, OffsetDateTime>,
    unhomed: IndexSet<EntryId>,
    page_starts: HashMap<PageKey, Position>,
    reference: OffsetDateTime,
    next_seq: u64,
}

impl EntryListStore {
    pub fn new(reference: OffsetDateTime) -> Self {
        Self {
            entries: IndexMap::new(),
            groups: BTreeMap::new(),
            pages: IndexMap::new(),
            tombstones: HashMap::new(),
            unhomed: IndexSet::new(),
            page_starts: HashMap::new(),
            reference,
            next_seq: 0,
        }
    }

    pub fn reference(&self) -> OffsetDateTime {
        self.reference
    }

    /// Moves "now" forward and re-buckets every entry. Retained empty groups are dropped.
    pub fn set_reference(&mut self, reference: OffsetDateTime) {
        let rebucket = reference.date() != self.reference.date()
            || reference.offset() != self.reference.offset();
        self.reference = reference;
        if rebucket {
            self.rebuild_groups();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn entry(&self, id: &EntryId) -> Option<GroupedEntry> {
        self.entries.get(id).map(|slot| GroupedEntry {
            entry: slot.entry.clone(),
            ui: slot.ui,
        })
    }

    /// Merges a snapshot that lists everything from the start of `page` onwards.
    pub fn set_entries(
        &mut self,
        page: PageKey,
        records: Vec<EntryRecord>,
        provenance: Provenance,
    ) -> MergeOutcome {
        self.merge_page(page, records, provenance, false)
    }

    /// Merges one page window's snapshot. With `has_more`, rows sorting after
    /// the snapshot's last row belong to later windows, so an id that shifted
    /// past it is kept until a snapshot covering its position drops it.
    pub fn merge_page(
        &mut self,
        page: PageKey,
        records: Vec<EntryRecord>,
        provenance: Provenance,
        has_more: bool,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut listed = IndexSet::with_capacity(records.len());
        let mut first: Option<Position> = None;
        let mut last: Option<Position> = None;

        for record in records {
            if record.id.is_empty() {
                tracing::warn!("skipping snapshot entry without an id");
                continue;
            }
            let (entry, archived) = record.normalize(self.reference);
            let position = Position::of(&entry);
            if first.as_ref().map_or(true, |first| position < *first) {
                first = Some(position.clone());
            }
            if last.as_ref().map_or(true, |last| position > *last) {
                last = Some(position);
            }
            listed.insert(entry.id.clone());
            self.unhomed.shift_remove(&entry.id);
            if self.tombstones.contains_key(&entry.id) {
                continue;
            }
            let id = entry.id.clone();
            if self.entries.contains_key(&id) {
                if let Some(emptied) = self.replace_model(entry) {
                    outcome.emptied_groups.push(emptied);
                }
                outcome.refreshed.push(id);
            } else {
                let ui = EntryUiState {
                    is_new: false,
                    is_learned: archived,
                };
                self.insert_slot(entry, ui);
                outcome.added.push(id);
            }
        }

        let coverage = self.coverage(&page, first, last, has_more);
        let previous = self.pages.insert(page.clone(), listed).unwrap_or_default();
        let current = &self.pages[&page];
        let mut candidates: IndexSet<EntryId> = previous
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();
        candidates.extend(std::mem::take(&mut self.unhomed));

        for id in candidates {
            if self.pages.values().any(|ids| ids.contains(&id)) {
                continue;
            }
            let Some(position) = self.position_of(&id) else {
                continue;
            };
            if !coverage.as_ref().is_some_and(|c| c.contains(&position)) {
                self.unhomed.insert(id);
                continue;
            }
            if let Some((_, emptied)) = self.remove_slot(&id) {
                if let Some(name) = emptied {
                    outcome.emptied_groups.push(name);
                }
                outcome.removed.push(id.clone());
            }
            if self.tombstones.contains_key(&id) {
                if provenance == Provenance::Server {
                    self.tombstones.remove(&id);
                } else {
                    self.unhomed.insert(id);
                }
            }
        }

        tracing::debug!(
            ?page,
            ?provenance,
            added = outcome.added.len(),
            refreshed = outcome.refreshed.len(),
            removed = outcome.removed.len(),
            unhomed = self.unhomed.len(),
            "merged entries snapshot"
        );
        outcome
    }

    /// Inserts a locally created entry flagged as new. An existing id is overwritten in place.
    pub fn add_entry(&mut self, entry: Entry) {
        self.tombstones.remove(&entry.id);
        let id = entry.id.clone();
        if self.entries.contains_key(&id) {
            self.replace_model(entry);
            if let Some(slot) = self.entries.get_mut(&id) {
                slot.ui.is_new = true;
            }
            return;
        }
        self.insert_slot(
            entry,
            EntryUiState {
                is_new: true,
                is_learned: false,
            },
        );
    }

    pub fn update_entry(&mut self, entry: Entry) -> SyncResult<UpdateOutcome> {
        let Some(slot) = self.entries.get(&entry.id) else {
            return Err(SyncError::NotFound(entry.id));
        };
        let previous = slot.entry.clone();
        let old_bucket = slot.bucket;
        let emptied_group = self.replace_model(entry);
        let moved = self
            .entries
            .get(&previous.id)
            .map(|slot| slot.bucket != old_bucket)
            .unwrap_or(false);
        Ok(UpdateOutcome {
            previous,
            moved,
            emptied_group,
        })
    }

    pub fn delete_entry(&mut self, id: &EntryId) -> SyncResult<DeleteOutcome> {
        let Some((removed, emptied_group)) = self.remove_slot(id) else {
            return Err(SyncError::NotFound(id.clone()));
        };
        if self.unhomed.contains(id) || self.pages.values().any(|ids| ids.contains(id)) {
            self.tombstones.insert(id.clone(), removed.entry.added_on);
        }
        Ok(DeleteOutcome {
            removed,
            emptied_group,
        })
    }

    /// Undoes [`delete_entry`](Self::delete_entry).
    pub fn restore_entry(&mut self, restored: GroupedEntry) {
        self.tombstones.remove(&restored.entry.id);
        if self.entries.contains_key(&restored.entry.id) {
            return;
        }
        self.insert_slot(restored.entry, restored.ui);
    }

    /// Forgets a locally added entry whose remote add failed. Unlike a delete,
    /// no tombstone is kept and a group emptied by this is dropped at once.
    pub fn discard_entry(&mut self, id: &EntryId) -> bool {
        let Some((_, emptied_group)) = self.remove_slot(id) else {
            return false;
        };
        if let Some(name) = emptied_group {
            self.release_group(&name);
        }
        true
    }

    pub fn toggle_is_learned(&mut self, id: &EntryId) -> SyncResult<bool> {
        let slot = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        slot.ui.is_learned = !slot.ui.is_learned;
        Ok(slot.ui.is_learned)
    }

    pub fn time_groups(&self) -> Vec<TimeGroup> {
        self.groups
            .iter()
            .rev()
            .map(|(bucket, ids)| TimeGroup {
                bucket_order: bucket.order(),
                name: bucket.name().to_string(),
                entries: ids
                    .iter()
                    .filter_map(|id| self.entries.get(id))
                    .map(|slot| GroupedEntry {
                        entry: slot.entry.clone(),
                        ui: slot.ui,
                    })
                    .collect(),
            })
            .collect()
    }

    /// Drops a group kept around after becoming empty. Returns false when the
    /// group is unknown or has entries again.
    pub fn release_group(&mut self, name: &str) -> bool {
        let bucket = self
            .groups
            .iter()
            .find(|(bucket, ids)| bucket.name() == name && ids.is_empty())
            .map(|(bucket, _)| *bucket);
        match bucket {
            Some(bucket) => self.groups.remove(&bucket).is_some(),
            None => false,
        }
    }

    pub fn release_empty_groups(&mut self) -> Vec<String> {
        let empty: Vec<Bucket> = self
            .groups
            .iter()
            .filter(|(_, ids)| ids.is_empty())
            .map(|(bucket, _)| *bucket)
            .collect();
        for bucket in &empty {
            self.groups.remove(bucket);
        }
        empty.into_iter().map(|bucket| bucket.name().to_string()).collect()
    }

    /// Sort range a page snapshot speaks for. `None` when it covers nothing.
    fn coverage(
        &mut self,
        page: &PageKey,
        first: Option<Position>,
        last: Option<Position>,
        has_more: bool,
    ) -> Option<Coverage> {
        let start = match page.token() {
            None => None,
            Some(_) => {
                let start = match (self.page_starts.get(page).cloned(), first) {
                    (Some(known), Some(first)) => known.min(first),
                    (known, first) => known.or(first)?,
                };
                self.page_starts.insert(page.clone(), start.clone());
                Some(start)
            }
        };
        let end = if has_more { Some(last?) } else { None };
        Some(Coverage { start, end })
    }

    fn position_of(&self, id: &EntryId) -> Option<Position> {
        match self.entries.get(id) {
            Some(slot) => Some(Position::of(&slot.entry)),
            None => self
                .tombstones
                .get(id)
                .map(|added_on| Position(Reverse(*added_on), id.clone())),
        }
    }

    fn insert_slot(&mut self, entry: Entry, ui: EntryUiState) {
        let bucket = classify(entry.added_on, self.reference);
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = entry.id.clone();
        self.entries.insert(
            id.clone(),
            Slot {
                entry,
                ui,
                bucket,
                seq,
            },
        );
        self.place(&id);
    }

    /// Swaps the persisted fields of an existing entry, keeping its UI state and
    /// re-slotting it when `added_on` changed. Returns the group it emptied, if any.
    fn replace_model(&mut self, entry: Entry) -> Option<String> {
        let reference = self.reference;
        let slot = self.entries.get_mut(&entry.id)?;
        let resort = slot.entry.added_on != entry.added_on;
        let old_bucket = slot.bucket;
        slot.bucket = classify(entry.added_on, reference);
        slot.entry = entry;
        if !resort {
            return None;
        }
        let id = slot.entry.id.clone();
        self.unplace(&id, old_bucket);
        self.place(&id);
        self.groups
            .get(&old_bucket)
            .filter(|ids| ids.is_empty())
            .map(|_| old_bucket.name().to_string())
    }

    fn remove_slot(&mut self, id: &EntryId) -> Option<(GroupedEntry, Option<String>)> {
        let slot = self.entries.shift_remove(id)?;
        let emptied = self.unplace(id, slot.bucket);
        Some((
            GroupedEntry {
                entry: slot.entry,
                ui: slot.ui,
            },
            emptied,
        ))
    }

    fn place(&mut self, id: &EntryId) {
        let Some(slot) = self.entries.get(id) else {
            return;
        };
        let entries = &self.entries;
        let group = self.groups.entry(slot.bucket).or_default();
        let position = group.partition_point(|other| {
            entries
                .get(other)
                .map(|other| sorts_before(other, slot))
                .unwrap_or(true)
        });
        group.insert(position, id.clone());
    }

    fn unplace(&mut self, id: &EntryId, bucket: Bucket) -> Option<String> {
        let group = self.groups.get_mut(&bucket)?;
        let before = group.len();
        group.retain(|other| other != id);
        if before != group.len() && group.is_empty() {
            Some(bucket.name().to_string())
        } else {
            None
        }
    }

    fn rebuild_groups(&mut self) {
        self.groups.clear();
        let reference = self.reference;
        for slot in self.entries.values_mut() {
            slot.bucket = classify(slot.entry.added_on, reference);
        }
        let mut ids: Vec<(u64, EntryId)> = self
            .entries
            .values()
            .map(|slot| (slot.seq, slot.entry.id.clone()))
            .collect();
        ids.sort_by_key(|(seq, _)| *seq);
        for (_, id) in ids {
            self.place(&id);
        }
    }
}

/// Place in the page order: newest first, ties by id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Position(Reverse<OffsetDateTime>, EntryId);

impl Position {
    fn of(entry: &Entry) -> Self {
        Self(Reverse(entry.added_on), entry.id.clone())
    }
}

#[derive(Debug, Clone)]
struct Coverage {
    start: Option<Position>,
    end: Option<Position>,
}

impl Coverage {
    fn contains(&self, position: &Position) -> bool {
        self.start.as_ref().map_or(true, |start| position >= start)
            && self.end.as_ref().map_or(true, |end| position <= end)
    }
}

/// Newest first; equal timestamps keep insertion order.
fn sorts_before(existing: &Slot, incoming: &Slot) -> bool {
    existing.entry.added_on > incoming.entry.added_on
        || (existing.entry.added_on == incoming.entry.added_on && existing.seq < incoming.seq)
}
