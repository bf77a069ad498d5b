use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{SourceKind, SyncError, SyncResult};
use crate::model::Entry;
use crate::sources::{
    channel, AuthSource, BatchSource, EntriesResult, Mutation, PageRequest, PageSource, Publisher,
    StatsSnapshot, StatsSource, Subscription,
};

#[derive(Default)]
pub struct FakeBatchSource {
    batches: Mutex<VecDeque<Vec<Entry>>>,
    failing: bool,
    calls: AtomicUsize,
}

impl FakeBatchSource {
    /// Each `sample` call returns the next queued batch, then empty batches.
    pub fn new(batches: Vec<Vec<Entry>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BatchSource for FakeBatchSource {
    fn sample(&self, n: usize) -> SyncResult<Vec<Entry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(SyncError::source_failure(SourceKind::Batch, "sampling unavailable"));
        }
        let mut batch = self.batches.lock().pop_front().unwrap_or_default();
        batch.truncate(n);
        Ok(batch)
    }
}

#[derive(Default)]
pub struct FakePageSource {
    windows: Mutex<Vec<(PageRequest, Publisher<EntriesResult>)>>,
    mutations: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl FakePageSource {
    /// Pushes `result` to the `index`th subscribed window.
    pub fn push(&self, index: usize, result: EntriesResult) -> bool {
        self.windows
            .lock()
            .get(index)
            .map(|(_, publisher)| publisher.push(result))
            .unwrap_or(false)
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.windows
            .lock()
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }

    /// Labels of every acknowledged mutation.
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().clone()
    }

    pub fn fail_mutations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl PageSource for FakePageSource {
    fn subscribe(&self, request: PageRequest) -> Subscription<EntriesResult> {
        let (publisher, subscription) = channel();
        self.windows.lock().push((request, publisher));
        subscription
    }

    fn mutate(&self, mutation: Mutation) -> SyncResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::source_failure(SourceKind::Page, "write rejected"));
        }
        self.mutations.lock().push(mutation.label().to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStatsSource {
    publisher: Mutex<Option<Publisher<StatsSnapshot>>>,
    subscriptions: AtomicUsize,
}

impl FakeStatsSource {
    pub fn push(&self, snapshot: StatsSnapshot) -> bool {
        self.publisher
            .lock()
            .as_ref()
            .map(|publisher| publisher.push(snapshot))
            .unwrap_or(false)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl StatsSource for FakeStatsSource {
    fn subscribe(&self) -> Subscription<StatsSnapshot> {
        let (publisher, subscription) = channel();
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        *self.publisher.lock() = Some(publisher);
        subscription
    }
}

#[derive(Default)]
pub struct FakeAuth {
    user: Mutex<Option<String>>,
    publishers: Mutex<Vec<Publisher<bool>>>,
}

impl FakeAuth {
    pub fn login(&self, user_id: &str) {
        *self.user.lock() = Some(user_id.to_string());
        self.broadcast(true);
    }

    pub fn logout(&self) {
        *self.user.lock() = None;
        self.broadcast(false);
    }

    fn broadcast(&self, logged_in: bool) {
        self.publishers
            .lock()
            .retain(|publisher| publisher.push(logged_in));
    }
}

impl AuthSource for FakeAuth {
    fn login_state(&self) -> Subscription<bool> {
        let (publisher, subscription) = channel();
        publisher.push(self.user.lock().is_some());
        self.publishers.lock().push(publisher);
        subscription
    }

    fn current_user_id(&self) -> SyncResult<String> {
        self.user.lock().clone().ok_or(SyncError::NotLoggedIn)
    }
}
