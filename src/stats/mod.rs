use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::sources::{StatsSnapshot, StatsSource, Subscription};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStats {
    pub total_entry_count: u64,
    pub learned_entry_count: u64,
}

impl EntryStats {
    /// Clamps raw counters so both are non-negative and `learned <= total`.
    pub fn sanitized(total: i64, learned: i64) -> Self {
        let total = total.max(0) as u64;
        let learned = (learned.max(0) as u64).min(total);
        Self {
            total_entry_count: total,
            learned_entry_count: learned,
        }
    }

    pub fn apply(self, delta: StatsDelta) -> Self {
        let total = self.total_entry_count as i64;
        let learned = self.learned_entry_count as i64;
        let (total, learned) = match delta {
            StatsDelta::Added => (total + 1, learned),
            StatsDelta::Deleted { was_learned } => {
                (total - 1, if was_learned { learned - 1 } else { learned })
            }
            StatsDelta::Archived => (total, learned + 1),
            StatsDelta::Unarchived => (total, learned - 1),
        };
        Self::sanitized(total, learned)
    }
}

impl From<StatsSnapshot> for EntryStats {
    fn from(snapshot: StatsSnapshot) -> Self {
        Self::sanitized(snapshot.total_entry_count, snapshot.learned_entry_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsDelta {
    Added,
    Deleted { was_learned: bool },
    Archived,
    Unarchived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsSignal {
    Authoritative(StatsSnapshot),
    Optimistic(StatsDelta),
}

/// One entry of a finite stats event log; `at` is relative to the start of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsEvent {
    pub at: Duration,
    pub signal: StatsSignal,
}

#[derive(Debug, Clone, Copy)]
struct PendingSnapshot {
    stats: EntryStats,
    received_at: Instant,
}

#[derive(Debug)]
pub struct StatsReconciler {
    debounce: Duration,
    subscription: Option<Subscription<StatsSnapshot>>,
    pending: Option<PendingSnapshot>,
    last_emitted: Option<EntryStats>,
}

impl StatsReconciler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            subscription: None,
            pending: None,
            last_emitted: None,
        }
    }

    pub fn current(&self) -> Option<EntryStats> {
        self.last_emitted
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn set_logged_in(&mut self, logged_in: bool, source: &dyn StatsSource) {
        match (logged_in, self.subscription.is_some()) {
            (true, false) => {
                tracing::debug!("subscribing to stats source");
                self.subscription = Some(source.subscribe());
            }
            (false, true) => {
                tracing::debug!("dropping stats subscription after logout");
                if let Some(subscription) = self.subscription.take() {
                    subscription.unsubscribe();
                }
                self.pending = None;
                self.last_emitted = None;
            }
            _ => {}
        }
    }

    pub fn pump(&mut self, now: Instant) -> SyncResult<Vec<EntryStats>> {
        let mut emitted = Vec::new();
        let mut failure = None;
        if let Some(subscription) = self.subscription.as_mut() {
            for item in subscription.drain() {
                match item {
                    Ok(snapshot) => {
                        if let Some(stats) = self.receive_snapshot(snapshot, now) {
                            emitted.push(stats);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "stats source reported an error");
                        failure = Some(err);
                    }
                }
            }
        }
        if let Some(stats) = self.poll(now) {
            emitted.push(stats);
        }
        match failure {
            Some(err) if emitted.is_empty() => Err(err),
            _ => Ok(emitted),
        }
    }

    /// A pending snapshot whose quiet window elapsed is emitted first.
    pub fn receive_snapshot(&mut self, snapshot: StatsSnapshot, now: Instant) -> Option<EntryStats> {
        let flushed = self.poll(now);
        self.pending = Some(PendingSnapshot {
            stats: EntryStats::from(snapshot),
            received_at: now,
        });
        flushed
    }

    /// Predicts the counters after a local mutation. Nothing is produced until
    /// a first aggregate is known.
    pub fn apply_optimistic(&mut self, delta: StatsDelta) -> Option<EntryStats> {
        let base = self.last_emitted?;
        self.emit(base.apply(delta))
    }

    /// Emits the pending authoritative value once its debounce window has passed.
    pub fn poll(&mut self, now: Instant) -> Option<EntryStats> {
        let pending = self.pending?;
        if now.saturating_duration_since(pending.received_at) < self.debounce {
            return None;
        }
        self.pending = None;
        self.emit(pending.stats)
    }

    pub fn flush(&mut self) -> Option<EntryStats> {
        let pending = self.pending.take()?;
        self.emit(pending.stats)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn emit(&mut self, stats: EntryStats) -> Option<EntryStats> {
        if self.last_emitted == Some(stats) {
            return None;
        }
        self.last_emitted = Some(stats);
        Some(stats)
    }
}

/// Replays a finite event log through a fresh reconciler and returns every
/// emitted aggregate, flushing whatever is still pending at the end.
pub fn reconcile(log: &[StatsEvent], debounce: Duration) -> Vec<EntryStats> {
    let origin = Instant::now();
    let mut reconciler = StatsReconciler::new(debounce);
    let mut emitted = Vec::new();
    for event in log {
        let now = origin + event.at;
        emitted.extend(reconciler.poll(now));
        match event.signal {
            StatsSignal::Authoritative(snapshot) => {
                emitted.extend(reconciler.receive_snapshot(snapshot, now));
            }
            StatsSignal::Optimistic(delta) => {
                emitted.extend(reconciler.apply_optimistic(delta));
            }
        }
    }
    emitted.extend(reconciler.flush());
    emitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::channel;
    use parking_lot::Mutex;

    const DEBOUNCE: Duration = Duration::from_millis(250);

    fn snapshot(total: i64, learned: i64) -> StatsSnapshot {
        StatsSnapshot {
            total_entry_count: total,
            learned_entry_count: learned,
            from_cache: false,
        }
    }

    fn stats(total: u64, learned: u64) -> EntryStats {
        EntryStats {
            total_entry_count: total,
            learned_entry_count: learned,
        }
    }

    fn at(ms: u64, signal: StatsSignal) -> StatsEvent {
        StatsEvent {
            at: Duration::from_millis(ms),
            signal,
        }
    }

    #[test]
    fn back_to_back_snapshots_coalesce_into_settled_pair() {
        let log = [
            at(0, StatsSignal::Authoritative(snapshot(10, 2))),
            at(400, StatsSignal::Authoritative(snapshot(10, 3))),
            at(410, StatsSignal::Authoritative(snapshot(9, 3))),
        ];
        assert_eq!(reconcile(&log, DEBOUNCE), vec![stats(10, 2), stats(9, 3)]);
    }

    #[test]
    fn identical_values_are_not_emitted_twice() {
        let log = [
            at(0, StatsSignal::Authoritative(snapshot(5, 1))),
            at(300, StatsSignal::Authoritative(snapshot(5, 1))),
            at(600, StatsSignal::Authoritative(StatsSnapshot {
                from_cache: true,
                ..snapshot(5, 1)
            })),
        ];
        assert_eq!(reconcile(&log, DEBOUNCE), vec![stats(5, 1)]);
    }

    #[test]
    fn optimistic_deltas_build_on_last_emission() {
        let log = [
            at(0, StatsSignal::Authoritative(snapshot(3, 1))),
            at(300, StatsSignal::Optimistic(StatsDelta::Added)),
            at(310, StatsSignal::Optimistic(StatsDelta::Archived)),
            at(320, StatsSignal::Optimistic(StatsDelta::Deleted { was_learned: true })),
        ];
        assert_eq!(
            reconcile(&log, DEBOUNCE),
            vec![stats(3, 1), stats(4, 1), stats(4, 2), stats(3, 1)]
        );
    }

    #[test]
    fn optimistic_delta_before_any_aggregate_is_ignored() {
        let log = [at(0, StatsSignal::Optimistic(StatsDelta::Added))];
        assert!(reconcile(&log, DEBOUNCE).is_empty());
    }

    #[test]
    fn authoritative_value_supersedes_prediction() {
        let log = [
            at(0, StatsSignal::Authoritative(snapshot(3, 0))),
            at(300, StatsSignal::Optimistic(StatsDelta::Added)),
            at(350, StatsSignal::Authoritative(snapshot(3, 0))),
            at(360, StatsSignal::Authoritative(snapshot(4, 0))),
        ];
        // The lagging (3, 0) is coalesced away by the settled (4, 0), which
        // matches the prediction and is therefore not repeated.
        assert_eq!(reconcile(&log, DEBOUNCE), vec![stats(3, 0), stats(4, 0)]);
    }

    #[test]
    fn emissions_are_sanitized_and_never_repeat() {
        let log = [
            at(0, StatsSignal::Authoritative(snapshot(-2, 5))),
            at(300, StatsSignal::Optimistic(StatsDelta::Unarchived)),
            at(310, StatsSignal::Optimistic(StatsDelta::Deleted { was_learned: false })),
            at(320, StatsSignal::Authoritative(snapshot(2, 7))),
        ];
        let emitted = reconcile(&log, DEBOUNCE);
        assert_eq!(emitted, vec![stats(0, 0), stats(2, 2)]);
        assert!(emitted.windows(2).all(|pair| pair[0] != pair[1]));
        assert!(emitted
            .iter()
            .all(|s| s.learned_entry_count <= s.total_entry_count));
    }

    struct ScriptedStats {
        publisher: Mutex<Option<crate::sources::Publisher<StatsSnapshot>>>,
    }

    impl StatsSource for ScriptedStats {
        fn subscribe(&self) -> Subscription<StatsSnapshot> {
            let (publisher, subscription) = channel();
            *self.publisher.lock() = Some(publisher);
            subscription
        }
    }

    #[test]
    fn subscribes_only_while_logged_in() {
        let source = ScriptedStats {
            publisher: Mutex::new(None),
        };
        let mut reconciler = StatsReconciler::new(Duration::ZERO);
        assert!(reconciler.pump(Instant::now()).unwrap().is_empty());
        assert!(source.publisher.lock().is_none());

        reconciler.set_logged_in(true, &source);
        let publisher = source.publisher.lock().clone().expect("subscribed");
        publisher.push(snapshot(7, 2));
        assert_eq!(reconciler.pump(Instant::now()).unwrap(), vec![stats(7, 2)]);

        reconciler.set_logged_in(false, &source);
        assert!(!reconciler.is_subscribed());
        assert!(reconciler.current().is_none());
        assert!(!publisher.push(snapshot(8, 2)));
    }

    #[test]
    fn pump_holds_value_until_debounce_elapses() {
        let source = ScriptedStats {
            publisher: Mutex::new(None),
        };
        let mut reconciler = StatsReconciler::new(DEBOUNCE);
        reconciler.set_logged_in(true, &source);
        let publisher = source.publisher.lock().clone().expect("subscribed");
        let start = Instant::now();
        publisher.push(snapshot(1, 0));
        assert!(reconciler.pump(start).unwrap().is_empty());
        assert!(reconciler.has_pending());
        assert_eq!(
            reconciler.pump(start + DEBOUNCE).unwrap(),
            vec![stats(1, 0)]
        );
    }
}
