use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::error::SyncError;

#[derive(Debug)]
enum Signal<T> {
    Value(T),
    Error(SyncError),
    Closed,
}

/// Producer half of a subscription. Pushes after the consumer unsubscribed
/// are dropped and reported as `false`, never as an error.
#[derive(Debug)]
pub struct Publisher<T> {
    tx: Sender<Signal<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Publisher<T> {
    pub fn push(&self, value: T) -> bool {
        self.tx.send(Signal::Value(value)).is_ok()
    }

    pub fn error(&self, err: SyncError) -> bool {
        self.tx.send(Signal::Error(err)).is_ok()
    }

    pub fn close(self) {
        let _ = self.tx.send(Signal::Closed);
    }
}

/// Consumer half. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: Receiver<Signal<T>>,
    closed: bool,
}

impl<T> Subscription<T> {
    pub fn drain(&mut self) -> Vec<Result<T, SyncError>> {
        let mut delivered = Vec::new();
        while !self.closed {
            match self.rx.try_recv() {
                Ok(Signal::Value(value)) => delivered.push(Ok(value)),
                Ok(Signal::Error(err)) => delivered.push(Err(err)),
                Ok(Signal::Closed) | Err(TryRecvError::Disconnected) => self.closed = true,
                Err(TryRecvError::Empty) => break,
            }
        }
        delivered
    }

    /// Like [`drain`](Self::drain) but keeps only the newest value; errors are returned alongside.
    pub fn latest(&mut self) -> (Option<T>, Vec<SyncError>) {
        let mut latest = None;
        let mut errors = Vec::new();
        for item in self.drain() {
            match item {
                Ok(value) => latest = Some(value),
                Err(err) => errors.push(err),
            }
        }
        (latest, errors)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn unsubscribe(self) {}
}

pub fn channel<T>() -> (Publisher<T>, Subscription<T>) {
    let (tx, rx) = unbounded();
    (Publisher { tx }, Subscription { rx, closed: false })
}
