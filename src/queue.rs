// src/queue.rs

//! Transaction queue
//!
//! Transactions live in *limbo* from creation until they are run. `put`
//! moves one out of limbo and either hands it straight to the worker or
//! appends it to a FIFO. Only one transaction is dispatched at a time; the
//! worker reports back with [`TransactionQueue::done`], which settles any
//! chained follow-up and dispatches the next queued transaction.
//!
//! Chained transactions (`RunAfter`) stay in limbo with status *waiting*
//! until their predecessor succeeds. If the predecessor fails or is
//! cancelled, the whole chain behind it is finished without ever running.

use crate::enums::{ExitState, Status};
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Snapshot published whenever the queue changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveTransactions {
    /// Transaction handed to the worker, if any
    pub current: Option<String>,
    /// Waiting transactions in dispatch order
    pub queued: Vec<String>,
}

impl ActiveTransactions {
    /// The `(current, queued)` pair as sent over the bus; an idle queue has
    /// an empty current path
    pub fn to_tuple(&self) -> (String, Vec<String>) {
        (self.current.clone().unwrap_or_default(), self.queued.clone())
    }
}

#[derive(Default)]
struct QueueInner {
    limbo: HashMap<String, Arc<Transaction>>,
    items: VecDeque<Arc<Transaction>>,
    running: Option<Arc<Transaction>>,
}

impl QueueInner {
    fn active(&self) -> ActiveTransactions {
        ActiveTransactions {
            current: self.running.as_ref().map(|t| t.tid().to_string()),
            queued: self.items.iter().map(|t| t.tid().to_string()).collect(),
        }
    }
}

/// Serializes transactions onto the single worker
pub struct TransactionQueue {
    inner: Mutex<QueueInner>,
    dispatch: mpsc::UnboundedSender<Arc<Transaction>>,
    changed: watch::Sender<ActiveTransactions>,
}

impl TransactionQueue {
    /// Create a queue and the receiving end the worker task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<Transaction>>) {
        let (dispatch, rx) = mpsc::unbounded_channel();
        let (changed, _) = watch::channel(ActiveTransactions::default());
        let queue = Self {
            inner: Mutex::new(QueueInner::default()),
            dispatch,
            changed,
        };
        (queue, rx)
    }

    /// Watch the current/queued transaction ids
    pub fn subscribe(&self) -> watch::Receiver<ActiveTransactions> {
        self.changed.subscribe()
    }

    pub fn active(&self) -> ActiveTransactions {
        self.inner.lock().active()
    }

    /// Park a freshly created transaction until it is run
    pub fn add_limbo(&self, trans: Arc<Transaction>) {
        self.inner
            .lock()
            .limbo
            .insert(trans.tid().to_string(), trans);
    }

    pub fn limbo_get(&self, tid: &str) -> Option<Arc<Transaction>> {
        self.inner.lock().limbo.get(tid).cloned()
    }

    /// Drop a transaction from limbo, returning it if it was there
    pub fn take_limbo(&self, tid: &str) -> Option<Arc<Transaction>> {
        self.inner.lock().limbo.remove(tid)
    }

    /// Transactions still in limbo
    pub fn limbo(&self) -> Vec<Arc<Transaction>> {
        self.inner.lock().limbo.values().cloned().collect()
    }

    pub fn running(&self) -> Option<Arc<Transaction>> {
        self.inner.lock().running.clone()
    }

    pub fn queued(&self) -> Vec<Arc<Transaction>> {
        self.inner.lock().items.iter().cloned().collect()
    }

    /// Nothing running and nothing waiting
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.running.is_none() && inner.items.is_empty()
    }

    /// Find a queued or running transaction by id
    pub fn find(&self, tid: &str) -> Option<Arc<Transaction>> {
        let inner = self.inner.lock();
        inner
            .running
            .iter()
            .chain(inner.items.iter())
            .find(|t| t.tid() == tid)
            .cloned()
    }

    /// Move a transaction out of limbo and towards the worker
    pub fn put(&self, trans: Arc<Transaction>) {
        {
            let mut inner = self.inner.lock();
            inner.limbo.remove(trans.tid());
            if trans.is_finished() {
                debug!("Not queueing finished transaction {}", trans.tid());
                return;
            }
            if inner.running.is_none() && inner.items.is_empty() {
                self.dispatch_locked(&mut inner, trans);
            } else {
                info!("Queueing transaction {}", trans.tid());
                trans.set_status(Status::Waiting);
                inner.items.push_back(trans);
            }
        }
        self.notify();
    }

    /// Remove a transaction that has not been dispatched yet
    ///
    /// Returns false if it is running or unknown.
    pub fn remove(&self, trans: &Transaction) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.items.len();
            inner.items.retain(|t| t.tid() != trans.tid());
            let queued = inner.items.len() != before;
            let limbo = inner.limbo.remove(trans.tid()).is_some();
            queued || limbo
        };
        if removed {
            debug!("Removed transaction {} from the queue", trans.tid());
            self.notify();
        }
        removed
    }

    /// The worker finished `trans`; settle its chain and dispatch the next one
    pub fn done(&self, trans: &Transaction) {
        {
            let mut inner = self.inner.lock();
            match inner.running {
                Some(ref running) if running.tid() == trans.tid() => inner.running = None,
                _ => warn!("Transaction {} finished but was not running", trans.tid()),
            }

            if let Some(next) = trans.after() {
                match trans.exit() {
                    ExitState::Success => {
                        info!("Queueing {} after {}", next.tid(), trans.tid());
                        inner.limbo.remove(next.tid());
                        // a successor runs before anything queued meanwhile
                        if !next.is_finished() {
                            next.set_status(Status::Waiting);
                            inner.items.push_front(next);
                        }
                    }
                    exit => Self::fail_chain(&mut inner, next, exit),
                }
            }

            while let Some(head) = inner.items.pop_front() {
                if head.is_finished() {
                    continue;
                }
                self.dispatch_locked(&mut inner, head);
                break;
            }
        }
        self.notify();
    }

    /// Run `next` once `first` has succeeded
    ///
    /// `next` must be in limbo. If `first` already went through the worker
    /// the chain is settled right away.
    pub fn chain(&self, first: &Arc<Transaction>, next: Arc<Transaction>) -> Result<()> {
        if next.chain_contains(first) {
            return Err(Error::InvalidArgument(format!(
                "{} cannot run after itself",
                next.tid()
            )));
        }
        {
            let mut inner = self.inner.lock();
            first.set_after(next.clone())?;
            next.set_status(Status::Waiting);

            let settled = first.is_finished()
                && inner.running.as_ref().is_none_or(|t| t.tid() != first.tid())
                && !inner.limbo.contains_key(first.tid());
            if settled {
                match first.exit() {
                    ExitState::Success => {
                        inner.limbo.remove(next.tid());
                        inner.items.push_front(next);
                        if inner.running.is_none()
                            && let Some(head) = inner.items.pop_front()
                        {
                            self.dispatch_locked(&mut inner, head);
                        }
                    }
                    exit => Self::fail_chain(&mut inner, next, exit),
                }
            }
        }
        self.notify();
        Ok(())
    }

    /// Cancel a transaction the worker has not picked up yet, together
    /// with everything chained behind it
    ///
    /// Returns false if it is running or unknown.
    pub fn cancel_waiting(&self, trans: &Arc<Transaction>) -> bool {
        let cancelled = {
            let mut inner = self.inner.lock();
            let queued = inner.items.iter().any(|t| t.tid() == trans.tid());
            let limbo = inner.limbo.contains_key(trans.tid());
            if queued || limbo {
                inner.items.retain(|t| t.tid() != trans.tid());
                inner.limbo.remove(trans.tid());
                trans.request_cancel();
                trans.set_exit(ExitState::Cancelled);
                if let Some(next) = trans.after() {
                    Self::fail_chain(&mut inner, next, ExitState::Cancelled);
                }
                true
            } else {
                false
            }
        };
        if cancelled {
            info!("Cancelled waiting transaction {}", trans.tid());
            self.notify();
        }
        cancelled
    }

    /// Drop a finished transaction that never got past limbo, failing
    /// everything chained behind it
    pub fn abandon(&self, trans: &Arc<Transaction>) {
        {
            let mut inner = self.inner.lock();
            inner.limbo.remove(trans.tid());
            if let Some(next) = trans.after() {
                Self::fail_chain(&mut inner, next, trans.exit());
            }
        }
        self.notify();
    }

    /// Finish every transaction chained behind one that did not succeed
    fn fail_chain(inner: &mut QueueInner, first: Arc<Transaction>, exit: ExitState) {
        let successor_exit = match exit {
            ExitState::Cancelled => ExitState::Cancelled,
            _ => ExitState::PreviousFailed,
        };
        let mut next = Some(first);
        while let Some(trans) = next {
            inner.limbo.remove(trans.tid());
            inner.items.retain(|t| t.tid() != trans.tid());
            info!(
                "Transaction {} will not run: {} before it",
                trans.tid(),
                exit
            );
            trans.set_status_details(trans.role().error_text());
            trans.set_exit(successor_exit);
            next = trans.after();
        }
    }

    fn dispatch_locked(&self, inner: &mut QueueInner, trans: Arc<Transaction>) {
        info!("Dispatching transaction {}", trans.tid());
        inner.running = Some(trans.clone());
        if self.dispatch.send(trans).is_err() {
            warn!("Worker is gone, cannot dispatch");
            inner.running = None;
        }
    }

    fn notify(&self) {
        let active = self.active();
        self.changed.send_if_modified(|current| {
            if *current != active {
                *current = active;
                true
            } else {
                false
            }
        });
    }
}
