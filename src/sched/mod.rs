//! Weighted Fair Queuing over a fixed set of priority classes.
//!
//! The scheduler guarantees each class a share of the receiver's throughput
//! proportional to its configured weight, independent of the load each
//! class offers and adaptive to varying per-message service time.
//!
//! Every submitted message is assigned a *virtual finish time*: the virtual
//! time at which it would complete if the receiver served exactly its class
//! at its fair share. Pending messages are dispatched in virtual-finish
//! order, so classes with larger weights advance their clocks more slowly
//! and keep more of their messages near the front. The per-message cost
//! estimate feeding the virtual clock is a rolling average of observed
//! service times, bootstrapped with a configurable initial cost until the
//! first sample lands.
//!
//! All scheduler state - the pending heap, the virtual clocks, the cost
//! estimator, the worker semaphore - is owned by a single dispatch task.
//! Submitters, completed workers, and closers talk to it over channels.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    api::{ReceiveError, Receiver, ServeError},
    message::Message,
};

mod rolling;

pub mod multi;

pub use multi::{MultiServer, ServerWeight};

/// Attribute stamped on every message naming the class it was dispatched
/// for. Downstream consumers and test harnesses key off it.
pub const PRIORITY_ATTRIBUTE: &str = "x-multiserver-priority";

/// Configuration errors reported at construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("weights must not be empty")]
    NoWeights,

    #[error("weights must be positive")]
    NonPositiveWeight,

    #[error("concurrency must be greater than 0")]
    NonPositiveConcurrency,
}

/// A message waiting for dispatch, together with its completion channel.
struct WeightedMessage {
    msg: Message,
    ctx: CancellationToken,
    priority: usize,
    done: oneshot::Sender<Result<(), ReceiveError>>,
}

/// Heap entry ordering: virtual finish time, ties broken by submission
/// order.
struct Entry {
    v_finish: f64,
    seq: u64,
    wm: WeightedMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // v_finish is never NaN: weights are validated positive and costs
        // are finite.
        self.v_finish
            .partial_cmp(&other.v_finish)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Builder for a [`WeightedFairScheduler`].
pub struct Builder {
    weights: Vec<f64>,
    max_concurrent: usize,
    queue_wait_time: Duration,
    initial_cost: f64,
}

impl Builder {
    /// Maximum number of concurrent receiver invocations.
    ///
    /// Default: 10.
    #[must_use]
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Dispatch tick period.
    ///
    /// Longer waits improve fairness (more candidates accumulate between
    /// picks), shorter waits improve latency. A good value is around the
    /// mean service time of the receiver.
    ///
    /// Default: 1 ms.
    #[must_use]
    pub fn queue_wait_time(mut self, queue_wait_time: Duration) -> Self {
        self.queue_wait_time = queue_wait_time;
        self
    }

    /// Cost assumed for a message, in milliseconds, until the estimator has
    /// observed a sample.
    ///
    /// Default: 100 ms.
    #[must_use]
    pub fn initial_cost(mut self, initial_cost: f64) -> Self {
        self.initial_cost = initial_cost;
        self
    }

    /// Validates the configuration, spawns the dispatch task, and returns
    /// the scheduler handle.
    pub fn build(self, receiver: Arc<dyn Receiver>) -> Result<WeightedFairScheduler, ConfigError> {
        if self.weights.is_empty() {
            return Err(ConfigError::NoWeights);
        }
        if self.weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(ConfigError::NonPositiveWeight);
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::NonPositiveConcurrency);
        }

        let weights: Arc<[f64]> = self.weights.into();
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (samples_tx, samples_rx) = mpsc::channel(64);

        let dispatch = Dispatch {
            receiver,
            weights: weights.clone(),
            last_v_finish: vec![0.0; weights.len()],
            start_time: 1.0,
            heap: BinaryHeap::new(),
            seq: 0,
            estimator: rolling::TimeWindow::new(ESTIMATOR_WINDOW, ESTIMATOR_GRANULARITY),
            initial_cost: self.initial_cost,
            workers: Arc::new(Semaphore::new(self.max_concurrent)),
            samples_tx,
            clock: quanta::Clock::new(),
        };
        tokio::spawn(dispatch.run(inbox_rx, samples_rx, close_rx, self.queue_wait_time));

        Ok(WeightedFairScheduler {
            inbox: inbox_tx,
            close: close_tx,
            weights,
        })
    }
}

/// Number of cost-estimator buckets.
const ESTIMATOR_WINDOW: usize = 10_000;

/// Width of one cost-estimator bucket.
const ESTIMATOR_GRANULARITY: Duration = Duration::from_millis(1);

/// Handle to a running weighted-fair dispatcher.
///
/// Clones share the same dispatch task. The scheduler multiplexes N
/// priority classes into one receiver; use
/// [`with_priority_receiver`](Self::with_priority_receiver) to obtain the
/// per-class submission handles.
#[derive(Clone)]
pub struct WeightedFairScheduler {
    inbox: mpsc::Sender<WeightedMessage>,
    close: mpsc::Sender<oneshot::Sender<()>>,
    weights: Arc<[f64]>,
}

impl WeightedFairScheduler {
    /// Starts building a scheduler over the given per-class weights. The
    /// class with weight `weights[p]` receives a `weights[p] / Σweights`
    /// share of throughput under sustained load.
    pub fn builder(weights: Vec<f64>) -> Builder {
        Builder {
            weights,
            max_concurrent: 10,
            queue_wait_time: Duration::from_millis(1),
            initial_cost: 100.0,
        }
    }

    /// Returns a receiver handle that submits its messages to class
    /// `priority` and blocks until the terminal receiver has processed
    /// them.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is not a valid class index.
    pub fn with_priority_receiver(&self, priority: usize) -> PriorityReceiver {
        assert!(
            priority < self.weights.len(),
            "invalid priority {priority} for {} classes",
            self.weights.len()
        );
        PriorityReceiver {
            sched: self.clone(),
            priority,
        }
    }

    /// Submits a message to class `priority` and waits for its completion.
    ///
    /// The submitter's `ctx` is raced against completion: if it fires while
    /// the message is still queued, the call returns
    /// [`ReceiveError::Cancelled`] and the queued entry is discarded at
    /// dispatch time.
    async fn receive_with_priority(
        &self,
        ctx: CancellationToken,
        msg: Message,
        priority: usize,
    ) -> Result<(), ReceiveError> {
        let (done_tx, done_rx) = oneshot::channel();
        let wm = WeightedMessage {
            msg,
            ctx: ctx.clone(),
            priority,
            done: done_tx,
        };
        self.inbox
            .send(wm)
            .await
            .map_err(|_| ReceiveError::SchedulerClosed)?;

        tokio::select! {
            res = done_rx => match res {
                Ok(res) => res,
                Err(_) if ctx.is_cancelled() => Err(ReceiveError::Cancelled),
                Err(_) => Err(ReceiveError::SchedulerClosed),
            },
            _ = ctx.cancelled() => Err(ReceiveError::Cancelled),
        }
    }

    /// Stops the dispatch task.
    ///
    /// In-flight messages finish naturally through their completion
    /// channels. Pending queued messages are dropped; their submitters are
    /// unblocked with [`ReceiveError::SchedulerClosed`]. If `deadline`
    /// fires before the dispatcher acknowledges, returns
    /// [`ServeError::DeadlineExceeded`].
    pub async fn close(&self, deadline: CancellationToken) -> Result<(), ServeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.close.send(ack_tx).await.is_err() {
            // Dispatcher already gone.
            return Ok(());
        }

        tokio::select! {
            _ = ack_rx => Ok(()),
            _ = deadline.cancelled() => Err(ServeError::DeadlineExceeded),
        }
    }
}

/// Per-class submission handle returned by
/// [`WeightedFairScheduler::with_priority_receiver`].
pub struct PriorityReceiver {
    sched: WeightedFairScheduler,
    priority: usize,
}

#[async_trait::async_trait]
impl Receiver for PriorityReceiver {
    async fn receive(&self, ctx: CancellationToken, msg: Message) -> Result<(), ReceiveError> {
        self.sched.receive_with_priority(ctx, msg, self.priority).await
    }
}

/// The dispatch actor: sole owner of the scheduler state.
struct Dispatch {
    receiver: Arc<dyn Receiver>,
    weights: Arc<[f64]>,
    last_v_finish: Vec<f64>,
    start_time: f64,
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
    estimator: rolling::TimeWindow,
    initial_cost: f64,
    workers: Arc<Semaphore>,
    samples_tx: mpsc::Sender<f64>,
    clock: quanta::Clock,
}

impl Dispatch {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<WeightedMessage>,
        mut samples: mpsc::Receiver<f64>,
        mut close: mpsc::Receiver<oneshot::Sender<()>>,
        queue_wait_time: Duration,
    ) {
        let mut tick = tokio::time::interval(queue_wait_time);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                ack = close.recv() => {
                    let pending = self.heap.len();
                    if pending > 0 {
                        debug!(pending, "dropping queued messages on close");
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    // Dropping the heap drops the pending completion
                    // senders, waking every blocked submitter.
                    return;
                }
                wm = inbox.recv() => match wm {
                    Some(wm) => self.enqueue(wm),
                    // Every handle dropped: nothing can be submitted or
                    // closed anymore.
                    None => return,
                },
                Some(ms) = samples.recv() => self.estimator.append(ms),
                _ = tick.tick() => self.dispatch_one(),
            }
        }
    }

    /// Assigns the virtual finish time and queues the message.
    fn enqueue(&mut self, wm: WeightedMessage) {
        let p = wm.priority;
        let v_start = self.start_time.max(self.last_v_finish[p]);
        let cost = self.estimator.average().unwrap_or(self.initial_cost).round();
        let v_finish = v_start + cost / self.weights[p];
        self.last_v_finish[p] = v_finish;

        self.seq += 1;
        trace!(priority = p, v_finish, "enqueued");
        self.heap.push(Reverse(Entry {
            v_finish,
            seq: self.seq,
            wm,
        }));
    }

    /// Dispatches the minimum-finish pending message, if a worker slot is
    /// free.
    fn dispatch_one(&mut self) {
        let Ok(permit) = self.workers.clone().try_acquire_owned() else {
            return;
        };

        let entry = loop {
            match self.heap.pop() {
                None => return,
                // The submitter gave up (cancellation) or vanished; skip
                // without invoking the receiver.
                Some(Reverse(e)) if e.wm.ctx.is_cancelled() || e.wm.done.is_closed() => {
                    trace!(priority = e.wm.priority, "discarding abandoned entry");
                }
                Some(Reverse(e)) => break e,
            }
        };

        let receiver = self.receiver.clone();
        let samples = self.samples_tx.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let WeightedMessage {
                mut msg,
                ctx,
                priority,
                done,
            } = entry.wm;

            msg.attributes.set(PRIORITY_ATTRIBUTE, priority.to_string());

            let start = clock.now();
            let result = receiver.receive(ctx, msg).await;
            let elapsed_ms = (clock.now() - start).as_secs_f64() * 1_000.0;

            let _ = samples.send(elapsed_ms).await;
            let _ = done.send(result);
        });
    }
}
