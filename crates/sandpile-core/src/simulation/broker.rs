//! Message-passing halo transport.
//!
//! Every worker registers an endpoint with a shared [`HaloBroker`] and gets a
//! bounded mailbox. Messages carry the sender rank and the iteration they
//! belong to, so an endpoint can set aside traffic that arrives early (a
//! neighbor may already be one iteration ahead) and match exactly the row or
//! flag it is waiting for.
//!
//! Per iteration a worker posts its two boundary rows without blocking, then
//! blocks until both ghost rows have arrived. The changed-flag all-reduce
//! goes through rank 0: every other rank sends its flag there and waits for
//! the OR to come back. This reduction is not a global barrier: a rank that
//! has its verdict may start the next iteration while others still wait.
//!
//! Delivery is never retried. A full or missing mailbox, a receive timeout
//! or a broker shutdown is reported as a communication error for the run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;

use super::convergence::{reduce_changed, ChangeReduction};
use super::grid::Cell;
use super::halo::{HaloDirection, HaloExchange};
use super::partition::Partition;
use crate::error::{Phase, Result, SandpileError};

/// Rank that performs the changed-flag reduction.
const ROOT: usize = 0;

/// Mailbox slack on top of one slot per worker (rows of two iterations plus a verdict).
const MAILBOX_SLACK: usize = 8;

/// Configuration for the halo broker.
#[derive(Debug, Clone)]
pub struct HaloConfig {
    /// Minimum mailbox capacity per endpoint.
    pub max_pending_messages: usize,
    /// How long a receive waits before the peer is considered lost.
    pub receive_timeout: Duration,
}

impl Default for HaloConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: 64,
            receive_timeout: Duration::from_secs(30),
        }
    }
}

/// What a message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaloPayload {
    /// A boundary row for the receiver's ghost row on `side`.
    Row {
        /// Ghost row of the receiver this row fills.
        side: HaloDirection,
        /// Padded row including sink columns.
        cells: Vec<Cell>,
    },
    /// A worker's local changed flag, sent to the root.
    Changed(bool),
    /// The global changed flag, sent by the root.
    Verdict(bool),
}

/// A tagged message between workers.
#[derive(Debug, Clone)]
pub struct HaloMessage {
    /// Sending rank.
    pub source: usize,
    /// Iteration the payload belongs to.
    pub iteration: u64,
    /// The payload.
    pub payload: HaloPayload,
}

/// Outcome of handing a message to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Message queued in the destination mailbox.
    Delivered,
    /// Destination mailbox is full.
    QueueFull,
    /// Destination rank is not registered.
    NotFound,
    /// Destination endpoint was dropped.
    Closed,
}

/// Broker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Number of registered endpoints.
    pub registered_endpoints: usize,
    /// Total messages delivered.
    pub messages_delivered: u64,
    /// Total halo cells carried by row messages.
    pub cells_delivered: u64,
}

/// Routes messages between worker endpoints.
pub struct HaloBroker {
    config: HaloConfig,
    endpoints: RwLock<HashMap<usize, Sender<HaloMessage>>>,
    messages_delivered: AtomicU64,
    cells_delivered: AtomicU64,
}

impl HaloBroker {
    /// Create a new broker.
    pub fn new(config: HaloConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            endpoints: RwLock::new(HashMap::new()),
            messages_delivered: AtomicU64::new(0),
            cells_delivered: AtomicU64::new(0),
        })
    }

    /// Register the endpoint for `rank` out of `workers`.
    pub fn register(self: &Arc<Self>, rank: usize, workers: usize) -> HaloEndpoint {
        let capacity = self
            .config
            .max_pending_messages
            .max(workers + MAILBOX_SLACK);
        let (sender, receiver) = channel::bounded(capacity);

        self.endpoints.write().insert(rank, sender);

        HaloEndpoint {
            rank,
            workers,
            receiver,
            broker: Arc::clone(self),
            early: Vec::new(),
            timeout: self.config.receive_timeout,
        }
    }

    /// Check if a rank is registered.
    pub fn is_registered(&self, rank: usize) -> bool {
        self.endpoints.read().contains_key(&rank)
    }

    /// Queue `message` in the mailbox of `destination` without blocking.
    pub fn deliver(&self, destination: usize, message: HaloMessage) -> DeliveryStatus {
        let cells = match &message.payload {
            HaloPayload::Row { cells, .. } => cells.len() as u64,
            _ => 0,
        };

        let endpoints = self.endpoints.read();
        let Some(sender) = endpoints.get(&destination) else {
            return DeliveryStatus::NotFound;
        };
        match sender.try_send(message) {
            Ok(()) => {
                self.messages_delivered.fetch_add(1, Ordering::Relaxed);
                self.cells_delivered.fetch_add(cells, Ordering::Relaxed);
                DeliveryStatus::Delivered
            }
            Err(TrySendError::Full(_)) => DeliveryStatus::QueueFull,
            Err(TrySendError::Disconnected(_)) => DeliveryStatus::Closed,
        }
    }

    /// Drop every mailbox sender. Endpoints blocked in a receive observe a
    /// disconnect instead of waiting for their timeout.
    pub fn shutdown(&self) {
        self.endpoints.write().clear();
    }

    /// Get statistics.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            registered_endpoints: self.endpoints.read().len(),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            cells_delivered: self.cells_delivered.load(Ordering::Relaxed),
        }
    }
}

/// One worker's connection to the broker.
pub struct HaloEndpoint {
    rank: usize,
    workers: usize,
    receiver: Receiver<HaloMessage>,
    broker: Arc<HaloBroker>,
    /// Messages that arrived before they were asked for.
    early: Vec<HaloMessage>,
    timeout: Duration,
}

impl HaloEndpoint {
    /// Number of workers in the run.
    pub fn workers(&self) -> usize {
        self.workers
    }

    fn post(
        &self,
        destination: usize,
        iteration: u64,
        payload: HaloPayload,
        phase: Phase,
    ) -> Result<()> {
        let message = HaloMessage {
            source: self.rank,
            iteration,
            payload,
        };
        match self.broker.deliver(destination, message) {
            DeliveryStatus::Delivered => Ok(()),
            status => Err(SandpileError::communication(
                self.rank,
                phase,
                format!("message to worker {} not delivered: {:?}", destination, status),
            )),
        }
    }

    /// Block until a message satisfying `wanted` for `iteration` arrives.
    fn receive<F>(&mut self, iteration: u64, phase: Phase, what: &str, wanted: F) -> Result<HaloMessage>
    where
        F: Fn(&HaloMessage) -> bool,
    {
        if let Some(pos) = self.early.iter().position(|m| wanted(m)) {
            return Ok(self.early.swap_remove(pos));
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(message) if message.iteration == iteration && wanted(&message) => {
                    return Ok(message)
                }
                Ok(message) if message.iteration < iteration => {
                    return Err(SandpileError::communication(
                        self.rank,
                        phase,
                        format!(
                            "stale message from worker {} for iteration {} while on iteration {}",
                            message.source, message.iteration, iteration
                        ),
                    ));
                }
                Ok(message) => self.early.push(message),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SandpileError::communication(
                        self.rank,
                        phase,
                        format!("timed out after {:?} waiting for {}", self.timeout, what),
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SandpileError::communication(
                        self.rank,
                        phase,
                        format!("transport shut down while waiting for {}", what),
                    ));
                }
            }
        }
    }
}

impl HaloExchange for HaloEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn exchange(&mut self, iteration: u64, partition: &mut Partition) -> Result<()> {
        let band = *partition.band();

        // Post both sends before blocking on either receive.
        for direction in HaloDirection::ALL {
            if let Some(neighbor) = band.neighbor(direction) {
                let payload = HaloPayload::Row {
                    side: direction.opposite(),
                    cells: partition.edge_row(direction).to_vec(),
                };
                self.post(neighbor, iteration, payload, Phase::HaloExchange)?;
            }
        }

        for side in HaloDirection::ALL {
            let Some(neighbor) = band.neighbor(side) else {
                continue;
            };
            let what = format!("{} ghost row from worker {}", side, neighbor);
            let message = self.receive(iteration, Phase::HaloExchange, &what, |m| {
                m.source == neighbor
                    && m.iteration == iteration
                    && matches!(&m.payload, HaloPayload::Row { side: s, .. } if *s == side)
            })?;
            if let HaloPayload::Row { cells, .. } = message.payload {
                partition.write_ghost(side, &cells)?;
            }
        }

        Ok(())
    }
}

impl ChangeReduction for HaloEndpoint {
    fn all_reduce_changed(&mut self, iteration: u64, local_changed: bool) -> Result<bool> {
        if self.workers == 1 {
            return Ok(local_changed);
        }

        if self.rank == ROOT {
            let mut flags = Vec::with_capacity(self.workers);
            flags.push(local_changed);
            for source in 1..self.workers {
                let what = format!("changed flag from worker {}", source);
                let message = self.receive(iteration, Phase::Reduction, &what, |m| {
                    m.source == source
                        && m.iteration == iteration
                        && matches!(m.payload, HaloPayload::Changed(_))
                })?;
                if let HaloPayload::Changed(changed) = message.payload {
                    flags.push(changed);
                }
            }

            let global = reduce_changed(flags);
            for destination in 1..self.workers {
                self.post(
                    destination,
                    iteration,
                    HaloPayload::Verdict(global),
                    Phase::Reduction,
                )?;
            }
            Ok(global)
        } else {
            self.post(
                ROOT,
                iteration,
                HaloPayload::Changed(local_changed),
                Phase::Reduction,
            )?;
            let message = self.receive(iteration, Phase::Reduction, "global verdict", |m| {
                m.source == ROOT
                    && m.iteration == iteration
                    && matches!(m.payload, HaloPayload::Verdict(_))
            })?;
            match message.payload {
                HaloPayload::Verdict(global) => Ok(global),
                other => Err(SandpileError::communication(
                    self.rank,
                    Phase::Reduction,
                    format!("expected verdict, got {:?}", other),
                )),
            }
        }
    }
}
