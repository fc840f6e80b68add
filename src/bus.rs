// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process message bus between agents.
//!
//! Envelopes are queued per (sender, recipient) pair and delivered FIFO
//! within a pair. Pairs are served round-robin so one chatty sender cannot
//! starve the others. The bus never delivers on its own: the engine pulls
//! envelopes with [`MessageBus::next_delivery`] at its scheduling points, so
//! a recipient is never re-entered from inside the sender's frame.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
#[cfg(feature = "telemetry")]
use tracing::debug;

use crate::agent::AgentId;
use crate::message::Envelope;

/// Errors returned by [`MessageBus::send`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("unknown recipient: {0}")]
    UnknownRecipient(AgentId),
}

type Pair = (AgentId, AgentId);

/// Per-pair FIFO queues with round-robin service.
#[derive(Debug, Default)]
pub struct MessageBus {
    endpoints: HashSet<AgentId>,
    queues: HashMap<Pair, VecDeque<Envelope>>,
    /// Pairs with at least one queued envelope, in service order.
    ready: VecDeque<Pair>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `id` addressable.
    pub fn register(&mut self, id: AgentId) {
        self.endpoints.insert(id);
    }

    pub fn is_registered(&self, id: AgentId) -> bool {
        self.endpoints.contains(&id)
    }

    /// Remove `id` as an endpoint.
    ///
    /// Envelopes still queued for `id` are returned to the caller, which must
    /// turn them into failures; nothing is dropped silently.
    pub fn unregister(&mut self, id: AgentId) -> Vec<Envelope> {
        self.endpoints.remove(&id);

        let pairs: Vec<Pair> = self
            .queues
            .keys()
            .filter(|(_, recipient)| *recipient == id)
            .copied()
            .collect();

        let mut undeliverable = Vec::new();
        for pair in pairs {
            if let Some(queue) = self.queues.remove(&pair) {
                undeliverable.extend(queue);
            }
        }
        self.ready.retain(|(_, recipient)| *recipient != id);
        undeliverable
    }

    /// Queue an envelope for later delivery.
    pub fn send(&mut self, envelope: Envelope) -> Result<(), BusError> {
        let recipient = envelope.recipient();
        if !self.endpoints.contains(&recipient) {
            return Err(BusError::UnknownRecipient(recipient));
        }

        let pair = (envelope.sender(), recipient);

        #[cfg(feature = "telemetry")]
        debug!(
            kind = envelope.kind(),
            sender = %pair.0,
            recipient = %pair.1,
            task_id = %envelope.task_id(),
            "Queued envelope"
        );

        let queue = self.queues.entry(pair).or_default();
        if queue.is_empty() {
            self.ready.push_back(pair);
        }
        queue.push_back(envelope);
        Ok(())
    }

    /// Take the next envelope to deliver, if any.
    pub fn next_delivery(&mut self) -> Option<Envelope> {
        let pair = self.ready.pop_front()?;
        let queue = self.queues.get_mut(&pair)?;
        let envelope = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&pair);
        } else {
            self.ready.push_back(pair);
        }
        envelope
    }

    /// Number of queued envelopes.
    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.ready.is_empty()
    }
}
