//! The FIFO of outstanding tokens on one queue, and the table of their pending requests.

use super::endpoint::Endpoint;
use super::pending::PendingRequest;
use super::OpResult;
use crate::config::QueueConfig;
use crate::token::QToken;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// Outstanding requests of one queue, serviced strictly in the order they were registered.
///
/// A stalled request at the head delays every request behind it.
#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    /// Every registered request, done or not, keyed by its token.
    pending: HashMap<QToken, PendingRequest>,

    /// Tokens whose requests have not reached their terminal state, oldest first.
    ///
    /// A token appears at most once.
    order: VecDeque<QToken>,
}

impl WorkQueue {
    /// Returns `true` if a request is registered under `qt`.
    pub(crate) fn contains(&self, qt: QToken) -> bool {
        self.pending.contains_key(&qt)
    }

    /// Registers a new request at the back of the queue.
    pub(crate) fn register(&mut self, qt: QToken, request: PendingRequest) {
        let previous = self.pending.insert(qt, request);
        assert!(
            previous.is_none(),
            "Tried to register token {qt} that already has a pending request"
        );

        if !self.pending[&qt].is_done() {
            self.order.push_back(qt);
        }
    }

    /// Returns `true` if `qt` is the next token to be serviced.
    pub(crate) fn is_head(&self, qt: QToken) -> bool {
        self.order.front() == Some(&qt)
    }

    /// Returns the number of requests that have not completed yet.
    pub(crate) fn outstanding(&self) -> usize {
        self.order.len()
    }

    /// Returns the current result of the request registered under `qt`.
    pub(crate) fn status(&self, qt: QToken) -> Option<OpResult> {
        self.pending.get(&qt).map(PendingRequest::status)
    }

    /// Returns `true` if the request under `qt` exists and is done.
    pub(crate) fn is_done(&self, qt: QToken) -> bool {
        self.pending.get(&qt).is_some_and(PendingRequest::is_done)
    }

    /// Removes the request registered under `qt`, freeing its buffers.
    ///
    /// If the request had not completed, its token stays in the FIFO and is discarded as stale
    /// when it reaches the head.
    pub(crate) fn take(&mut self, qt: QToken) -> Option<PendingRequest> {
        self.pending.remove(&qt)
    }

    /// Services up to `max_steps` head-of-line inspections, returning the number taken.
    ///
    /// Each inspection counts as a step, whether it advances a request or drops a stale token. A
    /// request that is not done after its step stays at the head, so several steps of one call can
    /// all retry the same request.
    pub(crate) fn service<E>(&mut self, io: &mut E, config: &QueueConfig, max_steps: usize) -> usize
    where
        E: Endpoint + ?Sized,
    {
        let mut steps = 0;

        while steps < max_steps {
            let Some(&qt) = self.order.front() else {
                break;
            };
            steps += 1;

            let Some(request) = self.pending.get_mut(&qt) else {
                trace!("Dropping stale token {qt}");
                self.order.pop_front();
                continue;
            };

            request.advance(io, config);

            if request.is_done() {
                debug!("Token {qt} completed");
                self.order.pop_front();
            }
        }

        steps
    }
}
