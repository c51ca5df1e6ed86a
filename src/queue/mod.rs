//! The token-based completion queue.
//!
//! A [`Queue`] owns a non-blocking [`Endpoint`], a table of pending requests, and the FIFO that
//! decides which request is serviced next. Callers register operations with
//! [`push`](IoQueue::push) and [`pop`](IoQueue::pop), which return immediately, and later collect
//! the results with [`poll`](IoQueue::poll) or [`wait`](IoQueue::wait).
//!
//! Every queue is driven from a single thread: nothing here blocks on the OS, and the only
//! operation that holds the caller until a result is available is `wait`, which polls under a
//! [`WaitPolicy`](crate::config::WaitPolicy).

pub mod endpoint;
pub(crate) mod pending;
pub(crate) mod work_queue;

use crate::config::{Backoff, QueueConfig};
use crate::error::{Error, Result};
use crate::pin::PinTable;
use crate::sga::SgArray;
use crate::token::QToken;
use endpoint::Endpoint;
use pending::PendingRequest;
use std::net::SocketAddr;
use tracing::{debug, trace};
use work_queue::WorkQueue;

/// The backend family a queue belongs to, chosen when the queue is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Standard OS sockets and files.
    Posix,
    /// A kernel-bypass network stack.
    BypassNetwork,
    /// A kernel-bypass storage stack.
    BypassStorage,
}

/// The outcome of a completion-API call.
///
/// `Pending` is never confused with a successful zero-byte transfer, which is reported as
/// `Pushed { nbytes: 0 }` or `Popped { nbytes: 0, .. }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// The operation has not completed yet.
    Pending,
    /// A frame carrying `nbytes` user bytes was fully written.
    Pushed {
        /// The sum of the pushed segment lengths.
        nbytes: usize,
    },
    /// A frame was received.
    Popped {
        /// The received segments, and the sender's address on datagram queues.
        sga: SgArray,
        /// The number of user bytes received, excluding length prefixes.
        nbytes: usize,
    },
    /// The operation failed; it will not be retried.
    Failed(Error),
}

impl OpResult {
    /// Returns `true` if the operation has not completed yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns the number of transferred user bytes of a successful operation.
    pub fn nbytes(&self) -> Option<usize> {
        match self {
            Self::Pushed { nbytes } | Self::Popped { nbytes, .. } => Some(*nbytes),
            _ => None,
        }
    }

    /// Returns the received array of a successful pop.
    pub fn sga(&self) -> Option<&SgArray> {
        match self {
            Self::Popped { sga, .. } => Some(sga),
            _ => None,
        }
    }

    /// Returns the error of a failed operation.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// The operations every queue backend provides.
///
/// Setup operations return OS-style errors directly. Completion operations return `Err` only for
/// precondition violations (an unknown token, a token with the wrong direction); a request that
/// fails mid-flight is reported as [`OpResult::Failed`].
pub trait IoQueue {
    /// The category this queue was created under.
    fn category(&self) -> Category;

    /// Binds the queue to a local address.
    ///
    /// # Errors
    ///
    /// Returns the OS error, or [`Error::WrongCategory`] if the queue is not a socket.
    fn bind(&mut self, addr: SocketAddr) -> Result<()>;

    /// Marks the queue as accepting connections.
    ///
    /// # Errors
    ///
    /// Returns the OS error, or [`Error::WrongCategory`] if the queue is not a socket.
    fn listen(&mut self, backlog: i32) -> Result<()>;

    /// Connects the queue to a peer.
    ///
    /// # Errors
    ///
    /// Returns the OS error, or [`Error::WrongCategory`] if the queue is not a socket.
    fn connect(&mut self, addr: SocketAddr) -> Result<()>;

    /// Returns the local address the queue is bound to.
    ///
    /// # Errors
    ///
    /// Returns the OS error, or [`Error::WrongCategory`] if the queue is not a socket.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Accepts one connection, returning a new queue for it and the peer's address.
    ///
    /// # Errors
    ///
    /// Returns the OS error, or [`Error::WrongCategory`] if the queue is not a socket.
    fn accept(&mut self) -> Result<(Box<dyn IoQueue>, SocketAddr)>;

    /// Releases the underlying descriptor. Calling this twice is not supported.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported while closing.
    fn close(&mut self) -> Result<()>;

    /// Registers `sga` to be sent under `qt`, making as much progress as possible right away.
    ///
    /// Returns the result if the request completed immediately, [`OpResult::Pending`] otherwise.
    /// Pushing again with a token that is already registered only reports its status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongDirection`] if `qt` is not a push token.
    fn push(&mut self, qt: QToken, sga: SgArray) -> Result<OpResult>;

    /// Registers a receive under `qt`, making as much progress as possible right away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongDirection`] if `qt` is not a pop token.
    fn pop(&mut self, qt: QToken) -> Result<OpResult>;

    /// Makes one stateless attempt to receive a whole frame, without registering a token.
    ///
    /// Returns [`OpResult::Pending`] if nothing could be received. Bytes read by an attempt that
    /// does not complete a frame are lost, so this is only reliable on datagram queues, where a
    /// single receive yields a whole frame.
    ///
    /// # Errors
    ///
    /// This function does not currently fail; errors are reported in the result.
    fn peek(&mut self) -> Result<OpResult>;

    /// Returns the status of the request under `qt` without servicing the queue.
    ///
    /// Once a request is done, every call returns the same result until the token is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownToken`] if no request is registered under `qt`.
    fn poll(&self, qt: QToken) -> Result<OpResult>;

    /// Services the queue until the request under `qt` is done, then returns its result and
    /// forgets the token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownToken`] if no request is registered under `qt`.
    fn wait(&mut self, qt: QToken) -> Result<OpResult>;

    /// Forgets a completed request, freeing its buffers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownToken`] if no request is registered under `qt`, and
    /// [`Error::StillPending`] if it has not completed, since requests cannot be cancelled.
    fn discard(&mut self, qt: QToken) -> Result<()>;

    /// Performs up to `max_steps` head-of-line service steps, returning the number taken.
    fn service(&mut self, max_steps: usize) -> usize;
}

/// A queue over one endpoint, shared by every backend in this crate.
#[derive(Debug)]
pub struct Queue<E> {
    /// The descriptor frames are moved over.
    endpoint: E,

    /// Outstanding requests, in service order.
    work: WorkQueue,

    /// Where outgoing arrays are pinned while in flight.
    pins: PinTable,

    /// Queue-wide settings.
    config: QueueConfig,
}

impl<E: Endpoint> Queue<E> {
    /// Creates a queue over `endpoint`.
    pub fn new(endpoint: E, config: QueueConfig, pins: PinTable) -> Self {
        Self {
            endpoint,
            work: WorkQueue::default(),
            pins,
            config,
        }
    }

    /// Returns a reference to the endpoint.
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Returns a mutable reference to the endpoint.
    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    /// Returns the number of requests that have not completed yet.
    pub fn outstanding(&self) -> usize {
        self.work.outstanding()
    }

    /// Registers a request under `qt` if there is none yet, then reports its status.
    fn enqueue(
        &mut self,
        qt: QToken,
        request: impl FnOnce() -> PendingRequest,
    ) -> Result<OpResult> {
        if !self.work.contains(qt) {
            trace!("Registering token {qt}");
            self.work.register(qt, request());

            // Descriptors are non-blocking, so most requests complete on the first attempt.
            if self.work.is_head(qt) {
                self.work.service(&mut self.endpoint, &self.config, 1);
            }
        }

        self.work.status(qt).ok_or(Error::UnknownToken(qt))
    }
}

impl<E: Endpoint + 'static> IoQueue for Queue<E> {
    fn category(&self) -> Category {
        self.endpoint.category()
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<()> {
        self.endpoint.bind(addr)
    }

    fn listen(&mut self, backlog: i32) -> Result<()> {
        self.endpoint.listen(backlog)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        self.endpoint.connect(addr)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    fn accept(&mut self) -> Result<(Box<dyn IoQueue>, SocketAddr)> {
        let (endpoint, addr) = self.endpoint.accept()?;
        let queue = Queue::new(endpoint, self.config.clone(), self.pins.clone());
        Ok((Box::new(queue), addr))
    }

    fn close(&mut self) -> Result<()> {
        self.endpoint.close()
    }

    fn push(&mut self, qt: QToken, sga: SgArray) -> Result<OpResult> {
        if !qt.is_push() {
            return Err(Error::WrongDirection(qt));
        }

        let pins = self.pins.clone();
        self.enqueue(qt, move || PendingRequest::send(sga, &pins))
    }

    fn pop(&mut self, qt: QToken) -> Result<OpResult> {
        if qt.is_push() {
            return Err(Error::WrongDirection(qt));
        }

        self.enqueue(qt, PendingRequest::receive)
    }

    fn peek(&mut self) -> Result<OpResult> {
        let mut request = PendingRequest::receive();
        request.advance(&mut self.endpoint, &self.config);
        Ok(request.into_status())
    }

    fn poll(&self, qt: QToken) -> Result<OpResult> {
        self.work.status(qt).ok_or(Error::UnknownToken(qt))
    }

    fn wait(&mut self, qt: QToken) -> Result<OpResult> {
        if !self.work.contains(qt) {
            return Err(Error::UnknownToken(qt));
        }

        let mut backoff = Backoff::new(self.config.wait_policy);
        while !self.work.is_done(qt) {
            self.work.service(&mut self.endpoint, &self.config, 1);

            if !self.work.is_done(qt) {
                backoff.snooze();
            }
        }

        debug!("Wait on token {qt} finished");
        self.work
            .take(qt)
            .map(PendingRequest::into_status)
            .ok_or(Error::UnknownToken(qt))
    }

    fn discard(&mut self, qt: QToken) -> Result<()> {
        match self.work.is_done(qt) {
            true => {
                self.work.take(qt);
                Ok(())
            }
            false if self.work.contains(qt) => Err(Error::StillPending(qt)),
            false => Err(Error::UnknownToken(qt)),
        }
    }

    fn service(&mut self, max_steps: usize) -> usize {
        self.work.service(&mut self.endpoint, &self.config, max_steps)
    }
}
