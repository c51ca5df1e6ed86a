//! The queue table and the backend selector.
//!
//! A [`LibOs`] hands out [`QDesc`]s for queues of any [`Category`] and dispatches every operation
//! on a descriptor to the backend behind it. Standard sockets and files are always available.
//! Kernel-bypass queues additionally need a [`BypassContext`], which stands for the process-wide
//! initialization of the bypass environment and can exist at most once at a time.

use crate::config::{Config, QueueConfig};
use crate::error::{Error, Result};
use crate::pin::PinTable;
use crate::posix::{FileQueue, PosixFile, PosixSocket, SocketQueue};
use crate::queue::{Category, IoQueue, OpResult};
use crate::sga::SgArray;
use crate::storage::{DeviceEndpoint, StorageDevice, StorageQueue};
use crate::token::{QDesc, QToken};
use bytes::Bytes;
use derivative::Derivative;
use slab::Slab;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// The mode a storage target is created with when `open` does not give one.
const DEFAULT_FILE_MODE: libc::mode_t = 0o644;

/// Set while a [`BypassContext`] exists.
static BYPASS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// A kernel-bypass network stack, provided by the embedding application.
///
/// The stack's own packet processing is out of scope here; it only has to produce queues that
/// honor the [`IoQueue`] contract. Most stacks do so by implementing
/// [`Endpoint`](crate::queue::endpoint::Endpoint) and wrapping it in a [`Queue`](crate::Queue)
/// built from the given configuration and pin table.
pub trait NetworkBackend {
    /// Creates a socket queue on the bypass stack.
    ///
    /// # Errors
    ///
    /// Returns the stack's error for the request.
    fn socket(
        &self,
        domain: i32,
        ty: i32,
        protocol: i32,
        config: &QueueConfig,
        pins: &PinTable,
    ) -> Result<Box<dyn IoQueue>>;
}

/// Proof that the kernel-bypass backends have been initialized.
///
/// Only one context may exist in the process at a time. Dropping it tears the backends down: the
/// storage worker is stopped and joined, after which a new context may be initialized.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BypassContext {
    /// The bypass network stack.
    #[derivative(Debug = "ignore")]
    network: Box<dyn NetworkBackend>,

    /// The storage target, started by the first storage `open`.
    storage: Option<StorageDevice>,
}

impl BypassContext {
    /// Initializes the kernel-bypass backends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] if another context is alive.
    pub fn init(network: Box<dyn NetworkBackend>) -> Result<Self> {
        if BYPASS_INITIALIZED.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyInitialized);
        }

        debug!("Initialized kernel-bypass backends");
        Ok(Self {
            network,
            storage: None,
        })
    }

    /// Returns `true` if a context is currently alive in this process.
    pub fn is_initialized() -> bool {
        BYPASS_INITIALIZED.load(Ordering::Acquire)
    }

    /// Returns the storage target, starting it on first use.
    ///
    /// Only one target is supported: once started, later opens reuse it whatever path they name.
    fn storage(
        &mut self,
        path: &Path,
        flags: i32,
        mode: libc::mode_t,
        config: &Config,
    ) -> Result<&StorageDevice> {
        if let Some(device) = &self.storage {
            if device.path() != path {
                warn!(
                    "Storage target is {}, ignoring requested path {}",
                    device.path().display(),
                    path.display()
                );
            }
        } else {
            let device = StorageDevice::start(path, flags, mode, &config.storage)?;
            self.storage = Some(device);
        }

        self.storage.as_ref().ok_or(Error::Uninitialized)
    }
}

impl Drop for BypassContext {
    fn drop(&mut self) {
        // Stop the storage worker before another context can be created.
        self.storage.take();
        BYPASS_INITIALIZED.store(false, Ordering::Release);
        debug!("Tore down kernel-bypass backends");
    }
}

/// A table of queues addressed by [`QDesc`], across every backend category.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct LibOs {
    /// Settings for every queue created by this table.
    config: Config,

    /// The live queues.
    #[derivative(Debug = "ignore")]
    queues: Slab<Box<dyn IoQueue>>,

    /// The pins of every outgoing transfer on every queue.
    pins: PinTable,

    /// Present once the kernel-bypass backends are available.
    bypass: Option<BypassContext>,
}

impl LibOs {
    /// Creates a table that can only create standard-socket queues.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            queues: Slab::new(),
            pins: PinTable::new(),
            bypass: None,
        }
    }

    /// Creates a table that can also create kernel-bypass queues.
    pub fn with_bypass(config: Config, context: BypassContext) -> Self {
        Self {
            config,
            queues: Slab::new(),
            pins: PinTable::new(),
            bypass: Some(context),
        }
    }

    /// Creates a socket queue.
    ///
    /// # Errors
    ///
    /// Returns the OS error from socket creation, [`Error::Uninitialized`] for a bypass socket
    /// without a [`BypassContext`], and [`Error::WrongCategory`] for the storage category.
    pub fn socket(
        &mut self,
        category: Category,
        domain: i32,
        ty: i32,
        protocol: i32,
    ) -> Result<QDesc> {
        let queue: Box<dyn IoQueue> = match category {
            Category::Posix => Box::new(SocketQueue::new(
                PosixSocket::new(domain, ty, protocol)?,
                self.config.queue.clone(),
                self.pins.clone(),
            )),
            Category::BypassNetwork => {
                let context = self.bypass.as_ref().ok_or(Error::Uninitialized)?;
                context
                    .network
                    .socket(domain, ty, protocol, &self.config.queue, &self.pins)?
            }
            Category::BypassStorage => return Err(Error::WrongCategory),
        };

        Ok(self.insert(queue))
    }

    /// Opens a file queue, with `mode` applying if the file is created.
    ///
    /// For the storage category, the first open starts the storage device and its worker thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error from opening, [`Error::Uninitialized`] for a storage queue without a
    /// [`BypassContext`], and [`Error::WrongCategory`] for the bypass network category.
    pub fn open(
        &mut self,
        category: Category,
        path: impl AsRef<Path>,
        flags: i32,
        mode: Option<libc::mode_t>,
    ) -> Result<QDesc> {
        let path = path.as_ref();

        let queue: Box<dyn IoQueue> = match category {
            Category::Posix => Box::new(FileQueue::new(
                PosixFile::open(path, flags, mode)?,
                self.config.queue.clone(),
                self.pins.clone(),
            )),
            Category::BypassStorage => {
                let context = self.bypass.as_mut().ok_or(Error::Uninitialized)?;
                let mode = mode.unwrap_or(DEFAULT_FILE_MODE);
                let device = context.storage(path, flags, mode, &self.config)?;

                Box::new(StorageQueue::new(
                    DeviceEndpoint::new(device.shared()),
                    self.config.queue.clone(),
                    self.pins.clone(),
                ))
            }
            Category::BypassNetwork => return Err(Error::WrongCategory),
        };

        Ok(self.insert(queue))
    }

    /// Creates (or truncates) a file and opens a queue on it.
    ///
    /// # Errors
    ///
    /// Same as [`LibOs::open`].
    pub fn creat(
        &mut self,
        category: Category,
        path: impl AsRef<Path>,
        mode: libc::mode_t,
    ) -> Result<QDesc> {
        match category {
            Category::Posix => {
                let queue = FileQueue::new(
                    PosixFile::creat(path.as_ref(), mode)?,
                    self.config.queue.clone(),
                    self.pins.clone(),
                );
                Ok(self.insert(Box::new(queue)))
            }
            _ => self.open(
                category,
                path,
                libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
                Some(mode),
            ),
        }
    }

    /// Returns the category of the queue under `qd`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadDescriptor`] if no queue is registered under `qd`.
    pub fn category(&self, qd: QDesc) -> Result<Category> {
        Ok(self.queue(qd)?.category())
    }

    /// Binds the queue under `qd` to a local address.
    ///
    /// # Errors
    ///
    /// See [`IoQueue::bind`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn bind(&mut self, qd: QDesc, addr: SocketAddr) -> Result<()> {
        self.queue_mut(qd)?.bind(addr)
    }

    /// Marks the queue under `qd` as accepting connections.
    ///
    /// # Errors
    ///
    /// See [`IoQueue::listen`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn listen(&mut self, qd: QDesc, backlog: i32) -> Result<()> {
        self.queue_mut(qd)?.listen(backlog)
    }

    /// Connects the queue under `qd` to a peer.
    ///
    /// # Errors
    ///
    /// See [`IoQueue::connect`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn connect(&mut self, qd: QDesc, addr: SocketAddr) -> Result<()> {
        self.queue_mut(qd)?.connect(addr)
    }

    /// Returns the local address of the queue under `qd`.
    ///
    /// # Errors
    ///
    /// See [`IoQueue::local_addr`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn local_addr(&self, qd: QDesc) -> Result<SocketAddr> {
        self.queue(qd)?.local_addr()
    }

    /// Accepts a connection on the queue under `qd`, registering a new queue for it.
    ///
    /// # Errors
    ///
    /// See [`IoQueue::accept`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn accept(&mut self, qd: QDesc) -> Result<(QDesc, SocketAddr)> {
        let (queue, addr) = self.queue_mut(qd)?.accept()?;
        Ok((self.insert(queue), addr))
    }

    /// Closes the queue under `qd` and frees its descriptor.
    ///
    /// Requests still registered on the queue are dropped along with it.
    ///
    /// # Errors
    ///
    /// See [`IoQueue::close`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn close(&mut self, qd: QDesc) -> Result<()> {
        if !self.queues.contains(qd.as_usize()) {
            return Err(Error::BadDescriptor(qd));
        }
        let mut queue = self.queues.remove(qd.as_usize());

        debug!("Closing {qd}");
        queue.close()
    }

    /// See [`IoQueue::push`].
    ///
    /// # Errors
    ///
    /// See [`IoQueue::push`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn push(&mut self, qd: QDesc, qt: QToken, sga: SgArray) -> Result<OpResult> {
        self.queue_mut(qd)?.push(qt, sga)
    }

    /// See [`IoQueue::pop`].
    ///
    /// # Errors
    ///
    /// See [`IoQueue::pop`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn pop(&mut self, qd: QDesc, qt: QToken) -> Result<OpResult> {
        self.queue_mut(qd)?.pop(qt)
    }

    /// See [`IoQueue::peek`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn peek(&mut self, qd: QDesc) -> Result<OpResult> {
        self.queue_mut(qd)?.peek()
    }

    /// See [`IoQueue::poll`].
    ///
    /// # Errors
    ///
    /// See [`IoQueue::poll`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn poll(&self, qd: QDesc, qt: QToken) -> Result<OpResult> {
        self.queue(qd)?.poll(qt)
    }

    /// See [`IoQueue::wait`].
    ///
    /// # Errors
    ///
    /// See [`IoQueue::wait`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn wait(&mut self, qd: QDesc, qt: QToken) -> Result<OpResult> {
        self.queue_mut(qd)?.wait(qt)
    }

    /// See [`IoQueue::discard`].
    ///
    /// # Errors
    ///
    /// See [`IoQueue::discard`]; also [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn discard(&mut self, qd: QDesc, qt: QToken) -> Result<()> {
        self.queue_mut(qd)?.discard(qt)
    }

    /// Services up to `max_steps` requests on the queue under `qd`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadDescriptor`] for an unknown descriptor.
    pub fn service(&mut self, qd: QDesc, max_steps: usize) -> Result<usize> {
        Ok(self.queue_mut(qd)?.service(max_steps))
    }

    /// Returns `true` if `buf` is pinned by an outgoing transfer on any queue of this table.
    pub fn is_pinned(&self, buf: &Bytes) -> bool {
        self.pins.is_pinned(buf)
    }

    /// Registers a queue, returning its new descriptor.
    fn insert(&mut self, queue: Box<dyn IoQueue>) -> QDesc {
        let category = queue.category();
        let qd = QDesc::new(self.queues.insert(queue));
        debug!("Registered {category:?} queue as {qd}");
        qd
    }

    /// Looks up the queue behind `qd`.
    fn queue(&self, qd: QDesc) -> Result<&dyn IoQueue> {
        self.queues
            .get(qd.as_usize())
            .map(|queue| queue.as_ref())
            .ok_or(Error::BadDescriptor(qd))
    }

    /// Looks up the queue behind `qd` for servicing.
    fn queue_mut(&mut self, qd: QDesc) -> Result<&mut Box<dyn IoQueue>> {
        self.queues
            .get_mut(qd.as_usize())
            .ok_or(Error::BadDescriptor(qd))
    }
}

impl Drop for LibOs {
    fn drop(&mut self) {
        // Queues go before the bypass context that may be backing them.
        self.queues.clear();
    }
}
