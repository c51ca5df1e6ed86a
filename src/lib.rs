//! A token-based asynchronous I/O queue layer for library operating systems.
//!
//! Applications open queues over OS sockets, OS files, or kernel-bypass stacks through a
//! [`LibOs`], and move whole framed [`SgArray`]s across them with non-blocking `push` and `pop`
//! calls. Each call is identified by a [`QToken`] whose result is collected later with `poll` or
//! `wait`.

#![cfg(target_os = "linux")]
#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_safety_doc)]

pub mod codec;
pub mod config;
pub mod error;
pub mod libos;
pub mod pin;
pub mod posix;
pub mod queue;
pub mod sga;
pub mod storage;
pub mod token;

pub use config::{Config, QueueConfig, StorageConfig, WaitPolicy};
pub use error::{Error, Result};
pub use libos::{BypassContext, LibOs, NetworkBackend};
pub use pin::PinTable;
pub use queue::{Category, IoQueue, OpResult, Queue};
pub use sga::SgArray;
pub use token::{QDesc, QToken};
