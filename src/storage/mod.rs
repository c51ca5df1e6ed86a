//! The `io_uring` storage backend.
//!
//! All storage queues share one implicit target, the [`StorageDevice`], which is opened and given
//! its dedicated worker thread the first time a storage queue is opened. Each queue reads the
//! frames stored on the device from the beginning, and appends the frames pushed on it at the end.

mod device;
mod endpoint;

pub use device::StorageDevice;
pub use endpoint::DeviceEndpoint;

use crate::queue::Queue;

/// A queue over the storage device.
pub type StorageQueue = Queue<DeviceEndpoint>;
