//! Tunables for queues and the storage backend.

use std::time::Duration;

/// The largest UDP payload that fits in one IPv4 datagram.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_507;

/// The default upper bound on the payload of a single incoming frame.
pub const DEFAULT_MAX_PAYLOAD_LEN: u64 = 64 << 20;

/// The default number of entries in the storage worker's `io_uring` instance.
pub const DEFAULT_RING_ENTRIES: u32 = 256;

/// Configuration for a [`LibOs`](crate::LibOs) and every queue it creates.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Settings shared by every queue.
    pub queue: QueueConfig,
    /// Settings for the storage device.
    pub storage: StorageConfig,
}

/// Settings shared by every queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// The size of the staging buffer a datagram is received into.
    ///
    /// A datagram frame larger than this is truncated by the kernel and then rejected as
    /// malformed.
    pub max_datagram_size: usize,

    /// The largest payload an incoming frame header may announce.
    ///
    /// Checked before the staging buffer for the payload is allocated.
    pub max_payload_len: u64,

    /// How [`wait`](crate::queue::IoQueue::wait) paces itself between service steps.
    pub wait_policy: WaitPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            wait_policy: WaitPolicy::default(),
        }
    }
}

/// Settings for the `io_uring` storage device.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// The core to pin the storage worker thread to, if any.
    pub worker_core: Option<usize>,

    /// The number of submission queue entries of the worker's `io_uring` instance.
    pub ring_entries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            worker_core: None,
            ring_entries: DEFAULT_RING_ENTRIES,
        }
    }
}

/// The scheduling policy used by a blocking `wait` between two `service(1)` calls.
///
/// There is no OS-level blocking wait in the non-blocking model, so `wait` always polls; the policy
/// only decides how hard it leans on the CPU while doing so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Retry immediately.
    Spin,
    /// Yield the thread to the OS scheduler before every retry.
    Yield,
    /// Spin for an exponentially growing number of iterations, then yield, and finally sleep for
    /// a few microseconds per retry once the request has stalled for a while.
    #[default]
    Backoff,
}

/// The state of one [`WaitPolicy`] loop.
#[derive(Debug)]
pub(crate) struct Backoff {
    /// The policy being followed.
    policy: WaitPolicy,
    /// How many times this waiter has snoozed.
    step: u32,
}

impl Backoff {
    /// The last step that spins instead of yielding.
    const SPIN_LIMIT: u32 = 6;
    /// The last step that yields instead of sleeping.
    const YIELD_LIMIT: u32 = 10;
    /// How long a fully backed-off waiter sleeps between retries.
    const SLEEP: Duration = Duration::from_micros(50);

    /// Starts a fresh wait loop.
    pub(crate) fn new(policy: WaitPolicy) -> Self {
        Self { policy, step: 0 }
    }

    /// Pauses before the next retry, according to the policy.
    pub(crate) fn snooze(&mut self) {
        match self.policy {
            WaitPolicy::Spin => std::hint::spin_loop(),
            WaitPolicy::Yield => std::thread::yield_now(),
            WaitPolicy::Backoff => {
                if self.step <= Self::SPIN_LIMIT {
                    for _ in 0..1u32 << self.step {
                        std::hint::spin_loop();
                    }
                } else if self.step <= Self::YIELD_LIMIT {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(Self::SLEEP);
                }

                self.step = self.step.saturating_add(1);
            }
        }
    }
}
