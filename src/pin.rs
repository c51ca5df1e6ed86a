//! Tracking of buffers that are pinned by an outgoing transfer.
//!
//! While a push is outstanding, every buffer in its [`SgArray`] is pinned: the caller must not
//! recycle or reclaim it until the frame has been fully written. Pins are counted per buffer
//! address, so the same buffer can be pushed by several requests at once.

use crate::sga::SgArray;
use bytes::Bytes;
use std::{cell::RefCell, collections::HashMap, rc::Rc};

/// A shared table of pin counts, keyed by buffer address.
#[derive(Debug, Clone, Default)]
pub struct PinTable {
    /// A map of pinned buffer addresses and their pin counts.
    pinned: Rc<RefCell<HashMap<usize, usize>>>,
}

impl PinTable {
    /// Creates an empty pin table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins every segment of `sga`, returning a guard that unpins them when dropped.
    pub fn pin(&self, sga: &SgArray) -> PinGuard {
        let mut guard = self.pinned.borrow_mut();

        let addrs: Vec<usize> = sga.segments.iter().map(buffer_addr).collect();
        for &addr in &addrs {
            *guard.entry(addr).or_insert(0) += 1;
        }

        PinGuard {
            table: self.clone(),
            addrs,
        }
    }

    /// Returns `true` if `buf` is currently pinned by an outstanding transfer.
    pub fn is_pinned(&self, buf: &Bytes) -> bool {
        self.pin_count(buf) > 0
    }

    /// Returns the number of outstanding pins on `buf`.
    pub fn pin_count(&self, buf: &Bytes) -> usize {
        self.pinned
            .borrow()
            .get(&buffer_addr(buf))
            .copied()
            .unwrap_or(0)
    }

    /// Drops one pin on each address.
    fn unpin(&self, addrs: &[usize]) {
        let mut guard = self.pinned.borrow_mut();

        for addr in addrs {
            let Some(count) = guard.get_mut(addr) else {
                unreachable!("Unpinned buffer {addr:#x} that was never pinned");
            };

            debug_assert_ne!(*count, 0);
            *count -= 1;

            if *count == 0 {
                guard.remove(addr);
            }
        }
    }
}

/// The address a buffer is pinned under.
fn buffer_addr(buf: &Bytes) -> usize {
    buf.as_ptr() as usize
}

/// The pins held by one outgoing transfer.
///
/// Dropping the guard releases the pins, which happens on every path out of a transfer: a
/// completed write, a failed one, or a queue torn down with the request still in flight.
#[derive(Debug)]
pub struct PinGuard {
    /// The table the pins were taken in.
    table: PinTable,
    /// The pinned addresses, one entry per segment.
    addrs: Vec<usize>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.table.unpin(&self.addrs);
    }
}
