//! Append-only log of submitted rebinding batches.
//!
//! Batches form a singly-linked list whose head is the most recent submission.
//! A batch is never changed or removed once linked, so a reader that loaded the
//! head pointer can walk the chain without any lock while a writer prepends.
//! Writers must still be serialized by the caller: the registry makes no attempt
//! to order two concurrent submissions beyond keeping the chain intact.

use crate::{Rebinding, Result, allocation_error};
use alloc::{boxed::Box, vec::Vec};
use core::{
    fmt::Debug,
    iter::FusedIterator,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, Ordering},
};

/// One immutable group of rebindings, as passed to a single submission.
pub struct RebindBatch {
    rebindings: Box<[Rebinding]>,
    next: *const RebindBatch,
}

impl RebindBatch {
    /// The rebindings of this batch in submission order.
    #[inline]
    pub fn rebindings(&self) -> &[Rebinding] {
        &self.rebindings
    }
}

/// Outcome of [`RebindRegistry::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    first: bool,
}

impl Submission {
    /// Whether the registry was empty before this submission.
    #[inline]
    pub fn is_first(&self) -> bool {
        self.first
    }
}

/// Process-lifetime registry of rebinding batches.
///
/// Lookups walk the newest batch first and, within a batch, the rebindings in
/// the order they were submitted. The first rebinding whose name matches wins.
pub struct RebindRegistry {
    head: AtomicPtr<RebindBatch>,
}

unsafe impl Send for RebindRegistry {}
unsafe impl Sync for RebindRegistry {}

impl Default for RebindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RebindRegistry {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
        }
    }

    /// Copies `rebindings` into a new batch and links it as the newest one.
    ///
    /// An empty slice still records a (empty) batch.
    pub fn submit(&self, rebindings: &[Rebinding]) -> Result<Submission> {
        let mut copied = Vec::new();
        copied
            .try_reserve_exact(rebindings.len())
            .map_err(|_| allocation_error("failed to allocate a rebinding batch"))?;
        for rebinding in rebindings {
            copied.push(rebinding.try_clone()?);
        }
        let node = Box::into_raw(try_box(RebindBatch {
            rebindings: copied.into_boxed_slice(),
            next: core::ptr::null(),
        })?);

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // The node is not published yet, so it is still exclusively ours.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        #[cfg(feature = "log")]
        log::debug!(
            "[Registry] submitted batch of {} rebindings, first: {}",
            rebindings.len(),
            head.is_null()
        );
        Ok(Submission {
            first: head.is_null(),
        })
    }

    /// Whether nothing has been submitted yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Iterates over the batches, newest first.
    #[inline]
    pub fn batches(&self) -> Batches<'_> {
        Batches {
            cur: self.head.load(Ordering::Acquire),
            _registry: self,
        }
    }

    /// Iterates over every rebinding in lookup order.
    pub fn iter(&self) -> impl Iterator<Item = &Rebinding> + '_ {
        self.batches().flat_map(|batch| batch.rebindings().iter())
    }

    /// Finds the rebinding that applies to the symbol-table name `symbol`.
    ///
    /// See [`Rebinding::matches`] for the naming rule.
    #[inline]
    pub fn find(&self, symbol: &[u8]) -> Option<&Rebinding> {
        if symbol.len() <= 1 {
            return None;
        }
        self.iter().find(|rebinding| rebinding.matches(symbol))
    }
}

impl Drop for RebindRegistry {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let batch = unsafe { Box::from_raw(cur) };
            cur = batch.next as *mut RebindBatch;
        }
    }
}

impl Debug for RebindRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator returned by [`RebindRegistry::batches`].
pub struct Batches<'a> {
    cur: *const RebindBatch,
    _registry: &'a RebindRegistry,
}

impl<'a> Iterator for Batches<'a> {
    type Item = &'a RebindBatch;

    fn next(&mut self) -> Option<Self::Item> {
        // Linked batches live as long as the registry that owns them.
        let batch = unsafe { self.cur.as_ref()? };
        self.cur = batch.next;
        Some(batch)
    }
}

impl FusedIterator for Batches<'_> {}

/// Boxes `value`, reporting an allocation failure instead of aborting.
pub(crate) fn try_box<T>(value: T) -> Result<Box<T>> {
    let mut slot = Vec::new();
    slot.try_reserve_exact(1)
        .map_err(|_| allocation_error("failed to allocate a rebinding node"))?;
    slot.push(value);
    let raw = Box::into_raw(slot.into_boxed_slice()) as *mut T;
    // A one-element boxed slice has exactly the layout of a box of its element.
    Ok(unsafe { Box::from_raw(raw) })
}
