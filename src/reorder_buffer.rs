//! Restores ticket order for results produced out of order.
//!
//! # Problem
//!
//! A step with parallelism N processes batches concurrently, so results
//! finish in arbitrary order. Downstream must still observe tickets in the
//! strictly increasing, gap-free order they were issued. The
//! [`ReorderBuffer`] holds finished results until the next expected ticket
//! is available, then releases a contiguous run.
//!
//! # Design
//!
//! Results are stored in a sparse `VecDeque` indexed by ticket offset from
//! the lowest outstanding ticket (`base_ticket`). Insertion and ordered
//! removal are both O(1); memory is proportional to the spread between the
//! slowest and fastest in-flight ticket, which the bounded ingress queue
//! already caps.

use std::collections::VecDeque;

/// Buffer that releases items in strict ticket order regardless of the
/// order they were inserted.
pub struct ReorderBuffer<T> {
    /// Sparse slots, indexed by `ticket - base_ticket`.
    slots: VecDeque<Option<T>>,
    /// Ticket of the item at slot 0, i.e. the next ticket to release.
    base_ticket: u64,
    /// Number of occupied slots.
    len: usize,
    /// Cached "is slot 0 occupied", so callers can poll cheaply.
    can_pop: bool,
}

impl<T> ReorderBuffer<T> {
    /// Create an empty buffer whose next expected ticket is 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_first_ticket(0)
    }

    /// Create an empty buffer whose next expected ticket is `ticket`.
    #[must_use]
    pub fn with_first_ticket(ticket: u64) -> Self {
        Self { slots: VecDeque::new(), base_ticket: ticket, len: 0, can_pop: false }
    }

    /// Insert the result for `ticket`.
    ///
    /// Tickets may arrive in any order but each must be inserted exactly
    /// once, and never for a ticket that was already released.
    pub fn insert(&mut self, ticket: u64, item: T) {
        debug_assert!(
            ticket >= self.base_ticket,
            "ticket {ticket} was already released (next expected is {})",
            self.base_ticket
        );
        let index = (ticket - self.base_ticket) as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        debug_assert!(self.slots[index].is_none(), "duplicate insert for ticket {ticket}");
        self.slots[index] = Some(item);
        self.len += 1;
        if index == 0 {
            self.can_pop = true;
        }
    }

    /// Remove and return the next in-order item, if it has been inserted.
    ///
    /// Returns the ticket alongside the item so callers can forward it
    /// under the same ticket.
    pub fn try_pop_next(&mut self) -> Option<(u64, T)> {
        if !self.can_pop {
            return None;
        }
        // can_pop guarantees slot 0 exists and is occupied.
        let item = self.slots.pop_front().flatten()?;
        let ticket = self.base_ticket;
        self.base_ticket += 1;
        self.len -= 1;
        self.can_pop = matches!(self.slots.front(), Some(Some(_)));
        Some((ticket, item))
    }

    /// Returns an iterator draining the contiguous run of ready items in
    /// ticket order.
    pub fn drain_ready(&mut self) -> DrainReady<'_, T> {
        DrainReady { buffer: self }
    }

    /// Whether the next expected ticket is ready to release.
    #[must_use]
    pub fn can_pop(&self) -> bool {
        self.can_pop
    }

    /// The next ticket this buffer will release.
    #[must_use]
    pub fn next_ticket(&self) -> u64 {
        self.base_ticket
    }

    /// Number of items currently held out of order.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no items are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the ready prefix of a [`ReorderBuffer`], yielding
/// `(ticket, item)` pairs in ticket order.
pub struct DrainReady<'a, T> {
    buffer: &'a mut ReorderBuffer<T>,
}

impl<T> Iterator for DrainReady<'_, T> {
    type Item = (u64, T);

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.try_pop_next()
    }
}
