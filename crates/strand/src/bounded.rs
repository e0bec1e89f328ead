//! Ingress/egress accounting for capacity-bounded queues.

use std::sync::atomic::Ordering;

use crate::utils::StripedAdder;

/// Capacity state shared by the bounded queue variants.
///
/// `len()` reads egress before ingress, so the difference is a conservative
/// upper bound of the current size. The admission check is racy against
/// concurrent producers: the in-flight size may momentarily exceed the
/// capacity by at most one element per producer. Callers that need a strict
/// bound must serialize producers themselves.
pub(crate) struct BoundedState {
    capacity: usize,
    ingress: StripedAdder,
    egress: StripedAdder,
}

impl BoundedState {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");
        BoundedState {
            capacity,
            ingress: StripedAdder::default(),
            egress: StripedAdder::default(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Conservative upper bound of the number of queued elements.
    pub(crate) fn len(&self) -> usize {
        // egress first: over-counting is fine, under-counting is not
        let egress = self.egress.sum(Ordering::Acquire);
        let ingress = self.ingress.sum(Ordering::Acquire);
        ingress.saturating_sub(egress) as usize
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    pub(crate) fn try_admit(&self) -> bool {
        self.len() < self.capacity
    }

    pub(crate) fn note_ingress(&self) {
        self.ingress.increment();
    }

    pub(crate) fn note_egress(&self) {
        self.egress.increment();
    }
}
