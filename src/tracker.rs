//! Segment tracker: identity-preserving interning of [`SegmentId`]s behind
//! a lock-striped table of weak references, a keyed-and-striped table
//! holding identity handles rather than file descriptors or bytes.

use crate::id::SegmentId;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Number of lock stripes the identity table is split across.
const STRIPE_COUNT: usize = 32;

type Stripe = Mutex<rustc_hash::FxHashMap<(u64, u64), Weak<SegmentId>>>;

/// Interns [`SegmentId`]s so that repeated lookups of the same
/// `(msb, lsb)` pair return the identical `Arc` as long as some caller
/// keeps it alive — a weak-reference table, not a cache of segment bytes.
/// Dropping every `Arc` for an id allows its table slot to be reclaimed on
/// the next [`Tracker::sweep`] without pinning any in-memory segment data.
pub struct Tracker {
    stripes: Vec<Stripe>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(Default::default())).collect(),
        }
    }

    fn stripe_for(&self, msb: u64, lsb: u64) -> &Stripe {
        let idx = (msb ^ lsb.rotate_left(17)) as usize % STRIPE_COUNT;
        &self.stripes[idx]
    }

    /// Returns the canonical `Arc<SegmentId>` for `(msb, lsb)`, reusing a
    /// live entry if one exists and interning a fresh one otherwise.
    pub fn intern(&self, msb: u64, lsb: u64) -> Arc<SegmentId> {
        let stripe = self.stripe_for(msb, lsb);
        let mut guard = stripe.lock();

        if let Some(weak) = guard.get(&(msb, lsb)) {
            if let Some(arc) = weak.upgrade() {
                return arc;
            }
        }

        let arc = Arc::new(SegmentId::from_raw_parts(msb, lsb));
        guard.insert((msb, lsb), Arc::downgrade(&arc));
        arc
    }

    /// Convenience wrapper over [`Tracker::intern`] for an already-formed id.
    pub fn intern_id(&self, id: SegmentId) -> Arc<SegmentId> {
        self.intern(id.msb(), id.lsb())
    }

    /// Drops dead weak-reference slots. Never required for correctness
    /// (a dead slot just gets overwritten on the next intern of the same
    /// id), only for bounding the table's memory use over a long-running
    /// store lifetime.
    pub fn sweep(&self) {
        for stripe in &self.stripes {
            let mut guard = stripe.lock();
            guard.retain(|_, weak| weak.strong_count() > 0);
        }
    }

    /// Number of live (non-dead) entries across all stripes. For tests and
    /// diagnostics only.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.lock().values().filter(|w| w.strong_count() > 0).count())
            .sum()
    }
}
