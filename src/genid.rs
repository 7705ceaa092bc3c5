use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::traits::{IdGenerator, StripeLocator};

/// A record identifier. Ordering within a stripe follows insertion order.
///
/// Zero is never handed out by a generator, which is what lets a progress
/// cursor use zero to mean "nothing migrated yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Genid(u64);

impl Genid {
    pub const ZERO: Genid = Genid(0);

    pub const fn new(raw: u64) -> Self {
        Genid(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Genid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Bit layout of a genid: `[ sequence | stripe ]` with the stripe in the low bits
#[derive(Debug, Clone, Copy)]
pub struct GenidLayout {
    stripe_bits: u32,
    stripes: usize,
}

impl GenidLayout {
    const STRIPE_BITS: u32 = 4;

    pub fn new(stripes: usize) -> Self {
        GenidLayout {
            stripe_bits: Self::STRIPE_BITS,
            stripes,
        }
    }

    pub fn stripes(&self) -> usize {
        self.stripes
    }

    fn stripe_mask(&self) -> u64 {
        (1u64 << self.stripe_bits) - 1
    }

    pub fn compose(&self, sequence: u64, stripe: usize) -> Genid {
        Genid((sequence << self.stripe_bits) | (stripe as u64 & self.stripe_mask()))
    }

    pub fn sequence(&self, genid: Genid) -> u64 {
        genid.0 >> self.stripe_bits
    }
}

impl StripeLocator for GenidLayout {
    fn stripe_of(&self, genid: Genid) -> usize {
        (genid.0 & self.stripe_mask()) as usize
    }
}

/// Monotonic genid source seeded from wall-clock microseconds
pub struct GenidGenerator {
    layout: GenidLayout,
    last_sequence: AtomicU64,
    next_stripe: AtomicU64,
}

impl GenidGenerator {
    pub fn new(layout: GenidLayout) -> Self {
        GenidGenerator {
            layout,
            last_sequence: AtomicU64::new(0),
            next_stripe: AtomicU64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(1) as u64;
        let prev = self
            .last_sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }

    /// Next genid in the given stripe
    pub fn next_in_stripe(&self, stripe: usize) -> Genid {
        self.layout.compose(self.next_sequence(), stripe)
    }
}

impl IdGenerator for GenidGenerator {
    fn next_genid(&self) -> Genid {
        let stripes = self.layout.stripes().max(1) as u64;
        let stripe = self.next_stripe.fetch_add(1, Ordering::Relaxed) % stripes;
        self.next_in_stripe(stripe as usize)
    }
}
