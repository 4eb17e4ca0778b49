//! Random number generation provider abstraction.
//!
//! Packet ids, node ids and generated request ids are opaque hex tokens drawn
//! from a [`RandomProvider`], which keeps id generation swappable in tests.

use rand::distr::{Distribution, StandardUniform, uniform::SampleUniform};
use rand::prelude::*;
use std::cell::RefCell;
use std::ops::Range;

/// Provider trait for random number generation.
pub trait RandomProvider: Clone {
    /// Generate a random value of type T.
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>;

    /// Generate a random value within `start..end` (upper bound exclusive).
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd;

    /// Generate an opaque 128-bit token rendered as 32 lowercase hex chars.
    ///
    /// Used for packet ids, node ids and generated request ids. Uniqueness
    /// is probabilistic and never verified.
    fn unique_hex(&self) -> String {
        format!("{:032x}", self.random::<u128>())
    }
}

/// Production random provider using the thread-local RNG.
///
/// # Example
///
/// ```rust
/// use skein_core::{RandomProvider, TokioRandomProvider};
///
/// let random = TokioRandomProvider::new();
/// let token = random.unique_hex();
/// assert_eq!(token.len(), 32);
/// ```
#[derive(Clone, Default)]
pub struct TokioRandomProvider;

impl TokioRandomProvider {
    /// Create a new production random provider.
    pub fn new() -> Self {
        Self
    }
}

thread_local! {
    static RNG: RefCell<rand::rngs::ThreadRng> = RefCell::new(rand::rng());
}

impl RandomProvider for TokioRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        RNG.with(|rng| rng.borrow_mut().random())
    }

    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd,
    {
        RNG.with(|rng| rng.borrow_mut().random_range(range))
    }
}
