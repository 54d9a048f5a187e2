//! Shared error type for fallible operations across the crate.
//!
//! Every structure that can fail (pool exhaustion, a full ring, a CAS that
//! lost to contention) returns `Result<T, Error>` rather than panicking, so
//! that a writer retrying a CAS can distinguish a transient loss from a true
//! full/empty condition.

use core::fmt;

/// Error kinds surfaced by the core primitives.
///
/// No operation leaves partial state on failure: every fallible call here
/// is all-or-nothing from the caller's perspective.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A free-list, ring, or table is full (pool empty, ring full on a
    /// non-blocking enqueue, timer table full).
    Exhausted,
    /// A non-blocking dequeue found nothing to return.
    Empty,
    /// A multi-producer/multi-consumer try-variant lost a CAS race; retry.
    /// Distinct from `Exhausted`/`Empty` so callers can tell a transient
    /// loss from a true full/empty condition.
    Contention,
    /// A non-power-of-two capacity, a zero element size, misaligned backing
    /// memory, an invalid timer id, or setting an already-active timer (or
    /// resetting an inactive one).
    InvalidArgument,
    /// A programmer error: releasing a lock or reference that was never
    /// acquired, destroying an active timer. Recoverable in debug builds for
    /// testing; callers should treat this as fatal.
    BrokenInvariant,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Exhausted => "exhausted: no free elements remain",
            Error::Empty => "empty: nothing to dequeue",
            Error::Contention => "contention: lost a compare-and-swap race",
            Error::InvalidArgument => "invalid argument",
            Error::BrokenInvariant => "broken invariant",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_non_empty_for_every_variant() {
        let variants = [
            Error::Exhausted,
            Error::Empty,
            Error::Contention,
            Error::InvalidArgument,
            Error::BrokenInvariant,
        ];
        for v in variants {
            assert!(!alloc::format!("{v}").is_empty());
        }
    }
}
