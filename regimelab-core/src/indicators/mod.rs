//! Indicators used by regime computation.
//!
//! Only the simple moving average is needed: a regime flag is a close
//! compared against its own moving average.

pub mod sma;

pub use sma::Sma;

#[cfg(test)]
pub const DEFAULT_EPSILON: f64 = 1e-10;

#[cfg(test)]
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "expected {expected}, got {actual} (eps {epsilon})"
    );
}
