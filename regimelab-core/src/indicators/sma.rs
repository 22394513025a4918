//! Simple Moving Average (SMA).
//!
//! Rolling mean of closes over a lookback window.
//! Lookback: period - 1 (first valid value at index period-1).

#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "SMA period must be >= 1");
        Self { period }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn lookback(&self) -> usize {
        self.period.saturating_sub(1)
    }

    /// One value per close. NaN until the window fills, and wherever the
    /// window contains a NaN close.
    pub fn compute(&self, closes: &[f64]) -> Vec<f64> {
        let n = closes.len();
        let mut result = vec![f64::NAN; n];
        if n < self.period {
            return result;
        }

        let mut sum = 0.0;
        let mut nans = 0usize;
        for (i, &close) in closes.iter().enumerate() {
            if close.is_nan() {
                nans += 1;
            } else {
                sum += close;
            }
            if i >= self.period {
                let leaving = closes[i - self.period];
                if leaving.is_nan() {
                    nans -= 1;
                } else {
                    sum -= leaving;
                }
            }
            if i + 1 >= self.period && nans == 0 {
                result[i] = sum / self.period as f64;
            }
        }
        result
    }

    /// Like [`Sma::compute`], with missing values as `None`.
    pub fn values(&self, closes: &[f64]) -> Vec<Option<f64>> {
        self.compute(closes)
            .into_iter()
            .map(|v| (!v.is_nan()).then_some(v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{assert_approx, DEFAULT_EPSILON};

    #[test]
    fn sma_5_basic() {
        let closes = [10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0];
        let result = Sma::new(5).compute(&closes);

        assert_eq!(result.len(), 7);
        for (i, v) in result.iter().enumerate().take(4) {
            assert!(v.is_nan(), "expected NaN at index {i}");
        }
        assert_approx(result[4], 12.0, DEFAULT_EPSILON);
        assert_approx(result[5], 13.0, DEFAULT_EPSILON);
        assert_approx(result[6], 14.0, DEFAULT_EPSILON);
    }

    #[test]
    fn sma_1_is_close() {
        let result = Sma::new(1).compute(&[100.0, 200.0, 300.0]);
        assert_approx(result[0], 100.0, DEFAULT_EPSILON);
        assert_approx(result[2], 300.0, DEFAULT_EPSILON);
    }

    #[test]
    fn sma_nan_propagation() {
        let closes = [10.0, 11.0, f64::NAN, 13.0, 14.0, 15.0];
        let result = Sma::new(3).compute(&closes);
        // Windows touching index 2 are NaN.
        assert!(result[2].is_nan());
        assert!(result[3].is_nan());
        assert!(result[4].is_nan());
        assert_approx(result[5], 14.0, DEFAULT_EPSILON);
    }

    #[test]
    fn sma_too_few_closes() {
        let sma = Sma::new(5);
        assert!(sma.compute(&[10.0, 11.0]).iter().all(|v| v.is_nan()));
        assert_eq!(sma.values(&[10.0, 11.0]), vec![None, None]);
        assert_eq!(sma.lookback(), 4);
    }
}
