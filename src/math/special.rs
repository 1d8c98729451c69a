/// 兩個時間點視為相同的容差。
pub const TIME_TOLERANCE: f64 = 1e-10;

/// root 頻率總和與 1 的容許誤差。
pub const FREQUENCY_SUM_TOLERANCE: f64 = 1e-10;

pub fn equal_with_precision(lhs: f64, rhs: f64) -> bool {
    (lhs - rhs).abs() <= TIME_TOLERANCE
}

/// ln(n!) = lnΓ(n + 1)，n 為非負整數。
pub fn ln_factorial(n: usize) -> f64 {
    (2..=n).map(|k| (k as f64).ln()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ln_factorial_small_values() {
        assert_eq!(ln_factorial(0), 0.0);
        assert_eq!(ln_factorial(1), 0.0);
        assert!((ln_factorial(3) - 6f64.ln()).abs() < 1e-14);
        assert!((ln_factorial(10) - 3_628_800f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn ln_factorial_large_value_matches_stirling() {
        let n = 1000.0_f64;
        let stirling = n * n.ln() - n + 0.5 * (2.0 * std::f64::consts::PI * n).ln() + 1.0 / (12.0 * n);
        assert!((ln_factorial(1000) - stirling).abs() < 1e-8);
    }

    #[test]
    fn equal_with_precision_uses_time_tolerance() {
        assert!(equal_with_precision(1.0, 1.0 + 1e-12));
        assert!(!equal_with_precision(1.0, 1.0 + 1e-8));
    }
}
