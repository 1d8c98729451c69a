use nalgebra::DVector;

/// 將 likelihood 向量除以最大分量，並把 ln(max) 累加進 log scale factor。
///
/// 最大分量不為正（全為 0）時不縮放。回傳縮放後的向量與新的 scale factor，
/// 原向量可由 `unscale(&scaled, factor - previous_factor)` 還原。
pub fn rescale(mut vector: DVector<f64>, previous_log_scale: f64) -> (DVector<f64>, f64) {
    let max = vector.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let scale = if max > 0.0 { max } else { 1.0 };
    vector /= scale;
    (vector, previous_log_scale + scale.ln())
}

pub fn unscale(vector: &DVector<f64>, log_scale: f64) -> DVector<f64> {
    vector * log_scale.exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn largest_entry_becomes_one() {
        let (scaled, factor) = rescale(DVector::from_vec(vec![2e-200, 4e-200, 1e-200]), 0.0);
        assert!((scaled[1] - 1.0).abs() < 1e-15);
        assert!((scaled[0] - 0.5).abs() < 1e-15);
        assert!((factor - 4e-200f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn zero_vector_is_left_untouched() {
        let (scaled, factor) = rescale(DVector::zeros(3), 1.5);
        assert_eq!(scaled, DVector::zeros(3));
        assert_eq!(factor, 1.5);
    }

    #[test]
    fn previous_factor_is_carried() {
        let (_, factor) = rescale(DVector::from_vec(vec![0.5, 0.25]), -3.0);
        assert!((factor - (-3.0 + 0.5f64.ln())).abs() < 1e-15);
    }
}
