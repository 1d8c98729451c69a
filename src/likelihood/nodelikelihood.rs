use nalgebra::DVector;

use crate::flow::extinctionprobabilities::ExtinctionProbabilities;
use crate::math::curve::curve::PiecewiseCurve;
use crate::math::special::equal_with_precision;
use crate::parameterization::parameterization::Parameterization;

// ─────────────────────────────────────────────────────────────────────────────
// SamplingEvent
// ─────────────────────────────────────────────────────────────────────────────

/// 取樣節點所對應的取樣機制。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingEvent {
    /// 連續速率 s 的取樣，發生在 `interval` 內。
    Psi { interval: usize },
    /// 在 `interval` 結束邊界上的 rho sampling。
    Rho { interval: usize },
}

impl SamplingEvent {
    pub fn is_rho(&self) -> bool {
        matches!(self, SamplingEvent::Rho { .. })
    }
}

/// type 為 `type_index` 的樣本在 `t` 時的取樣機制：落在 ρ_k > 0 的邊界上即為 rho。
pub fn sampling_event(parameterization: &dyn Parameterization, t: f64, type_index: usize) -> SamplingEvent {
    let interval = parameterization.interval_index(t);
    let boundary = parameterization.interval_end_times()[interval];
    if equal_with_precision(t, boundary) && parameterization.rho_values(interval)[type_index] > 0.0 {
        SamplingEvent::Rho { interval }
    } else {
        SamplingEvent::Psi { interval }
    }
}

fn single_entry(type_count: usize, type_index: usize, value: f64) -> DVector<f64> {
    let mut likelihood = DVector::zeros(type_count);
    likelihood[type_index] = value;
    likelihood
}

/// 取樣 tip：只有 entry k 非零。
///
/// - psi：`s_k·(r_k + (1 − r_k)·e_k(t))`
/// - rho：`ρ_k·(r_k + (1 − r_k)·e_k(τ⁺))`，e 取邊界修正前的值
pub fn leaf_likelihood(
    parameterization: &dyn Parameterization,
    extinction: &ExtinctionProbabilities,
    event: SamplingEvent,
    type_index: usize,
    t: f64,
) -> DVector<f64> {
    let n = parameterization.type_count();
    let value = match event {
        SamplingEvent::Psi { interval } => {
            let removal = parameterization.removal_probs(interval)[type_index];
            let e = extinction.value(t)[type_index];
            parameterization.sampling_rates(interval)[type_index] * (removal + (1.0 - removal) * e)
        }
        SamplingEvent::Rho { interval } => {
            let removal = parameterization.removal_probs(interval)[type_index];
            let e = extinction.value_after(t)[type_index];
            parameterization.rho_values(interval)[type_index] * (removal + (1.0 - removal) * e)
        }
    };
    single_entry(n, type_index, value)
}

/// sampled ancestor：延續 lineage 的向量已移到節點時間，
/// 樣本的 type 已知，只保留 entry k 並乘上未被移除的取樣機率。
pub fn sampled_ancestor_likelihood(
    parameterization: &dyn Parameterization,
    event: SamplingEvent,
    type_index: usize,
    child: &DVector<f64>,
) -> DVector<f64> {
    let factor = match event {
        SamplingEvent::Psi { interval } => {
            parameterization.sampling_rates(interval)[type_index] * (1.0 - parameterization.removal_probs(interval)[type_index])
        }
        SamplingEvent::Rho { interval } => {
            parameterization.rho_values(interval)[type_index] * (1.0 - parameterization.removal_probs(interval)[type_index])
        }
    };
    single_entry(child.len(), type_index, child[type_index] * factor)
}

/// 分支節點：
///
/// ```text
/// g_i = b_i·c1_i·c2_i + Σ_{j≠i} ½·b2_ij·(c1_i·c2_j + c1_j·c2_i)
/// ```
pub fn bifurcation_likelihood(
    parameterization: &dyn Parameterization,
    interval: usize,
    left: &DVector<f64>,
    right: &DVector<f64>,
) -> DVector<f64> {
    let birth = parameterization.birth_rates(interval);
    let cross_birth = parameterization.cross_birth_rates(interval);
    let n = left.len();
    DVector::from_fn(n, |i, _| {
        let mut value = birth[i] * left[i] * right[i];
        for j in (0..n).filter(|j| *j != i) {
            value += 0.5 * cross_birth[(i, j)] * (left[i] * right[j] + left[j] * right[i]);
        }
        value
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::LikelihoodConfiguration;
    use crate::flow::extinctionsystem::ExtinctionOdeSystem;
    use crate::parameterization::canonicalparameterization::CanonicalParameterization;
    use crate::parameterization::skylineparameter::{
        SkylineMatrix,
        SkylineVector,
        TimedParameter
    };

    fn parameterization() -> CanonicalParameterization {
        CanonicalParameterization::builder(3.0, 2)
            .birth_rate(SkylineVector::constant(vec![2.0, 1.0]))
            .death_rate(SkylineVector::constant(vec![0.5, 0.5]))
            .sampling_rate(SkylineVector::constant(vec![0.4, 0.2]))
            .removal_prob(SkylineVector::constant(vec![0.5, 1.0]))
            .migration_rate(SkylineMatrix::broadcast(vec![], vec![0.1], 2).unwrap())
            .cross_birth_rate(SkylineMatrix::broadcast(vec![], vec![0.6], 2).unwrap())
            .rho_sampling(TimedParameter::new(vec![2.0, 3.0], vec![vec![0.0, 0.3], vec![0.5, 0.5]]).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn rho_events_require_positive_type_probability() {
        let p = parameterization();
        assert_eq!(sampling_event(&p, 2.0, 1), SamplingEvent::Rho { interval: 0 });
        assert_eq!(sampling_event(&p, 2.0, 0), SamplingEvent::Psi { interval: 0 });
        assert_eq!(sampling_event(&p, 2.5, 1), SamplingEvent::Psi { interval: 1 });
        assert!(sampling_event(&p, 3.0, 0).is_rho());
    }

    #[test]
    fn leaves_have_a_single_nonzero_entry() {
        let p = parameterization();
        let extinction = ExtinctionOdeSystem::new(&p)
            .integrate_from_present(&LikelihoodConfiguration::default())
            .unwrap();

        let psi = leaf_likelihood(&p, &extinction, sampling_event(&p, 1.0, 0), 0, 1.0);
        let e = extinction.value(1.0)[0];
        assert!((psi[0] - 0.4 * (0.5 + 0.5 * e)).abs() < 1e-15);
        assert_eq!(psi[1], 0.0);

        // 在 T 上 e(T⁺) = 1
        let rho = leaf_likelihood(&p, &extinction, sampling_event(&p, 3.0, 0), 0, 3.0);
        assert!((rho[0] - 0.5).abs() < 1e-15);
    }

    #[test]
    fn sampled_ancestor_keeps_only_the_observed_type() {
        let p = parameterization();
        let child = DVector::from_vec(vec![0.3, 0.9]);
        let result = sampled_ancestor_likelihood(&p, SamplingEvent::Psi { interval: 0 }, 0, &child);
        assert!((result[0] - 0.3 * 0.4 * 0.5).abs() < 1e-15);
        assert_eq!(result[1], 0.0);

        // removal = 1 的 type 不可能成為 sampled ancestor
        let removed = sampled_ancestor_likelihood(&p, SamplingEvent::Rho { interval: 0 }, 1, &child);
        assert_eq!(removed.sum(), 0.0);
    }

    #[test]
    fn bifurcation_is_symmetric_in_its_children() {
        let p = parameterization();
        let left = DVector::from_vec(vec![0.2, 0.7]);
        let right = DVector::from_vec(vec![0.5, 0.1]);
        let a = bifurcation_likelihood(&p, 0, &left, &right);
        let b = bifurcation_likelihood(&p, 0, &right, &left);
        assert!((a - &b).norm() < 1e-15);
        let expected_0 = 2.0 * 0.2 * 0.5 + 0.5 * 0.6 * (0.2 * 0.1 + 0.7 * 0.5);
        assert!((b[0] - expected_0).abs() < 1e-15);
    }
}
