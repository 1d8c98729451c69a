use nalgebra::{
    DMatrix,
    DVector
};
use tracing::debug;

use super::extinctionprobabilities::ExtinctionProbabilities;
use super::extinctionsystem::stepper;
use super::flow::{
    Flow,
    FlowDirection
};
use crate::configuration::LikelihoodConfiguration;
use crate::likelihooderror::LikelihoodResult;
use crate::math::curve::curve::PiecewiseCurve;
use crate::math::ode::intervalintegrator::{
    IntervalIntegrator,
    IntervalMode
};
use crate::math::ode::odesystem::IntervalOdeSystem;
use crate::parameterization::parameterization::Parameterization;

/// 最大步長為 process 長度的 1/10。
const MAX_STEP_DIVISIONS: f64 = 10.0;

/// 線性 flow ODE Y' = A(t)·Y 的係數矩陣：
///
/// ```text
/// A_ii = b_i + d_i + s_i − 2·b_i·e_i + Σ_{j≠i} [ m_ij + b2_ij·(1 − e_j) ]
/// A_ij = −(m_ij + b2_ij·e_i)
/// ```
pub fn flow_coefficients(parameterization: &dyn Parameterization, interval: usize, e: &[f64]) -> DMatrix<f64> {
    let n = e.len();
    let birth = parameterization.birth_rates(interval);
    let death = parameterization.death_rates(interval);
    let sampling = parameterization.sampling_rates(interval);
    let migration = parameterization.migration_rates(interval);
    let cross_birth = parameterization.cross_birth_rates(interval);

    DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            let mut diagonal = birth[i] + death[i] + sampling[i] - 2.0 * birth[i] * e[i];
            for k in (0..n).filter(|k| *k != i) {
                diagonal += migration[(i, k)] + cross_birth[(i, k)] * (1.0 - e[k]);
            }
            diagonal
        } else {
            -(migration[(i, j)] + cross_birth[(i, j)] * e[i])
        }
    })
}

/// out = A·Y，Y 與 out 皆以 column-major 攤平成長度 n² 的 slice。
pub(crate) fn multiply_column_major(a: &DMatrix<f64>, y: &[f64], out: &mut [f64]) {
    let n = a.nrows();
    for column in 0..n {
        for row in 0..n {
            let mut sum = 0.0;
            for k in 0..n {
                sum += a[(row, k)] * y[k + n * column];
            }
            out[row + n * column] = sum;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FlowOdeSystem
// ─────────────────────────────────────────────────────────────────────────────

pub struct FlowOdeSystem<'a> {
    parameterization: &'a dyn Parameterization,
    extinction: &'a ExtinctionProbabilities,
}

impl<'a> FlowOdeSystem<'a> {
    pub fn new(parameterization: &'a dyn Parameterization, extinction: &'a ExtinctionProbabilities) -> FlowOdeSystem<'a> {
        FlowOdeSystem { parameterization, extinction }
    }

    /// 逐 interval 由單位矩陣積分，再依 `direction` 組成單一 flow；
    /// `initial` 為參考時間（backward 為 T、forward 為 0）上的 Y。
    pub fn integrate(
        &self,
        initial: &DMatrix<f64>,
        direction: FlowDirection,
        config: &LikelihoodConfiguration,
    ) -> LikelihoodResult<Flow> {
        let n = self.parameterization.type_count();
        let stepper = stepper(self.parameterization, config, MAX_STEP_DIVISIONS);
        let end_times = self.parameterization.interval_end_times();
        let identity = DMatrix::<f64>::identity(n, n);
        let solution = IntervalIntegrator::new(&stepper, end_times).integrate(
            self,
            &DVector::from_column_slice(identity.as_slice()),
            direction.integration_direction(),
            IntervalMode::Restarted,
        )?;
        debug!(steps = solution.total_steps(), ?direction, "flow integrated");

        let rho: Vec<DVector<f64>> = (0..end_times.len())
            .map(|interval| DVector::from_column_slice(self.parameterization.rho_values(interval)))
            .collect();
        Flow::new(direction, end_times.to_vec(), solution.segments, &rho, initial)
    }
}

impl IntervalOdeSystem for FlowOdeSystem<'_> {
    fn dimension(&self) -> usize {
        let n = self.parameterization.type_count();
        n * n
    }

    fn derivatives(&self, interval: usize, t: f64, y: &[f64], y_dot: &mut [f64]) {
        let e = self.extinction.segment_value(interval, t);
        let a = flow_coefficients(self.parameterization, interval, e.as_slice());
        multiply_column_major(&a, y, y_dot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameterization::canonicalparameterization::CanonicalParameterization;
    use crate::parameterization::skylineparameter::{
        SkylineMatrix,
        SkylineVector
    };

    fn two_type_parameterization() -> CanonicalParameterization {
        CanonicalParameterization::builder(2.5, 2)
            .birth_rate(SkylineVector::constant(vec![2.0, 1.5]))
            .death_rate(SkylineVector::constant(vec![1.0, 0.8]))
            .sampling_rate(SkylineVector::constant(vec![0.5, 0.3]))
            .removal_prob(SkylineVector::constant(vec![1.0, 0.5]))
            .migration_rate(SkylineMatrix::broadcast(vec![1.0], vec![0.1, 0.2], 2).unwrap())
            .cross_birth_rate(SkylineMatrix::broadcast(vec![], vec![0.3], 2).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn coefficients_follow_the_definition() {
        let parameterization = two_type_parameterization();
        let e = [0.3, 0.6];
        let a = flow_coefficients(&parameterization, 1, &e);
        let expected_00 = 2.0 + 1.0 + 0.5 - 2.0 * 2.0 * 0.3 + 0.2 + 0.3 * (1.0 - 0.6);
        let expected_01 = -(0.2 + 0.3 * 0.3);
        let expected_10 = -(0.2 + 0.3 * 0.6);
        assert!((a[(0, 0)] - expected_00).abs() < 1e-14);
        assert!((a[(0, 1)] - expected_01).abs() < 1e-14);
        assert!((a[(1, 0)] - expected_10).abs() < 1e-14);
    }

    #[test]
    fn column_major_product_matches_nalgebra() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let y = DMatrix::from_row_slice(2, 2, &[0.5, -1.0, 2.0, 0.25]);
        let mut out = vec![0.0; 4];
        multiply_column_major(&a, y.as_slice(), &mut out);
        let expected = &a * &y;
        assert_eq!(out.as_slice(), expected.as_slice());
    }
}
