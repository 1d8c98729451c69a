use nalgebra::DVector;
use tracing::debug;

use super::extinctionprobabilities::ExtinctionProbabilities;
use crate::configuration::LikelihoodConfiguration;
use crate::likelihooderror::LikelihoodResult;
use crate::math::ode::dormandprince::DormandPrince54;
use crate::math::ode::intervalintegrator::{
    IntervalIntegrator,
    IntervalMode
};
use crate::math::ode::odesystem::{
    IntegrationDirection,
    IntervalOdeSystem
};
use crate::parameterization::parameterization::Parameterization;

/// 最大步長為 process 長度的 1/20。
const MAX_STEP_DIVISIONS: f64 = 20.0;

/// 單一 interval 內的 extinction probability 導數：
///
/// ```text
/// e'_i = (b_i + d_i + s_i)·e_i − b_i·e_i² − d_i
///        + Σ_{j≠i} [ b2_ij·(e_i − e_i·e_j) + m_ij·(e_i − e_j) ]
/// ```
pub fn extinction_derivatives(parameterization: &dyn Parameterization, interval: usize, e: &[f64], e_dot: &mut [f64]) {
    let birth = parameterization.birth_rates(interval);
    let death = parameterization.death_rates(interval);
    let sampling = parameterization.sampling_rates(interval);
    let migration = parameterization.migration_rates(interval);
    let cross_birth = parameterization.cross_birth_rates(interval);

    for i in 0..e.len() {
        let mut value = (birth[i] + death[i] + sampling[i]) * e[i] - birth[i] * e[i] * e[i] - death[i];
        for j in 0..e.len() {
            if j == i {
                continue;
            }
            value += cross_birth[(i, j)] * (e[i] - e[i] * e[j]);
            value += migration[(i, j)] * (e[i] - e[j]);
        }
        e_dot[i] = value;
    }
}

pub(crate) fn apply_rho(parameterization: &dyn Parameterization, interval: usize, values: &mut [f64]) {
    for (value, rho) in values.iter_mut().zip(parameterization.rho_values(interval)) {
        *value *= 1.0 - rho;
    }
}

pub(crate) fn stepper(
    parameterization: &dyn Parameterization,
    config: &LikelihoodConfiguration,
    divisions: f64,
) -> DormandPrince54 {
    let length = parameterization.total_process_length();
    DormandPrince54::new(
        length * 1e-100,
        length / divisions,
        config.absolute_tolerance,
        config.relative_tolerance,
        config.max_steps,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// ExtinctionOdeSystem
// ─────────────────────────────────────────────────────────────────────────────

pub struct ExtinctionOdeSystem<'a> {
    parameterization: &'a dyn Parameterization,
}

impl<'a> ExtinctionOdeSystem<'a> {
    pub fn new(parameterization: &'a dyn Parameterization) -> ExtinctionOdeSystem<'a> {
        ExtinctionOdeSystem { parameterization }
    }

    /// 由 T 往 0 逐 interval 積分，`initial` 為 T 處（rho 修正前）的狀態，
    /// 慣例上是全為 1 的向量。
    pub fn integrate(
        &self,
        initial: &DVector<f64>,
        config: &LikelihoodConfiguration,
    ) -> LikelihoodResult<ExtinctionProbabilities> {
        let stepper = stepper(self.parameterization, config, MAX_STEP_DIVISIONS);
        let end_times = self.parameterization.interval_end_times();
        let solution = IntervalIntegrator::new(&stepper, end_times).integrate(
            self,
            initial,
            IntegrationDirection::Backward,
            IntervalMode::Chained,
        )?;
        debug!(steps = solution.total_steps(), "extinction probabilities integrated");
        ExtinctionProbabilities::new(end_times.to_vec(), solution.segments, solution.entry_states)
    }

    pub fn integrate_from_present(&self, config: &LikelihoodConfiguration) -> LikelihoodResult<ExtinctionProbabilities> {
        let ones = DVector::from_element(self.parameterization.type_count(), 1.0);
        self.integrate(&ones, config)
    }
}

impl IntervalOdeSystem for ExtinctionOdeSystem<'_> {
    fn dimension(&self) -> usize {
        self.parameterization.type_count()
    }

    fn derivatives(&self, interval: usize, _t: f64, y: &[f64], y_dot: &mut [f64]) {
        extinction_derivatives(self.parameterization, interval, y, y_dot);
    }

    fn boundary_correction(&self, interval: usize, y: &mut [f64]) {
        apply_rho(self.parameterization, interval, y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::curve::curve::PiecewiseCurve;
    use crate::parameterization::canonicalparameterization::CanonicalParameterization;
    use crate::parameterization::skylineparameter::{
        SkylineMatrix,
        SkylineVector,
        TimedParameter
    };

    /// 單型常數速率、只有 present 的 rho sampling 時的封閉解（age x = T − t）。
    fn closed_form_p0(lambda: f64, mu: f64, rho: f64, age: f64) -> f64 {
        let c = lambda - mu;
        1.0 - rho * c / (rho * lambda + (lambda * (1.0 - rho) - mu) * (-c * age).exp())
    }

    #[test]
    fn matches_closed_form_for_single_type_rho_sampling() {
        let parameterization = CanonicalParameterization::builder(5.5, 1)
            .birth_rate(SkylineVector::constant(vec![2.0]))
            .death_rate(SkylineVector::constant(vec![1.0]))
            .rho_sampling(TimedParameter::new(vec![5.5], vec![vec![0.5]]).unwrap())
            .build()
            .unwrap();
        let config = LikelihoodConfiguration::default().with_tolerances(1e-100, 1e-10);
        let extinction = ExtinctionOdeSystem::new(&parameterization)
            .integrate_from_present(&config)
            .unwrap();

        for t in [0.0, 1.0, 2.5, 4.0, 5.5] {
            let expected = closed_form_p0(2.0, 1.0, 0.5, 5.5 - t);
            let actual = extinction.value(t)[0];
            assert!((actual - expected).abs() < 1e-8, "t = {t}: {actual} vs {expected}");
        }
        assert_eq!(extinction.value_after(5.5)[0], 1.0);
    }

    #[test]
    fn stays_within_unit_interval_for_multitype_model() {
        let parameterization = CanonicalParameterization::builder(4.0, 3)
            .birth_rate(SkylineVector::broadcast(vec![2.0], vec![1.5, 3.0], 3).unwrap())
            .death_rate(SkylineVector::constant(vec![1.0, 0.5, 2.0]))
            .sampling_rate(SkylineVector::constant(vec![0.3, 0.0, 0.6]))
            .migration_rate(SkylineMatrix::broadcast(vec![], vec![0.4], 3).unwrap())
            .cross_birth_rate(SkylineMatrix::broadcast(vec![1.0], vec![0.2, 0.1], 3).unwrap())
            .rho_sampling(TimedParameter::new(vec![3.0, 4.0], vec![vec![0.2, 0.0, 1.0], vec![0.1; 3]]).unwrap())
            .build()
            .unwrap();
        let extinction = ExtinctionOdeSystem::new(&parameterization)
            .integrate_from_present(&LikelihoodConfiguration::default())
            .unwrap();

        for i in 0..=80 {
            let t = 0.05 * i as f64;
            let e = extinction.value(t);
            assert!(e.iter().all(|x| *x >= -1e-12 && *x <= 1.0 + 1e-12), "e({t}) = {e}");
        }
        // 完全 rho sampling 的 type 在該邊界前 e = 0
        assert!(extinction.value(3.0)[2].abs() < 1e-12);
    }

    #[test]
    fn pure_death_without_sampling_is_certain_extinction() {
        let parameterization = CanonicalParameterization::builder(2.0, 1)
            .birth_rate(SkylineVector::constant(vec![0.0]))
            .death_rate(SkylineVector::constant(vec![1.0]))
            .build()
            .unwrap();
        let extinction = ExtinctionOdeSystem::new(&parameterization)
            .integrate_from_present(&LikelihoodConfiguration::default())
            .unwrap();
        assert!((extinction.value(0.0)[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn no_sampling_keeps_extinction_at_one() {
        // 無取樣時 e ≡ 1 為固定點
        let parameterization = CanonicalParameterization::builder(1.0, 2)
            .birth_rate(SkylineVector::constant(vec![2.0, 1.0]))
            .death_rate(SkylineVector::constant(vec![1.0, 1.0]))
            .migration_rate(SkylineMatrix::broadcast(vec![], vec![0.5], 2).unwrap())
            .build()
            .unwrap();
        let mut e_dot = [0.0; 2];
        extinction_derivatives(&parameterization, 0, &[1.0, 1.0], &mut e_dot);
        assert_eq!(e_dot, [0.0, 0.0]);
    }
}
