use std::sync::Arc;

use nalgebra::DVector;
use tracing::debug;

use super::birthdeathmigrationdistribution::{
    EdgePropagator,
    Traversal,
    TreeSetup
};
use crate::configuration::LikelihoodConfiguration;
use crate::flow::extinctionprobabilities::ExtinctionProbabilities;
use crate::flow::extinctionsystem::{
    ExtinctionOdeSystem,
    apply_rho,
    extinction_derivatives,
    stepper
};
use crate::flow::flowsystem::flow_coefficients;
use crate::likelihooderror::LikelihoodResult;
use crate::math::curve::curve::PiecewiseCurve;
use crate::math::ode::dormandprince::DormandPrince54;
use crate::math::ode::odesystem::IntervalOdeSystem;
use crate::math::special::{
    TIME_TOLERANCE,
    equal_with_precision
};
use crate::parameterization::parameterization::Parameterization;
use crate::tree::tree::Tree;

const MAX_STEP_DIVISIONS: f64 = 20.0;

// ─────────────────────────────────────────────────────────────────────────────
// EdgeOdeSystem
// ─────────────────────────────────────────────────────────────────────────────

/// 沿單一 edge 同時積分 (e, g)，維度 2n：
///
/// ```text
/// e' = 與 extinction ODE 相同
/// g' = A(e)·g
/// ```
struct EdgeOdeSystem<'a> {
    parameterization: &'a dyn Parameterization,
}

impl IntervalOdeSystem for EdgeOdeSystem<'_> {
    fn dimension(&self) -> usize {
        2 * self.parameterization.type_count()
    }

    fn derivatives(&self, interval: usize, _t: f64, y: &[f64], y_dot: &mut [f64]) {
        let n = self.parameterization.type_count();
        let (e, g) = y.split_at(n);
        let (e_dot, g_dot) = y_dot.split_at_mut(n);
        extinction_derivatives(self.parameterization, interval, e, e_dot);
        let a = flow_coefficients(self.parameterization, interval, e);
        for (i, value) in g_dot.iter_mut().enumerate() {
            *value = (0..n).map(|j| a[(i, j)] * g[j]).sum();
        }
    }
}

/// 逐 edge 積分的 propagator；e 在 edge 下端取自預先算好的 extinction 曲線。
struct EdgeIntegrator<'a> {
    parameterization: &'a dyn Parameterization,
    extinction: &'a ExtinctionProbabilities,
    stepper: DormandPrince54,
}

impl EdgeIntegrator<'_> {
    fn cross_boundary(&self, interval: usize, y: &mut DVector<f64>) {
        let n = self.parameterization.type_count();
        let (e, g) = y.as_mut_slice().split_at_mut(n);
        apply_rho(self.parameterization, interval, e);
        apply_rho(self.parameterization, interval, g);
    }
}

impl EdgePropagator for EdgeIntegrator<'_> {
    fn propagate(
        &self,
        t_top: f64,
        t_bottom: f64,
        likelihood: &DVector<f64>,
        after_side: bool,
    ) -> LikelihoodResult<DVector<f64>> {
        if t_bottom - t_top <= TIME_TOLERANCE {
            return Ok(likelihood.clone());
        }

        let p = self.parameterization;
        let n = p.type_count();
        let system = EdgeOdeSystem { parameterization: p };
        let mut y = DVector::zeros(2 * n);
        y.rows_mut(0, n).copy_from(&self.extinction.value(t_bottom));
        y.rows_mut(n, n).copy_from(likelihood);

        let mut interval = p.interval_index(t_bottom);
        let mut t = t_bottom;
        loop {
            let start = p.interval_start_time(interval);
            let reached = t_top >= start - TIME_TOLERANCE;
            let target = if reached { t_top.max(start) } else { start };
            if t > target {
                y = self.stepper.integrate(&system, interval, t, target, y)?.state_at(target);
                t = target;
            }
            if reached || interval == 0 {
                break;
            }
            interval -= 1;
            self.cross_boundary(interval, &mut y);
        }

        if !after_side && interval > 0 && equal_with_precision(t_top, p.interval_start_time(interval)) {
            self.cross_boundary(interval - 1, &mut y);
        }
        Ok(y.rows(n, n).into_owned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DirectIntegrationLikelihood
// ─────────────────────────────────────────────────────────────────────────────

/// 不經 flow、沿每條 edge 直接積分 (e, g) 的 likelihood；
/// 節點合併、縮放與 root 處理與 [`BirthDeathMigrationDistribution`] 相同，作為交叉驗證。
///
/// [`BirthDeathMigrationDistribution`]: super::birthdeathmigrationdistribution::BirthDeathMigrationDistribution
pub struct DirectIntegrationLikelihood {
    parameterization: Arc<dyn Parameterization>,
    tree: Arc<Tree>,
    config: LikelihoodConfiguration,
    setup: TreeSetup,
    subtree_sizes: Vec<usize>,
}

impl DirectIntegrationLikelihood {
    pub fn new(
        parameterization: Arc<dyn Parameterization>,
        tree: Arc<Tree>,
        config: LikelihoodConfiguration,
    ) -> LikelihoodResult<DirectIntegrationLikelihood> {
        let setup = TreeSetup::new(parameterization.as_ref(), &tree, &config)?;
        let subtree_sizes = tree.subtree_sizes();
        Ok(DirectIntegrationLikelihood { parameterization, tree, config, setup, subtree_sizes })
    }

    pub fn log_likelihood(&self) -> LikelihoodResult<f64> {
        let p = self.parameterization.as_ref();
        let extinction = ExtinctionOdeSystem::new(p).integrate_from_present(&self.config)?;
        let integrator = EdgeIntegrator {
            parameterization: p,
            extinction: &extinction,
            stepper: stepper(p, &self.config, MAX_STEP_DIVISIONS),
        };
        let traversal = Traversal {
            parameterization: p,
            tree: &self.tree,
            extinction: &extinction,
            propagator: &integrator,
            node_types: &self.setup.node_types,
            subtree_sizes: &self.subtree_sizes,
            final_sample_offset: self.config.final_sample_offset,
            parallel_threshold: self.config.parallel_subtree_threshold,
        };
        let log_likelihood = traversal.log_likelihood(&self.config, &self.setup.frequencies)?;
        debug!(log_likelihood, "tree likelihood evaluated by direct integration");
        Ok(log_likelihood)
    }
}
