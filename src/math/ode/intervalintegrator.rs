use nalgebra::DVector;
use tracing::debug;

use super::continuousoutput::ContinuousOutput;
use super::dormandprince::DormandPrince54;
use super::odesystem::{
    IntegrationDirection,
    IntervalOdeSystem
};
use crate::likelihooderror::{
    LikelihoodError,
    LikelihoodResult
};

// ─────────────────────────────────────────────────────────────────────────────
// IntervalMode
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalMode {
    /// 狀態跨 interval 延續，進入每個 interval 前套用 `boundary_correction`。
    Chained,
    /// 每個 interval 都從同一個初始狀態重新開始（例如 flow 的單位矩陣）。
    Restarted,
}

// ─────────────────────────────────────────────────────────────────────────────
// IntervalSolution
// ─────────────────────────────────────────────────────────────────────────────

/// 每個 interval 一段稠密輸出，index 與 parameterization 的 interval index 一致。
#[derive(Clone, Debug)]
pub struct IntervalSolution {
    pub segments: Vec<ContinuousOutput>,
    /// 進入各 interval 時、`boundary_correction` 之前的狀態。
    pub entry_states: Vec<DVector<f64>>,
}

impl IntervalSolution {
    pub fn total_steps(&self) -> usize {
        self.segments.iter().map(ContinuousOutput::step_count).sum()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IntervalIntegrator
// ─────────────────────────────────────────────────────────────────────────────

/// 以同一個 Dormand–Prince 積分器逐 interval 積分 `IntervalOdeSystem`。
///
/// `end_times[i]` 為第 i 個 interval 的結束時間，第 0 個 interval 從 0 開始。
pub struct IntervalIntegrator<'a> {
    stepper: &'a DormandPrince54,
    end_times: &'a [f64],
}

impl<'a> IntervalIntegrator<'a> {
    pub fn new(stepper: &'a DormandPrince54, end_times: &'a [f64]) -> IntervalIntegrator<'a> {
        IntervalIntegrator { stepper, end_times }
    }

    pub fn interval_start(&self, interval: usize) -> f64 {
        if interval == 0 { 0.0 } else { self.end_times[interval - 1] }
    }

    pub fn integrate(
        &self,
        system: &dyn IntervalOdeSystem,
        initial: &DVector<f64>,
        direction: IntegrationDirection,
        mode: IntervalMode,
    ) -> LikelihoodResult<IntervalSolution> {
        if initial.len() != system.dimension() {
            return Err(LikelihoodError::configuration(format!(
                "initial state has dimension {} but the system has dimension {}",
                initial.len(),
                system.dimension()
            )));
        }

        let count = self.end_times.len();
        let order: Vec<usize> = match direction {
            IntegrationDirection::Forward => (0..count).collect(),
            IntegrationDirection::Backward => (0..count).rev().collect(),
        };

        let mut segments: Vec<Option<ContinuousOutput>> = vec![None; count];
        let mut entry_states: Vec<DVector<f64>> = vec![initial.clone(); count];
        let mut state = initial.clone();

        for interval in order {
            let (from, to) = match direction {
                IntegrationDirection::Forward => (self.interval_start(interval), self.end_times[interval]),
                IntegrationDirection::Backward => (self.end_times[interval], self.interval_start(interval)),
            };

            let mut start_state = match mode {
                IntervalMode::Chained => state.clone(),
                IntervalMode::Restarted => initial.clone(),
            };
            entry_states[interval] = start_state.clone();
            if mode == IntervalMode::Chained {
                system.boundary_correction(interval, start_state.as_mut_slice());
            }

            let output = self.stepper.integrate(system, interval, from, to, start_state)?;
            state = output.state_at(to);
            segments[interval] = Some(output);
        }

        let segments: Vec<ContinuousOutput> = segments.into_iter().flatten().collect();
        let solution = IntervalSolution { segments, entry_states };
        debug!(
            intervals = count,
            steps = solution.total_steps(),
            ?direction,
            ?mode,
            "interval integration finished"
        );
        Ok(solution)
    }
}
