use nalgebra::DVector;

use crate::likelihooderror::{
    LikelihoodError,
    LikelihoodResult
};
use crate::math::curve::curve::{
    PiecewiseCurve,
    locate_segment
};
use crate::math::ode::continuousoutput::ContinuousOutput;
use crate::math::special::equal_with_precision;

/// e(t)：lineage 在 t 時之後不留下任何取樣後代的機率，逐 interval 串接。
///
/// 在 rho sampling 邊界 τ 上，`value(τ)` 回傳修正後（τ⁻）的值，
/// `value_after(τ)` 回傳修正前（τ⁺）的值。
#[derive(Clone, Debug)]
pub struct ExtinctionProbabilities {
    end_times: Vec<f64>,
    segments: Vec<ContinuousOutput>,
    upper_states: Vec<DVector<f64>>,
}

impl ExtinctionProbabilities {
    pub fn new(
        end_times: Vec<f64>,
        segments: Vec<ContinuousOutput>,
        upper_states: Vec<DVector<f64>>,
    ) -> LikelihoodResult<ExtinctionProbabilities> {
        if end_times.is_empty() {
            return Err(LikelihoodError::configuration("extinction curve needs at least one interval"));
        }
        if segments.len() != end_times.len() || upper_states.len() != end_times.len() {
            return Err(LikelihoodError::configuration(format!(
                "extinction curve has {} end times but {} segments and {} boundary states",
                end_times.len(),
                segments.len(),
                upper_states.len()
            )));
        }
        if end_times.windows(2).any(|w| w[0] > w[1]) {
            return Err(LikelihoodError::configuration("extinction curve end times must be sorted"));
        }
        Ok(ExtinctionProbabilities { end_times, segments, upper_states })
    }

    pub fn type_count(&self) -> usize {
        self.upper_states[0].len()
    }

    /// 邊界 τ 之後一側的值；不在邊界上時等同 `value(t)`。
    pub fn value_after(&self, t: f64) -> DVector<f64> {
        let location = locate_segment(&self.end_times, t);
        if equal_with_precision(location.time, self.end_times[location.index]) {
            self.upper_states[location.index].clone()
        } else {
            self.segment_value(location.index, location.time)
        }
    }

    /// process 起點的 e(0)。
    pub fn at_origin(&self) -> DVector<f64> {
        self.value(0.0)
    }
}

impl PiecewiseCurve for ExtinctionProbabilities {
    type Output = DVector<f64>;

    fn end_times(&self) -> &[f64] {
        &self.end_times
    }

    fn segment_value(&self, segment: usize, t: f64) -> DVector<f64> {
        self.segments[segment].state_at(t)
    }
}
