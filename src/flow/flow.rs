use nalgebra::{
    DMatrix,
    DVector
};
use serde::{
    Deserialize,
    Serialize
};

use crate::likelihooderror::{
    LikelihoodError,
    LikelihoodResult
};
use crate::math::curve::curve::{
    PiecewiseCurve,
    locate_segment
};
use crate::math::ode::continuousoutput::ContinuousOutput;
use crate::math::ode::odesystem::IntegrationDirection;
use crate::math::special::equal_with_precision;

// ─────────────────────────────────────────────────────────────────────────────
// FlowDirection
// ─────────────────────────────────────────────────────────────────────────────

/// flow 的參考時間：`Backward` 以 T 為參考、`Forward` 以 0 為參考。
///
/// 兩者在 `solve_across_flow` 中給出相同的轉移；`Forward` 無法表示
/// 內部邊界上 rho = 1 的完整取樣。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    #[default]
    Backward,
    Forward,
}

impl FlowDirection {
    pub fn integration_direction(&self) -> IntegrationDirection {
        match self {
            FlowDirection::Backward => IntegrationDirection::Backward,
            FlowDirection::Forward => IntegrationDirection::Forward,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow
// ─────────────────────────────────────────────────────────────────────────────

/// 整條時間軸上的 flow Y(t)：g(t) = Y(t)·Y(s)⁻¹·g(s)。
///
/// 每個 interval 的 segment Z_i 由單位矩陣起算；查詢時右乘預先算好的
/// prefix 矩陣 P_i，使所有 Y(t) = Z_i(t)·P_i 都相對於同一個參考時間。
///
/// - Backward：P_last = M，P_i = D_i·Z_{i+1}(τ_i)·P_{i+1}
/// - Forward：P_0 = M，P_{i+1} = D_i⁻¹·Z_i(τ_i)·P_i
///
/// 其中 τ_i 為第 i 個 interval 的結束時間、D_i = diag(1 − ρ_i)、M 為初始矩陣。
/// T 上的 rho 不進入 flow（對所有求解都是共同的右因子）。
///
/// 內部邊界上有 rho = 1 時 D_i 奇異，其左側所有 Y(t) 都不可逆；
/// 此時改以 segment 逐段串接求解，不經過 prefix。
#[derive(Clone, Debug)]
pub struct Flow {
    direction: FlowDirection,
    type_count: usize,
    end_times: Vec<f64>,
    segments: Vec<ContinuousOutput>,
    prefixes: Vec<DMatrix<f64>>,
    rho: Vec<DVector<f64>>,
    complete_rho: bool,
}

impl Flow {
    pub fn new(
        direction: FlowDirection,
        end_times: Vec<f64>,
        segments: Vec<ContinuousOutput>,
        rho: &[DVector<f64>],
        initial: &DMatrix<f64>,
    ) -> LikelihoodResult<Flow> {
        let count = end_times.len();
        if count == 0 || segments.len() != count || rho.len() != count {
            return Err(LikelihoodError::configuration(format!(
                "flow has {} end times, {} segments and {} rho vectors",
                count,
                segments.len(),
                rho.len()
            )));
        }
        if end_times.windows(2).any(|w| w[0] > w[1]) {
            return Err(LikelihoodError::configuration("flow end times must be sorted"));
        }
        if !initial.is_square() {
            return Err(LikelihoodError::configuration("initial flow matrix must be square"));
        }

        let type_count = initial.nrows();
        let segment_matrix = |segment: usize, t: f64| -> DMatrix<f64> {
            DMatrix::from_column_slice(type_count, type_count, segments[segment].state_at(t).as_slice())
        };

        let mut prefixes = vec![initial.clone(); count];
        match direction {
            FlowDirection::Backward => {
                for interval in (0..count - 1).rev() {
                    let mut prefix = segment_matrix(interval + 1, end_times[interval]) * &prefixes[interval + 1];
                    for (mut row, rho) in prefix.row_iter_mut().zip(rho[interval].iter()) {
                        row *= 1.0 - rho;
                    }
                    prefixes[interval] = prefix;
                }
            }
            FlowDirection::Forward => {
                for interval in 0..count - 1 {
                    let mut prefix = segment_matrix(interval, end_times[interval]) * &prefixes[interval];
                    for (mut row, rho) in prefix.row_iter_mut().zip(rho[interval].iter()) {
                        if *rho >= 1.0 {
                            return Err(LikelihoodError::degeneracy(format!(
                                "forward flow cannot cross the complete rho sampling event at t = {}",
                                end_times[interval]
                            )));
                        }
                        row /= 1.0 - rho;
                    }
                    prefixes[interval + 1] = prefix;
                }
            }
        }

        let complete_rho = rho[..count - 1].iter().any(|r| r.iter().any(|v| *v >= 1.0));
        Ok(Flow {
            direction,
            type_count,
            end_times,
            segments,
            prefixes,
            rho: rho.to_vec(),
            complete_rho,
        })
    }

    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    pub fn type_count(&self) -> usize {
        self.type_count
    }

    /// 邊界 τ 之後一側的 Y(τ⁺)；不在內部邊界上時等同 `value(t)`。
    pub fn value_after(&self, t: f64) -> DMatrix<f64> {
        let location = locate_segment(&self.end_times, t);
        let next = location.index + 1;
        if next < self.end_times.len() && equal_with_precision(location.time, self.end_times[location.index]) {
            self.segment_value(next, self.end_times[location.index])
        } else {
            self.segment_value(location.index, location.time)
        }
    }

    /// 是否有內部邊界的 rho 分量為 1。
    pub fn has_complete_rho(&self) -> bool {
        self.complete_rho
    }

    /// 把 `t_bottom` 處的 likelihood 向量沿 flow 移到 `t_top`。
    pub fn solve_across(&self, t_top: f64, t_bottom: f64, likelihood: &DVector<f64>) -> LikelihoodResult<DVector<f64>> {
        self.transport(t_top, false, t_bottom, likelihood)
    }

    /// 同 [`solve_across`](Self::solve_across)；`after_side` 時 `t_top` 取 τ⁺。
    pub fn transport(
        &self,
        t_top: f64,
        after_side: bool,
        t_bottom: f64,
        likelihood: &DVector<f64>,
    ) -> LikelihoodResult<DVector<f64>> {
        if self.complete_rho {
            return self.solve_across_segments(t_top, after_side, t_bottom, likelihood);
        }
        let top = if after_side { self.value_after(t_top) } else { self.value(t_top) };
        solve_across_flow(&top, &self.value(t_bottom), likelihood)
    }

    fn segment_matrix(&self, segment: usize, t: f64) -> DMatrix<f64> {
        DMatrix::from_column_slice(self.type_count, self.type_count, self.segments[segment].state_at(t).as_slice())
    }

    /// g(t_top) = Z_j(t_top)·Z_j(τ_j)⁻¹·D_j·Z_{j+1}(τ_j)·…·Z_i(τ_{i−1})·Z_i(t_bottom)⁻¹·g，
    /// 只對可逆的 segment 矩陣求解。
    fn solve_across_segments(
        &self,
        t_top: f64,
        after_side: bool,
        t_bottom: f64,
        likelihood: &DVector<f64>,
    ) -> LikelihoodResult<DVector<f64>> {
        let top = locate_segment(&self.end_times, t_top);
        let (top_segment, top_time) = if after_side
            && top.index + 1 < self.end_times.len()
            && equal_with_precision(top.time, self.end_times[top.index])
        {
            (top.index + 1, self.end_times[top.index])
        } else {
            (top.index, top.time)
        };

        let bottom = locate_segment(&self.end_times, t_bottom);
        let (mut segment, mut time) = (bottom.index, bottom.time);
        let mut likelihood = likelihood.clone();
        while segment > top_segment {
            let start = self.end_times[segment - 1];
            likelihood = solve_across_flow(
                &self.segment_matrix(segment, start),
                &self.segment_matrix(segment, time),
                &likelihood,
            )?;
            for (value, rho) in likelihood.iter_mut().zip(self.rho[segment - 1].iter()) {
                *value *= 1.0 - rho;
            }
            segment -= 1;
            time = start;
        }
        solve_across_flow(&self.segment_matrix(segment, top_time), &self.segment_matrix(segment, time), &likelihood)
    }
}

impl PiecewiseCurve for Flow {
    type Output = DMatrix<f64>;

    fn end_times(&self) -> &[f64] {
        &self.end_times
    }

    fn segment_value(&self, segment: usize, t: f64) -> DMatrix<f64> {
        self.segment_matrix(segment, t) * &self.prefixes[segment]
    }
}

/// 解 Y_bottom·x = g（column-pivoted QR），回傳 Y_top·x。
pub fn solve_across_flow(
    flow_top: &DMatrix<f64>,
    flow_bottom: &DMatrix<f64>,
    likelihood: &DVector<f64>,
) -> LikelihoodResult<DVector<f64>> {
    let x = flow_bottom
        .clone()
        .col_piv_qr()
        .solve(likelihood)
        .ok_or_else(|| LikelihoodError::degeneracy("flow matrix is singular"))?;
    let result = flow_top * x;
    if result.iter().any(|v| !v.is_finite()) {
        return Err(LikelihoodError::degeneracy("flow solve produced non-finite values"));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_flows_leave_vectors_unchanged() {
        let top = DMatrix::<f64>::identity(3, 3);
        let g = DVector::from_vec(vec![0.1, 0.5, 1.0]);
        let result = solve_across_flow(&top, &top, &g).unwrap();
        assert!((result - g).norm() < 1e-15);
    }

    #[test]
    fn solve_applies_the_relative_transition() {
        let bottom = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 1.0, 1.0]);
        let top = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 3.0]);
        let g = DVector::from_vec(vec![4.0, 3.0]);
        // x = bottom⁻¹·g = (2, 1)，top·x = (3, 3)
        let result = solve_across_flow(&top, &bottom, &g).unwrap();
        assert!((result[0] - 3.0).abs() < 1e-12);
        assert!((result[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn singular_flow_is_a_degeneracy() {
        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]);
        let result = solve_across_flow(&DMatrix::identity(2, 2), &singular, &DVector::from_vec(vec![1.0, 0.0]));
        assert!(matches!(result, Err(LikelihoodError::NumericalDegeneracy(_))));
    }

    #[test]
    fn mismatched_segments_are_rejected() {
        let result = Flow::new(
            FlowDirection::Backward,
            vec![1.0, 2.0],
            Vec::new(),
            &[DVector::zeros(1), DVector::zeros(1)],
            &DMatrix::identity(1, 1),
        );
        assert!(matches!(result, Err(LikelihoodError::Configuration(_))));
    }
}
