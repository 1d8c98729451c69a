use nalgebra::DVector;

// ─────────────────────────────────────────────────────────────────────────────
// DenseStep
// ─────────────────────────────────────────────────────────────────────────────

/// 單一步的 Dormand–Prince 連續輸出（Hairer `contd5` 的五個係數向量）。
///
/// y(θ) = r1 + θ·(r2 + (1-θ)·(r3 + θ·(r4 + (1-θ)·r5)))，θ = (t - t_old) / h。
#[derive(Clone, Debug)]
pub struct DenseStep {
    t_old: f64,
    h: f64,
    rcont: [DVector<f64>; 5],
}

impl DenseStep {
    pub fn new(t_old: f64, h: f64, rcont: [DVector<f64>; 5]) -> DenseStep {
        DenseStep { t_old, h, rcont }
    }

    pub fn lower(&self) -> f64 {
        self.t_old.min(self.t_old + self.h)
    }

    pub fn upper(&self) -> f64 {
        self.t_old.max(self.t_old + self.h)
    }

    pub fn interpolate(&self, t: f64) -> DVector<f64> {
        let theta = (t - self.t_old) / self.h;
        let theta1 = 1.0 - theta;
        let [r1, r2, r3, r4, r5] = &self.rcont;
        let inner = r4 + r5 * theta1;
        let inner = r3 + inner * theta;
        let inner = r2 + inner * theta1;
        r1 + inner * theta
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ContinuousOutput
// ─────────────────────────────────────────────────────────────────────────────

/// 一段 interval 積分的稠密輸出，steps 依時間遞增排列。
#[derive(Clone, Debug)]
pub struct ContinuousOutput {
    steps: Vec<DenseStep>,
    start_state: DVector<f64>,
    start_time: f64,
}

impl ContinuousOutput {
    /// `steps` 依積分順序傳入；backward 積分時會反轉成時間遞增。
    pub fn new(start_time: f64, start_state: DVector<f64>, mut steps: Vec<DenseStep>) -> ContinuousOutput {
        if steps.len() > 1 && steps[0].lower() > steps[steps.len() - 1].lower() {
            steps.reverse();
        }
        ContinuousOutput { steps, start_state, start_time }
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn lower_time(&self) -> f64 {
        self.steps.first().map_or(self.start_time, DenseStep::lower)
    }

    pub fn upper_time(&self) -> f64 {
        self.steps.last().map_or(self.start_time, DenseStep::upper)
    }

    /// 超出範圍時以最靠近的一步外插（差距在時間容差內）。
    pub fn state_at(&self, t: f64) -> DVector<f64> {
        if self.steps.is_empty() {
            return self.start_state.clone();
        }
        let index = self
            .steps
            .partition_point(|step| step.upper() < t)
            .min(self.steps.len() - 1);
        self.steps[index].interpolate(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_step(t_old: f64, h: f64, y_old: f64, slope: f64) -> DenseStep {
        // y = y_old + slope·(t - t_old) 的精確 dense output
        let y_new = y_old + slope * h;
        let rcont2 = y_new - y_old;
        let rcont3 = h * slope - rcont2;
        let rcont4 = rcont2 - h * slope - rcont3;
        DenseStep::new(
            t_old,
            h,
            [
                DVector::from_element(1, y_old),
                DVector::from_element(1, rcont2),
                DVector::from_element(1, rcont3),
                DVector::from_element(1, rcont4),
                DVector::zeros(1),
            ],
        )
    }

    #[test]
    fn interpolates_linear_solution_exactly() {
        let step = linear_step(0.0, 0.5, 1.0, 2.0);
        assert!((step.interpolate(0.25)[0] - 1.5).abs() < 1e-15);
        assert!((step.interpolate(0.5)[0] - 2.0).abs() < 1e-15);
    }

    #[test]
    fn backward_steps_are_sorted_by_time() {
        let steps = vec![linear_step(2.0, -0.5, 0.0, 1.0), linear_step(1.5, -0.5, -0.5, 1.0)];
        let output = ContinuousOutput::new(2.0, DVector::zeros(1), steps);
        assert_eq!(output.lower_time(), 1.0);
        assert_eq!(output.upper_time(), 2.0);
        assert!((output.state_at(1.25)[0] - (-0.75)).abs() < 1e-14);
        assert!((output.state_at(1.75)[0] - (-0.25)).abs() < 1e-14);
    }

    #[test]
    fn empty_output_returns_start_state() {
        let output = ContinuousOutput::new(3.0, DVector::from_element(2, 0.5), Vec::new());
        assert_eq!(output.state_at(3.0), DVector::from_element(2, 0.5));
    }
}
