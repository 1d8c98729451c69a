use nalgebra::DVector;

use super::continuousoutput::{
    ContinuousOutput,
    DenseStep
};
use super::odesystem::IntervalOdeSystem;
use crate::likelihooderror::{
    LikelihoodError,
    LikelihoodResult
};

// ─────────────────────────────────────────────────────────────────────────────
// Butcher tableau（Dormand & Prince 1980，Hairer dopri5 的 dense output 係數）
// ─────────────────────────────────────────────────────────────────────────────

const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;
const A71: f64 = 35.0 / 384.0;
const A73: f64 = 500.0 / 1113.0;
const A74: f64 = 125.0 / 192.0;
const A75: f64 = -2187.0 / 6784.0;
const A76: f64 = 11.0 / 84.0;

const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const D1: f64 = -12715105075.0 / 11282082432.0;
const D3: f64 = 87487479700.0 / 32700410799.0;
const D4: f64 = -10690763975.0 / 1880347072.0;
const D5: f64 = 701980252875.0 / 199316789632.0;
const D6: f64 = -1453857185.0 / 822651844.0;
const D7: f64 = 69997945.0 / 29380423.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

// ─────────────────────────────────────────────────────────────────────────────
// DormandPrince54
// ─────────────────────────────────────────────────────────────────────────────

/// 自適應步長 Dormand–Prince 5(4) 積分器，誤差以 RMS norm 衡量：
/// sc_i = atol + rtol·max(|y_old_i|, |y_new_i|)。
#[derive(Clone, Debug)]
pub struct DormandPrince54 {
    absolute_tolerance: f64,
    relative_tolerance: f64,
    min_step: f64,
    max_step: f64,
    max_steps: usize,
}

struct Stages {
    k: [DVector<f64>; 7],
    y_stage: DVector<f64>,
}

impl Stages {
    fn new(dimension: usize) -> Stages {
        Stages {
            k: std::array::from_fn(|_| DVector::zeros(dimension)),
            y_stage: DVector::zeros(dimension),
        }
    }
}

impl DormandPrince54 {
    pub fn new(
        min_step: f64,
        max_step: f64,
        absolute_tolerance: f64,
        relative_tolerance: f64,
        max_steps: usize,
    ) -> DormandPrince54 {
        DormandPrince54 {
            absolute_tolerance,
            relative_tolerance,
            min_step,
            max_step,
            max_steps,
        }
    }

    pub fn max_step(&self) -> f64 {
        self.max_step
    }

    fn evaluate(system: &dyn IntervalOdeSystem, interval: usize, t: f64, y: &DVector<f64>, out: &mut DVector<f64>) {
        system.derivatives(interval, t, y.as_slice(), out.as_mut_slice());
    }

    fn scale(&self, y_old: f64, y_new: f64) -> f64 {
        self.absolute_tolerance + self.relative_tolerance * y_old.abs().max(y_new.abs())
    }

    /// Hairer `hinit`：以 ‖y‖、‖f‖ 與二階導數估計初始步長。
    fn initial_step(
        &self,
        system: &dyn IntervalOdeSystem,
        interval: usize,
        t0: f64,
        y0: &DVector<f64>,
        f0: &DVector<f64>,
        direction: f64,
        span: f64,
    ) -> f64 {
        let n = y0.len().max(1) as f64;
        let scales: Vec<f64> = y0.iter().map(|y| self.scale(*y, *y)).collect();
        let rms = |v: &DVector<f64>| {
            (v.iter().zip(&scales).map(|(x, sc)| (x / sc).powi(2)).sum::<f64>() / n).sqrt()
        };

        let d0 = rms(y0);
        let d1 = rms(f0);
        let h0 = if d0.is_finite() && d1.is_finite() && d0 > 1e-5 && d1 > 1e-5 {
            0.01 * d0 / d1
        } else {
            1e-6
        };
        let h0 = h0.min(self.max_step).min(span);

        let y1 = y0 + f0 * (direction * h0);
        let mut f1 = DVector::zeros(y0.len());
        Self::evaluate(system, interval, t0 + direction * h0, &y1, &mut f1);
        let d2 = rms(&(&f1 - f0)) / h0;

        let der12 = d1.max(d2);
        let h1 = if !der12.is_finite() {
            h0
        } else if der12 <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / der12).powf(0.2)
        };

        (100.0 * h0)
            .min(h1)
            .min(self.max_step)
            .min(span)
            .max(self.min_step)
    }

    fn error_norm(&self, y_old: &DVector<f64>, y_new: &DVector<f64>, error: &DVector<f64>) -> f64 {
        let n = y_old.len().max(1) as f64;
        let sum: f64 = error
            .iter()
            .zip(y_old.iter().zip(y_new.iter()))
            .map(|(err, (a, b))| (err / self.scale(*a, *b)).powi(2))
            .sum();
        (sum / n).sqrt()
    }

    /// 在單一 interval 上由 `t0` 積分到 `t1`（`t1 < t0` 即為 backward），
    /// 回傳稠密輸出。
    pub fn integrate(
        &self,
        system: &dyn IntervalOdeSystem,
        interval: usize,
        t0: f64,
        t1: f64,
        y0: DVector<f64>,
    ) -> LikelihoodResult<ContinuousOutput> {
        let span = (t1 - t0).abs();
        if span == 0.0 {
            return Ok(ContinuousOutput::new(t0, y0, Vec::new()));
        }
        let direction = if t1 > t0 { 1.0 } else { -1.0 };
        let failure = |time: f64, reason: &str| LikelihoodError::IntegrationFailure {
            interval,
            time,
            reason: reason.to_owned(),
        };

        let dimension = y0.len();
        let mut stages = Stages::new(dimension);
        let mut t = t0;
        let mut y = y0.clone();
        Self::evaluate(system, interval, t, &y, &mut stages.k[0]);
        if stages.k[0].iter().any(|x| !x.is_finite()) {
            return Err(failure(t, "non-finite derivative at interval start"));
        }

        let mut h = self.initial_step(system, interval, t, &y, &stages.k[0], direction, span);
        let mut steps: Vec<DenseStep> = Vec::new();
        let mut step_count = 0usize;
        let mut rejected = false;

        loop {
            if step_count >= self.max_steps {
                return Err(failure(t, "step budget exhausted"));
            }
            step_count += 1;

            let remaining = (t1 - t).abs();
            let last = h >= remaining;
            if last {
                h = remaining;
            } else if h < self.min_step {
                return Err(failure(t, "step size fell below the minimum"));
            }
            let hs = direction * h;

            let (y_new, error) = self.attempt_step(system, interval, t, &y, hs, &mut stages);
            if y_new.iter().any(|x| !x.is_finite()) {
                return Err(failure(t, "non-finite state"));
            }

            let err = self.error_norm(&y, &y_new, &error);
            if !err.is_finite() {
                return Err(failure(t, "non-finite error estimate"));
            }

            if err <= 1.0 {
                steps.push(self.dense_step(t, hs, &y, &y_new, &stages));

                t = if last { t1 } else { t + hs };
                y = y_new;
                stages.k.swap(0, 6);

                if last {
                    break;
                }

                let mut factor = (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR);
                if rejected {
                    factor = factor.min(1.0);
                }
                h = (h * factor).min(self.max_step);
                rejected = false;
            } else {
                h *= (SAFETY * err.powf(-0.2)).max(MIN_FACTOR);
                rejected = true;
            }
        }

        Ok(ContinuousOutput::new(t0, y0, steps))
    }

    /// 計算 k2..k7 與五階解、嵌入誤差；k1 必須已在 `stages.k[0]`。
    fn attempt_step(
        &self,
        system: &dyn IntervalOdeSystem,
        interval: usize,
        t: f64,
        y: &DVector<f64>,
        h: f64,
        stages: &mut Stages,
    ) -> (DVector<f64>, DVector<f64>) {
        let Stages { k, y_stage } = stages;

        y_stage.copy_from(y);
        y_stage.axpy(h * A21, &k[0], 1.0);
        Self::evaluate(system, interval, t + C2 * h, y_stage, &mut k[1]);

        y_stage.copy_from(y);
        y_stage.axpy(h * A31, &k[0], 1.0);
        y_stage.axpy(h * A32, &k[1], 1.0);
        Self::evaluate(system, interval, t + C3 * h, y_stage, &mut k[2]);

        y_stage.copy_from(y);
        y_stage.axpy(h * A41, &k[0], 1.0);
        y_stage.axpy(h * A42, &k[1], 1.0);
        y_stage.axpy(h * A43, &k[2], 1.0);
        Self::evaluate(system, interval, t + C4 * h, y_stage, &mut k[3]);

        y_stage.copy_from(y);
        y_stage.axpy(h * A51, &k[0], 1.0);
        y_stage.axpy(h * A52, &k[1], 1.0);
        y_stage.axpy(h * A53, &k[2], 1.0);
        y_stage.axpy(h * A54, &k[3], 1.0);
        Self::evaluate(system, interval, t + C5 * h, y_stage, &mut k[4]);

        y_stage.copy_from(y);
        y_stage.axpy(h * A61, &k[0], 1.0);
        y_stage.axpy(h * A62, &k[1], 1.0);
        y_stage.axpy(h * A63, &k[2], 1.0);
        y_stage.axpy(h * A64, &k[3], 1.0);
        y_stage.axpy(h * A65, &k[4], 1.0);
        Self::evaluate(system, interval, t + h, y_stage, &mut k[5]);

        let mut y_new = y.clone();
        y_new.axpy(h * A71, &k[0], 1.0);
        y_new.axpy(h * A73, &k[2], 1.0);
        y_new.axpy(h * A74, &k[3], 1.0);
        y_new.axpy(h * A75, &k[4], 1.0);
        y_new.axpy(h * A76, &k[5], 1.0);
        Self::evaluate(system, interval, t + h, &y_new, &mut k[6]);

        let mut error = DVector::zeros(y.len());
        error.axpy(h * E1, &k[0], 1.0);
        error.axpy(h * E3, &k[2], 1.0);
        error.axpy(h * E4, &k[3], 1.0);
        error.axpy(h * E5, &k[4], 1.0);
        error.axpy(h * E6, &k[5], 1.0);
        error.axpy(h * E7, &k[6], 1.0);

        (y_new, error)
    }

    fn dense_step(&self, t: f64, h: f64, y_old: &DVector<f64>, y_new: &DVector<f64>, stages: &Stages) -> DenseStep {
        let k = &stages.k;
        let rcont1 = y_old.clone();
        let rcont2 = y_new - y_old;
        let rcont3 = &k[0] * h - &rcont2;
        let rcont4 = &rcont2 - &k[6] * h - &rcont3;
        let mut rcont5 = DVector::zeros(y_old.len());
        rcont5.axpy(h * D1, &k[0], 1.0);
        rcont5.axpy(h * D3, &k[2], 1.0);
        rcont5.axpy(h * D4, &k[3], 1.0);
        rcont5.axpy(h * D5, &k[4], 1.0);
        rcont5.axpy(h * D6, &k[5], 1.0);
        rcont5.axpy(h * D7, &k[6], 1.0);
        DenseStep::new(t, h, [rcont1, rcont2, rcont3, rcont4, rcont5])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y' = λ_interval · y
    struct Exponential {
        rates: Vec<f64>,
    }

    impl IntervalOdeSystem for Exponential {
        fn dimension(&self) -> usize {
            1
        }

        fn derivatives(&self, interval: usize, _t: f64, y: &[f64], y_dot: &mut [f64]) {
            y_dot[0] = self.rates[interval] * y[0];
        }
    }

    /// 諧振子 y'' = -y
    struct Oscillator;

    impl IntervalOdeSystem for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn derivatives(&self, _interval: usize, _t: f64, y: &[f64], y_dot: &mut [f64]) {
            y_dot[0] = y[1];
            y_dot[1] = -y[0];
        }
    }

    fn integrator() -> DormandPrince54 {
        DormandPrince54::new(1e-100, 0.5, 1e-100, 1e-10, 100_000)
    }

    #[test]
    fn exponential_growth_forward() {
        let system = Exponential { rates: vec![0.0, 1.3] };
        let output = integrator()
            .integrate(&system, 1, 0.0, 2.0, DVector::from_element(1, 1.0))
            .unwrap();
        let expected = (1.3f64 * 2.0).exp();
        let actual = output.state_at(2.0)[0];
        assert!((actual - expected).abs() / expected < 1e-8, "got {actual}, expected {expected}");
    }

    #[test]
    fn exponential_decay_backward() {
        let system = Exponential { rates: vec![-0.7] };
        let output = integrator()
            .integrate(&system, 0, 3.0, 1.0, DVector::from_element(1, 2.0))
            .unwrap();
        let expected = 2.0 * (0.7f64 * 2.0).exp();
        assert!((output.state_at(1.0)[0] - expected).abs() / expected < 1e-8);
        assert!((output.lower_time() - 1.0).abs() < 1e-12);
        assert!((output.upper_time() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn dense_output_is_accurate_between_steps() {
        let output = integrator()
            .integrate(&Oscillator, 0, 0.0, 10.0, DVector::from_vec(vec![0.0, 1.0]))
            .unwrap();
        for i in 0..=100 {
            let t = 0.1 * i as f64;
            let state = output.state_at(t);
            assert!((state[0] - t.sin()).abs() < 1e-7, "sin mismatch at t = {t}: {}", state[0]);
            assert!((state[1] - t.cos()).abs() < 1e-7, "cos mismatch at t = {t}: {}", state[1]);
        }
    }

    #[test]
    fn step_budget_is_enforced() {
        let tight = DormandPrince54::new(1e-100, 1e-3, 1e-100, 1e-10, 10);
        let result = tight.integrate(&Oscillator, 4, 0.0, 10.0, DVector::from_vec(vec![0.0, 1.0]));
        match result {
            Err(LikelihoodError::IntegrationFailure { interval, .. }) => assert_eq!(interval, 4),
            other => panic!("expected integration failure, got {other:?}"),
        }
    }

    #[test]
    fn blow_up_is_reported() {
        struct Riccati;
        impl IntervalOdeSystem for Riccati {
            fn dimension(&self) -> usize {
                1
            }
            fn derivatives(&self, _interval: usize, _t: f64, y: &[f64], y_dot: &mut [f64]) {
                y_dot[0] = y[0] * y[0];
            }
        }
        // y = 1 / (1 - t) 在 t = 1 發散
        let result = integrator().integrate(&Riccati, 0, 0.0, 2.0, DVector::from_element(1, 1.0));
        assert!(matches!(result, Err(LikelihoodError::IntegrationFailure { .. })));
    }

    #[test]
    fn zero_length_interval_returns_initial_state() {
        let output = integrator()
            .integrate(&Oscillator, 0, 1.0, 1.0, DVector::from_vec(vec![0.3, 0.4]))
            .unwrap();
        assert_eq!(output.step_count(), 0);
        assert_eq!(output.state_at(1.0), DVector::from_vec(vec![0.3, 0.4]));
    }
}
