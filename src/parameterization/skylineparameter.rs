use nalgebra::DMatrix;

use crate::likelihooderror::{
    LikelihoodError,
    LikelihoodResult
};
use crate::math::special::TIME_TOLERANCE;

fn epoch_index(change_times: &[f64], t: f64) -> usize {
    change_times.partition_point(|c| *c < t - TIME_TOLERANCE)
}

fn validate_change_times(name: &str, change_times: &[f64]) -> LikelihoodResult<()> {
    if change_times.iter().any(|c| !c.is_finite()) {
        return Err(LikelihoodError::configuration(format!("{name}: change times must be finite")));
    }
    if change_times.windows(2).any(|w| w[0] >= w[1]) {
        return Err(LikelihoodError::configuration(format!(
            "{name}: change times must be strictly increasing"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// SkylineVector
// ─────────────────────────────────────────────────────────────────────────────

/// 每個 type 一個值、隨時間分段常數的參數。
///
/// `change_times` 由 process 起點往後量；第 j 個 epoch 為 (c_j, c_{j+1}]，
/// 邊界時間屬於較早的 epoch。
#[derive(Clone, Debug, PartialEq)]
pub struct SkylineVector {
    change_times: Vec<f64>,
    values: Vec<Vec<f64>>,
}

impl SkylineVector {
    pub fn new(change_times: Vec<f64>, values: Vec<Vec<f64>>) -> LikelihoodResult<SkylineVector> {
        validate_change_times("skyline vector", &change_times)?;
        if values.len() != change_times.len() + 1 {
            return Err(LikelihoodError::configuration(format!(
                "skyline vector: {} change times require {} epochs of values, got {}",
                change_times.len(),
                change_times.len() + 1,
                values.len()
            )));
        }
        if let Some(first) = values.first() {
            if values.iter().any(|v| v.len() != first.len()) {
                return Err(LikelihoodError::configuration(
                    "skyline vector: every epoch must have the same number of types",
                ));
            }
        }
        Ok(SkylineVector { change_times, values })
    }

    /// 不隨時間變化。
    pub fn constant(values: Vec<f64>) -> SkylineVector {
        SkylineVector { change_times: Vec::new(), values: vec![values] }
    }

    /// 每個 epoch 一個純量，套用到所有 type。
    pub fn broadcast(change_times: Vec<f64>, scalars: Vec<f64>, type_count: usize) -> LikelihoodResult<SkylineVector> {
        let values = scalars.into_iter().map(|x| vec![x; type_count]).collect();
        SkylineVector::new(change_times, values)
    }

    pub fn change_times(&self) -> &[f64] {
        &self.change_times
    }

    pub fn type_count(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    pub fn value_at(&self, t: f64) -> &[f64] {
        &self.values[epoch_index(&self.change_times, t)]
    }

    pub(crate) fn all_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().flatten().copied()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SkylineMatrix
// ─────────────────────────────────────────────────────────────────────────────

/// type 對 type 的分段常數參數（migration、cross-birth），對角線不使用。
#[derive(Clone, Debug, PartialEq)]
pub struct SkylineMatrix {
    change_times: Vec<f64>,
    values: Vec<DMatrix<f64>>,
}

impl SkylineMatrix {
    pub fn new(change_times: Vec<f64>, values: Vec<DMatrix<f64>>) -> LikelihoodResult<SkylineMatrix> {
        validate_change_times("skyline matrix", &change_times)?;
        if values.len() != change_times.len() + 1 {
            return Err(LikelihoodError::configuration(format!(
                "skyline matrix: {} change times require {} epochs of values, got {}",
                change_times.len(),
                change_times.len() + 1,
                values.len()
            )));
        }
        if values.iter().any(|m| !m.is_square()) {
            return Err(LikelihoodError::configuration("skyline matrix: values must be square"));
        }
        if let Some(first) = values.first() {
            if values.iter().any(|m| m.nrows() != first.nrows()) {
                return Err(LikelihoodError::configuration(
                    "skyline matrix: every epoch must have the same number of types",
                ));
            }
        }
        let values = values
            .into_iter()
            .map(|mut m| {
                m.fill_diagonal(0.0);
                m
            })
            .collect();
        Ok(SkylineMatrix { change_times, values })
    }

    pub fn zeros(type_count: usize) -> SkylineMatrix {
        SkylineMatrix { change_times: Vec::new(), values: vec![DMatrix::zeros(type_count, type_count)] }
    }

    pub fn constant(values: DMatrix<f64>) -> LikelihoodResult<SkylineMatrix> {
        SkylineMatrix::new(Vec::new(), vec![values])
    }

    /// 每個 epoch 一個純量，套用到所有非對角元素。
    pub fn broadcast(change_times: Vec<f64>, scalars: Vec<f64>, type_count: usize) -> LikelihoodResult<SkylineMatrix> {
        let values = scalars
            .into_iter()
            .map(|x| DMatrix::from_element(type_count, type_count, x))
            .collect();
        SkylineMatrix::new(change_times, values)
    }

    pub fn change_times(&self) -> &[f64] {
        &self.change_times
    }

    pub fn type_count(&self) -> usize {
        self.values.first().map_or(0, |m| m.nrows())
    }

    pub fn value_at(&self, t: f64) -> &DMatrix<f64> {
        &self.values[epoch_index(&self.change_times, t)]
    }

    pub(crate) fn all_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().flat_map(|m| m.iter().copied())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TimedParameter
// ─────────────────────────────────────────────────────────────────────────────

/// 在特定時間點發生的 rho sampling：每個時間一組 per-type 機率。
#[derive(Clone, Debug, PartialEq)]
pub struct TimedParameter {
    times: Vec<f64>,
    values: Vec<Vec<f64>>,
}

impl TimedParameter {
    pub fn new(times: Vec<f64>, values: Vec<Vec<f64>>) -> LikelihoodResult<TimedParameter> {
        validate_change_times("rho sampling", &times)?;
        if times.len() != values.len() {
            return Err(LikelihoodError::configuration(format!(
                "rho sampling: {} times but {} value sets",
                times.len(),
                values.len()
            )));
        }
        Ok(TimedParameter { times, values })
    }

    pub fn empty() -> TimedParameter {
        TimedParameter { times: Vec::new(), values: Vec::new() }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[Vec<f64>] {
        &self.values
    }

    /// 與 `t` 在時間容差內相同的事件。
    pub fn value_at(&self, t: f64) -> Option<&[f64]> {
        self.times
            .iter()
            .position(|time| (time - t).abs() <= TIME_TOLERANCE)
            .map(|i| self.values[i].as_slice())
    }
}
