use nalgebra::DMatrix;

use super::parameterization::Parameterization;
use super::skylineparameter::{
    SkylineMatrix,
    SkylineVector,
    TimedParameter
};
use crate::likelihooderror::{
    LikelihoodError,
    LikelihoodResult
};
use crate::math::special::TIME_TOLERANCE;

// ─────────────────────────────────────────────────────────────────────────────
// CanonicalParameterization
// ─────────────────────────────────────────────────────────────────────────────

/// 直接以 birth / death / sampling / removal / migration / cross-birth / rho
/// 描述模型的參數化。建構時把所有 skyline 的 change time 與 rho 時間合併成
/// 一組 interval，並為每個 interval 預先取出常數速率。
#[derive(Clone, Debug)]
pub struct CanonicalParameterization {
    type_count: usize,
    process_length: f64,
    end_times: Vec<f64>,
    birth_rates: Vec<Vec<f64>>,
    death_rates: Vec<Vec<f64>>,
    sampling_rates: Vec<Vec<f64>>,
    removal_probs: Vec<Vec<f64>>,
    rho_values: Vec<Vec<f64>>,
    migration_rates: Vec<DMatrix<f64>>,
    cross_birth_rates: Vec<DMatrix<f64>>,
}

impl CanonicalParameterization {
    pub fn builder(process_length: f64, type_count: usize) -> CanonicalParameterizationBuilder {
        CanonicalParameterizationBuilder {
            process_length,
            type_count,
            birth_rate: None,
            death_rate: None,
            sampling_rate: None,
            removal_prob: None,
            rho_sampling: TimedParameter::empty(),
            migration_rate: None,
            cross_birth_rate: None,
        }
    }
}

impl Parameterization for CanonicalParameterization {
    fn type_count(&self) -> usize { self.type_count }
    fn total_process_length(&self) -> f64 { self.process_length }
    fn interval_end_times(&self) -> &[f64] { &self.end_times }
    fn birth_rates(&self, interval: usize) -> &[f64] { &self.birth_rates[interval] }
    fn death_rates(&self, interval: usize) -> &[f64] { &self.death_rates[interval] }
    fn sampling_rates(&self, interval: usize) -> &[f64] { &self.sampling_rates[interval] }
    fn removal_probs(&self, interval: usize) -> &[f64] { &self.removal_probs[interval] }
    fn rho_values(&self, interval: usize) -> &[f64] { &self.rho_values[interval] }
    fn migration_rates(&self, interval: usize) -> &DMatrix<f64> { &self.migration_rates[interval] }
    fn cross_birth_rates(&self, interval: usize) -> &DMatrix<f64> { &self.cross_birth_rates[interval] }
}

// ─────────────────────────────────────────────────────────────────────────────
// CanonicalParameterizationBuilder
// ─────────────────────────────────────────────────────────────────────────────

/// birth 與 death 必填；sampling 預設 0，removal 預設 1（取樣即移除），
/// migration 與 cross-birth 預設 0，沒有 rho sampling。
pub struct CanonicalParameterizationBuilder {
    process_length: f64,
    type_count: usize,
    birth_rate: Option<SkylineVector>,
    death_rate: Option<SkylineVector>,
    sampling_rate: Option<SkylineVector>,
    removal_prob: Option<SkylineVector>,
    rho_sampling: TimedParameter,
    migration_rate: Option<SkylineMatrix>,
    cross_birth_rate: Option<SkylineMatrix>,
}

impl CanonicalParameterizationBuilder {
    pub fn birth_rate(mut self, skyline: SkylineVector) -> Self {
        self.birth_rate = Some(skyline);
        self
    }

    pub fn death_rate(mut self, skyline: SkylineVector) -> Self {
        self.death_rate = Some(skyline);
        self
    }

    pub fn sampling_rate(mut self, skyline: SkylineVector) -> Self {
        self.sampling_rate = Some(skyline);
        self
    }

    pub fn removal_prob(mut self, skyline: SkylineVector) -> Self {
        self.removal_prob = Some(skyline);
        self
    }

    pub fn rho_sampling(mut self, rho: TimedParameter) -> Self {
        self.rho_sampling = rho;
        self
    }

    pub fn migration_rate(mut self, skyline: SkylineMatrix) -> Self {
        self.migration_rate = Some(skyline);
        self
    }

    pub fn cross_birth_rate(mut self, skyline: SkylineMatrix) -> Self {
        self.cross_birth_rate = Some(skyline);
        self
    }

    pub fn build(self) -> LikelihoodResult<CanonicalParameterization> {
        let n = self.type_count;
        let length = self.process_length;
        if n == 0 {
            return Err(LikelihoodError::configuration("the model needs at least one type"));
        }
        if !length.is_finite() || length <= 0.0 {
            return Err(LikelihoodError::configuration(format!(
                "process length must be positive, got {length}"
            )));
        }

        let birth = self
            .birth_rate
            .ok_or_else(|| LikelihoodError::configuration("birth rate is required"))?;
        let death = self
            .death_rate
            .ok_or_else(|| LikelihoodError::configuration("death rate is required"))?;
        let sampling = self.sampling_rate.unwrap_or_else(|| SkylineVector::constant(vec![0.0; n]));
        let removal = self.removal_prob.unwrap_or_else(|| SkylineVector::constant(vec![1.0; n]));
        let migration = self.migration_rate.unwrap_or_else(|| SkylineMatrix::zeros(n));
        let cross_birth = self.cross_birth_rate.unwrap_or_else(|| SkylineMatrix::zeros(n));
        let rho = self.rho_sampling;

        let vectors = [
            ("birth rate", &birth, false),
            ("death rate", &death, false),
            ("sampling rate", &sampling, false),
            ("removal probability", &removal, true),
        ];
        for (name, skyline, is_probability) in vectors {
            check_type_count(name, skyline.type_count(), n)?;
            check_change_times(name, skyline.change_times(), length)?;
            check_values(name, skyline.all_values(), is_probability)?;
        }
        for (name, skyline) in [("migration rate", &migration), ("cross-birth rate", &cross_birth)] {
            check_type_count(name, skyline.type_count(), n)?;
            check_change_times(name, skyline.change_times(), length)?;
            check_values(name, skyline.all_values(), false)?;
        }
        for values in rho.values() {
            check_type_count("rho sampling", values.len(), n)?;
            check_values("rho sampling", values.iter().copied(), true)?;
        }
        if let Some(time) = rho
            .times()
            .iter()
            .find(|t| **t <= TIME_TOLERANCE || **t > length + TIME_TOLERANCE)
        {
            return Err(LikelihoodError::configuration(format!(
                "rho sampling time {time} lies outside (0, {length}]"
            )));
        }

        let end_times = collect_end_times(
            length,
            [
                birth.change_times(),
                death.change_times(),
                sampling.change_times(),
                removal.change_times(),
                migration.change_times(),
                cross_birth.change_times(),
                rho.times(),
            ],
        );

        let per_interval = |skyline: &SkylineVector| -> Vec<Vec<f64>> {
            end_times.iter().map(|end| skyline.value_at(*end).to_vec()).collect()
        };
        let per_interval_matrix = |skyline: &SkylineMatrix| -> Vec<DMatrix<f64>> {
            end_times.iter().map(|end| skyline.value_at(*end).clone()).collect()
        };
        let rho_values = end_times
            .iter()
            .map(|end| rho.value_at(*end).map_or_else(|| vec![0.0; n], <[f64]>::to_vec))
            .collect();

        Ok(CanonicalParameterization {
            type_count: n,
            process_length: length,
            birth_rates: per_interval(&birth),
            death_rates: per_interval(&death),
            sampling_rates: per_interval(&sampling),
            removal_probs: per_interval(&removal),
            rho_values,
            migration_rates: per_interval_matrix(&migration),
            cross_birth_rates: per_interval_matrix(&cross_birth),
            end_times,
        })
    }
}

fn check_type_count(name: &str, actual: usize, expected: usize) -> LikelihoodResult<()> {
    if actual != expected {
        return Err(LikelihoodError::configuration(format!(
            "{name} has {actual} types but the model has {expected}"
        )));
    }
    Ok(())
}

fn check_change_times(name: &str, change_times: &[f64], length: f64) -> LikelihoodResult<()> {
    match change_times.iter().find(|c| **c <= 0.0 || **c >= length) {
        Some(c) => Err(LikelihoodError::configuration(format!(
            "{name} change time {c} lies outside (0, {length})"
        ))),
        None => Ok(()),
    }
}

fn check_values(name: &str, mut values: impl Iterator<Item = f64>, is_probability: bool) -> LikelihoodResult<()> {
    let upper = if is_probability { 1.0 } else { f64::INFINITY };
    match values.find(|x| !x.is_finite() || *x < 0.0 || *x > upper) {
        Some(x) => Err(LikelihoodError::configuration(format!("{name} has an invalid value {x}"))),
        None => Ok(()),
    }
}

/// 合併所有 change time 與 rho 時間，去除容差內的重複，最後一個固定為 T。
fn collect_end_times<'a>(length: f64, sources: impl IntoIterator<Item = &'a [f64]>) -> Vec<f64> {
    let mut times: Vec<f64> = sources
        .into_iter()
        .flatten()
        .copied()
        .filter(|t| *t < length - TIME_TOLERANCE)
        .collect();
    times.sort_by(f64::total_cmp);
    times.dedup_by(|later, earlier| (*later - *earlier).abs() <= TIME_TOLERANCE);
    times.push(length);
    times
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_type_builder() -> CanonicalParameterizationBuilder {
        CanonicalParameterization::builder(2.0, 2)
            .birth_rate(SkylineVector::constant(vec![4.0, 4.0]))
            .death_rate(SkylineVector::constant(vec![3.0, 3.0]))
            .sampling_rate(SkylineVector::constant(vec![1.5, 1.5]))
            .removal_prob(SkylineVector::constant(vec![1.0, 1.0]))
            .migration_rate(SkylineMatrix::broadcast(vec![1.0], vec![0.1, 0.2], 2).unwrap())
    }

    #[test]
    fn change_times_and_rho_times_define_intervals() {
        let parameterization = two_type_builder()
            .rho_sampling(TimedParameter::new(vec![1.5], vec![vec![0.3, 0.0]]).unwrap())
            .build()
            .unwrap();

        assert_eq!(parameterization.interval_end_times(), &[1.0, 1.5, 2.0]);
        assert_eq!(parameterization.interval_count(), 3);
        for interval in 0..3 {
            let mig = if interval < 1 { 0.1 } else { 0.2 };
            assert_eq!(parameterization.birth_rates(interval), &[4.0, 4.0]);
            assert_eq!(parameterization.death_rates(interval), &[3.0, 3.0]);
            assert_eq!(parameterization.sampling_rates(interval), &[1.5, 1.5]);
            assert_eq!(parameterization.removal_probs(interval), &[1.0, 1.0]);
            assert_eq!(parameterization.migration_rates(interval)[(0, 1)], mig);
            assert_eq!(parameterization.migration_rates(interval)[(1, 0)], mig);
            assert_eq!(parameterization.cross_birth_rates(interval)[(0, 1)], 0.0);
        }
        assert_eq!(parameterization.rho_values(0), &[0.0, 0.0]);
        assert_eq!(parameterization.rho_values(1), &[0.3, 0.0]);
        assert_eq!(parameterization.rho_values(2), &[0.0, 0.0]);
    }

    #[test]
    fn interval_lookup_uses_upper_inclusive_boundaries() {
        let parameterization = two_type_builder().build().unwrap();
        assert_eq!(parameterization.interval_index(0.0), 0);
        assert_eq!(parameterization.interval_index(1.0), 0);
        assert_eq!(parameterization.interval_index(1.2), 1);
        assert_eq!(parameterization.interval_index(2.0), 1);
        assert_eq!(parameterization.interval_start_time(1), 1.0);
    }

    #[test]
    fn rho_at_present_does_not_add_an_interval() {
        let parameterization = two_type_builder()
            .rho_sampling(TimedParameter::new(vec![2.0], vec![vec![0.5, 0.5]]).unwrap())
            .build()
            .unwrap();
        assert_eq!(parameterization.interval_end_times(), &[1.0, 2.0]);
        assert_eq!(parameterization.rho_values(1), &[0.5, 0.5]);
    }

    #[test]
    fn shared_change_times_are_merged() {
        let parameterization = two_type_builder()
            .birth_rate(SkylineVector::broadcast(vec![1.0 + 1e-12], vec![4.0, 5.0], 2).unwrap())
            .build()
            .unwrap();
        assert_eq!(parameterization.interval_count(), 2);
        assert_eq!(parameterization.birth_rates(1), &[5.0, 5.0]);
    }

    #[test]
    fn node_time_counts_back_from_the_present() {
        let parameterization = two_type_builder().build().unwrap();
        assert_eq!(parameterization.node_time(0.5, 0.25), 1.25);
    }

    #[test]
    fn invalid_inputs_are_configuration_errors() {
        let wrong_types = two_type_builder().death_rate(SkylineVector::constant(vec![1.0])).build();
        assert!(matches!(wrong_types, Err(LikelihoodError::Configuration(_))));

        let negative = two_type_builder().birth_rate(SkylineVector::constant(vec![-1.0, 1.0])).build();
        assert!(matches!(negative, Err(LikelihoodError::Configuration(_))));

        let probability = two_type_builder().removal_prob(SkylineVector::constant(vec![1.5, 1.0])).build();
        assert!(matches!(probability, Err(LikelihoodError::Configuration(_))));

        let late_change = two_type_builder()
            .sampling_rate(SkylineVector::broadcast(vec![3.0], vec![1.0, 2.0], 2).unwrap())
            .build();
        assert!(matches!(late_change, Err(LikelihoodError::Configuration(_))));

        let missing_birth = CanonicalParameterization::builder(1.0, 1)
            .death_rate(SkylineVector::constant(vec![1.0]))
            .build();
        assert!(matches!(missing_birth, Err(LikelihoodError::Configuration(_))));

        let late_rho = two_type_builder()
            .rho_sampling(TimedParameter::new(vec![2.5], vec![vec![0.5, 0.5]]).unwrap())
            .build();
        assert!(matches!(late_rho, Err(LikelihoodError::Configuration(_))));
    }
}
