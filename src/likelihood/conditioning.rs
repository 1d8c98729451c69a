use nalgebra::DVector;
use serde::{
    Deserialize,
    Serialize
};

use crate::parameterization::parameterization::Parameterization;

/// likelihood 的條件化方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditioningMode {
    #[default]
    None,
    /// 以 process 起點的 lineage 至少留下一個樣本為條件。
    Survival,
    /// root 位於 process 起點，以兩個子 lineage 皆留下樣本為條件。
    RootAge,
}

/// 條件化的分母；`extinction_at_origin` 為 e(0)。
pub fn conditioning_density(
    mode: ConditioningMode,
    parameterization: &dyn Parameterization,
    frequencies: &[f64],
    extinction_at_origin: &DVector<f64>,
) -> f64 {
    match mode {
        ConditioningMode::None => 1.0,
        ConditioningMode::Survival => frequencies
            .iter()
            .zip(extinction_at_origin.iter())
            .map(|(f, e)| f * (1.0 - e))
            .sum(),
        ConditioningMode::RootAge => {
            let survival = extinction_at_origin.map(|e| 1.0 - e);
            let birth = parameterization.birth_rates(0);
            let cross_birth = parameterization.cross_birth_rates(0);
            let n = survival.len();
            (0..n)
                .map(|i| {
                    let mut density = birth[i] * survival[i] * survival[i];
                    for j in (0..n).filter(|j| *j != i) {
                        density += cross_birth[(i, j)] * survival[i] * survival[j];
                    }
                    frequencies[i] * density
                })
                .sum()
        }
    }
}
