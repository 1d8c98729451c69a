use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{
    Deserialize,
    Serialize
};

use crate::flow::flow::FlowDirection;
use crate::likelihood::conditioning::ConditioningMode;
use crate::likelihooderror::{
    LikelihoodError,
    LikelihoodResult
};
use crate::math::special::FREQUENCY_SUM_TOLERANCE;

pub const DEFAULT_ABSOLUTE_TOLERANCE: f64 = 1e-100;
pub const DEFAULT_RELATIVE_TOLERANCE: f64 = 1e-7;
pub const DEFAULT_MAX_STEPS: usize = 1_000_000;

// ─────────────────────────────────────────────────────────────────────────────
// LikelihoodConfiguration
// ─────────────────────────────────────────────────────────────────────────────

/// 一次 likelihood 設定的所有數值選項，建構後不可變。
///
/// JSON 欄位皆可省略，省略時取 `Default` 的值：
///
/// ```json
/// {
///     "relative_tolerance": 1e-8,
///     "frequencies": [0.5, 0.5],
///     "conditioning": "survival",
///     "type_label": "state"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodConfiguration {
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
    /// root 的 type 頻率；`None` 表示均勻分布。
    pub frequencies: Option<Vec<f64>>,
    pub conditioning: ConditioningMode,
    /// 讀取節點 type 的 metadata key，例如 `[&state=1]` 的 `state`。
    pub type_label: Option<String>,
    /// 最年輕樣本距離 process 結束的時間。
    pub final_sample_offset: f64,
    pub flow_direction: FlowDirection,
    /// 每個 interval 的積分步數上限。
    pub max_steps: usize,
    /// subtree 節點數達到此門檻時以 `rayon::join` 平行計算；`None` 為單執行緒。
    pub parallel_subtree_threshold: Option<usize>,
}

impl Default for LikelihoodConfiguration {
    fn default() -> Self {
        LikelihoodConfiguration {
            absolute_tolerance: DEFAULT_ABSOLUTE_TOLERANCE,
            relative_tolerance: DEFAULT_RELATIVE_TOLERANCE,
            frequencies: None,
            conditioning: ConditioningMode::default(),
            type_label: None,
            final_sample_offset: 0.0,
            flow_direction: FlowDirection::default(),
            max_steps: DEFAULT_MAX_STEPS,
            parallel_subtree_threshold: None,
        }
    }
}

impl LikelihoodConfiguration {
    pub fn from_reader(file_path: impl AsRef<Path>) -> LikelihoodResult<LikelihoodConfiguration> {
        let file = File::open(file_path)?;
        let reader = BufReader::new(file);
        let configuration: LikelihoodConfiguration = serde_json::from_reader(reader)?;
        configuration.validate_tolerances()?;
        Ok(configuration)
    }

    pub fn from_json_str(json: &str) -> LikelihoodResult<LikelihoodConfiguration> {
        let configuration: LikelihoodConfiguration = serde_json::from_str(json)?;
        configuration.validate_tolerances()?;
        Ok(configuration)
    }

    pub fn with_frequencies(mut self, frequencies: Vec<f64>) -> Self {
        self.frequencies = Some(frequencies);
        self
    }

    pub fn with_conditioning(mut self, conditioning: ConditioningMode) -> Self {
        self.conditioning = conditioning;
        self
    }

    pub fn with_type_label(mut self, type_label: impl Into<String>) -> Self {
        self.type_label = Some(type_label.into());
        self
    }

    pub fn with_flow_direction(mut self, flow_direction: FlowDirection) -> Self {
        self.flow_direction = flow_direction;
        self
    }

    pub fn with_tolerances(mut self, absolute_tolerance: f64, relative_tolerance: f64) -> Self {
        self.absolute_tolerance = absolute_tolerance;
        self.relative_tolerance = relative_tolerance;
        self
    }

    pub fn with_final_sample_offset(mut self, final_sample_offset: f64) -> Self {
        self.final_sample_offset = final_sample_offset;
        self
    }

    pub fn with_parallel_subtree_threshold(mut self, threshold: usize) -> Self {
        self.parallel_subtree_threshold = Some(threshold);
        self
    }

    pub fn validate_tolerances(&self) -> LikelihoodResult<()> {
        let positive = |x: f64| x.is_finite() && x > 0.0;
        if !positive(self.absolute_tolerance) || !positive(self.relative_tolerance) {
            return Err(LikelihoodError::configuration(format!(
                "tolerances must be positive and finite (absolute = {}, relative = {})",
                self.absolute_tolerance, self.relative_tolerance
            )));
        }
        if self.max_steps == 0 {
            return Err(LikelihoodError::configuration("max_steps must be at least 1"));
        }
        if !self.final_sample_offset.is_finite() || self.final_sample_offset < 0.0 {
            return Err(LikelihoodError::configuration(format!(
                "final sample offset must be non-negative, got {}",
                self.final_sample_offset
            )));
        }
        Ok(())
    }

    /// 依 type 數解析 root 頻率並檢查：維度相符、非負、總和在 1e-10 內等於 1。
    pub fn resolve_frequencies(&self, type_count: usize) -> LikelihoodResult<Vec<f64>> {
        let frequencies = match &self.frequencies {
            Some(frequencies) => frequencies.clone(),
            None => vec![1.0 / type_count as f64; type_count],
        };
        if frequencies.len() != type_count {
            return Err(LikelihoodError::configuration(format!(
                "frequencies have dimension {} but the model has {} types",
                frequencies.len(),
                type_count
            )));
        }
        if frequencies.iter().any(|f| !f.is_finite() || *f < 0.0) {
            return Err(LikelihoodError::configuration("frequencies must be non-negative"));
        }
        let sum: f64 = frequencies.iter().sum();
        if (sum - 1.0).abs() > FREQUENCY_SUM_TOLERANCE {
            return Err(LikelihoodError::configuration(format!(
                "frequencies must add up to 1 but currently add to {sum}"
            )));
        }
        Ok(frequencies)
    }
}
