use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// LikelihoodError
// ─────────────────────────────────────────────────────────────────────────────

/// 單次 likelihood 計算可能發生的錯誤。
///
/// - `Configuration`：建構階段檢查失敗（頻率、type label、維度），不可重試。
/// - `IntegrationFailure`：ODE 積分在 step budget 內無法達到容差，或狀態出現非有限值。
/// - `NumericalDegeneracy`：flow 矩陣奇異，線性求解失敗。
///
/// 所有錯誤都只影響當次計算，不會寫入 [`FlowCache`](crate::flow::flowcache::FlowCache)。
#[derive(Debug, Error)]
pub enum LikelihoodError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("integration failed on interval {interval} at t = {time}: {reason}")]
    IntegrationFailure {
        interval: usize,
        time: f64,
        reason: String,
    },

    #[error("numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    #[error("tree parse error: {0}")]
    TreeParse(#[from] crate::tree::newickparser::NewickParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LikelihoodError {
    pub fn configuration(message: impl Into<String>) -> LikelihoodError {
        LikelihoodError::Configuration(message.into())
    }

    pub fn degeneracy(message: impl Into<String>) -> LikelihoodError {
        LikelihoodError::NumericalDegeneracy(message.into())
    }

    /// 是否屬於「參數落在不可行區域」的錯誤：sampler 應把它視為 `-inf` 而非中止。
    pub fn is_evaluation_failure(&self) -> bool {
        matches!(
            self,
            LikelihoodError::IntegrationFailure { .. } | LikelihoodError::NumericalDegeneracy(_)
        )
    }
}

pub type LikelihoodResult<T> = Result<T, LikelihoodError>;
