use serde::{
    Deserialize,
    Serialize
};

// ─────────────────────────────────────────────────────────────────────────────
// IntegrationDirection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationDirection {
    /// origin → present，t 遞增。
    Forward,
    /// present → origin，t 遞減。
    Backward,
}

// ─────────────────────────────────────────────────────────────────────────────
// IntervalOdeSystem
// ─────────────────────────────────────────────────────────────────────────────

/// 分段常數係數的一階 ODE 系統 y' = f(interval, t, y)。
///
/// interval index 由呼叫端明確傳入，系統本身不保存「目前 interval」的可變狀態，
/// 因此同一個系統可同時被多條執行緒使用。
pub trait IntervalOdeSystem: Send + Sync {
    fn dimension(&self) -> usize;

    fn derivatives(&self, interval: usize, t: f64, y: &[f64], y_dot: &mut [f64]);

    /// 進入 `interval` 之前，在其起始邊界（依積分方向）對狀態做的修正，
    /// 例如 rho sampling 的 `e_i *= 1 - rho_i`。預設不做任何事。
    fn boundary_correction(&self, _interval: usize, _y: &mut [f64]) {}
}
