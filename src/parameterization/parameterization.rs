use nalgebra::DMatrix;

use crate::math::curve::curve::locate_segment;

/// 多型 birth-death-migration 模型的分段常數參數化。
///
/// 時間軸 [0, T] 被切成 `interval_count()` 個 interval，`interval_end_times()[i]`
/// 為第 i 個 interval 的結束時間，最後一個等於 T。每個 interval 內所有速率為常數；
/// `rho_values(i)` 為在第 i 個 interval 結束時刻發生的 rho sampling 機率。
pub trait Parameterization: Send + Sync {
    fn type_count(&self) -> usize;

    fn total_process_length(&self) -> f64;

    fn interval_end_times(&self) -> &[f64];

    fn birth_rates(&self, interval: usize) -> &[f64];

    fn death_rates(&self, interval: usize) -> &[f64];

    fn sampling_rates(&self, interval: usize) -> &[f64];

    fn removal_probs(&self, interval: usize) -> &[f64];

    fn rho_values(&self, interval: usize) -> &[f64];

    /// (i, j) 為 type i → j 的遷移速率，對角線為 0。
    fn migration_rates(&self, interval: usize) -> &DMatrix<f64>;

    /// (i, j) 為 type i 產生 type j 子代的速率，對角線為 0。
    fn cross_birth_rates(&self, interval: usize) -> &DMatrix<f64>;

    fn interval_count(&self) -> usize {
        self.interval_end_times().len()
    }

    fn interval_start_time(&self, interval: usize) -> f64 {
        if interval == 0 { 0.0 } else { self.interval_end_times()[interval - 1] }
    }

    /// 擁有時間 `t` 的 interval；邊界時間屬於在該處結束的 interval。
    fn interval_index(&self, t: f64) -> usize {
        locate_segment(self.interval_end_times(), t).index
    }

    /// 節點高度轉成 process 時間：t = T - (height + final_sample_offset)。
    fn node_time(&self, height: f64, final_sample_offset: f64) -> f64 {
        self.total_process_length() - (height + final_sample_offset)
    }
}
