use tracing::warn;

use crate::math::special::TIME_TOLERANCE;

/// 查詢時間落在哪一段，以及實際用來求值的（clamp 後）時間。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentLocation {
    pub index: usize,
    pub time: f64,
}

/// 在遞增的 `end_times` 中找出擁有 `t` 的 segment。
///
/// 邊界上的時間屬於在該處結束的 segment（`t <= end`）。超出 [0, T] 的查詢
/// clamp 到最近的端點；超出量大於時間容差時記錄 warning。
pub fn locate_segment(end_times: &[f64], t: f64) -> SegmentLocation {
    let last = end_times.len().saturating_sub(1);
    let total = end_times.last().copied().unwrap_or(0.0);

    let time = if t < 0.0 {
        if t < -TIME_TOLERANCE {
            warn!(time = t, "query before the process start, clamping to 0");
        }
        0.0
    } else if t > total {
        if t > total + TIME_TOLERANCE {
            warn!(time = t, end = total, "query after the process end, clamping");
        }
        total
    } else {
        t
    };

    let index = end_times
        .partition_point(|end| *end < time - TIME_TOLERANCE)
        .min(last);
    SegmentLocation { index, time }
}

/// 由多段 interval 串接而成、定義在 [0, T] 上的函數。
pub trait PiecewiseCurve {
    type Output;

    fn end_times(&self) -> &[f64];

    fn segment_value(&self, segment: usize, t: f64) -> Self::Output;

    fn value(&self, t: f64) -> Self::Output {
        let location = locate_segment(self.end_times(), t);
        self.segment_value(location.index, location.time)
    }
}
