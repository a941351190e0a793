//! Progress arithmetic.

use super::{Checkpoint, Step};

/// Clamp to `0..=100`; non-finite values become 0.
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Weighted completion of `plan` at `checkpoint`, mapped onto `0..=99`.
/// A chunked step in flight contributes its completed fraction.
pub fn plan_progress(plan: &[Step], checkpoint: &Checkpoint) -> f64 {
    let total: u32 = plan.iter().map(Step::weight).sum();
    if total == 0 {
        return 0.0;
    }

    let done_index = checkpoint.step_index.min(plan.len());
    let mut done: f64 = plan[..done_index].iter().map(|s| f64::from(s.weight())).sum();

    if let (Some(step), Some(total_files)) = (plan.get(done_index), checkpoint.file_total) {
        if total_files > 0 {
            let fraction = checkpoint.file_cursor.min(total_files) as f64 / total_files as f64;
            done += f64::from(step.weight()) * fraction;
        }
    }

    (99.0 * done / f64::from(total)).clamp(0.0, 99.0)
}
