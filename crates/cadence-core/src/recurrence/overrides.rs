use chrono::Duration;
use tracing::warn;

use super::Recurrable;
use crate::models::SeriesException;

/// Returns a copy of `instance` with the exception's overrides applied.
///
/// Fields absent from the override keep the instance's values. See
/// [`apply_patch`] for how time fields interact.
pub fn apply_override<T: Recurrable>(instance: &T, exception: &SeriesException<T::Patch>) -> T {
    apply_patch(instance, &exception.overrides)
}

/// Applies a sparse patch to an instance.
///
/// Moving only the start keeps the instance's duration. An end that lands
/// before the resulting start is clamped to the start.
pub fn apply_patch<T: Recurrable>(instance: &T, patch: &T::Patch) -> T {
    let mut item = instance.clone();
    item.apply_fields(patch);

    let (start, end) = T::patch_span(patch);
    if start.is_none() && end.is_none() {
        return item;
    }

    let duration = non_negative(instance.duration());
    let new_start = start.unwrap_or_else(|| instance.start_at());
    let new_end = match (start, end) {
        (_, Some(end)) => end,
        (Some(start), None) => start + duration,
        (None, None) => instance.end_at(),
    };

    let new_end = if new_end < new_start {
        warn!(
            series_id = %instance.id(),
            start = %new_start,
            end = %new_end,
            "Override ends before it starts; clamping end to start"
        );
        new_start
    } else {
        new_end
    };

    item.set_span(new_start, new_end);
    item
}

/// Occurrence duration used during expansion; negative spans collapse to zero.
pub(crate) fn occurrence_duration<T: Recurrable>(series: &T) -> Duration {
    let duration = series.duration();
    if duration < Duration::zero() {
        warn!(
            series_id = %series.id(),
            start = %series.start_at(),
            end = %series.end_at(),
            "Series ends before it starts; treating occurrences as zero-length"
        );
    }
    non_negative(duration)
}

#[inline]
fn non_negative(duration: Duration) -> Duration {
    duration.max(Duration::zero())
}
