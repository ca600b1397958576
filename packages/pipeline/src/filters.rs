//! Post-validation quality filters.

use occurrence_map_occurrence_models::{DataPoint, QualityFilters};

/// Returns `true` if `point` survives `filters`.
///
/// A point passes the accuracy filter when its uncertainty radius is at
/// most `min_accuracy` meters (lower is better), and the issue filter when
/// it carries none of the excluded codes.
#[must_use]
pub fn passes(point: &DataPoint, filters: &QualityFilters) -> bool {
    if let Some(max_radius) = filters.min_accuracy
        && point.accuracy > max_radius
    {
        return false;
    }

    filters
        .exclude_issue_codes
        .as_ref()
        .is_none_or(|codes| !codes.iter().any(|code| point.has_issue(code)))
}
