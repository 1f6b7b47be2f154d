use std::ops::Range;

/// Deterministically partition `total` specs across `workers`, handing
/// worker `index` (1-based) a contiguous range of the assembled spec
/// sequence. Repeated runs with the same inputs produce the same
/// partition; this is for reproducibility, not load balancing.
///
/// # Panics
///
/// Panics when `workers` is zero or `index` is outside `1..=workers`.
pub fn partition_range(total: usize, workers: usize, index: usize) -> Range<usize> {
    assert!(workers >= 1, "worker count must be at least 1");
    assert!(
        (1..=workers).contains(&index),
        "worker index {index} outside 1..={workers}"
    );
    let base = total / workers;
    let remainder = total % workers;
    let zero_based = index - 1;
    let start = zero_based * base + zero_based.min(remainder);
    let len = base + usize::from(zero_based < remainder);
    start..(start + len)
}
