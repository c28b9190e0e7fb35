//! Custom assertion helpers over stored dimension history.

use std::collections::BTreeMap;

use strata_core::DimensionVersion;

/// Asserts that every natural key's history is contiguous.
///
/// For each key, versions ordered by `valid_from` must chain
/// `valid_to == next.valid_from`, exactly the last one must be open and
/// current, and no interval may be negative.
///
/// # Panics
///
/// Panics with the offending key and versions when the history is broken.
pub fn assert_history_contiguous(history: &[DimensionVersion]) {
    let mut by_key: BTreeMap<&str, Vec<&DimensionVersion>> = BTreeMap::new();
    for version in history {
        by_key.entry(&version.natural_key).or_default().push(version);
    }

    for (key, mut versions) in by_key {
        versions.sort_by_key(|v| v.history_order());
        for pair in versions.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            assert_eq!(
                prev.valid_to,
                Some(next.valid_from),
                "gap or overlap in {key}: {prev:?} then {next:?}"
            );
            assert!(!prev.is_current, "closed version of {key} marked current: {prev:?}");
        }
        for version in &versions {
            if let Some(to) = version.valid_to {
                assert!(to >= version.valid_from, "negative interval in {key}: {version:?}");
            }
        }
        let last = versions.last().expect("at least one version");
        assert!(
            last.is_current && last.valid_to.is_none(),
            "last version of {key} is not open and current: {last:?}"
        );
    }
}

/// Asserts the number of versions stored for one key.
///
/// # Panics
///
/// Panics when the count differs.
pub fn assert_version_count(history: &[DimensionVersion], natural_key: &str, expected: usize) {
    let actual = history.iter().filter(|v| v.natural_key == natural_key).count();
    assert_eq!(
        actual, expected,
        "expected {expected} versions of {natural_key}, found {actual}"
    );
}
