//! Custom assertions for upload state

use granary_storage::models::parse_timing;
use granary_storage::UploadModel;

/// The status keys of the timings journal, in write order.
pub fn timing_statuses(upload: &UploadModel) -> Vec<String> {
    upload
        .timings
        .0
        .iter()
        .filter_map(|entry| entry.keys().next().cloned())
        .collect()
}

/// Assert that timings timestamps never go backwards.
pub fn assert_timings_non_decreasing(upload: &UploadModel) {
    let stamps: Vec<_> = upload
        .timings
        .0
        .iter()
        .map(|entry| parse_timing(entry).expect("timings entry parses"))
        .collect();
    for window in stamps.windows(2) {
        assert!(
            window[0] <= window[1],
            "timings went backwards: {:?} then {:?}",
            window[0],
            window[1]
        );
    }
}

/// Assert that a status label was journalled at least once.
pub fn assert_timing_present(upload: &UploadModel, status: &str) {
    assert!(
        timing_statuses(upload).iter().any(|s| s == status),
        "expected a timings entry for {:?}, got {:?}",
        status,
        timing_statuses(upload)
    );
}
