use edge_telemetry::{metrics, new_request_ids, record_batch_enqueued, record_connection_reset};

#[test]
fn request_ids_non_empty() {
    let ids = new_request_ids();
    assert!(!ids.request_id.is_empty());
    assert!(!ids.trace_id.is_empty());
    assert_ne!(ids.request_id, ids.trace_id);
}

#[test]
fn counters_are_monotonic() {
    let before = metrics().snapshot();
    record_batch_enqueued();
    record_connection_reset();
    let after = metrics().snapshot();
    assert!(after.batches_enqueued > before.batches_enqueued);
    assert!(after.connection_resets > before.connection_resets);
}
