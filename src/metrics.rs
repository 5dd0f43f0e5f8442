use metrics::{counter, gauge, histogram};
use std::time::Instant;

pub fn record_query_executed(query: &str) {
    counter!("queries_executed_total", "query" => query.to_string()).increment(1);
}

pub fn record_query_error(kind: &'static str) {
    counter!("query_errors_total", "kind" => kind).increment(1);
}

pub fn record_query_duration(query: &str, start: Instant) {
    let duration = start.elapsed().as_secs_f64();
    histogram!("query_duration_seconds", "query" => query.to_string()).record(duration);
}

pub fn record_autotest_passed() {
    counter!("autotest_passed_total").increment(1);
}

pub fn record_autotest_failed() {
    counter!("autotest_failed_total").increment(1);
}

pub fn set_active_sessions(count: usize) {
    gauge!("active_sessions").set(count as f64);
}

pub fn record_session_created() {
    counter!("sessions_created_total").increment(1);
}

pub fn record_session_destroyed() {
    counter!("sessions_destroyed_total").increment(1);
}

pub fn record_sessions_swept(count: usize) {
    counter!("sessions_swept_total").increment(count as u64);
}
