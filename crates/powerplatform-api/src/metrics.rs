//! Metric recording helpers
//!
//! Counters emitted by the request pipeline. Without an installed recorder
//! these are no-ops, so library users opt in by installing one.
//!
//! - `pp_api_requests_total` (counter): labels `method`, `status`
//! - `pp_api_retries_total` (counter): label `reason`
//! - `pp_token_refresh_total` (counter): labels `method`, `outcome`
//! - `pp_lro_polls_total` (counter): label `phase`

/// Record one HTTP attempt and its status.
pub fn record_request(method: &str, status: u16) {
    metrics::counter!(
        "pp_api_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a retry. `reason` is a status code or `transport`.
pub fn record_retry(reason: String) {
    metrics::counter!("pp_api_retries_total", "reason" => reason).increment(1);
}

pub fn record_token_refresh(method: &'static str, outcome: &'static str) {
    metrics::counter!("pp_token_refresh_total", "method" => method, "outcome" => outcome)
        .increment(1);
}

pub fn record_lro_poll(phase: &'static str) {
    metrics::counter!("pp_lro_polls_total", "phase" => phase).increment(1);
}
