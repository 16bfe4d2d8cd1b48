//! Long-running operation poller
//!
//! A 202 Accepted with an operation URL starts an operation in `Created`.
//! Each poll is a GET through the normal retrying pipeline; the phase is read
//! from the body and every poll's phase is appended to the history.
//!
//! Phase transitions:
//! - Created → Running (first poll still in progress)
//! - Running → Running (in progress, or 409 while the resource is busy)
//! - Created/Running → Succeeded | Failed | Canceled (terminal)
//! - Created/Running → TimedOut (maximum wait would be exceeded)

use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{Client, validate_url};
use crate::context::OperationContext;
use crate::error::{Error, Result};
use crate::metrics;
use crate::request::{ApiRequest, ApiResponse, PollDirective};
use crate::retry;

/// Statuses accepted while polling. 409 means the resource is busy.
const POLL_ACCEPTABLE: [u16; 5] = [200, 201, 202, 204, 409];

/// Lower bound for a server-suggested poll delay.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Headers carrying the operation URL, in order of preference.
const OPERATION_HEADERS: [&str; 3] = ["operation-location", "azure-asyncoperation", "location"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Created,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl OperationPhase {
    pub fn label(self) -> &'static str {
        match self {
            OperationPhase::Created => "created",
            OperationPhase::Running => "running",
            OperationPhase::Succeeded => "succeeded",
            OperationPhase::Failed => "failed",
            OperationPhase::Canceled => "canceled",
            OperationPhase::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationPhase::Created | OperationPhase::Running)
    }
}

/// A tracked server-side operation.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub url: String,
    pub phase: OperationPhase,
    pub retry_after: Option<Duration>,
    pub history: Vec<OperationPhase>,
}

impl OperationDescriptor {
    /// Start tracking from a 202 response. `None` when there is nothing to
    /// poll.
    pub fn from_accepted(response: &ApiResponse) -> Option<Self> {
        let url = OPERATION_HEADERS
            .iter()
            .find_map(|name| response.header(name))
            .map(str::to_string)?;
        Some(Self {
            url,
            phase: OperationPhase::Created,
            retry_after: retry::retry_after(response, SystemTime::now()),
            history: vec![OperationPhase::Created],
        })
    }

    fn advance(&mut self, phase: OperationPhase) {
        self.phase = phase;
        self.history.push(phase);
    }
}

/// Result of a call that may have gone through polling.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The final response: the last poll, or the original one if no polling
    /// happened
    pub response: ApiResponse,
    pub operation: Option<OperationDescriptor>,
}

/// Outcome of one poll as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    InProgress,
    Succeeded,
    Failed(String),
    Canceled,
}

/// Read the poll outcome from a status code and body.
///
/// Status is taken from `status`, `state.id`, `state` or
/// `properties.provisioningState`. Without one, 202 means in progress and
/// any other accepted code means done.
pub fn parse_status(status_code: u16, body: &[u8]) -> PollStatus {
    if status_code == 409 {
        return PollStatus::InProgress;
    }
    let json: Option<Value> = serde_json::from_slice(body).ok();
    let reported = json.as_ref().and_then(status_field);

    let Some(reported) = reported else {
        return if status_code == 202 {
            PollStatus::InProgress
        } else {
            PollStatus::Succeeded
        };
    };

    match reported.to_ascii_lowercase().as_str() {
        "succeeded" | "success" | "completed" | "complete" => PollStatus::Succeeded,
        "failed" | "failure" | "error" => {
            PollStatus::Failed(failure_message(json.as_ref(), body))
        }
        "canceled" | "cancelled" => PollStatus::Canceled,
        _ => PollStatus::InProgress,
    }
}

fn status_field(json: &Value) -> Option<&str> {
    json.get("status")
        .and_then(Value::as_str)
        .or_else(|| json.pointer("/state/id").and_then(Value::as_str))
        .or_else(|| json.get("state").and_then(Value::as_str))
        .or_else(|| {
            json.pointer("/properties/provisioningState")
                .and_then(Value::as_str)
        })
}

/// Server-provided failure detail, verbatim.
fn failure_message(json: Option<&Value>, raw: &[u8]) -> String {
    json.and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.pointer("/properties/error/message"))
            .or_else(|| v.get("error").filter(|e| e.is_string()))
            .or_else(|| v.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
    .unwrap_or_else(|| String::from_utf8_lossy(raw).into_owned())
}

impl Client {
    /// Poll an accepted operation until it reaches a terminal phase.
    pub(crate) async fn wait_for_operation(
        &self,
        ctx: &OperationContext,
        scopes: &[String],
        accepted: ApiResponse,
        directive: &PollDirective,
    ) -> Result<Completion> {
        let Some(mut operation) = OperationDescriptor::from_accepted(&accepted) else {
            warn!("202 without an operation URL, nothing to poll");
            return Ok(Completion {
                response: accepted,
                operation: None,
            });
        };
        let url = validate_url(&operation.url)?;

        let settings = self.lro_settings();
        let interval = directive
            .interval
            .unwrap_or(Duration::from_secs(settings.poll_interval_secs));
        let max_wait = directive
            .max_wait
            .unwrap_or(Duration::from_secs(settings.max_wait_secs));
        let cap = self.retry_policy().retry_after_cap();
        let started = Instant::now();

        let mut poll = ApiRequest::get(operation.url.clone()).accept(&POLL_ACCEPTABLE);
        poll.scopes = scopes.to_vec();

        info!(url = %operation.url, "waiting for long-running operation");
        loop {
            let delay = operation
                .retry_after
                .map_or(interval, |hint| hint.min(cap).max(MIN_POLL_INTERVAL));
            if started.elapsed() + delay > max_wait {
                return Err(timed_out(&mut operation, max_wait));
            }
            ctx.sleep(delay).await?;

            // A poll that keeps retrying may not outlive the maximum wait.
            let poll_ctx = ctx.child_with_timeout(max_wait.saturating_sub(started.elapsed()));
            let response = match self.send_with_retry(&poll_ctx, &poll, &url, None).await {
                Ok(response) => response,
                Err(Error::Timeout(_)) if ctx.check().is_ok() => {
                    return Err(timed_out(&mut operation, max_wait));
                }
                Err(e) => return Err(e),
            };
            let status = parse_status(response.status, &response.body);
            let phase = match status {
                PollStatus::InProgress => OperationPhase::Running,
                PollStatus::Succeeded => OperationPhase::Succeeded,
                PollStatus::Failed(_) => OperationPhase::Failed,
                PollStatus::Canceled => OperationPhase::Canceled,
            };
            operation.advance(phase);
            metrics::record_lro_poll(phase.label());
            debug!(url = %operation.url, http_status = response.status, phase = phase.label(), "polled operation");

            match status {
                PollStatus::Succeeded => {
                    info!(url = %operation.url, polls = operation.history.len() - 1, "operation succeeded");
                    return Ok(Completion {
                        response,
                        operation: Some(operation),
                    });
                }
                PollStatus::Failed(message) => {
                    warn!(url = %operation.url, "operation failed");
                    return Err(Error::OperationFailed { message });
                }
                PollStatus::Canceled => return Err(Error::OperationCanceled),
                PollStatus::InProgress => {
                    operation.retry_after = retry::retry_after(&response, SystemTime::now());
                }
            }
        }
    }
}

fn timed_out(operation: &mut OperationDescriptor, max_wait: Duration) -> Error {
    operation.advance(OperationPhase::TimedOut);
    metrics::record_lro_poll(OperationPhase::TimedOut.label());
    warn!(url = %operation.url, max_wait_secs = max_wait.as_secs(), "operation timed out");
    Error::Timeout(format!(
        "operation {} did not finish within {}s",
        operation.url,
        max_wait.as_secs()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DEFAULT_SAFETY_MARGIN, TokenCache};
    use crate::client::ClientOptions;
    use crate::testing::{CountingCredential, ManualClock, ScriptedTransport, response};
    use crate::transport::TransportResult;
    use std::sync::Arc;

    const SCOPE: &str = "https://service.powerapps.com/.default";
    const OP_URL: &str = "https://api.bap.microsoft.com/operations/op-1";
    const CREATE_URL: &str = "https://api.powerplatform.com/powerpages/environments/e1/websites";

    fn client(script: Vec<TransportResult>) -> (Client, Arc<ScriptedTransport>) {
        let clock = Arc::new(ManualClock::new(SystemTime::now()));
        let credential = Arc::new(CountingCredential::new(clock.clone(), 3600));
        let tokens = Arc::new(TokenCache::new(credential, clock, DEFAULT_SAFETY_MARGIN));
        let transport = Arc::new(ScriptedTransport::new(script));
        let client = Client::new(transport.clone(), tokens, ClientOptions::default()).unwrap();
        (client, transport)
    }

    fn accepted() -> TransportResult {
        response(202, "", &[("Location", OP_URL)])
    }

    fn create() -> ApiRequest {
        ApiRequest::post(CREATE_URL).scope(SCOPE)
    }

    #[test]
    fn status_field_variants() {
        assert_eq!(parse_status(200, br#"{"status":"Succeeded"}"#), PollStatus::Succeeded);
        assert_eq!(parse_status(200, br#"{"state":{"id":"Running"}}"#), PollStatus::InProgress);
        assert_eq!(
            parse_status(200, br#"{"properties":{"provisioningState":"Succeeded"}}"#),
            PollStatus::Succeeded
        );
        assert_eq!(parse_status(200, br#"{"status":"Cancelled"}"#), PollStatus::Canceled);
        assert_eq!(parse_status(202, b""), PollStatus::InProgress);
        assert_eq!(parse_status(200, br#"{"id":"x"}"#), PollStatus::Succeeded);
        assert_eq!(parse_status(204, b""), PollStatus::Succeeded);
        assert_eq!(parse_status(409, br#"{"status":"Failed"}"#), PollStatus::InProgress);
    }

    #[test]
    fn failure_message_is_verbatim() {
        let body = br#"{"status":"Failed","error":{"code":"X","message":"Quota exceeded for site creation."}}"#;
        assert_eq!(
            parse_status(200, body),
            PollStatus::Failed("Quota exceeded for site creation.".into())
        );
        assert_eq!(
            parse_status(200, br#"{"status":"Failed"}"#),
            PollStatus::Failed(r#"{"status":"Failed"}"#.into())
        );
    }

    #[test]
    fn operation_header_preference() {
        let resp = response(
            202,
            "",
            &[("Location", "https://a/loc"), ("Operation-Location", "https://a/op")],
        )
        .unwrap();
        let op = OperationDescriptor::from_accepted(&resp).unwrap();
        assert_eq!(op.url, "https://a/op");
        assert_eq!(op.phase, OperationPhase::Created);
        assert!(OperationDescriptor::from_accepted(&response(202, "", &[]).unwrap()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn running_running_succeeded() {
        let (client, transport) = client(vec![
            accepted(),
            response(202, r#"{"status":"Running"}"#, &[]),
            response(202, r#"{"status":"Running"}"#, &[]),
            response(200, r#"{"status":"Succeeded","id":"site-1"}"#, &[]),
        ]);

        let done = client
            .execute_and_wait(&OperationContext::background(), create())
            .await
            .unwrap();
        let op = done.operation.unwrap();
        assert_eq!(
            op.history,
            vec![
                OperationPhase::Created,
                OperationPhase::Running,
                OperationPhase::Running,
                OperationPhase::Succeeded
            ]
        );
        assert!(op.phase.is_terminal());
        assert_eq!(done.response.text(), r#"{"status":"Succeeded","id":"site-1"}"#);

        let sent = transport.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[1].method, reqwest::Method::GET);
        assert_eq!(sent[1].url.as_str(), OP_URL);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_surfaces_server_message() {
        let (client, _) = client(vec![
            accepted(),
            response(200, r#"{"status":"Running"}"#, &[]),
            response(
                200,
                r#"{"status":"Failed","error":{"message":"Website name is already taken."}}"#,
                &[],
            ),
        ]);
        let err = client
            .execute_and_wait(&OperationContext::background(), create())
            .await
            .unwrap_err();
        match err {
            Error::OperationFailed { message } => {
                assert_eq!(message, "Website name is already taken.")
            }
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_while_polling_is_transient() {
        let (client, _) = client(vec![
            accepted(),
            response(409, r#"{"error":{"code":"Conflict"}}"#, &[]),
            response(200, r#"{"status":"Succeeded"}"#, &[]),
        ]);
        let done = client
            .execute_and_wait(&OperationContext::background(), create())
            .await
            .unwrap();
        assert_eq!(
            done.operation.unwrap().history,
            vec![
                OperationPhase::Created,
                OperationPhase::Running,
                OperationPhase::Succeeded
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_by_service() {
        let (client, _) = client(vec![accepted(), response(200, r#"{"status":"Canceled"}"#, &[])]);
        let err = client
            .execute_and_wait(&OperationContext::background(), create())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationCanceled));
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_is_timeout() {
        let mut script = vec![accepted()];
        script.extend((0..100).map(|_| response(202, r#"{"status":"Running"}"#, &[])));
        let (client, transport) = client(script);

        let request = create().poll(PollDirective {
            interval: Some(Duration::from_secs(10)),
            max_wait: Some(Duration::from_secs(35)),
        });
        let start = Instant::now();
        let err = client
            .execute_and_wait(&OperationContext::background(), request)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
        assert!(start.elapsed() <= Duration::from_secs(35));
        // initial call + polls at 10s, 20s, 30s
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_poll_stops_at_max_wait() {
        let mut script = vec![accepted()];
        script.extend(
            (0..20).map(|_| response(503, "", &[("Retry-After", "100")])),
        );
        let (client, transport) = client(script);

        let request = create().poll(PollDirective {
            interval: Some(Duration::from_secs(10)),
            max_wait: Some(Duration::from_secs(35)),
        });
        let start = Instant::now();
        let err = client
            .execute_and_wait(&OperationContext::background(), request)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
        assert!(start.elapsed() <= Duration::from_secs(35));
        // initial call + one poll at 10s whose retry wait hits the limit
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retry_after_does_not_spin() {
        let mut script = vec![response(202, "", &[("Location", OP_URL), ("Retry-After", "0")])];
        script.extend(
            (0..50).map(|_| response(202, r#"{"status":"Running"}"#, &[("Retry-After", "0")])),
        );
        let (client, transport) = client(script);

        let request = create().poll(PollDirective {
            interval: Some(Duration::from_secs(10)),
            max_wait: Some(Duration::from_secs(5)),
        });
        let start = Instant::now();
        let err = client
            .execute_and_wait(&OperationContext::background(), request)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
        // polls at 1s..5s, one second apart
        assert_eq!(transport.calls(), 6);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn server_hint_sets_poll_interval() {
        let (client, _) = client(vec![
            response(202, "", &[("Location", OP_URL), ("Retry-After", "2")]),
            response(200, r#"{"status":"Succeeded"}"#, &[]),
        ]);
        let start = Instant::now();
        client
            .execute_and_wait(&OperationContext::background(), create())
            .await
            .unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_secs(5), "default interval used: {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_poll_wait_returns_promptly() {
        let (client, _) = client(vec![accepted(), response(200, r#"{"status":"Succeeded"}"#, &[])]);
        let ctx = OperationContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let err = client.execute_and_wait(&ctx, create()).await.unwrap_err();
        assert!(matches!(err, Error::Canceled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_with_directive_returns_final_body() {
        let (client, _) = client(vec![
            accepted(),
            response(200, r#"{"status":"Succeeded","name":"site"}"#, &[]),
        ]);
        let request = create().accept(&[202]).poll(PollDirective::default());
        let resp = client
            .execute(&OperationContext::background(), request)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.text().contains("\"site\""));
    }

    #[tokio::test]
    async fn poll_directive_accepts_202_without_explicit_status() {
        let (client, transport) = client(vec![
            accepted(),
            response(200, r#"{"status":"Succeeded","name":"site"}"#, &[]),
        ]);
        let resp = client
            .execute(&OperationContext::background(), create().poll(PollDirective::default()))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.text().contains("\"site\""));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn synchronous_completion_skips_polling() {
        let (client, transport) = client(vec![response(200, r#"{"id":"x"}"#, &[])]);
        let done = client
            .execute_and_wait(&OperationContext::background(), create())
            .await
            .unwrap();
        assert!(done.operation.is_none());
        assert_eq!(transport.calls(), 1);
    }
}
