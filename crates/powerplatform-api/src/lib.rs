//! Request pipeline for Power Platform APIs
//!
//! Everything a service client needs to talk to BAPI, Dataverse or the Power
//! Platform API: bearer tokens from a single-flight cache, `https`-only
//! requests with the standard headers, bounded retries, and polling of
//! long-running operations.
//!
//! Call lifecycle:
//! 1. Service client builds an `ApiRequest` (method, URL, scopes, body,
//!    acceptable statuses)
//! 2. `Client::execute` gets a token from `TokenCache::get_or_refresh`
//! 3. Response classified: accept, retry (429/5xx/transport), refresh on 401
//!    or fail with `UnexpectedStatus`
//! 4. A 202 with a poll directive is followed until a terminal phase
//!
//! All waits go through `OperationContext`, so cancellation and per-operation
//! deadlines end retries and polls immediately.

pub mod cache;
pub mod client;
pub mod clock;
pub mod context;
pub mod error;
pub mod lro;
pub mod metrics;
pub mod request;
pub mod retry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use cache::{DEFAULT_SAFETY_MARGIN, TokenCache, scope_key};
pub use client::{Client, ClientOptions, DEFAULT_USER_AGENT, validate_url};
pub use clock::{Clock, SystemClock};
pub use context::{OperationContext, OperationKind};
pub use error::{Error, Result};
pub use lro::{Completion, OperationDescriptor, OperationPhase, PollStatus, parse_status};
pub use request::{ApiRequest, ApiResponse, PollDirective};
pub use retry::{Disposition, RETRYABLE_STATUSES, RetryPolicy, classify};
pub use transport::{HttpRequest, ReqwestTransport, Transport, TransportError, TransportResult};
