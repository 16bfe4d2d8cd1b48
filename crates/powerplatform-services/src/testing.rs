//! Test doubles for the service client tests

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use common::{Cloud, CloudConfig, RetrySettings};
use powerplatform_api::{
    ApiResponse, Client, ClientOptions, HttpRequest, SystemClock, TokenCache, Transport,
    TransportError,
};
use powerplatform_auth::{AccessToken, CredentialKind, TokenCredential};
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// Credential returning one long-lived token per scope set.
pub struct StaticCredential;

impl TokenCredential for StaticCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::ClientSecret
    }

    fn get_token<'a>(
        &'a self,
        scopes: &'a [String],
    ) -> Pin<Box<dyn Future<Output = powerplatform_auth::Result<AccessToken>> + Send + 'a>>
    {
        Box::pin(async move {
            Ok(AccessToken::new(
                "test-token".to_string(),
                SystemTime::now() + Duration::from_secs(3600),
                scopes.to_vec(),
            ))
        })
    }
}

struct Route {
    method: Method,
    path: String,
    responses: VecDeque<ApiResponse>,
    last: Option<ApiResponse>,
}

/// Transport answering by method and URL path. Each route replays its
/// responses in order and then keeps repeating the last one.
#[derive(Default)]
pub struct RoutedTransport {
    routes: Mutex<Vec<Route>>,
    sent: Mutex<Vec<HttpRequest>>,
}

impl RoutedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, method: Method, path: &str, responses: Vec<ApiResponse>) -> Self {
        self.routes.lock().unwrap().push(Route {
            method,
            path: path.to_string(),
            responses: responses.into(),
            last: None,
        });
        self
    }

    pub fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, method: &Method, path: &str) -> Vec<HttpRequest> {
        self.sent()
            .into_iter()
            .filter(|r| &r.method == method && r.url.path() == path)
            .collect()
    }
}

impl Transport for RoutedTransport {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let path = request.url.path().to_string();
            let method = request.method.clone();
            self.sent.lock().unwrap().push(request);

            let mut routes = self.routes.lock().unwrap();
            let route = routes
                .iter_mut()
                .find(|r| r.method == method && r.path == path);
            match route {
                Some(route) => {
                    if let Some(next) = route.responses.pop_front() {
                        route.last = Some(next.clone());
                        Ok(next)
                    } else {
                        route.last.clone().ok_or_else(|| TransportError {
                            message: format!("no response scripted for {method} {path}"),
                            retryable: false,
                        })
                    }
                }
                None => Ok(json(404, r#"{"error":{"code":"NotFound"}}"#)),
            }
        })
    }
}

pub fn json(status: u16, body: &str) -> ApiResponse {
    with_headers(status, body, &[])
}

pub fn with_headers(status: u16, body: &str, headers: &[(&str, &str)]) -> ApiResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    ApiResponse::new(status, map, Bytes::copy_from_slice(body.as_bytes()))
}

pub fn cloud() -> CloudConfig {
    Cloud::Public.endpoints()
}

/// Client over `transport` with fast, jitter-free retries.
pub fn client(transport: Arc<RoutedTransport>) -> Arc<Client> {
    let tokens = Arc::new(TokenCache::new(
        Arc::new(StaticCredential),
        Arc::new(SystemClock),
        powerplatform_api::DEFAULT_SAFETY_MARGIN,
    ));
    let options = ClientOptions {
        retry: RetrySettings {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_secs: 1,
            jitter_fraction: 0.0,
            ..RetrySettings::default()
        },
        ..ClientOptions::default()
    };
    Arc::new(Client::new(transport, tokens, options).unwrap())
}

/// BAPI environment payload with a linked Dataverse instance.
pub fn environment_body(id: &str, instance_url: Option<&str>) -> String {
    let linked = match instance_url {
        Some(url) => format!(
            r#","linkedEnvironmentMetadata":{{"instanceUrl":"{url}","domainName":"contoso","version":"9.2.24021.00205"}}"#
        ),
        None => String::new(),
    };
    format!(
        r#"{{"id":"/providers/Microsoft.BusinessAppPlatform/environments/{id}","name":"{id}","location":"unitedstates","properties":{{"displayName":"Contoso","environmentSku":"Sandbox"{linked}}}}}"#
    )
}
