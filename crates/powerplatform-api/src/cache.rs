//! Token cache with single-flight refresh
//!
//! Tokens are keyed by the normalized scope set. Each key owns an async mutex
//! slot: the first caller to find the slot stale refreshes while holding the
//! lock, later callers queue on the same lock and then find the fresh token.
//! The map of slots sits behind a std mutex held only long enough to look up
//! or insert a slot, so unrelated scopes never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use powerplatform_auth::{AccessToken, TokenCredential};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::context::OperationContext;
use crate::error::{Error, Result};
use crate::metrics;

/// Tokens are refreshed this long before they expire.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

type Slot = Arc<tokio::sync::Mutex<Option<AccessToken>>>;

/// Normalize a scope list into a cache key: trimmed, lower-cased, sorted,
/// de-duplicated.
pub fn scope_key(scopes: &[String]) -> String {
    let mut normalized: Vec<String> = scopes
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized.join(" ")
}

pub struct TokenCache {
    credential: Arc<dyn TokenCredential>,
    clock: Arc<dyn Clock>,
    safety_margin: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("credential", &self.credential.kind())
            .field("safety_margin", &self.safety_margin)
            .finish()
    }
}

impl TokenCache {
    pub fn new(
        credential: Arc<dyn TokenCredential>,
        clock: Arc<dyn Clock>,
        safety_margin: Duration,
    ) -> Self {
        Self {
            credential,
            clock,
            safety_margin,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_string()).or_default().clone()
    }

    fn is_fresh(&self, token: &AccessToken) -> bool {
        self.clock.now() + self.safety_margin < token.expires_on
    }

    /// Cached token for `scopes`, refreshing it first if stale.
    pub async fn get_or_refresh(
        &self,
        ctx: &OperationContext,
        scopes: &[String],
    ) -> Result<AccessToken> {
        let key = checked_key(scopes)?;
        let slot = self.slot(&key);
        let mut cached = ctx.run(async { Ok(slot.lock().await) }).await?;

        if let Some(token) = cached.as_ref()
            && self.is_fresh(token)
        {
            return Ok(token.clone());
        }

        let token = self.acquire(ctx, &key, scopes, "expired").await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Replace a token the service just rejected.
    ///
    /// If another caller already swapped it out, the newer token is returned
    /// without another round trip to the identity platform.
    pub async fn refresh_rejected(
        &self,
        ctx: &OperationContext,
        scopes: &[String],
        rejected: &AccessToken,
    ) -> Result<AccessToken> {
        let key = checked_key(scopes)?;
        let slot = self.slot(&key);
        let mut cached = ctx.run(async { Ok(slot.lock().await) }).await?;

        if let Some(current) = cached.as_ref()
            && current.token.expose() != rejected.token.expose()
            && self.is_fresh(current)
        {
            debug!(scopes = %key, "rejected token already replaced");
            return Ok(current.clone());
        }

        *cached = None;
        let token = self.acquire(ctx, &key, scopes, "rejected").await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token for `scopes`.
    pub async fn invalidate(&self, scopes: &[String]) {
        let key = scope_key(scopes);
        let slot = self.slot(&key);
        *slot.lock().await = None;
        debug!(scopes = %key, "token invalidated");
    }

    async fn acquire(
        &self,
        ctx: &OperationContext,
        key: &str,
        scopes: &[String],
        reason: &'static str,
    ) -> Result<AccessToken> {
        let kind = self.credential.kind().label();
        let result = ctx
            .run(async { self.credential.get_token(scopes).await.map_err(Error::from) })
            .await;
        match result {
            Ok(token) => {
                metrics::record_token_refresh(kind, "success");
                info!(method = kind, scopes = %key, reason, "access token refreshed");
                Ok(token)
            }
            Err(e) => {
                metrics::record_token_refresh(kind, "failure");
                Err(e)
            }
        }
    }
}

fn checked_key(scopes: &[String]) -> Result<String> {
    let key = scope_key(scopes);
    if key.is_empty() {
        return Err(Error::Configuration(
            "at least one scope is required to acquire a token".into(),
        ));
    }
    Ok(key)
}
