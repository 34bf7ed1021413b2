/*!
The single-user OAuth token lifecycle: authorization-code exchange,
on-demand refresh, and the per-request resolver that decides whether a
usable access token exists.
*/
use std::sync::Arc;

use async_mutex::Mutex;

use crate::errors::{Error, Result};
use crate::models::{Credential, CredentialUpdate, NewCredential};
use crate::spotify::{Access, SpotifyApi};
use crate::store::TokenStore;
use crate::LOG;

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_from_now(access: &Access) -> i64 {
    now_millis() + (access.expires_in as i64) * 1000
}

#[derive(Clone)]
pub struct Tokens {
    store: TokenStore,
    api: Arc<dyn SpotifyApi>,
    // serializes the read -> decide -> write sequence so two concurrent
    // requests that both observe an expired credential can't both spend
    // the refresh token. Spotify may honor only the first exchange.
    refresh_lock: Arc<Mutex<()>>,
}

impl Tokens {
    pub fn new(store: TokenStore, api: Arc<dyn SpotifyApi>) -> Self {
        Self {
            store,
            api,
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Whether a credential is stored at all. Presence only; expiry is the
    /// resolver's concern.
    pub async fn is_authenticated(&self) -> Result<bool> {
        Ok(self.store.get().await?.is_some())
    }

    /// Turn a one-time authorization code into a persisted credential.
    /// This is the only path that creates one. Upstream rejection
    /// propagates to the caller as `Error::UpstreamAuth`.
    pub async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let access = self.api.exchange_code(code).await?;
        let refresh_token = access.refresh_token.clone().ok_or_else(|| {
            Error::UpstreamData("token response missing refresh_token".to_string())
        })?;
        let expires_at = expiry_from_now(&access);
        let cred = self
            .store
            .save(NewCredential {
                access_token: access.access_token,
                refresh_token,
                expires_at,
            })
            .await?;
        slog::info!(LOG, "stored new spotify credential"; "expires_at" => expires_at);
        Ok(cred)
    }

    /// Resolve an access token for this request, refreshing if the stored
    /// credential has expired. `Error::NotConnected` means either nothing
    /// is stored or the refresh failed; the stale row is left in place
    /// until a fresh login supersedes it.
    pub async fn require_access_token(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        let cred = match self.store.get().await? {
            None => return Err(Error::NotConnected),
            Some(c) => c,
        };
        if now_millis() < cred.expires_at {
            return Ok(cred.access_token);
        }
        slog::info!(LOG, "access token expired, refreshing"; "credential" => &cred.id);
        match self.refresh(&cred).await {
            Some(fresh) => Ok(fresh.access_token),
            None => Err(Error::NotConnected),
        }
    }

    /// Exchange the stored refresh token for a new access token. Soft
    /// failure: upstream or storage errors are logged and yield `None`,
    /// they never propagate past the resolver.
    async fn refresh(&self, cred: &Credential) -> Option<Credential> {
        let access = match self.api.refresh(&cred.refresh_token).await {
            Ok(a) => a,
            Err(e) => {
                slog::error!(LOG, "error refreshing access token: {}", e);
                return None;
            }
        };
        let update = CredentialUpdate {
            access_token: Some(access.access_token.clone()),
            // spotify may omit a new refresh token, keep the old one
            refresh_token: access.refresh_token.clone(),
            expires_at: Some(expiry_from_now(&access)),
        };
        // keyed on the row id read under the same lock, never a cached id
        match self.store.update(&cred.id, update).await {
            Ok(Some(fresh)) => Some(fresh),
            Ok(None) => {
                slog::error!(LOG, "credential superseded during refresh"; "credential" => &cred.id);
                None
            }
            Err(e) => {
                slog::error!(LOG, "error persisting refreshed credential: {}", e);
                None
            }
        }
    }
}
