use crate::config::Config;
use crate::errors::{Error, Result};

const ACCOUNTS_URL: &str = "https://accounts.spotify.com";
const API_URL: &str = "https://api.spotify.com";

/// Scopes needed for the player read endpoints.
const SCOPES: &str = "user-read-recently-played user-read-playback-state user-read-currently-playing";

/// Page size for the recently-played proxy.
pub const RECENTLY_PLAYED_LIMIT: u32 = 20;

/// Spotify's token endpoint response for both the authorization-code
/// exchange and a refresh. `refresh_token` may be omitted on refresh,
/// meaning the existing one stays valid.
#[derive(serde::Deserialize, Debug, Clone)]
pub struct Access {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(serde::Serialize)]
struct AccessParams {
    grant_type: String,
    code: String,
    redirect_uri: String,
}

impl AccessParams {
    fn from_code(code: &str, redirect_uri: &str) -> Self {
        AccessParams {
            grant_type: "authorization_code".to_string(),
            code: code.to_string(),
            // spotify requires the exact uri that was used to obtain the code
            redirect_uri: redirect_uri.to_string(),
        }
    }
}

#[derive(serde::Serialize)]
struct RefreshParams {
    grant_type: String,
    refresh_token: String,
}

impl RefreshParams {
    fn from_token(token: &str) -> Self {
        RefreshParams {
            grant_type: "refresh_token".to_string(),
            refresh_token: token.to_string(),
        }
    }
}

/// The authorization url the browser is sent to for the consent flow.
pub fn authorize_url(config: &Config, state: &str) -> String {
    format!(
        "{accounts}/authorize?client_id={id}&response_type=code&redirect_uri={redirect}&scope={scope}&state={state}",
        accounts = ACCOUNTS_URL,
        id = config.spotify_client_id,
        redirect = config.redirect_uri(),
        scope = SCOPES,
        state = state,
    )
}

/// Everything the token lifecycle and the proxy endpoints need from
/// spotify. The player calls return raw json, shaped later by
/// `crate::tracks` so upstream oddities stay in one place.
#[async_trait::async_trait]
pub trait SpotifyApi: Send + Sync + 'static {
    async fn exchange_code(&self, code: &str) -> Result<Access>;
    async fn refresh(&self, refresh_token: &str) -> Result<Access>;
    async fn currently_playing(&self, access_token: &str) -> Result<Option<serde_json::Value>>;
    async fn recently_played(&self, access_token: &str) -> Result<serde_json::Value>;
}

pub struct Spotify {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl Spotify {
    pub fn new(config: &Config) -> Self {
        Self {
            client_id: config.spotify_client_id.clone(),
            client_secret: config.spotify_client_secret.clone(),
            redirect_uri: config.redirect_uri(),
        }
    }

    fn basic_auth(&self) -> String {
        base64::encode(format!("{}:{}", self.client_id, self.client_secret).as_bytes())
    }

    async fn token_request(&self, body: surf::Body) -> Result<Access> {
        let mut resp = surf::post(format!("{}/api/token", ACCOUNTS_URL))
            .body(body)
            .header("authorization", format!("Basic {}", self.basic_auth()))
            .send()
            .await
            .map_err(|e| Error::UpstreamAuth(format!("token request error {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::UpstreamAuth(
                resp.status().canonical_reason().to_string(),
            ));
        }
        resp.body_json()
            .await
            .map_err(|e| Error::UpstreamAuth(format!("token response parse error {}", e)))
    }
}

#[async_trait::async_trait]
impl SpotifyApi for Spotify {
    async fn exchange_code(&self, code: &str) -> Result<Access> {
        let body = surf::Body::from_form(&AccessParams::from_code(code, &self.redirect_uri))
            .map_err(|e| Error::UpstreamAuth(format!("form error {}", e)))?;
        self.token_request(body).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Access> {
        let body = surf::Body::from_form(&RefreshParams::from_token(refresh_token))
            .map_err(|e| Error::UpstreamAuth(format!("form error {}", e)))?;
        self.token_request(body).await
    }

    async fn currently_playing(&self, access_token: &str) -> Result<Option<serde_json::Value>> {
        let mut resp = surf::get(format!("{}/v1/me/player/currently-playing", API_URL))
            .header("authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| Error::UpstreamTimeout(format!("currently playing request error {}", e)))?;
        // 204 means nothing is playing
        if resp.status() == surf::StatusCode::NoContent {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::UpstreamData(format!(
                "currently playing failed: {}",
                resp.status().canonical_reason()
            )));
        }
        let payload: serde_json::Value = resp
            .body_json()
            .await
            .map_err(|e| Error::UpstreamData(format!("currently playing json error {}", e)))?;
        Ok(Some(payload))
    }

    async fn recently_played(&self, access_token: &str) -> Result<serde_json::Value> {
        let mut resp = surf::get(format!(
            "{}/v1/me/player/recently-played?limit={}",
            API_URL, RECENTLY_PLAYED_LIMIT
        ))
        .header("authorization", format!("Bearer {}", access_token))
        .send()
        .await
        .map_err(|e| Error::UpstreamTimeout(format!("recently played request error {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::UpstreamData(format!(
                "recently played failed: {}",
                resp.status().canonical_reason()
            )));
        }
        resp.body_json()
            .await
            .map_err(|e| Error::UpstreamData(format!("recently played json error {}", e)))
    }
}
