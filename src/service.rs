use std::sync::Arc;

use async_mutex::Mutex;
use cached::stores::TimedCache;
use cached::Cached;

use crate::config::Config;
use crate::errors::Error;
use crate::spotify::{self, SpotifyApi};
use crate::tokens::Tokens;
use crate::{se, tracks, LOG};

const STATE_COOKIE: &str = "spotify_oauth_state";
const STATE_LIFESPAN_SECONDS: u64 = 600;

lazy_static::lazy_static! {
    // One-time state tokens handed out by the login endpoint. Entries
    // expire with the state cookie so an abandoned login attempt can't
    // be replayed later.
    static ref STATE_KEYS: Arc<Mutex<TimedCache<String, ()>>> =
        Arc::new(Mutex::new(TimedCache::with_lifespan(STATE_LIFESPAN_SECONDS)));
}

#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub tokens: Tokens,
    pub spotify: Arc<dyn SpotifyApi>,
}

macro_rules! resp {
    (json => $body:expr) => {
        tide::Response::builder(200)
            .body(tide::Body::from_json(&$body)?)
            .build()
    };
    (status => $status:expr, json => $body:expr) => {
        tide::Response::builder($status).body($body).build()
    };
}

pub fn app(ctx: Context) -> tide::Server<Context> {
    let mut app = tide::with_state(ctx);
    app.at("/api/status").get(status);
    app.at("/api/auth/spotify/login").get(login);
    app.at("/api/auth/spotify/callback").get(auth_callback);
    app.at("/api/auth/spotify/status").get(auth_status);
    app.at("/api/spotify/currently-playing").get(currently_playing);
    app.at("/api/spotify/recently-played").get(recently_played);
    app.with(crate::logging::LogMiddleware::new());
    app
}

pub async fn start(ctx: Context) -> crate::errors::Result<()> {
    let addr = ctx.config.host();
    slog::info!(LOG, "running at {}", addr);
    app(ctx)
        .listen(addr)
        .await
        .map_err(|e| se!("server error {}", e))?;
    Ok(())
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &req.state().config.version,
    }))
}

async fn new_state_token() -> String {
    let s = uuid::Uuid::new_v4().simple().to_string();
    let mut lock = STATE_KEYS.lock().await;
    lock.cache_set(s.clone(), ());
    s
}

async fn consume_state_token(s: &str) -> bool {
    let mut lock = STATE_KEYS.lock().await;
    lock.cache_remove(&s.to_string()).is_some()
}

fn state_cookie(value: &str, max_age: u64) -> String {
    // Lax rather than Strict: the callback is a cross-site navigation
    // from the spotify consent page, a Strict cookie would never be sent
    format!(
        "{}={}; HttpOnly; Secure; SameSite=Lax; Max-Age={}; Path=/",
        STATE_COOKIE, value, max_age
    )
}

#[derive(serde::Serialize)]
struct LoginResponse {
    #[serde(rename = "authUrl")]
    auth_url: String,
}

/// Hand the page a spotify consent url and pin the CSRF state to the
/// browser with a short-lived cookie.
async fn login(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let state = new_state_token().await;
    let auth_url = spotify::authorize_url(&ctx.config, &state);
    slog::info!(LOG, "redirecting to spotify consent"; "state" => &state);
    let mut resp: tide::Response = resp!(json => LoginResponse { auth_url });
    resp.insert_header("set-cookie", state_cookie(&state, STATE_LIFESPAN_SECONDS));
    Ok(resp)
}

#[derive(Debug, serde::Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

fn redirect(app_url: &str, query: &str, clear_state: bool) -> tide::Response {
    let mut resp: tide::Response =
        tide::Redirect::new(format!("{}/?{}", app_url, query)).into();
    if clear_state {
        resp.insert_header("set-cookie", state_cookie("", 0));
    }
    resp
}

/// Spotify sends the browser back here with `code` and `state` query
/// parameters. `state` has to match both the login cookie and the
/// server-side one-time token before any exchange is attempted; the
/// cookie is cleared once validation passes, whatever the exchange
/// outcome. Failures all land back on the page as query parameters.
async fn auth_callback(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let app_url = ctx.config.app_url();
    let params: CallbackParams = req.query().map_err(|e| se!("query parse error {}", e))?;

    if let Some(error) = params.error {
        slog::error!(LOG, "spotify auth error: {}", error);
        return Ok(redirect(&app_url, "error=auth_failed", false));
    }

    let cookie_state = req.cookie(STATE_COOKIE).map(|c| c.value().to_string());
    let valid = match (&params.state, &cookie_state) {
        (Some(state), Some(cookie)) if state == cookie => consume_state_token(state).await,
        _ => false,
    };
    if !valid {
        slog::error!(
            LOG, "invalid oauth state";
            "state" => params.state.as_deref().unwrap_or(""),
        );
        return Ok(redirect(&app_url, "error=invalid_state", false));
    }

    let code = match params.code {
        Some(code) => code,
        None => return Ok(redirect(&app_url, "error=no_code", true)),
    };
    match ctx.tokens.exchange_code(&code).await {
        Ok(_) => Ok(redirect(&app_url, "success=connected", true)),
        Err(e) => {
            slog::error!(LOG, "error exchanging code for token: {}", e);
            Ok(redirect(&app_url, "error=token_exchange_failed", true))
        }
    }
}

#[derive(serde::Serialize)]
struct AuthStatus {
    authenticated: bool,
}

async fn auth_status(req: tide::Request<Context>) -> tide::Result {
    let authenticated = req.state().tokens.is_authenticated().await?;
    Ok(resp!(json => AuthStatus { authenticated }))
}

fn not_connected() -> tide::Response {
    resp!(status => 401, json => serde_json::json!({
        "error": "not_connected",
        "message": "Please connect your Spotify account first",
    }))
}

/// The owner's currently-playing track, or `null` when nothing is
/// playing. Upstream failures degrade to `null` rather than erroring
/// the widget.
async fn currently_playing(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let access_token = match ctx.tokens.require_access_token().await {
        Ok(token) => token,
        Err(Error::NotConnected) => return Ok(not_connected()),
        Err(e) => return Err(e.into()),
    };
    let payload = match ctx.spotify.currently_playing(&access_token).await {
        Ok(payload) => payload,
        Err(e) => {
            slog::error!(LOG, "error fetching currently playing: {}", e);
            None
        }
    };
    let track = payload.as_ref().and_then(tracks::current_track);
    Ok(resp!(json => track))
}

/// The owner's last tracks, newest first, at most 20. Best-effort: any
/// upstream failure yields an empty list, never fabricated data.
async fn recently_played(req: tide::Request<Context>) -> tide::Result {
    let ctx = req.state();
    let access_token = match ctx.tokens.require_access_token().await {
        Ok(token) => token,
        Err(Error::NotConnected) => return Ok(not_connected()),
        Err(e) => return Err(e.into()),
    };
    let tracks = match ctx.spotify.recently_played(&access_token).await {
        Ok(payload) => tracks::recent_tracks(&payload),
        Err(e) => {
            slog::error!(LOG, "error fetching recently played: {}", e);
            Vec::new()
        }
    };
    Ok(resp!(json => tracks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewCredential;
    use crate::spotify::fake::{access, FakeSpotify};
    use crate::store::TokenStore;
    use crate::tokens::now_millis;
    use serde_json::{json, Value};
    use std::sync::atomic::Ordering;
    use tide::http::{Method, Request as HttpRequest, Response as HttpResponse, Url};

    fn test_config() -> Config {
        Config {
            version: "test".to_string(),
            ssl: false,
            host: "localhost".to_string(),
            port: 5000,
            log_format: "pretty".to_string(),
            log_level: "DEBUG".to_string(),
            spotify_client_id: "test-client".to_string(),
            spotify_client_secret: "test-secret".to_string(),
            spotify_redirect_uri: None,
            public_url: None,
            db_url: "sqlite::memory:".to_string(),
        }
    }

    async fn test_context(fake: FakeSpotify) -> (Context, TokenStore, Arc<FakeSpotify>) {
        let store = TokenStore::connect("sqlite::memory:")
            .await
            .expect("connect error");
        store.migrate().await.expect("migrate error");
        let fake = Arc::new(fake);
        let api: Arc<dyn SpotifyApi> = fake.clone();
        let ctx = Context {
            config: Arc::new(test_config()),
            tokens: Tokens::new(store.clone(), api.clone()),
            spotify: api,
        };
        (ctx, store, fake)
    }

    async fn seed_credential(store: &TokenStore, expires_at: i64) {
        store
            .save(NewCredential {
                access_token: "stored-access".to_string(),
                refresh_token: "stored-refresh".to_string(),
                expires_at,
            })
            .await
            .expect("save error");
    }

    fn get(path: &str) -> HttpRequest {
        let url = Url::parse(&format!("http://localhost:5000{}", path)).expect("bad url");
        HttpRequest::new(Method::Get, url)
    }

    async fn respond(app: &tide::Server<Context>, req: HttpRequest) -> HttpResponse {
        app.respond(req).await.expect("respond error")
    }

    fn header(resp: &HttpResponse, name: &str) -> String {
        resp.header(name)
            .map(|values| values.last().as_str().to_string())
            .unwrap_or_default()
    }

    fn playing_payload(name: &str) -> Value {
        json!({
            "is_playing": true,
            "progress_ms": 1000,
            "item": {
                "name": name,
                "duration_ms": 2000,
                "artists": [{
                    "name": "Artist",
                    "external_urls": { "spotify": "https://open.spotify.com/artist/1" }
                }],
                "album": {
                    "name": "Album",
                    "images": [{ "url": "https://i.scdn.co/image/1" }]
                },
                "external_urls": { "spotify": "https://open.spotify.com/track/1" }
            }
        })
    }

    #[async_std::test]
    async fn status_reports_version() {
        let (ctx, _store, _fake) = test_context(FakeSpotify::default()).await;
        let app = app(ctx);
        let mut resp = respond(&app, get("/api/status")).await;
        assert_eq!(u16::from(resp.status()), 200);
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body, json!({ "ok": "ok", "version": "test" }));
    }

    #[async_std::test]
    async fn login_returns_auth_url_and_sets_state_cookie() {
        let (ctx, _store, _fake) = test_context(FakeSpotify::default()).await;
        let app = app(ctx);
        let mut resp = respond(&app, get("/api/auth/spotify/login")).await;
        assert_eq!(u16::from(resp.status()), 200);

        let body: Value = resp.body_json().await.expect("body error");
        let auth_url = body["authUrl"].as_str().expect("no authUrl");
        assert!(auth_url.starts_with("https://accounts.spotify.com/authorize?"));
        assert!(auth_url.contains("client_id=test-client"));
        assert!(auth_url.contains("state="));

        let cookie = header(&resp, "set-cookie");
        assert!(cookie.starts_with("spotify_oauth_state="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Max-Age=600"));
    }

    #[async_std::test]
    async fn auth_status_tracks_stored_credential() {
        let (ctx, store, _fake) = test_context(FakeSpotify::default()).await;
        let app = app(ctx);

        let mut resp = respond(&app, get("/api/auth/spotify/status")).await;
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body, json!({ "authenticated": false }));

        seed_credential(&store, now_millis() + 3_600_000).await;
        let mut resp = respond(&app, get("/api/auth/spotify/status")).await;
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body, json!({ "authenticated": true }));
    }

    #[async_std::test]
    async fn callback_rejects_state_not_matching_cookie() {
        let (ctx, store, fake) = test_context(FakeSpotify {
            exchange: Some(access("new-access", 3600, Some("new-refresh"))),
            ..FakeSpotify::default()
        })
        .await;
        let app = app(ctx);

        let mut req = get("/api/auth/spotify/callback?code=XYZ&state=evil");
        req.insert_header("cookie", "spotify_oauth_state=abc123");
        let resp = respond(&app, req).await;

        assert!(header(&resp, "location").contains("error=invalid_state"));
        // no exchange is attempted and nothing is stored
        assert_eq!(fake.exchange_calls.load(Ordering::SeqCst), 0);
        assert!(store.get().await.expect("get error").is_none());
    }

    #[async_std::test]
    async fn callback_rejects_forged_state_matching_cookie() {
        // attacker controls both the query parameter and the cookie, but
        // the server never handed this state out
        let (ctx, _store, fake) = test_context(FakeSpotify::default()).await;
        let app = app(ctx);

        let mut req = get("/api/auth/spotify/callback?code=XYZ&state=forged");
        req.insert_header("cookie", "spotify_oauth_state=forged");
        let resp = respond(&app, req).await;

        assert!(header(&resp, "location").contains("error=invalid_state"));
        assert_eq!(fake.exchange_calls.load(Ordering::SeqCst), 0);
    }

    #[async_std::test]
    async fn callback_with_provider_error_redirects_auth_failed() {
        let (ctx, _store, fake) = test_context(FakeSpotify::default()).await;
        let app = app(ctx);
        let resp = respond(&app, get("/api/auth/spotify/callback?error=access_denied")).await;
        assert!(header(&resp, "location").contains("error=auth_failed"));
        assert_eq!(fake.exchange_calls.load(Ordering::SeqCst), 0);
    }

    async fn login_state(app: &tide::Server<Context>) -> String {
        let resp = respond(app, get("/api/auth/spotify/login")).await;
        let cookie = header(&resp, "set-cookie");
        cookie
            .split(';')
            .next()
            .and_then(|kv| kv.split('=').nth(1))
            .expect("no state cookie")
            .to_string()
    }

    #[async_std::test]
    async fn callback_without_code_redirects_and_clears_cookie() {
        let (ctx, _store, _fake) = test_context(FakeSpotify::default()).await;
        let app = app(ctx);
        let state = login_state(&app).await;

        let mut req = get(&format!("/api/auth/spotify/callback?state={}", state));
        req.insert_header("cookie", format!("spotify_oauth_state={}", state));
        let resp = respond(&app, req).await;

        assert!(header(&resp, "location").contains("error=no_code"));
        // cookie cleared once validation passed, whatever the outcome
        assert!(header(&resp, "set-cookie").contains("Max-Age=0"));
    }

    #[async_std::test]
    async fn login_callback_status_flow() {
        let (ctx, store, _fake) = test_context(FakeSpotify {
            exchange: Some(access("new-access", 3600, Some("new-refresh"))),
            ..FakeSpotify::default()
        })
        .await;
        let app = app(ctx);
        let state = login_state(&app).await;

        let mut req = get(&format!(
            "/api/auth/spotify/callback?code=XYZ&state={}",
            state
        ));
        req.insert_header("cookie", format!("spotify_oauth_state={}", state));
        let resp = respond(&app, req).await;
        assert!(header(&resp, "location").contains("success=connected"));
        assert!(header(&resp, "set-cookie").contains("Max-Age=0"));

        let stored = store.get().await.expect("get error").expect("no credential");
        assert_eq!(stored.access_token, "new-access");

        let mut resp = respond(&app, get("/api/auth/spotify/status")).await;
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body, json!({ "authenticated": true }));

        // the state token was single-use
        let mut req = get(&format!(
            "/api/auth/spotify/callback?code=XYZ&state={}",
            state
        ));
        req.insert_header("cookie", format!("spotify_oauth_state={}", state));
        let resp = respond(&app, req).await;
        assert!(header(&resp, "location").contains("error=invalid_state"));
    }

    #[async_std::test]
    async fn callback_exchange_failure_redirects() {
        let (ctx, store, _fake) = test_context(FakeSpotify::default()).await;
        let app = app(ctx);
        let state = login_state(&app).await;

        let mut req = get(&format!(
            "/api/auth/spotify/callback?code=XYZ&state={}",
            state
        ));
        req.insert_header("cookie", format!("spotify_oauth_state={}", state));
        let resp = respond(&app, req).await;
        assert!(header(&resp, "location").contains("error=token_exchange_failed"));
        assert!(store.get().await.expect("get error").is_none());
    }

    #[async_std::test]
    async fn recently_played_without_credential_is_401_not_connected() {
        let (ctx, _store, _fake) = test_context(FakeSpotify::default()).await;
        let app = app(ctx);
        let mut resp = respond(&app, get("/api/spotify/recently-played")).await;
        assert_eq!(u16::from(resp.status()), 401);
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body["error"], "not_connected");
    }

    #[async_std::test]
    async fn recently_played_upstream_failure_is_empty_array() {
        let (ctx, store, _fake) = test_context(FakeSpotify::default()).await;
        seed_credential(&store, now_millis() + 3_600_000).await;
        let app = app(ctx);
        let mut resp = respond(&app, get("/api/spotify/recently-played")).await;
        assert_eq!(u16::from(resp.status()), 200);
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body, json!([]));
    }

    #[async_std::test]
    async fn recently_played_maps_upstream_items() {
        let payload = json!({
            "items": [{
                "track": {
                    "name": "Some Song",
                    "artists": [{
                        "name": "Artist",
                        "external_urls": { "spotify": "https://open.spotify.com/artist/1" }
                    }],
                    "album": { "name": "Album", "images": [] },
                    "external_urls": { "spotify": "https://open.spotify.com/track/1" }
                }
            }]
        });
        let (ctx, store, _fake) = test_context(FakeSpotify {
            recent: Some(payload),
            ..FakeSpotify::default()
        })
        .await;
        seed_credential(&store, now_millis() + 3_600_000).await;
        let app = app(ctx);

        let mut resp = respond(&app, get("/api/spotify/recently-played")).await;
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body[0]["id"], "1");
        assert_eq!(body[0]["name"], "Some Song");
        assert_eq!(body[0]["isCurrentlyPlaying"], false);
        assert_eq!(body[0]["image"], "");
    }

    #[async_std::test]
    async fn currently_playing_without_credential_is_401_not_connected() {
        let (ctx, _store, _fake) = test_context(FakeSpotify::default()).await;
        let app = app(ctx);
        let mut resp = respond(&app, get("/api/spotify/currently-playing")).await;
        assert_eq!(u16::from(resp.status()), 401);
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body["error"], "not_connected");
    }

    #[async_std::test]
    async fn currently_playing_is_null_when_nothing_playing() {
        let (ctx, store, _fake) = test_context(FakeSpotify {
            playing: Some(Some(json!({ "is_playing": false }))),
            ..FakeSpotify::default()
        })
        .await;
        seed_credential(&store, now_millis() + 3_600_000).await;
        let app = app(ctx);
        let mut resp = respond(&app, get("/api/spotify/currently-playing")).await;
        assert_eq!(u16::from(resp.status()), 200);
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body, Value::Null);
    }

    #[async_std::test]
    async fn currently_playing_is_null_on_upstream_204() {
        let (ctx, store, _fake) = test_context(FakeSpotify {
            playing: Some(None),
            ..FakeSpotify::default()
        })
        .await;
        seed_credential(&store, now_millis() + 3_600_000).await;
        let app = app(ctx);
        let mut resp = respond(&app, get("/api/spotify/currently-playing")).await;
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body, Value::Null);
    }

    #[async_std::test]
    async fn currently_playing_upstream_failure_is_null() {
        let (ctx, store, _fake) = test_context(FakeSpotify::default()).await;
        seed_credential(&store, now_millis() + 3_600_000).await;
        let app = app(ctx);
        let mut resp = respond(&app, get("/api/spotify/currently-playing")).await;
        assert_eq!(u16::from(resp.status()), 200);
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body, Value::Null);
    }

    #[async_std::test]
    async fn expired_credential_is_refreshed_on_the_way_through() {
        let (ctx, store, _fake) = test_context(FakeSpotify {
            refreshed: Some(access("fresh-access", 3600, None)),
            playing: Some(Some(playing_payload("Some Song"))),
            ..FakeSpotify::default()
        })
        .await;
        seed_credential(&store, now_millis() - 1000).await;
        let app = app(ctx);

        let mut resp = respond(&app, get("/api/spotify/currently-playing")).await;
        assert_eq!(u16::from(resp.status()), 200);
        let body: Value = resp.body_json().await.expect("body error");
        assert_eq!(body["id"], "current");
        assert_eq!(body["name"], "Some Song");
        assert_eq!(body["isCurrentlyPlaying"], true);

        let stored = store.get().await.expect("get error").expect("no credential");
        assert!(stored.expires_at > now_millis());
        assert_eq!(stored.access_token, "fresh-access");
    }
}
