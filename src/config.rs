use std::io::Read;
use std::{env, fs};

use crate::{env_or, LOG};

pub struct Config {
    pub version: String,
    pub ssl: bool,
    pub host: String,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub spotify_redirect_uri: Option<String>,
    pub public_url: Option<String>,
    pub db_url: String,
}

impl Config {
    pub fn load() -> Self {
        let version = fs::File::open("commit_hash.txt")
            .map(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s).expect("error reading commit_hash");
                s.trim().to_string()
            })
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            version,
            ssl: env_or("SSL", "false") == "true",
            host: env_or("HOST", "localhost"),
            port: env_or("PORT", "5000").parse().expect("invalid port"),
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            // no embedded defaults for upstream credentials, these have
            // to match an app registered with spotify
            spotify_client_id: env::var("SPOTIFY_CLIENT_ID")
                .expect("SPOTIFY_CLIENT_ID must be set"),
            spotify_client_secret: env::var("SPOTIFY_CLIENT_SECRET")
                .expect("SPOTIFY_CLIENT_SECRET must be set"),
            spotify_redirect_uri: env::var("SPOTIFY_REDIRECT_URI").ok(),
            public_url: env::var("PUBLIC_URL").ok(),
            db_url: env_or("DATABASE_URL", "sqlite://nowspinning.db?mode=rwc"),
        }
    }

    pub fn initialize(&self) {
        slog::info!(
            LOG, "initialized config";
            "version" => &self.version,
            "ssl" => self.ssl,
            "host" => &self.host,
            "port" => self.port,
            "log_format" => &self.log_format,
            "log_level" => &self.log_level,
            "db_url" => &self.db_url,
        );
    }

    pub fn host(&self) -> String {
        let p = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", p, self.host, self.port)
    }

    /// Where the browser lives. The callback handler redirects here with
    /// `?success=...` / `?error=...` query parameters the page can read.
    pub fn app_url(&self) -> String {
        // local-development fallback
        self.public_url.clone().unwrap_or_else(|| self.host())
    }

    /// Must exactly match the redirect uri registered with spotify and is
    /// sent in both the authorization request and every token exchange.
    pub fn redirect_uri(&self) -> String {
        self.spotify_redirect_uri.clone().unwrap_or_else(|| {
            // local-development fallback
            format!("{}/api/auth/spotify/callback", self.app_url())
        })
    }
}
