use slog::Drain;
use std::env;
use std::sync::Arc;

mod config;
mod errors;
mod logging;
mod models;
mod service;
mod spotify;
mod store;
mod tokens;
mod tracks;

use config::Config;
use service::Context;
use spotify::{Spotify, SpotifyApi};
use store::TokenStore;
use tokens::Tokens;

pub fn env_or(k: &str, default: &str) -> String {
    env::var(k).unwrap_or_else(|_| default.to_string())
}

lazy_static::lazy_static! {
    // The "base" logger. Configured straight from the environment so it
    // carries no dependency on the loaded config.
    pub static ref BASE_LOG: slog::Logger = {
        let level: slog::Level = env_or("LOG_LEVEL", "INFO")
            .parse()
            .expect("invalid log_level");
        if env_or("LOG_FORMAT", "json").to_lowercase().trim() == "pretty" {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::CompactFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, slog::o!())
        } else {
            let drain = slog_json::Json::default(std::io::stderr()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            let drain = slog::LevelFilter::new(drain, level).fuse();
            slog::Logger::root(drain, slog::o!())
        }
    };

    // Base logger
    pub static ref LOG: slog::Logger = BASE_LOG.new(slog::o!("app" => "nowspinning"));
}

#[async_std::main]
async fn main() -> tide::Result<()> {
    // try sourcing a .env if one exists
    dotenv::dotenv().ok();
    let config = Arc::new(Config::load());
    config.initialize();

    let store = TokenStore::connect(&config.db_url).await?;
    store.migrate().await?;

    let api: Arc<dyn SpotifyApi> = Arc::new(Spotify::new(&config));
    let tokens = Tokens::new(store, api.clone());
    let ctx = Context {
        config,
        tokens,
        spotify: api,
    };
    service::start(ctx).await?;
    Ok(())
}
