/*!
Shaping of raw spotify player payloads into the normalized track records
the page consumes. Best-effort: missing fields map to empty strings,
unusable payloads map to empty results, nothing is ever fabricated.
*/
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// `"current"` for the currently-playing variant, otherwise the
    /// 1-based page position. These ids are presentation-only and not
    /// stable across calls.
    pub id: String,
    pub name: String,
    pub artist: String,
    pub album: String,
    /// First album image url, or empty when the upstream has none.
    pub image: String,
    pub url: String,
    pub artist_url: String,
    /// Constant 1, spotify does not report real play counts.
    pub play_count: u32,
    pub is_currently_playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

fn text(v: &Value) -> String {
    v.as_str().unwrap_or("").to_string()
}

/// The currently-playing payload mapped to a track, or `None` when
/// nothing is playing or the playing item isn't a track (podcasts come
/// back with a null item).
pub fn current_track(payload: &Value) -> Option<Track> {
    if !payload["is_playing"].as_bool().unwrap_or(false) {
        return None;
    }
    let item = &payload["item"];
    if item.is_null() {
        return None;
    }
    Some(Track {
        id: "current".to_string(),
        name: text(&item["name"]),
        artist: text(&item["artists"][0]["name"]),
        album: text(&item["album"]["name"]),
        image: text(&item["album"]["images"][0]["url"]),
        url: text(&item["external_urls"]["spotify"]),
        artist_url: text(&item["artists"][0]["external_urls"]["spotify"]),
        play_count: 1,
        is_currently_playing: true,
        progress: payload["progress_ms"].as_i64(),
        duration: item["duration_ms"].as_i64(),
    })
}

/// The recently-played payload mapped to tracks in page order.
pub fn recent_tracks(payload: &Value) -> Vec<Track> {
    let items = match payload["items"].as_array() {
        Some(items) => items,
        None => return Vec::new(),
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let track = &item["track"];
            Track {
                id: (i + 1).to_string(),
                name: text(&track["name"]),
                artist: text(&track["artists"][0]["name"]),
                album: text(&track["album"]["name"]),
                image: text(&track["album"]["images"][0]["url"]),
                url: text(&track["external_urls"]["spotify"]),
                artist_url: text(&track["artists"][0]["external_urls"]["spotify"]),
                play_count: 1,
                is_currently_playing: false,
                progress: None,
                duration: None,
            }
        })
        .collect()
}
