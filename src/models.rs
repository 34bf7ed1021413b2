#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Credential {
    // opaque identifier assigned at save time
    pub id: String,
    // a spotify bearer token, required for all upstream calls
    pub access_token: String,
    // a spotify token that can be used to mint a new access_token
    // without user interaction. Spotify may omit a new one on refresh,
    // in which case the existing value is carried forward.
    pub refresh_token: String,
    // epoch milliseconds after which the access_token must not
    // be used without refreshing. Always derived as
    // "time of issuance + issuer-declared lifetime".
    pub expires_at: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Fields set together on every create. A credential is never
/// partially written.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
}

/// Partial update merged into an existing credential by id.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}
