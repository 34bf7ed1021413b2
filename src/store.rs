use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::models::{Credential, CredentialUpdate, NewCredential};
use crate::{errors::Result, se};

/// Persistence for the single stored spotify credential.
///
/// This is a single-user design: `save` deliberately supersedes any
/// existing credential. A genuine multi-user store would key credentials
/// by account instead of overwriting.
#[derive(Clone)]
pub struct TokenStore {
    pool: SqlitePool,
}

impl TokenStore {
    pub async fn connect(db_url: &str) -> Result<Self> {
        // one connection: writes stay serialized and `sqlite::memory:`
        // behaves as a single shared database in tests
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .map_err(|e| se!("error connecting to {} {}", db_url, e))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "
            create table if not exists credentials (
                id text primary key,
                access_token text not null,
                refresh_token text not null,
                expires_at integer not null,
                created_at text not null
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| se!("error creating credentials table {}", e))?;
        Ok(())
    }

    /// The single stored credential, if any.
    pub async fn get(&self) -> Result<Option<Credential>> {
        sqlx::query_as::<_, Credential>("select * from credentials limit 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| se!("error fetching credential {}", e))
    }

    /// Replace whatever is stored with a newly created credential.
    pub async fn save(&self, new: NewCredential) -> Result<Credential> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let created_at = chrono::Utc::now();
        let mut tr = self
            .pool
            .begin()
            .await
            .map_err(|e| se!("error starting credential transaction {}", e))?;
        sqlx::query("delete from credentials")
            .execute(&mut tr)
            .await
            .map_err(|e| se!("error clearing credentials {}", e))?;
        sqlx::query(
            "
            insert into credentials (id, access_token, refresh_token, expires_at, created_at)
            values (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(&id)
        .bind(&new.access_token)
        .bind(&new.refresh_token)
        .bind(new.expires_at)
        .bind(created_at)
        .execute(&mut tr)
        .await
        .map_err(|e| se!("error inserting credential {}", e))?;
        tr.commit()
            .await
            .map_err(|e| se!("error committing credential insert {}", e))?;
        self.get()
            .await?
            .ok_or_else(|| se!("credential missing after save"))
    }

    /// Merge `update` into the credential with this `id`. Returns `None`
    /// when no such credential exists (superseded or never saved), which
    /// callers treat as "credential changed underneath us", not a failure.
    pub async fn update(&self, id: &str, update: CredentialUpdate) -> Result<Option<Credential>> {
        let existing = sqlx::query_as::<_, Credential>("select * from credentials where id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| se!("error fetching credential {} {}", id, e))?;
        let existing = match existing {
            None => return Ok(None),
            Some(c) => c,
        };
        let access_token = update.access_token.unwrap_or(existing.access_token);
        let refresh_token = update.refresh_token.unwrap_or(existing.refresh_token);
        let expires_at = update.expires_at.unwrap_or(existing.expires_at);
        sqlx::query(
            "
            update credentials
            set access_token = ?1, refresh_token = ?2, expires_at = ?3
            where id = ?4
            ",
        )
        .bind(&access_token)
        .bind(&refresh_token)
        .bind(expires_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| se!("error updating credential {} {}", id, e))?;
        self.get().await
    }
}
