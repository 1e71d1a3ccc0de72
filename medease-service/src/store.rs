//! Account, medication, sharing and Google token persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use medease_flow::Result;
use sqlx::{PgPool, Row, postgres::PgPoolOptions, types::Json};
use std::sync::Arc;
use tracing::info;

use crate::models::{GoogleToken, MedicationNote, ShareKey, UserRecord};

#[async_trait]
pub trait Repository: Send + Sync {
    /// Store a new user. Returns false when the email is already registered.
    async fn insert_user(&self, user: UserRecord) -> Result<bool>;
    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    async fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>>;

    async fn save_medication_note(&self, note: MedicationNote) -> Result<()>;
    /// Notes of one user, newest first
    async fn medication_notes(&self, user_id: &str) -> Result<Vec<MedicationNote>>;

    async fn save_share_key(&self, key: ShareKey) -> Result<()>;
    /// Keys of one user that are enabled and not expired at `now`
    async fn active_share_keys(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<ShareKey>>;

    async fn save_google_token(&self, token: GoogleToken) -> Result<()>;
    async fn google_token(&self, user_id: &str) -> Result<Option<GoogleToken>>;
}

/// Normalised form used for email lookups
pub fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// In-memory implementation of Repository
pub struct InMemoryRepository {
    users: Arc<DashMap<String, UserRecord>>,
    user_ids_by_email: Arc<DashMap<String, String>>,
    medication_notes: Arc<DashMap<String, Vec<MedicationNote>>>,
    share_keys: Arc<DashMap<String, Vec<ShareKey>>>,
    google_tokens: Arc<DashMap<String, GoogleToken>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            users: Arc::new(DashMap::new()),
            user_ids_by_email: Arc::new(DashMap::new()),
            medication_notes: Arc::new(DashMap::new()),
            share_keys: Arc::new(DashMap::new()),
            google_tokens: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn insert_user(&self, user: UserRecord) -> Result<bool> {
        use dashmap::mapref::entry::Entry;

        match self.user_ids_by_email.entry(email_key(&user.email)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(user.user_id.clone());
                self.users.insert(user.user_id.clone(), user);
                Ok(true)
            }
        }
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let user_id = match self.user_ids_by_email.get(&email_key(email)) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        Ok(self.users.get(&user_id).map(|entry| entry.value().clone()))
    }

    async fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn save_medication_note(&self, note: MedicationNote) -> Result<()> {
        self.medication_notes
            .entry(note.user_id.clone())
            .or_default()
            .push(note);
        Ok(())
    }

    async fn medication_notes(&self, user_id: &str) -> Result<Vec<MedicationNote>> {
        let mut notes = self
            .medication_notes
            .get(user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notes)
    }

    async fn save_share_key(&self, key: ShareKey) -> Result<()> {
        self.share_keys
            .entry(key.user_id.clone())
            .or_default()
            .push(key);
        Ok(())
    }

    async fn active_share_keys(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<ShareKey>> {
        Ok(self
            .share_keys
            .get(user_id)
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|key| key.is_active(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_google_token(&self, token: GoogleToken) -> Result<()> {
        self.google_tokens.insert(token.user_id.clone(), token);
        Ok(())
    }

    async fn google_token(&self, user_id: &str) -> Result<Option<GoogleToken>> {
        Ok(self
            .google_tokens
            .get(user_id)
            .map(|entry| entry.value().clone()))
    }
}

/// Postgres implementation of Repository. Records are kept as JSONB documents next to
/// the columns used for lookups.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS medication_notes (
                medication_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS share_keys (
                id BIGSERIAL PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                doc JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS google_tokens (
                user_id TEXT PRIMARY KEY,
                doc JSONB NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("Repository tables ready");
        Ok(Self { pool })
    }

    async fn fetch_docs<T>(&self, query: &str, key: &str) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned + Send + Unpin + 'static,
    {
        let rows = sqlx::query(query).bind(key).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| -> Result<T> {
                let Json(doc): Json<T> = row.try_get("doc")?;
                Ok(doc)
            })
            .collect()
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn insert_user(&self, user: UserRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (user_id, email, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(&user.user_id)
        .bind(email_key(&user.email))
        .bind(Json(&user))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let users = self
            .fetch_docs("SELECT doc FROM users WHERE email = $1", &email_key(email))
            .await?;
        Ok(users.into_iter().next())
    }

    async fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let users = self
            .fetch_docs("SELECT doc FROM users WHERE user_id = $1", user_id)
            .await?;
        Ok(users.into_iter().next())
    }

    async fn save_medication_note(&self, note: MedicationNote) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO medication_notes (medication_id, user_id, created_at, doc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (medication_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(&note.medication_id)
        .bind(&note.user_id)
        .bind(note.created_at)
        .bind(Json(&note))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn medication_notes(&self, user_id: &str) -> Result<Vec<MedicationNote>> {
        self.fetch_docs(
            "SELECT doc FROM medication_notes WHERE user_id = $1 ORDER BY created_at DESC",
            user_id,
        )
        .await
    }

    async fn save_share_key(&self, key: ShareKey) -> Result<()> {
        sqlx::query("INSERT INTO share_keys (user_id, expires_at, doc) VALUES ($1, $2, $3)")
            .bind(&key.user_id)
            .bind(key.expires_at)
            .bind(Json(&key))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_share_keys(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<ShareKey>> {
        let keys: Vec<ShareKey> = self
            .fetch_docs(
                "SELECT doc FROM share_keys WHERE user_id = $1 ORDER BY id DESC",
                user_id,
            )
            .await?;
        Ok(keys.into_iter().filter(|key| key.is_active(now)).collect())
    }

    async fn save_google_token(&self, token: GoogleToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO google_tokens (user_id, doc)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(&token.user_id)
        .bind(Json(&token))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn google_token(&self, user_id: &str) -> Result<Option<GoogleToken>> {
        let tokens = self
            .fetch_docs("SELECT doc FROM google_tokens WHERE user_id = $1", user_id)
            .await?;
        Ok(tokens.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(id: &str, email: &str) -> UserRecord {
        UserRecord {
            user_id: id.to_string(),
            email: email.to_string(),
            hashed_password: "x".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_case_insensitively() {
        let repo = InMemoryRepository::new();
        assert!(repo.insert_user(user("u1", "Pat@Example.com")).await.unwrap());
        assert!(!repo.insert_user(user("u2", "pat@example.com")).await.unwrap());

        let found = repo.user_by_email("PAT@example.com").await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");
        assert!(repo.user_by_id("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_enabled_unexpired_keys_are_active() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let key = |value: &str, expires_at, is_disabled| ShareKey {
            user_id: "u1".to_string(),
            generated_key: value.to_string(),
            is_disabled,
            created_at: now - Duration::minutes(5),
            expires_at,
        };
        repo.save_share_key(key("live", now + Duration::minutes(30), false))
            .await
            .unwrap();
        repo.save_share_key(key("expired", now - Duration::seconds(1), false))
            .await
            .unwrap();
        repo.save_share_key(key("disabled", now + Duration::minutes(30), true))
            .await
            .unwrap();

        let active = repo.active_share_keys("u1", now).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].generated_key, "live");
    }
}
