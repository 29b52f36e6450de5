//! Durable settings and state, stored as JSON documents in SQLite.

use anyhow::{Context, Result};
use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

use crate::settings::PoolSettings;
use crate::state::SystemState;

const SETTINGS_KEY: &str = "settings";
const STATE_KEY: &str = "state";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/pool/pool.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // One connection: an in-memory database lives per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Documents
    // ----------------------------

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM documents WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to load '{key}'"))?;

        body.map(|b| {
            serde_json::from_str(&b).with_context(|| format!("stored '{key}' is not valid"))
        })
        .transpose()
    }

    async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_string(value)
            .with_context(|| format!("failed to encode '{key}'"))?;
        let updated_at = Local::now().naive_local().to_string();

        sqlx::query(
            r#"
            INSERT INTO documents (key, body, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              body=excluded.body,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(body)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save '{key}'"))?;

        debug!(key, "document saved");
        Ok(())
    }

    // ----------------------------
    // Settings
    // ----------------------------

    /// Stored settings, or the factory defaults on first start.
    pub async fn load_settings(&self) -> Result<PoolSettings> {
        match self.load(SETTINGS_KEY).await? {
            Some(settings) => Ok(settings),
            None => {
                info!("no stored settings, using defaults");
                Ok(PoolSettings::default())
            }
        }
    }

    pub async fn save_settings(&self, settings: &PoolSettings) -> Result<()> {
        self.save(SETTINGS_KEY, settings).await
    }

    // ----------------------------
    // State
    // ----------------------------

    /// Stored state with readings and the pump relay reset, or a fresh
    /// state on first start.
    pub async fn load_state(&self) -> Result<SystemState> {
        let mut state = match self.load::<SystemState>(STATE_KEY).await? {
            Some(state) => state,
            None => {
                info!("no stored state, using defaults");
                SystemState::default()
            }
        };
        state.reset_volatile();
        Ok(state)
    }

    pub async fn save_state(&self, state: &SystemState) -> Result<()> {
        self.save(STATE_KEY, state).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
