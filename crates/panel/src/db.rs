use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::error;

use crate::registry::Settings;

/// Key of the single settings document in the `settings` table.
const SETTINGS_KEY: &str = "irrigation_settings";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One row of the dispatch log.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DispatchRecord {
    pub id: i64,
    pub ts: i64,
    pub device_key: String,
    pub phone: String,
    pub message: String,
    /// `sent`, `cancelled`, `unknown`, `unavailable` or `failed`.
    pub outcome: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation-panel/panel.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if db_url.contains(":memory:") {
            // Every connection to :memory: is its own database; keep exactly one alive.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
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
    // Settings
    // ----------------------------

    /// Stored settings merged over the defaults. A missing row yields the
    /// defaults; an unreadable one is logged and also yields the defaults.
    pub async fn load_settings(&self) -> Result<Settings> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
                .bind(SETTINGS_KEY)
                .fetch_optional(&self.pool)
                .await
                .context("load_settings failed")?;

        let Some(raw) = stored else {
            return Ok(Settings::default());
        };

        let merged = serde_json::from_str::<Value>(&raw).and_then(Settings::merged_over_defaults);
        match merged {
            Ok(settings) => Ok(settings),
            Err(e) => {
                error!("stored settings are unreadable, using defaults: {e}");
                Ok(Settings::default())
            }
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let json = serde_json::to_string(settings).context("failed to encode settings")?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value
            "#,
        )
        .bind(SETTINGS_KEY)
        .bind(json)
        .execute(&self.pool)
        .await
        .context("save_settings failed")?;
        Ok(())
    }

    /// Drop the stored document and return the defaults.
    pub async fn reset_settings(&self) -> Result<Settings> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(SETTINGS_KEY)
            .execute(&self.pool)
            .await
            .context("reset_settings failed")?;
        Ok(Settings::default())
    }

    // ----------------------------
    // Dispatch log
    // ----------------------------

    pub async fn insert_dispatch(
        &self,
        device_key: &str,
        phone: &str,
        message: &str,
        outcome: &str,
    ) -> Result<()> {
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO dispatches (ts, device_key, phone, message, outcome)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(device_key)
        .bind(phone)
        .bind(message)
        .bind(outcome)
        .execute(&self.pool)
        .await
        .context("insert_dispatch failed")?;
        Ok(())
    }

    /// Most recent dispatches first.
    pub async fn recent_dispatches(&self, limit: i64) -> Result<Vec<DispatchRecord>> {
        let rows = sqlx::query_as::<_, DispatchRecord>(
            r#"
            SELECT id, ts, device_key, phone, message, outcome
            FROM dispatches
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_dispatches failed")?;
        Ok(rows)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceKey, NutrientProfile};
    use serde_json::json;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    async fn store_raw(db: &Db, raw: &str) {
        sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?)")
            .bind(SETTINGS_KEY)
            .bind(raw)
            .execute(db.pool())
            .await
            .unwrap();
    }

    // -- Settings -----------------------------------------------------------

    #[tokio::test]
    async fn empty_store_loads_defaults() {
        let db = test_db().await;
        assert_eq!(db.load_settings().await.unwrap(), Settings::default());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let db = test_db().await;
        let mut s = Settings::default();
        s.phone_number = "+15551234567".into();
        s.add_valve();
        s.tank_mut("tank2").unwrap().nutrient = NutrientProfile::new("1", "2", "3", "4", "5", "6");

        db.save_settings(&s).await.unwrap();
        let loaded = db.load_settings().await.unwrap();

        let merged =
            Settings::merged_over_defaults(serde_json::to_value(&s).unwrap()).unwrap();
        assert_eq!(loaded, merged);
        assert_eq!(loaded, s);
    }

    #[tokio::test]
    async fn save_overwrites_previous_document() {
        let db = test_db().await;
        let mut s = Settings::default();
        s.phone_number = "+1".into();
        db.save_settings(&s).await.unwrap();
        s.phone_number = "+2".into();
        db.save_settings(&s).await.unwrap();
        assert_eq!(db.load_settings().await.unwrap().phone_number, "+2");
    }

    #[tokio::test]
    async fn partial_document_is_filled_from_defaults() {
        let db = test_db().await;
        store_raw(&db, &json!({ "phoneNumber": "+4400" }).to_string()).await;

        let loaded = db.load_settings().await.unwrap();
        assert_eq!(loaded.phone_number, "+4400");
        assert_eq!(loaded.motors, Settings::default().motors);
        assert_eq!(loaded.template, Settings::default().template);
    }

    #[tokio::test]
    async fn stored_device_list_replaces_default_list() {
        let db = test_db().await;
        let mut s = Settings::default();
        s.remove_device(&DeviceKey::motor("motor2"));
        db.save_settings(&s).await.unwrap();

        let loaded = db.load_settings().await.unwrap();
        assert_eq!(loaded.motors.len(), 2);
        assert!(loaded.motor("motor2").is_none());
    }

    #[tokio::test]
    async fn corrupt_document_falls_back_to_defaults() {
        let db = test_db().await;
        store_raw(&db, "{not json").await;
        assert_eq!(db.load_settings().await.unwrap(), Settings::default());
    }

    #[tokio::test]
    async fn reset_clears_stored_document() {
        let db = test_db().await;
        let mut s = Settings::default();
        s.phone_number = "+9".into();
        db.save_settings(&s).await.unwrap();

        assert_eq!(db.reset_settings().await.unwrap(), Settings::default());
        assert_eq!(db.load_settings().await.unwrap(), Settings::default());
    }

    // -- Dispatch log -------------------------------------------------------

    #[tokio::test]
    async fn dispatches_are_listed_newest_first() {
        let db = test_db().await;
        db.insert_dispatch("motor/motor1", "+1", "ON M1", "sent").await.unwrap();
        db.insert_dispatch("valve/valve2", "+1", "OFF V2", "failed").await.unwrap();
        db.insert_dispatch("tank/tank1", "+1", "ON T1", "unknown").await.unwrap();

        let rows = db.recent_dispatches(2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "ON T1");
        assert_eq!(rows[1].device_key, "valve/valve2");
        assert_eq!(rows[1].outcome, "failed");
        assert!(rows[0].ts > 0);
    }
}
