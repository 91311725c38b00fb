//! Persisted server signing key.
//!
//! The newest active, unexpired row of `federation_keys` is this server's
//! key. When there is none a fresh Ed25519 pair is generated and stored with
//! a 90-day lifetime. Rotating means clearing `is_active` on the current row
//! and restarting.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::{PgPool, Row as _};
use tracing::{info, warn};

use crate::{error::FederationError, keys::ServerKeyPair};

const KEY_LIFETIME_DAYS: i64 = 90;

pub struct KeyManager {
    pool: PgPool,
}

impl KeyManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_or_generate(&self) -> Result<Arc<ServerKeyPair>, FederationError> {
        if let Some(kp) = self.active_key().await? {
            info!(key_id = %kp.key_id, "Loaded federation signing key");
            return Ok(Arc::new(kp));
        }

        warn!("No usable federation signing key; generating one");
        let kp = ServerKeyPair::generate();
        self.store(&kp).await?;
        info!(key_id = %kp.key_id, "Stored new federation signing key");
        Ok(Arc::new(kp))
    }

    async fn active_key(&self) -> Result<Option<ServerKeyPair>, FederationError> {
        let row = sqlx::query(
            "SELECT key_id, seed_bytes FROM federation_keys \
             WHERE is_active AND expires_at > NOW() \
             ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        let Some(row) = row else { return Ok(None) };

        let key_id: String = row.try_get("key_id").map_err(db_error)?;
        let seed: Vec<u8> = row.try_get("seed_bytes").map_err(db_error)?;
        let kp = ServerKeyPair::from_seed(&seed)?;
        // The id is derived from the public key, so a mismatch means a corrupt row.
        if kp.key_id != key_id {
            return Err(FederationError::KeyLoad(format!("seed stored under {key_id} derives {}", kp.key_id)));
        }
        Ok(Some(kp))
    }

    async fn store(&self, kp: &ServerKeyPair) -> Result<(), FederationError> {
        sqlx::query(
            "INSERT INTO federation_keys (key_id, seed_bytes, public_key_b64, expires_at, is_active) \
             VALUES ($1, $2, $3, $4, TRUE) \
             ON CONFLICT (key_id) DO NOTHING",
        )
        .bind(&kp.key_id)
        .bind(kp.seed_bytes().to_vec())
        .bind(kp.public_key_base64())
        .bind(Utc::now() + Duration::days(KEY_LIFETIME_DAYS))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> FederationError {
    FederationError::KeyLoad(e.to_string())
}
