use chrono::{DateTime, Utc};
use presence_core::types::EMBEDDING_DIM;
use presence_core::{Embedding, FaceProfile};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed profile and check-in storage with AES-256-GCM embedding
/// encryption.
///
/// Embeddings are encrypted before storage and decrypted on retrieval. A
/// per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/presence"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS profiles (
                     identity_id TEXT PRIMARY KEY,
                     tenant TEXT NOT NULL,
                     display_name TEXT NOT NULL,
                     embedding BLOB NOT NULL,
                     metadata TEXT,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_profiles_tenant ON profiles(tenant);
                 CREATE TABLE IF NOT EXISTS checkins (
                     id TEXT PRIMARY KEY,
                     identity_id TEXT NOT NULL,
                     display_name TEXT NOT NULL,
                     timestamp TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_checkins_timestamp ON checkins(timestamp);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Insert or replace an enrolled profile.
    pub async fn insert_profile(
        &self,
        tenant: &str,
        profile: &FaceProfile,
    ) -> Result<(), StoreError> {
        let blob = self.encrypt_embedding(profile.embedding.values())?;
        let metadata = profile
            .metadata
            .as_ref()
            .map(|m| m.to_string());
        let created_at = Utc::now().to_rfc3339();

        let tenant = tenant.to_string();
        let identity_id = profile.identity_id.clone();
        let display_name = profile.display_name.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO profiles
                     (identity_id, tenant, display_name, embedding, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![identity_id, tenant, display_name, blob, metadata, created_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Load every profile for a tenant — the gallery consumed by
    /// `EmbeddingCache::refresh`.
    pub async fn load_all_profiles(&self, tenant: &str) -> Result<Vec<FaceProfile>, StoreError> {
        let tenant = tenant.to_string();

        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<(String, String, Vec<u8>, Option<String>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_id, display_name, embedding, metadata
                     FROM profiles WHERE tenant = ?1 ORDER BY created_at",
                )?;
                let rows = stmt.query_map([&tenant], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut profiles = Vec::with_capacity(rows.len());
        for (identity_id, display_name, blob, metadata) in rows {
            let values = self.decrypt_embedding(&blob)?;
            profiles.push(FaceProfile {
                identity_id,
                display_name,
                embedding: Embedding::normalized_lossy(values),
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            });
        }
        Ok(profiles)
    }

    /// List profiles for a tenant (metadata only, no embeddings).
    pub async fn list_profiles(&self, tenant: &str) -> Result<Vec<ProfileInfo>, StoreError> {
        let tenant = tenant.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_id, display_name, created_at
                     FROM profiles WHERE tenant = ?1 ORDER BY created_at",
                )?;
                let rows = stmt.query_map([&tenant], |row| {
                    Ok(ProfileInfo {
                        identity_id: row.get(0)?,
                        display_name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove a profile, scoped to a tenant for cross-tenant protection.
    pub async fn remove_profile(&self, tenant: &str, identity_id: &str) -> Result<bool, StoreError> {
        let tenant = tenant.to_string();
        let identity_id = identity_id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM profiles WHERE identity_id = ?1 AND tenant = ?2",
                    [&identity_id, &tenant],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count enrolled profiles across all tenants.
    pub async fn count_profiles(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Append one accepted check-in. Returns the generated record UUID.
    pub async fn record_checkin(
        &self,
        identity_id: &str,
        display_name: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_clone = id.clone();
        let identity_id = identity_id.to_string();
        let display_name = display_name.to_string();
        let timestamp = timestamp.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO checkins (id, identity_id, display_name, timestamp)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id_clone, identity_id, display_name, timestamp],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    /// The most recent check-ins, newest first.
    pub async fn recent_checkins(&self, limit: u32) -> Result<Vec<CheckinRecord>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity_id, display_name, timestamp
                     FROM checkins ORDER BY timestamp DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], |row| {
                    Ok(CheckinRecord {
                        id: row.get(0)?,
                        identity_id: row.get(1)?,
                        display_name: row.get(2)?,
                        timestamp: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt an embedding blob (12-byte nonce + ciphertext + GCM tag).
    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        const NONCE_LEN: usize = 12;

        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding_strict(&plaintext)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(EMBEDDING_DIM);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }

    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about an enrolled profile (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileInfo {
    pub identity_id: String,
    pub display_name: String,
    pub created_at: String,
}

/// One persisted check-in.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckinRecord {
    pub id: String,
    pub identity_id: String,
    pub display_name: String,
    pub timestamp: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
