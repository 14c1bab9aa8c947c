use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use proctor_core::codec::{decode_bytes, encode_png, CodecError};
use proctor_core::{
    FaceRecord, Fingerprint, IdentityStore, StorageError, UpsertOutcome, Variation, VariationKind,
};
use rusqlite::{OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("image encryption failed")]
    EncryptionFailed,
    #[error("image decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid image blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("stored image is unreadable: {0}")]
    InvalidImage(#[from] CodecError),
    #[error("stored variation kind is unreadable: {0}")]
    InvalidVariation(#[from] serde_json::Error),
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("no face record for user {0}")]
    NotFound(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        StorageError::new(err.to_string())
    }
}

/// SQLite-backed face records with AES-256-GCM encrypted images.
///
/// Reference and variation images are PNG-encoded, then encrypted before
/// storage and decrypted on retrieval. A per-installation 32-byte key is
/// generated at first use and stored at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct SqliteIdentityStore {
    conn: Connection,
    enc_key: [u8; 32],
}

/// Raw `faces` row, still encrypted.
struct FaceRow {
    user_id: String,
    name: String,
    fingerprint: String,
    reference: Option<Vec<u8>>,
    verification_count: i64,
    last_verified_at: Option<String>,
    is_verified: bool,
    registered_at: String,
}

/// Raw `face_variations` row, still encrypted.
struct VariationRow {
    user_id: String,
    idx: i64,
    kind: String,
    image: Vec<u8>,
}

const FACE_COLUMNS: &str = "user_id, name, fingerprint, reference, verification_count,
     last_verified_at, is_verified, registered_at";

fn face_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FaceRow> {
    Ok(FaceRow {
        user_id: row.get(0)?,
        name: row.get(1)?,
        fingerprint: row.get(2)?,
        reference: row.get(3)?,
        verification_count: row.get(4)?,
        last_verified_at: row.get(5)?,
        is_verified: row.get(6)?,
        registered_at: row.get(7)?,
    })
}

fn variation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VariationRow> {
    Ok(VariationRow {
        user_id: row.get(0)?,
        idx: row.get(1)?,
        kind: row.get(2)?,
        image: row.get(3)?,
    })
}

impl SqliteIdentityStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let in_memory = db_path == Path::new(":memory:");

        let enc_key = if in_memory {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
            }
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/proctor"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS faces (
                     user_id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     fingerprint TEXT NOT NULL,
                     reference BLOB,
                     verification_count INTEGER NOT NULL DEFAULT 0,
                     last_verified_at TEXT,
                     is_verified INTEGER NOT NULL DEFAULT 0,
                     registered_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS face_variations (
                     user_id TEXT NOT NULL REFERENCES faces(user_id) ON DELETE CASCADE,
                     idx INTEGER NOT NULL,
                     kind TEXT NOT NULL,
                     image BLOB NOT NULL,
                     PRIMARY KEY (user_id, idx)
                 );",
            )?;
            Ok(())
        })
        .await?;

        tracing::info!(path = %db_path.display(), "identity store opened");
        Ok(Self { conn, enc_key })
    }

    /// Remove a user's record and its variations.
    pub async fn remove(&self, user_id: &str) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM faces WHERE user_id = ?1", [&user_id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count registered users.
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn upsert(&self, user_id: &str, record: &FaceRecord) -> Result<UpsertOutcome, StoreError> {
        // Encode and encrypt before entering the SQLite closure
        let reference = match &record.reference {
            Some(image) => Some(self.encrypt_image(image)?),
            None => None,
        };
        let mut variations = Vec::with_capacity(record.variations.len());
        for v in &record.variations {
            variations.push((
                v.index as i64,
                serde_json::to_string(&v.kind)?,
                self.encrypt_image(&v.image)?,
            ));
        }

        let user_id = user_id.to_string();
        let name = record.name.clone();
        let fingerprint = record.fingerprint.as_str().to_string();
        let registered_at = record.registered_at.to_rfc3339();
        let updated_at = Utc::now().to_rfc3339();

        let existed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existed = tx
                    .query_row("SELECT 1 FROM faces WHERE user_id = ?1", [&user_id], |_| Ok(()))
                    .optional()?
                    .is_some();

                tx.execute(
                    "INSERT INTO faces (user_id, name, fingerprint, reference, registered_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(user_id) DO UPDATE SET
                         name = excluded.name,
                         fingerprint = excluded.fingerprint,
                         reference = excluded.reference,
                         updated_at = excluded.updated_at",
                    rusqlite::params![user_id, name, fingerprint, reference, registered_at, updated_at],
                )?;

                tx.execute("DELETE FROM face_variations WHERE user_id = ?1", [&user_id])?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO face_variations (user_id, idx, kind, image) VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for (idx, kind, image) in &variations {
                        stmt.execute(rusqlite::params![user_id, idx, kind, image])?;
                    }
                }

                tx.commit()?;
                Ok(existed)
            })
            .await?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn fetch(&self, user_id: Option<String>) -> Result<Vec<FaceRecord>, StoreError> {
        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let (faces, variations) = self
            .conn
            .call(move |conn| {
                let faces = match &user_id {
                    Some(user) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {FACE_COLUMNS} FROM faces WHERE user_id = ?1"
                        ))?;
                        let rows = stmt.query_map([user], face_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!("SELECT {FACE_COLUMNS} FROM faces"))?;
                        let rows = stmt.query_map([], face_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                };

                let variations = match &user_id {
                    Some(user) => {
                        let mut stmt = conn.prepare(
                            "SELECT user_id, idx, kind, image FROM face_variations
                             WHERE user_id = ?1 ORDER BY idx",
                        )?;
                        let rows = stmt.query_map([user], variation_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT user_id, idx, kind, image FROM face_variations
                             ORDER BY user_id, idx",
                        )?;
                        let rows = stmt.query_map([], variation_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                };

                Ok((faces, variations))
            })
            .await?;

        let mut by_user: HashMap<String, Vec<Variation>> = HashMap::new();
        for row in variations {
            let kind: VariationKind = serde_json::from_str(&row.kind)?;
            let image = self.decrypt_image(&row.image)?;
            by_user.entry(row.user_id).or_default().push(Variation {
                index: row.idx as u32,
                kind,
                image,
            });
        }

        let mut records = Vec::with_capacity(faces.len());
        for row in faces {
            let reference = match &row.reference {
                Some(blob) => Some(self.decrypt_image(blob)?),
                None => None,
            };
            records.push(FaceRecord {
                variations: by_user.remove(&row.user_id).unwrap_or_default(),
                user_id: row.user_id,
                name: row.name,
                fingerprint: Fingerprint::from_stored(row.fingerprint),
                reference,
                verification_count: row.verification_count.max(0) as u64,
                last_verified_at: row.last_verified_at.as_deref().map(parse_timestamp).transpose()?,
                is_verified: row.is_verified,
                registered_at: parse_timestamp(&row.registered_at)?,
            });
        }
        Ok(records)
    }

    async fn mark_verified(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let user = user_id.to_string();
        let at = at.to_rfc3339();
        let affected = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE faces SET verification_count = verification_count + 1,
                         is_verified = 1,
                         last_verified_at = ?2
                     WHERE user_id = ?1",
                    rusqlite::params![user, at],
                )?)
            })
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound(user_id.to_string()));
        }
        Ok(())
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// PNG-encode and encrypt an image with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_image(&self, image: &DynamicImage) -> Result<Vec<u8>, StoreError> {
        let plaintext = encode_png(image)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt and decode an image blob.
    fn decrypt_image(&self, blob: &[u8]) -> Result<DynamicImage, StoreError> {
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

        Ok(decode_bytes(&plaintext)?)
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn get(&self, user_id: &str) -> Result<Option<FaceRecord>, StorageError> {
        let mut records = self.fetch(Some(user_id.to_string())).await?;
        Ok(records.pop())
    }

    async fn put(&self, user_id: &str, record: &FaceRecord) -> Result<UpsertOutcome, StorageError> {
        Ok(self.upsert(user_id, record).await?)
    }

    async fn all(&self) -> Result<Vec<FaceRecord>, StorageError> {
        Ok(self.fetch(None).await?)
    }

    async fn record_verification(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        Ok(self.mark_verified(user_id, at).await?)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(value.to_string()))
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
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

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
            Luma([((x * 3 + y) % 256) as u8])
        }))
    }

    fn record(user: &str, name: &str, with_reference: bool) -> FaceRecord {
        let reference = gradient(64, 48);
        let variations = proctor_core::variations::generate(&reference);
        FaceRecord::new(
            user,
            name,
            Fingerprint::of(&reference),
            with_reference.then_some(reference),
            if with_reference { variations } else { vec![] },
            Utc::now(),
        )
    }

    async fn memory_store() -> SqliteIdentityStore {
        SqliteIdentityStore::open(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = memory_store().await;
        let rec = record("alice", "Alice", true);

        let outcome = store.put("alice", &rec).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let loaded = store.get("alice").await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "alice");
        assert_eq!(loaded.name, "Alice");
        assert_eq!(loaded.fingerprint, rec.fingerprint);
        assert_eq!(loaded.verification_count, 0);
        assert!(!loaded.is_verified);
        assert_eq!(
            loaded.reference.unwrap().to_luma8(),
            rec.reference.unwrap().to_luma8()
        );
        assert_eq!(loaded.variations.len(), 8);
        for (stored, original) in loaded.variations.iter().zip(rec.variations.iter()) {
            assert_eq!(stored.index, original.index);
            assert_eq!(stored.kind, original.kind);
            assert_eq!(stored.image.to_luma8(), original.image.to_luma8());
        }
    }

    #[tokio::test]
    async fn test_missing_user() {
        let store = memory_store().await;
        assert!(store.get("nobody").await.unwrap().is_none());
        assert!(store.record_verification("nobody", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_replaces_set_and_keeps_stats() {
        let store = memory_store().await;
        store.put("alice", &record("alice", "Alice", true)).await.unwrap();
        let at = Utc::now();
        store.record_verification("alice", at).await.unwrap();

        let outcome = store.put("alice", &record("alice", "Alice B.", false)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let loaded = store.get("alice").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Alice B.");
        assert!(loaded.reference.is_none());
        assert!(loaded.variations.is_empty());
        assert_eq!(loaded.verification_count, 1);
        assert!(loaded.is_verified);
        assert_eq!(
            loaded.last_verified_at.map(|t| t.timestamp()),
            Some(at.timestamp())
        );
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_leave_one_consistent_row() {
        let store = memory_store().await;
        let writers: Vec<_> = (0..12)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let rec = record("alice", &format!("Writer {i}"), i % 2 == 0);
                    store.put("alice", &rec).await.unwrap()
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for writer in writers {
            outcomes.push(writer.await.unwrap());
        }
        assert_eq!(
            outcomes.iter().filter(|o| **o == UpsertOutcome::Inserted).count(),
            1
        );
        assert_eq!(store.count().await.unwrap(), 1);

        let loaded = store.get("alice").await.unwrap().unwrap();
        let writer: usize = loaded
            .name
            .strip_prefix("Writer ")
            .and_then(|n| n.parse().ok())
            .expect("name written by one of the writers");
        if writer % 2 == 0 {
            assert!(loaded.reference.is_some());
            assert_eq!(loaded.variations.len(), 8);
            let mut indices: Vec<_> = loaded.variations.iter().map(|v| v.index).collect();
            indices.sort_unstable();
            indices.dedup();
            assert_eq!(indices.len(), 8);
        } else {
            assert!(loaded.reference.is_none());
            assert!(loaded.variations.is_empty());
        }
    }

    #[tokio::test]
    async fn test_all_groups_variations() {
        let store = memory_store().await;
        store.put("alice", &record("alice", "Alice", true)).await.unwrap();
        store.put("bob", &record("bob", "Bob", false)).await.unwrap();

        let mut all = store.all().await.unwrap();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].variations.len(), 8);
        assert!(all[1].variations.is_empty());
    }

    #[tokio::test]
    async fn test_remove_cascades() {
        let store = memory_store().await;
        store.put("alice", &record("alice", "Alice", true)).await.unwrap();
        assert!(store.remove("alice").await.unwrap());
        assert!(!store.remove("alice").await.unwrap());

        let orphans: u64 = store
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM face_variations", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn test_images_encrypted_at_rest() {
        let store = memory_store().await;
        store.put("alice", &record("alice", "Alice", true)).await.unwrap();

        let blob: Vec<u8> = store
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT reference FROM faces WHERE user_id = 'alice'", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap();
        const PNG_MAGIC: &[u8] = b"\x89PNG";
        assert!(!blob.windows(PNG_MAGIC.len()).any(|w| w == PNG_MAGIC));
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        // Blobs sealed under one key must not open under another
        let store1 = SqliteIdentityStore {
            conn: Connection::open(Path::new(":memory:")).await.unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = SqliteIdentityStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };

        let blob = store1.encrypt_image(&gradient(16, 16)).unwrap();
        assert!(store1.decrypt_image(&blob).is_ok());
        assert!(matches!(
            store2.decrypt_image(&blob),
            Err(StoreError::DecryptionFailed)
        ));
        assert!(matches!(
            store1.decrypt_image(&blob[..8]),
            Err(StoreError::InvalidBlob(8))
        ));
    }

    #[tokio::test]
    async fn test_key_generated_once_with_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!(
            "proctord-key-test-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join(".key");

        let first = load_or_generate_key(&key_path).unwrap();
        let second = load_or_generate_key(&key_path).unwrap();
        assert_eq!(first, second);

        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
