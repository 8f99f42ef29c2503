//! Internal-only encrypted credential store keyed by (host, purpose).
//!
//! Passwords are sealed with AES-256-GCM under a master key provisioned via
//! `SECRETS_KMS_KEY`. Plaintext exists only inside this process: lookups are
//! served to in-process callers, never over the external gateway, and every
//! read is audit-logged. Rotation keeps the previous key generation live so
//! reads succeed while the bulk re-encrypt runs.

use std::path::Path;
use std::sync::{Arc, Mutex};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// A decrypted credential. Only ever handed to in-process callers; the
/// `Debug` impl masks the password and the type is deliberately not
/// serializable.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("username", &self.username)
            .field("password", &"***")
            .field("domain", &self.domain)
            .finish()
    }
}

/// One audit log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub actor: String,
    pub host: String,
    pub purpose: String,
    pub action: String,
    pub outcome: String,
    pub timestamp: String,
}

fn derive_key(master_key: &str) -> Result<[u8; 32]> {
    if master_key.trim().is_empty() {
        return Err(Error::Config("missing_master_key".to_string()));
    }
    // 64 hex chars is taken as raw key material; anything else is hashed
    if master_key.len() == 64 && master_key.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes: Vec<u8> = (0..64)
            .step_by(2)
            .filter_map(|i| u8::from_str_radix(&master_key[i..i + 2], 16).ok())
            .collect();
        if bytes.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(key);
        }
    }
    let digest = Sha256::digest(master_key.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Ok(key)
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS credentials (
            host TEXT NOT NULL,
            purpose TEXT NOT NULL,
            username TEXT NOT NULL,
            ciphertext TEXT NOT NULL,
            nonce TEXT NOT NULL,
            domain TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (host, purpose)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS credential_access_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            host TEXT NOT NULL,
            purpose TEXT NOT NULL,
            action TEXT NOT NULL,
            outcome TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Encrypted credential broker.
pub struct SecretsBroker {
    conn: Arc<Mutex<Connection>>,
    primary: Aes256Gcm,
    /// Previous key generation, kept alive during rotation
    previous: Option<Aes256Gcm>,
}

impl std::fmt::Debug for SecretsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsBroker").finish_non_exhaustive()
    }
}

impl SecretsBroker {
    /// Open or create a broker store at the given path.
    ///
    /// # Errors
    /// [`Error::Config`] (`missing_master_key`) when the key is empty; this
    /// is fatal at boot.
    pub fn open(master_key: &str, path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        Self::with_connection(master_key, conn)
    }

    /// In-memory broker (for testing and single-process deployments).
    pub fn in_memory(master_key: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        Self::with_connection(master_key, conn)
    }

    fn with_connection(master_key: &str, conn: Connection) -> Result<Self> {
        let key = derive_key(master_key)?;
        init_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            primary: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            previous: None,
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    fn audit(&self, actor: &str, host: &str, purpose: &str, action: &str, outcome: &str) {
        let ts = Utc::now().to_rfc3339();
        let result = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO credential_access_log
                 (actor, host, purpose, action, outcome, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![actor, host, purpose, action, outcome, ts],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::error!(host, purpose, action, error = %e, "credential audit write failed");
        }
    }

    fn encrypt(&self, plaintext: &str) -> Result<(String, String)> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .primary
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;
        Ok((BASE64.encode(ciphertext), BASE64.encode(nonce_bytes)))
    }

    fn decrypt(&self, ciphertext_b64: &str, nonce_b64: &str) -> Result<String> {
        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| Error::Crypto(format!("bad ciphertext encoding: {e}")))?;
        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| Error::Crypto(format!("bad nonce encoding: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(Error::Crypto("bad nonce length".to_string()));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        // Try the current key generation, then the previous one mid-rotation
        if let Ok(plain) = self.primary.decrypt(nonce, ciphertext.as_ref()) {
            return String::from_utf8(plain)
                .map_err(|_| Error::Crypto("plaintext is not UTF-8".to_string()));
        }
        if let Some(previous) = &self.previous {
            if let Ok(plain) = previous.decrypt(nonce, ciphertext.as_ref()) {
                return String::from_utf8(plain)
                    .map_err(|_| Error::Crypto("plaintext is not UTF-8".to_string()));
            }
        }
        Err(Error::Crypto(
            "integrity check failed or wrong master key".to_string(),
        ))
    }

    /// Store or replace a credential for (host, purpose).
    pub fn upsert_credential(
        &self,
        actor: &str,
        host: &str,
        purpose: &str,
        username: &str,
        password: &str,
        domain: Option<&str>,
    ) -> Result<()> {
        let (ciphertext, nonce) = self.encrypt(password)?;
        let now = Utc::now().to_rfc3339();
        let outcome = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO credentials
                 (host, purpose, username, ciphertext, nonce, domain, deleted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
                 ON CONFLICT(host, purpose) DO UPDATE SET
                    username = excluded.username,
                    ciphertext = excluded.ciphertext,
                    nonce = excluded.nonce,
                    domain = excluded.domain,
                    deleted = 0,
                    updated_at = excluded.updated_at",
                params![host, purpose, username, ciphertext, nonce, domain, now],
            )?;
            Ok(())
        });
        match outcome {
            Ok(()) => {
                self.audit(actor, host, purpose, "upsert", "ok");
                Ok(())
            }
            Err(e) => {
                self.audit(actor, host, purpose, "upsert", "error");
                Err(e)
            }
        }
    }

    /// Decrypt and return the credential for (host, purpose).
    ///
    /// In-process callers only; the ingress gateway never exposes this.
    pub fn lookup_credential(
        &self,
        actor: &str,
        host: &str,
        purpose: &str,
    ) -> Result<ResolvedCredential> {
        let row: Option<(String, String, String, Option<String>)> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT username, ciphertext, nonce, domain
                 FROM credentials WHERE host = ?1 AND purpose = ?2 AND deleted = 0",
                params![host, purpose],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
        })?;

        let Some((username, ciphertext, nonce, domain)) = row else {
            self.audit(actor, host, purpose, "lookup", "miss");
            return Err(Error::NotFound(format!("credential for {host}/{purpose}")));
        };

        match self.decrypt(&ciphertext, &nonce) {
            Ok(password) => {
                self.audit(actor, host, purpose, "lookup", "ok");
                Ok(ResolvedCredential {
                    username,
                    password,
                    domain,
                })
            }
            Err(e) => {
                self.audit(actor, host, purpose, "lookup", "decrypt_failed");
                Err(e)
            }
        }
    }

    /// Whether a live credential exists, without decrypting or auditing a read.
    pub fn has_credential(&self, host: &str, purpose: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM credentials WHERE host = ?1 AND purpose = ?2 AND deleted = 0",
                params![host, purpose],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
        })
    }

    /// Tombstone the credential for (host, purpose).
    pub fn delete_credential(&self, actor: &str, host: &str, purpose: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE credentials SET deleted = 1, updated_at = ?3
                 WHERE host = ?1 AND purpose = ?2 AND deleted = 0",
                params![host, purpose, now],
            )
        })?;
        if changed == 0 {
            self.audit(actor, host, purpose, "delete", "miss");
            return Err(Error::NotFound(format!("credential for {host}/{purpose}")));
        }
        self.audit(actor, host, purpose, "delete", "ok");
        Ok(())
    }

    /// Rotate to a new master key, re-encrypting every live row in bulk.
    /// The old generation stays available for reads until rotation returns.
    pub fn rotate_master_key(&mut self, new_master_key: &str) -> Result<usize> {
        let new_key = derive_key(new_master_key)?;
        let old = std::mem::replace(
            &mut self.primary,
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&new_key)),
        );
        self.previous = Some(old);

        let rows: Vec<(String, String, String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT host, purpose, ciphertext, nonce FROM credentials WHERE deleted = 0",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            mapped.collect()
        })?;

        let mut rotated = 0usize;
        for (host, purpose, ciphertext, nonce) in rows {
            let plaintext = self.decrypt(&ciphertext, &nonce)?;
            let (new_ciphertext, new_nonce) = self.encrypt(&plaintext)?;
            let now = Utc::now().to_rfc3339();
            self.with_conn(|conn| {
                conn.execute(
                    "UPDATE credentials SET ciphertext = ?3, nonce = ?4, updated_at = ?5
                     WHERE host = ?1 AND purpose = ?2",
                    params![host, purpose, new_ciphertext, new_nonce, now],
                )?;
                Ok(())
            })?;
            rotated += 1;
        }

        self.previous = None;
        Ok(rotated)
    }

    /// The most recent audit rows, newest first.
    pub fn audit_log(&self, limit: usize) -> Result<Vec<AuditRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT actor, host, purpose, action, outcome, timestamp
                 FROM credential_access_log ORDER BY id DESC LIMIT ?1",
            )?;
            let mapped = stmt.query_map(params![limit as i64], |row| {
                Ok(AuditRow {
                    actor: row.get(0)?,
                    host: row.get(1)?,
                    purpose: row.get(2)?,
                    action: row.get(3)?,
                    outcome: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?;
            mapped.collect()
        })
    }
}
