//! Saved-credential storage for remembered buckets.
//!
//! Two pieces cooperate here:
//! - a JSON manifest (mode 0600) listing remembered bucket keys with a
//!   random per-entry index, usage counter and timestamps;
//! - the OS secret service (keychain / Credential Manager / Secret
//!   Service), which holds the actual password under the manifest index
//!   as account name.
//!
//! No key material beyond the remembered password is ever persisted, and
//! the password never touches the manifest file.

use std::fs;
use std::path::PathBuf;

use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cipher::{self, SecretVec};
use crate::config::KEYCHAIN_SERVICE;
use crate::error::{Result, XferError};

/// Length of the random per-entry index in bytes (hex-encoded on disk).
const INDEX_LEN: usize = 16;

/// One manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredEntry {
    /// Random hex index; doubles as the secret-service account name.
    pub index: String,
    /// The remembered bucket key.
    pub key: String,
    /// Unix seconds at creation.
    pub created_at: i64,
    /// Whether the entry should be offered at startup.
    pub remember: bool,
    /// Times this entry was used to open a bucket.
    pub used: i32,
}

/// A remembered credential with its password resolved.
pub struct SavedCred {
    pub key: String,
    pub password: SecretVec,
}

/// Manages the manifest file and the secret-service entries behind it.
pub struct CredsManager {
    manifest_path: PathBuf,
    service: &'static str,
}

impl CredsManager {
    pub fn new(manifest_path: PathBuf) -> Self {
        Self {
            manifest_path,
            service: KEYCHAIN_SERVICE,
        }
    }

    /// Remembers a bucket key, storing its password in the secret service.
    ///
    /// An existing entry for the same bucket key is replaced, old secret
    /// included.
    pub fn remember(&self, bucket_key: &str, password: &SecretVec) -> Result<()> {
        let index = hex::encode(cipher::random_bytes(INDEX_LEN));

        // Drop any previous secret for this bucket before replacing the
        // manifest entry, so no orphan lingers in the secret service.
        let mut entries = self.read()?;
        if let Some(old) = entries.iter().find(|e| e.key == bucket_key) {
            let _ = self.delete_secret(&old.index);
        }
        entries.retain(|e| e.key != bucket_key);

        entries.push(CredEntry {
            index: index.clone(),
            key: bucket_key.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            remember: true,
            used: 1,
        });
        self.save(&entries)?;

        let password = String::from_utf8(password.as_bytes().to_vec())
            .map_err(|_| XferError::Storage("password is not valid UTF-8".into()))?;
        self.store_secret(&index, &password)?;

        debug!(bucket_key = %bucket_key, "Remembered credentials");
        Ok(())
    }

    /// Returns remembered credentials, most-used first.
    ///
    /// Entries whose secret has disappeared from the secret service are
    /// skipped rather than failing the whole listing.
    pub fn list(&self) -> Result<Vec<SavedCred>> {
        let entries = sorted_for_display(self.read()?);

        let mut saved = Vec::new();
        for entry in entries {
            match self.get_secret(&entry.index) {
                Ok(Some(password)) => saved.push(SavedCred {
                    key: entry.key,
                    password: SecretVec::new(password.into_bytes()),
                }),
                Ok(None) => {
                    warn!(bucket_key = %entry.key, "Secret missing for remembered bucket; skipping")
                }
                Err(e) => {
                    warn!(bucket_key = %entry.key, error = %e, "Secret service error; skipping")
                }
            }
        }

        Ok(saved)
    }

    /// Bumps the usage counter for a bucket key.
    pub fn mark_used(&self, bucket_key: &str) -> Result<()> {
        let mut entries = self.read()?;
        if let Some(entry) = entries.iter_mut().find(|e| e.key == bucket_key) {
            entry.used += 1;
        }
        self.save(&entries)
    }

    /// Forgets one remembered bucket, manifest entry and secret both.
    pub fn forget(&self, bucket_key: &str) -> Result<()> {
        let mut entries = self.read()?;
        if let Some(entry) = entries.iter().find(|e| e.key == bucket_key) {
            let _ = self.delete_secret(&entry.index);
        }
        entries.retain(|e| e.key != bucket_key);
        self.save(&entries)
    }

    /// Reads the manifest. A missing file is an empty list; an unparseable
    /// file is reset to empty rather than wedging every future run.
    pub(crate) fn read(&self) -> Result<Vec<CredEntry>> {
        let data = match fs::read(&self.manifest_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(XferError::Storage(format!("failed to read manifest: {}", e))),
        };

        match serde_json::from_slice(&data) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(error = %e, "Credential manifest corrupt; resetting");
                self.save(&[])?;
                Ok(Vec::new())
            }
        }
    }

    /// Writes the manifest with owner-only permissions.
    pub(crate) fn save(&self, entries: &[CredEntry]) -> Result<()> {
        if let Some(parent) = self.manifest_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| XferError::Storage(format!("failed to create config dir: {}", e)))?;
        }

        let data = serde_json::to_vec_pretty(entries)
            .map_err(|e| XferError::Storage(format!("failed to serialize manifest: {}", e)))?;
        fs::write(&self.manifest_path, data)
            .map_err(|e| XferError::Storage(format!("failed to write manifest: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.manifest_path, perms).map_err(|e| {
                XferError::Storage(format!("failed to set manifest permissions: {}", e))
            })?;
        }

        Ok(())
    }

    /// Stores a password in the secret service.
    fn store_secret(&self, index: &str, password: &str) -> Result<()> {
        let entry = Entry::new(self.service, index)
            .map_err(|e| XferError::Storage(e.to_string()))?;
        entry
            .set_password(password)
            .map_err(|e| XferError::Storage(e.to_string()))
    }

    /// Retrieves a password from the secret service.
    fn get_secret(&self, index: &str) -> Result<Option<String>> {
        let entry = Entry::new(self.service, index)
            .map_err(|e| XferError::Storage(e.to_string()))?;
        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(XferError::Storage(e.to_string())),
        }
    }

    /// Deletes a password from the secret service.
    fn delete_secret(&self, index: &str) -> Result<()> {
        let entry = Entry::new(self.service, index)
            .map_err(|e| XferError::Storage(e.to_string()))?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already gone
            Err(e) => Err(XferError::Storage(e.to_string())),
        }
    }
}

/// Orders manifest entries by usage, most-used first.
fn sorted_for_display(mut entries: Vec<CredEntry>) -> Vec<CredEntry> {
    entries.sort_by(|a, b| b.used.cmp(&a.used));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> CredsManager {
        CredsManager::new(dir.path().join(".goxfer.creds.json"))
    }

    fn entry(index: &str, key: &str, used: i32) -> CredEntry {
        CredEntry {
            index: index.to_string(),
            key: key.to_string(),
            created_at: 1_700_000_000,
            remember: true,
            used,
        }
    }

    #[test]
    fn test_missing_manifest_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(manager(&dir).read().unwrap().is_empty());
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        mgr.save(&[entry("aa", "ABC-DEF-01", 3), entry("bb", "XYZ-QRS-02", 1)])
            .unwrap();

        let entries = mgr.read().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "ABC-DEF-01");
        assert_eq!(entries[0].used, 3);
    }

    #[test]
    fn test_corrupt_manifest_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        std::fs::write(dir.path().join(".goxfer.creds.json"), b"{{{nope").unwrap();

        assert!(mgr.read().unwrap().is_empty());
        // The reset was persisted.
        let raw = std::fs::read(dir.path().join(".goxfer.creds.json")).unwrap();
        assert_eq!(serde_json::from_slice::<Vec<CredEntry>>(&raw).unwrap().len(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_manifest_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.save(&[entry("aa", "ABC-DEF-01", 1)]).unwrap();

        let mode = std::fs::metadata(dir.path().join(".goxfer.creds.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_mark_used_increments() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.save(&[entry("aa", "ABC-DEF-01", 1)]).unwrap();

        mgr.mark_used("ABC-DEF-01").unwrap();
        mgr.mark_used("ABC-DEF-01").unwrap();
        mgr.mark_used("NOT-HER-00").unwrap(); // no-op

        let entries = mgr.read().unwrap();
        assert_eq!(entries[0].used, 3);
    }

    #[test]
    fn test_display_order_is_most_used_first() {
        let entries = vec![
            entry("aa", "AAA-AAA-01", 1),
            entry("bb", "BBB-BBB-02", 9),
            entry("cc", "CCC-CCC-03", 4),
        ];

        let sorted = sorted_for_display(entries);
        let keys: Vec<_> = sorted.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["BBB-BBB-02", "CCC-CCC-03", "AAA-AAA-01"]);
    }

    #[test]
    fn test_forget_removes_manifest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.save(&[entry("aa", "ABC-DEF-01", 1), entry("bb", "XYZ-QRS-02", 1)])
            .unwrap();

        mgr.forget("ABC-DEF-01").unwrap();

        let entries = mgr.read().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "XYZ-QRS-02");
    }
}
