//! Encrypted file listing and deletion.
//!
//! The server only ever sees sealed `FileInfo` blobs; the listing is
//! decrypted locally with the bucket CEK, so directory contents stay
//! private even from the storage side.

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::debug;

use crate::cipher;
use crate::envelope::EnvelopeKeys;
use crate::error::{Result, XferError};
use crate::routes::{query, RouteKey};
use crate::transport::Transport;
use crate::types::{FileEntry, FileInfo, FilesListResp};

/// Fetches and decrypts the bucket's file listing.
pub struct FileListing {
    transport: Arc<Transport>,
    keys: EnvelopeKeys,
}

impl FileListing {
    pub fn new(transport: Arc<Transport>) -> Self {
        let keys = EnvelopeKeys::new(transport.session().clone());
        Self { transport, keys }
    }

    /// Lists the files in the open bucket.
    pub async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let (status, _, body) = self
            .transport
            .call(RouteKey::FileList, &[], &[], None)
            .await?;
        if status != StatusCode::OK {
            return Err(XferError::Transport(format!(
                "file list returned status {}",
                status
            )));
        }

        let list: FilesListResp = serde_json::from_slice(&body)?;

        let mut files = Vec::with_capacity(list.files.len());
        for item in list.files {
            let enc_info = cipher::decode_base64(&item.enc_file_info)?;
            let nonce = cipher::decode_base64(&item.file_info_nonce)?;

            let info_bytes = self.keys.open_with_bucket(&enc_info, &nonce)?;
            let info: FileInfo = serde_json::from_slice(&info_bytes)
                .map_err(|e| XferError::Integrity(format!("file info malformed: {}", e)))?;

            files.push(FileEntry {
                created_at: item.created_at,
                file_uuid: item.file_uuid,
                file_name: info.file_name,
                file_ext: info.file_ext,
                file_size: info.file_size,
                has_file_password: info.has_file_password,
            });
        }

        debug!(count = files.len(), "Listed files");
        Ok(files)
    }

    /// Deletes one file from the bucket.
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        let (status, _, _) = self
            .transport
            .call(RouteKey::DeleteFile, &[(query::FILE_ID, file_id)], &[], None)
            .await?;
        if status != StatusCode::OK {
            return Err(XferError::Transport(format!(
                "file delete returned status {}",
                status
            )));
        }

        debug!(file_id = %file_id, "Deleted file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{SecretKey, SecretVec};
    use crate::session::Session;

    fn live_keys() -> EnvelopeKeys {
        let session = Arc::new(Session::new());
        session
            .set(
                "sess-list".into(),
                SecretVec::new(vec![0x55; 32]),
                "AAA-BBB-03".into(),
                SecretKey::from_bytes([0x66; 32]),
                3600,
            )
            .unwrap();
        EnvelopeKeys::new(session)
    }

    #[test]
    fn test_sealed_file_info_roundtrip() {
        // The decrypt path list_files runs per entry, in isolation.
        let keys = live_keys();

        let info = FileInfo {
            file_name: "notes.txt".into(),
            file_ext: ".txt".into(),
            file_size: 321,
            has_file_password: true,
        };
        let (enc, nonce) = keys
            .seal_with_bucket(&serde_json::to_vec(&info).unwrap())
            .unwrap();

        let opened = keys.open_with_bucket(&enc, &nonce).unwrap();
        let parsed: FileInfo = serde_json::from_slice(&opened).unwrap();

        assert_eq!(parsed.file_name, "notes.txt");
        assert_eq!(parsed.file_size, 321);
        assert!(parsed.has_file_password);
    }

    #[test]
    fn test_file_info_under_wrong_cek_fails() {
        let keys = live_keys();
        let other = {
            let session = Arc::new(Session::new());
            session
                .set(
                    "sess-other".into(),
                    SecretVec::new(vec![0x77; 32]),
                    "AAA-BBB-04".into(),
                    SecretKey::from_bytes([0x88; 32]),
                    3600,
                )
                .unwrap();
            EnvelopeKeys::new(session)
        };

        let (enc, nonce) = keys.seal_with_bucket(b"{\"FileName\":\"x\"}").unwrap();
        assert!(other.open_with_bucket(&enc, &nonce).is_err());
    }

    #[tokio::test]
    async fn test_listing_requires_session() {
        let session = Arc::new(Session::new());
        let transport = Arc::new(Transport::new("https://api.example.org", session).unwrap());
        let listing = FileListing::new(transport);

        let result = listing.list_files().await;
        assert!(matches!(result, Err(XferError::NotAuthenticated(_))));
    }
}
