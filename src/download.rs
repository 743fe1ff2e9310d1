//! Download engine.
//!
//! Streams the ciphertext to disk, fetches metadata and digests, and only
//! then starts trusting anything: both transfer digests must match, the
//! metadata HMAC must verify, the wrapped key must unwrap, and finally
//! the decrypted plaintext must match its recorded HMAC. Any mismatch
//! aborts with an integrity error and leaves no plaintext behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::StatusCode;
use subtle::ConstantTimeEq;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::cipher::{self, SecretVec};
use crate::config::{ENC_FILE_PREFIX, ENC_FILE_SUFFIX};
use crate::envelope::{self, EnvelopeKeys};
use crate::error::{Result, XferError};
use crate::pipeline::{CancelToken, ProgressFn, TempFileGuard};
use crate::routes::{header, query, RouteKey};
use crate::transport::Transport;
use crate::types::{DownloadDigestResp, DownloadMetaResp, MetaWrapper};

/// Verified streaming download engine.
pub struct DownloadEngine {
    transport: Arc<Transport>,
    keys: EnvelopeKeys,
}

impl DownloadEngine {
    pub fn new(transport: Arc<Transport>) -> Self {
        let keys = EnvelopeKeys::new(transport.session().clone());
        Self { transport, keys }
    }

    /// Downloads, verifies and decrypts one file.
    ///
    /// Returns the path of the plaintext file, written to the working
    /// directory under its original name.
    pub async fn manage_download(
        &self,
        file_id: &str,
        file_password: Option<SecretVec>,
        progress: ProgressFn,
        cancel: CancelToken,
    ) -> Result<PathBuf> {
        // INIT: the server issues a continuation token that authorizes
        // the data/meta/digest legs for this file.
        let (status, headers, _) = self
            .transport
            .call(RouteKey::DownloadInit, &[(query::FILE_ID, file_id)], &[], None)
            .await?;
        if status != StatusCode::OK {
            return Err(XferError::Transport(format!(
                "download init returned status {}",
                status
            )));
        }
        let download_id = headers
            .get(header::DOWNLOAD_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| XferError::Transport("download id not found".into()))?
            .to_string();

        let work_dir = std::env::current_dir()?;
        let enc_path = work_dir.join(format!("{}{}{}", ENC_FILE_PREFIX, file_id, ENC_FILE_SUFFIX));
        // The ciphertext temp file never survives the run.
        let _guard = TempFileGuard::new(enc_path.clone());

        // DATA
        self.stream_data(file_id, &download_id, &enc_path, progress.clone(), cancel.clone())
            .await?;

        // META
        let meta_resp = self.fetch_meta(file_id, &download_id).await?;
        // DIGEST
        let digest = self.fetch_digest(file_id, &download_id).await?;

        if cancel.is_cancelled() {
            return Err(XferError::Cancelled);
        }

        // Verification and decryption are CPU-bound (two digest passes, a
        // KDF or two, whole-file AEAD): blocking pool.
        let out_path = {
            let keys = self.keys.clone();
            let enc_path = enc_path.clone();
            let enc_meta = cipher::decode_base64(&meta_resp.enc_meta)?;
            let meta_nonce = cipher::decode_base64(&meta_resp.meta_nonce)?;
            tokio::task::spawn_blocking(move || {
                verify_and_decrypt(
                    &keys,
                    &enc_path,
                    &enc_meta,
                    &meta_nonce,
                    &digest,
                    file_password,
                    &work_dir,
                )
            })
            .await
            .map_err(|e| XferError::Internal(format!("join error: {}", e)))??
        };

        info!(file_id = %file_id, path = %out_path.display(), "Download complete");
        Ok(out_path)
    }

    /// Streams the ciphertext body to `enc_path`, reporting progress from
    /// the declared content length.
    async fn stream_data(
        &self,
        file_id: &str,
        download_id: &str,
        enc_path: &Path,
        progress: ProgressFn,
        cancel: CancelToken,
    ) -> Result<()> {
        let response = self
            .transport
            .stream(RouteKey::DownloadData, &[(query::FILE_ID, file_id)], download_id)
            .await?;
        if !response.status().is_success() {
            return Err(XferError::Transport(format!(
                "download data returned status {}",
                response.status()
            )));
        }

        let full_size = response
            .content_length()
            .ok_or_else(|| XferError::Transport("download data missing content length".into()))?;

        let mut out = tokio::fs::File::create(enc_path).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(XferError::Cancelled);
            }
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(
                "downloading",
                ((downloaded * 100) / full_size.max(1)).min(100) as u8,
            );
        }
        out.flush().await?;

        // A stream that ends early is a truncated transfer, not EOF.
        if downloaded != full_size {
            return Err(XferError::Transport(format!(
                "short read: got {} of {} bytes",
                downloaded, full_size
            )));
        }

        debug!(bytes = downloaded, "Ciphertext streamed to disk");
        Ok(())
    }

    async fn fetch_meta(&self, file_id: &str, download_id: &str) -> Result<DownloadMetaResp> {
        let (status, _, body) = self
            .transport
            .call(
                RouteKey::DownloadMeta,
                &[(query::FILE_ID, file_id)],
                &[(header::DOWNLOAD_ID, download_id.to_string())],
                None,
            )
            .await?;
        if status != StatusCode::OK {
            return Err(XferError::Transport(format!(
                "download meta returned status {}",
                status
            )));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn fetch_digest(&self, file_id: &str, download_id: &str) -> Result<DownloadDigestResp> {
        let (status, _, body) = self
            .transport
            .call(
                RouteKey::DownloadDigest,
                &[(query::FILE_ID, file_id)],
                &[(header::DOWNLOAD_ID, download_id.to_string())],
                None,
            )
            .await?;
        if status != StatusCode::OK {
            return Err(XferError::Transport(format!(
                "download digest returned status {}",
                status
            )));
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Constant-time equality over two base64 digest strings.
fn digests_match(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// The trust-establishing half of a download: verifies both transfer
/// digests, opens and re-verifies the metadata, unwraps the file CEK,
/// decrypts, and verifies the plaintext HMAC.
///
/// On a plaintext HMAC mismatch the decrypted file is removed before the
/// error returns; a tampered file never survives on disk.
pub(crate) fn verify_and_decrypt(
    keys: &EnvelopeKeys,
    enc_path: &Path,
    enc_meta: &[u8],
    meta_nonce: &[u8],
    digest: &DownloadDigestResp,
    file_password: Option<SecretVec>,
    out_dir: &Path,
) -> Result<PathBuf> {
    // Transfer digests over the encrypted artifacts.
    let enc_data_sha = cipher::sha256_file(enc_path)?;
    if !digests_match(&enc_data_sha, &digest.data_checksum) {
        return Err(XferError::Integrity("data checksum mismatch".into()));
    }
    let enc_meta_sha = cipher::sha256_bytes(enc_meta);
    if !digests_match(&enc_meta_sha, &digest.meta_checksum) {
        return Err(XferError::Integrity("metadata checksum mismatch".into()));
    }

    // Open the metadata envelope and re-verify the inner HMAC.
    let wrapper_bytes = keys.open_with_bucket(enc_meta, meta_nonce)?;
    let wrapper: MetaWrapper = serde_json::from_slice(&wrapper_bytes)
        .map_err(|e| XferError::Integrity(format!("metadata malformed: {}", e)))?;
    let meta = wrapper.meta;

    let b_kek_salt = cipher::decode_base64(&meta.file_cipher.b_kek_salt)?;
    let bucket_kek = keys.bucket_kek_for_salt(&b_kek_salt)?;

    let meta_bytes = serde_json::to_vec(&meta).map_err(|e| XferError::Internal(e.to_string()))?;
    let meta_hmac = cipher::hmac_bytes(&meta_bytes, bucket_kek.as_ref())?;
    if !digests_match(&meta_hmac, &wrapper.raw_meta_hmac) {
        return Err(XferError::Integrity("metadata forged".into()));
    }

    // Unwrap the file CEK; this is where a wrong or missing file password
    // surfaces.
    let file_cek = envelope::unwrap_file_key(
        &meta.file_cipher,
        meta.has_file_password,
        &bucket_kek,
        file_password.as_ref().map(|p| p.as_bytes()),
    )?;

    // Decrypt to the original name and verify the plaintext tag.
    let file_nonce = cipher::decode_base64(&meta.file_cipher.file_nonce)?;
    let out_path = out_dir.join(&meta.file_name);
    cipher::open_file(&file_cek, &file_nonce, enc_path, &out_path)?;

    let raw_hmac = cipher::hmac_file(&out_path, bucket_kek.as_ref())?;
    if !digests_match(&raw_hmac, &meta.raw_data_hmac) {
        if let Err(e) = std::fs::remove_file(&out_path) {
            warn!(path = %out_path.display(), error = %e, "Failed to remove tampered plaintext");
        }
        return Err(XferError::Integrity("plaintext checksum mismatch".into()));
    }

    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::SecretKey;
    use crate::session::Session;
    use crate::upload::{encrypt_stage, EncArtifacts};

    fn live_keys() -> EnvelopeKeys {
        let session = Arc::new(Session::new());
        session
            .set(
                "sess-down".into(),
                SecretVec::new(vec![0x33; 32]),
                "AAA-BBB-02".into(),
                SecretKey::from_bytes([0x44; 32]),
                3600,
            )
            .unwrap();
        EnvelopeKeys::new(session)
    }

    /// Runs the upload-side encrypt stage and returns what the server
    /// would hand back at download time.
    fn uploaded_fixture(
        keys: &EnvelopeKeys,
        dir: &Path,
        contents: &[u8],
        file_password: Option<&[u8]>,
    ) -> (PathBuf, EncArtifacts, DownloadDigestResp) {
        let raw = dir.join("original.bin");
        let enc = dir.join(".goXfer.original.bin.enc");
        std::fs::write(&raw, contents).unwrap();

        let artifacts = encrypt_stage(
            keys,
            file_password.map(|p| SecretVec::new(p.to_vec())),
            &raw,
            &enc,
        )
        .unwrap();

        let digest = DownloadDigestResp {
            data_checksum: cipher::sha256_file(&enc).unwrap(),
            meta_checksum: cipher::sha256_bytes(&artifacts.enc_meta),
        };

        // The "download" decrypts into a separate directory so the
        // original is untouched for comparison.
        std::fs::remove_file(&raw).unwrap();
        (enc, artifacts, digest)
    }

    #[test]
    fn test_round_trip_restores_exact_bytes() {
        let keys = live_keys();
        let dir = tempfile::tempdir().unwrap();
        let contents = b"round trip payload \x00\x01\x02";

        let (enc, artifacts, digest) = uploaded_fixture(&keys, dir.path(), contents, None);

        let out_dir = tempfile::tempdir().unwrap();
        let out = verify_and_decrypt(
            &keys,
            &enc,
            &artifacts.enc_meta,
            &artifacts.meta_nonce,
            &digest,
            None,
            out_dir.path(),
        )
        .unwrap();

        assert_eq!(out.file_name().unwrap(), "original.bin");
        assert_eq!(std::fs::read(&out).unwrap(), contents);
    }

    #[test]
    fn test_tampered_ciphertext_detected() {
        let keys = live_keys();
        let dir = tempfile::tempdir().unwrap();
        let (enc, artifacts, digest) = uploaded_fixture(&keys, dir.path(), b"payload", None);

        // Flip one byte of the ciphertext in transit.
        let mut bytes = std::fs::read(&enc).unwrap();
        bytes[0] ^= 0x01;
        std::fs::write(&enc, bytes).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let result = verify_and_decrypt(
            &keys,
            &enc,
            &artifacts.enc_meta,
            &artifacts.meta_nonce,
            &digest,
            None,
            out_dir.path(),
        );
        assert!(matches!(result, Err(XferError::Integrity(_))));
        // No plaintext was written.
        assert!(std::fs::read_dir(out_dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_tampered_digest_detected() {
        let keys = live_keys();
        let dir = tempfile::tempdir().unwrap();
        let (enc, artifacts, mut digest) = uploaded_fixture(&keys, dir.path(), b"payload", None);

        digest.meta_checksum = cipher::sha256_bytes(b"something else");

        let out_dir = tempfile::tempdir().unwrap();
        let result = verify_and_decrypt(
            &keys,
            &enc,
            &artifacts.enc_meta,
            &artifacts.meta_nonce,
            &digest,
            None,
            out_dir.path(),
        );
        assert!(matches!(result, Err(XferError::Integrity(_))));
    }

    #[test]
    fn test_forged_metadata_detected() {
        let keys = live_keys();
        let dir = tempfile::tempdir().unwrap();
        let (enc, artifacts, _) = uploaded_fixture(&keys, dir.path(), b"payload", None);

        // Re-seal an altered inner record with the correct bucket CEK but
        // a stale inner HMAC: the checksum legs pass, the HMAC must not.
        let wrapper_bytes = keys
            .open_with_bucket(&artifacts.enc_meta, &artifacts.meta_nonce)
            .unwrap();
        let mut wrapper: MetaWrapper = serde_json::from_slice(&wrapper_bytes).unwrap();
        wrapper.meta.file_size += 1;
        let (forged_meta, forged_nonce) = keys
            .seal_with_bucket(&serde_json::to_vec(&wrapper).unwrap())
            .unwrap();

        let digest = DownloadDigestResp {
            data_checksum: cipher::sha256_file(&enc).unwrap(),
            meta_checksum: cipher::sha256_bytes(&forged_meta),
        };

        let out_dir = tempfile::tempdir().unwrap();
        let result = verify_and_decrypt(
            &keys,
            &enc,
            &forged_meta,
            &forged_nonce,
            &digest,
            None,
            out_dir.path(),
        );
        match result {
            Err(XferError::Integrity(msg)) => assert!(msg.contains("forged"), "{}", msg),
            other => panic!("expected forged-metadata error, got {:?}", other),
        }
    }

    #[test]
    fn test_file_password_gates_download() {
        let keys = live_keys();
        let dir = tempfile::tempdir().unwrap();
        let (enc, artifacts, digest) =
            uploaded_fixture(&keys, dir.path(), b"guarded payload", Some(b"pw2-Strong!"));

        let out_dir = tempfile::tempdir().unwrap();

        // No password at all.
        let result = verify_and_decrypt(
            &keys,
            &enc,
            &artifacts.enc_meta,
            &artifacts.meta_nonce,
            &digest,
            None,
            out_dir.path(),
        );
        assert!(matches!(result, Err(XferError::PasswordRequired)));

        // Wrong password.
        let result = verify_and_decrypt(
            &keys,
            &enc,
            &artifacts.enc_meta,
            &artifacts.meta_nonce,
            &digest,
            Some(SecretVec::new(b"wrong-pw-Z1!".to_vec())),
            out_dir.path(),
        );
        assert!(matches!(result, Err(XferError::AuthFailed(_))));

        // Right password.
        let out = verify_and_decrypt(
            &keys,
            &enc,
            &artifacts.enc_meta,
            &artifacts.meta_nonce,
            &digest,
            Some(SecretVec::new(b"pw2-Strong!".to_vec())),
            out_dir.path(),
        )
        .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"guarded payload");
    }

    #[test]
    fn test_digest_comparison_is_exact() {
        assert!(digests_match("abc123==", "abc123=="));
        assert!(!digests_match("abc123==", "abc124=="));
        assert!(!digests_match("abc", "abcd"));
    }
}
