//! Upload engine.
//!
//! Drives one upload through its stages:
//!
//! ```text
//! INIT_PROBE → ENCRYPT → INIT_UPLOAD → PUMP → COMPLETE → DONE
//!      │           │           │          │        │
//!      └───────────┴───────────┴──────────┴────────┴──→ FAIL
//! ```
//!
//! The ciphertext temp file written next to the source is removed on
//! every exit path, including cancellation and panics. Chunk workers run
//! in parallel, retry transport errors with exponential backoff, and
//! cancel their peers on the first unrecoverable error.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cipher::{self, SecretKey, SecretVec};
use crate::config::{
    CHUNK_MAX_ATTEMPTS, CHUNK_RETRY_BASE_DELAY_MS, ENC_FILE_PREFIX, ENC_FILE_SUFFIX,
};
use crate::envelope::{self, EnvelopeKeys};
use crate::error::{Result, XferError};
use crate::pipeline::{monitor_progress, CancelToken, ProgressFn, TempFileGuard};
use crate::routes::{query, RouteKey};
use crate::transport::{RequestBody, Transport};
use crate::types::{CompleteUploadReq, FileCipherData, FileInfo, InitUploadReq, MetaData, MetaWrapper, UploadPlan};

/// Everything the encrypt stage leaves behind for the later stages.
pub(crate) struct EncArtifacts {
    /// Sealed `MetaWrapper` bytes.
    pub enc_meta: Vec<u8>,
    pub meta_nonce: [u8; cipher::NONCE_SIZE],
    /// Sealed `FileInfo` bytes.
    pub enc_info: Vec<u8>,
    pub info_nonce: [u8; cipher::NONCE_SIZE],
}

/// Parallel chunked upload engine.
pub struct UploadEngine {
    transport: Arc<Transport>,
    keys: EnvelopeKeys,
}

impl UploadEngine {
    pub fn new(transport: Arc<Transport>) -> Self {
        let keys = EnvelopeKeys::new(transport.session().clone());
        Self { transport, keys }
    }

    /// Encrypts and uploads one file.
    ///
    /// `file_password`, when given, adds the second wrap layer to the file
    /// CEK. Progress is reported as `(stage_label, percent)` and is
    /// non-decreasing within the pump stage.
    pub async fn manage_upload(
        &self,
        file_password: Option<SecretVec>,
        raw_path: &Path,
        progress: ProgressFn,
        cancel: CancelToken,
    ) -> Result<()> {
        let enc_path = enc_path_for(raw_path)?;
        // From here on the ciphertext file is removed whatever happens.
        let guard = TempFileGuard::new(enc_path.clone());

        // INIT_PROBE
        progress("testing upload", 0);
        let probe = self.transport.probe_upload().await?;
        if cancel.is_cancelled() {
            return Err(XferError::Cancelled);
        }

        // ENCRYPT
        progress("encrypting file", 0);
        let artifacts = {
            let keys = self.keys.clone();
            let raw = raw_path.to_path_buf();
            let enc = enc_path.clone();
            tokio::task::spawn_blocking(move || encrypt_stage(&keys, file_password, &raw, &enc))
                .await
                .map_err(|e| XferError::Internal(format!("join error: {}", e)))??
        };
        if cancel.is_cancelled() {
            return Err(XferError::Cancelled);
        }

        // INIT_UPLOAD
        progress("initiating upload", 0);
        let ciphertext_size = tokio::fs::metadata(&enc_path).await?.len();
        let plan = self
            .init_upload(probe.bytes_per_ms(), ciphertext_size)
            .await?;
        plan.validate(ciphertext_size)?;
        debug!(
            upload_id = %plan.upload_id,
            chunks = plan.total_chunks,
            chunk_size = plan.chunk_size,
            parallel = plan.parallel_conns,
            "Received upload plan"
        );

        // PUMP
        self.pump(&plan, &enc_path, progress.clone(), cancel.clone())
            .await?;

        // COMPLETE
        progress("completing upload", 0);
        self.complete_upload(&plan.upload_id, &enc_path, &artifacts)
            .await?;

        info!(upload_id = %plan.upload_id, "Upload complete");
        drop(guard);
        Ok(())
    }

    /// Requests the server's upload plan for this transfer.
    async fn init_upload(&self, up_speed: f32, file_size: u64) -> Result<UploadPlan> {
        let req = InitUploadReq { up_speed, file_size };
        let body = serde_json::to_vec(&req).map_err(|e| XferError::Internal(e.to_string()))?;

        let (status, _, resp_body) = self
            .transport
            .call(RouteKey::UploadInit, &[], &[], Some(RequestBody::json(body)))
            .await?;
        if status != StatusCode::OK {
            return Err(XferError::Transport(format!(
                "upload init returned status {}",
                status
            )));
        }

        Ok(serde_json::from_slice(&resp_body)?)
    }

    /// Runs the parallel chunk workers to completion.
    async fn pump(
        &self,
        plan: &UploadPlan,
        enc_path: &Path,
        progress: ProgressFn,
        cancel: CancelToken,
    ) -> Result<()> {
        let next_index = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let monitor = tokio::spawn(monitor_progress(
            done_rx,
            plan.total_chunks,
            "uploading",
            progress,
        ));

        let mut workers = Vec::with_capacity(plan.parallel_conns as usize);
        for _ in 0..plan.parallel_conns {
            workers.push(tokio::spawn(chunk_worker(
                self.transport.clone(),
                plan.clone(),
                enc_path.to_path_buf(),
                next_index.clone(),
                done_tx.clone(),
                cancel.clone(),
            )));
        }
        drop(done_tx);

        let mut first_err: Option<XferError> = None;
        for handle in workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() && !matches!(e, XferError::Cancelled) {
                        first_err = Some(e);
                    }
                }
                Err(e) => {
                    cancel.cancel();
                    if first_err.is_none() {
                        first_err = Some(XferError::Internal(format!("worker panicked: {}", e)));
                    }
                }
            }
        }
        let _ = monitor.await;

        match first_err {
            Some(e) => Err(e),
            None if cancel.is_cancelled() => Err(XferError::Cancelled),
            None => Ok(()),
        }
    }

    /// Signals completion with the transfer digests and sealed metadata.
    async fn complete_upload(
        &self,
        upload_id: &str,
        enc_path: &Path,
        artifacts: &EncArtifacts,
    ) -> Result<()> {
        let data_checksum = {
            let enc = enc_path.to_path_buf();
            tokio::task::spawn_blocking(move || cipher::sha256_file(&enc))
                .await
                .map_err(|e| XferError::Internal(format!("join error: {}", e)))??
        };
        let meta_checksum = cipher::sha256_bytes(&artifacts.enc_meta);

        let req = CompleteUploadReq {
            upload_id: upload_id.to_string(),
            enc_file_info: cipher::encode_base64(&artifacts.enc_info),
            enc_file_info_nonce: cipher::encode_base64(&artifacts.info_nonce),
            enc_meta: cipher::encode_base64(&artifacts.enc_meta),
            meta_nonce: cipher::encode_base64(&artifacts.meta_nonce),
            data_checksum,
            meta_checksum,
        };
        let body = serde_json::to_vec(&req).map_err(|e| XferError::Internal(e.to_string()))?;

        let (status, _, _) = self
            .transport
            .call(
                RouteKey::UploadComplete,
                &[],
                &[],
                Some(RequestBody::json(body)),
            )
            .await?;
        if status != StatusCode::OK {
            return Err(XferError::Transport(format!(
                "upload complete returned status {}",
                status
            )));
        }

        Ok(())
    }
}

/// Computes the ciphertext temp path next to the source file.
pub(crate) fn enc_path_for(raw_path: &Path) -> Result<PathBuf> {
    let file_name = raw_path
        .file_name()
        .ok_or_else(|| XferError::InputInvalid("path has no file name".into()))?
        .to_string_lossy();
    let dir = raw_path.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(format!("{}{}{}", ENC_FILE_PREFIX, file_name, ENC_FILE_SUFFIX)))
}

/// ENCRYPT stage: seals the file, builds the key hierarchy and the sealed
/// metadata artifacts.
///
/// Runs on the blocking pool: two Argon2 derivations plus whole-file AEAD
/// and HMAC passes. All per-file key material is dropped (and zeroized)
/// before returning; only sealed artifacts leave this function.
pub(crate) fn encrypt_stage(
    keys: &EnvelopeKeys,
    file_password: Option<SecretVec>,
    raw_path: &Path,
    enc_path: &Path,
) -> Result<EncArtifacts> {
    // Per-file CEK and the sealed payload.
    let file_cek = SecretKey::random();
    let file_nonce = cipher::seal_file(&file_cek, raw_path, enc_path)?;

    // Bucket KEK under a fresh salt, then the (optionally double) wrap.
    let (bucket_kek, b_kek_salt) = keys.bucket_kek_fresh()?;
    let wrap = envelope::wrap_file_key(
        &bucket_kek,
        file_password.as_ref().map(|p| p.as_bytes()),
        &file_cek,
    )?;

    // Integrity tag over the plaintext, bound to the bucket KEK.
    let raw_data_hmac = cipher::hmac_file(raw_path, bucket_kek.as_ref())?;

    let stats = std::fs::metadata(raw_path)?;
    let file_name = raw_path
        .file_name()
        .ok_or_else(|| XferError::InputInvalid("path has no file name".into()))?
        .to_string_lossy()
        .into_owned();
    let file_ext = raw_path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let file_cipher = FileCipherData {
        file_nonce: cipher::encode_base64(&file_nonce),
        b_kek_salt: cipher::encode_base64(&b_kek_salt),
        p_kek_salt: wrap
            .p_kek_salt
            .map(|s| cipher::encode_base64(&s))
            .unwrap_or_default(),
        wrapped_key: cipher::encode_base64(&wrap.wrapped_key),
        b_wrap_nonce: cipher::encode_base64(&wrap.b_wrap_nonce),
        p_wrap_nonce: wrap
            .p_wrap_nonce
            .map(|n| cipher::encode_base64(&n))
            .unwrap_or_default(),
    };

    let meta = MetaData {
        file_name: file_name.clone(),
        file_ext: file_ext.clone(),
        file_size: stats.len(),
        raw_data_hmac,
        has_file_password: wrap.has_file_password(),
        file_cipher,
    };

    // The meta HMAC covers the exact JSON bytes of the inner record.
    let meta_bytes = serde_json::to_vec(&meta).map_err(|e| XferError::Internal(e.to_string()))?;
    let raw_meta_hmac = cipher::hmac_bytes(&meta_bytes, bucket_kek.as_ref())?;

    let wrapper = MetaWrapper {
        raw_meta_hmac,
        meta,
    };
    let wrapper_bytes =
        serde_json::to_vec(&wrapper).map_err(|e| XferError::Internal(e.to_string()))?;
    let (enc_meta, meta_nonce) = keys.seal_with_bucket(&wrapper_bytes)?;

    let info = FileInfo {
        file_name,
        file_ext,
        file_size: stats.len(),
        has_file_password: wrap.has_file_password(),
    };
    let info_bytes = serde_json::to_vec(&info).map_err(|e| XferError::Internal(e.to_string()))?;
    let (enc_info, info_nonce) = keys.seal_with_bucket(&info_bytes)?;

    // file_cek, bucket_kek and the wrap intermediates zeroize on drop here.
    Ok(EncArtifacts {
        enc_meta,
        meta_nonce,
        enc_info,
        info_nonce,
    })
}

/// One chunk worker: pulls indices off the shared counter until the plan
/// is exhausted, posting each chunk with retry.
async fn chunk_worker(
    transport: Arc<Transport>,
    plan: UploadPlan,
    enc_path: PathBuf,
    next_index: Arc<AtomicU64>,
    done: mpsc::UnboundedSender<u64>,
    cancel: CancelToken,
) -> Result<()> {
    let result = chunk_worker_inner(&transport, &plan, &enc_path, &next_index, &done, &cancel).await;
    if result.is_err() {
        // First error wins; peers observe the token on their next pass.
        cancel.cancel();
    }
    result
}

async fn chunk_worker_inner(
    transport: &Transport,
    plan: &UploadPlan,
    enc_path: &Path,
    next_index: &AtomicU64,
    done: &mpsc::UnboundedSender<u64>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut file = tokio::fs::File::open(enc_path).await?;

    loop {
        if cancel.is_cancelled() {
            return Err(XferError::Cancelled);
        }

        let index = next_index.fetch_add(1, Ordering::Relaxed);
        if index >= plan.total_chunks {
            return Ok(());
        }

        let chunk = read_chunk(&mut file, index * plan.chunk_size, plan.chunk_size).await?;
        if chunk.is_empty() {
            return Err(XferError::Internal(format!(
                "chunk {} reads past end of file",
                index
            )));
        }

        post_chunk(transport, plan, index, chunk, cancel).await?;
        let _ = done.send(index);
    }
}

/// Reads up to `chunk_size` bytes at `offset`. A short read at EOF is the
/// expected shape of the last chunk.
pub(crate) async fn read_chunk(
    file: &mut tokio::fs::File,
    offset: u64,
    chunk_size: u64,
) -> Result<Vec<u8>> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut buf = vec![0u8; chunk_size as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// POSTs one chunk, retrying transport errors with exponential backoff.
///
/// A non-202 status is not retried: the server saw the request and
/// rejected it, so repeating the same bytes will not help.
async fn post_chunk(
    transport: &Transport,
    plan: &UploadPlan,
    index: u64,
    chunk: Vec<u8>,
    cancel: &CancelToken,
) -> Result<()> {
    let chunk_id = index.to_string();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(XferError::Cancelled);
        }

        let call = transport
            .call(
                RouteKey::UploadPart,
                &[
                    (query::UPLOAD_ID, plan.upload_id.as_str()),
                    (query::CHUNK_ID, chunk_id.as_str()),
                ],
                &[],
                Some(RequestBody::octet(chunk.clone())),
            )
            .await;

        match call {
            Ok((status, _, _)) if status == StatusCode::ACCEPTED => return Ok(()),
            Ok((status, _, _)) => {
                return Err(XferError::Transport(format!(
                    "chunk {} returned status {}",
                    index, status
                )));
            }
            Err(XferError::Transport(e)) if attempt < CHUNK_MAX_ATTEMPTS => {
                let delay = CHUNK_RETRY_BASE_DELAY_MS << (attempt - 1);
                warn!(chunk = index, attempt, error = %e, "Chunk post failed; retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
