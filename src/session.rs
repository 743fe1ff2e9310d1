//! Process-wide session state and request signing.
//!
//! Exactly one session is live at a time. The handle is shared (`Arc`)
//! between the engines; reads (signing) take the shared lock, mutation
//! (set/clear) takes the exclusive lock. Every sensitive field is
//! overwritten with zeros before its buffer is released — on logout, on
//! server-indicated expiry, and on process exit including panic unwinds.

use std::sync::RwLock;

use zeroize::Zeroize;

use crate::cipher::{self, SecretKey, SecretVec};
use crate::error::{Result, XferError};

/// Signed header values for one authenticated request.
#[derive(Debug)]
pub struct SignedHeaders {
    /// Integer seconds since epoch at signing time.
    pub timestamp: String,
    /// Opaque session identifier issued by the server.
    pub session_id: String,
    /// base64(HMAC(session_key, method \n path \n raw_query \n ts)).
    pub req_signature: String,
    /// base64(HMAC(session_key, body)). Empty body permitted.
    pub body_signature: String,
}

/// Everything the session holds while a bucket is open.
struct SessionState {
    session_id: String,
    session_key: SecretVec,
    /// Short printable bucket identifier, retained for credential lookups.
    bucket_key: String,
    /// Bucket CEK. Never leaves the process.
    bucket_cek: SecretKey,
    /// Unix seconds at which the server-granted lifetime ends.
    expires_at: i64,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        // SecretVec / SecretKey zeroize themselves; the plain strings are
        // wiped here so no sensitive identifier outlives the state.
        self.session_id.zeroize();
        self.bucket_key.zeroize();
    }
}

/// Shared session handle.
///
/// Services receive this explicitly instead of reaching for a global; the
/// auth layer is the only writer.
pub struct Session {
    inner: RwLock<Option<SessionState>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Creates an empty (logged-out) session handle.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Atomically populates the session after a successful login.
    ///
    /// All four fields become visible together; a reader never observes a
    /// partially populated session.
    pub fn set(
        &self,
        session_id: String,
        session_key: SecretVec,
        bucket_key: String,
        bucket_cek: SecretKey,
        session_ttl: i64,
    ) -> Result<()> {
        if session_id.is_empty() || session_key.is_empty() {
            return Err(XferError::Internal(
                "session id or key cannot be empty".into(),
            ));
        }

        let mut guard = self.inner.write().expect("session lock poisoned");
        // Dropping any previous state zeroizes it.
        *guard = Some(SessionState {
            session_id,
            session_key,
            bucket_key,
            bucket_cek,
            expires_at: chrono::Utc::now().timestamp() + session_ttl,
        });

        Ok(())
    }

    /// Clears the session, zeroizing every sensitive buffer.
    ///
    /// Idempotent. Called on logout, on a server reply indicating expiry,
    /// and from the exit guard in `main`.
    pub fn clear(&self) {
        let mut guard = self.inner.write().expect("session lock poisoned");
        *guard = None; // SessionState::drop wipes the buffers
    }

    /// Whether a session is live.
    pub fn is_active(&self) -> bool {
        self.inner.read().expect("session lock poisoned").is_some()
    }

    /// The bucket key of the live session, if any.
    pub fn bucket_key(&self) -> Option<String> {
        self.inner
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.bucket_key.clone())
    }

    /// Seconds until the server-granted session lifetime ends, if live.
    ///
    /// Negative once the deadline has passed; the server is authoritative,
    /// so this only drives user-facing warnings.
    pub fn expires_in_secs(&self) -> Option<i64> {
        self.inner
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.expires_at - chrono::Utc::now().timestamp())
    }

    /// Clone of the bucket CEK for in-process crypto.
    ///
    /// The clone zeroizes itself on drop; it must never be serialized or
    /// otherwise leave the process.
    pub(crate) fn bucket_cek(&self) -> Result<SecretKey> {
        self.inner
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.bucket_cek.clone())
            .ok_or_else(|| XferError::NotAuthenticated("no live session".into()))
    }

    /// Signs one outbound request under the shared read lock.
    pub fn sign(&self, method: &str, path: &str, raw_query: &str, body: &[u8]) -> Result<SignedHeaders> {
        let ts = chrono::Utc::now().timestamp();
        self.sign_at(ts, method, path, raw_query, body)
    }

    /// Signing with an explicit timestamp, separated out for tests.
    pub(crate) fn sign_at(
        &self,
        ts: i64,
        method: &str,
        path: &str,
        raw_query: &str,
        body: &[u8],
    ) -> Result<SignedHeaders> {
        let guard = self.inner.read().expect("session lock poisoned");
        let state = guard
            .as_ref()
            .ok_or_else(|| XferError::NotAuthenticated("session used before assignment".into()))?;

        let ts = ts.to_string();
        let meta = format!("{}\n{}\n{}\n{}", method, path, raw_query, ts);

        let meta_sig = cipher::hmac_raw(meta.as_bytes(), state.session_key.as_bytes())?;
        let body_sig = cipher::hmac_raw(body, state.session_key.as_bytes())?;

        Ok(SignedHeaders {
            timestamp: ts,
            session_id: state.session_id.clone(),
            req_signature: cipher::encode_base64(&meta_sig),
            body_signature: cipher::encode_base64(&body_sig),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_session() -> Session {
        let session = Session::new();
        session
            .set(
                "sess-01".into(),
                SecretVec::new(vec![0x42; 32]),
                "ABC-DEF-01".into(),
                SecretKey::from_bytes([0x07; 32]),
                3600,
            )
            .unwrap();
        session
    }

    #[test]
    fn test_sign_requires_live_session() {
        let session = Session::new();
        let result = session.sign("GET", "/private/file/list", "", b"");
        assert!(matches!(result, Err(XferError::NotAuthenticated(_))));
    }

    #[test]
    fn test_set_rejects_empty_identity() {
        let session = Session::new();
        let result = session.set(
            String::new(),
            SecretVec::new(vec![1]),
            "ABC-DEF-01".into(),
            SecretKey::random(),
            60,
        );
        assert!(result.is_err());
        assert!(!session.is_active());
    }

    #[test]
    fn test_sign_is_deterministic_for_fixed_inputs() {
        let session = live_session();

        let a = session
            .sign_at(1700000000, "POST", "/private/file/upload/part", "upload_id=u1&chunk_id=0", b"chunk")
            .unwrap();
        let b = session
            .sign_at(1700000000, "POST", "/private/file/upload/part", "upload_id=u1&chunk_id=0", b"chunk")
            .unwrap();

        assert_eq!(a.req_signature, b.req_signature);
        assert_eq!(a.body_signature, b.body_signature);
    }

    #[test]
    fn test_signature_rebinds_to_every_component() {
        let session = live_session();
        let base = session
            .sign_at(1700000000, "POST", "/p", "q=1", b"body")
            .unwrap();

        // Altering any signed component must change the request signature.
        let variants = [
            session.sign_at(1700000001, "POST", "/p", "q=1", b"body").unwrap(),
            session.sign_at(1700000000, "GET", "/p", "q=1", b"body").unwrap(),
            session.sign_at(1700000000, "POST", "/p2", "q=1", b"body").unwrap(),
            session.sign_at(1700000000, "POST", "/p", "q=2", b"body").unwrap(),
        ];
        for variant in &variants {
            assert_ne!(base.req_signature, variant.req_signature);
        }

        // Altering the body must change the body signature.
        let tampered = session
            .sign_at(1700000000, "POST", "/p", "q=1", b"tampered")
            .unwrap();
        assert_ne!(base.body_signature, tampered.body_signature);
    }

    #[test]
    fn test_empty_body_signature_allowed() {
        let session = live_session();
        let signed = session.sign_at(1700000000, "GET", "/p", "", b"").unwrap();
        assert!(!signed.body_signature.is_empty());
    }

    #[test]
    fn test_expiry_countdown_tracks_granted_ttl() {
        let session = live_session(); // granted 3600 seconds
        let remaining = session.expires_in_secs().unwrap();
        assert!((3595..=3600).contains(&remaining), "{}", remaining);

        session.clear();
        assert!(session.expires_in_secs().is_none());
    }

    #[test]
    fn test_expiry_countdown_goes_negative_past_deadline() {
        let session = Session::new();
        session
            .set(
                "sess-03".into(),
                SecretVec::new(vec![0x42; 32]),
                "ABC-DEF-01".into(),
                SecretKey::from_bytes([0x07; 32]),
                -10,
            )
            .unwrap();

        assert!(session.expires_in_secs().unwrap() <= -10);
    }

    #[test]
    fn test_clear_drops_everything_together() {
        let session = live_session();
        assert!(session.is_active());
        assert_eq!(session.bucket_key().as_deref(), Some("ABC-DEF-01"));

        session.clear();

        assert!(!session.is_active());
        assert!(session.bucket_key().is_none());
        assert!(session.bucket_cek().is_err());
        assert!(matches!(
            session.sign("GET", "/p", "", b""),
            Err(XferError::NotAuthenticated(_))
        ));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let session = live_session();
        session.clear();
        session.clear();
        assert!(!session.is_active());
    }

    #[test]
    fn test_set_replaces_previous_session() {
        let session = live_session();
        session
            .set(
                "sess-02".into(),
                SecretVec::new(vec![0x43; 32]),
                "XYZ-QRS-99".into(),
                SecretKey::random(),
                60,
            )
            .unwrap();

        let signed = session.sign_at(1700000000, "GET", "/p", "", b"").unwrap();
        assert_eq!(signed.session_id, "sess-02");
        assert_eq!(session.bucket_key().as_deref(), Some("XYZ-QRS-99"));
    }

    #[test]
    fn test_string_zeroize_wipes_in_place() {
        // SessionState::drop relies on String::zeroize overwriting the
        // buffer before truncating; confirm the crate contract holds.
        let mut s = String::from("sensitive-session-id");
        s.zeroize();
        assert!(s.is_empty());
    }
}
