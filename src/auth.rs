//! OPAQUE registration and login driver.
//!
//! Registers a new bucket in two round trips and opens an existing one in
//! two round trips. The password never crosses the wire: OPAQUE yields a
//! mutually agreed session key, and the bucket CEK is recovered locally
//! by unwrapping the bucket cipher descriptor the server stores for us.
//!
//! The key-stretching function inside OPAQUE is Argon2, so both finish
//! steps run on the blocking pool.

use std::sync::Arc;

use opaque_ke::{
    CipherSuite, ClientLogin, ClientLoginFinishParameters, ClientRegistration,
    ClientRegistrationFinishParameters, CredentialResponse, Identifiers, RegistrationResponse,
};
use rand::rngs::OsRng;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::cipher::{self, SecretKey, SecretVec};
use crate::envelope;
use crate::error::{Result, XferError};
use crate::routes::RouteKey;
use crate::transport::{RequestBody, Transport};
use crate::types::{
    CreateBucketS1Req, CreateBucketS1Resp, CreateBucketS2Req, CreateBucketS2Resp, OpenBucketS1Req,
    OpenBucketS1Resp, OpenBucketS2Req, OpenBucketS2Resp, OpenConfigResp,
};
use crate::validate;

/// The compiled OPAQUE suite.
///
/// The server advertises its suite as a string in the login config; a
/// mismatch aborts the login before any key exchange starts.
pub struct OpaqueSuite;

impl CipherSuite for OpaqueSuite {
    type OprfCs = opaque_ke::Ristretto255;
    type KeGroup = opaque_ke::Ristretto255;
    type KeyExchange = opaque_ke::key_exchange::tripledh::TripleDh;
    type Ksf = argon2::Argon2<'static>;
}

/// Identifier of the compiled suite, matched against the server config.
pub const OPAQUE_SUITE_ID: &str = "ristretto255-tripledh-argon2id";

/// Result of a successful registration.
#[derive(Debug)]
pub struct NewBucket {
    /// The short printable bucket identifier (`AAA-BBB-NN`).
    pub bucket_key: String,
    /// Canonical display name the server stored.
    pub name: String,
}

/// Drives registration and login against the transfer API.
pub struct Auth {
    transport: Arc<Transport>,
}

impl Auth {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Registers a new bucket and returns its key.
    ///
    /// The password buffer stays alive until OPAQUE finalization returns;
    /// the finalize step references the same bytes the init step blinded.
    pub async fn new_bucket(&self, password: SecretVec, name: &str) -> Result<NewBucket> {
        validate::verify_password_format(password.as_bytes())?;

        // Local: build the bucket cipher descriptor (random CEK, wrapped
        // under a password-derived KEK). Argon2 → blocking pool.
        let descriptor = {
            let password = password.clone();
            tokio::task::spawn_blocking(move || envelope::create_bucket_cipher(password.as_bytes()))
                .await
                .map_err(|e| XferError::Internal(format!("join error: {}", e)))??
        };

        // OPAQUE step 1: blinded registration request.
        let start = ClientRegistration::<OpaqueSuite>::start(&mut OsRng, password.as_bytes())
            .map_err(opaque_err)?;
        let s1_req = CreateBucketS1Req {
            s1_req: cipher::encode_base64(&start.message.serialize()),
        };

        let s1_resp: CreateBucketS1Resp = self
            .post_json(RouteKey::RegistrationInit, &s1_req)
            .await?;

        // OPAQUE step 2: finalize the registration record.
        let server_id = cipher::decode_base64(&s1_resp.server_id)?;
        let s1_resp_bytes = cipher::decode_base64(&s1_resp.s1_resp)?;
        let client_id = name.as_bytes().to_vec();

        let record = {
            let password = password.clone();
            let state = start.state;
            tokio::task::spawn_blocking(move || {
                let response = RegistrationResponse::<OpaqueSuite>::deserialize(&s1_resp_bytes)
                    .map_err(opaque_err)?;
                state
                    .finish(
                        &mut OsRng,
                        password.as_bytes(),
                        response,
                        ClientRegistrationFinishParameters::new(
                            Identifiers {
                                client: Some(&client_id),
                                server: Some(&server_id),
                            },
                            None,
                        ),
                    )
                    .map_err(opaque_err)
            })
            .await
            .map_err(|e| XferError::Internal(format!("join error: {}", e)))??
        };

        let s2_req = CreateBucketS2Req {
            buc_name: name.to_string(),
            s2_req: cipher::encode_base64(&record.message.serialize()),
            req_id: s1_resp.req_id,
            cipher: cipher::encode_base64(&descriptor),
        };

        let s2_resp: CreateBucketS2Resp = self
            .post_json(RouteKey::RegistrationFinal, &s2_req)
            .await?;

        info!(bucket_key = %s2_resp.bucket_key, "Registered bucket");

        Ok(NewBucket {
            bucket_key: s2_resp.bucket_key,
            name: s2_resp.name,
        })
    }

    /// Opens an existing bucket and populates the session.
    ///
    /// A wrong password surfaces either from the OPAQUE finish or from the
    /// descriptor unwrap; both arrive as `AuthFailed` and leave the
    /// session untouched.
    pub async fn open_bucket(&self, bucket_key: &str, password: SecretVec) -> Result<()> {
        validate::verify_bucket_key_format(bucket_key)?;

        // Fetch the server's OPAQUE parameters and identity.
        let config: OpenConfigResp = self.get_json(RouteKey::OpenConfig).await?;
        if config.config != OPAQUE_SUITE_ID {
            return Err(XferError::AuthFailed(format!(
                "server OPAQUE suite {:?} does not match client",
                config.config
            )));
        }
        let server_id = cipher::decode_base64(&config.server_id)?;

        // OPAQUE step 1: KE1.
        let start =
            ClientLogin::<OpaqueSuite>::start(&mut OsRng, password.as_bytes()).map_err(opaque_err)?;
        let s1_req = OpenBucketS1Req {
            bucket_key: cipher::encode_base64(bucket_key.as_bytes()),
            ke1: cipher::encode_base64(&start.message.serialize()),
        };

        let s1_resp: OpenBucketS1Resp = self.post_json(RouteKey::OpenInit, &s1_req).await?;

        // OPAQUE step 2: KE3 + session key. The finish re-runs the KSF.
        let ke2_bytes = cipher::decode_base64(&s1_resp.ke2)?;
        let client_id = cipher::decode_base64(&s1_resp.client_id)?;

        let finish = {
            let password = password.clone();
            let state = start.state;
            let server_id = server_id.clone();
            tokio::task::spawn_blocking(move || {
                let response =
                    CredentialResponse::<OpaqueSuite>::deserialize(&ke2_bytes).map_err(opaque_err)?;
                state
                    .finish(
                        password.as_bytes(),
                        response,
                        ClientLoginFinishParameters::new(
                            None,
                            Identifiers {
                                client: Some(&client_id),
                                server: Some(&server_id),
                            },
                            None,
                        ),
                    )
                    .map_err(opaque_err)
            })
            .await
            .map_err(|e| XferError::Internal(format!("join error: {}", e)))??
        };

        let s2_req = OpenBucketS2Req {
            ke3: cipher::encode_base64(&finish.message.serialize()),
            login_id: s1_resp.login_id,
        };

        let s2_resp: OpenBucketS2Resp = self.post_json(RouteKey::OpenFinish, &s2_req).await?;

        // Recover the bucket CEK from the descriptor. Argon2 again.
        let descriptor = cipher::decode_base64(&s2_resp.cipher)?;
        let bucket_cek: SecretKey = {
            let password = password.clone();
            tokio::task::spawn_blocking(move || {
                envelope::open_bucket_cipher(&descriptor, password.as_bytes())
            })
            .await
            .map_err(|e| XferError::Internal(format!("join error: {}", e)))??
        };

        // Everything checked out; publish the session atomically.
        self.transport.session().set(
            s2_resp.session_id,
            SecretVec::new(finish.session_key.to_vec()),
            bucket_key.to_string(),
            bucket_cek,
            s2_resp.session_ttl,
        )?;

        info!(bucket_key = %bucket_key, ttl = s2_resp.session_ttl, "Opened bucket");

        Ok(())
    }

    /// Clears the session, zeroizing all key material.
    pub fn logout(&self) {
        self.transport.session().clear();
        debug!("Logged out");
    }

    /// POSTs a JSON body to a public route and parses a 200 response.
    async fn post_json<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        key: RouteKey,
        req: &Req,
    ) -> Result<Resp> {
        let body = serde_json::to_vec(req).map_err(|e| XferError::Internal(e.to_string()))?;
        let (status, _, resp_body) = self
            .transport
            .call(key, &[], &[], Some(RequestBody::json(body)))
            .await?;
        Self::parse_ok(key, status, &resp_body)
    }

    /// GETs a public route and parses a 200 response.
    async fn get_json<Resp: serde::de::DeserializeOwned>(&self, key: RouteKey) -> Result<Resp> {
        let (status, _, resp_body) = self.transport.call(key, &[], &[], None).await?;
        Self::parse_ok(key, status, &resp_body)
    }

    fn parse_ok<Resp: serde::de::DeserializeOwned>(
        key: RouteKey,
        status: StatusCode,
        body: &[u8],
    ) -> Result<Resp> {
        if status != StatusCode::OK {
            return Err(XferError::Transport(format!(
                "{:?} returned status {}",
                key, status
            )));
        }
        Ok(serde_json::from_slice(body)?)
    }
}

/// Maps OPAQUE protocol errors to the auth failure kind.
///
/// A wrong password is indistinguishable from a corrupted exchange at
/// this level, which is exactly the point of the protocol.
fn opaque_err(err: opaque_ke::errors::ProtocolError) -> XferError {
    XferError::AuthFailed(format!("OPAQUE protocol: {:?}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use opaque_ke::{ServerLogin, ServerLoginStartParameters, ServerRegistration, ServerSetup};

    fn auth() -> Auth {
        let session = Arc::new(Session::new());
        let transport = Arc::new(Transport::new("https://api.example.org", session).unwrap());
        Auth::new(transport)
    }

    #[tokio::test]
    async fn test_new_bucket_rejects_weak_password_before_network() {
        let result = auth()
            .new_bucket(SecretVec::new(b"short".to_vec()), "T")
            .await;
        assert!(matches!(result, Err(XferError::InputInvalid(_))));
    }

    #[tokio::test]
    async fn test_open_bucket_rejects_bad_key_before_network() {
        let result = auth()
            .open_bucket("not-a-key", SecretVec::new(b"Abcd!1Abcd!1".to_vec()))
            .await;
        assert!(matches!(result, Err(XferError::InputInvalid(_))));
    }

    /// Full OPAQUE round trip against an in-process server, proving the
    /// compiled suite and parameter plumbing line up end to end.
    #[test]
    fn test_opaque_suite_registration_and_login() {
        let mut rng = OsRng;
        let server_setup = ServerSetup::<OpaqueSuite>::new(&mut rng);

        // Registration.
        let reg_start =
            ClientRegistration::<OpaqueSuite>::start(&mut rng, b"Abcd!1Abcd!1").unwrap();
        let server_reg = ServerRegistration::<OpaqueSuite>::start(
            &server_setup,
            reg_start.message,
            b"AAA-BBB-01",
        )
        .unwrap();
        let reg_finish = reg_start
            .state
            .finish(
                &mut rng,
                b"Abcd!1Abcd!1",
                server_reg.message,
                ClientRegistrationFinishParameters::default(),
            )
            .unwrap();
        let password_file = ServerRegistration::finish(reg_finish.message);

        // Login with the right password.
        let login_start = ClientLogin::<OpaqueSuite>::start(&mut rng, b"Abcd!1Abcd!1").unwrap();
        let server_login = ServerLogin::start(
            &mut rng,
            &server_setup,
            Some(password_file.clone()),
            login_start.message,
            b"AAA-BBB-01",
            ServerLoginStartParameters::default(),
        )
        .unwrap();
        let login_finish = login_start
            .state
            .finish(
                b"Abcd!1Abcd!1",
                server_login.message,
                ClientLoginFinishParameters::default(),
            )
            .unwrap();
        let server_finish = server_login.state.finish(login_finish.message).unwrap();

        // Both sides agree on the session key without the password having
        // crossed the wire.
        assert_eq!(
            login_finish.session_key.as_slice(),
            server_finish.session_key.as_slice()
        );
    }

    #[test]
    fn test_opaque_login_rejects_wrong_password() {
        let mut rng = OsRng;
        let server_setup = ServerSetup::<OpaqueSuite>::new(&mut rng);

        let reg_start =
            ClientRegistration::<OpaqueSuite>::start(&mut rng, b"Abcd!1Abcd!1").unwrap();
        let server_reg = ServerRegistration::<OpaqueSuite>::start(
            &server_setup,
            reg_start.message,
            b"AAA-BBB-01",
        )
        .unwrap();
        let reg_finish = reg_start
            .state
            .finish(
                &mut rng,
                b"Abcd!1Abcd!1",
                server_reg.message,
                ClientRegistrationFinishParameters::default(),
            )
            .unwrap();
        let password_file = ServerRegistration::finish(reg_finish.message);

        let login_start = ClientLogin::<OpaqueSuite>::start(&mut rng, b"wrong-pw-Z1!").unwrap();
        let server_login = ServerLogin::start(
            &mut rng,
            &server_setup,
            Some(password_file),
            login_start.message,
            b"AAA-BBB-01",
            ServerLoginStartParameters::default(),
        )
        .unwrap();

        let result = login_start.state.finish(
            b"wrong-pw-Z1!",
            server_login.message,
            ClientLoginFinishParameters::default(),
        );
        assert!(result.is_err());
    }
}
