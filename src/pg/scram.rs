//! SCRAM-SHA-256 authentication (RFC 5802, RFC 7677) for PostgreSQL.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// SCRAM authentication errors.
#[derive(Debug, Clone, Error)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing {0} in server message")]
    Missing(&'static str),
    #[error("Server nonce verification failed")]
    NonceVerificationFailed,
    #[error("Invalid server signature")]
    InvalidServerSignature,
    #[error("Server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("Invalid SCRAM state")]
    InvalidState,
    #[error("Key derivation failed")]
    KeyDerivation,
}

/// Exchange progress: what we need to remember between round trips.
enum Exchange {
    Started,
    ProofSent {
        salted_password: [u8; 32],
        auth_message: String,
    },
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    exchange: Exchange,
}

impl ScramClient {
    /// Create a client with a fresh random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes encode to 24 base64 characters
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    /// Create a client with a caller-supplied nonce.
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            exchange: Exchange::Started,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// client-first-message: `n,,n=<username>,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        // GS2 header "n,,": no channel binding, no authzid
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume server-first-message (`r=..,s=..,i=..`) and produce client-final-message.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            match part.split_at_checked(2) {
                Some(("r=", value)) => nonce = Some(value),
                Some(("s=", value)) => {
                    salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?)
                }
                Some(("i=", value)) => {
                    iterations = Some(
                        value
                            .parse::<u32>()
                            .map_err(|_| ScramError::InvalidIterations)?,
                    )
                }
                _ => {}
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::Missing("nonce"))?;
        let salt = salt.ok_or(ScramError::Missing("salt"))?;
        let iterations = iterations.ok_or(ScramError::Missing("iterations"))?;

        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature) {
            *p ^= s;
        }

        self.exchange = Exchange::ProofSent {
            salted_password,
            auth_message,
        };

        Ok(format!("{},p={}", client_final_without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Verify server-final-message (`v=<signature>`).
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let Exchange::ProofSent {
            salted_password,
            auth_message,
        } = &self.exchange
        else {
            return Err(ScramError::InvalidState);
        };

        let verifier = std::str::from_utf8(server_msg)
            .ok()
            .and_then(|s| s.strip_prefix("v="))
            .ok_or(ScramError::InvalidServerSignature)?;
        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if server_signature != expected {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }
        Ok(())
    }
}

/// Hi(): PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyDerivation)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
