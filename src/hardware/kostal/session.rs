//! Plenticore login handshake
//!
//! `auth/start` returns the server nonce, salt and iteration count. The client answers
//! `auth/finish` with a SCRAM-SHA-256 proof and receives a token. `auth/create_session` takes
//! that token sealed with AES-256-GCM under a key derived from the same exchange.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{distributions::Alphanumeric, Rng};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, digest, hmac, pbkdf2};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

pub(super) const USERNAME: &str = "user";

#[derive(Debug, Serialize)]
pub(super) struct StartRequest {
    pub username: &'static str,
    pub nonce: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct StartResponse {
    pub nonce: String,
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    pub rounds: u32,
    pub salt: String,
}

#[derive(Debug, Serialize)]
pub(super) struct FinishRequest<'a> {
    #[serde(rename = "transactionId")]
    pub transaction_id: &'a str,
    pub proof: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct FinishResponse {
    pub token: String,
    pub signature: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateSessionRequest<'a> {
    #[serde(rename = "transactionId")]
    pub transaction_id: &'a str,
    pub iv: String,
    pub tag: String,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// Base64 of 12 random alphanumerics
pub(super) fn client_nonce() -> String {
    let raw: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    STANDARD.encode(raw)
}

/// Keys derived from the password and the `auth/start` answer
pub(super) struct Scram {
    client_key: [u8; digest::SHA256_OUTPUT_LEN],
    server_key: hmac::Key,
    stored_key: hmac::Key,
    auth_message: String,
}

impl Scram {
    pub fn new(password: &str, client_nonce: &str, start: &StartResponse) -> Result<Self> {
        let salt = STANDARD
            .decode(&start.salt)
            .map_err(|e| anyhow!("login salt is not base64: {e}"))?;
        let rounds =
            NonZeroU32::new(start.rounds).ok_or_else(|| anyhow!("login asks for zero rounds"))?;

        let mut salted = [0u8; digest::SHA256_OUTPUT_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            rounds,
            &salt,
            password.as_bytes(),
            &mut salted,
        );
        let salted = hmac::Key::new(hmac::HMAC_SHA256, &salted);

        let mut client_key = [0u8; digest::SHA256_OUTPUT_LEN];
        client_key.copy_from_slice(hmac::sign(&salted, b"Client Key").as_ref());
        let server_key = hmac::Key::new(
            hmac::HMAC_SHA256,
            hmac::sign(&salted, b"Server Key").as_ref(),
        );
        let stored_key = hmac::Key::new(
            hmac::HMAC_SHA256,
            digest::digest(&digest::SHA256, &client_key).as_ref(),
        );
        let auth_message = format!(
            "n={USERNAME},r={client_nonce},r={sn},s={salt},i={rounds},c=biws,r={sn}",
            sn = start.nonce,
            salt = start.salt,
            rounds = start.rounds,
        );

        Ok(Self {
            client_key,
            server_key,
            stored_key,
            auth_message,
        })
    }

    /// `ClientKey XOR HMAC(StoredKey, AuthMessage)`, base64
    pub fn proof(&self) -> String {
        let signature = hmac::sign(&self.stored_key, self.auth_message.as_bytes());
        let proof: Vec<u8> = self
            .client_key
            .iter()
            .zip(signature.as_ref())
            .map(|(k, s)| k ^ s)
            .collect();
        STANDARD.encode(proof)
    }

    /// Check the signature the inverter sent back with the token
    pub fn verify_server(&self, signature_b64: &str) -> Result<()> {
        let signature = STANDARD
            .decode(signature_b64)
            .map_err(|e| anyhow!("server signature is not base64: {e}"))?;
        hmac::verify(&self.server_key, self.auth_message.as_bytes(), &signature)
            .map_err(|_| anyhow!("server signature does not match, wrong inverter or password"))
    }

    fn protocol_key(&self) -> hmac::Tag {
        let mut ctx = hmac::Context::with_key(&self.stored_key);
        ctx.update(b"Session Key");
        ctx.update(self.auth_message.as_bytes());
        ctx.update(&self.client_key);
        ctx.sign()
    }

    /// Seal the `auth/finish` token for `auth/create_session`
    pub fn seal_token<'a>(&self, transaction_id: &'a str, token: &str) -> Result<CreateSessionRequest<'a>> {
        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, self.protocol_key().as_ref())
            .map_err(|_| anyhow!("session key has the wrong length"))?;
        let key = aead::LessSafeKey::new(unbound);

        let mut iv = [0u8; aead::NONCE_LEN];
        SystemRandom::new()
            .fill(&mut iv)
            .map_err(|_| anyhow!("no randomness for the session iv"))?;

        let mut payload = token.as_bytes().to_vec();
        let tag = key
            .seal_in_place_separate_tag(
                aead::Nonce::assume_unique_for_key(iv),
                aead::Aad::empty(),
                &mut payload,
            )
            .map_err(|_| anyhow!("sealing the session token failed"))?;

        Ok(CreateSessionRequest {
            transaction_id,
            iv: STANDARD.encode(iv),
            tag: STANDARD.encode(tag.as_ref()),
            payload: STANDARD.encode(payload),
        })
    }
}
