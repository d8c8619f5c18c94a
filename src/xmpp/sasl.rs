//! SASL authentication: PLAIN (RFC 4616) and SCRAM-SHA-1 (RFC 5802).
//!
//! Pure payload computation; the session drives the exchange over the
//! stream and feeds challenges in as they arrive.

use anyhow::{anyhow, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

type HmacSha1 = Hmac<Sha1>;
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Base64 PLAIN payload: `\0username\0password`.
pub fn plain_payload(username: &str, password: &str) -> String {
    B64.encode(format!("\0{username}\0{password}").as_bytes())
}

/// Client side of one SCRAM-SHA-1 exchange.
pub struct ScramSha1 {
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    /// HMAC(SaltedPassword, "Server Key"), kept to check the server
    /// signature in the final message.
    server_key: Option<Vec<u8>>,
    auth_message: Option<String>,
}

impl ScramSha1 {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce = generate_nonce();
        Self::with_nonce(username, password, &nonce)
    }

    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        let escaped = escape_username(username);
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            client_first_bare: format!("n={escaped},r={nonce}"),
            server_key: None,
            auth_message: None,
        }
    }

    /// Base64 client-first-message.
    pub fn client_first(&self) -> String {
        B64.encode(format!("n,,{}", self.client_first_bare).as_bytes())
    }

    /// Consumes the server-first challenge and produces the base64
    /// client-final-message.
    pub fn handle_challenge(&mut self, challenge_b64: &str) -> Result<String> {
        let server_first = String::from_utf8(B64.decode(challenge_b64.trim())?)?;
        let (combined_nonce, salt_b64, iterations) = parse_server_first(&server_first)?;

        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(anyhow!("Server nonce doesn't contain client nonce"));
        }

        let salt = B64.decode(&salt_b64)?;

        // SaltedPassword = PBKDF2-SHA1(password, salt, iterations)
        let mut salted_password = [0u8; 20];
        pbkdf2::pbkdf2_hmac::<Sha1>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha1(&salted_password, b"Client Key");
        let stored_key = Sha1::digest(&client_key);
        self.server_key = Some(hmac_sha1(&salted_password, b"Server Key"));

        let channel_binding = B64.encode(b"n,,"); // "biws"
        let client_final_without_proof = format!("c={channel_binding},r={combined_nonce}");

        let auth_message = format!(
            "{},{server_first},{client_final_without_proof}",
            self.client_first_bare
        );
        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        self.auth_message = Some(auth_message);

        // ClientProof = ClientKey XOR ClientSignature
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let client_final =
            format!("{client_final_without_proof},p={}", B64.encode(&client_proof));
        Ok(B64.encode(client_final.as_bytes()))
    }

    /// Verifies the server signature carried in `<success/>` (or in a
    /// final challenge). An empty payload is accepted for servers that
    /// don't send one.
    pub fn verify_success(&self, payload_b64: Option<&str>) -> Result<()> {
        let Some(payload_b64) = payload_b64.filter(|p| !p.trim().is_empty()) else {
            return Ok(());
        };
        let payload = String::from_utf8(B64.decode(payload_b64.trim())?)?;
        let signature_b64 = payload
            .strip_prefix("v=")
            .ok_or_else(|| anyhow!("Malformed SCRAM server-final: {payload}"))?;
        let (server_key, auth_message) = match (&self.server_key, &self.auth_message) {
            (Some(k), Some(m)) => (k, m),
            _ => return Err(anyhow!("SCRAM success before challenge")),
        };
        let expected = hmac_sha1(server_key, auth_message.as_bytes());
        let got = B64.decode(signature_b64.trim())?;
        if got == expected {
            Ok(())
        } else {
            Err(anyhow!("SCRAM server signature mismatch"))
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

/// RFC 5802 §5.1: `=` and `,` cannot appear literally in the `n=`
/// attribute; a jid localpart may contain both.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn generate_nonce() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..24).map(|_| rng.gen()).collect();
    B64.encode(&bytes)
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Parses SCRAM server-first-message: `r=nonce,s=salt,i=iterations`.
fn parse_server_first(msg: &str) -> Result<(String, String, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(val) = part.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = part.strip_prefix("s=") {
            salt = Some(val.to_string());
        } else if let Some(val) = part.strip_prefix("i=") {
            iterations = Some(val.parse::<u32>()?);
        }
    }

    Ok((
        nonce.ok_or_else(|| anyhow!("Missing nonce in server-first"))?,
        salt.ok_or_else(|| anyhow!("Missing salt in server-first"))?,
        iterations.ok_or_else(|| anyhow!("Missing iterations in server-first"))?,
    ))
}
