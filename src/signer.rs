//! Typed client for the sealed signer.
//!
//! The signer is the only party that can unseal IPNS private keys; the
//! coordinator ships it sealed blobs and gets back signed records, never key
//! material in the clear. Everything that crosses this boundary is validated
//! here once and treated as opaque afterwards.

use std::{fmt, future::Future, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::SignerError;

/// Uncompressed SEC1 public keys: 65 bytes, leading 0x04.
const PUBLIC_KEY_LEN: usize = 65;
const SEC1_UNCOMPRESSED_PREFIX: u8 = 0x04;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SignerHealth {
    pub healthy: bool,
    pub epoch: u64,
}

/// One enrollment in a `POST /republish` batch.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepublishEntry {
    /// Base64 sealed key, passed through untouched.
    pub encrypted_ipns_key: String,
    pub key_epoch: u64,
    pub ipns_name: String,
    pub latest_cid: String,
    pub sequence_number: String,
    pub current_epoch: u64,
    pub previous_epoch: Option<u64>,
}

// Manual Debug: the sealed key never reaches log output.
impl fmt::Debug for RepublishEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepublishEntry")
            .field("encrypted_ipns_key", &"<sealed>")
            .field("key_epoch", &self.key_epoch)
            .field("ipns_name", &self.ipns_name)
            .field("latest_cid", &self.latest_cid)
            .field("sequence_number", &self.sequence_number)
            .field("current_epoch", &self.current_epoch)
            .field("previous_epoch", &self.previous_epoch)
            .finish()
    }
}

/// Per-entry outcome of a batch. The signer may return fewer results than
/// entries; the scheduler treats the missing ones as failures.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepublishResult {
    pub ipns_name: String,
    pub success: bool,
    /// Base64 signed IPNS record, present on success.
    #[serde(default)]
    pub signed_record: Option<String>,
    #[serde(default)]
    pub new_sequence_number: Option<String>,
    /// Present (with `upgraded_key_epoch`) when the signer re-sealed the key
    /// under a newer epoch.
    #[serde(default)]
    pub upgraded_encrypted_key: Option<String>,
    #[serde(default)]
    pub upgraded_key_epoch: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Serialize)]
struct RepublishRequest {
    entries: Vec<RepublishEntry>,
}

#[derive(Deserialize)]
struct RepublishResponse {
    results: Vec<RepublishResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyResponse {
    public_key: String,
}

/// Seam between the scheduler/admin layers and the real HTTP client, so
/// batch logic and stats can run against mocks.
pub trait SignerApi {
    fn health(&self) -> impl Future<Output = Result<SignerHealth, SignerError>> + Send;
    fn public_key(&self, epoch: u64) -> impl Future<Output = Result<Vec<u8>, SignerError>> + Send;
    fn sign_batch(
        &self,
        entries: Vec<RepublishEntry>,
    ) -> impl Future<Output = Result<Vec<RepublishResult>, SignerError>> + Send;
}

#[derive(Debug, Clone)]
pub struct SignerClient {
    base_url: String,
    secret: Option<String>,
    http: reqwest::Client,
}

impl SignerClient {
    pub fn new(
        base_url: &str,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SignerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignerError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            http,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.get(url);
        match &self.secret {
            Some(secret) => req.bearer_auth(secret),
            None => req,
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.post(url);
        match &self.secret {
            Some(secret) => req.bearer_auth(secret),
            None => req,
        }
    }
}

impl SignerApi for SignerClient {
    async fn health(&self) -> Result<SignerHealth, SignerError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        check_status(&url, &resp)?;
        resp.json::<SignerHealth>()
            .await
            .map_err(|e| SignerError::Decode(e.to_string()))
    }

    async fn public_key(&self, epoch: u64) -> Result<Vec<u8>, SignerError> {
        let url = format!("{}/public-key", self.base_url);
        let resp = self
            .get(&url)
            .query(&[("epoch", epoch)])
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        check_status(&url, &resp)?;
        let body: PublicKeyResponse = resp
            .json()
            .await
            .map_err(|e| SignerError::Decode(e.to_string()))?;
        decode_public_key(&body.public_key)
    }

    async fn sign_batch(
        &self,
        entries: Vec<RepublishEntry>,
    ) -> Result<Vec<RepublishResult>, SignerError> {
        let url = format!("{}/republish", self.base_url);
        let resp = self
            .post(&url)
            .json(&RepublishRequest { entries })
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        check_status(&url, &resp)?;
        let body: RepublishResponse = resp
            .json()
            .await
            .map_err(|e| SignerError::Decode(e.to_string()))?;
        Ok(body.results)
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> SignerError {
    if err.is_timeout() {
        SignerError::Timeout {
            url: url.to_string(),
        }
    } else {
        SignerError::Transport(err.to_string())
    }
}

fn check_status(url: &str, resp: &reqwest::Response) -> Result<(), SignerError> {
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(SignerError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

/// Validate a hex public key from the signer: 130 hex chars, decoding to 65
/// bytes with the uncompressed SEC1 prefix. Anything else is rejected and
/// must not reach the epoch store.
pub fn decode_public_key(hex_key: &str) -> Result<Vec<u8>, SignerError> {
    let bytes = hex::decode(hex_key).map_err(|_| SignerError::InvalidKeyFormat {
        reason: "not valid hex".into(),
    })?;
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(SignerError::InvalidKeyFormat {
            reason: format!("expected {PUBLIC_KEY_LEN} bytes, got {}", bytes.len()),
        });
    }
    if bytes[0] != SEC1_UNCOMPRESSED_PREFIX {
        return Err(SignerError::InvalidKeyFormat {
            reason: format!("expected uncompressed SEC1 prefix 0x04, got {:#04x}", bytes[0]),
        });
    }
    Ok(bytes)
}
