//! Cloud key providers: wrap/unwrap delegated to a remote keystore or KMS
//! over an authenticated JSON API. Key material crosses the wire
//! base64-encoded; for the KMS variant the plaintext data key is minted by
//! the service.

use super::{DataKey, KeyParams, KeyProvider};
use crate::config::ProviderKind;
use crate::error::Error;
use crate::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shared HTTP plumbing for both cloud variants.
pub struct RemoteKeys {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    provider: ProviderKind,
}

impl RemoteKeys {
    pub fn new(
        provider: ProviderKind,
        base_url: String,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            provider,
        })
    }

    fn provider_name(&self) -> &'static str {
        match self.provider {
            ProviderKind::Local => "local",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Aws => "aws",
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}/{}", self.base_url, operation);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            Error::ProviderUnavailable(format!("{} {}: {}", self.provider_name(), operation, e))
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<R>().await.map_err(|e| {
                Error::ProviderUnavailable(format!(
                    "{} {}: malformed response: {}",
                    self.provider_name(),
                    operation,
                    e
                ))
            });
        }

        let detail = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => Error::KeyAccessDenied(format!("{}: {}", operation, detail)),
            404 => Error::KeyNotFound(format!("{}: {}", operation, detail)),
            400 | 422 => Error::KeyAlgorithmUnsupported(format!("{}: {}", operation, detail)),
            _ => Error::ProviderUnavailable(format!("{}: HTTP {}: {}", operation, status, detail)),
        })
    }
}

#[derive(Serialize)]
struct WrapRequest<'a> {
    plaintext: &'a str,
}

#[derive(Deserialize)]
struct WrapResponse {
    wrapped: String,
}

#[derive(Serialize)]
struct UnwrapRequest<'a> {
    wrapped: &'a str,
}

#[derive(Deserialize)]
struct UnwrapResponse {
    plaintext: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    plaintext: String,
    wrapped: String,
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| Error::ProviderUnavailable(format!("invalid base64 in {}: {}", field, e)))
}

/// Keystore holding the asymmetric pair; the data key is generated locally
/// and sent to the service only for wrapping.
pub struct CloudKeystore {
    remote: RemoteKeys,
}

impl CloudKeystore {
    pub fn new(remote: RemoteKeys) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl KeyProvider for CloudKeystore {
    fn name(&self) -> &str {
        self.remote.provider_name()
    }

    fn public_params(&self) -> KeyParams {
        KeyParams {
            algorithm: "RSA-OAEP-SHA256".to_string(),
            key_size: 0,
        }
    }

    async fn wrap(&self, data_key: &DataKey) -> Result<Vec<u8>> {
        let request = WrapRequest {
            plaintext: &BASE64.encode(data_key.as_bytes()),
        };
        let response: WrapResponse = self.remote.post("wrap", &request).await?;
        decode_b64("wrapped", &response.wrapped)
    }

    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey> {
        let request = UnwrapRequest {
            wrapped: &BASE64.encode(wrapped),
        };
        let response: UnwrapResponse = self.remote.post("unwrap", &request).await?;
        DataKey::from_bytes(&decode_b64("plaintext", &response.plaintext)?)
    }
}

/// Managed KMS: wrap, unwrap and data-key generation all happen inside the
/// service, so the private key never leaves it.
pub struct CloudKms {
    remote: RemoteKeys,
}

impl CloudKms {
    pub fn new(remote: RemoteKeys) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl KeyProvider for CloudKms {
    fn name(&self) -> &str {
        self.remote.provider_name()
    }

    fn public_params(&self) -> KeyParams {
        KeyParams {
            algorithm: "KMS".to_string(),
            key_size: 0,
        }
    }

    async fn wrap(&self, data_key: &DataKey) -> Result<Vec<u8>> {
        let request = WrapRequest {
            plaintext: &BASE64.encode(data_key.as_bytes()),
        };
        let response: WrapResponse = self.remote.post("encrypt", &request).await?;
        decode_b64("wrapped", &response.wrapped)
    }

    async fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey> {
        let request = UnwrapRequest {
            wrapped: &BASE64.encode(wrapped),
        };
        let response: UnwrapResponse = self.remote.post("decrypt", &request).await?;
        DataKey::from_bytes(&decode_b64("plaintext", &response.plaintext)?)
    }

    async fn generate_data_key(&self) -> Result<(DataKey, Vec<u8>)> {
        let response: GenerateResponse = self
            .remote
            .post("generate-data-key", &serde_json::json!({ "key_spec": "AES_256" }))
            .await?;
        let key = DataKey::from_bytes(&decode_b64("plaintext", &response.plaintext)?)?;
        let wrapped = decode_b64("wrapped", &response.wrapped)?;
        Ok((key, wrapped))
    }
}
