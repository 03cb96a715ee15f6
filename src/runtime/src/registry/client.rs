//! Registry manifest client.
//!
//! Speaks just enough of the Docker Registry HTTP API v2 to read a
//! manifest without pulling any layers: challenge discovery on `/v2/`,
//! token exchange (or basic auth), then a content-negotiated manifest GET.

use async_trait::async_trait;
use refit_core::config::RegistryConfig;
use refit_core::error::{RefitError, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;

use super::challenge::Challenge;
use super::manifest::{self, ManifestDescriptor, PlatformEntry, ACCEPTED_MEDIA_TYPES};
use super::reference::ImageReference;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Longest registry error body quoted back in an error.
const MAX_ERROR_BODY: usize = 512;

/// Source of manifests for the staleness resolver.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetch the manifest for `reference`. `credential` is a Base64
    /// basic-auth payload; empty means anonymous.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        credential: &str,
    ) -> Result<ManifestDescriptor>;

    /// Read the platform recorded in a single-platform image's config blob.
    async fn fetch_config_platform(
        &self,
        reference: &ImageReference,
        credential: &str,
        config_digest: &str,
    ) -> Result<Option<PlatformEntry>>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// HTTP client for registry manifests.
#[derive(Clone)]
pub struct ManifestClient {
    http: reqwest::Client,
    plain_http: Vec<String>,
}

impl ManifestClient {
    /// Build a client whose every request is bounded by
    /// `config.request_timeout_secs`.
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout())
            .user_agent(concat!("refit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RefitError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            plain_http: config.plain_http.iter().map(|h| h.to_lowercase()).collect(),
        })
    }

    fn base_url(&self, reference: &ImageReference) -> String {
        let host = reference.api_host();
        let scheme = if self.plain_http.iter().any(|h| h == &host.to_lowercase()) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, host)
    }

    fn transport_error(reference: &ImageReference, err: reqwest::Error) -> RefitError {
        if err.is_timeout() {
            RefitError::Timeout(format!("registry {}: {}", reference.registry, err))
        } else {
            RefitError::RegistryUnreachable {
                registry: reference.registry.clone(),
                message: err.to_string(),
            }
        }
    }

    /// Read the authentication challenge from the registry base endpoint.
    pub async fn discover_challenge(&self, reference: &ImageReference) -> Result<Challenge> {
        let url = format!("{}/v2/", self.base_url(reference));
        tracing::debug!(url = %url, "Probing registry challenge");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error(reference, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(Challenge::None);
        }

        match response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
        {
            Some(header) => {
                Ok(Challenge::parse(&reference.registry, header)?.scoped_to(reference))
            }
            None => Err(RefitError::ChallengeNotFound {
                registry: reference.registry.clone(),
                status: status.as_u16(),
            }),
        }
    }

    /// Resolve the `Authorization` header value for a challenge.
    ///
    /// Returns `None` for anonymous access.
    pub async fn authorize(
        &self,
        reference: &ImageReference,
        challenge: &Challenge,
        credential: &str,
    ) -> Result<Option<String>> {
        match challenge {
            Challenge::None => Ok(None),
            Challenge::Basic { .. } if credential.is_empty() => Ok(None),
            Challenge::Basic { .. } => Ok(Some(format!("Basic {}", credential))),
            Challenge::Bearer { realm, .. } => {
                let url = challenge.token_url().unwrap_or_else(|| {
                    Err(RefitError::Other("bearer challenge without token URL".to_string()))
                })?;
                tracing::debug!(url = %url, anonymous = credential.is_empty(), "Requesting registry token");

                let mut request = self.http.get(url);
                if !credential.is_empty() {
                    request = request.header(AUTHORIZATION, format!("Basic {}", credential));
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| Self::transport_error(reference, e))?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(RefitError::AuthenticationFailed {
                        realm: realm.clone(),
                        status: status.as_u16(),
                        message: truncate(&body),
                    });
                }

                let token: TokenResponse =
                    response
                        .json()
                        .await
                        .map_err(|e| RefitError::AuthenticationFailed {
                            realm: realm.clone(),
                            status: status.as_u16(),
                            message: format!("invalid token response: {}", e),
                        })?;

                token
                    .token
                    .or(token.access_token)
                    .filter(|t| !t.is_empty())
                    .map(|t| Some(format!("Bearer {}", t)))
                    .ok_or_else(|| RefitError::AuthenticationFailed {
                        realm: realm.clone(),
                        status: status.as_u16(),
                        message: "token response carried no token".to_string(),
                    })
            }
        }
    }

    async fn authorization_for(
        &self,
        reference: &ImageReference,
        credential: &str,
    ) -> Result<Option<String>> {
        let challenge = self.discover_challenge(reference).await?;
        tracing::debug!(
            reference = %reference,
            scheme = challenge.scheme(),
            "Registry challenge discovered"
        );
        self.authorize(reference, &challenge, credential).await
    }

    async fn get_manifest(
        &self,
        reference: &ImageReference,
        authorization: Option<&str>,
    ) -> Result<ManifestDescriptor> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference),
            reference.repository,
            reference.manifest_reference()
        );

        let mut request = self
            .http
            .get(&url)
            .header(ACCEPT, ACCEPTED_MEDIA_TYPES.join(", "));
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::transport_error(reference, e))?;

        let status = response.status();
        if status != StatusCode::OK {
            let www_authenticate = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(RefitError::ManifestFetchFailed {
                reference: reference.full_reference(),
                status: status.as_u16(),
                www_authenticate,
            });
        }

        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let digest = headers
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| Self::transport_error(reference, e))?;

        manifest::decode(
            &reference.full_reference(),
            content_type.as_deref(),
            &body,
            digest,
        )
    }
}

#[async_trait]
impl ManifestSource for ManifestClient {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        credential: &str,
    ) -> Result<ManifestDescriptor> {
        let authorization = self.authorization_for(reference, credential).await?;
        let descriptor = self.get_manifest(reference, authorization.as_deref()).await?;

        tracing::debug!(
            reference = %reference,
            digest = %descriptor.digest,
            kind = ?descriptor.kind,
            platforms = descriptor.platforms.len(),
            "Fetched manifest"
        );
        Ok(descriptor)
    }

    async fn fetch_config_platform(
        &self,
        reference: &ImageReference,
        credential: &str,
        config_digest: &str,
    ) -> Result<Option<PlatformEntry>> {
        let authorization = self.authorization_for(reference, credential).await?;
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(reference),
            reference.repository,
            config_digest
        );

        let mut request = self.http.get(&url);
        if let Some(ref value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Self::transport_error(reference, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefitError::ManifestFetchFailed {
                reference: format!("{}@{}", reference.full_reference(), config_digest),
                status: status.as_u16(),
                www_authenticate: None,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Self::transport_error(reference, e))?;
        manifest::decode_config_platform(&reference.full_reference(), &body)
    }
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
