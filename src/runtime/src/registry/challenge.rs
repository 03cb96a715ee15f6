//! `WWW-Authenticate` challenge decoding.
//!
//! Registries advertise how a client must authenticate on the `/v2/`
//! endpoint. The header is decoded once into a [`Challenge`] and every later
//! decision matches on the variant.

use std::collections::HashMap;

use refit_core::error::{RefitError, Result};
use reqwest::Url;

use super::reference::ImageReference;

/// Authentication scheme advertised by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Registry is open; no `Authorization` header needed.
    None,
    /// HTTP basic auth with the stored credential.
    Basic { realm: Option<String> },
    /// Token exchange against `realm`.
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    /// Decode a `WWW-Authenticate` header value.
    pub fn parse(registry: &str, header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, rest) = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest),
            None => (header, ""),
        };
        let params = parse_params(rest);

        if scheme.eq_ignore_ascii_case("basic") {
            return Ok(Challenge::Basic {
                realm: params.get("realm").cloned(),
            });
        }

        if scheme.eq_ignore_ascii_case("bearer") {
            let realm = params.get("realm").cloned().ok_or_else(|| {
                RefitError::UnsupportedChallenge {
                    registry: registry.to_string(),
                    scheme: "Bearer without realm".to_string(),
                }
            })?;
            return Ok(Challenge::Bearer {
                realm,
                service: params.get("service").cloned(),
                scope: params.get("scope").cloned(),
            });
        }

        Err(RefitError::UnsupportedChallenge {
            registry: registry.to_string(),
            scheme: scheme.to_string(),
        })
    }

    /// Bind a bearer challenge to the pull scope of `reference`.
    pub fn scoped_to(self, reference: &ImageReference) -> Self {
        match self {
            Challenge::Bearer { realm, service, .. } => Challenge::Bearer {
                realm,
                service,
                scope: Some(reference.pull_scope()),
            },
            other => other,
        }
    }

    /// Token endpoint URL carrying `service` and `scope` query parameters.
    ///
    /// Only bearer challenges have a token endpoint.
    pub fn token_url(&self) -> Option<Result<Url>> {
        let Challenge::Bearer {
            realm,
            service,
            scope,
        } = self
        else {
            return None;
        };

        Some(
            Url::parse(realm)
                .map_err(|e| RefitError::AuthenticationFailed {
                    realm: realm.clone(),
                    status: 0,
                    message: format!("invalid realm URL: {}", e),
                })
                .map(|mut url| {
                    {
                        let mut query = url.query_pairs_mut();
                        if let Some(service) = service {
                            query.append_pair("service", service);
                        }
                        if let Some(scope) = scope {
                            query.append_pair("scope", scope);
                        }
                    }
                    url
                }),
        )
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Challenge::None => "none",
            Challenge::Basic { .. } => "basic",
            Challenge::Bearer { .. } => "bearer",
        }
    }
}

/// Parse `key="value", key2=value2` auth-params. Keys are lowercased;
/// quoted values may contain commas and backslash escapes.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        let key = key.trim().to_ascii_lowercase();

        if chars.next_if_eq(&'=').is_none() {
            if key.is_empty() && chars.peek().is_none() {
                break;
            }
            continue;
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        if !key.is_empty() {
            params.insert(key, value);
        }
    }

    params
}
