//! Docker Engine API client.
//!
//! Talks to the engine over its unix socket with `hyper` + `hyperlocal`.
//! Every call is bounded by a timeout; a call that outlives it is dropped,
//! which aborts the in-flight request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use refit_core::config::EngineConfig;
use refit_core::error::{RefitError, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{ContainerEngine, ContainerSnapshot, CreateSpec, LocalImageRecord};
use crate::registry::ImageReference;

/// API version prefix; 1.41 is served by Docker 20.10 and later.
const API_VERSION: &str = "v1.41";

/// Server address Docker expects in auth configs for Docker Hub.
const DOCKER_HUB_AUTH_ADDRESS: &str = "https://index.docker.io/v1/";

/// Endpoint settings that describe intent rather than runtime state.
const REPLAYED_ENDPOINT_KEYS: &[&str] = &["IPAMConfig", "Links", "Aliases", "DriverOpts", "MacAddress"];

/// Length of the short container ID Docker uses for default hostnames and aliases.
const SHORT_ID_LEN: usize = 12;

/// Docker Engine over a unix socket.
pub struct DockerEngine {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
    call_timeout: Duration,
    pull_timeout: Duration,
    stop_timeout_secs: u64,
}

impl DockerEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            client: Client::unix(),
            call_timeout: config.call_timeout(),
            pull_timeout: config.pull_timeout(),
            stop_timeout_secs: config.stop_timeout_secs,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    async fn call(&self, call: Call<'_>) -> Result<(StatusCode, Bytes)> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, &format!("/{}{}", API_VERSION, call.path)).into();

        tracing::debug!(method = %call.method, path = %call.path, "Engine API request");

        let mut builder = Request::builder()
            .method(call.method.clone())
            .uri(uri)
            .header("Accept", "application/json");
        if let Some(ref auth) = call.registry_auth {
            builder = builder.header("X-Registry-Auth", auth.as_str());
        }
        let body = match call.body {
            Some(ref value) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(value)?)
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .map_err(|e| engine_error(call.operation, call.target, e))?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, bytes))
        };

        match tokio::time::timeout(call.timeout, exchange).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(engine_error(call.operation, call.target, e)),
            Err(_) => Err(RefitError::Timeout(format!(
                "{} {} did not finish within {}s",
                call.operation,
                call.target,
                call.timeout.as_secs()
            ))),
        }
    }

    /// Issue a container call, mapping 404 to `ContainerNotFound` and
    /// treating 304 (already in the requested state) as success.
    async fn container_call(&self, call: Call<'_>) -> Result<Bytes> {
        let operation = call.operation;
        let target = call.target;
        let (status, body) = self.call(call).await?;

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(body);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RefitError::ContainerNotFound(target.to_string()));
        }
        Err(status_error(operation, target, status, &body))
    }
}

/// One engine API request.
struct Call<'a> {
    method: Method,
    path: String,
    body: Option<Value>,
    registry_auth: Option<String>,
    timeout: Duration,
    operation: &'a str,
    target: &'a str,
}

impl<'a> Call<'a> {
    fn new(method: Method, path: String, timeout: Duration, operation: &'a str, target: &'a str) -> Self {
        Self {
            method,
            path,
            body: None,
            registry_auth: None,
            timeout,
            operation,
            target,
        }
    }

    fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    fn registry_auth(mut self, auth: Option<String>) -> Self {
        self.registry_auth = auth;
        self
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot> {
        let body = self
            .container_call(Call::new(
                Method::GET,
                format!("/containers/{}/json", id),
                self.call_timeout,
                "inspect",
                id,
            ))
            .await?;
        snapshot_from_inspect(&body)
    }

    async fn create(&self, name: &str, spec: &CreateSpec) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Created {
            id: String,
            #[serde(default)]
            warnings: Option<Vec<String>>,
        }

        let path = endpoint("/containers/create", &[("name", name)])?;
        let (status, body) = self
            .call(Call::new(Method::POST, path, self.call_timeout, "create", name).body(create_body(spec)))
            .await?;
        if !status.is_success() {
            return Err(status_error("create", name, status, &body));
        }

        let created: Created = serde_json::from_slice(&body)?;
        for warning in created.warnings.unwrap_or_default() {
            tracing::warn!(container = %name, warning = %warning, "Engine warning on create");
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.container_call(Call::new(
            Method::POST,
            format!("/containers/{}/start", id),
            self.call_timeout,
            "start",
            id,
        ))
        .await
        .map(|_| ())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let grace = self.stop_timeout_secs.to_string();
        let path = endpoint(&format!("/containers/{}/stop", id), &[("t", grace.as_str())])?;
        // The engine may wait the full grace period before killing
        let timeout = self.call_timeout + Duration::from_secs(self.stop_timeout_secs);
        self.container_call(Call::new(Method::POST, path, timeout, "stop", id))
            .await
            .map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let path = endpoint(&format!("/containers/{}", id), &[("force", "true"), ("v", "false")])?;
        self.container_call(Call::new(Method::DELETE, path, self.call_timeout, "remove", id))
            .await
            .map(|_| ())
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        let path = endpoint(&format!("/containers/{}/rename", id), &[("name", new_name)])?;
        self.container_call(Call::new(Method::POST, path, self.call_timeout, "rename", id))
            .await
            .map(|_| ())
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<LocalImageRecord>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct ImageSummary {
            id: String,
            #[serde(default)]
            repo_digests: Option<Vec<String>>,
        }

        let filters = json!({ "reference": [reference] }).to_string();
        let path = endpoint("/images/json", &[("filters", filters.as_str())])?;
        let (status, body) = self
            .call(Call::new(Method::GET, path, self.call_timeout, "list images", reference))
            .await?;
        if !status.is_success() {
            return Err(status_error("list images", reference, status, &body));
        }

        let images: Vec<ImageSummary> = serde_json::from_slice(&body)?;
        Ok(images
            .into_iter()
            .map(|image| LocalImageRecord {
                id: image.id,
                repo_digests: image.repo_digests.unwrap_or_default(),
            })
            .collect())
    }

    async fn pull(&self, reference: &ImageReference, credential: &str) -> Result<()> {
        let image = reference.full_reference();
        let path = endpoint("/images/create", &[("fromImage", image.as_str())])?;
        let auth = registry_auth(reference, credential)?;

        tracing::info!(image = %image, authenticated = auth.is_some(), "Pulling image");
        let (status, body) = self
            .call(
                Call::new(Method::POST, path, self.pull_timeout, "pull", &image).registry_auth(auth),
            )
            .await?;
        if !status.is_success() {
            return Err(status_error("pull", &image, status, &body));
        }

        // Failures after the stream starts arrive as a 200 with an error record
        if let Some(message) = pull_stream_error(&body) {
            return Err(RefitError::Engine {
                operation: "pull".to_string(),
                target: image,
                message,
            });
        }
        Ok(())
    }
}

fn engine_error(operation: &str, target: &str, err: impl std::fmt::Display) -> RefitError {
    RefitError::Engine {
        operation: operation.to_string(),
        target: target.to_string(),
        message: err.to_string(),
    }
}

fn status_error(operation: &str, target: &str, status: StatusCode, body: &[u8]) -> RefitError {
    RefitError::Engine {
        operation: operation.to_string(),
        target: target.to_string(),
        message: format!("{} {}", status.as_u16(), api_message(body)),
    }
}

/// `message` field of an engine error body, or the raw body.
fn api_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(e) => e.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

/// Path with an encoded query string.
fn endpoint(path: &str, params: &[(&str, &str)]) -> Result<String> {
    let mut url = reqwest::Url::parse(&format!("http://engine{}", path))
        .map_err(|e| RefitError::Other(format!("invalid engine path {}: {}", path, e)))?;
    url.query_pairs_mut().extend_pairs(params);
    Ok(match url.query() {
        Some(query) if !query.is_empty() => format!("{}?{}", url.path(), query),
        _ => url.path().to_string(),
    })
}

/// `X-Registry-Auth` value for a Base64 basic-auth payload.
fn registry_auth(reference: &ImageReference, credential: &str) -> Result<Option<String>> {
    if credential.is_empty() {
        return Ok(None);
    }

    let decoded = STANDARD
        .decode(credential)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(|| RefitError::Other("credential payload is not Base64 text".to_string()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| RefitError::Other("credential payload lacks user:password".to_string()))?;

    let server = if reference.is_default_registry() {
        DOCKER_HUB_AUTH_ADDRESS.to_string()
    } else {
        reference.registry.clone()
    };
    let auth = json!({
        "username": username,
        "password": password,
        "serveraddress": server,
    });
    Ok(Some(URL_SAFE.encode(serde_json::to_vec(&auth)?)))
}

/// First error record in a pull progress stream.
fn pull_stream_error(body: &[u8]) -> Option<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .find_map(|record| {
            record
                .get("errorDetail")
                .and_then(|d| d.get("message"))
                .or_else(|| record.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDocument {
    id: String,
    name: String,
    #[serde(default)]
    state: StateDocument,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    host_config: Value,
    #[serde(default)]
    network_settings: NetworkSettingsDocument,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct StateDocument {
    #[serde(default)]
    running: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettingsDocument {
    #[serde(default)]
    networks: Option<Map<String, Value>>,
}

/// Build a snapshot from a `GET /containers/{id}/json` body.
fn snapshot_from_inspect(body: &[u8]) -> Result<ContainerSnapshot> {
    let doc: InspectDocument = serde_json::from_slice(body)?;
    let short_id: String = doc.id.chars().take(SHORT_ID_LEN).collect();

    let image = doc
        .config
        .get("Image")
        .and_then(Value::as_str)
        .filter(|i| !i.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RefitError::Engine {
            operation: "inspect".to_string(),
            target: doc.id.clone(),
            message: "container config names no image".to_string(),
        })?;

    let mut config = doc.config;
    // A default hostname is the short ID; the clone must get its own
    if let Some(obj) = config.as_object_mut() {
        if obj.get("Hostname").and_then(Value::as_str) == Some(short_id.as_str()) {
            obj.remove("Hostname");
        }
    }

    let networking = doc
        .network_settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(network, endpoint)| (network, replayable_endpoint(endpoint, &short_id)))
        .collect::<Map<String, Value>>();

    Ok(ContainerSnapshot {
        name: doc.name.trim_start_matches('/').to_string(),
        id: doc.id,
        image,
        running: doc.state.running,
        spec: CreateSpec {
            config,
            host_config: doc.host_config,
            networking: Value::Object(networking),
        },
    })
}

/// Keep the configured parts of an endpoint, dropping the engine-added short-ID alias.
fn replayable_endpoint(endpoint: Value, short_id: &str) -> Value {
    let Value::Object(settings) = endpoint else {
        return Value::Object(Map::new());
    };

    let mut kept: Map<String, Value> = settings
        .into_iter()
        .filter(|(key, value)| REPLAYED_ENDPOINT_KEYS.contains(&key.as_str()) && !value.is_null())
        .collect();

    if let Some(Value::Array(aliases)) = kept.get_mut("Aliases") {
        aliases.retain(|alias| alias.as_str() != Some(short_id));
    }
    Value::Object(kept)
}

/// `POST /containers/create` body: the config with host and network config attached.
fn create_body(spec: &CreateSpec) -> Value {
    let mut body = match spec.config {
        Value::Object(ref config) => config.clone(),
        _ => Map::new(),
    };
    if !spec.host_config.is_null() {
        body.insert("HostConfig".to_string(), spec.host_config.clone());
    }
    if matches!(spec.networking, Value::Object(ref n) if !n.is_empty()) {
        body.insert(
            "NetworkingConfig".to_string(),
            json!({ "EndpointsConfig": spec.networking }),
        );
    }
    Value::Object(body)
}
