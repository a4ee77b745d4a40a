use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;
use snafu::prelude::*;

use crate::template::{FileMap, Template};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Bad auth"))]
    Unauthorized,

    #[snafu(display("Failed to execute auth header transform template: {source}"))]
    Transform { source: crate::template::Error },

    #[snafu(display("Failed to parse auth header transform template: {source}"))]
    TransformParse { source: crate::template::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default user for basic HTTP authentication.
const DEFAULT_BASIC_AUTH_USER: &str = "gte";

/// Default query parameter checked for api keys.
const DEFAULT_QUERY_AUTH_KEY: &str = "__gteApiKey";

/// A configuration string whose value may be loaded from the environment
/// with the `ENV{VAR_NAME}` syntax. The raw form is kept for serialization
/// so secrets never round-trip into logs or previews.
#[derive(Debug, Clone)]
pub struct SecretString {
    raw: String,
    resolved: String,
}

impl SecretString {
    pub fn value(&self) -> &str {
        &self.resolved
    }
}

impl Serialize for SecretString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let resolved = match raw.strip_prefix("ENV{").and_then(|r| r.strip_suffix('}')) {
            Some(var_name) => std::env::var(var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "environment variable {var_name} referenced in config is not set"
                ))
            })?,
            None => raw.clone(),
        };
        Ok(Self { raw, resolved })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    /// Api keys for this auth type. Each value supports the `ENV{VAR}`
    /// escape to load the key from the environment at startup.
    pub api_keys: Vec<SecretString>,

    /// If true, allows basic HTTP authentication
    pub basic_auth: bool,

    /// If true, url query authentication will be allowed
    pub query_auth: bool,

    /// The key to check for in the url query.
    /// Defaults to `__gteApiKey` if none is provided
    pub query_auth_key: Option<String>,

    /// The basic auth HTTP username.
    /// Defaults to `gte` if none is provided
    pub basic_auth_user: Option<String>,

    /// If provided, api keys will be searched for in these headers.
    /// E.g. GitLab hooks can authenticate via X-Gitlab-Token
    pub auth_headers: Vec<AuthHeader>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthHeader {
    /// Header name, case-insensitive
    pub header: String,

    /// If provided, the header content will be compared using this method
    pub method: AuthHeaderMethod,

    /// If provided, alters the incoming header value before comparison,
    /// where the value is exposed to the template as `value`.
    /// E.g. for GitHub webhooks, `{{ value | replace("sha256=", "") }}`
    /// strips the prefix GitHub prepends to all webhook signatures.
    pub transform: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthHeaderMethod {
    /// Simply compares the value of the header with every api key
    #[default]
    #[serde(rename = "none", alias = "")]
    None,

    /// Calculates the body HMAC-SHA256 hash for each api key,
    /// and compares the hex hash with the value provided in the header.
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
}

/// The request material auth evaluation runs against. The body is read
/// once by the caller and replayed here for HMAC comparison.
pub struct AuthRequest<'a> {
    pub headers: &'a http::HeaderMap,
    pub query: &'a [(String, String)],
    pub body: &'a [u8],
}

/// An auth chain with transform templates parsed at compile time, so bad
/// templates fail startup instead of the first request.
#[derive(Debug, Clone, Default)]
pub struct CompiledAuth {
    configs: Vec<CompiledAuthConfig>,
}

#[derive(Debug, Clone)]
struct CompiledAuthConfig {
    config: AuthConfig,
    headers: Vec<CompiledAuthHeader>,
}

#[derive(Debug, Clone)]
struct CompiledAuthHeader {
    header: String,
    method: AuthHeaderMethod,
    transform: Option<Template>,
}

impl CompiledAuth {
    pub fn compile(id: &str, configs: &[AuthConfig]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(configs.len());
        for (config_idx, config) in configs.iter().enumerate() {
            let mut headers = Vec::with_capacity(config.auth_headers.len());
            for (header_idx, auth_header) in config.auth_headers.iter().enumerate() {
                let transform = match &auth_header.transform {
                    Some(source) => Some(
                        Template::parse(
                            format!("{id}-auth-{config_idx}-transform-{header_idx}"),
                            source,
                        )
                        .context(TransformParseSnafu)?,
                    ),
                    None => None,
                };
                headers.push(CompiledAuthHeader {
                    header: auth_header.header.clone(),
                    method: auth_header.method,
                    transform,
                });
            }
            compiled.push(CompiledAuthConfig {
                config: config.clone(),
                headers,
            });
        }
        Ok(Self { configs: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Accepts iff any one config in the chain matches. Within a config,
    /// any positive match ends the check.
    pub fn verify(&self, request: &AuthRequest) -> Result<()> {
        if self.configs.is_empty() {
            return Ok(());
        }

        for entry in &self.configs {
            if entry.matches(request)? {
                return Ok(());
            }
        }

        UnauthorizedSnafu.fail()
    }
}

impl CompiledAuthConfig {
    fn matches(&self, request: &AuthRequest) -> Result<bool> {
        let auth = &self.config;

        // Basic HTTP authentication
        if auth.basic_auth
            && let Some((username, password)) = basic_credentials(request.headers)
        {
            let auth_user = auth
                .basic_auth_user
                .as_deref()
                .unwrap_or(DEFAULT_BASIC_AUTH_USER);
            if username == auth_user
                && auth
                    .api_keys
                    .iter()
                    .any(|api_key| password == api_key.value())
            {
                return Ok(true);
            }
        }

        // Url query authentication
        if auth.query_auth {
            let query_key = auth
                .query_auth_key
                .as_deref()
                .unwrap_or(DEFAULT_QUERY_AUTH_KEY);
            let provided = request
                .query
                .iter()
                .rev()
                .find(|(key, _)| key == query_key)
                .map(|(_, value)| value.as_str());
            if let Some(provided) = provided
                && auth
                    .api_keys
                    .iter()
                    .any(|api_key| provided == api_key.value())
            {
                return Ok(true);
            }
        }

        // Header authentication
        for auth_header in &self.headers {
            let Some(header_value) = request
                .headers
                .get(&auth_header.header)
                .and_then(|v| v.to_str().ok())
            else {
                continue;
            };

            let header_value = match &auth_header.transform {
                Some(template) => template
                    .execute(
                        &serde_json::json!({ "value": header_value }),
                        &FileMap::new(),
                    )
                    .context(TransformSnafu)?,
                None => header_value.to_string(),
            };

            for api_key in &auth.api_keys {
                let matched = match auth_header.method {
                    AuthHeaderMethod::None => header_value == api_key.value(),
                    AuthHeaderMethod::HmacSha256 => {
                        header_value == hmac_sha256_hex(request.body, api_key.value())
                    }
                };
                if matched {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }
}

pub(crate) fn basic_credentials(headers: &http::HeaderMap) -> Option<(String, String)> {
    use base64::Engine;

    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

pub fn hmac_sha256_hex(data: &[u8], secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}
