use axum::Json;
use axum::response::{IntoResponse, Response};
use axum::routing::on;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use super::{
    MiddlewareHook, MountRoutesHook, OutputDisposition, OutputHook, Plugin, PluginBuildContext,
    Result, RouteLayer, TemplateSnafu, plugin_id,
};
use crate::args::ArgMap;
use crate::listener::{CompiledListener, ListenerResponse};
use crate::server::RouteRegistrar;
use crate::template::{FileMap, Template};
use tower_http::cors::{Any, CorsLayer};

/// The shaped listener response is exposed to header and status templates
/// under this key.
pub const KEY_LISTENER_RESPONSE: &str = "__gteResult";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpResponseConfig {
    /// Headers to set in the HTTP response; values are templates and the
    /// rendered results are trimmed, empty results are skipped.
    pub headers: Option<IndexMap<String, String>>,

    /// Template for the response status code. An empty render falls back
    /// to 200.
    pub status_code: Option<String>,

    /// If set, CORS handling is enabled for the listener routes
    pub cors: Option<CorsConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorsConfig {
    /// Origins a cross-domain request can be executed from; `*` allows
    /// all. Defaults to all origins.
    pub allowed_origins: Option<Vec<String>>,

    /// Methods the client is allowed to use with cross-domain requests.
    /// Defaults to the methods accepted by the listener.
    pub allowed_methods: Option<Vec<String>>,

    /// Non-simple headers the client is allowed to use; `*` allows all
    pub allowed_headers: Option<Vec<String>>,

    /// Headers safe to expose to the CORS API of the browser
    pub exposed_headers: Option<Vec<String>>,

    /// How long (in seconds) the results of a preflight request can be
    /// cached
    pub max_age: Option<u64>,

    /// Whether the request can include user credentials
    pub allow_credentials: bool,
}

/// Output hook shaping the final HTTP response from templates, with
/// optional CORS handling for the listener routes.
#[derive(Debug)]
pub struct HttpResponsePlugin {
    id: String,
    config: HttpResponseConfig,
    tpl_headers: IndexMap<String, Template>,
    tpl_status_code: Option<Template>,
}

impl HttpResponsePlugin {
    pub fn new(config: HttpResponseConfig, context: &PluginBuildContext<'_>) -> Result<Self> {
        let id = plugin_id("http-response");

        let mut tpl_headers = IndexMap::new();
        for (name, source) in config.headers.iter().flatten() {
            tpl_headers.insert(
                name.clone(),
                Template::parse(format!("{}-{id}-header-{name}", context.listener_id), source)
                    .context(TemplateSnafu)?,
            );
        }

        let tpl_status_code = match &config.status_code {
            Some(source) => Some(
                Template::parse(format!("{}-{id}-status", context.listener_id), source)
                    .context(TemplateSnafu)?,
            ),
            None => None,
        };

        Ok(Self {
            id,
            config,
            tpl_headers,
            tpl_status_code,
        })
    }

    fn cors_layer(&self, listener: &CompiledListener) -> Option<CorsLayer> {
        let cors = self.config.cors.as_ref()?;
        let mut layer = CorsLayer::new();

        match &cors.allowed_origins {
            Some(origins) if !origins.iter().any(|o| o == "*") => {
                let origins: Vec<http::HeaderValue> =
                    origins.iter().filter_map(|o| o.parse().ok()).collect();
                layer = layer.allow_origin(origins);
            }
            _ => layer = layer.allow_origin(Any),
        }

        let methods: Vec<http::Method> = cors
            .allowed_methods
            .clone()
            .unwrap_or_else(|| listener.config().methods_or_default())
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        layer = layer.allow_methods(methods);

        if let Some(headers) = &cors.allowed_headers {
            if headers.iter().any(|h| h == "*") {
                layer = layer.allow_headers(Any);
            } else {
                let headers: Vec<http::HeaderName> =
                    headers.iter().filter_map(|h| h.parse().ok()).collect();
                layer = layer.allow_headers(headers);
            }
        }

        if let Some(exposed) = &cors.exposed_headers {
            let exposed: Vec<http::HeaderName> =
                exposed.iter().filter_map(|h| h.parse().ok()).collect();
            layer = layer.expose_headers(exposed);
        }

        if let Some(max_age) = cors.max_age {
            layer = layer.max_age(Duration::from_secs(max_age));
        }

        if cors.allow_credentials {
            layer = layer.allow_credentials(true);
        }

        Some(layer)
    }
}

impl Plugin for HttpResponsePlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn output(&self) -> Option<&dyn OutputHook> {
        Some(self)
    }

    fn mount_routes(&self) -> Option<&dyn MountRoutesHook> {
        Some(self)
    }

    fn middlewares(&self) -> Option<&dyn MiddlewareHook> {
        Some(self)
    }
}

impl OutputHook for HttpResponsePlugin {
    fn hook_output(
        &self,
        _listener: &CompiledListener,
        args: &ArgMap,
        response: &ListenerResponse,
    ) -> Result<OutputDisposition> {
        let mut template_args = args.clone();
        template_args.insert(
            KEY_LISTENER_RESPONSE.to_string(),
            serde_json::to_value(response).map_err(|e| super::Error::Hook {
                message: format!("failed to serialize listener response: {e}"),
            })?,
        );
        let args_value = serde_json::Value::Object(template_args);
        let files = FileMap::new();

        let mut rendered_headers: Vec<(http::HeaderName, http::HeaderValue)> = Vec::new();
        for (name, template) in &self.tpl_headers {
            let value = template
                .execute(&args_value, &files)
                .context(TemplateSnafu)?;
            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            let header_name: http::HeaderName =
                name.parse().map_err(|_| super::Error::Hook {
                    message: format!("invalid response header name {name}"),
                })?;
            let header_value: http::HeaderValue =
                value.parse().map_err(|_| super::Error::Hook {
                    message: format!("invalid response header value for {name}"),
                })?;
            rendered_headers.push((header_name, header_value));
        }

        let status_code = match &self.tpl_status_code {
            None => http::StatusCode::OK,
            Some(template) => {
                let rendered = template
                    .execute(&args_value, &files)
                    .context(TemplateSnafu)?;
                let rendered = rendered.trim();
                if rendered.is_empty() {
                    http::StatusCode::OK
                } else {
                    let code: u16 = rendered.parse().map_err(|_| super::Error::Hook {
                        message: format!("failed to parse response status code {rendered}"),
                    })?;
                    http::StatusCode::from_u16(code).map_err(|_| super::Error::Hook {
                        message: format!("invalid response status code {code}"),
                    })?
                }
            }
        };

        let mut http_response = (status_code, Json(response.clone())).into_response();
        for (name, value) in rendered_headers {
            http_response.headers_mut().insert(name, value);
        }

        Ok(OutputDisposition::Handled(http_response))
    }
}

impl MountRoutesHook for HttpResponsePlugin {
    /// Preflight needs an OPTIONS route when the listener itself does not
    /// declare one. It bypasses the listener auth chain.
    fn hook_mount_routes(&self, routes: &mut RouteRegistrar, listener: &Arc<CompiledListener>) {
        let Some(cors) = self.cors_layer(listener) else {
            return;
        };

        let declares_options = listener
            .config()
            .methods_or_default()
            .iter()
            .any(|m| m == "OPTIONS");
        if declares_options {
            return;
        }

        let handler = on(axum::routing::MethodFilter::OPTIONS, || async {
            http::StatusCode::OK
        })
        .route_layer(cors);
        routes.route("OPTIONS", listener.route(), handler);
    }
}

impl MiddlewareHook for HttpResponsePlugin {
    fn hook_middlewares(&self, listener: &CompiledListener) -> Vec<RouteLayer> {
        match self.cors_layer(listener) {
            Some(layer) => vec![RouteLayer::Cors(layer)],
            None => Vec::new(),
        }
    }
}
