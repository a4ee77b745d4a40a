use axum::Json;
use axum::extract::{RawPathParams, Request};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter, get, on};
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::args::{ArgMap, extract_args};
use crate::auth::{AuthRequest, CompiledAuth};
use crate::config::MagpieConfig;
use crate::db::DbFactory;
use crate::listener::{CompiledListener, ListenerFactories};
use crate::plugins::RouteLayer;
use crate::storage::StorageFactory;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to compile listener {route}: {source}"))]
    Compile {
        route: String,
        source: crate::listener::Error,
    },

    #[snafu(display("Failed to start plugin for listener {listener}: {source}"))]
    PluginStart {
        listener: String,
        source: crate::plugins::Error,
    },

    #[snafu(display("Failed to bind to {address}: {source}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("Server error: {source}"))]
    Serve { source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Collects routes for the final router, skipping duplicate
/// (method, path) pairs so plugins shared across a listener's methods do
/// not collide.
pub struct RouteRegistrar {
    router: axum::Router,
    mounted: HashSet<(String, String)>,
}

impl Default for RouteRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRegistrar {
    pub fn new() -> Self {
        Self {
            router: axum::Router::new(),
            mounted: HashSet::new(),
        }
    }

    /// Returns false when the (method, path) pair was already mounted.
    pub fn route(&mut self, method: &str, path: &str, handler: MethodRouter) -> bool {
        let key = (method.to_string(), path.to_string());
        if self.mounted.contains(&key) {
            return false;
        }
        self.mounted.insert(key);
        let router = std::mem::take(&mut self.router);
        self.router = router.route(path, handler);
        true
    }

    pub fn into_router(self) -> axum::Router {
        self.router
    }
}

pub fn method_filter(method: &str) -> Option<MethodFilter> {
    match method {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "PATCH" => Some(MethodFilter::PATCH),
        "DELETE" => Some(MethodFilter::DELETE),
        "HEAD" => Some(MethodFilter::HEAD),
        "OPTIONS" => Some(MethodFilter::OPTIONS),
        "TRACE" => Some(MethodFilter::TRACE),
        _ => None,
    }
}

/// The compiled gateway: every listener of the configuration, ready to be
/// mounted into a router and served.
pub struct Gateway {
    listeners: Vec<Arc<CompiledListener>>,
    db_factory: Arc<DbFactory>,
    #[allow(dead_code)]
    storage_factory: Arc<StorageFactory>,
}

impl Gateway {
    /// Compiles every (route, method) binding. Listener ids are unique by
    /// construction since routes are map keys.
    pub async fn new(config: MagpieConfig) -> Result<Self> {
        let db_factory = Arc::new(DbFactory::new());
        let storage_factory = Arc::new(StorageFactory::new());

        let mut listeners = Vec::new();
        for (route, listener_config) in &config.listeners {
            let merged = listener_config.merged_over(&config.defaults);
            for method in merged.methods_or_default() {
                let factories = ListenerFactories {
                    db: &db_factory,
                    storage: &storage_factory,
                };
                let compiled = CompiledListener::compile(
                    format!("listener:{route}_{method}"),
                    route.clone(),
                    method.clone(),
                    merged.clone(),
                    &config.defaults,
                    &factories,
                )
                .await
                .with_context(|_| CompileSnafu {
                    route: route.clone(),
                })?;
                listeners.push(compiled);
            }
        }

        Ok(Self {
            listeners,
            db_factory,
            storage_factory,
        })
    }

    pub fn listeners(&self) -> &[Arc<CompiledListener>] {
        &self.listeners
    }

    /// Mounts every listener and plugin route, plus the unconditional
    /// health endpoint.
    pub fn router(&self) -> axum::Router {
        let mut registrar = RouteRegistrar::new();

        for listener in &self.listeners {
            let Some(filter) = method_filter(listener.method()) else {
                // Methods are validated at config load
                continue;
            };

            let mut method_router = on(filter, listener_handler(listener.clone()));
            for plugin in listener.plugins() {
                let Some(hook) = plugin.middlewares() else {
                    continue;
                };
                for layer in hook.hook_middlewares(listener) {
                    match layer {
                        RouteLayer::Cors(cors) => {
                            method_router = method_router.route_layer(cors);
                        }
                    }
                }
            }
            registrar.route(listener.method(), listener.route(), method_router);

            for plugin in listener.plugins() {
                if let Some(hook) = plugin.mount_routes() {
                    hook.hook_mount_routes(&mut registrar, listener);
                }
            }
        }

        registrar
            .into_router()
            .route("/healthz", get(|| async { http::StatusCode::OK }))
    }

    /// Fires plugin lifecycle start hooks (scheduler loops etc.).
    pub async fn start_plugins(&self) -> Result<()> {
        for listener in &self.listeners {
            for plugin in listener.plugins() {
                if let Some(lifecycle) = plugin.lifecycle() {
                    lifecycle
                        .on_start(listener)
                        .await
                        .with_context(|_| PluginStartSnafu {
                            listener: listener.id().to_string(),
                        })?;
                }
            }
        }
        Ok(())
    }

    pub async fn stop_plugins(&self) {
        for listener in &self.listeners {
            for plugin in listener.plugins() {
                if let Some(lifecycle) = plugin.lifecycle() {
                    lifecycle.on_stop().await;
                }
            }
        }
    }

    /// Serves until the shutdown future resolves, then stops plugin loops
    /// and closes shared handles.
    pub async fn serve(
        self,
        address: SocketAddr,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        self.start_plugins().await?;

        let tcp = tokio::net::TcpListener::bind(address)
            .await
            .context(BindSnafu { address })?;
        tracing::info!(%address, "magpie listening");

        axum::serve(tcp, self.router().into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .context(ServeSnafu)?;

        self.stop_plugins().await;
        self.db_factory.close_all().await;
        Ok(())
    }
}

fn listener_handler(
    listener: Arc<CompiledListener>,
) -> impl Fn(RawPathParams, Request) -> futures::future::BoxFuture<'static, Response>
+ Clone
+ Send
+ 'static {
    move |params: RawPathParams, request: Request| {
        let listener = listener.clone();
        Box::pin(async move { serve_listener(listener, params, request).await })
    }
}

async fn serve_listener(
    listener: Arc<CompiledListener>,
    params: RawPathParams,
    request: Request,
) -> Response {
    let params = path_params(&params);
    let args = match authenticate_and_extract(listener.auth(), &params, request).await {
        Ok(args) => args,
        Err(rejection) => return rejection,
    };

    let outcome = listener.handle_request(args).await;
    match outcome.http {
        Some(response) => response,
        None => (outcome.status, Json(outcome.response)).into_response(),
    }
}

pub fn path_params(params: &RawPathParams) -> HashMap<String, String> {
    params
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Shared request entry: reads the body once, runs the auth chain against
/// it, then extracts the argument map. Errors come back as ready-made
/// HTTP rejections (401 for auth, 400 for arguments).
pub async fn authenticate_and_extract(
    auth: &CompiledAuth,
    params: &HashMap<String, String>,
    request: Request,
) -> std::result::Result<ArgMap, Response> {
    let (parts, body) = request.into_parts();

    let query: Vec<(String, String)> = parts
        .uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let body = axum::body::to_bytes(body, usize::MAX).await.map_err(|e| {
        error_response(
            http::StatusCode::BAD_REQUEST,
            format!("failed to read request body: {e}"),
        )
    })?;

    let auth_request = AuthRequest {
        headers: &parts.headers,
        query: &query,
        body: &body,
    };
    if let Err(e) = auth.verify(&auth_request) {
        return Err(error_response(
            http::StatusCode::UNAUTHORIZED,
            e.to_string(),
        ));
    }

    extract_args(params, &parts.headers, &query, &body)
        .await
        .map_err(|e| error_response(http::StatusCode::BAD_REQUEST, e.to_string()))
}

pub fn error_response(status: http::StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
