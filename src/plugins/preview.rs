use axum::Json;
use axum::extract::{RawPathParams, Request};
use axum::response::{IntoResponse, Response};
use axum::routing::on;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;

use super::{AuthSnafu, MountRoutesHook, Plugin, PluginBuildContext, Result, plugin_id};
use crate::auth::{AuthConfig, CompiledAuth};
use crate::listener::{CompiledListener, PreviewOutcome};
use crate::server::{
    RouteRegistrar, authenticate_and_extract, error_response, method_filter, path_params,
};

const DEFAULT_ROUTE: &str = "/preview";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewConfig {
    /// List of allowed authentication methods, defaults to the listener
    /// ones
    pub auth: Option<Vec<AuthConfig>>,

    /// Route to append, defaults to `/preview`
    pub route: Option<String>,

    /// If true, the response will be formatted as YAML
    pub as_yaml: bool,
}

/// Behaves like a normal request up to and including template expansion,
/// but never spawns the process: returns the prepared command, argv and
/// env instead.
#[derive(Debug)]
pub struct PreviewPlugin {
    id: String,
    config: PreviewConfig,
    auth: CompiledAuth,
}

impl PreviewPlugin {
    pub fn new(config: PreviewConfig, context: &PluginBuildContext<'_>) -> Result<Self> {
        let id = plugin_id("preview");
        let auth_configs = config.auth.as_deref().unwrap_or(context.listener_auth);
        let auth = CompiledAuth::compile(&id, auth_configs).context(AuthSnafu)?;

        Ok(Self { id, config, auth })
    }
}

impl Plugin for PreviewPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn mount_routes(&self) -> Option<&dyn MountRoutesHook> {
        Some(self)
    }
}

impl MountRoutesHook for PreviewPlugin {
    fn hook_mount_routes(&self, routes: &mut RouteRegistrar, listener: &Arc<CompiledListener>) {
        let Some(filter) = method_filter(listener.method()) else {
            return;
        };

        let route = self.config.route.as_deref().unwrap_or(DEFAULT_ROUTE);
        let path = format!("{}{}", listener.route(), route);
        let as_yaml = self.config.as_yaml;

        let handler = {
            let auth = self.auth.clone();
            let listener = listener.clone();
            move |params: RawPathParams, request: Request| {
                let auth = auth.clone();
                let listener = listener.clone();
                Box::pin(async move {
                    preview_handler(auth, listener, as_yaml, params, request).await
                }) as futures::future::BoxFuture<'static, Response>
            }
        };

        routes.route(listener.method(), &path, on(filter, handler));
    }
}

async fn preview_handler(
    auth: CompiledAuth,
    listener: Arc<CompiledListener>,
    as_yaml: bool,
    params: RawPathParams,
    request: Request,
) -> Response {
    let params = path_params(&params);
    let args = match authenticate_and_extract(&auth, &params, request).await {
        Ok(args) => args,
        Err(rejection) => return rejection,
    };

    let outcome = match listener.preview(args).await {
        Ok(outcome) => outcome,
        Err(message) => {
            return error_response(
                http::StatusCode::BAD_REQUEST,
                format!("failed to prepare command execution: {message}"),
            );
        }
    };

    match outcome {
        PreviewOutcome::Prepared(prepared) => serialize_preview(&prepared, as_yaml),
        PreviewOutcome::NotTriggered(response) => serialize_preview(&response, as_yaml),
    }
}

fn serialize_preview<T: serde::Serialize>(value: &T, as_yaml: bool) -> Response {
    if as_yaml {
        match serde_yaml::to_string(value) {
            Ok(yaml) => (http::StatusCode::OK, yaml).into_response(),
            Err(e) => error_response(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to serialize preview: {e}"),
            ),
        }
    } else {
        (http::StatusCode::OK, Json(value)).into_response()
    }
}
