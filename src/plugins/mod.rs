use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use crate::args::ArgMap;
use crate::auth::AuthConfig;
use crate::db::Db;
use crate::listener::{CompiledListener, ExecCommandResult, ListenerResponse};
use crate::server::RouteRegistrar;

pub mod aws_sns;
pub mod debug;
pub mod http_response;
pub mod preview;
pub mod retry;
pub mod schedule;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to initialize plugin: {message}"))]
    Init { message: String },

    #[snafu(display("{message}"))]
    Hook { message: String },

    #[snafu(display("Failed to execute plugin template: {source}"))]
    Template { source: crate::template::Error },

    #[snafu(display("Failed to compile plugin auth config: {source}"))]
    Auth { source: crate::auth::Error },

    #[snafu(display("Failed to parse duration {value}: {source}"))]
    Duration {
        value: String,
        source: humantime::DurationError,
    },

    #[snafu(display("Database error: {source}"))]
    Database { source: sqlx::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// State handed to a retry hook for one decision: how long the request has
/// been running and which retry this would be (starting from 1).
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub elapsed: Duration,
    pub retry_count: u32,
}

/// A positive retry decision: sleep `delay`, then re-run with `args`.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub delay: Duration,
    pub args: ArgMap,
}

/// Whether an output hook took ownership of the HTTP response.
pub enum OutputDisposition {
    Handled(axum::response::Response),
    Unhandled,
}

/// Called before listener execution; may rewrite the argument map.
/// An error aborts the request.
pub trait PreExecuteHook: Send + Sync {
    fn hook_pre_execute(&self, listener: &CompiledListener, args: ArgMap) -> Result<ArgMap>;
}

/// Called after every execution attempt with the full command result.
pub trait PostExecuteHook: Send + Sync {
    fn hook_post_execute(
        &self,
        listener: &CompiledListener,
        result: &ExecCommandResult,
    ) -> Result<()>;
}

/// Called after every attempt to decide whether to run again.
pub trait RetryHook: Send + Sync {
    fn hook_should_retry(
        &self,
        listener: &CompiledListener,
        attempt: &RetryAttempt,
        args: &ArgMap,
        last_result: &ExecCommandResult,
    ) -> Result<Option<RetryDecision>>;
}

/// Called with the shaped response; the first hook reporting `Handled`
/// takes ownership of the HTTP response.
pub trait OutputHook: Send + Sync {
    fn hook_output(
        &self,
        listener: &CompiledListener,
        args: &ArgMap,
        response: &ListenerResponse,
    ) -> Result<OutputDisposition>;
}

/// Called at mount time; plugins add their own routes next to the
/// listener's.
pub trait MountRoutesHook: Send + Sync {
    fn hook_mount_routes(&self, routes: &mut RouteRegistrar, listener: &Arc<CompiledListener>);
}

/// Layers a plugin wants applied to every route of the host listener.
pub enum RouteLayer {
    Cors(tower_http::cors::CorsLayer),
}

pub trait MiddlewareHook: Send + Sync {
    fn hook_middlewares(&self, listener: &CompiledListener) -> Vec<RouteLayer>;
}

/// Started after mounting, stopped on shutdown.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_start(&self, listener: &Arc<CompiledListener>) -> Result<()>;
    async fn on_stop(&self);
}

/// A plugin advertises the hooks it implements; the pipeline dispatches by
/// capability, in plugin declaration order.
pub trait Plugin: Send + Sync + std::fmt::Debug {
    /// Stable identifier, unique per plugin instance.
    fn id(&self) -> &str;

    /// Schema migrations to run at compile time, (name, sql).
    fn migrations(&self) -> Option<(&'static str, &'static str)> {
        None
    }

    fn pre_execute(&self) -> Option<&dyn PreExecuteHook> {
        None
    }

    fn post_execute(&self) -> Option<&dyn PostExecuteHook> {
        None
    }

    fn should_retry(&self) -> Option<&dyn RetryHook> {
        None
    }

    fn output(&self) -> Option<&dyn OutputHook> {
        None
    }

    fn mount_routes(&self) -> Option<&dyn MountRoutesHook> {
        None
    }

    fn middlewares(&self) -> Option<&dyn MiddlewareHook> {
        None
    }

    fn lifecycle(&self) -> Option<&dyn LifecycleHook> {
        None
    }
}

pub(crate) fn plugin_id(kind: &str) -> String {
    format!("{kind}-{}", uuid::Uuid::new_v4().simple())
}

/// One entry in a listener's plugin list. Within an entry, plugins are
/// instantiated in field declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PluginEntryConfig {
    /// AWS SNS plugin, to auto-confirm AWS SNS subscriptions and handle
    /// SNS notifications
    pub aws_sns: Option<aws_sns::AwsSnsConfig>,

    /// HTTP response plugin, to alter HTTP response headers, status code
    /// and CORS behavior
    pub http_response: Option<http_response::HttpResponseConfig>,

    /// Preview plugin, used to preview the command which would be executed
    pub preview: Option<preview::PreviewConfig>,

    /// Retry plugin, to re-run failed executions
    pub retry: Option<retry::RetryConfig>,

    /// Schedule plugin, to defer executions to a later point in time
    pub schedule: Option<schedule::ScheduleConfig>,

    /// Debug plugin, for testing
    pub debug: Option<debug::DebugConfig>,
}

/// What a plugin is allowed to see of its host listener at build time.
pub struct PluginBuildContext<'a> {
    pub listener_id: &'a str,
    pub route: &'a str,
    pub listener_auth: &'a [AuthConfig],
    pub db: Option<&'a Arc<Db>>,
}

impl PluginEntryConfig {
    pub fn build(&self, context: &PluginBuildContext<'_>) -> Result<Vec<Arc<dyn Plugin>>> {
        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();

        if let Some(config) = &self.aws_sns {
            plugins.push(Arc::new(aws_sns::AwsSnsPlugin::new(config.clone())));
        }
        if let Some(config) = &self.http_response {
            plugins.push(Arc::new(http_response::HttpResponsePlugin::new(
                config.clone(),
                context,
            )?));
        }
        if let Some(config) = &self.preview {
            plugins.push(Arc::new(preview::PreviewPlugin::new(
                config.clone(),
                context,
            )?));
        }
        if let Some(config) = &self.retry {
            plugins.push(Arc::new(retry::RetryPlugin::new(config.clone(), context)?));
        }
        if let Some(config) = &self.schedule {
            plugins.push(Arc::new(schedule::SchedulePlugin::new(
                config.clone(),
                context,
            )?));
        }
        if let Some(config) = &self.debug {
            plugins.push(Arc::new(debug::DebugPlugin::new(config.clone())));
        }

        Ok(plugins)
    }
}
