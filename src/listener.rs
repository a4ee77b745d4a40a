use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::Serialize;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::args::ArgMap;
use crate::auth::CompiledAuth;
use crate::config::{ListenerConfig, ResponseField};
use crate::db::{Db, DbFactory};
use crate::plugins::{self, OutputDisposition, Plugin, PluginBuildContext, RetryAttempt};
use crate::storage::{self, ObjectStore, StorageFactory, StorageWrite};
use crate::template::{FileMap, IfTemplate, Template};

/// Environment variable prefix under which materialized file paths are
/// exposed to the child process.
const FILES_ENV_PREFIX: &str = "GTE_FILES_";

/// Synthetic output reported when the trigger condition is false.
const NOT_TRIGGERED_OUTPUT: &str = "not triggered";

/// Output reported on success when the `return` set suppresses the real one.
const SUPPRESSED_OUTPUT: &str = "success";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Listener {route} has no command"))]
    MissingCommand { route: String },

    #[snafu(display("Failed to parse listener template: {source}"))]
    TemplateParse { source: crate::template::Error },

    #[snafu(display("Failed to compile auth config: {source}"))]
    Auth { source: crate::auth::Error },

    #[snafu(display("Database error: {source}"))]
    Database { source: crate::db::Error },

    #[snafu(display("Storage error: {source}"))]
    Storage { source: crate::storage::Error },

    #[snafu(display("Plugin error: {source}"))]
    Plugin { source: plugins::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The runtime image of one route+method binding: templates parsed once,
/// auth compiled, shared handles resolved, plugins instantiated.
#[derive(Debug)]
pub struct CompiledListener {
    id: String,
    route: String,
    method: String,
    config: ListenerConfig,
    tpl_command: Template,
    tpl_args: Vec<Template>,
    tpl_env: IndexMap<String, Template>,
    tpl_files: IndexMap<String, Template>,
    tpl_trigger: Option<IfTemplate>,
    auth: CompiledAuth,
    plugins: Vec<Arc<dyn Plugin>>,
    error_handler: Option<Arc<CompiledListener>>,
    db: Option<Arc<Db>>,
    store: Option<Arc<dyn ObjectStore>>,
}

/// Shared handle factories passed into compilation; handles are memoized
/// by connection string so listeners sharing a DSN share the handle.
pub struct ListenerFactories<'a> {
    pub db: &'a DbFactory,
    pub storage: &'a StorageFactory,
}

/// Per-request mutable state: the fresh temporary directory and the map of
/// materialized file paths. Each request (and each retry attempt) gets its
/// own, so sibling requests never observe each other's files.
#[derive(Debug, Default)]
pub struct Invocation {
    files: FileMap,
    temp_dir: Option<tempfile::TempDir>,
}

impl Invocation {
    pub fn files(&self) -> &FileMap {
        &self.files
    }

    fn temp_dir_path(&mut self) -> std::io::Result<&Path> {
        if self.temp_dir.is_none() {
            self.temp_dir = Some(
                tempfile::Builder::new()
                    .prefix("magpie-")
                    .tempdir()?,
            );
        }
        Ok(self
            .temp_dir
            .as_ref()
            .expect("temp dir was just created")
            .path())
    }
}

/// Everything the command execution produced. Fields are always populated
/// here; the `return` set filters them at response shaping time.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCommandResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerResponse {
    #[serde(flatten)]
    pub result: ExecCommandResult,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageWrite>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_handler_result: Option<Box<ListenerResponse>>,
}

/// The command/argv/env a request would run, as exposed by the preview
/// plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedExecution {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
}

pub enum PreviewOutcome {
    Prepared(PreparedExecution),
    NotTriggered(ListenerResponse),
}

/// Result of handling one request. `http` is set when an output hook took
/// ownership of the response.
pub struct HandleOutcome {
    pub status: http::StatusCode,
    pub response: ListenerResponse,
    pub http: Option<axum::response::Response>,
}

enum Prepared {
    Ready {
        command: String,
        argv: Vec<String>,
        env: Vec<(String, String)>,
    },
    NotTriggered,
}

struct Attempt {
    result: ExecCommandResult,
    error: Option<String>,
    args: ArgMap,
}

impl CompiledListener {
    /// Parses every template, compiles the auth chain, resolves shared
    /// handles, probes storage and instantiates plugins. Any failure here
    /// is fatal for startup.
    pub fn compile<'a>(
        id: String,
        route: String,
        method: String,
        config: ListenerConfig,
        defaults: &'a ListenerConfig,
        factories: &'a ListenerFactories<'a>,
    ) -> BoxFuture<'a, Result<Arc<CompiledListener>>> {
        Box::pin(async move {
            let command_source = config
                .command
                .clone()
                .filter(|c| !c.is_empty())
                .with_context(|| MissingCommandSnafu {
                    route: route.clone(),
                })?;

            let tpl_command =
                Template::parse(format!("{id}-command"), command_source).context(TemplateParseSnafu)?;

            let mut tpl_args = Vec::new();
            for (idx, source) in config.args.iter().flatten().enumerate() {
                tpl_args.push(
                    Template::parse(format!("{id}-args-{idx}"), source)
                        .context(TemplateParseSnafu)?,
                );
            }

            let mut tpl_env = IndexMap::new();
            for (name, source) in config.env.iter().flatten() {
                tpl_env.insert(
                    name.clone(),
                    Template::parse(format!("{id}-env-{name}"), source)
                        .context(TemplateParseSnafu)?,
                );
            }

            let mut tpl_files = IndexMap::new();
            for (path, source) in config.files.iter().flatten() {
                tpl_files.insert(
                    path.clone(),
                    Template::parse(format!("{id}-files-{path}"), source)
                        .context(TemplateParseSnafu)?,
                );
            }

            let tpl_trigger = match &config.trigger {
                Some(source) => Some(
                    IfTemplate::parse(format!("{id}-trigger"), source)
                        .context(TemplateParseSnafu)?,
                ),
                None => None,
            };

            let auth = CompiledAuth::compile(&id, config.auth.as_deref().unwrap_or(&[]))
                .context(AuthSnafu)?;

            let db = match &config.database {
                Some(database) => Some(factories.db.get(database).await.context(DatabaseSnafu)?),
                None => None,
            };

            let store = match config.storage.as_ref().and_then(|s| s.store.as_deref()) {
                Some(connection_string) => {
                    let store = factories
                        .storage
                        .get(connection_string)
                        .await
                        .context(StorageSnafu)?;
                    // The probe catches broken storage at startup instead
                    // of on the first request.
                    storage::probe(store.as_ref()).await.context(StorageSnafu)?;
                    Some(store)
                }
                None => None,
            };

            let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
            {
                let context = PluginBuildContext {
                    listener_id: &id,
                    route: &route,
                    listener_auth: config.auth.as_deref().unwrap_or(&[]),
                    db: db.as_ref(),
                };
                for entry in config.plugins.iter().flatten() {
                    plugins.extend(entry.build(&context).context(PluginSnafu)?);
                }
            }

            for plugin in &plugins {
                if let Some((name, sql)) = plugin.migrations() {
                    let Some(db) = db.as_ref() else {
                        return Err(Error::Plugin {
                            source: plugins::Error::Init {
                                message: format!(
                                    "plugin {} needs a database but listener {route} has none",
                                    plugin.id()
                                ),
                            },
                        });
                    };
                    db.apply_migrations(name, sql).await.context(DatabaseSnafu)?;
                }
            }

            // The error handler is itself a listener, with auth, trigger
            // and nested error handlers cleared so it can never recurse.
            let error_handler = match &config.error_handler {
                Some(handler_config) => {
                    let mut handler_config = handler_config.as_ref().merged_over(defaults);
                    handler_config.auth = None;
                    handler_config.trigger = None;
                    handler_config.error_handler = None;
                    Some(
                        CompiledListener::compile(
                            format!("{id}:error-handler"),
                            route.clone(),
                            method.clone(),
                            handler_config,
                            defaults,
                            factories,
                        )
                        .await?,
                    )
                }
                None => None,
            };

            Ok(Arc::new(CompiledListener {
                id,
                route,
                method,
                config,
                tpl_command,
                tpl_args,
                tpl_env,
                tpl_files,
                tpl_trigger,
                auth,
                plugins,
                error_handler,
                db,
                store,
            }))
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn auth(&self) -> &CompiledAuth {
        &self.auth
    }

    pub fn db(&self) -> Option<&Arc<Db>> {
        self.db.as_ref()
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Runs the full execution pipeline for one request: hooks, trigger,
    /// temporary files, template expansion, the child process, retries,
    /// the error handler, storage and output hooks.
    pub fn handle_request(self: &Arc<Self>, args: ArgMap) -> BoxFuture<'static, HandleOutcome> {
        let listener = self.clone();
        Box::pin(async move { listener.handle_request_inner(args).await })
    }

    async fn handle_request_inner(self: Arc<Self>, args: ArgMap) -> HandleOutcome {
        let started = Instant::now();
        let mut to_store = ArgMap::new();
        let mut retry_counts: HashMap<String, u32> = HashMap::new();
        let mut args = args;

        let attempt = loop {
            // Fresh per-attempt state: retries rematerialize files in a
            // new temporary directory.
            let mut invocation = Invocation::default();
            let mut attempt = self
                .exec_attempt(&mut invocation, args.clone(), &mut to_store)
                .await;

            for plugin in &self.plugins {
                let Some(hook) = plugin.post_execute() else {
                    continue;
                };
                if let Err(e) = hook.hook_post_execute(&self, &attempt.result) {
                    tracing::error!(listener = %self.id, plugin = plugin.id(), error = %e, "post-execute hook failed");
                    attempt.error.get_or_insert_with(|| e.to_string());
                    break;
                }
            }

            match self.evaluate_retry(started, &mut retry_counts, &attempt) {
                RetryOutcome::Retry { delay, args: next } => {
                    tracing::info!(
                        listener = %self.id,
                        delay = %humantime::format_duration(delay),
                        "retrying execution"
                    );
                    drop(invocation);
                    tokio::time::sleep(delay).await;
                    args = next;
                }
                RetryOutcome::Failed(message) => {
                    attempt.error = Some(message);
                    break attempt;
                }
                RetryOutcome::Done => break attempt,
            }
        };

        let mut response = self.shape_response(&attempt);

        // The error handler fires once, on primary failure only. Its own
        // errors surface in the response but never cascade further.
        if attempt.error.is_some()
            && let Some(error_handler) = &self.error_handler
        {
            let mut handler_args = ArgMap::new();
            handler_args.insert("route".to_string(), serde_json::json!(self.route));
            handler_args.insert("error".to_string(), serde_json::json!(attempt.error));
            handler_args.insert(
                "output".to_string(),
                serde_json::json!(attempt.result.output),
            );
            handler_args.insert(
                "args".to_string(),
                serde_json::Value::Object(attempt.args.clone()),
            );

            let handler_outcome = error_handler.handle_request(handler_args).await;
            response.error_handler_result = Some(Box::new(handler_outcome.response));
        }

        if let Some(store) = &self.store
            && !to_store.is_empty()
        {
            let storage_config = self.config.storage.as_ref();
            let as_yaml = storage_config.is_some_and(|s| s.is_yaml());
            let key = storage::storage_key(&self.route, attempt.error.is_some(), as_yaml);
            match storage::serialize_payload(&to_store, as_yaml) {
                Ok(payload) => match store.write(&key, &payload).await {
                    Ok(written) => {
                        tracing::debug!(listener = %self.id, path = %written.path, "stored execution payload");
                        if self.config.returns(ResponseField::Storage) {
                            response.storage = Some(written);
                        }
                    }
                    Err(e) => {
                        tracing::error!(listener = %self.id, error = %e, "failed to store execution payload");
                        response.error.get_or_insert_with(|| e.to_string());
                    }
                },
                Err(e) => {
                    tracing::error!(listener = %self.id, error = %e, "failed to serialize execution payload");
                    response.error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        let status = if response.error.is_some() {
            http::StatusCode::INTERNAL_SERVER_ERROR
        } else {
            http::StatusCode::OK
        };

        let mut handled = None;
        for plugin in &self.plugins {
            let Some(hook) = plugin.output() else {
                continue;
            };
            match hook.hook_output(&self, &attempt.args, &response) {
                Ok(OutputDisposition::Handled(http_response)) => {
                    handled = Some(http_response);
                    break;
                }
                Ok(OutputDisposition::Unhandled) => {}
                Err(e) => {
                    tracing::error!(listener = %self.id, plugin = plugin.id(), error = %e, "output hook failed");
                    response.error.get_or_insert_with(|| e.to_string());
                    break;
                }
            }
        }

        HandleOutcome {
            status,
            response,
            http: handled,
        }
    }

    /// One execution attempt: pre-execute hooks, trigger, files, template
    /// expansion, child process. Never panics the request; failures land
    /// in `Attempt::error`.
    async fn exec_attempt(
        &self,
        invocation: &mut Invocation,
        args: ArgMap,
        to_store: &mut ArgMap,
    ) -> Attempt {
        let mut args = args;

        for plugin in &self.plugins {
            let Some(hook) = plugin.pre_execute() else {
                continue;
            };
            match hook.hook_pre_execute(self, args.clone()) {
                Ok(rewritten) => args = rewritten,
                Err(e) => {
                    tracing::error!(listener = %self.id, plugin = plugin.id(), error = %e, "pre-execute hook failed");
                    return Attempt {
                        result: ExecCommandResult::default(),
                        error: Some(e.to_string()),
                        args,
                    };
                }
            }
        }

        if self.config.logs(ResponseField::Args) {
            tracing::info!(listener = %self.id, args = ?args, "handling request");
        }

        if let Some(storage_config) = &self.config.storage
            && storage_config.stores(ResponseField::Args)
        {
            to_store.insert(
                "args".to_string(),
                serde_json::Value::Object(args.clone()),
            );
        }

        let prepared = match self.prepare(invocation, &args, to_store) {
            Ok(prepared) => prepared,
            Err(message) => {
                return Attempt {
                    result: ExecCommandResult::default(),
                    error: Some(message),
                    args,
                };
            }
        };

        let (command, argv, env) = match prepared {
            Prepared::NotTriggered => {
                tracing::info!(listener = %self.id, "not triggered");
                return Attempt {
                    result: ExecCommandResult {
                        output: Some(NOT_TRIGGERED_OUTPUT.to_string()),
                        ..Default::default()
                    },
                    error: None,
                    args,
                };
            }
            Prepared::Ready { command, argv, env } => (command, argv, env),
        };

        if self.config.logs(ResponseField::Command) {
            tracing::info!(listener = %self.id, command = %command, command_args = ?argv, "executing command");
        }

        let env_display: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut result = ExecCommandResult {
            command: Some(command.clone()),
            args: Some(argv.clone()),
            env: Some(env_display),
            output: None,
        };

        let spawned = tokio::process::Command::new(&command)
            .args(&argv)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await;

        let error = match spawned {
            Ok(output) => {
                let mut combined =
                    String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                result.output = Some(combined);

                if self.config.logs(ResponseField::Output) {
                    tracing::info!(listener = %self.id, output = ?result.output, "command output");
                }

                if output.status.success() {
                    tracing::info!(listener = %self.id, "command executed");
                    None
                } else {
                    Some(format!("failed to execute command: {}", output.status))
                }
            }
            Err(e) => Some(format!("failed to spawn command {command}: {e}")),
        };

        if let Some(error) = &error {
            tracing::error!(listener = %self.id, error = %error, "command execution failed");
        }

        if let Some(storage_config) = &self.config.storage {
            if storage_config.stores(ResponseField::Output)
                && let Some(output) = &result.output
            {
                to_store.insert("output".to_string(), serde_json::json!(output));
            }
        }

        Attempt {
            result,
            error,
            args,
        }
    }

    /// Template expansion up to (but not including) the process spawn:
    /// file materialization, command, argv and env rendering.
    fn prepare(
        &self,
        invocation: &mut Invocation,
        args: &ArgMap,
        to_store: &mut ArgMap,
    ) -> std::result::Result<Prepared, String> {
        let args_value = serde_json::Value::Object(args.clone());

        if let Some(trigger) = &self.tpl_trigger {
            let triggered = trigger
                .is_true(&args_value, &invocation.files)
                .map_err(|e| format!("failed to evaluate trigger condition: {e}"))?;
            if !triggered {
                return Ok(Prepared::NotTriggered);
            }
        }

        self.materialize_files(invocation, &args_value)?;

        let command = self
            .tpl_command
            .execute(&args_value, &invocation.files)
            .map_err(|e| format!("failed to execute command template: {e}"))?;

        let mut argv = Vec::with_capacity(self.tpl_args.len());
        for template in &self.tpl_args {
            argv.push(
                template
                    .execute(&args_value, &invocation.files)
                    .map_err(|e| format!("failed to execute args template: {e}"))?,
            );
        }

        let mut env: Vec<(String, String)> = Vec::new();
        for (name, template) in &self.tpl_env {
            let value = template
                .execute(&args_value, &invocation.files)
                .map_err(|e| format!("failed to execute env template {name}: {e}"))?;
            // Env values are single-line by contract
            let value = value.replace(['\r', '\n'], "");
            env.push((name.clone(), value));
        }
        for (key, path) in &invocation.files {
            env.push((format!("{FILES_ENV_PREFIX}{key}"), path.clone()));
        }

        if let Some(storage_config) = &self.config.storage {
            if storage_config.stores(ResponseField::Command) {
                to_store.insert("command".to_string(), serde_json::json!(command));
                to_store.insert("commandArgs".to_string(), serde_json::json!(argv));
            }
            if storage_config.stores(ResponseField::Env) {
                let env_display: Vec<String> =
                    env.iter().map(|(k, v)| format!("{k}={v}")).collect();
                to_store.insert("env".to_string(), serde_json::json!(env_display));
            }
        }

        Ok(Prepared::Ready { command, argv, env })
    }

    /// Instantiates the `files` templates: absolute paths are written in
    /// place (and never cleaned up), relative paths go into the fresh
    /// per-request directory. Files materialize in declaration order, so
    /// later templates can reference earlier paths via `gte.files`.
    fn materialize_files(
        &self,
        invocation: &mut Invocation,
        args_value: &serde_json::Value,
    ) -> std::result::Result<(), String> {
        for (key, template) in &self.tpl_files {
            let file_path = if Path::new(key).is_absolute() {
                PathBuf::from(key)
            } else {
                let dir = invocation
                    .temp_dir_path()
                    .map_err(|e| format!("failed to create temporary files directory: {e}"))?;
                dir.join(key)
            };

            let content = template
                .execute(args_value, &invocation.files)
                .map_err(|e| format!("failed to execute file template {key}: {e}"))?;

            if let Some(parent) = file_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("failed to create directory for file {key}: {e}"))?;
            }
            std::fs::write(&file_path, content.as_bytes())
                .map_err(|e| format!("failed to write file {key}: {e}"))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&file_path, std::fs::Permissions::from_mode(0o777))
                    .map_err(|e| format!("failed to set permissions on file {key}: {e}"))?;
            }

            tracing::debug!(listener = %self.id, file = %file_path.display(), "written temporary file");
            invocation.files.insert(
                storage::sanitize_token(key),
                file_path.display().to_string(),
            );
        }

        Ok(())
    }

    fn evaluate_retry(
        &self,
        started: Instant,
        retry_counts: &mut HashMap<String, u32>,
        attempt: &Attempt,
    ) -> RetryOutcome {
        for plugin in &self.plugins {
            let Some(hook) = plugin.should_retry() else {
                continue;
            };
            let count = retry_counts.entry(plugin.id().to_string()).or_insert(0);
            let info = RetryAttempt {
                elapsed: started.elapsed(),
                retry_count: *count + 1,
            };
            match hook.hook_should_retry(self, &info, &attempt.args, &attempt.result) {
                Ok(Some(decision)) => {
                    *count += 1;
                    return RetryOutcome::Retry {
                        delay: decision.delay,
                        args: decision.args,
                    };
                }
                Ok(None) => {}
                Err(e) => return RetryOutcome::Failed(e.to_string()),
            }
        }
        RetryOutcome::Done
    }

    /// Applies the `return` set: each field appears only when selected,
    /// and a suppressed output on success reads `"success"`.
    fn shape_response(&self, attempt: &Attempt) -> ListenerResponse {
        let mut result = ExecCommandResult::default();

        if self.config.returns(ResponseField::Command) {
            result.command = attempt.result.command.clone();
        }
        if self.config.returns(ResponseField::Args) {
            result.args = attempt.result.args.clone();
        }
        if self.config.returns(ResponseField::Env) {
            result.env = attempt.result.env.clone();
        }
        if self.config.returns(ResponseField::Output) {
            result.output = attempt.result.output.clone();
        } else if attempt.error.is_none() {
            result.output = Some(SUPPRESSED_OUTPUT.to_string());
        }

        ListenerResponse {
            result,
            storage: None,
            error: attempt.error.clone(),
            error_handler_result: None,
        }
    }

    /// Prepares a request without spawning the process, for the preview
    /// plugin. Temporary files are materialized and removed again.
    pub async fn preview(
        self: &Arc<Self>,
        args: ArgMap,
    ) -> std::result::Result<PreviewOutcome, String> {
        let mut invocation = Invocation::default();
        let mut to_store = ArgMap::new();
        let mut args = args;

        for plugin in &self.plugins {
            let Some(hook) = plugin.pre_execute() else {
                continue;
            };
            args = hook.hook_pre_execute(self, args).map_err(|e| e.to_string())?;
        }

        match self.prepare(&mut invocation, &args, &mut to_store)? {
            Prepared::NotTriggered => Ok(PreviewOutcome::NotTriggered(ListenerResponse {
                result: ExecCommandResult {
                    output: Some(NOT_TRIGGERED_OUTPUT.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })),
            Prepared::Ready { command, argv, env } => {
                Ok(PreviewOutcome::Prepared(PreparedExecution {
                    command,
                    args: argv,
                    env: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
                }))
            }
        }
    }
}

enum RetryOutcome {
    Retry { delay: std::time::Duration, args: ArgMap },
    Failed(String),
    Done,
}
