use async_trait::async_trait;
use axum::Json;
use axum::extract::{RawPathParams, Request};
use axum::response::{IntoResponse, Response};
use axum::routing::on;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{
    AuthSnafu, DatabaseSnafu, InitSnafu, LifecycleHook, MountRoutesHook, Plugin,
    PluginBuildContext, Result, plugin_id,
};
use crate::auth::{AuthConfig, CompiledAuth};
use crate::db::Db;
use crate::listener::CompiledListener;
use crate::server::{
    RouteRegistrar, authenticate_and_extract, error_response, method_filter, path_params,
};

/// Route parameter and payload key carrying the scheduled execution time.
pub const KEY_SCHEDULE_TIME: &str = "__gteScheduleTime";

const DEFAULT_ROUTE: &str = "/schedule";

/// Poll quickly while rows keep coming in, rest otherwise.
const SCAN_INTERVAL_MIN: Duration = Duration::from_millis(100);
const SCAN_INTERVAL_REST_DEFAULT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleConfig {
    /// List of allowed authentication methods, defaults to the listener
    /// ones. An explicitly empty list disables auth for the schedule
    /// route.
    pub auth: Option<Vec<AuthConfig>>,

    /// Route to append, defaults to `/schedule`
    pub route: Option<String>,

    /// How frequently the loop checks for tasks to execute when idle.
    /// Defaults to 10s.
    #[serde(default, with = "humantime_serde")]
    pub scan_interval: Option<Duration>,
}

/// Durable deferred execution: requests insert rows, a per-listener loop
/// claims due rows under a row lock and dispatches them through the
/// listener.
#[derive(Debug)]
pub struct SchedulePlugin {
    id: String,
    config: ScheduleConfig,
    auth: CompiledAuth,
    db: Arc<Db>,
    running: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SchedulePlugin {
    pub fn new(config: ScheduleConfig, context: &PluginBuildContext<'_>) -> Result<Self> {
        let db = context
            .db
            .cloned()
            .with_context(|| InitSnafu {
                message: format!(
                    "schedule plugin on {} requires a database connection",
                    context.route
                ),
            })?;

        let id = plugin_id("schedule");
        let auth_configs = config.auth.as_deref().unwrap_or(context.listener_auth);
        let auth = CompiledAuth::compile(&id, auth_configs).context(AuthSnafu)?;

        Ok(Self {
            id,
            config,
            auth,
            db,
            running: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        })
    }
}

impl Plugin for SchedulePlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn migrations(&self) -> Option<(&'static str, &'static str)> {
        Some(("schedule", include_str!("sql/schedule.sql")))
    }

    fn mount_routes(&self) -> Option<&dyn MountRoutesHook> {
        Some(self)
    }

    fn lifecycle(&self) -> Option<&dyn LifecycleHook> {
        Some(self)
    }
}

impl MountRoutesHook for SchedulePlugin {
    fn hook_mount_routes(&self, routes: &mut RouteRegistrar, listener: &Arc<CompiledListener>) {
        let Some(filter) = method_filter(listener.method()) else {
            return;
        };

        let route = self.config.route.as_deref().unwrap_or(DEFAULT_ROUTE);
        let path = format!("{}{}/:{}", listener.route(), route, KEY_SCHEDULE_TIME);

        let handler = {
            let db = self.db.clone();
            let auth = self.auth.clone();
            let listener = listener.clone();
            move |params: RawPathParams, request: Request| {
                let db = db.clone();
                let auth = auth.clone();
                let listener = listener.clone();
                Box::pin(async move {
                    schedule_handler(db, auth, listener, params, request).await
                }) as futures::future::BoxFuture<'static, Response>
            }
        };

        routes.route(listener.method(), &path, on(filter, handler));
    }
}

#[async_trait]
impl LifecycleHook for SchedulePlugin {
    async fn on_start(&self, listener: &Arc<CompiledListener>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let db = self.db.clone();
        let listener = listener.clone();
        let rest_interval = self
            .config
            .scan_interval
            .unwrap_or(SCAN_INTERVAL_REST_DEFAULT);

        let handle = tokio::spawn(async move {
            run_loop(running, db, listener, rest_interval).await;
        });
        *self.task.lock().expect("schedule task lock poisoned") = Some(handle);

        Ok(())
    }

    async fn on_stop(&self) {
        // The loop observes the flag on its next iteration
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn schedule_handler(
    db: Arc<Db>,
    auth: CompiledAuth,
    listener: Arc<CompiledListener>,
    params: RawPathParams,
    request: Request,
) -> Response {
    let params = path_params(&params);

    let Some(time_param) = params.get(KEY_SCHEDULE_TIME) else {
        return error_response(
            http::StatusCode::BAD_REQUEST,
            "missing schedule time".to_string(),
        );
    };
    let execute_at = match parse_schedule_time(time_param, Utc::now()) {
        Ok(time) => time,
        Err(message) => {
            return error_response(
                http::StatusCode::BAD_REQUEST,
                format!("failed to parse schedule time: {message}"),
            );
        }
    };

    let mut args = match authenticate_and_extract(&auth, &params, request).await {
        Ok(args) => args,
        Err(rejection) => return rejection,
    };
    // The raw route param does not belong in the stored args; the parsed
    // time is added back at dispatch.
    args.remove(KEY_SCHEDULE_TIME);

    let inserted: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
        "INSERT INTO scheduled_tasks (execute_at, listener_id, args) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(execute_at)
    .bind(listener.id())
    .bind(serde_json::Value::Object(args))
    .fetch_one(db.pool())
    .await;

    match inserted {
        Ok(task_id) => {
            tracing::info!(listener = listener.id(), task_id, execute_at = %execute_at, "scheduled task");
            (
                http::StatusCode::OK,
                Json(serde_json::json!({ "taskId": task_id })),
            )
                .into_response()
        }
        Err(e) => error_response(
            http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to insert scheduled task: {e}"),
        ),
    }
}

/// Accepts a duration offset (`3s`, `2h`), a unix timestamp in seconds
/// (up to 11 digits) or milliseconds (12 digits and more), or an RFC3339
/// datetime.
pub fn parse_schedule_time(
    value: &str,
    now: DateTime<Utc>,
) -> std::result::Result<DateTime<Utc>, String> {
    let value = value.trim();

    if let Ok(offset) = humantime::parse_duration(value) {
        let offset =
            chrono::Duration::from_std(offset).map_err(|e| format!("offset too large: {e}"))?;
        return Ok(now + offset);
    }

    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        let parsed: i64 = value
            .parse()
            .map_err(|e| format!("invalid unix timestamp {value}: {e}"))?;
        let time = if value.len() >= 12 {
            DateTime::from_timestamp_millis(parsed)
        } else {
            DateTime::from_timestamp(parsed, 0)
        };
        return time.ok_or_else(|| format!("unix timestamp {value} out of range"));
    }

    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|_| format!("invalid time value: {value}"))
}

async fn run_loop(
    running: Arc<AtomicBool>,
    db: Arc<Db>,
    listener: Arc<CompiledListener>,
    rest_interval: Duration,
) {
    tracing::info!(listener = listener.id(), "schedule loop started");

    while running.load(Ordering::SeqCst) {
        let iteration_started = Instant::now();

        let row_found = match loop_iteration(&db, &listener).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(listener = listener.id(), error = %e, "schedule iteration failed");
                false
            }
        };

        let elapsed = iteration_started.elapsed();
        let interval = if row_found {
            SCAN_INTERVAL_MIN
        } else {
            rest_interval
        };
        tokio::time::sleep(interval.saturating_sub(elapsed)).await;
    }

    tracing::info!(listener = listener.id(), "schedule loop stopped");
}

/// Claims at most one due row under `FOR UPDATE SKIP LOCKED`, dispatches
/// it through the listener, and deletes the row before committing. The
/// row is deleted even when the dispatch fails: scheduled executions are
/// at-most-once per row.
async fn loop_iteration(db: &Db, listener: &Arc<CompiledListener>) -> Result<bool> {
    let mut tx = db.pool().begin().await.context(DatabaseSnafu)?;

    let row: Option<(i64, DateTime<Utc>, Option<serde_json::Value>)> = sqlx::query_as(
        "SELECT id, execute_at, args FROM scheduled_tasks \
         WHERE listener_id = $1 AND execute_at < now() \
         ORDER BY execute_at ASC LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(listener.id())
    .fetch_optional(&mut *tx)
    .await
    .context(DatabaseSnafu)?;

    let Some((task_id, execute_at, args)) = row else {
        tx.commit().await.context(DatabaseSnafu)?;
        return Ok(false);
    };

    let mut args = match args {
        Some(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    args.insert(
        KEY_SCHEDULE_TIME.to_string(),
        serde_json::json!(execute_at.to_rfc3339()),
    );

    // Scheduled executions have no live client; the shaped response is
    // discarded, output plugins may still observe it.
    let outcome = listener.handle_request(args).await;
    if let Some(error) = &outcome.response.error {
        tracing::warn!(listener = listener.id(), task_id, error = %error, "scheduled dispatch failed");
    }

    sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1")
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context(DatabaseSnafu)?;
    tx.commit().await.context(DatabaseSnafu)?;

    tracing::debug!(listener = listener.id(), task_id, "scheduled task dispatched");
    Ok(true)
}
