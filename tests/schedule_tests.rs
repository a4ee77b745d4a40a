#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use axum::body::Body;
use http_body_util::BodyExt;
use indexmap::IndexMap;
use magpie::config::{ListenerConfig, MagpieConfig, ResponseField};
use magpie::db::DatabaseConfig;
use magpie::server::Gateway;
use serde_json::{Value, json};
use std::time::Duration;
use testcontainers::{GenericImage, ImageExt, runners::AsyncRunner};
use tower::ServiceExt;

/// Helper to spin up a throwaway Postgres for the scheduler.
async fn setup_postgres_container() -> (testcontainers::ContainerAsync<GenericImage>, DatabaseConfig)
{
    use testcontainers::core::ContainerPort;

    let postgres_image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_env_var("POSTGRES_DB", "test_db")
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");

    let container = postgres_image
        .start()
        .await
        .expect("Failed to start postgres container");
    let port = container
        .get_host_port_ipv4(ContainerPort::Tcp(5432))
        .await
        .expect("Failed to get port");

    // Wait for PostgreSQL to be fully ready and accept connections
    tokio::time::sleep(Duration::from_secs(5)).await;

    let database = DatabaseConfig {
        host: Some("localhost".to_string()),
        port: Some(port),
        db_name: "test_db".to_string(),
        username: Some("postgres".to_string()),
        password: Some("postgres".to_string()),
        options: IndexMap::new(),
    };
    (container, database)
}

fn scheduled_listener(marker: &std::path::Path, database: DatabaseConfig) -> ListenerConfig {
    ListenerConfig {
        command: Some("sh".to_string()),
        args: Some(vec![
            "-c".to_string(),
            format!("echo \"$PAYLOAD\" >> {}", marker.display()),
        ]),
        env: Some(IndexMap::from([(
            "PAYLOAD".to_string(),
            "{{ x }}|{{ __gteScheduleTime }}".to_string(),
        )])),
        return_fields: Some(vec![ResponseField::Output]),
        database: Some(database),
        plugins: Some(vec![serde_json::from_value(json!({
            "schedule": { "scanInterval": "200ms" }
        }))
        .unwrap()]),
        ..Default::default()
    }
}

async fn schedule_task(gateway: &Gateway, uri: &str, body: Value) -> i64 {
    let request = http::Request::builder()
        .method("POST")
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: Value = serde_json::from_slice(&bytes).unwrap();
    parsed["taskId"].as_i64().expect("taskId in response")
}

async fn count_rows(database: &DatabaseConfig) -> i64 {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(database.connection_url().unwrap().as_str())
        .await
        .unwrap();
    sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_tasks")
        .fetch_one(&pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_schedule_inserts_and_dispatches() {
    let (_container, database) = setup_postgres_container().await;
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("dispatched");

    let mut config = MagpieConfig::default();
    config.listeners.insert(
        "/job".to_string(),
        scheduled_listener(&marker, database.clone()),
    );
    let gateway = Gateway::new(config).await.unwrap();
    gateway.start_plugins().await.unwrap();

    let task_id = schedule_task(&gateway, "/job/schedule/1s", json!({"x": 1})).await;
    assert!(task_id >= 1);
    assert_eq!(count_rows(&database).await, 1);

    // Within ~2s the loop claims the row and runs the command
    tokio::time::sleep(Duration::from_secs(3)).await;

    let dispatched = std::fs::read_to_string(&marker).expect("command should have run");
    let line = dispatched.lines().next().unwrap();
    let (x, schedule_time) = line.split_once('|').unwrap();
    assert_eq!(x, "1");
    assert!(
        schedule_time.starts_with("20"),
        "expected RFC3339 schedule time, got {schedule_time}"
    );

    // The row is deleted after dispatch
    assert_eq!(count_rows(&database).await, 0);

    gateway.stop_plugins().await;
}

#[tokio::test]
async fn test_each_task_dispatched_exactly_once() {
    let (_container, database) = setup_postgres_container().await;
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("dispatched");

    let mut config = MagpieConfig::default();
    config.listeners.insert(
        "/job".to_string(),
        scheduled_listener(&marker, database.clone()),
    );
    let gateway = Gateway::new(config).await.unwrap();
    gateway.start_plugins().await.unwrap();

    schedule_task(&gateway, "/job/schedule/1s", json!({"x": "a"})).await;
    schedule_task(&gateway, "/job/schedule/1s", json!({"x": "b"})).await;

    tokio::time::sleep(Duration::from_secs(4)).await;

    let dispatched = std::fs::read_to_string(&marker).expect("commands should have run");
    let mut xs: Vec<&str> = dispatched
        .lines()
        .map(|line| line.split_once('|').unwrap().0)
        .collect();
    xs.sort_unstable();
    assert_eq!(xs, vec!["a", "b"]);

    assert_eq!(count_rows(&database).await, 0);

    gateway.stop_plugins().await;
}

#[tokio::test]
async fn test_schedule_with_unix_timestamp_in_the_past_runs_immediately() {
    let (_container, database) = setup_postgres_container().await;
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("dispatched");

    let mut config = MagpieConfig::default();
    config.listeners.insert(
        "/job".to_string(),
        scheduled_listener(&marker, database.clone()),
    );
    let gateway = Gateway::new(config).await.unwrap();
    gateway.start_plugins().await.unwrap();

    // A timestamp in the past is due on the next loop iteration
    schedule_task(&gateway, "/job/schedule/1634724000", json!({"x": "past"})).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let dispatched = std::fs::read_to_string(&marker).expect("command should have run");
    assert!(dispatched.starts_with("past|"));

    gateway.stop_plugins().await;
}
