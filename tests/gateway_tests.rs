#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use axum::body::Body;
use http_body_util::BodyExt;
use indexmap::IndexMap;
use magpie::config::{ListenerConfig, MagpieConfig, ResponseField, StorageConfig};
use magpie::server::Gateway;
use serde_json::{Value, json};
use tower::ServiceExt;

/// Helper to build a gateway around a single listener.
async fn gateway_with_listener(route: &str, listener: ListenerConfig) -> Gateway {
    let mut config = MagpieConfig::default();
    config.listeners.insert(route.to_string(), listener);
    Gateway::new(config).await.unwrap()
}

/// Helper to drive one request through the router and decode the JSON
/// response body.
async fn call(
    gateway: &Gateway,
    method: &str,
    uri: &str,
    content_type: Option<&str>,
    body: &str,
) -> (http::StatusCode, Value) {
    let mut builder = http::Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header(http::header::CONTENT_TYPE, content_type);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();

    let response = gateway.router().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, value)
}

fn echo_listener() -> ListenerConfig {
    ListenerConfig {
        command: Some("echo".to_string()),
        args: Some(vec!["{{ name }}".to_string()]),
        return_fields: Some(vec![ResponseField::Output]),
        ..Default::default()
    }
}

// ====================================================================================
// BASIC EXECUTION
// ====================================================================================

#[tokio::test]
async fn test_basic_get() {
    let gateway = gateway_with_listener("/hello", echo_listener()).await;

    let (status, body) = call(&gateway, "GET", "/hello?name=world", None, "").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["output"], json!("world\n"));
}

#[tokio::test]
async fn test_json_body_post() {
    let gateway = gateway_with_listener("/hello", echo_listener()).await;

    let (status, body) = call(
        &gateway,
        "POST",
        "/hello",
        Some("application/json"),
        r#"{"name":"from-body"}"#,
    )
    .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["output"], json!("from-body\n"));
}

#[tokio::test]
async fn test_header_extraction() {
    let listener = ListenerConfig {
        command: Some("echo".to_string()),
        args: Some(vec![r#"{{ __gteHeaders["x-foo"] }}"#.to_string()]),
        return_fields: Some(vec![ResponseField::Output]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/r", listener).await;

    let request = http::Request::builder()
        .method("POST")
        .uri("/r")
        .header("X-Foo", "bar")
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["output"], json!("bar\n"));
}

#[tokio::test]
async fn test_route_params() {
    let listener = ListenerConfig {
        command: Some("echo".to_string()),
        args: Some(vec!["{{ who }}".to_string()]),
        return_fields: Some(vec![ResponseField::Output]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/greet/:who", listener).await;

    let (status, body) = call(&gateway, "GET", "/greet/magpie", None, "").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["output"], json!("magpie\n"));
}

#[tokio::test]
async fn test_unknown_content_type_is_rejected() {
    let gateway = gateway_with_listener("/hello", echo_listener()).await;

    let (status, _) = call(
        &gateway,
        "POST",
        "/hello",
        Some("application/octet-stream"),
        "raw-bytes",
    )
    .await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_healthz() {
    let gateway = gateway_with_listener("/hello", echo_listener()).await;
    let (status, _) = call(&gateway, "GET", "/healthz", None, "").await;
    assert_eq!(status, http::StatusCode::OK);
}

// ====================================================================================
// RETURN SHAPING
// ====================================================================================

#[tokio::test]
async fn test_return_set_filters_response() {
    let listener = ListenerConfig {
        command: Some("echo".to_string()),
        args: Some(vec!["secret".to_string()]),
        return_fields: Some(vec![ResponseField::Command, ResponseField::Args]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/filtered", listener).await;

    let (status, body) = call(&gateway, "GET", "/filtered", None, "").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["command"], json!("echo"));
    assert_eq!(body["args"], json!(["secret"]));
    // The real output is suppressed and replaced by the success marker
    assert_eq!(body["output"], json!("success"));
}

#[tokio::test]
async fn test_return_all_wildcard() {
    let listener = ListenerConfig {
        command: Some("echo".to_string()),
        args: Some(vec!["everything".to_string()]),
        return_fields: Some(vec![ResponseField::All]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/all", listener).await;

    let (_, body) = call(&gateway, "GET", "/all", None, "").await;
    assert_eq!(body["command"], json!("echo"));
    assert_eq!(body["args"], json!(["everything"]));
    assert_eq!(body["output"], json!("everything\n"));
}

// ====================================================================================
// TRIGGER
// ====================================================================================

#[tokio::test]
async fn test_trigger_false_suppresses_execution() {
    let dir = tempfile::tempdir().unwrap();
    let sentinel = dir.path().join("sentinel");

    let listener = ListenerConfig {
        command: Some("touch".to_string()),
        args: Some(vec![sentinel.display().to_string()]),
        trigger: Some("eq(go, true)".to_string()),
        return_fields: Some(vec![ResponseField::Output]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/maybe", listener).await;

    let (status, body) = call(
        &gateway,
        "POST",
        "/maybe",
        Some("application/json"),
        r#"{"go":false}"#,
    )
    .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["output"], json!("not triggered"));
    assert!(!sentinel.exists(), "command must not have been spawned");

    let (status, body) = call(
        &gateway,
        "POST",
        "/maybe",
        Some("application/json"),
        r#"{"go":true}"#,
    )
    .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_ne!(body["output"], json!("not triggered"));
    assert!(sentinel.exists());
}

// ====================================================================================
// AUTH
// ====================================================================================

#[tokio::test]
async fn test_query_auth() {
    let listener = ListenerConfig {
        auth: Some(vec![serde_json::from_value(json!({
            "apiKeys": ["topsecret"],
            "queryAuth": true,
        }))
        .unwrap()]),
        ..echo_listener()
    };
    let gateway = gateway_with_listener("/secure", listener).await;

    let (status, _) = call(&gateway, "GET", "/secure?name=x", None, "").await;
    assert_eq!(status, http::StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &gateway,
        "GET",
        "/secure?name=x&__gteApiKey=topsecret",
        None,
        "",
    )
    .await;
    assert_eq!(status, http::StatusCode::OK);
}

// ====================================================================================
// ERROR HANDLER
// ====================================================================================

#[tokio::test]
async fn test_error_handler_fires_on_failure() {
    let listener = ListenerConfig {
        command: Some("false".to_string()),
        return_fields: Some(vec![ResponseField::Output]),
        error_handler: Some(Box::new(ListenerConfig {
            command: Some("echo".to_string()),
            args: Some(vec!["onerr:{{ error }}".to_string()]),
            return_fields: Some(vec![ResponseField::Output]),
            ..Default::default()
        })),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/broken", listener).await;

    let (status, body) = call(&gateway, "GET", "/broken", None, "").await;
    assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().is_some());

    let handler_output = body["errorHandlerResult"]["output"].as_str().unwrap();
    assert!(
        handler_output.starts_with("onerr:") && handler_output.contains("failed to execute"),
        "got {handler_output}"
    );
}

// ====================================================================================
// RETRY
// ====================================================================================

#[tokio::test]
async fn test_retry_runs_bounded_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempts");

    let listener = ListenerConfig {
        command: Some("sh".to_string()),
        args: Some(vec![
            "-c".to_string(),
            format!("echo run >> {}; printf fail; exit 1", marker.display()),
        ]),
        return_fields: Some(vec![ResponseField::Output]),
        plugins: Some(vec![serde_json::from_value(json!({
            "retry": {
                "condition": r#"eq(__gteRetry.previousResult.output, "fail")"#,
                "delay": "1ms",
                "maxRetries": 2,
            }
        }))
        .unwrap()]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/flaky", listener).await;

    let (status, body) = call(&gateway, "GET", "/flaky", None, "").await;
    assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .contains("max amount of retries reached"),
        "got {body}"
    );

    // Initial attempt + 2 retries
    let attempts = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(attempts.lines().count(), 3);
}

#[tokio::test]
async fn test_retry_stops_when_condition_clears() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempts");

    // Fails with "fail" on the first run, succeeds afterwards
    let script = format!(
        "if [ -f {marker} ]; then printf recovered; else touch {marker}; printf fail; exit 1; fi",
        marker = marker.display()
    );
    let listener = ListenerConfig {
        command: Some("sh".to_string()),
        args: Some(vec!["-c".to_string(), script]),
        return_fields: Some(vec![ResponseField::Output]),
        plugins: Some(vec![serde_json::from_value(json!({
            "retry": {
                "condition": r#"eq(__gteRetry.previousResult.output, "fail")"#,
                "delay": "1ms",
                "maxRetries": 5,
            }
        }))
        .unwrap()]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/recovers", listener).await;

    let (status, body) = call(&gateway, "GET", "/recovers", None, "").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["output"], json!("recovered"));
}

// ====================================================================================
// TEMPORARY FILES
// ====================================================================================

#[tokio::test]
async fn test_temporary_files_cleaned_after_response() {
    let listener = ListenerConfig {
        command: Some("sh".to_string()),
        args: Some(vec![
            "-c".to_string(),
            r#"printf %s "$GTE_FILES_payload_txt""#.to_string(),
        ]),
        files: Some(IndexMap::from([(
            "payload.txt".to_string(),
            "payload for {{ name }}".to_string(),
        )])),
        return_fields: Some(vec![ResponseField::Output]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/files", listener).await;

    let (status, body) = call(&gateway, "GET", "/files?name=x", None, "").await;
    assert_eq!(status, http::StatusCode::OK);

    let path = body["output"].as_str().unwrap().to_string();
    assert!(!path.is_empty());
    // The per-request directory is gone once the response is emitted
    let file = std::path::PathBuf::from(&path);
    assert!(!file.exists(), "temporary file {path} should be deleted");
    assert!(!file.parent().unwrap().exists());
}

// ====================================================================================
// STORAGE
// ====================================================================================

#[tokio::test]
async fn test_storage_writes_one_object_per_execution() {
    let store_dir = tempfile::tempdir().unwrap();

    let listener = ListenerConfig {
        command: Some("echo".to_string()),
        args: Some(vec!["{{ name }}".to_string()]),
        return_fields: Some(vec![ResponseField::All]),
        storage: Some(StorageConfig {
            store: Some(format!("fs://{}", store_dir.path().display())),
            fields: Some(vec![ResponseField::All]),
            as_yaml: None,
        }),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/stored", listener).await;

    let (status, body) = call(&gateway, "GET", "/stored?name=keepme", None, "").await;
    assert_eq!(status, http::StatusCode::OK);
    assert!(body["storage"]["path"].as_str().is_some());
    assert!(body["storage"]["size"].as_u64().unwrap() > 0);

    let entries: Vec<_> = std::fs::read_dir(store_dir.path())
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(entries.len(), 1);

    let name = entries[0].file_name().into_string().unwrap();
    assert!(name.starts_with("_stored-"), "got key {name}");
    assert!(name.ends_with(".json"));

    let payload: Value =
        serde_json::from_slice(&std::fs::read(entries[0].path()).unwrap()).unwrap();
    assert_eq!(payload["args"]["name"], json!("keepme"));
    assert_eq!(payload["output"], json!("keepme\n"));
}

// ====================================================================================
// PLUGINS
// ====================================================================================

#[tokio::test]
async fn test_preview_does_not_execute() {
    let dir = tempfile::tempdir().unwrap();
    let sentinel = dir.path().join("sentinel");

    let listener = ListenerConfig {
        command: Some("touch".to_string()),
        args: Some(vec![sentinel.display().to_string()]),
        plugins: Some(vec![serde_json::from_value(json!({ "preview": {} })).unwrap()]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/cmd", listener).await;

    let (status, body) = call(&gateway, "GET", "/cmd/preview", None, "").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["command"], json!("touch"));
    assert_eq!(body["args"], json!([sentinel.display().to_string()]));
    assert!(!sentinel.exists(), "preview must not spawn the command");
}

#[tokio::test]
async fn test_http_response_plugin_overrides_status_and_headers() {
    let listener = ListenerConfig {
        command: Some("echo".to_string()),
        args: Some(vec!["ok".to_string()]),
        return_fields: Some(vec![ResponseField::Output]),
        plugins: Some(vec![serde_json::from_value(json!({
            "httpResponse": {
                "statusCode": "202",
                "headers": {
                    "X-Magpie": "{{ __gteResult.output | trim }}",
                },
            }
        }))
        .unwrap()]),
        ..Default::default()
    };
    let gateway = gateway_with_listener("/shaped", listener).await;

    let request = http::Request::builder()
        .method("GET")
        .uri("/shaped")
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::ACCEPTED);
    assert_eq!(
        response
            .headers()
            .get("X-Magpie")
            .and_then(|v| v.to_str().ok()),
        Some("ok")
    );
}

#[tokio::test]
async fn test_cors_preflight_route() {
    let listener = ListenerConfig {
        plugins: Some(vec![serde_json::from_value(json!({
            "httpResponse": {
                "cors": { "allowedOrigins": ["*"] },
            }
        }))
        .unwrap()]),
        ..echo_listener()
    };
    let gateway = gateway_with_listener("/cors", listener).await;

    let request = http::Request::builder()
        .method("OPTIONS")
        .uri("/cors")
        .header("Origin", "https://example.com")
        .header("Access-Control-Request-Method", "POST")
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    assert!(
        response
            .headers()
            .get("access-control-allow-origin")
            .is_some()
    );
}

// ====================================================================================
// DEFAULTS MERGING
// ====================================================================================

#[tokio::test]
async fn test_defaults_apply_to_listeners() {
    let mut config = MagpieConfig::default();
    config.defaults = ListenerConfig {
        return_fields: Some(vec![ResponseField::Output]),
        ..Default::default()
    };
    config.listeners.insert(
        "/inherits".to_string(),
        ListenerConfig {
            command: Some("echo".to_string()),
            args: Some(vec!["inherited".to_string()]),
            ..Default::default()
        },
    );
    let gateway = Gateway::new(config).await.unwrap();

    let (status, body) = call(&gateway, "GET", "/inherits", None, "").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["output"], json!("inherited\n"));
}
