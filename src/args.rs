use axum::extract::{FromRequest, Multipart};
use indexmap::IndexMap;
use snafu::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not bind json body: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("Could not bind yaml body: {source}"))]
    Yaml { source: serde_yaml::Error },

    #[snafu(display("Could not bind yaml body: not a mapping or sequence"))]
    YamlShape,

    #[snafu(display("Failed to parse request form body: {message}"))]
    Form { message: String },

    #[snafu(display("Unsupported content type {content_type}"))]
    UnsupportedContentType { content_type: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The argument map a request is reduced to before template expansion.
pub type ArgMap = serde_json::Map<String, serde_json::Value>;

/// Nested mapping of lowercased header name -> value.
pub const KEY_HEADERS: &str = "__gteHeaders";

/// Set when the payload body was a top-level array.
pub const KEY_PAYLOAD_ARRAY_LENGTH: &str = "__gtePayloadArrayLength";

const QUERY_KEY_PREFIX: &str = "_query_";
const FORM_KEY_PREFIX: &str = "_form_";

/// Builds the argument map from the request. Later steps overwrite earlier
/// ones: route params, then headers, then the body, then the query.
pub async fn extract_args(
    route_params: &HashMap<String, String>,
    headers: &http::HeaderMap,
    query: &[(String, String)],
    body: &bytes::Bytes,
) -> Result<ArgMap> {
    let mut args = ArgMap::new();

    for (key, value) in route_params {
        args.insert(key.clone(), serde_json::Value::String(value.clone()));
    }

    let mut header_map = ArgMap::new();
    for name in headers.keys() {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            header_map.insert(
                name.as_str().to_lowercase(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }
    args.insert(
        KEY_HEADERS.to_string(),
        serde_json::Value::Object(header_map),
    );

    if !body.is_empty() {
        extract_body_args(&mut args, headers, body).await?;
    }

    let mut query_values: IndexMap<String, Vec<String>> = IndexMap::new();
    for (key, value) in query {
        query_values
            .entry(key.clone())
            .or_default()
            .push(value.clone());
    }
    for (key, values) in query_values {
        let scalar = match values.as_slice() {
            // A valueless key is a flag
            [single] if single.is_empty() => serde_json::Value::Bool(true),
            [.., last] => serde_json::Value::String(last.clone()),
            [] => serde_json::Value::Bool(true),
        };
        args.insert(format!("{QUERY_KEY_PREFIX}{key}"), string_seq(&values));
        args.insert(key, scalar);
    }

    Ok(args)
}

async fn extract_body_args(
    args: &mut ArgMap,
    headers: &http::HeaderMap,
    body: &bytes::Bytes,
) -> Result<()> {
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    match content_type.as_str() {
        "" | "application/json" | "text/json" | "text/plain" => {
            extract_payload_json(args, body)?;
        }
        "application/x-yaml" | "application/yaml" | "text/yaml" | "text/x-yaml" => {
            extract_payload_yaml(args, body)?;
        }
        "application/x-www-form-urlencoded" => {
            let pairs: Vec<(String, String)> =
                url::form_urlencoded::parse(body).into_owned().collect();
            let mut fields: IndexMap<String, Vec<String>> = IndexMap::new();
            for (key, value) in pairs {
                fields.entry(key).or_default().push(value);
            }
            insert_form_fields(args, fields);
        }
        "multipart/form-data" => {
            let fields = parse_multipart(headers, body).await?;
            insert_form_fields(args, fields);
        }
        other => {
            return UnsupportedContentTypeSnafu {
                content_type: other.to_string(),
            }
            .fail();
        }
    }

    Ok(())
}

/// Parses the payload as an object, falling back to an array exposed as
/// index-stringified entries plus the array length.
fn extract_payload_json(args: &mut ArgMap, body: &[u8]) -> Result<()> {
    match serde_json::from_slice::<ArgMap>(body) {
        Ok(map) => {
            args.extend(map);
            Ok(())
        }
        Err(object_error) => match serde_json::from_slice::<Vec<serde_json::Value>>(body) {
            Ok(array) => {
                insert_payload_array(args, array);
                Ok(())
            }
            Err(_) => Err(Error::Json {
                source: object_error,
            }),
        },
    }
}

fn extract_payload_yaml(args: &mut ArgMap, body: &[u8]) -> Result<()> {
    let value: serde_json::Value = serde_yaml::from_slice(body).context(YamlSnafu)?;
    match value {
        serde_json::Value::Object(map) => {
            args.extend(map);
            Ok(())
        }
        serde_json::Value::Array(array) => {
            insert_payload_array(args, array);
            Ok(())
        }
        _ => YamlShapeSnafu.fail(),
    }
}

fn insert_payload_array(args: &mut ArgMap, array: Vec<serde_json::Value>) {
    args.insert(
        KEY_PAYLOAD_ARRAY_LENGTH.to_string(),
        serde_json::Value::from(array.len()),
    );
    for (idx, element) in array.into_iter().enumerate() {
        args.insert(idx.to_string(), element);
    }
}

fn insert_form_fields(args: &mut ArgMap, fields: IndexMap<String, Vec<String>>) {
    for (key, values) in fields {
        let scalar = match values.as_slice() {
            [single] => serde_json::Value::String(single.clone()),
            _ => string_seq(&values),
        };
        args.insert(format!("{FORM_KEY_PREFIX}{key}"), string_seq(&values));
        args.insert(key, scalar);
    }
}

fn string_seq(values: &[String]) -> serde_json::Value {
    serde_json::Value::Array(
        values
            .iter()
            .map(|v| serde_json::Value::String(v.clone()))
            .collect(),
    )
}

async fn parse_multipart(
    headers: &http::HeaderMap,
    body: &bytes::Bytes,
) -> Result<IndexMap<String, Vec<String>>> {
    let mut builder = http::Request::builder().method(http::Method::POST).uri("/");
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(axum::body::Body::from(body.clone()))
        .map_err(|e| Error::Form {
            message: e.to_string(),
        })?;

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| Error::Form {
            message: e.to_string(),
        })?;

    let mut fields: IndexMap<String, Vec<String>> = IndexMap::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return FormSnafu {
                    message: e.to_string(),
                }
                .fail();
            }
        };
        let Some(name) = field.name().map(ToString::to_string) else {
            continue;
        };
        let text = field.text().await.map_err(|e| Error::Form {
            message: e.to_string(),
        })?;
        fields.entry(name).or_default().push(text);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn extract(
        headers: http::HeaderMap,
        query: &[(String, String)],
        body: &[u8],
    ) -> Result<ArgMap> {
        extract_args(
            &HashMap::new(),
            &headers,
            query,
            &bytes::Bytes::copy_from_slice(body),
        )
        .await
    }

    fn content_type(value: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_route_params_and_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert("X-Foo", "bar".parse().unwrap());

        let params = HashMap::from([("name".to_string(), "world".to_string())]);
        let args = extract_args(&params, &headers, &[], &bytes::Bytes::new())
            .await
            .unwrap();

        assert_eq!(args.get("name"), Some(&json!("world")));
        assert_eq!(
            args.get(KEY_HEADERS).and_then(|h| h.get("x-foo")),
            Some(&json!("bar"))
        );
    }

    #[tokio::test]
    async fn test_json_object_body() {
        let args = extract(content_type("application/json"), &[], br#"{"a":1}"#)
            .await
            .unwrap();
        assert_eq!(args.get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_json_array_body() {
        let args = extract(content_type("application/json"), &[], br#"["x","y"]"#)
            .await
            .unwrap();
        assert_eq!(args.get("0"), Some(&json!("x")));
        assert_eq!(args.get("1"), Some(&json!("y")));
        assert_eq!(args.get(KEY_PAYLOAD_ARRAY_LENGTH), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_yaml_body() {
        let args = extract(content_type("application/x-yaml"), &[], b"a: 1\nb: two\n")
            .await
            .unwrap();
        assert_eq!(args.get("a"), Some(&json!(1)));
        assert_eq!(args.get("b"), Some(&json!("two")));
    }

    #[tokio::test]
    async fn test_form_urlencoded_body() {
        let args = extract(
            content_type("application/x-www-form-urlencoded"),
            &[],
            b"a=1&b=2&b=3",
        )
        .await
        .unwrap();
        assert_eq!(args.get("a"), Some(&json!("1")));
        assert_eq!(args.get("b"), Some(&json!(["2", "3"])));
        assert_eq!(args.get("_form_a"), Some(&json!(["1"])));
        assert_eq!(args.get("_form_b"), Some(&json!(["2", "3"])));
    }

    #[tokio::test]
    async fn test_unknown_content_type_rejected() {
        let result = extract(content_type("application/octet-stream"), &[], b"data").await;
        assert!(matches!(
            result,
            Err(Error::UnsupportedContentType { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_extraction() {
        let query = vec![
            ("name".to_string(), "world".to_string()),
            ("multi".to_string(), "a".to_string()),
            ("multi".to_string(), "b".to_string()),
            ("flag".to_string(), String::new()),
        ];
        let args = extract(http::HeaderMap::new(), &query, b"").await.unwrap();

        assert_eq!(args.get("name"), Some(&json!("world")));
        // Multi-value keys keep the last value as the scalar
        assert_eq!(args.get("multi"), Some(&json!("b")));
        assert_eq!(args.get("_query_multi"), Some(&json!(["a", "b"])));
        assert_eq!(args.get("flag"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_query_overwrites_body() {
        let args = extract(
            content_type("application/json"),
            &[("a".to_string(), "query".to_string())],
            br#"{"a":"body"}"#,
        )
        .await
        .unwrap();
        assert_eq!(args.get("a"), Some(&json!("query")));
    }
}
