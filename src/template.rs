use indexmap::IndexMap;
use minijinja::value::{Value, ValueKind};
use minijinja::{Environment, ErrorKind};
use regex::Regex;
use snafu::prelude::*;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse template {name}: {source}"))]
    Parse {
        name: String,
        source: minijinja::Error,
    },

    #[snafu(display("Failed to execute template {name}: {source}"))]
    Execute {
        name: String,
        source: minijinja::Error,
    },

    #[snafu(display("Boolean template cannot contain a closing delimiter"))]
    ClosingDelimiter,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map of sanitized file key -> materialized path, exposed to templates
/// under `gte.files` for the duration of one request.
pub type FileMap = IndexMap<String, String>;

/// A compiled text template.
///
/// Parsing happens once at listener compile time; execution takes the
/// request argument map plus the per-request file map, so no part of the
/// compiled state is mutated between requests.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    source: String,
    env: Arc<Environment<'static>>,
}

impl Template {
    pub fn parse(name: impl Into<String>, source: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let source = source.into();

        let mut env = Environment::new();
        register_functions(&mut env);
        env.add_template_owned(name.clone(), source.clone())
            .with_context(|_| ParseSnafu { name: name.clone() })?;

        Ok(Self {
            name,
            source,
            env: Arc::new(env),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The original template text, as written in the configuration.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render against the request arguments. `files` is exposed to the
    /// template as `gte.files`.
    pub fn execute(&self, args: &serde_json::Value, files: &FileMap) -> Result<String> {
        let mut context = match args {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        context.insert(
            "gte".to_string(),
            serde_json::json!({ "files": files }),
        );

        let template = self
            .env
            .get_template(&self.name)
            .with_context(|_| ExecuteSnafu { name: self.name.clone() })?;

        template
            .render(Value::from_serialize(&serde_json::Value::Object(context)))
            .with_context(|_| ExecuteSnafu { name: self.name.clone() })
    }
}

/// A template evaluating to a boolean.
///
/// The expression is wrapped in an if/else block rendering `true` or
/// `false`, so the configuration only ever contains the condition itself.
#[derive(Debug, Clone)]
pub struct IfTemplate {
    expression: String,
    inner: Template,
}

impl IfTemplate {
    pub fn parse(name: impl Into<String>, expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into();

        // A closing delimiter would let the expression break out of the
        // wrapping block.
        if expression.contains("}}") || expression.contains("%}") {
            return ClosingDelimiterSnafu.fail();
        }

        let source = format!("{{% if {expression} %}}true{{% else %}}false{{% endif %}}");
        let inner = Template::parse(name, source)?;

        Ok(Self { expression, inner })
    }

    pub fn source(&self) -> &str {
        &self.expression
    }

    pub fn is_true(&self, args: &serde_json::Value, files: &FileMap) -> Result<bool> {
        Ok(self.inner.execute(args, files)? == "true")
    }
}

const BACKOFF_DEFAULT_MULTIPLIER: f64 = 1.5;

fn register_functions(env: &mut Environment<'static>) {
    env.add_function("yamlDecode", tpl_yaml_decode);
    env.add_function("yamlToJson", tpl_yaml_to_json);
    env.add_function("fileReadToString", tpl_file_read_to_string);
    env.add_function("dump", tpl_dump);
    env.add_function("cleanNewLines", tpl_clean_new_lines);
    env.add_function("duration", tpl_duration);
    env.add_function("backoff", tpl_backoff);

    env.add_function("eq", |a: Value, b: Value| values_equal(&a, &b));
    env.add_function("ne", |a: Value, b: Value| {
        values_equal(&a, &b).map(|eq| !eq)
    });
    env.add_function("lt", |a: Value, b: Value| {
        compare_values(&a, &b).map(|ord| ord == std::cmp::Ordering::Less)
    });
    env.add_function("le", |a: Value, b: Value| {
        compare_values(&a, &b).map(|ord| ord != std::cmp::Ordering::Greater)
    });
    env.add_function("gt", |a: Value, b: Value| {
        compare_values(&a, &b).map(|ord| ord == std::cmp::Ordering::Greater)
    });
    env.add_function("ge", |a: Value, b: Value| {
        compare_values(&a, &b).map(|ord| ord != std::cmp::Ordering::Less)
    });
}

fn invalid_op(message: impl Into<String>) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, message.into())
}

fn tpl_yaml_decode(value: String) -> std::result::Result<Value, minijinja::Error> {
    let decoded: serde_json::Value = serde_yaml::from_str(&value)
        .map_err(|e| invalid_op(format!("failed to decode yaml value: {e}")))?;
    Ok(Value::from_serialize(&decoded))
}

fn tpl_yaml_to_json(value: String) -> std::result::Result<String, minijinja::Error> {
    let decoded: serde_json::Value = serde_yaml::from_str(&value)
        .map_err(|e| invalid_op(format!("failed to decode yaml value: {e}")))?;
    serde_json::to_string(&decoded)
        .map_err(|e| invalid_op(format!("failed to encode json value: {e}")))
}

fn tpl_file_read_to_string(path: String) -> std::result::Result<String, minijinja::Error> {
    std::fs::read_to_string(&path)
        .map_err(|e| invalid_op(format!("failed to read file {path}: {e}")))
}

/// Pretty-prints maps, sequences and structs as YAML; scalars print plain.
fn tpl_dump(value: Value) -> std::result::Result<String, minijinja::Error> {
    match value.kind() {
        ValueKind::Map | ValueKind::Seq => {
            let json = serde_json::to_value(&value)
                .map_err(|e| invalid_op(format!("failed to serialize value: {e}")))?;
            serde_yaml::to_string(&json)
                .map_err(|e| invalid_op(format!("failed to dump value: {e}")))
        }
        ValueKind::Undefined | ValueKind::None => Ok("<no value>".to_string()),
        _ => Ok(value.to_string()),
    }
}

fn clean_new_lines_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(\n\s*){3,}").expect("invalid regex"))
}

fn tpl_clean_new_lines(text: String) -> String {
    clean_new_lines_regex().replace_all(&text, "\n\n").to_string()
}

fn tpl_duration(value: Value) -> std::result::Result<String, minijinja::Error> {
    let duration = value_to_duration(&value)?;
    Ok(humantime::format_duration(duration).to_string())
}

/// Computes the next retry delay: `initial * multiplier`, capped at `max`.
/// The multiplier defaults to 1.5. The result parses back as a duration.
fn tpl_backoff(
    initial: Value,
    multiplier: Option<f64>,
    max: Option<Value>,
) -> std::result::Result<String, minijinja::Error> {
    let initial = value_to_duration(&initial)?;
    let multiplier = multiplier.unwrap_or(BACKOFF_DEFAULT_MULTIPLIER);
    if multiplier < 0.0 {
        return Err(invalid_op("backoff multiplier cannot be negative"));
    }

    let mut next = initial.mul_f64(multiplier);
    if let Some(max) = max {
        let max = value_to_duration(&max)?;
        if next > max {
            next = max;
        }
    }

    Ok(humantime::format_duration(next).to_string())
}

fn value_to_duration(value: &Value) -> std::result::Result<Duration, minijinja::Error> {
    if let Some(text) = value.as_str() {
        return humantime::parse_duration(text.trim())
            .map_err(|e| invalid_op(format!("failed to parse duration {text}: {e}")));
    }

    let json = serde_json::to_value(value)
        .map_err(|e| invalid_op(format!("failed to serialize value: {e}")))?;
    match json.as_f64() {
        Some(seconds) if seconds >= 0.0 => Ok(Duration::from_secs_f64(seconds)),
        _ => Err(invalid_op(format!("invalid duration value: {json}"))),
    }
}

/// Equality that mixes integer/float numerics and deep-compares
/// sequences and maps.
fn values_equal(a: &Value, b: &Value) -> std::result::Result<bool, minijinja::Error> {
    let a = serde_json::to_value(a)
        .map_err(|e| invalid_op(format!("failed to serialize value: {e}")))?;
    let b = serde_json::to_value(b)
        .map_err(|e| invalid_op(format!("failed to serialize value: {e}")))?;
    Ok(json_equal(&a, &b))
}

fn json_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use serde_json::Value::*;
    match (a, b) {
        (Number(x), Number(y)) => x.as_f64() == y.as_f64(),
        (Array(x), Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_equal(a, b))
        }
        (Object(x), Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| json_equal(v, other)))
        }
        _ => a == b,
    }
}

fn compare_values(
    a: &Value,
    b: &Value,
) -> std::result::Result<std::cmp::Ordering, minijinja::Error> {
    let a = serde_json::to_value(a)
        .map_err(|e| invalid_op(format!("failed to serialize value: {e}")))?;
    let b = serde_json::to_value(b)
        .map_err(|e| invalid_op(format!("failed to serialize value: {e}")))?;

    use serde_json::Value::*;
    match (&a, &b) {
        (Number(x), Number(y)) => {
            let (x, y) = (x.as_f64(), y.as_f64());
            match (x, y) {
                (Some(x), Some(y)) => x
                    .partial_cmp(&y)
                    .ok_or_else(|| invalid_op("cannot order non-finite numbers")),
                _ => Err(invalid_op("cannot order the given numbers")),
            }
        }
        (String(x), String(y)) => Ok(x.cmp(y)),
        _ => Err(invalid_op(format!("cannot order values {a} and {b}"))),
    }
}
