use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;

use crate::auth::AuthConfig;
use crate::db::DatabaseConfig;
use crate::plugins::PluginEntryConfig;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to load config: {source}"))]
    Load { source: config::ConfigError },

    #[snafu(display("Invalid config: {message}"))]
    Invalid { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Global configuration for Magpie
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MagpieConfig {
    /// If true, enable debug logs
    pub debug: bool,

    /// HTTP port used to listen for incoming requests
    pub port: u16,

    /// Map of route -> listener
    pub listeners: IndexMap<String, ListenerConfig>,

    /// Holds default configs valid for all listeners.
    /// Values defined in each listener will overwrite these ones.
    pub defaults: ListenerConfig,
}

impl Default for MagpieConfig {
    fn default() -> Self {
        Self {
            debug: false,
            port: 7055,
            listeners: IndexMap::new(),
            defaults: ListenerConfig::default(),
        }
    }
}

/// Declarative contract for one route. Every field is optional so the
/// defaults merge can distinguish "unset" from an explicit value: merging
/// leaves `None` fields untouched and replaces `Some` fields wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerConfig {
    /// Template producing the path of the command to run
    pub command: Option<String>,

    /// Templates producing the arguments for `command`
    pub args: Option<Vec<String>>,

    /// Environment variables to pass to the command, name -> template.
    /// Newlines are stripped from the rendered values.
    pub env: Option<IndexMap<String, String>>,

    /// Temporary files to create per request, path -> content template
    pub files: Option<IndexMap<String, String>>,

    /// Which methods to enable for this listener. Defaults to GET, POST.
    /// MUST be UPPERCASE!
    pub methods: Option<Vec<String>>,

    /// If defined, the command runs only when this condition is met
    pub trigger: Option<String>,

    /// List of allowed authentication methods
    pub auth: Option<Vec<AuthConfig>>,

    /// Which parts of the execution are logged
    pub log: Option<Vec<ResponseField>>,

    /// Which parts of the execution appear in the HTTP response
    #[serde(rename = "return")]
    pub return_fields: Option<Vec<ResponseField>>,

    /// If defined, a payload is written to the storage backend on every
    /// execution
    pub storage: Option<StorageConfig>,

    /// If defined, triggers a command whenever an error is raised in
    /// the execution of the current listener
    pub error_handler: Option<Box<ListenerConfig>>,

    /// Ordered list of plugins for this listener
    pub plugins: Option<Vec<PluginEntryConfig>>,

    /// Database connection, consumed by plugins that need one
    pub database: Option<DatabaseConfig>,
}

impl ListenerConfig {
    /// Structural merge with the shared defaults: a field set on the
    /// listener replaces the default wholesale, an unset field inherits it.
    pub fn merged_over(&self, defaults: &ListenerConfig) -> ListenerConfig {
        ListenerConfig {
            command: self.command.clone().or_else(|| defaults.command.clone()),
            args: self.args.clone().or_else(|| defaults.args.clone()),
            env: self.env.clone().or_else(|| defaults.env.clone()),
            files: self.files.clone().or_else(|| defaults.files.clone()),
            methods: self.methods.clone().or_else(|| defaults.methods.clone()),
            trigger: self.trigger.clone().or_else(|| defaults.trigger.clone()),
            auth: self.auth.clone().or_else(|| defaults.auth.clone()),
            log: self.log.clone().or_else(|| defaults.log.clone()),
            return_fields: self
                .return_fields
                .clone()
                .or_else(|| defaults.return_fields.clone()),
            storage: self.storage.clone().or_else(|| defaults.storage.clone()),
            error_handler: self
                .error_handler
                .clone()
                .or_else(|| defaults.error_handler.clone()),
            plugins: self.plugins.clone().or_else(|| defaults.plugins.clone()),
            database: self.database.clone().or_else(|| defaults.database.clone()),
        }
    }

    pub fn methods_or_default(&self) -> Vec<String> {
        match &self.methods {
            Some(methods) if !methods.is_empty() => methods.clone(),
            _ => vec!["GET".to_string(), "POST".to_string()],
        }
    }

    pub fn logs(&self, field: ResponseField) -> bool {
        field_enabled(self.log.as_deref(), field)
    }

    pub fn returns(&self, field: ResponseField) -> bool {
        field_enabled(self.return_fields.as_deref(), field)
    }
}

/// Selects which parts of an execution appear in logs, in the HTTP
/// response, or in the stored payload. `all` is a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseField {
    All,
    Args,
    Command,
    Env,
    Output,
    Storage,
}

pub fn field_enabled(set: Option<&[ResponseField]>, field: ResponseField) -> bool {
    set.is_some_and(|set| set.contains(&ResponseField::All) || set.contains(&field))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Object-store connection string, e.g. `fs:///var/lib/magpie/store`
    pub store: Option<String>,

    /// Which parts of the execution are captured in the stored payload
    pub fields: Option<Vec<ResponseField>>,

    /// If true, the payload is serialized as YAML instead of JSON
    pub as_yaml: Option<bool>,
}

impl StorageConfig {
    pub fn stores(&self, field: ResponseField) -> bool {
        field_enabled(self.fields.as_deref(), field)
    }

    pub fn is_yaml(&self) -> bool {
        self.as_yaml.unwrap_or(false)
    }
}

const KNOWN_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "TRACE",
];

impl MagpieConfig {
    /// Load configuration with precedence: environment variables
    /// (`MAGPIE_*`) over the config file over defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&MagpieConfig::default()).context(LoadSnafu)?);

        builder = match path {
            Some(path) => builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Yaml),
            ),
            None => builder
                .add_source(
                    config::File::with_name("magpie")
                        .format(config::FileFormat::Yaml)
                        .required(false),
                )
                .add_source(
                    config::File::with_name("config/magpie")
                        .format(config::FileFormat::Yaml)
                        .required(false),
                ),
        };

        let loaded = builder
            .add_source(
                config::Environment::with_prefix("MAGPIE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context(LoadSnafu)?;

        let config: MagpieConfig = loaded.try_deserialize().context(LoadSnafu)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.port > 0,
            InvalidSnafu {
                message: "port must be between 1 and 65535".to_string(),
            }
        );

        for (route, listener) in &self.listeners {
            ensure!(
                route.starts_with('/'),
                InvalidSnafu {
                    message: format!("listener route {route} must start with /"),
                }
            );

            let merged = listener.merged_over(&self.defaults);
            ensure!(
                merged.command.as_deref().is_some_and(|c| !c.is_empty()),
                InvalidSnafu {
                    message: format!("listener {route} has no command"),
                }
            );

            for method in merged.methods_or_default() {
                ensure!(
                    KNOWN_METHODS.contains(&method.as_str()),
                    InvalidSnafu {
                        message: format!(
                            "listener {route} has unknown method {method} (methods must be uppercase)"
                        ),
                    }
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(command: &str) -> ListenerConfig {
        ListenerConfig {
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_with_empty_defaults_is_identity() {
        let config = ListenerConfig {
            command: Some("echo".to_string()),
            args: Some(vec!["{{ name }}".to_string()]),
            trigger: Some("eq(go, true)".to_string()),
            ..Default::default()
        };
        let merged = config.merged_over(&ListenerConfig::default());
        assert_eq!(merged.command, config.command);
        assert_eq!(merged.args, config.args);
        assert_eq!(merged.trigger, config.trigger);
        assert!(merged.env.is_none());
    }

    #[test]
    fn test_merge_set_fields_overwrite_wholesale() {
        let defaults = ListenerConfig {
            command: Some("default-cmd".to_string()),
            args: Some(vec!["a".to_string(), "b".to_string()]),
            log: Some(vec![ResponseField::All]),
            ..Default::default()
        };
        let own = ListenerConfig {
            args: Some(vec!["only".to_string()]),
            ..Default::default()
        };
        let merged = own.merged_over(&defaults);

        // Unset fields inherit, set slices replace entirely (no append)
        assert_eq!(merged.command.as_deref(), Some("default-cmd"));
        assert_eq!(merged.args, Some(vec!["only".to_string()]));
        assert_eq!(merged.log, Some(vec![ResponseField::All]));
    }

    #[test]
    fn test_methods_default_to_get_post() {
        assert_eq!(
            listener("echo").methods_or_default(),
            vec!["GET".to_string(), "POST".to_string()]
        );
    }

    #[test]
    fn test_field_enabled_wildcard() {
        let set = vec![ResponseField::All];
        assert!(field_enabled(Some(&set), ResponseField::Output));
        let set = vec![ResponseField::Args];
        assert!(!field_enabled(Some(&set), ResponseField::Output));
        assert!(!field_enabled(None, ResponseField::Output));
    }

    #[test]
    fn test_validate_rejects_missing_command() {
        let mut config = MagpieConfig::default();
        config
            .listeners
            .insert("/hello".to_string(), ListenerConfig::default());
        assert!(config.validate().is_err());

        config
            .listeners
            .insert("/hello".to_string(), listener("echo"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_lowercase_methods() {
        let mut config = MagpieConfig::default();
        let mut bad = listener("echo");
        bad.methods = Some(vec!["post".to_string()]);
        config.listeners.insert("/hello".to_string(), bad);
        assert!(config.validate().is_err());
    }
}
