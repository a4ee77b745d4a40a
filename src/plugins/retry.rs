use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::time::Duration;

use super::{
    DurationSnafu, HookSnafu, InitSnafu, Plugin, PluginBuildContext, Result, RetryAttempt,
    RetryDecision, RetryHook, TemplateSnafu, plugin_id,
};
use crate::args::ArgMap;
use crate::listener::{CompiledListener, ExecCommandResult};
use crate::template::{FileMap, IfTemplate, Template};

/// On every retry cycle, elapsed time, retry count and the previous
/// execution result can be accessed under this key.
pub const KEY_RETRY_INFO: &str = "__gteRetry";

const DEFAULT_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Condition template for when to retry the command execution
    pub condition: String,

    /// Delay template deciding how long to wait before the next retry.
    /// Needs to render to a parseable duration, e.g. `3s` or `1m 30s`.
    /// Defaults to 3s.
    pub delay: Option<String>,

    // NOTE: if neither maxRetries nor maxElapsed are provided, the plugin
    // defaults to 3 retries.
    /// If provided, limits the max amount of retries
    pub max_retries: Option<u32>,

    /// If provided, limits the maximum amount of time spent retrying
    #[serde(default, with = "humantime_serde")]
    pub max_elapsed: Option<Duration>,
}

#[derive(Debug)]
pub struct RetryPlugin {
    id: String,
    config: RetryConfig,
    tpl_condition: IfTemplate,
    tpl_delay: Option<Template>,
}

impl RetryPlugin {
    pub fn new(config: RetryConfig, context: &PluginBuildContext<'_>) -> Result<Self> {
        ensure!(
            !config.condition.is_empty(),
            InitSnafu {
                message: "retry plugin requires a condition".to_string(),
            }
        );

        let id = plugin_id("retry");
        let tpl_condition = IfTemplate::parse(
            format!("{}-{id}-condition", context.listener_id),
            &config.condition,
        )
        .context(TemplateSnafu)?;

        let tpl_delay = match &config.delay {
            Some(source) => Some(
                Template::parse(format!("{}-{id}-delay", context.listener_id), source)
                    .context(TemplateSnafu)?,
            ),
            None => None,
        };

        Ok(Self {
            id,
            config,
            tpl_condition,
            tpl_delay,
        })
    }
}

impl Plugin for RetryPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn should_retry(&self) -> Option<&dyn RetryHook> {
        Some(self)
    }
}

impl RetryHook for RetryPlugin {
    fn hook_should_retry(
        &self,
        _listener: &CompiledListener,
        attempt: &RetryAttempt,
        args: &ArgMap,
        last_result: &ExecCommandResult,
    ) -> Result<Option<RetryDecision>> {
        if let Some(max_elapsed) = self.config.max_elapsed
            && attempt.elapsed > max_elapsed
        {
            // Do not retry past the max allowed execution time
            return HookSnafu {
                message: format!(
                    "max execution time reached ({}), cannot retry",
                    humantime::format_duration(max_elapsed)
                ),
            }
            .fail();
        }

        let max_retries = match (self.config.max_retries, self.config.max_elapsed) {
            (Some(max), _) => Some(max),
            (None, None) => Some(DEFAULT_MAX_RETRIES),
            (None, Some(_)) => None,
        };

        if let Some(max_retries) = max_retries
            && attempt.retry_count > max_retries
        {
            return HookSnafu {
                message: format!(
                    "max amount of retries reached ({max_retries}), cannot retry"
                ),
            }
            .fail();
        }

        let mut new_args = args.clone();
        new_args.insert(
            KEY_RETRY_INFO.to_string(),
            serde_json::json!({
                "elapsed": attempt.elapsed.as_secs_f64(),
                "retryCount": attempt.retry_count,
                "previousResult": last_result,
            }),
        );

        let args_value = serde_json::Value::Object(new_args.clone());
        let should_retry = self
            .tpl_condition
            .is_true(&args_value, &FileMap::new())
            .context(TemplateSnafu)?;
        if !should_retry {
            return Ok(None);
        }

        let delay = match &self.tpl_delay {
            None => DEFAULT_DELAY,
            Some(template) => {
                let rendered = template
                    .execute(&args_value, &FileMap::new())
                    .context(TemplateSnafu)?;
                let rendered = rendered.trim().to_string();
                humantime::parse_duration(&rendered).with_context(|_| DurationSnafu {
                    value: rendered.clone(),
                })?
            }
        };

        Ok(Some(RetryDecision {
            delay,
            args: new_args,
        }))
    }
}
