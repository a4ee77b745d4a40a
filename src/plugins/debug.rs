use serde::{Deserialize, Serialize};

use super::{
    OutputDisposition, OutputHook, Plugin, PostExecuteHook, PreExecuteHook, Result, plugin_id,
};
use crate::args::ArgMap;
use crate::listener::{CompiledListener, ExecCommandResult, ListenerResponse};

const DEFAULT_PREFIX: &str = "DEBUG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugConfig {
    /// Prefix to identify log messages, defaults to `DEBUG`
    pub prefix: Option<String>,

    /// Arguments merged over the request ones, for testing listeners
    /// without crafting full requests
    pub args: Option<ArgMap>,
}

/// Logs every pipeline phase at warn level; mainly useful in tests and
/// when developing listener configurations.
#[derive(Debug)]
pub struct DebugPlugin {
    id: String,
    config: DebugConfig,
}

impl DebugPlugin {
    pub fn new(config: DebugConfig) -> Self {
        Self {
            id: plugin_id("debug"),
            config,
        }
    }

    fn prefix(&self) -> &str {
        self.config.prefix.as_deref().unwrap_or(DEFAULT_PREFIX)
    }
}

impl Plugin for DebugPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn pre_execute(&self) -> Option<&dyn PreExecuteHook> {
        Some(self)
    }

    fn post_execute(&self) -> Option<&dyn PostExecuteHook> {
        Some(self)
    }

    fn output(&self) -> Option<&dyn OutputHook> {
        Some(self)
    }
}

impl PreExecuteHook for DebugPlugin {
    fn hook_pre_execute(&self, listener: &CompiledListener, mut args: ArgMap) -> Result<ArgMap> {
        if let Some(overrides) = &self.config.args {
            for (key, value) in overrides {
                args.insert(key.clone(), value.clone());
            }
        }

        tracing::warn!(
            listener = listener.id(),
            prefix = self.prefix(),
            args = ?args,
            "PRE-EXECUTE"
        );
        Ok(args)
    }
}

impl PostExecuteHook for DebugPlugin {
    fn hook_post_execute(
        &self,
        listener: &CompiledListener,
        result: &ExecCommandResult,
    ) -> Result<()> {
        tracing::warn!(
            listener = listener.id(),
            prefix = self.prefix(),
            result = ?result,
            "POST-EXECUTE"
        );
        Ok(())
    }
}

impl OutputHook for DebugPlugin {
    fn hook_output(
        &self,
        listener: &CompiledListener,
        args: &ArgMap,
        response: &ListenerResponse,
    ) -> Result<OutputDisposition> {
        tracing::warn!(
            listener = listener.id(),
            prefix = self.prefix(),
            args = ?args,
            response = ?response,
            "OUTPUT"
        );
        Ok(OutputDisposition::Unhandled)
    }
}
