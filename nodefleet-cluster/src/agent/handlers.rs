//! Command handler registry

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::pool::Command;

/// Command types the agent handles itself
pub const BUILTIN_COMMANDS: [&str; 5] = ["freeze", "unfreeze", "exec", "deploy_file", "health_check"];

/// Handles one command type.
///
/// Returning `Ok` with `"success": false` in the output marks the command
/// failed without an error message; returning `Err` marks it failed with
/// the error text. Handlers must tolerate being run more than once for the
/// same command id.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> anyhow::Result<Map<String, Value>>;
}

struct FnHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Map<String, Value>>> + Send,
{
    async fn handle(&self, command: &Command) -> anyhow::Result<Map<String, Value>> {
        (self.handler)(command.clone()).await
    }
}

/// Wrap an async closure as a command handler
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Map<String, Value>>> + Send + 'static,
{
    Arc::new(FnHandler { handler })
}

/// A bundle of handlers registered together
pub trait CommandPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn handlers(&self) -> Vec<(String, Arc<dyn CommandHandler>)>;
}

/// Mapping from command type to integrator handler
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; built-in and already registered types are rejected
    pub fn register(
        &mut self,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        let command_type = command_type.into();
        if BUILTIN_COMMANDS.contains(&command_type.as_str()) {
            return Err(Error::Configuration(format!(
                "'{command_type}' is a built-in command and cannot be overridden"
            )));
        }
        if self.handlers.contains_key(&command_type) {
            return Err(Error::Configuration(format!(
                "Handler for '{command_type}' is already registered"
            )));
        }
        self.handlers.insert(command_type, handler);
        Ok(())
    }

    pub fn register_plugin(&mut self, plugin: &dyn CommandPlugin) -> Result<()> {
        for (command_type, handler) in plugin.handlers() {
            self.register(command_type, handler)?;
        }
        tracing::debug!(plugin = %plugin.name(), "Registered command plugin");
        Ok(())
    }

    #[must_use]
    pub fn get(&self, command_type: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(command_type).cloned()
    }

    /// Registered types, sorted
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Arc<dyn CommandHandler> {
        handler_fn(|command: Command| async move {
            let mut out = Map::new();
            out.insert("echo".into(), Value::String(command.command_type));
            Ok(out)
        })
    }

    #[test]
    fn test_builtin_types_cannot_be_overridden() {
        let mut registry = HandlerRegistry::new();
        let err = registry.register("exec", echo()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("backup", echo()).unwrap();
        assert!(registry.register("backup", echo()).is_err());
        assert_eq!(registry.types(), vec!["backup"]);
    }

    #[tokio::test]
    async fn test_closure_handler_receives_command() {
        let mut registry = HandlerRegistry::new();
        registry.register("backup", echo()).unwrap();

        let handler = registry.get("backup").unwrap();
        let out = handler.handle(&Command::new("backup")).await.unwrap();
        assert_eq!(out["echo"], "backup");
        assert!(registry.get("restore").is_none());
    }
}
