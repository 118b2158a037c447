//! The tool registry — a plain map of descriptors plus the dispatch,
//! alias-rewrite, visibility, and auto-seq matching logic built on it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use pf_domain::error::{Error, Result};
use pf_domain::tool::{Tool, ToolContext, ToolDefinition, ToolSpec};

use pf_llm::schema::validate_value;

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    aliases: RwLock<HashMap<String, String>>,
    blocked: RwLock<HashSet<String>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name.clone();
        self.tools.write().insert(name, tool);
    }

    /// Map an alternate spelling onto a registered tool name.
    pub fn add_alias(&self, from: impl Into<String>, to: impl Into<String>) {
        self.aliases.write().insert(from.into(), to.into());
    }

    /// Hide a tool from the LLM and from auto-seq without unregistering it.
    pub fn block(&self, name: impl Into<String>) {
        self.blocked.write().insert(name.into());
    }

    /// Alias rewrite: resolve an action's node name to the canonical tool
    /// name (identity when no alias matches).
    pub fn resolve(&self, name: &str) -> String {
        self.aliases
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_owned())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let resolved = self.resolve(name);
        self.tools.read().get(&resolved).cloned()
    }

    pub fn is_blocked(&self, name: &str) -> bool {
        self.blocked.read().contains(&self.resolve(name))
    }

    /// Specs of every visible (registered, unblocked) tool, name-ordered.
    pub fn visible_specs(&self) -> Vec<ToolSpec> {
        let blocked = self.blocked.read();
        let mut specs: Vec<ToolSpec> = self
            .tools
            .read()
            .values()
            .map(|t| t.spec().clone())
            .filter(|s| !blocked.contains(&s.name))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// LLM-facing definitions of the visible tools.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.visible_specs().iter().map(ToolSpec::definition).collect()
    }

    /// The auto-seq gate's tool check: the observation is offered to every
    /// visible tool's `args_schema`; a deterministic next step exists only
    /// when exactly one validates (after the side-effects policy filter).
    pub fn unique_consumer(
        &self,
        observation: &Map<String, Value>,
        read_only_only: bool,
    ) -> Option<String> {
        let value = Value::Object(observation.clone());
        let mut matches = self
            .visible_specs()
            .into_iter()
            .filter(|spec| !read_only_only || spec.side_effects.is_read_only())
            .filter(|spec| validate_value(&value, &spec.args_schema).is_ok());
        let first = matches.next()?;
        match matches.next() {
            Some(_) => None, // ambiguous
            None => Some(first.name),
        }
    }

    /// Execute a tool with argument validation, timeout, and cancellation.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> Result<Value> {
        let resolved = self.resolve(name);
        if self.is_blocked(&resolved) {
            return Err(Error::Tool {
                tool_name: resolved,
                message: "tool is blocked".into(),
                fatal: false,
            });
        }
        let tool = self.get(&resolved).ok_or_else(|| Error::Tool {
            tool_name: resolved.clone(),
            message: "unknown tool".into(),
            fatal: false,
        })?;

        if let Err(violations) = validate_value(&args, &tool.spec().args_schema) {
            return Err(Error::Tool {
                tool_name: resolved,
                message: format!("invalid arguments: {}", violations.join("; ")),
                fatal: false,
            });
        }
        if ctx.is_cancelled() {
            return Err(Error::Cancelled(format!("before tool {resolved}")));
        }

        let fatal = tool.spec().fatal_errors;
        match tokio::time::timeout(timeout, tool.call(args, ctx)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(Error::Tool { tool_name, message, fatal: f })) => Err(Error::Tool {
                tool_name,
                message,
                fatal: f || fatal,
            }),
            Ok(Err(Error::Cancelled(msg))) => Err(Error::Cancelled(msg)),
            Ok(Err(e)) => Err(Error::Tool {
                tool_name: resolved,
                message: e.to_string(),
                fatal,
            }),
            Err(_) => Err(Error::Tool {
                tool_name: resolved,
                message: format!("timed out after {}ms", timeout.as_millis()),
                fatal,
            }),
        }
    }
}
