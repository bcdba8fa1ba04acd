//! The tool surface consumed by tool-calling agents.
//!
//! Every transport (MCP stdio, MCP streamable HTTP, the plain HTTP tool API,
//! and the chat front-end) dispatches through one [`ToolRegistry`], so a
//! tool behaves identically wherever it is called from.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ToolRegistry                 │
//! │ preview_file  create_index  list_indexes     │
//! │ query_index   (+ custom Rust tools)          │
//! └──────────────┬───────────────────────────────┘
//!                ▼
//!        ToolContext → IndexService
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use space_harness::config::Config;
//! use space_harness::service::IndexService;
//! use space_harness::traits::{ToolContext, ToolRegistry};
//!
//! let service = Arc::new(IndexService::new(Config::minimal()));
//! let ctx = ToolContext::new(service);
//! let tools = ToolRegistry::with_builtins();
//! assert_eq!(tools.len(), 4);
//! # let _ = ctx;
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{RagError, RagResult};
use crate::service::{
    parse_categories_arg, parse_mapping_arg, parse_weights_arg, CreateIndexRequest, IndexService,
    QueryIndexRequest, DEFAULT_LIMIT, DEFAULT_PREVIEW_ROWS,
};

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A tool that agents can discover and call.
///
/// Tools are registered at startup and exposed via `GET /tools/list` and
/// MCP `tools/list` for discovery, and via `POST /tools/{name}` and MCP
/// `tools/call` for invocation.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use space_harness::error::RagResult;
/// use space_harness::traits::{Tool, ToolContext};
///
/// pub struct CountIndexesTool;
///
/// #[async_trait]
/// impl Tool for CountIndexesTool {
///     fn name(&self) -> &str { "count_indexes" }
///     fn description(&self) -> &str { "Count the existing indexes" }
///
///     fn parameters_schema(&self) -> Value {
///         json!({ "type": "object", "properties": {} })
///     }
///
///     async fn execute(&self, _params: Value, ctx: &ToolContext) -> RagResult<Value> {
///         let listed = ctx.service().list_indexes().await?;
///         Ok(json!({ "count": listed.indexes.len() }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores; also the route path
    /// (`POST /tools/{name}`).
    fn name(&self) -> &str;

    /// One-line description agents use to decide whether to call the tool.
    fn description(&self) -> &str;

    /// Built-in tools are marked `"builtin": true` in `GET /tools/list`.
    fn is_builtin(&self) -> bool {
        false
    }

    /// Tools that never modify indexes are advertised as read-only to MCP
    /// clients.
    fn is_read_only(&self) -> bool {
        false
    }

    /// JSON Schema for the parameters (`type: "object"`).
    fn parameters_schema(&self) -> Value;

    /// Execute the tool. `params` is always a JSON object.
    ///
    /// Failures come back as [`RagError`] values; transports render them
    /// with [`RagError::to_json`] instead of aborting.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> RagResult<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Gives tools access to the shared [`IndexService`].
#[derive(Clone)]
pub struct ToolContext {
    service: Arc<IndexService>,
}

impl ToolContext {
    pub fn new(service: Arc<IndexService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &IndexService {
        &self.service
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> RagResult<&'a str> {
    match params.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        _ => Err(RagError::InvalidInput(format!("{} must be a non-empty string", key))),
    }
}

/// Positive integer parameter; numeric strings are accepted.
fn optional_count(params: &Value, key: &str, default: usize) -> RagResult<usize> {
    let parsed = match params.get(key) {
        None | Some(Value::Null) => return Ok(default),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n >= 1 => Ok(n as usize),
        _ => Err(RagError::InvalidInput(format!("{} must be a positive integer", key))),
    }
}

fn optional_bool(params: &Value, key: &str) -> RagResult<bool> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(RagError::InvalidInput(format!("{} must be a boolean", key))),
        },
        _ => Err(RagError::InvalidInput(format!("{} must be a boolean", key))),
    }
}

fn null_or<'a>(params: &'a Value, key: &str) -> &'a Value {
    params.get(key).unwrap_or(&Value::Null)
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tool Implementations
// ═══════════════════════════════════════════════════════════════════════

pub struct PreviewFileTool;

#[async_trait]
impl Tool for PreviewFileTool {
    fn name(&self) -> &str {
        "preview_file"
    }

    fn description(&self) -> &str {
        "Preview a CSV or JSON file: row count, columns, types, sample rows and suggested column roles"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to a .csv or .json file" },
                "rows": { "type": "integer", "description": "Sample rows to return", "default": DEFAULT_PREVIEW_ROWS }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> RagResult<Value> {
        let path = required_str(&params, "path")?;
        let rows = optional_count(&params, "rows", DEFAULT_PREVIEW_ROWS)?;
        let preview = ctx.service.preview_file(path, rows).await?;
        Ok(serde_json::to_value(preview)?)
    }
}

pub struct CreateIndexTool;

#[async_trait]
impl Tool for CreateIndexTool {
    fn name(&self) -> &str {
        "create_index"
    }

    fn description(&self) -> &str {
        "Create a multi-space search index from a CSV or JSON file"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to a .csv or .json file" },
                "column_mapping": {
                    "type": ["object", "string"],
                    "description": "Column to role: text_similarity, recency, number, category or auto. Omit to detect every column.",
                    "additionalProperties": {
                        "type": "string",
                        "enum": ["text_similarity", "recency", "number", "category", "auto"]
                    }
                },
                "weights": {
                    "type": ["object", "string"],
                    "description": "Default weight per mapped column",
                    "additionalProperties": { "type": "number" }
                },
                "recreate": { "type": "boolean", "description": "Replace an existing index", "default": false }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> RagResult<Value> {
        let request = CreateIndexRequest {
            path: required_str(&params, "path")?.to_string(),
            column_mapping: parse_mapping_arg(null_or(&params, "column_mapping"))?,
            weights: parse_weights_arg(null_or(&params, "weights"))?,
            recreate: optional_bool(&params, "recreate")?,
        };
        let result = ctx.service.create_index(request).await?;
        Ok(serde_json::to_value(result)?)
    }
}

pub struct ListIndexesTool;

#[async_trait]
impl Tool for ListIndexesTool {
    fn name(&self) -> &str {
        "list_indexes"
    }

    fn description(&self) -> &str {
        "List existing indexes with their source file, row count and column roles"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> RagResult<Value> {
        let listed = ctx.service.list_indexes().await?;
        Ok(serde_json::to_value(listed)?)
    }
}

pub struct QueryIndexTool;

#[async_trait]
impl Tool for QueryIndexTool {
    fn name(&self) -> &str {
        "query_index"
    }

    fn description(&self) -> &str {
        "Search an index with free text; optional per-column weights and category filters"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    // A query may restart the server and re-ingest, so it is not read-only.

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index_name": { "type": "string", "description": "Index to search" },
                "query_text": { "type": "string", "description": "Free-text search term" },
                "limit": { "type": "integer", "description": "Max results", "default": DEFAULT_LIMIT },
                "weights": {
                    "type": ["object", "string"],
                    "description": "Per-column weight overrides for this query",
                    "additionalProperties": { "type": "number" }
                },
                "categories": {
                    "type": ["object", "string"],
                    "description": "Category value to match, per category column",
                    "additionalProperties": { "type": "string" }
                }
            },
            "required": ["index_name", "query_text"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> RagResult<Value> {
        let request = QueryIndexRequest {
            index_name: required_str(&params, "index_name")?.to_string(),
            query_text: required_str(&params, "query_text")?.to_string(),
            limit: optional_count(&params, "limit", DEFAULT_LIMIT)?,
            weights: parse_weights_arg(null_or(&params, "weights"))?,
            categories: parse_categories_arg(null_or(&params, "categories"))?,
        };
        let hits = ctx.service.query_index(request).await?;
        Ok(serde_json::to_value(hits)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry for tools (built-in and custom).
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// A registry holding the four index tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PreviewFileTool));
        registry.register(Box::new(CreateIndexTool));
        registry.register(Box::new(ListIndexesTool));
        registry.register(Box::new(QueryIndexTool));
        registry
    }

    /// Add a tool. A tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Only the named tools, in registry order.
    pub fn filtered(self, allowed: &[String]) -> Self {
        Self {
            tools: self
                .tools
                .into_iter()
                .filter(|t| allowed.iter().any(|a| a == t.name()))
                .collect(),
        }
    }

    /// Run a tool by name. Unknown names are `not_found`.
    pub async fn call(&self, name: &str, params: Value, ctx: &ToolContext) -> RagResult<Value> {
        let tool = self.find(name).ok_or_else(|| RagError::NotFound {
            name: name.to_string(),
            available: self.tools.iter().map(|t| t.name().to_string()).collect(),
        })?;
        let params = if params.is_null() { json!({}) } else { params };
        if !params.is_object() {
            return Err(RagError::InvalidInput("tool parameters must be a JSON object".to_string()));
        }
        tracing::debug!(tool = name, "executing tool");
        tool.execute(params, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
