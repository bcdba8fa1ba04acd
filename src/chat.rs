//! Conversational front-end.
//!
//! A [`ChatSession`] keeps the conversation history for one terminal
//! session and drives the tool-use loop against an Anthropic-compatible
//! Messages API:
//!
//! ```text
//! user text ─▶ POST /v1/messages (tools advertised)
//!                 │ stop_reason = tool_use
//!                 ▼
//!          run each tool locally ─▶ tool_result blocks ─▶ POST again
//!                 │ stop_reason = end_turn
//!                 ▼
//!           assistant text
//! ```
//!
//! Only the tools named in `[chat].allowed_tools` are advertised or run.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::ChatConfig;
use crate::error::RagResult;
use crate::traits::{ToolContext, ToolRegistry};

const API_VERSION: &str = "2023-06-01";

const ROUND_LIMIT_NOTICE: &str = "(stopped after the maximum number of tool rounds)";

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// One parsed assistant message.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantReply {
    pub text: String,
    pub tool_uses: Vec<ToolUse>,
    pub stop_reason: String,
    /// Raw content blocks, kept verbatim for the history.
    pub content: Value,
}

impl AssistantReply {
    pub fn wants_tools(&self) -> bool {
        self.stop_reason == "tool_use" && !self.tool_uses.is_empty()
    }
}

pub struct ChatSession {
    config: ChatConfig,
    api_key: String,
    client: reqwest::Client,
    tools: Arc<ToolRegistry>,
    ctx: ToolContext,
    history: Vec<Value>,
}

impl ChatSession {
    /// `tools` is narrowed to `config.allowed_tools`.
    pub fn new(config: &ChatConfig, api_key: String, tools: ToolRegistry, ctx: ToolContext) -> Self {
        Self {
            tools: Arc::new(tools.filtered(&config.allowed_tools)),
            config: config.clone(),
            api_key,
            client: reqwest::Client::new(),
            ctx,
            history: Vec::new(),
        }
    }

    /// Reads the key from the environment variable named in the config.
    pub fn from_env(config: &ChatConfig, tools: ToolRegistry, ctx: ToolContext) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} is not set", config.api_key_env))?;
        Ok(Self::new(config, api_key, tools, ctx))
    }

    pub fn history(&self) -> &[Value] {
        &self.history
    }

    /// Send one user message and return the final assistant text.
    ///
    /// The history always ends on an assistant turn with every `tool_use`
    /// answered. A failed turn is rolled back out of the history.
    pub async fn send(&mut self, text: &str) -> Result<String> {
        let mark = self.history.len();
        let outcome = self.run_turn(text).await;
        if outcome.is_err() {
            self.history.truncate(mark);
        }
        outcome
    }

    async fn run_turn(&mut self, text: &str) -> Result<String> {
        self.history.push(json!({ "role": "user", "content": text }));

        let mut answer = String::new();
        for round in 0..=self.config.max_tool_rounds {
            let reply = self.complete().await?;
            self.history
                .push(json!({ "role": "assistant", "content": reply.content.clone() }));
            if !reply.text.is_empty() {
                answer = reply.text.clone();
            }

            if !reply.wants_tools() {
                return Ok(answer);
            }

            if round == self.config.max_tool_rounds {
                tracing::warn!(rounds = round, "tool round limit reached");
                let skipped: Vec<Value> = reply
                    .tool_uses
                    .iter()
                    .map(|call| round_limit_block(&call.id, self.config.max_tool_rounds))
                    .collect();
                self.history.push(json!({ "role": "user", "content": skipped }));
                break;
            }

            let mut results = Vec::with_capacity(reply.tool_uses.len());
            for call in &reply.tool_uses {
                tracing::info!(tool = %call.name, "model requested tool");
                let outcome = self.tools.call(&call.name, call.input.clone(), &self.ctx).await;
                results.push(tool_result_block(&call.id, &outcome));
            }
            self.history.push(json!({ "role": "user", "content": results }));
        }

        if answer.is_empty() {
            answer = ROUND_LIMIT_NOTICE.to_string();
        }
        self.history
            .push(json!({ "role": "assistant", "content": ROUND_LIMIT_NOTICE }));
        Ok(answer)
    }

    async fn complete(&self) -> Result<AssistantReply> {
        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": self.config.system_prompt,
            "tools": tools_payload(&self.tools),
            "messages": self.history,
        });

        let url = format!("{}/v1/messages", self.config.endpoint.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(Duration::from_secs(120))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("chat request to {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("chat API error ({}): {}", status, text);
        }
        let json: Value = resp.json().await.context("chat API returned invalid JSON")?;
        parse_reply(&json)
    }
}

/// Tool descriptors in Messages API form.
pub fn tools_payload(tools: &ToolRegistry) -> Vec<Value> {
    tools
        .tools()
        .iter()
        .map(|t| {
            json!({
                "name": t.name(),
                "description": t.description(),
                "input_schema": t.parameters_schema(),
            })
        })
        .collect()
}

pub fn parse_reply(json: &Value) -> Result<AssistantReply> {
    let content = json
        .get("content")
        .and_then(Value::as_array)
        .context("chat response has no content array")?;

    let mut texts = Vec::new();
    let mut tool_uses = Vec::new();
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    texts.push(t.to_string());
                }
            }
            Some("tool_use") => tool_uses.push(ToolUse {
                id: block.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                input: block.get("input").cloned().unwrap_or_else(|| json!({})),
            }),
            _ => {}
        }
    }

    Ok(AssistantReply {
        text: texts.join("\n"),
        tool_uses,
        stop_reason: json
            .get("stop_reason")
            .and_then(Value::as_str)
            .unwrap_or("end_turn")
            .to_string(),
        content: Value::Array(content.clone()),
    })
}

/// A `tool_result` block; failures carry the error JSON and `is_error`.
pub fn tool_result_block(tool_use_id: &str, outcome: &RagResult<Value>) -> Value {
    match outcome {
        Ok(value) => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": serde_json::to_string(value).unwrap_or_default(),
        }),
        Err(e) => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": e.to_json().to_string(),
            "is_error": true,
        }),
    }
}

/// Error result for a tool call that was not run because the round limit
/// was reached.
fn round_limit_block(tool_use_id: &str, limit: usize) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": tool_use_id,
        "content": format!("not run: limit of {} tool rounds reached", limit),
        "is_error": true,
    })
}

/// Line-oriented terminal conversation on stdin/stdout. Ends on EOF,
/// `exit` or `quit`.
pub async fn run_repl(mut session: ChatSession) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        match session.send(line).await {
            Ok(answer) => stdout.write_all(format!("{}\n\n", answer).as_bytes()).await?,
            Err(e) => {
                tracing::error!(error = %e, "chat turn failed");
                stdout.write_all(format!("error: {:#}\n\n", e).as_bytes()).await?;
            }
        }
    }
    Ok(())
}
