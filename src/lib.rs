//! # Space Harness
//!
//! Multi-space vector indexes over tabular files, exposed as tools for
//! tool-calling agents.
//!
//! A CSV or JSON file is loaded and normalized, each column is given a role
//! (text similarity, recency, number, category; detected or supplied), and
//! one scoring space is built per column. The spaces are assembled into an
//! index plus a parameterized query, deployed to an execution backend, and
//! the rows are ingested. Queries combine the per-space scores with
//! caller-adjustable weights.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌─────────────┐
//! │  table   │──▶│  detect  │──▶│  schema  │──▶│    query    │
//! │ CSV/JSON │   │  roles   │   │  spaces  │   │ index plan  │
//! └──────────┘   └──────────┘   └──────────┘   └──────┬──────┘
//!                                                     ▼
//!      ┌──────────┐        ┌───────────────────────────────────┐
//!      │ metadata │◀──────▶│ service ──▶ backend (memory|remote)│
//!      └──────────┘        └───────────────┬───────────────────┘
//!                                          ▼
//!                      traits (tools) ──▶ mcp / server / chat / CLI
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`error`] | Error taxonomy with machine-readable codes |
//! | [`logging`] | tracing subscriber setup |
//! | [`models`] | Roles, column mappings, records, results |
//! | [`table`] | File loading and normalization |
//! | [`detect`] | Column role detection |
//! | [`chunk`] | Text chunking for text spaces |
//! | [`embedding`] | Embedding providers |
//! | [`schema`] | Schema and scoring space construction |
//! | [`query`] | Index plan and query assembly |
//! | [`backend`] | In-process and out-of-process execution |
//! | [`process`] | Framework server subprocess lifecycle |
//! | [`metadata`] | Index metadata persistence |
//! | [`service`] | preview / create / list / query orchestration |
//! | [`traits`] | Tool trait and registry |
//! | [`mcp`] | MCP protocol bridge |
//! | [`server`] | HTTP tool API |
//! | [`chat`] | Conversational front-end |

pub mod backend;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod detect;
pub mod embedding;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod metadata;
pub mod models;
pub mod process;
pub mod query;
pub mod schema;
pub mod server;
pub mod service;
pub mod table;
pub mod traits;
