//! # Magpie - HTTP-to-process gateway
//!
//! Magpie exposes configured HTTP routes that, when invoked, expand
//! templates against request-derived arguments, spawn an external command,
//! and translate its result back into an HTTP response. It sits between
//! webhook producers (which speak varied HTTP dialects) and local
//! processes (which need a fully-formed argv, environment, temporary files
//! and a stdin/stdout contract).
//!
//! ## Core Modules
//!
//! - [`config`] - Declarative listener configuration with structural
//!   defaults merging
//! - [`template`] - The minijinja-backed template engine and its function
//!   library
//! - [`args`] - Request-to-argument-map extraction
//! - [`auth`] - OR-chained authentication (basic, query, header/HMAC)
//! - [`listener`] - Listener compilation and the per-request execution
//!   pipeline
//! - [`plugins`] - The hook pipeline: retry, schedule, preview, AWS SNS,
//!   HTTP response shaping, debug
//! - [`server`] - Router assembly and the serve loop
//! - [`db`] / [`storage`] - Shared handles memoized by connection string
//!
//! ## Example Usage
//!
//! ```yaml
//! port: 7055
//! listeners:
//!   /hello:
//!     command: echo
//!     args:
//!       - "{{ name }}"
//!     return:
//!       - output
//! ```
//!
//! `GET /hello?name=world` now answers `{"output": "world\n"}`.
//!
//! ## Configuration
//!
//! Magpie can be configured via a configuration file (`magpie.yaml`),
//! environment variables (prefix `MAGPIE__`), and command-line arguments.
//! See [`config::MagpieConfig`] for available options.

pub mod args;
pub mod auth;
pub mod config;
pub mod db;
pub mod listener;
pub mod plugins;
pub mod server;
pub mod sns;
pub mod storage;
pub mod template;
