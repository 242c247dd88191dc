//! agentmesh - multi-agent orchestration server coordinating AI
//! command-line assistants over a terminal multiplexer.

#![allow(clippy::field_reassign_with_default)]
#![allow(clippy::module_inception)]
#![allow(clippy::needless_borrows_for_generic_args)]

pub mod cli;
pub mod config;
pub mod dashboard;
pub mod dispatcher;
pub mod error;
pub mod git;
pub mod healthcheck;
pub mod ipc;
pub mod lock;
pub mod permission;
pub mod registry;
pub mod tools;
pub mod workspace;

pub use error::{AgentMeshError, Result};
pub use tools::{dispatch, ToolCall, ToolContext, ToolResponse};
