//! Error types shared across the orchestration core.
//!
//! Each failure domain gets its own enum, following the same manual
//! `Display`/`Error` pattern used throughout this crate rather than a
//! derive-macro based error crate.

use std::error::Error;
use std::fmt;

/// Errors raised by the Tool Bridge Client (C1).
#[derive(Debug, Clone)]
pub enum ToolBridgeError {
    /// The connection to the remote tool service is down and reconnect
    /// attempts have been exhausted.
    ConnectionLost,
    /// The remote tool returned an application-level error.
    ToolError(String),
    /// A single `run_tool` call exceeded its timeout.
    Timeout,
}

impl fmt::Display for ToolBridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolBridgeError::ConnectionLost => write!(f, "tool bridge connection lost"),
            ToolBridgeError::ToolError(msg) => write!(f, "tool error: {}", msg),
            ToolBridgeError::Timeout => write!(f, "tool call timed out"),
        }
    }
}

impl Error for ToolBridgeError {}

/// Errors raised by the Agent Runtime (C3).
#[derive(Debug, Clone)]
pub enum AgentRuntimeError {
    /// The ReAct loop exceeded its recursion limit without terminating.
    RecursionLimitExceeded { limit: usize },
    /// The run was cancelled before it produced a result.
    Cancelled,
    /// The underlying model or tool bridge failed in a way the runtime
    /// could not recover from.
    Upstream(String),
}

impl fmt::Display for AgentRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRuntimeError::RecursionLimitExceeded { limit } => {
                write!(f, "agent runtime exceeded recursion limit of {}", limit)
            }
            AgentRuntimeError::Cancelled => write!(f, "agent runtime cancelled"),
            AgentRuntimeError::Upstream(msg) => write!(f, "upstream failure: {}", msg),
        }
    }
}

impl Error for AgentRuntimeError {}

/// Errors raised by the Supervisor (C9) and the components it drives.
#[derive(Debug, Clone)]
pub enum SupervisorError {
    /// The tool bridge could not be reached at startup or went
    /// permanently dark mid-run.
    ToolBridgeDown(String),
    /// A checkpoint could not be written to disk.
    CheckpointWriteFailure(String),
    /// The planning phase failed after exhausting its retries.
    PlanningFailed(String),
    /// The supervisor observed a cancellation request.
    Cancelled,
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::ToolBridgeDown(msg) => write!(f, "tool bridge down: {}", msg),
            SupervisorError::CheckpointWriteFailure(msg) => {
                write!(f, "checkpoint write failure: {}", msg)
            }
            SupervisorError::PlanningFailed(msg) => write!(f, "planning failed: {}", msg),
            SupervisorError::Cancelled => write!(f, "supervisor cancelled"),
        }
    }
}

impl Error for SupervisorError {}
