// src/lib.rs

pub mod cloudllm;

pub mod agent_runtime;
pub mod checkpoint;
pub mod completion;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod executor;
pub mod issue_manager;
pub mod model;
pub mod planning_manager;
pub mod supervisor;
pub mod tool_bridge;
pub mod tracker;
pub mod ws;

pub use cloudllm::client_wrapper::{ClientWrapper, Message, Role};
