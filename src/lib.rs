pub mod cli;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod supervisor;
pub mod vfs;

pub use error::{AgentboxError, Result};
