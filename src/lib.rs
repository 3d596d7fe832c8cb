pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod sandbox;
pub mod store;

pub use error::{Result, TaskboxError};
