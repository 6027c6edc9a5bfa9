//! Error types for cloud-init-rs

use thiserror::Error;

/// Main error type for cloud-init-rs operations
#[derive(Error, Debug)]
pub enum CloudInitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Datasource error: {0}")]
    Datasource(String),

    #[error("No datasource found")]
    NoDatasource,

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Include of '{url}' failed: {message}")]
    Include { url: String, message: String },

    #[error("Part handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("Module error in '{module}': {message}")]
    Module { module: String, message: String },

    #[error("No instance has been resolved yet")]
    NoInstance,

    #[error("Command execution failed: {0}")]
    Command(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl CloudInitError {
    /// Create a module error
    pub fn module(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Module {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Create an include error for a single `#include` target
    pub fn include(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Include {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a part handler error
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }
}
