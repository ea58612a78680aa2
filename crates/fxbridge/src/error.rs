//! Error types for the plugin bridge

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Scanning,
    Opening,
    Entry,
    Magic,
    Dispatcher,
    Instantiation,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStage::Scanning => write!(f, "scanning"),
            LoadStage::Opening => write!(f, "opening library"),
            LoadStage::Entry => write!(f, "resolving entry point"),
            LoadStage::Magic => write!(f, "checking magic"),
            LoadStage::Dispatcher => write!(f, "checking dispatcher"),
            LoadStage::Instantiation => write!(f, "creating instance"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Plugin load failed at {stage} stage: {path}\n  Reason: {reason}")]
    LoadFailed {
        path: PathBuf,
        stage: LoadStage,
        reason: String,
    },

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Plugin fault during {0}")]
    PluginFault(String),

    #[error("Host process is gone")]
    HostGone,

    #[error("Bridge instance is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_stage_display() {
        assert_eq!(LoadStage::Scanning.to_string(), "scanning");
        assert_eq!(LoadStage::Opening.to_string(), "opening library");
        assert_eq!(LoadStage::Entry.to_string(), "resolving entry point");
        assert_eq!(LoadStage::Magic.to_string(), "checking magic");
        assert_eq!(LoadStage::Dispatcher.to_string(), "checking dispatcher");
    }

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = BridgeError::PluginFault("dispatch(Open)".to_string());
        assert!(err.to_string().contains("dispatch(Open)"));

        let err = BridgeError::HostGone;
        assert_eq!(err.to_string(), "Host process is gone");
    }

    #[test]
    fn test_load_failed_names_path_and_stage() {
        let err = BridgeError::LoadFailed {
            path: PathBuf::from("/plugins/broken.so"),
            stage: LoadStage::Dispatcher,
            reason: "dispatcher is null".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/plugins/broken.so"));
        assert!(text.contains("checking dispatcher"));
        assert!(text.contains("dispatcher is null"));
    }
}
