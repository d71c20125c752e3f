use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin load failed: {0}")]
    Load(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Store error: {0}")]
    Store(#[from] wxbridge_store::StoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] wxbridge_engine::EngineError),
}

pub type Result<T> = std::result::Result<T, PluginError>;
