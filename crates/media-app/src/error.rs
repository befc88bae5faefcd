use api_workers::DispatchError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("No resource named {0}")]
    UnknownResource(String),
}
