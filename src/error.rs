use thiserror::Error;

#[derive(Debug, Error)]
pub enum TeamSolveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Dimension error: {0}")]
    Dimension(String),

    #[error("Matrix error: {0}")]
    Matrix(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TeamSolveError>;
