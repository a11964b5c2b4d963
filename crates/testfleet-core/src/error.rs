//! Errors reported by test executors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::ExecutionFailed("simulator crashed".to_string()).to_string(),
            "execution failed: simulator crashed"
        );
    }
}
