use std::{error::Error, fmt::Display};

#[derive(Debug)]
pub enum TuiError {
    IOError(std::io::Error),
}

impl Display for TuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TuiError::IOError(e) => write!(f, "terminal io failed: {}", e),
        }
    }
}

impl Error for TuiError {}

impl From<std::io::Error> for TuiError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}
