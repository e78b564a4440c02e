//! A dedicated error for everything that can go wrong in a scan: I/O, config
//! validation, DNS packet inconsistencies, transport failures, etc.
use std::fmt;
use std::io;
use std::str;

#[derive(Debug)]
pub enum ECSError {
    Io(io::Error),
    Utf8(str::Utf8Error),
    Yaml(serde_yaml::Error),
    Csv(csv::Error),
    AddrParse(std::net::AddrParseError),
    Config(String),
    Transport(String),
    DNS(String),
}

impl ECSError {
    // Helper function to create a new DNS error from a string
    pub fn new(s: &str) -> Self {
        ECSError::DNS(String::from(s))
    }
}

/// A specific custom `Result` for all functions
pub type ECSResult<T> = Result<T, ECSError>;

impl fmt::Display for ECSError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ECSError::Io(e) => write!(f, "I/O error: {}", e),
            ECSError::Utf8(e) => write!(f, "UTF-8 error: {}", e),
            ECSError::Yaml(e) => write!(f, "YAML error: {}", e),
            ECSError::Csv(e) => write!(f, "CSV error: {}", e),
            ECSError::AddrParse(e) => write!(f, "address parse error: {}", e),
            ECSError::Config(s) => write!(f, "config error: {}", s),
            ECSError::Transport(s) => write!(f, "transport error: {}", s),
            ECSError::DNS(s) => write!(f, "DNS error: {}", s),
        }
    }
}

// All conversions from internal errors to ECSError
impl From<io::Error> for ECSError {
    fn from(err: io::Error) -> Self {
        ECSError::Io(err)
    }
}

impl From<str::Utf8Error> for ECSError {
    fn from(err: str::Utf8Error) -> Self {
        ECSError::Utf8(err)
    }
}

impl From<serde_yaml::Error> for ECSError {
    fn from(err: serde_yaml::Error) -> Self {
        ECSError::Yaml(err)
    }
}

impl From<csv::Error> for ECSError {
    fn from(err: csv::Error) -> Self {
        ECSError::Csv(err)
    }
}

impl From<std::net::AddrParseError> for ECSError {
    fn from(err: std::net::AddrParseError) -> Self {
        ECSError::AddrParse(err)
    }
}

impl From<String> for ECSError {
    fn from(err: String) -> Self {
        ECSError::DNS(err)
    }
}
