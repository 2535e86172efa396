use std::fmt;

#[derive(Debug)]
pub enum MergeError {
    /// Split count or role incompatible with the process group.
    Configuration(String),
    /// A received snapshot could not be opened as a container.
    CorruptInput { source_rank: usize, reason: String },
    Merge(String),
    Transport(String),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Io(std::io::Error),
    Other(String),
}

impl MergeError {
    /// Every error that reaches the process boundary is fatal.
    pub fn exit_code(&self) -> i32 {
        1
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, MergeError::Merge(_))
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::Configuration(e) => write!(f, "Configuration error: {}", e),
            MergeError::CorruptInput { source_rank, reason } => {
                write!(f, "Corrupt input from rank {}: {}", source_rank, reason)
            }
            MergeError::Merge(e) => write!(f, "Merge error: {}", e),
            MergeError::Transport(e) => write!(f, "Transport error: {}", e),
            MergeError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MergeError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            MergeError::Io(e) => write!(f, "IO error: {}", e),
            MergeError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for MergeError {}

impl From<bincode::error::EncodeError> for MergeError {
    fn from(err: bincode::error::EncodeError) -> Self {
        MergeError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for MergeError {
    fn from(err: bincode::error::DecodeError) -> Self {
        MergeError::Deserialization(Box::new(err))
    }
}

impl From<std::io::Error> for MergeError {
    fn from(err: std::io::Error) -> Self {
        MergeError::Io(err)
    }
}

impl From<String> for MergeError {
    fn from(err: String) -> Self {
        MergeError::Other(err)
    }
}

impl From<&str> for MergeError {
    fn from(err: &str) -> Self {
        MergeError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_failing_component() {
        let err = MergeError::CorruptInput { source_rank: 3, reason: "bad magic".to_string() };
        assert_eq!(err.to_string(), "Corrupt input from rank 3: bad magic");

        let err = MergeError::Configuration("split 4 needs 8 ranks".to_string());
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_exit_code_and_fatality() {
        assert_eq!(MergeError::Transport("closed".into()).exit_code(), 1);
        assert!(MergeError::Transport("closed".into()).is_fatal());
        assert!(!MergeError::Merge("binning".into()).is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: MergeError = io.into();
        assert!(matches!(err, MergeError::Io(_)));
    }
}
