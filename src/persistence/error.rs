use std::fmt;

#[derive(Debug)]
pub enum PersistenceError {
    /// The keyspace refused a read, write or commit
    Storage(fjall::Error),
    /// A record could not be serialized
    Encode(bincode::error::EncodeError),
    /// Stored bytes are not a record of the expected shape
    Decode(bincode::error::DecodeError),
    /// A record decoded but holds values no live state can carry
    Corruption(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage backend: {}", e),
            Self::Encode(e) => write!(f, "cannot encode record: {}", e),
            Self::Decode(e) => write!(f, "cannot decode record: {}", e),
            Self::Corruption(what) => write!(f, "corrupt record: {}", what),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Corruption(_) => None,
        }
    }
}

impl From<fjall::Error> for PersistenceError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err)
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Encode(err)
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Decode(err)
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
