//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Id is not [ID_SIZE](crate::common::ID_SIZE) bytes long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id string is not 40 hex characters.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// A decoded packet is not a valid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),
}

/// Alias for `Result<T, kadnode::Error>`
pub type Result<T, E = Error> = core::result::Result<T, E>;
