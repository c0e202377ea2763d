use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read in address record")]
    ShortRead,

    #[error("bad address type: {0:#04x}")]
    BadAtyp(u8),

    #[error("cipher not supported: {0}")]
    CipherUnsupported(String),

    #[error("key size mismatch: expected {expected} bytes, got {got}")]
    KeySizeMismatch { expected: usize, got: usize },

    #[error("AEAD open failed")]
    AeadOpenFailed,

    #[error("bind failed on port {port}: {source}")]
    BindFailed { port: u16, source: std::io::Error },

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("resolve failed: {0}")]
    ResolveFailed(String),

    #[error("destination blocked")]
    Blocked,

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("invalid parameters: {0}")]
    Params(String),

    #[error("nothing is modified")]
    NothingModified,

    #[error("NAT entry timed out")]
    NatTimeout,

    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
