use thiserror::Error;

/// Errors raised while decoding or encoding DNS messages
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too small for {0}")]
    Truncated(&'static str),

    #[error("offset {0} out of bounds while parsing domain name")]
    NameOutOfBounds(usize),

    #[error("too many compression jumps while parsing domain name")]
    TooManyJumps,

    #[error("label too long ({0} bytes): {1}")]
    LabelTooLong(usize, String),

    #[error("domain name too long ({0} bytes)")]
    NameTooLong(usize),

    #[error("RDATA too long ({0} bytes)")]
    RdataTooLong(usize),

    #[error("message too long for TCP framing ({0} bytes)")]
    MessageTooLong(usize),
}

/// A query name that could not be turned into text
#[derive(Debug, Error, PartialEq, Eq)]
#[error("query name is not valid UTF-8 (valid up to byte {valid_up_to})")]
pub struct NameDecodeError {
    pub valid_up_to: usize,
}

/// Startup configuration failures. These abort the process before any
/// socket is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid match pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid {field} name {name:?}: {source}")]
    TargetName {
        field: &'static str,
        name: String,
        #[source]
        source: WireError,
    },
}

/// Failures of a resolver to produce any result. Distinct from a resolver
/// declining a query, which is `Resolution::NotOwned`.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("upstream {addr} i/o error: {source}")]
    Upstream {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed upstream response: {0}")]
    Malformed(#[from] WireError),

    #[error("upstream {addr} answered with rcode {rcode}")]
    UpstreamFailure { addr: String, rcode: u8 },

    #[error("upstream response id {got} does not match query id {expected}")]
    IdMismatch { expected: u16, got: u16 },
}
