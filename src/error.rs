//! Result kinds shared by every layer of the flashing stack (see design §7).
//!
//! The original threads an `int32_t` status code plus an optional NRC byte through
//! every call; here that collapses into one `Error` enum so callers can use `?` instead
//! of checking a status code after every service call.

use thiserror::Error;

/// Negative response code returned by a UDS/openSYDE server alongside a `NEGATIVE_RESPONSE`.
pub type Nrc = u8;

#[derive(Debug, Error)]
pub enum Error {
    /// No response arrived within the service's timeout.
    #[error("no response from server (timeout)")]
    NoResponse,

    /// The server answered with a negative response code.
    #[error("negative response from server: NRC 0x{0:02x}")]
    NegativeResponse(Nrc),

    /// A bad parameter at the call site (protected sector hit, invalid range expression, ...).
    #[error("invalid range: {0}")]
    Range(String),

    /// Missing transport, dispatcher, system definition, or PEM database.
    #[error("configuration error: {0}")]
    Config(String),

    /// Hex data targets memory the server does not have.
    #[error("hex data outside of server flash: {0}")]
    Overflow(String),

    /// Security or integrity failure (bad CRC, missing PEM key, security conflict).
    #[error("checksum/security error: {0}")]
    Checksum(String),

    /// Transport not ready, or a reconnect attempt failed.
    #[error("transport busy: {0}")]
    Busy(String),

    /// The progress callback asked the sequencer to stop.
    #[error("aborted by user")]
    UserAbort,

    /// File I/O failure at a boundary (hex file, PEM database, system definition).
    #[error("I/O error: {0}")]
    RdWr(#[from] std::io::Error),

    /// Hex-file parsing failure.
    #[error("hex file error: {0}")]
    Hex(String),

    /// System-definition (TOML) parsing failure.
    #[error("system definition error: {0}")]
    SysDef(String),
}

impl Error {
    /// Numeric discriminant used as the CLI's process exit code (§6).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NoResponse => 1,
            Error::NegativeResponse(_) => 2,
            Error::Range(_) => 3,
            Error::Config(_) => 4,
            Error::Overflow(_) => 5,
            Error::Checksum(_) => 6,
            Error::Busy(_) => 7,
            Error::UserAbort => 8,
            Error::RdWr(_) => 9,
            Error::Hex(_) => 9,
            Error::SysDef(_) => 4,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
