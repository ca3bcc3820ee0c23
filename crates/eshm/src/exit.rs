use std::fmt;
use std::io;

use eshm_codec::CodecError;
use eshm_link::EshmError;
use eshm_region::RegionError;

// Exit codes follow sysexits-style semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn region_error(context: &str, err: RegionError) -> CliError {
    let code = match &err {
        RegionError::Create { source, .. }
        | RegionError::Attach { source, .. }
        | RegionError::Detach { source, .. }
        | RegionError::Destroy { source, .. }
            if source.kind() == io::ErrorKind::PermissionDenied =>
        {
            PERMISSION_DENIED
        }
        RegionError::NameTooLong { .. } | RegionError::InvalidName(_) => USAGE,
        RegionError::MutexLock { .. } => TIMEOUT,
        RegionError::Unsupported => INTERNAL,
        _ => TRANSPORT_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn codec_error(context: &str, err: CodecError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn link_error(context: &str, err: EshmError) -> CliError {
    match err {
        EshmError::Region(err) => region_error(context, err),
        EshmError::Codec(err) => codec_error(context, err),
        EshmError::Io(err) => io_error(context, err),
        EshmError::InvalidConfig(_) => CliError::new(USAGE, format!("{context}: {err}")),
        EshmError::NoData | EshmError::Timeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        EshmError::BufferFull { .. } | EshmError::BufferTooSmall { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        EshmError::PeerStale { .. }
        | EshmError::ReconnectFailed { .. }
        | EshmError::IncompatibleRegion { .. } => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        EshmError::RoleMismatch { .. } => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
