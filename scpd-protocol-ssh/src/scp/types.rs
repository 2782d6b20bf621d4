//! SCP protocol types and constants.

/// Options parsed from the `scp` command line.
///
/// `-t` and `-f` are the undocumented server-side switches: `-t` ("to")
/// makes this server the sink, `-f` ("from") makes it the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScpOptions {
    pub to: bool,
    pub from: bool,
    pub target_is_dir: bool,
    pub recursive: bool,
    pub preserve: bool,
    pub file_names: Vec<String>,
}

/// A single control line of the transfer protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpMessage {
    /// `C<mode> <size> <name>`
    FileHeader { mode: u32, size: u64, name: String },
    /// `D<mode> 0 <name>`
    DirHeader { mode: u32, name: String },
    /// `E`
    EndDir,
    /// `T<mtime> <mtime-us> <atime> <atime-us>`
    Times {
        mtime: i64,
        mtime_us: i64,
        atime: i64,
        atime_us: i64,
    },
}

impl ScpMessage {
    /// Wire form of the message, including the terminating newline.
    pub fn to_wire(&self) -> String {
        match self {
            ScpMessage::FileHeader { mode, size, name } => {
                format!("C{mode:04o} {size} {name}\n")
            }
            ScpMessage::DirHeader { mode, name } => format!("D{mode:04o} 0 {name}\n"),
            ScpMessage::EndDir => "E\n".to_owned(),
            ScpMessage::Times {
                mtime,
                mtime_us,
                atime,
                atime_us,
            } => format!("T{mtime} {mtime_us} {atime} {atime_us}\n"),
        }
    }
}

/// Acknowledgement byte sent after each control line and file body.
pub const ACK_OK: u8 = 0;
/// Recoverable failure; a newline-terminated message follows.
pub const ACK_WARNING: u8 = 1;
/// Fatal failure; a newline-terminated message follows.
pub const ACK_FATAL: u8 = 2;

#[derive(thiserror::Error, Debug)]
pub enum ScpError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("ambiguous target")]
    AmbiguousTarget,
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The peer aborted the transfer with a fatal acknowledgement.
    #[error("remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
