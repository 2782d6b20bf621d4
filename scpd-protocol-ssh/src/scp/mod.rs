//! The SCP command protocol: option parsing plus the source and sink
//! transfer state machines.

mod parser;
mod sink;
mod source;
mod types;

use std::path::{Component, Path, PathBuf};

pub use parser::{parse_message, parse_options, tokenize_command};
pub use sink::ScpSink;
pub use source::ScpSource;
pub use types::*;

/// Resolves a client-supplied path against the served root.
///
/// Leading slashes are relative to the root; `..` components are refused so
/// a request can never address anything above it.
pub fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, ScpError> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::RootDir | Component::CurDir => (),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ScpError::Protocol(format!(
                    "unacceptable path {requested:?}"
                )))
            }
        }
    }
    Ok(resolved)
}
