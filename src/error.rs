//! Error types for build operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during a build.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// A malformed source document, with a 1-based location.
    #[error("{}:{line}:{col}: {detail}", path.display())]
    Parse {
        path: PathBuf,
        line: u64,
        col: u64,
        detail: String,
    },

    /// The source tree is structurally unusable (missing OPF, bad layout).
    #[error("invalid source tree: {0}")]
    InvalidSource(String),

    /// A required external binary was not found on PATH.
    #[error("couldn't locate `{0}`; is it installed?")]
    MissingDependency(String),

    /// A manifest href or transform input that does not exist on disk.
    #[error("missing asset: {}", .0.display())]
    MissingAsset(PathBuf),

    /// A reference to an id that no document defines.
    #[error("{} references nonexistent target `{id}`", file.display())]
    DanglingReference { file: PathBuf, id: String },

    /// The AZW3 container violated a structural invariant; nothing was written.
    #[error("invalid AZW3 container: {0}")]
    MobiCorruption(String),

    /// An external tool exited abnormally.
    #[error("`{tool}` failed: {detail}")]
    Tool { tool: String, detail: String },

    /// One or more validators reported messages.
    #[error("validation reported {count} message(s)")]
    ValidationFailed { count: usize },

    /// Unparseable CSS in the core stylesheet.
    #[error("invalid CSS: {0}")]
    Css(String),
}

impl Error {
    /// Exit status the binary maps this error to. Validation findings get
    /// their own code so scripts can tell them from hard failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::ValidationFailed { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_displays_location() {
        let err = Error::Parse {
            path: PathBuf::from("src/epub/text/chapter-1.xhtml"),
            line: 12,
            col: 40,
            detail: "mismatched end tag".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "src/epub/text/chapter-1.xhtml:12:40: mismatched end tag"
        );
    }

    #[test]
    fn validation_gets_distinct_exit_code() {
        assert_eq!(Error::ValidationFailed { count: 3 }.exit_code(), 2);
        assert_eq!(Error::InvalidSource("no OPF".into()).exit_code(), 1);
    }
}
