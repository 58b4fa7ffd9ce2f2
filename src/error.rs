//! Error taxonomy for session operations.
//!
//! Internal code propagates `anyhow::Error` with context. Conditions a caller
//! has to react to differently are raised as [`Error`] values somewhere in
//! that chain, and [`kind_of`] recovers their [`ErrorKind`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// How a failure should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Abort the current operation.
    Fatal,
    /// Retry after a short delay.
    Transient,
    /// Bad input from the operator; session state is untouched.
    OperatorInput,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Fatal => write!(f, "fatal"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::OperatorInput => write!(f, "input"),
        }
    }
}

/// Image pipeline stage, used to name where a build failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    DetectArch,
    CreateImage,
    Partition,
    Format,
    Mount,
    Populate,
    Instrument,
    Patch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extract => "rootfs extraction",
            Stage::DetectArch => "architecture detection",
            Stage::CreateImage => "image creation",
            Stage::Partition => "partitioning",
            Stage::Format => "formatting",
            Stage::Mount => "mounting",
            Stage::Populate => "rootfs population",
            Stage::Instrument => "instrumentation",
            Stage::Patch => "filesystem patching",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{stage} failed")]
    Pipeline {
        stage: Stage,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("unsupported architecture '{0}' (expected mipsel, mipseb or arm)")]
    UnsupportedArch(String),

    #[error("required asset not found: {}", .0.display())]
    MissingAsset(PathBuf),

    #[error("device {device} is still busy; try again in a moment")]
    DeviceBusy { device: String },

    #[error("{} is already mounted at {}", image.display(), mount_point.display())]
    AlreadyMounted { image: PathBuf, mount_point: PathBuf },

    #[error("{} is not mounted", .0.display())]
    NotMounted(PathBuf),

    #[error("no local file {}", .0.display())]
    MissingLocalFile(PathBuf),

    #[error("{0} not found in image")]
    TargetNotFound(String),

    #[error("no image set; build one with make_image first")]
    NoImage,

    #[error("usage: {0}")]
    Usage(String),
}

impl Error {
    pub fn pipeline(stage: Stage, source: anyhow::Error) -> Self {
        Error::Pipeline {
            stage,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Pipeline { source, .. } => {
                if chain_has_busy(source.as_ref()) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            Error::UnsupportedArch(_) | Error::MissingAsset(_) => ErrorKind::Fatal,
            Error::DeviceBusy { .. } => ErrorKind::Transient,
            Error::AlreadyMounted { .. }
            | Error::NotMounted(_)
            | Error::MissingLocalFile(_)
            | Error::TargetNotFound(_)
            | Error::NoImage
            | Error::Usage(_) => ErrorKind::OperatorInput,
        }
    }
}

fn chain_has_busy(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(Error::DeviceBusy { .. }) = e.downcast_ref::<Error>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Classify an error chain. A busy device anywhere makes it transient;
/// otherwise the outermost typed error decides, and untyped errors are fatal.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    let mut first = None;
    for cause in err.chain() {
        if let Some(typed) = cause.downcast_ref::<Error>() {
            let kind = typed.kind();
            if kind == ErrorKind::Transient {
                return kind;
            }
            first.get_or_insert(kind);
        }
    }
    first.unwrap_or(ErrorKind::Fatal)
}
