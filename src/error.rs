//! Top-level error composition. Each module that fails in a way callers must
//! branch on owns a `snafu`-derived enum; this module stitches them into one
//! `Error` for `main` to report and exit on.

use snafu::Snafu;

use crate::config::ConfigError;
use crate::descriptor::DescriptorError;
use crate::handoff::HandoffError;
use crate::process::ProcessError;
use crate::reactor::ReactorError;
use crate::rotate::RotateError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("descriptor error: {source}"))]
    Descriptor { source: DescriptorError },

    #[snafu(display("event reactor error: {source}"))]
    Reactor { source: ReactorError },

    #[snafu(display("restart hand-off error: {source}"))]
    Handoff { source: HandoffError },

    #[snafu(display("process/signal error: {source}"))]
    Process { source: ProcessError },

    #[snafu(display("log rotation error: {source}"))]
    Rotate { source: RotateError },

    #[snafu(display("failed to write pid file {path}: {source}"))]
    PidFile {
        path: String,
        source: std::io::Error,
    },
}

impl From<ConfigError> for Error {
    fn from(source: ConfigError) -> Self {
        Error::Config { source }
    }
}

impl From<DescriptorError> for Error {
    fn from(source: DescriptorError) -> Self {
        Error::Descriptor { source }
    }
}

impl From<ReactorError> for Error {
    fn from(source: ReactorError) -> Self {
        Error::Reactor { source }
    }
}

impl From<HandoffError> for Error {
    fn from(source: HandoffError) -> Self {
        Error::Handoff { source }
    }
}

impl From<ProcessError> for Error {
    fn from(source: ProcessError) -> Self {
        Error::Process { source }
    }
}

impl From<RotateError> for Error {
    fn from(source: RotateError) -> Self {
        Error::Rotate { source }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
