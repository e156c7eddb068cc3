//! Whanos: build any supported repository into a container image, and render
//! the Kubernetes manifests that deploy it into its own namespace.

use thiserror::Error;

pub mod apply;
pub mod config;
pub mod descriptor;
pub mod docker;
pub mod image;
pub mod language;
pub mod manifest;
pub mod orchestrator;
pub mod plan;
pub mod registry;

/// Process exit codes. CI jobs branch on these.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const OTHER: i32 = 1;
    pub const DETECTION: i32 = 10;
    pub const TESTS: i32 = 11;
    pub const BUILD_OR_PUSH: i32 = 12;
    pub const PLAN: i32 = 13;
    pub const DESCRIPTOR: i32 = 20;
    pub const APPLY: i32 = 21;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    Config(#[from] config::Error),

    #[error("image reference: {0}")]
    Image(#[from] image::Error),

    #[error("detect language: {0}")]
    Detect(#[from] language::Error),

    #[error("build plan: {0}")]
    Plan(#[from] plan::Error),

    #[error("build: {0}")]
    Build(#[from] orchestrator::Error),

    #[error("deployment descriptor: {0}")]
    Descriptor(#[from] descriptor::Error),

    #[error("render: {0}")]
    Render(#[from] manifest::Error),

    #[error("apply: {0}")]
    Apply(#[from] apply::Error),

    #[error("filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "InvalidConfiguration",
            Error::Image(_) => "InvalidImageReference",
            Error::Detect(err) => err.kind(),
            Error::Plan(err) => err.kind(),
            Error::Build(err) => err.kind(),
            Error::Descriptor(err) => err.kind(),
            Error::Render(_) => "RenderFailed",
            Error::Apply(_) => "ApplyFailed",
            Error::FilesystemError(_) => "Filesystem",
        }
    }

    pub fn exit_code(&self) -> i32 {
        use orchestrator::Error as Build;
        match self {
            Error::Detect(_) | Error::Build(Build::Detect(_)) => exit::DETECTION,
            Error::Plan(_) | Error::Build(Build::Plan(_)) => exit::PLAN,
            Error::Build(Build::TestsFailed { .. }) => exit::TESTS,
            Error::Build(_) => exit::BUILD_OR_PUSH,
            Error::Descriptor(_) | Error::Render(_) => exit::DESCRIPTOR,
            Error::Apply(_) => exit::APPLY,
            Error::Config(_) | Error::Image(_) | Error::FilesystemError(_) => exit::OTHER,
        }
    }
}
