//! The build pipeline: detect, plan, test, build, and publish one repository.

use crate::config::Settings;
use crate::docker::{self, ContainerEngine};
use crate::image::ImageReference;
use crate::language;
use crate::plan::{self, BuildArg, BuildPlan};
use crate::registry::Credentials;
use log::{info, warn};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Detect(#[from] language::Error),

    #[error(transparent)]
    Plan(#[from] plan::Error),

    #[error("tests failed ({command}): {source}")]
    TestsFailed {
        command: String,
        source: docker::Error,
    },

    #[error("prepare test workspace: {0}")]
    Workspace(std::io::Error),

    #[error("build failed: {0}")]
    BuildFailed(docker::Error),

    #[error("push failed: {0}")]
    PushFailed(docker::Error),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Detect(err) => err.kind(),
            Error::Plan(err) => err.kind(),
            Error::TestsFailed { .. } => "TestsFailed",
            Error::Workspace(_) | Error::BuildFailed(_) => "BuildFailed",
            Error::PushFailed(_) => "PushFailed",
        }
    }
}

/// Where to publish the image. Without one the build only tags locally.
#[derive(Debug, Clone)]
pub struct RegistryTarget {
    pub host: String,
    /// When absent, an earlier `docker login` is assumed.
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub skip_tests: bool,
    pub registry: Option<RegistryTarget>,
    pub build_args: Vec<BuildArg>,
    /// Floating tag published next to the commit-addressed reference.
    pub alias: Option<ImageReference>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub image_reference: String,
    pub pushed: bool,
    pub tested: bool,
    pub aliases: Vec<String>,
}

/// Detect and resolve the build plan without running anything.
pub fn prepare(
    repository_root: &Path,
    settings: &Settings,
    options: &BuildOptions,
) -> Result<BuildPlan, Error> {
    let detection = language::detect(repository_root, settings.detection.java_manifest)?;
    info!(
        "Detected language: {} ({})",
        detection.language,
        detection.marker.display()
    );

    let overrides = plan::Overrides {
        skip_tests: options.skip_tests,
        build_args: options.build_args.clone(),
    };
    Ok(plan::resolve(detection.language, repository_root, settings, &overrides)?)
}

pub fn run<E: ContainerEngine>(
    engine: &E,
    repository_root: &Path,
    image: &ImageReference,
    settings: &Settings,
    options: &BuildOptions,
) -> Result<BuildOutcome, Error> {
    let plan = prepare(repository_root, settings, options)?;

    let tested = match (&plan.test_command, plan.skip_tests) {
        (_, true) => {
            info!("Skipping tests");
            false
        }
        (None, false) => false,
        (Some(command), false) => {
            info!("Running tests in {}: {}", plan.base_image, command);
            let workspace = working_copy(repository_root).map_err(Error::Workspace)?;
            engine
                .run(&plan.base_image, workspace.path(), &command.0)
                .map_err(|source| Error::TestsFailed {
                    command: command.to_string(),
                    source,
                })?;
            true
        }
    };

    let image_reference = image.to_string();
    let mut dockerfile = tempfile::NamedTempFile::new().map_err(|err| Error::BuildFailed(err.into()))?;
    dockerfile
        .write_all(plan.dockerfile().as_bytes())
        .map_err(|err| Error::BuildFailed(err.into()))?;

    info!("Building image {image_reference}");
    engine
        .build(dockerfile.path(), &image_reference, repository_root, &plan.build_args)
        .map_err(Error::BuildFailed)?;

    let aliases: Vec<String> = options.alias.iter().map(ToString::to_string).collect();
    for alias in &aliases {
        engine.tag(&image_reference, alias).map_err(Error::BuildFailed)?;
    }

    let Some(registry) = &options.registry else {
        info!("No registry given, {image_reference} is tagged locally only");
        return Ok(BuildOutcome {
            image_reference,
            pushed: false,
            tested,
            aliases,
        });
    };

    if let Some(credentials) = &registry.credentials {
        engine
            .login(&registry.host, credentials)
            .map_err(Error::PushFailed)?;
    }

    let pushed = push_all(engine, &image_reference, &aliases);

    if registry.credentials.is_some() {
        if let Err(err) = engine.logout(&registry.host) {
            warn!("Logout from {} failed: {}", registry.host, err);
        }
    }
    pushed.map_err(Error::PushFailed)?;

    Ok(BuildOutcome {
        image_reference,
        pushed: true,
        tested,
        aliases,
    })
}

fn push_all<E: ContainerEngine>(engine: &E, image_reference: &str, aliases: &[String]) -> Result<(), docker::Error> {
    info!("Pushing image {image_reference}");
    engine.push(image_reference)?;
    for alias in aliases {
        info!("Pushing alias {alias}");
        engine.push(alias)?;
    }
    Ok(())
}

/// Copy the repository into a temporary directory the test container may write to.
fn working_copy(repository_root: &Path) -> std::io::Result<tempfile::TempDir> {
    let workspace = tempfile::TempDir::new()?;
    copy_tree(repository_root, workspace.path())?;
    Ok(workspace)
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            std::fs::create_dir(&target)?;
            copy_tree(&source, &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(&source, &target)?;
        } else {
            std::fs::copy(&source, &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(std::fs::read_link(source)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::copy(source, target).map(|_| ())
}
