//! Build plan resolution: which Dockerfile to build, from which base image,
//! with which build arguments, and how the repository's tests are run.

use crate::config::Settings;
use crate::language::{JavaManifest, Language};
use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const OVERRIDE_PATH: &str = "whanos/Dockerfile.override";
pub const APPEND_PATH: &str = "whanos/Dockerfile.append";

/// Matches POMs that declare test-scoped dependencies, configure surefire, or set a test source directory.
const POM_DECLARES_TESTS: &str = "boolean(\
    //*[local-name()='dependency']/*[local-name()='scope'][normalize-space(text())='test'] | \
    //*[local-name()='plugin']/*[local-name()='artifactId'][normalize-space(text())='maven-surefire-plugin'] | \
    //*[local-name()='testSourceDirectory'])";

#[derive(Error, Debug)]
pub enum Error {
    #[error("both {OVERRIDE_PATH} and {APPEND_PATH} exist in {root}; keep only one")]
    InvalidOverride { root: String },

    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: String },

    #[error("unreadable manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("build argument {0:?} must have the form KEY=VALUE")]
    BuildArg(String),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidOverride { .. } => "InvalidOverride",
            Error::ReadFile { .. } | Error::Manifest { .. } => "UnreadableManifest",
            Error::BuildArg(_) => "InvalidBuildArg",
        }
    }
}

/// A `--build-arg KEY=VALUE` pair, forwarded to the build engine as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArg {
    pub key: String,
    pub value: String,
}

impl FromStr for BuildArg {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value))
                if !key.is_empty() && !key.chars().any(|c| c.is_whitespace()) =>
            {
                Ok(Self {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            _ => Err(Error::BuildArg(s.to_string())),
        }
    }
}

impl Display for BuildArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Where the Dockerfile for this build comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerfileSource {
    /// The per-language base template.
    Base,
    /// The base template followed by a repository-provided fragment.
    Append { path: PathBuf, fragment: String },
    /// A repository-provided Dockerfile used verbatim.
    Override { path: PathBuf, content: String },
}

/// Command run inside the base image to test the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand(pub Vec<String>);

impl TestCommand {
    fn new(args: &[&str]) -> Self {
        Self(args.iter().map(|a| a.to_string()).collect())
    }
}

impl Display for TestCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Caller-supplied knobs for a single build.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub skip_tests: bool,
    pub build_args: Vec<BuildArg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub language: Language,
    pub java_manifest: JavaManifest,
    pub base_image: String,
    pub dockerfile: DockerfileSource,
    pub build_args: Vec<BuildArg>,
    pub skip_tests: bool,
    /// `None` when tests are skipped or the repository has no discoverable test suite.
    pub test_command: Option<TestCommand>,
}

impl BuildPlan {
    /// Render the effective Dockerfile.
    pub fn dockerfile(&self) -> String {
        let fragment = match &self.dockerfile {
            DockerfileSource::Override { content, .. } => return content.clone(),
            DockerfileSource::Append { fragment, .. } => Some(fragment.as_str()),
            DockerfileSource::Base => None,
        };

        let mut lines = vec![
            "# Generated by whanos. Do not edit.".to_string(),
            format!("FROM {}", self.base_image),
            "WORKDIR /workspace".to_string(),
        ];
        lines.extend(self.language.dockerfile_instructions(self.java_manifest));
        if let Some(fragment) = fragment {
            lines.push(String::new());
            lines.push("# --- Begin repository-provided customizations ---".to_string());
            lines.push(fragment.trim().to_string());
            lines.push("# --- End repository-provided customizations ---".to_string());
        }
        lines.join("\n") + "\n"
    }
}

fn read(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
        err,
        path: path.display().to_string(),
    })
}

/// Resolve the build plan for a repository whose language is already known.
pub fn resolve(
    language: Language,
    repository_root: &Path,
    settings: &Settings,
    overrides: &Overrides,
) -> Result<BuildPlan, Error> {
    let override_path = repository_root.join(OVERRIDE_PATH);
    let append_path = repository_root.join(APPEND_PATH);

    let dockerfile = match (override_path.is_file(), append_path.is_file()) {
        (true, true) => {
            return Err(Error::InvalidOverride {
                root: repository_root.display().to_string(),
            })
        }
        (true, false) => {
            info!("Using repository-provided Dockerfile override {}", override_path.display());
            DockerfileSource::Override {
                content: read(&override_path)?,
                path: override_path,
            }
        }
        (false, true) => {
            info!("Appending {} to the {} base template", append_path.display(), language);
            DockerfileSource::Append {
                fragment: read(&append_path)?,
                path: append_path,
            }
        }
        (false, false) => DockerfileSource::Base,
    };

    let java_manifest = settings.detection.java_manifest;
    let test_command = if overrides.skip_tests {
        None
    } else {
        test_command(language, repository_root, java_manifest)?
    };
    match &test_command {
        Some(command) => debug!("Test command: {command}"),
        None if !overrides.skip_tests => info!("No test suite found for {language}"),
        None => {}
    }

    Ok(BuildPlan {
        language,
        java_manifest,
        base_image: settings.images.for_language(language).to_string(),
        dockerfile,
        build_args: merge_build_args(&settings.build.args, &overrides.build_args),
        skip_tests: overrides.skip_tests,
        test_command,
    })
}

/// Configured defaults first, in key order; a caller argument replaces the default
/// with the same key, and new caller keys follow in the order given.
fn merge_build_args(defaults: &BTreeMap<String, String>, caller: &[BuildArg]) -> Vec<BuildArg> {
    let mut merged: Vec<BuildArg> = defaults
        .iter()
        .map(|(key, value)| BuildArg {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    for arg in caller {
        match merged.iter_mut().find(|existing| existing.key == arg.key) {
            Some(existing) => existing.value = arg.value.clone(),
            None => merged.push(arg.clone()),
        }
    }
    merged
}

/// Find the repository's test command. Absence of a test suite is not an error.
pub fn test_command(
    language: Language,
    repository_root: &Path,
    java_manifest: JavaManifest,
) -> Result<Option<TestCommand>, Error> {
    Ok(match language {
        Language::C | Language::Befunge => None,
        Language::Java => {
            let pom = repository_root.join(java_manifest.pom_path());
            pom_declares_tests(&pom)?.then(|| match java_manifest {
                JavaManifest::Root => TestCommand::new(&["mvn", "test"]),
                JavaManifest::App => TestCommand::new(&["mvn", "-f", "app/pom.xml", "test"]),
            })
        }
        Language::JavaScript => {
            let package_json = repository_root.join("package.json");
            package_declares_tests(&package_json)?
                .then(|| TestCommand::new(&["npm", "test", "--", "--watch=false"]))
        }
        Language::Python => ["tests", "test", "pytest.ini"]
            .iter()
            .any(|marker| repository_root.join(marker).exists())
            .then(|| TestCommand::new(&["python", "-m", "pytest"])),
    })
}

fn pom_declares_tests(pom: &Path) -> Result<bool, Error> {
    let xml = read(pom)?;
    let manifest_error = |reason: String| Error::Manifest {
        path: pom.display().to_string(),
        reason,
    };
    let package = sxd_document::parser::parse(&xml).map_err(|err| manifest_error(format!("{err:?}")))?;
    let document = package.as_document();
    let value = sxd_xpath::evaluate_xpath(&document, POM_DECLARES_TESTS)
        .map_err(|err| manifest_error(err.to_string()))?;
    Ok(matches!(value, sxd_xpath::Value::Boolean(true)))
}

#[derive(Deserialize)]
struct PackageJson {
    #[serde(default)]
    scripts: BTreeMap<String, serde_json::Value>,
}

fn package_declares_tests(package_json: &Path) -> Result<bool, Error> {
    let data = read(package_json)?;
    let parsed: PackageJson = serde_json::from_str(&data).map_err(|err| Error::Manifest {
        path: package_json.display().to_string(),
        reason: err.to_string(),
    })?;
    Ok(parsed.scripts.contains_key("test"))
}
