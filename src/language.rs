//! Language detection from marker files.
//!
//! Every rule is evaluated against the repository before a decision is made,
//! so two markers in the same tree are always reported as ambiguous no matter
//! which language would have been checked first.

use log::debug;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("repository matches several languages: {}", describe(.0))]
    AmbiguousLanguage(Vec<DetectionResult>),

    #[error("no language marker found in {root}; expected exactly one of: {markers}")]
    UnknownLanguage { root: String, markers: String },

    #[error("read repository {path}: {err}")]
    Repository { err: std::io::Error, path: String },
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AmbiguousLanguage(_) => "AmbiguousLanguage",
            Error::UnknownLanguage { .. } => "UnknownLanguage",
            Error::Repository { .. } => "RepositoryUnreadable",
        }
    }
}

fn describe(matches: &[DetectionResult]) -> String {
    matches
        .iter()
        .map(|m| format!("{} ({})", m.language, m.marker.display()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Location of `pom.xml` in a Java repository.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JavaManifest {
    /// `pom.xml` at the repository root.
    Root,
    /// `app/pom.xml`.
    #[default]
    App,
}

impl JavaManifest {
    pub fn pom_path(&self) -> &'static str {
        match self {
            JavaManifest::Root => "pom.xml",
            JavaManifest::App => "app/pom.xml",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Language {
    C,
    Java,
    JavaScript,
    Python,
    Befunge,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::C,
        Language::Java,
        Language::JavaScript,
        Language::Python,
        Language::Befunge,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Java => "java",
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Befunge => "befunge",
        }
    }

    /// Marker file, relative to the repository root.
    pub fn marker(&self, java: JavaManifest) -> &'static str {
        match self {
            Language::C => "Makefile",
            Language::Java => java.pom_path(),
            Language::JavaScript => "package.json",
            Language::Python => "requirements.txt",
            Language::Befunge => "app/main.bf",
        }
    }

    /// Environment variable that overrides the configured base image.
    pub fn base_image_env(&self) -> String {
        format!("WHANOS_BASE_IMAGE_{}", self.name().to_uppercase())
    }

    /// Command the application image starts with.
    pub fn run_command(&self, java: JavaManifest) -> Vec<&'static str> {
        match self {
            Language::C => vec!["./compiled-app"],
            Language::Java => match java {
                JavaManifest::Root => vec!["java", "-jar", "target/app.jar"],
                JavaManifest::App => vec!["java", "-jar", "app/target/app.jar"],
            },
            Language::JavaScript => vec!["node", "."],
            Language::Python => vec!["python", "-m", "app"],
            Language::Befunge => vec!["befunge93", "app/main.bf"],
        }
    }

    /// Dockerfile instructions following `FROM` and `WORKDIR` in the base template.
    pub fn dockerfile_instructions(&self, java: JavaManifest) -> Vec<String> {
        let mut instructions: Vec<String> = match self {
            Language::C => vec!["COPY . .".into(), "RUN make".into()],
            Language::Java => vec![
                "COPY . .".into(),
                match java {
                    JavaManifest::Root => "RUN mvn -DskipTests package".into(),
                    JavaManifest::App => "RUN mvn -f app/pom.xml -DskipTests package".into(),
                },
            ],
            Language::JavaScript => vec![
                "COPY package*.json ./".into(),
                "RUN npm ci --omit=dev || npm install --production".into(),
                "COPY . .".into(),
            ],
            Language::Python => vec![
                "COPY requirements.txt ./".into(),
                "RUN pip install --no-cache-dir -r requirements.txt".into(),
                "COPY . .".into(),
            ],
            Language::Befunge => vec!["COPY . .".into()],
        };
        let cmd = self
            .run_command(java)
            .iter()
            .map(|arg| format!("{arg:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        instructions.push(format!("CMD [{cmd}]"));
        instructions
    }
}

impl Display for Language {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The detected language and the absolute path of the marker that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    pub language: Language,
    pub marker: PathBuf,
}

fn path_exists(path: &Path) -> bool {
    // Dangling symlinks count as present.
    path.symlink_metadata().is_ok()
}

/// Detect the single language of the repository at `repository_root`.
pub fn detect(repository_root: &Path, java: JavaManifest) -> Result<DetectionResult, Error> {
    let root = repository_root.canonicalize().map_err(|err| Error::Repository {
        err,
        path: repository_root.display().to_string(),
    })?;

    let mut matches: Vec<DetectionResult> = Language::ALL
        .iter()
        .filter_map(|&language| {
            let marker = root.join(language.marker(java));
            debug!("Checking {} marker {}", language, marker.display());
            path_exists(&marker).then_some(DetectionResult { language, marker })
        })
        .collect();

    match matches.len() {
        0 => Err(Error::UnknownLanguage {
            root: root.display().to_string(),
            markers: Language::ALL
                .iter()
                .map(|l| l.marker(java))
                .collect::<Vec<_>>()
                .join(", "),
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::AmbiguousLanguage(matches)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn repo(files: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for file in files {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "").unwrap();
        }
        dir
    }

    #[test]
    fn each_marker_detects_its_language() {
        let cases = [
            ("Makefile", Language::C),
            ("app/pom.xml", Language::Java),
            ("package.json", Language::JavaScript),
            ("requirements.txt", Language::Python),
            ("app/main.bf", Language::Befunge),
        ];
        for (marker, language) in cases {
            let dir = repo(&[marker, "README.md"]);
            let result = detect(dir.path(), JavaManifest::App).unwrap();
            assert_eq!(result.language, language, "marker {marker}");
            assert!(result.marker.is_absolute());
            assert!(result.marker.ends_with(marker));
        }
    }

    #[test]
    fn java_root_variant() {
        let dir = repo(&["pom.xml"]);
        let result = detect(dir.path(), JavaManifest::Root).unwrap();
        assert_eq!(result.language, Language::Java);
        assert!(result.marker.ends_with("pom.xml"));

        // A root pom.xml is not a marker under the app variant.
        let err = detect(dir.path(), JavaManifest::App).unwrap_err();
        assert!(matches!(err, Error::UnknownLanguage { .. }));
    }

    #[test]
    fn java_app_variant_ignores_app_pom_under_root_variant() {
        let dir = repo(&["app/pom.xml"]);
        assert_eq!(detect(dir.path(), JavaManifest::App).unwrap().language, Language::Java);
        assert!(matches!(
            detect(dir.path(), JavaManifest::Root),
            Err(Error::UnknownLanguage { .. })
        ));
    }

    #[test]
    fn two_markers_are_ambiguous() {
        let dir = repo(&["Makefile", "package.json"]);
        match detect(dir.path(), JavaManifest::App) {
            Err(Error::AmbiguousLanguage(matches)) => {
                let languages: Vec<_> = matches.iter().map(|m| m.language).collect();
                assert_eq!(languages, vec![Language::C, Language::JavaScript]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn ambiguity_message_names_both_markers() {
        let dir = repo(&["requirements.txt", "app/main.bf", "app/pom.xml"]);
        let err = detect(dir.path(), JavaManifest::App).unwrap_err();
        let message = err.to_string();
        assert_eq!(err.kind(), "AmbiguousLanguage");
        assert!(message.contains("requirements.txt"));
        assert!(message.contains("main.bf"));
        assert!(message.contains("pom.xml"));
    }

    #[test]
    fn empty_repository_is_unknown() {
        let dir = repo(&["README.md", "src/main.rs"]);
        let err = detect(dir.path(), JavaManifest::App).unwrap_err();
        assert_eq!(err.kind(), "UnknownLanguage");
        assert!(err.to_string().contains("package.json"));
    }

    #[test]
    fn missing_repository_is_an_error() {
        let err = detect(Path::new("/nonexistent/whanos/repo"), JavaManifest::App).unwrap_err();
        assert!(matches!(err, Error::Repository { .. }));
    }

    #[test]
    fn dockerfile_instructions_end_with_cmd() {
        assert_eq!(
            Language::Befunge.dockerfile_instructions(JavaManifest::App),
            vec!["COPY . .".to_string(), r#"CMD ["befunge93", "app/main.bf"]"#.to_string()]
        );
        let java = Language::Java.dockerfile_instructions(JavaManifest::Root);
        assert_eq!(java[1], "RUN mvn -DskipTests package");
        assert_eq!(java[2], r#"CMD ["java", "-jar", "target/app.jar"]"#);
    }

    #[test]
    fn base_image_env_names() {
        assert_eq!(Language::JavaScript.base_image_env(), "WHANOS_BASE_IMAGE_JAVASCRIPT");
        assert_eq!(Language::C.base_image_env(), "WHANOS_BASE_IMAGE_C");
    }
}
