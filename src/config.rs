use crate::language::{JavaManifest, Language};
use crate::manifest::{ExposureStyle, ServiceAccount};
use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

/// File name picked up from the working directory when `--settings` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "whanos.toml";

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: String },

    #[error("parse {path}: {err}")]
    Parse { err: toml::de::Error, path: String },
}

/// A whanos.toml file.
#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    pub description: Option<String>,
    #[serde(default)]
    pub detection: Detection,
    pub images: Images,
    #[serde(default)]
    pub build: Build,
    pub render: Render,
    pub apply: Apply,
}

impl Default for Settings {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).expect("built-in default.toml must parse")
    }
}

impl Settings {
    /// Read a user configuration file and merge it over the built-in defaults.
    /// Tables are merged key by key, any other value replaces the default.
    pub fn default_with_user_config_file(path: &Path) -> Result<Self, Error> {
        let display = path.display().to_string();
        let user = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: display.clone(),
        })?;
        Self::default_with_user_config(&user).map_err(|err| Error::Parse { err, path: display })
    }

    fn default_with_user_config(user: &str) -> Result<Self, toml::de::Error> {
        let mut merged: toml::Value = toml::from_str(DEFAULT_CONFIG)?;
        let overlay: toml::Value = toml::from_str(user)?;
        merge(&mut merged, overlay);
        merged.try_into()
    }
}

fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Detection {
    #[serde(default)]
    pub java_manifest: JavaManifest,
}

/// Base image tag per language.
#[derive(Deserialize, Debug, Clone)]
pub struct Images {
    pub c: String,
    pub java: String,
    pub javascript: String,
    pub python: String,
    pub befunge: String,
}

impl Images {
    pub fn for_language(&self, language: Language) -> &str {
        match language {
            Language::C => &self.c,
            Language::Java => &self.java,
            Language::JavaScript => &self.javascript,
            Language::Python => &self.python,
            Language::Befunge => &self.befunge,
        }
    }

    pub fn set(&mut self, language: Language, image: String) {
        match language {
            Language::C => self.c = image,
            Language::Java => self.java = image,
            Language::JavaScript => self.javascript = image,
            Language::Python => self.python = image,
            Language::Befunge => self.befunge = image,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Build {
    /// Build arguments applied to every build unless the caller passes the same key.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Render {
    #[serde(default)]
    pub exposure_style: ExposureStyle,
    /// Pin node ports to `base + port index`. Unset lets the cluster allocate them.
    pub nodeport_base: Option<u16>,
    pub deployer_service_account: ServiceAccount,
    pub tls_secret: Option<String>,
    #[serde_inline_default("IfNotPresent".to_string())]
    pub image_pull_policy: String,
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Apply {
    #[serde_inline_default("kubectl".to_string())]
    pub kubectl: String,
    /// kubeconfig context passed as `--context`.
    pub context: Option<String>,
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::io::Write;

    #[test]
    pub fn load_default_configuration() {
        let cfg = Settings::default();
        assert_eq!(cfg.description, Some("Default configuration file".into()));
        assert_eq!(cfg.detection.java_manifest, JavaManifest::App);
        assert_eq!(cfg.images.for_language(Language::Befunge), "whanos-befunge:latest");
        assert!(cfg.build.args.is_empty());
        assert_eq!(cfg.render.nodeport_base, None);
        assert_eq!(cfg.render.exposure_style, ExposureStyle::Host);
        assert_eq!(cfg.render.deployer_service_account.to_string(), "jenkins/whanos-deployer");
        assert_eq!(cfg.render.tls_secret, None);
        assert_eq!(cfg.apply.kubectl, "kubectl");
    }

    #[test]
    pub fn user_config_merges_over_defaults() {
        let cfg = Settings::default_with_user_config(
            r#"
            [detection]
            java_manifest = "root"

            [images]
            python = "registry.example.com/whanos-python:3.12"

            [build.args]
            HTTP_PROXY = "http://proxy:3128"

            [render]
            exposure_style = "path"
            tls_secret = "wildcard-tls"
            nodeport_base = 31000
            "#,
        )
        .unwrap();

        assert_eq!(cfg.detection.java_manifest, JavaManifest::Root);
        assert_eq!(cfg.images.python, "registry.example.com/whanos-python:3.12");
        assert_eq!(cfg.images.java, "whanos-java:latest");
        assert_eq!(cfg.build.args.get("HTTP_PROXY").map(String::as_str), Some("http://proxy:3128"));
        assert_eq!(cfg.render.exposure_style, ExposureStyle::Path);
        assert_eq!(cfg.render.nodeport_base, Some(31000));
        assert_eq!(cfg.render.tls_secret.as_deref(), Some("wildcard-tls"));
    }

    #[test]
    pub fn user_config_file_errors_name_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[render]\nnodeport_base = \"high\"\n").unwrap();
        let err = Settings::default_with_user_config_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));

        let err = Settings::default_with_user_config_file(Path::new("/nonexistent/whanos.toml"))
            .unwrap_err();
        assert!(matches!(err, Error::ReadFile { .. }));
    }

    #[test]
    pub fn invalid_service_account_is_rejected() {
        let err = Settings::default_with_user_config(
            "[render]\ndeployer_service_account = \"no-slash\"\n",
        );
        assert!(err.is_err());
    }
}
