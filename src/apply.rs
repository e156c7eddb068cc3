use crate::config;
use crate::docker::feed_and_wait;
use crate::manifest::{self, RenderedManifestSet};
use log::{debug, info};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubectl apply exited with code {0}")]
    Apply(ExitStatus),

    #[error(transparent)]
    Render(#[from] manifest::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Arguments for `kubectl`, reading the manifests from standard input.
pub fn apply_args(cfg: &config::Apply) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(context) = &cfg.context {
        args.push("--context".to_string());
        args.push(context.clone());
    }
    args.extend(["apply", "--filename", "-"].map(String::from));
    args
}

/// Create or update every document of the set in the cluster.
pub fn apply(set: &RenderedManifestSet, cfg: &config::Apply) -> Result<(), Error> {
    let yaml = set.to_yaml()?;
    info!("Applying {} documents to namespace {}", set.documents.len(), set.namespace);

    let mut process = std::process::Command::new(&cfg.kubectl);
    process
        .args(apply_args(cfg))
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    debug!("Running {:?}", process);

    let child = process.spawn()?;
    let status = feed_and_wait(child, yaml.as_bytes())?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Apply(status))
    }
}
