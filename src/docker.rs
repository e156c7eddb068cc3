use crate::plan::BuildArg;
use crate::registry::Credentials;
use log::debug;
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use thiserror::Error;

/// Mount point of the writable working copy inside test containers.
pub const WORKSPACE: &str = "/workspace";

#[derive(Error, Debug)]
pub enum Error {
    #[error("docker run failed with exit code {0}")]
    Run(ExitStatus),

    #[error("docker build failed with exit code {0}")]
    Build(ExitStatus),

    #[error("docker tag failed with exit code {0}")]
    Tag(ExitStatus),

    #[error("docker login failed with exit code {0}")]
    Login(ExitStatus),

    #[error("docker logout failed with exit code {0}")]
    Logout(ExitStatus),

    #[error("docker push failed with exit code {0}")]
    Push(ExitStatus),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Primitives of a container-build engine.
///
/// Every argument reaches the engine as its own argv entry, never through a shell.
pub trait ContainerEngine {
    /// Run `command` in `image` with `workspace` mounted read-write at [`WORKSPACE`].
    fn run(&self, image: &str, workspace: &Path, command: &[String]) -> Result<(), Error>;

    fn build(
        &self,
        dockerfile: &Path,
        tag: &str,
        context: &Path,
        build_args: &[BuildArg],
    ) -> Result<(), Error>;

    fn tag(&self, source: &str, target: &str) -> Result<(), Error>;

    fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), Error>;

    fn logout(&self, registry: &str) -> Result<(), Error>;

    fn push(&self, image: &str) -> Result<(), Error>;
}

/// The `docker` command line client.
pub struct Docker {
    binary: String,
}

impl Default for Docker {
    fn default() -> Self {
        Self {
            binary: "docker".into(),
        }
    }
}

impl Docker {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        command
    }
}

fn execute(mut command: Command, failure: fn(ExitStatus) -> Error) -> Result<(), Error> {
    debug!("Running {:?}", command);
    command.status().map(|exit_status| {
        if exit_status.success() {
            Ok(())
        } else {
            Err(failure(exit_status))
        }
    })?
}

/// Write `input` to the child's stdin, close it, and wait for the child.
/// The child is reaped even when the write fails.
pub fn feed_and_wait(mut child: Child, input: &[u8]) -> std::io::Result<ExitStatus> {
    let written = match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(input),
        None => Ok(()),
    };
    let status = child.wait()?;
    written?;
    Ok(status)
}

/// Arguments for `docker run`.
pub fn run_args(image: &str, workspace: &Path, command: &[String]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--volume".to_string(),
        format!("{}:{}", workspace.display(), WORKSPACE),
        "--workdir".to_string(),
        WORKSPACE.to_string(),
        image.to_string(),
    ];
    args.extend(command.iter().cloned());
    args
}

/// Arguments for `docker build`.
pub fn build_args(dockerfile: &Path, tag: &str, context: &Path, build_args: &[BuildArg]) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--file".to_string(),
        dockerfile.display().to_string(),
        "--tag".to_string(),
        tag.to_string(),
    ];
    for arg in build_args {
        args.push("--build-arg".to_string());
        args.push(arg.to_string());
    }
    args.push(context.display().to_string());
    args
}

impl ContainerEngine for Docker {
    fn run(&self, image: &str, workspace: &Path, command: &[String]) -> Result<(), Error> {
        let mut process = self.command();
        process.args(run_args(image, workspace, command));
        execute(process, Error::Run)
    }

    fn build(
        &self,
        dockerfile: &Path,
        tag: &str,
        context: &Path,
        build_args: &[BuildArg],
    ) -> Result<(), Error> {
        let mut process = self.command();
        process.args(self::build_args(dockerfile, tag, context, build_args));
        execute(process, Error::Build)
    }

    fn tag(&self, source: &str, target: &str) -> Result<(), Error> {
        let mut process = self.command();
        process.arg("tag").arg(source).arg(target);
        execute(process, Error::Tag)
    }

    fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), Error> {
        debug!("Logging in to Docker registry {} as {}", registry, credentials.username);
        let child = self
            .command()
            .arg("login")
            .arg(registry)
            .arg("--username")
            .arg(&credentials.username)
            .arg("--password-stdin")
            .stdin(Stdio::piped())
            .spawn()?;

        let status = feed_and_wait(child, credentials.password().as_bytes())?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Login(status))
        }
    }

    fn logout(&self, registry: &str) -> Result<(), Error> {
        let mut process = self.command();
        process.arg("logout").arg(registry);
        execute(process, Error::Logout)
    }

    fn push(&self, image: &str) -> Result<(), Error> {
        debug!("Pushing image {}", image);
        let mut process = self.command();
        process.arg("push").arg(image);
        execute(process, Error::Push)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn build_arguments_stay_separate() {
        let args = build_args(
            &PathBuf::from("/tmp/Dockerfile"),
            "registry.example.com/demo:abc",
            &PathBuf::from("/src/demo"),
            &[
                "GREETING=hello $(whoami)".parse().unwrap(),
                "EMPTY=".parse().unwrap(),
            ],
        );
        assert_eq!(
            args,
            vec![
                "build",
                "--file",
                "/tmp/Dockerfile",
                "--tag",
                "registry.example.com/demo:abc",
                "--build-arg",
                "GREETING=hello $(whoami)",
                "--build-arg",
                "EMPTY=",
                "/src/demo",
            ]
        );
    }

    #[test]
    fn run_mounts_workspace() {
        let command = vec!["python".to_string(), "-m".to_string(), "pytest".to_string()];
        let args = run_args("whanos-python:latest", &PathBuf::from("/tmp/copy"), &command);
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--volume",
                "/tmp/copy:/workspace",
                "--workdir",
                "/workspace",
                "whanos-python:latest",
                "python",
                "-m",
                "pytest",
            ]
        );
    }

    #[cfg(unix)]
    fn shell(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn feed_and_wait_returns_the_exit_status() {
        let status = feed_and_wait(shell("cat >/dev/null; exit 3"), b"secret\n").unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn feed_and_wait_reports_a_closed_stdin_after_reaping() {
        // The child exits without reading, so the pipe breaks once its buffer is full.
        let input = vec![b'x'; 1 << 20];
        let err = feed_and_wait(shell("exec 0<&-; exit 0"), &input).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
