/// Whanos
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use whanos::config::{self, Settings};
use whanos::descriptor::{self, Exposure};
use whanos::docker::Docker;
use whanos::image::ImageReference;
use whanos::language::{self, Language};
use whanos::manifest::{self, RenderOptions};
use whanos::orchestrator::{self, BuildOptions, RegistryTarget};
use whanos::plan::BuildArg;
use whanos::registry::Credentials;
use whanos::{apply, exit, Error};

/// Build, test and publish any supported repository, and render its Kubernetes deployment.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the whanos.toml settings file.
    /// Defaults to ./whanos.toml when it exists.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExposeMode {
    Ingress,
    Nodeport,
}

impl ExposeMode {
    fn exposure(self) -> Exposure {
        match self {
            ExposeMode::Ingress => Exposure::Ingress,
            ExposeMode::Nodeport => Exposure::NodePort,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect the language of a repository and print it with its marker file.
    Detect {
        /// Root of the repository.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Print the Dockerfile a build of this repository would use.
    Dockerfile {
        /// Root of the repository.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Test the repository, build its image, and push it when a registry is given.
    Build {
        /// Root of the repository.
        #[arg(long)]
        repo: PathBuf,

        /// Fully qualified image reference, e.g. registry.example.com/apps/demo:1a2b3c4.
        #[arg(long)]
        image: ImageReference,

        /// Registry to log in to and push to. Without it the image is only tagged locally.
        #[arg(long)]
        registry: Option<String>,

        /// Do not run the repository's tests.
        #[arg(long)]
        skip_tests: bool,

        /// Build argument forwarded to the image build. Repeatable.
        #[arg(long = "build-arg", value_name = "KEY=VALUE")]
        build_args: Vec<BuildArg>,

        /// Branch name to publish as an additional floating tag.
        #[arg(long, value_name = "BRANCH")]
        alias: Option<String>,
    },
    /// Render the Kubernetes manifests of an application, then apply, print or write them.
    Render {
        /// Deployment descriptor. Defaults to ./whanos.yml or ./whanos.yaml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Image to deploy, used verbatim.
        #[arg(long)]
        image: String,

        /// Application name.
        #[arg(long)]
        app: String,

        /// Base domain for ingress hosts.
        #[arg(long)]
        domain: Option<String>,

        /// How the application is exposed outside the cluster.
        #[arg(long, value_enum)]
        expose_mode: Option<ExposeMode>,

        /// Write one file per manifest into this directory instead of applying.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Print the manifests instead of applying them.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Read the settings file and merge it with the built-in defaults.
///
/// If a file name is not set explicitly, `whanos.toml` in the working directory
/// is used when it exists. Base images may be overridden per language through
/// `WHANOS_BASE_IMAGE_<LANGUAGE>`.
fn read_settings(path: Option<&Path>) -> Result<Settings, Error> {
    let implicit = PathBuf::from(config::DEFAULT_CONFIG_FILE);
    let mut settings = match path {
        Some(path) => Settings::default_with_user_config_file(path)?,
        None if implicit.is_file() => Settings::default_with_user_config_file(&implicit)?,
        None => Settings::default(),
    };

    for language in Language::ALL {
        if let Ok(image) = std::env::var(language.base_image_env()) {
            info!("Base image for {language} overridden by environment: {image}");
            settings.images.set(language, image);
        }
    }
    Ok(settings)
}

fn registry_credentials() -> Option<Credentials> {
    let credentials = Credentials::from_parts(
        std::env::var("WHANOS_REGISTRY_USERNAME").ok(),
        std::env::var("WHANOS_REGISTRY_PASSWORD").ok(),
    );
    if credentials.is_none() {
        warn!("WHANOS_REGISTRY_USERNAME/WHANOS_REGISTRY_PASSWORD not set; assuming docker login was already performed");
    }
    credentials
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(_) => std::process::exit(exit::SUCCESS),
        Err(err) => {
            error!("fatal: {}: {}", err.kind(), err);
            if let Error::Descriptor(descriptor::Error::Invalid(violations)) = &err {
                for violation in violations {
                    error!("  {violation}");
                }
            }
            std::process::exit(err.exit_code())
        }
    }
}

fn run(args: Cli) -> Result<(), Error> {
    let settings = read_settings(args.settings.as_deref())?;

    match args.command {
        Commands::Detect { repo } => {
            let detection = language::detect(&repo, settings.detection.java_manifest)?;
            println!("{} {}", detection.language, detection.marker.display());
            Ok(())
        }
        Commands::Dockerfile { repo } => {
            let options = BuildOptions {
                skip_tests: true,
                ..Default::default()
            };
            let plan = orchestrator::prepare(&repo, &settings, &options)?;
            print!("{}", plan.dockerfile());
            Ok(())
        }
        Commands::Build {
            repo,
            image,
            registry,
            skip_tests,
            build_args,
            alias,
        } => {
            let alias = alias.map(|branch| image.branch_alias(&branch)).transpose()?;

            let registry = registry.map(|host| {
                if host != image.registry_host() {
                    warn!("Image {image} does not live on registry {host}");
                }
                RegistryTarget {
                    credentials: registry_credentials(),
                    host,
                }
            });
            let options = BuildOptions {
                skip_tests,
                registry,
                build_args,
                alias,
            };
            let outcome = orchestrator::run(&Docker::default(), &repo, &image, &settings, &options)?;
            info!(
                "Build complete: tested={} pushed={}",
                outcome.tested, outcome.pushed
            );
            println!("{}", outcome.image_reference);
            for alias in &outcome.aliases {
                println!("{alias}");
            }
            Ok(())
        }
        Commands::Render {
            config,
            image,
            app,
            domain,
            expose_mode,
            output_dir,
            dry_run,
        } => {
            let config = match config {
                Some(config) => config,
                None => descriptor::detect_descriptor(Path::new("."))?,
            };
            info!("Deployment descriptor: {}", config.display());

            let raw = descriptor::read_descriptor(&config)?;
            let overrides = descriptor::Overrides {
                exposure: expose_mode.map(ExposeMode::exposure),
                domain,
            };
            let validated = descriptor::validate(&app, &raw, &overrides)?;
            let set = manifest::render(
                &validated.app,
                &validated.descriptor,
                &image,
                &RenderOptions::from(&settings.render),
            )?;
            info!(
                "Rendered {} documents for namespace {} (sha256 {})",
                set.documents.len(),
                set.namespace,
                set.digest()?
            );

            if let Some(output_dir) = output_dir {
                set.write_to_dir(&output_dir)?;
                info!("Manifests written to {}", output_dir.display());
            } else if dry_run {
                print!("{}", set.to_yaml()?);
            } else {
                apply::apply(&set, &settings.apply)?;
            }
            Ok(())
        }
    }
}
