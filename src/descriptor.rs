//! Deployment descriptor (`whanos.yml`) parsing and validation.
//!
//! Validation walks the whole document and reports every problem at once.

use log::debug;
use regex::Regex;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

pub const DESCRIPTOR_CANDIDATES: [&str; 2] = ["whanos.yml", "whanos.yaml"];

const NAMESPACE_PREFIX: &str = "whanos-";
const MAX_LABEL_LENGTH: usize = 63;
const MAX_DOMAIN_LENGTH: usize = 253;

const DEPLOYMENT_KEYS: [&str; 5] = ["replicas", "resources", "ports", "exposure", "domain"];
const RESOURCE_KEYS: [&str; 2] = ["limits", "requests"];
const QUANTITY_KEYS: [&str; 2] = ["cpu", "memory"];

#[derive(Error, Debug)]
pub enum Error {
    #[error("no deployment descriptor in {dir}; expected one of: {}", DESCRIPTOR_CANDIDATES.join(", "))]
    NotFound { dir: String },

    #[error("read {path}: {err}")]
    ReadFile { err: std::io::Error, path: String },

    #[error("descriptor rejected: {}", describe(.0))]
    Invalid(Vec<Violation>),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } | Error::ReadFile { .. } => "DescriptorUnreadable",
            Error::Invalid(violations) => violations
                .iter()
                .map(|v| v.kind)
                .max_by_key(ViolationKind::rank)
                .unwrap_or(ViolationKind::MalformedDescriptor)
                .name(),
        }
    }
}

fn describe(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    MalformedDescriptor,
    InvalidPort,
    MissingDomain,
}

impl ViolationKind {
    pub fn name(&self) -> &'static str {
        match self {
            ViolationKind::MalformedDescriptor => "MalformedDescriptor",
            ViolationKind::InvalidPort => "InvalidPort",
            ViolationKind::MissingDomain => "MissingDomain",
        }
    }

    /// The most specific kind present names the whole rejection.
    fn rank(&self) -> u8 {
        match self {
            ViolationKind::MalformedDescriptor => 0,
            ViolationKind::MissingDomain => 1,
            ViolationKind::InvalidPort => 2,
        }
    }
}

/// One problem found in a descriptor, located by its field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub field: String,
    pub message: String,
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.kind.name(), self.field, self.message)
    }
}

#[derive(Default)]
struct Violations(Vec<Violation>);

impl Violations {
    fn push(&mut self, kind: ViolationKind, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(Violation {
            kind,
            field: field.into(),
            message: message.into(),
        });
    }

    fn malformed(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.push(ViolationKind::MalformedDescriptor, field, message)
    }

    fn reject_unknown_keys(&mut self, mapping: &Mapping, path: &str, allowed: &[&str]) {
        for key in mapping.keys() {
            match key.as_str() {
                Some(name) if allowed.contains(&name) => {}
                Some(name) => self.malformed(format!("{path}.{name}"), "unknown field"),
                None => self.malformed(path, format!("non-string key {key:?}")),
            }
        }
    }
}

/// How the application is reachable from outside the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exposure {
    #[default]
    Ingress,
    NodePort,
}

impl FromStr for Exposure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingress" => Ok(Exposure::Ingress),
            "nodeport" => Ok(Exposure::NodePort),
            other => Err(format!("unknown exposure {other:?}, expected ingress or nodeport")),
        }
    }
}

/// CPU and memory quantities, copied into the workload verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Quantities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Resources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<Quantities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<Quantities>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentDescriptor {
    pub replicas: u32,
    pub resources: Option<Resources>,
    /// Never empty. The first port is the primary one.
    pub ports: Vec<u16>,
    pub exposure: Exposure,
    /// Always present when `exposure` is [`Exposure::Ingress`].
    pub domain: Option<String>,
}

/// An application name usable in namespace, resource, and host names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppName(String);

impl AppName {
    pub fn new(name: &str) -> Result<Self, Violation> {
        let max = MAX_LABEL_LENGTH - NAMESPACE_PREFIX.len();
        let problem = if name.len() > max {
            Some(format!("{name:?} is longer than {max} characters"))
        } else if !dns_label().is_match(name) {
            Some(format!(
                "{name:?} must consist of lowercase letters, digits and '-', starting and ending with a letter or digit"
            ))
        } else {
            None
        };
        match problem {
            Some(message) => Err(Violation {
                kind: ViolationKind::MalformedDescriptor,
                field: "app".into(),
                message,
            }),
            None => Ok(Self(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace every resource of this application lives in.
    pub fn namespace(&self) -> String {
        format!("{NAMESPACE_PREFIX}{}", self.0)
    }
}

impl Display for AppName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Values given on the command line; they win over the descriptor's own.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub exposure: Option<Exposure>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validated {
    pub app: AppName,
    pub descriptor: DeploymentDescriptor,
}

fn dns_label() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("label pattern"))
}

fn dns_subdomain() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("subdomain pattern")
    })
}

fn quantity() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][-+]?[0-9]+|m|k|M|G|T|P|E|Ki|Mi|Gi|Ti|Pi|Ei)?$")
            .expect("quantity pattern")
    })
}

/// Find `whanos.yml` or `whanos.yaml` in `dir`.
pub fn detect_descriptor(dir: &Path) -> Result<PathBuf, Error> {
    DESCRIPTOR_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .inspect(|path| debug!("Descriptor candidate: {}", path.display()))
        .find(|path| path.is_file())
        .ok_or_else(|| Error::NotFound {
            dir: dir.display().to_string(),
        })
}

pub fn read_descriptor(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
        err,
        path: path.display().to_string(),
    })
}

/// Validate an application name together with its raw descriptor.
pub fn validate(app_name: &str, raw: &str, overrides: &Overrides) -> Result<Validated, Error> {
    let mut violations = Violations::default();

    let app = match AppName::new(app_name) {
        Ok(app) => Some(app),
        Err(violation) => {
            violations.0.push(violation);
            None
        }
    };

    let empty = Mapping::new();
    let document = match serde_yaml::from_str::<Value>(raw) {
        Ok(document) => Some(document),
        Err(err) => {
            violations.malformed("<document>", err.to_string());
            None
        }
    };
    let deployment = match document.as_ref() {
        None => &empty,
        Some(Value::Mapping(root)) => match root.get("deployment") {
            Some(Value::Mapping(deployment)) => {
                violations.reject_unknown_keys(deployment, "deployment", &DEPLOYMENT_KEYS);
                deployment
            }
            Some(_) => {
                violations.malformed("deployment", "must be a mapping");
                &empty
            }
            None => {
                violations.malformed("deployment", "missing section, nothing to deploy");
                &empty
            }
        },
        Some(_) => {
            violations.malformed("<document>", "root must be a mapping");
            &empty
        }
    };
    let parsed = document.is_some();

    let replicas = replicas(deployment.get("replicas"), &mut violations);
    let resources = resources(deployment.get("resources"), &mut violations);
    let ports = if parsed {
        ports(deployment.get("ports"), &mut violations)
    } else {
        Vec::new()
    };

    let exposure = match overrides.exposure {
        Some(exposure) => exposure,
        None => match deployment.get("exposure") {
            None | Some(Value::Null) => Exposure::default(),
            Some(Value::String(s)) => s.parse::<Exposure>().unwrap_or_else(|message| {
                violations.malformed("deployment.exposure", message);
                Exposure::default()
            }),
            Some(_) => {
                violations.malformed("deployment.exposure", "must be a string");
                Exposure::default()
            }
        },
    };

    let domain = match &overrides.domain {
        Some(domain) => Some(domain.clone()),
        None => match deployment.get("domain") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                violations.malformed("deployment.domain", "must be a string");
                None
            }
        },
    };
    if let Some(domain) = &domain {
        if domain.len() > MAX_DOMAIN_LENGTH || !dns_subdomain().is_match(domain) {
            violations.malformed("domain", format!("{domain:?} is not a valid DNS name"));
        }
    }
    if exposure == Exposure::Ingress && domain.is_none() {
        violations.push(
            ViolationKind::MissingDomain,
            "domain",
            "ingress exposure needs a domain",
        );
    }

    match app {
        Some(app) if violations.0.is_empty() => Ok(Validated {
            app,
            descriptor: DeploymentDescriptor {
                replicas,
                resources,
                ports,
                exposure,
                domain,
            },
        }),
        _ => Err(Error::Invalid(violations.0)),
    }
}

fn replicas(value: Option<&Value>, violations: &mut Violations) -> u32 {
    match value {
        None | Some(Value::Null) => 1,
        Some(value) => match value.as_u64() {
            Some(n) if n >= 1 && n <= u32::MAX as u64 => n as u32,
            _ => {
                violations.malformed("deployment.replicas", "must be a positive integer");
                1
            }
        },
    }
}

fn resources(value: Option<&Value>, violations: &mut Violations) -> Option<Resources> {
    let mapping = match value {
        None | Some(Value::Null) => return None,
        Some(Value::Mapping(mapping)) => mapping,
        Some(_) => {
            violations.malformed("deployment.resources", "must be a mapping");
            return None;
        }
    };
    violations.reject_unknown_keys(mapping, "deployment.resources", &RESOURCE_KEYS);
    Some(Resources {
        limits: quantities(mapping.get("limits"), "deployment.resources.limits", violations),
        requests: quantities(mapping.get("requests"), "deployment.resources.requests", violations),
    })
}

fn quantities(value: Option<&Value>, path: &str, violations: &mut Violations) -> Option<Quantities> {
    let mapping = match value {
        None | Some(Value::Null) => return None,
        Some(Value::Mapping(mapping)) => mapping,
        Some(_) => {
            violations.malformed(path, "must be a mapping");
            return None;
        }
    };
    violations.reject_unknown_keys(mapping, path, &QUANTITY_KEYS);

    let mut quantity_of = |key: &str| -> Option<String> {
        let field = format!("{path}.{key}");
        let text = match mapping.get(key)? {
            Value::Null => return None,
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => {
                violations.malformed(field, "must be a resource quantity");
                return None;
            }
        };
        if !quantity().is_match(&text) {
            violations.malformed(field, format!("{text:?} is not a resource quantity"));
            return None;
        }
        Some(text)
    };
    Some(Quantities {
        cpu: quantity_of("cpu"),
        memory: quantity_of("memory"),
    })
}

fn ports(value: Option<&Value>, violations: &mut Violations) -> Vec<u16> {
    let sequence = match value {
        None | Some(Value::Null) => {
            violations.malformed("deployment.ports", "required: a non-empty list of ports");
            return Vec::new();
        }
        Some(Value::Sequence(sequence)) => sequence,
        Some(_) => {
            violations.malformed("deployment.ports", "must be a list of integers");
            return Vec::new();
        }
    };
    if sequence.is_empty() {
        violations.malformed("deployment.ports", "must list at least one port");
    }

    let mut ports: Vec<u16> = Vec::with_capacity(sequence.len());
    for (index, item) in sequence.iter().enumerate() {
        let field = format!("deployment.ports[{index}]");
        match item.as_i64() {
            Some(port) if (1..=65535).contains(&port) => {
                let port = port as u16;
                match ports.iter().position(|&p| p == port) {
                    Some(first) => violations.push(
                        ViolationKind::InvalidPort,
                        field,
                        format!("{port} duplicates deployment.ports[{first}]"),
                    ),
                    None => ports.push(port),
                }
            }
            Some(port) => violations.push(
                ViolationKind::InvalidPort,
                field,
                format!("{port} is outside 1-65535"),
            ),
            None => violations.malformed(field, "must be an integer"),
        }
    }
    ports
}
