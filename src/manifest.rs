//! Kubernetes manifests for one application, rendered from a validated descriptor.
//!
//! Rendering is a pure function of its inputs. Maps are ordered, nothing is
//! timestamped, so the same input always yields the same bytes.

use crate::config;
use crate::descriptor::{AppName, DeploymentDescriptor, Exposure, Resources};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const MANAGED_BY: &str = "whanos";
const NAME_LABEL: &str = "app.kubernetes.io/name";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const APP_LABEL: &str = "whanos/app";

/// Verbs the deployer may use inside an application namespace.
pub const DEPLOYER_VERBS: [&str; 4] = ["create", "get", "update", "delete"];

/// Default `--service-node-port-range` of the API server.
pub const NODEPORT_RANGE: std::ops::RangeInclusive<u32> = 30000..=32767;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ingress exposure for {app} has no domain")]
    MissingDomain { app: String },

    #[error("{app} exposes no ports")]
    NoPorts { app: String },

    #[error("node ports {first}-{last} for {app} fall outside 30000-32767")]
    NodePortRange { app: String, first: u32, last: u32 },

    #[error("serialize {document}: {err}")]
    Serialize { err: serde_yaml::Error, document: String },

    #[error("write {path}: {err}")]
    WriteFile { err: std::io::Error, path: String },
}

/// How ingress hosts are laid out.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExposureStyle {
    /// One host per application: `<app>.<domain>`.
    #[default]
    Host,
    /// One shared host, one path per application: `<domain>/<app>`.
    Path,
}

/// A `<namespace>/<name>` service account.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct ServiceAccount {
    pub namespace: String,
    pub name: String,
}

impl FromStr for ServiceAccount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(format!("service account {s:?} must have the form <namespace>/<name>")),
        }
    }
}

impl TryFrom<String> for ServiceAccount {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Display for ServiceAccount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub exposure_style: ExposureStyle,
    /// First pinned node port. Unset lets the cluster allocate them.
    pub nodeport_base: Option<u16>,
    pub deployer: ServiceAccount,
    pub tls_secret: Option<String>,
    pub image_pull_policy: String,
}

impl From<&config::Render> for RenderOptions {
    fn from(render: &config::Render) -> Self {
        Self {
            exposure_style: render.exposure_style,
            nodeport_base: render.nodeport_base,
            deployer: render.deployer_service_account.clone(),
            tls_secret: render.tls_secret.clone(),
            image_pull_policy: render.image_pull_policy.clone(),
        }
    }
}

type Labels = BTreeMap<String, String>;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub replicas: u32,
    pub selector: LabelSelector,
    pub template: PodTemplate,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    pub match_labels: Labels,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PodTemplate {
    pub metadata: PodMeta,
    pub spec: PodSpec,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PodMeta {
    pub labels: Labels,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PodSpec {
    pub containers: Vec<Container>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub image_pull_policy: String,
    pub ports: Vec<ContainerPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    pub readiness_probe: Probe,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u16,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    pub tcp_socket: TcpSocket,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TcpSocket {
    pub port: u16,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub selector: Labels,
    #[serde(rename = "type")]
    pub service_type: &'static str,
    pub ports: Vec<ServicePort>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub protocol: &'static str,
    pub port: u16,
    pub target_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u32>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub spec: IngressSpec,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct IngressSpec {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTls>,
    pub rules: Vec<IngressRule>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    pub hosts: Vec<String>,
    pub secret_name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct IngressRule {
    pub host: String,
    pub http: HttpRule,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HttpRule {
    pub paths: Vec<HttpPath>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpPath {
    pub path: String,
    pub path_type: &'static str,
    pub backend: Backend,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Backend {
    pub service: ServiceBackend,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ServiceBackend {
    pub name: String,
    pub port: PortNumber,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PortNumber {
    pub number: u16,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub rules: Vec<PolicyRule>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub api_groups: Vec<&'static str>,
    pub resources: Vec<&'static str>,
    pub verbs: Vec<&'static str>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub metadata: ObjectMeta,
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Subject {
    pub kind: &'static str,
    pub name: String,
    pub namespace: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    pub api_group: &'static str,
    pub kind: &'static str,
    pub name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Document {
    Namespace(Namespace),
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
    Role(Role),
    RoleBinding(RoleBinding),
}

impl Document {
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Namespace(d) => d.kind,
            Document::Deployment(d) => d.kind,
            Document::Service(d) => d.kind,
            Document::Ingress(d) => d.kind,
            Document::Role(d) => d.kind,
            Document::RoleBinding(d) => d.kind,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Document::Namespace(d) => &d.metadata,
            Document::Deployment(d) => &d.metadata,
            Document::Service(d) => &d.metadata,
            Document::Ingress(d) => &d.metadata,
            Document::Role(d) => &d.metadata,
            Document::RoleBinding(d) => &d.metadata,
        }
    }

    /// File name used when writing the set to a directory.
    pub fn file_name(&self) -> String {
        format!("{}.yaml", self.kind().to_lowercase())
    }
}

/// Everything one application needs in the cluster, in apply order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedManifestSet {
    pub app: String,
    pub namespace: String,
    pub documents: Vec<Document>,
}

impl RenderedManifestSet {
    /// All documents as a single multi-document YAML stream.
    pub fn to_yaml(&self) -> Result<String, Error> {
        let mut out = String::new();
        for document in &self.documents {
            out.push_str("---\n");
            out.push_str(&serialize(document)?);
        }
        Ok(out)
    }

    /// SHA-256 of [`Self::to_yaml`].
    pub fn digest(&self) -> Result<String, Error> {
        Ok(sha256::digest(self.to_yaml()?))
    }

    pub fn find(&self, kind: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.kind() == kind)
    }

    /// Write one file per document into `dir`, creating it if needed.
    pub fn write_to_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, Error> {
        let write_error = |err, path: &Path| Error::WriteFile {
            err,
            path: path.display().to_string(),
        };
        std::fs::create_dir_all(dir).map_err(|err| write_error(err, dir))?;
        self.documents
            .iter()
            .map(|document| -> Result<PathBuf, Error> {
                let path = dir.join(document.file_name());
                std::fs::write(&path, serialize(document)?).map_err(|err| write_error(err, &path))?;
                debug!("Wrote {}", path.display());
                Ok(path)
            })
            .collect()
    }
}

fn serialize(document: &Document) -> Result<String, Error> {
    serde_yaml::to_string(document).map_err(|err| Error::Serialize {
        err,
        document: format!("{} {}", document.kind(), document.metadata().name),
    })
}

fn common_labels(app: &AppName) -> Labels {
    BTreeMap::from([
        (NAME_LABEL.to_string(), app.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

fn selector(app: &AppName) -> Labels {
    BTreeMap::from([(NAME_LABEL.to_string(), app.to_string())])
}

fn meta(name: String, namespace: &str, labels: Labels) -> ObjectMeta {
    ObjectMeta {
        name,
        namespace: Some(namespace.to_string()),
        labels,
        annotations: BTreeMap::new(),
    }
}

fn port_name(port: u16) -> String {
    format!("tcp-{port}")
}

/// Render the manifest set for `app` running `image`.
///
/// `image` is used verbatim. The descriptor must have passed validation; the
/// errors returned here only guard against descriptors built by hand.
pub fn render(
    app: &AppName,
    descriptor: &DeploymentDescriptor,
    image: &str,
    options: &RenderOptions,
) -> Result<RenderedManifestSet, Error> {
    let primary_port = *descriptor.ports.first().ok_or_else(|| Error::NoPorts {
        app: app.to_string(),
    })?;
    if descriptor.exposure == Exposure::NodePort {
        check_node_ports(app, descriptor, options)?;
    }
    let namespace = app.namespace();
    let labels = common_labels(app);

    let mut documents = vec![
        Document::Namespace(Namespace {
            api_version: "v1",
            kind: "Namespace",
            metadata: ObjectMeta {
                name: namespace.clone(),
                namespace: None,
                labels: BTreeMap::from([
                    (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
                    (APP_LABEL.to_string(), app.to_string()),
                ]),
                annotations: BTreeMap::new(),
            },
        }),
        Document::Deployment(deployment(app, &namespace, descriptor, image, primary_port, options)),
        Document::Service(service(app, &namespace, descriptor, options)),
    ];

    if descriptor.exposure == Exposure::Ingress {
        let domain = descriptor.domain.as_deref().ok_or_else(|| Error::MissingDomain {
            app: app.to_string(),
        })?;
        documents.push(Document::Ingress(ingress(app, &namespace, domain, primary_port, options)));
    }

    documents.push(Document::Role(Role {
        api_version: "rbac.authorization.k8s.io/v1",
        kind: "Role",
        metadata: meta(format!("{app}-deployer"), &namespace, labels.clone()),
        rules: vec![
            PolicyRule {
                api_groups: vec!["apps"],
                resources: vec!["deployments"],
                verbs: DEPLOYER_VERBS.to_vec(),
            },
            PolicyRule {
                api_groups: vec![""],
                resources: vec!["services"],
                verbs: DEPLOYER_VERBS.to_vec(),
            },
            PolicyRule {
                api_groups: vec!["networking.k8s.io"],
                resources: vec!["ingresses"],
                verbs: DEPLOYER_VERBS.to_vec(),
            },
        ],
    }));
    documents.push(Document::RoleBinding(RoleBinding {
        api_version: "rbac.authorization.k8s.io/v1",
        kind: "RoleBinding",
        metadata: meta(format!("{app}-deployer-binding"), &namespace, labels),
        subjects: vec![Subject {
            kind: "ServiceAccount",
            name: options.deployer.name.clone(),
            namespace: options.deployer.namespace.clone(),
        }],
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io",
            kind: "Role",
            name: format!("{app}-deployer"),
        },
    }));

    Ok(RenderedManifestSet {
        app: app.to_string(),
        namespace,
        documents,
    })
}

fn deployment(
    app: &AppName,
    namespace: &str,
    descriptor: &DeploymentDescriptor,
    image: &str,
    primary_port: u16,
    options: &RenderOptions,
) -> Deployment {
    Deployment {
        api_version: "apps/v1",
        kind: "Deployment",
        metadata: meta(app.to_string(), namespace, common_labels(app)),
        spec: DeploymentSpec {
            replicas: descriptor.replicas,
            selector: LabelSelector {
                match_labels: selector(app),
            },
            template: PodTemplate {
                metadata: PodMeta {
                    labels: common_labels(app),
                },
                spec: PodSpec {
                    containers: vec![Container {
                        name: app.to_string(),
                        image: image.to_string(),
                        image_pull_policy: options.image_pull_policy.clone(),
                        ports: descriptor
                            .ports
                            .iter()
                            .map(|&port| ContainerPort {
                                name: port_name(port),
                                container_port: port,
                            })
                            .collect(),
                        resources: descriptor.resources.clone(),
                        readiness_probe: Probe {
                            tcp_socket: TcpSocket { port: primary_port },
                        },
                    }],
                },
            },
        },
    }
}

fn check_node_ports(app: &AppName, descriptor: &DeploymentDescriptor, options: &RenderOptions) -> Result<(), Error> {
    let Some(base) = options.nodeport_base else {
        return Ok(());
    };
    let first = u32::from(base);
    let last = first + descriptor.ports.len().saturating_sub(1) as u32;
    if NODEPORT_RANGE.contains(&first) && NODEPORT_RANGE.contains(&last) {
        Ok(())
    } else {
        Err(Error::NodePortRange {
            app: app.to_string(),
            first,
            last,
        })
    }
}

fn service(
    app: &AppName,
    namespace: &str,
    descriptor: &DeploymentDescriptor,
    options: &RenderOptions,
) -> Service {
    let node_port = descriptor.exposure == Exposure::NodePort;
    Service {
        api_version: "v1",
        kind: "Service",
        metadata: meta(app.to_string(), namespace, common_labels(app)),
        spec: ServiceSpec {
            selector: selector(app),
            service_type: if node_port { "NodePort" } else { "ClusterIP" },
            ports: descriptor
                .ports
                .iter()
                .enumerate()
                .map(|(index, &port)| ServicePort {
                    name: port_name(port),
                    protocol: "TCP",
                    port,
                    target_port: port,
                    node_port: options
                        .nodeport_base
                        .filter(|_| node_port)
                        .map(|base| u32::from(base) + index as u32),
                })
                .collect(),
        },
    }
}

fn ingress(
    app: &AppName,
    namespace: &str,
    domain: &str,
    primary_port: u16,
    options: &RenderOptions,
) -> Ingress {
    let mut annotations = BTreeMap::from([(
        "nginx.ingress.kubernetes.io/backend-protocol".to_string(),
        "HTTP".to_string(),
    )]);
    let (host, path, path_type) = match options.exposure_style {
        ExposureStyle::Host => (format!("{app}.{domain}"), "/".to_string(), "Prefix"),
        ExposureStyle::Path => {
            annotations.insert("nginx.ingress.kubernetes.io/use-regex".into(), "true".into());
            annotations.insert("nginx.ingress.kubernetes.io/rewrite-target".into(), "/$2".into());
            (domain.to_string(), format!("/{app}(/|$)(.*)"), "ImplementationSpecific")
        }
    };

    let mut metadata = meta(format!("{app}-ingress"), namespace, common_labels(app));
    metadata.annotations = annotations;

    Ingress {
        api_version: "networking.k8s.io/v1",
        kind: "Ingress",
        metadata,
        spec: IngressSpec {
            tls: options
                .tls_secret
                .iter()
                .map(|secret| IngressTls {
                    hosts: vec![host.clone()],
                    secret_name: secret.clone(),
                })
                .collect(),
            rules: vec![IngressRule {
                host,
                http: HttpRule {
                    paths: vec![HttpPath {
                        path,
                        path_type,
                        backend: Backend {
                            service: ServiceBackend {
                                name: app.to_string(),
                                port: PortNumber { number: primary_port },
                            },
                        },
                    }],
                },
            }],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{self, Quantities};

    fn options() -> RenderOptions {
        RenderOptions::from(&config::Settings::default().render)
    }

    fn demo() -> (AppName, DeploymentDescriptor) {
        let validated = descriptor::validate(
            "demo",
            "deployment:\n  replicas: 2\n  ports: [8080]\n",
            &descriptor::Overrides {
                exposure: Some(Exposure::Ingress),
                domain: Some("apps.example.com".into()),
            },
        )
        .unwrap();
        (validated.app, validated.descriptor)
    }

    const IMAGE: &str = "registry.example.com/whanos/demo:abc1234";

    #[test]
    fn ingress_scenario() {
        let (app, descriptor) = demo();
        let set = render(&app, &descriptor, IMAGE, &options()).unwrap();

        let kinds: Vec<&str> = set.documents.iter().map(Document::kind).collect();
        assert_eq!(
            kinds,
            vec!["Namespace", "Deployment", "Service", "Ingress", "Role", "RoleBinding"]
        );
        assert_eq!(set.namespace, "whanos-demo");
        assert!(set
            .documents
            .iter()
            .skip(1)
            .all(|d| d.metadata().namespace.as_deref() == Some("whanos-demo")));
        assert_eq!(set.documents[0].metadata().name, "whanos-demo");

        let Some(Document::Deployment(deployment)) = set.find("Deployment") else {
            panic!("no deployment");
        };
        assert_eq!(deployment.spec.replicas, 2);
        let container = &deployment.spec.template.spec.containers[0];
        assert_eq!(container.image, IMAGE);
        assert_eq!(container.ports[0].container_port, 8080);
        assert_eq!(container.resources, None);

        let Some(Document::Ingress(ingress)) = set.find("Ingress") else {
            panic!("no ingress");
        };
        let rule = &ingress.spec.rules[0];
        assert_eq!(rule.host, "demo.apps.example.com");
        assert_eq!(rule.http.paths[0].backend.service.name, "demo");
        assert_eq!(rule.http.paths[0].backend.service.port.number, 8080);
        assert!(ingress.spec.tls.is_empty());

        let Some(Document::Service(service)) = set.find("Service") else {
            panic!("no service");
        };
        assert_eq!(service.spec.service_type, "ClusterIP");
    }

    #[test]
    fn rendering_is_reproducible() {
        let (app, descriptor) = demo();
        let first = render(&app, &descriptor, IMAGE, &options()).unwrap();
        let second = render(&app, &descriptor, IMAGE, &options()).unwrap();
        assert_eq!(first.to_yaml().unwrap(), second.to_yaml().unwrap());
        assert_eq!(first.digest().unwrap(), second.digest().unwrap());
    }

    #[test]
    fn nodeport_replaces_ingress() {
        let (app, mut descriptor) = demo();
        descriptor.exposure = Exposure::NodePort;
        descriptor.ports = vec![8080, 9090];
        let set = render(&app, &descriptor, IMAGE, &options()).unwrap();
        assert!(set.find("Ingress").is_none());

        let Some(Document::Service(service)) = set.find("Service") else {
            panic!("no service");
        };
        assert_eq!(service.spec.service_type, "NodePort");
        let node_ports: Vec<Option<u32>> = service.spec.ports.iter().map(|p| p.node_port).collect();
        assert_eq!(node_ports, vec![None, None]);
        assert!(!set.to_yaml().unwrap().contains("nodePort"));
    }

    fn nodeport_app(name: &str) -> (AppName, DeploymentDescriptor) {
        let validated = descriptor::validate(
            name,
            "deployment:\n  ports: [8080, 9090]\n  exposure: nodeport\n",
            &descriptor::Overrides::default(),
        )
        .unwrap();
        (validated.app, validated.descriptor)
    }

    fn node_ports(set: &RenderedManifestSet) -> Vec<Option<u32>> {
        let Some(Document::Service(service)) = set.find("Service") else {
            panic!("no service");
        };
        service.spec.ports.iter().map(|p| p.node_port).collect()
    }

    #[test]
    fn two_nodeport_apps_do_not_claim_the_same_port() {
        let (alpha, alpha_descriptor) = nodeport_app("alpha");
        let (beta, beta_descriptor) = nodeport_app("beta");
        let alpha = render(&alpha, &alpha_descriptor, IMAGE, &options()).unwrap();
        let beta = render(&beta, &beta_descriptor, IMAGE, &options()).unwrap();

        assert_eq!(node_ports(&alpha), vec![None, None]);
        assert_eq!(node_ports(&beta), vec![None, None]);
    }

    #[test]
    fn pinned_node_ports_count_up_from_the_base() {
        let (app, descriptor) = nodeport_app("alpha");
        let mut options = options();
        options.nodeport_base = Some(31000);
        let set = render(&app, &descriptor, IMAGE, &options).unwrap();
        assert_eq!(node_ports(&set), vec![Some(31000), Some(31001)]);
    }

    #[test]
    fn pinned_node_ports_must_stay_in_range() {
        let (app, descriptor) = nodeport_app("alpha");
        let mut options = options();

        options.nodeport_base = Some(32767);
        let err = render(&app, &descriptor, IMAGE, &options).unwrap_err();
        assert!(matches!(err, Error::NodePortRange { first: 32767, last: 32768, .. }));

        options.nodeport_base = Some(8080);
        let err = render(&app, &descriptor, IMAGE, &options).unwrap_err();
        assert!(matches!(err, Error::NodePortRange { first: 8080, .. }));

        options.nodeport_base = Some(32766);
        assert!(render(&app, &descriptor, IMAGE, &options).is_ok());
    }

    #[test]
    fn ingress_never_has_node_ports() {
        let (app, descriptor) = demo();
        let set = render(&app, &descriptor, IMAGE, &options()).unwrap();
        let yaml = set.to_yaml().unwrap();
        assert!(yaml.contains("kind: Ingress"));
        assert!(!yaml.contains("NodePort"));
        assert!(!yaml.contains("nodePort"));
    }

    #[test]
    fn resources_are_copied_verbatim() {
        let (app, mut descriptor) = demo();
        descriptor.resources = Some(Resources {
            limits: Some(Quantities {
                cpu: Some("500m".into()),
                memory: Some("128Mi".into()),
            }),
            requests: None,
        });
        let set = render(&app, &descriptor, IMAGE, &options()).unwrap();
        let Some(Document::Deployment(deployment)) = set.find("Deployment") else {
            panic!("no deployment");
        };
        assert_eq!(deployment.spec.template.spec.containers[0].resources, descriptor.resources);

        let yaml = serialize(set.find("Deployment").unwrap()).unwrap();
        assert!(yaml.contains("resources:\n"));
        assert!(yaml.contains("cpu: 500m\n"));
        assert!(!yaml.contains("requests"));
    }

    #[test]
    fn access_binding_is_namespace_scoped() {
        let (app, descriptor) = demo();
        let set = render(&app, &descriptor, IMAGE, &options()).unwrap();

        let Some(Document::Role(role)) = set.find("Role") else {
            panic!("no role");
        };
        let resources: Vec<&str> = role.rules.iter().flat_map(|r| r.resources.clone()).collect();
        assert_eq!(resources, vec!["deployments", "services", "ingresses"]);
        assert!(role.rules.iter().all(|r| r.verbs == DEPLOYER_VERBS.to_vec()));

        let Some(Document::RoleBinding(binding)) = set.find("RoleBinding") else {
            panic!("no binding");
        };
        assert_eq!(binding.metadata.namespace.as_deref(), Some("whanos-demo"));
        assert_eq!(binding.role_ref.kind, "Role");
        assert_eq!(binding.role_ref.name, "demo-deployer");
        assert_eq!(binding.subjects[0].name, "whanos-deployer");
        assert_eq!(binding.subjects[0].namespace, "jenkins");

        let yaml = set.to_yaml().unwrap();
        assert!(!yaml.contains("ClusterRole"));
    }

    #[test]
    fn path_style_and_tls() {
        let (app, descriptor) = demo();
        let mut options = options();
        options.exposure_style = ExposureStyle::Path;
        options.tls_secret = Some("apps-tls".into());
        let set = render(&app, &descriptor, IMAGE, &options).unwrap();
        let Some(Document::Ingress(ingress)) = set.find("Ingress") else {
            panic!("no ingress");
        };
        assert_eq!(ingress.spec.rules[0].host, "apps.example.com");
        assert_eq!(ingress.spec.rules[0].http.paths[0].path, "/demo(/|$)(.*)");
        assert_eq!(ingress.spec.tls[0].hosts, vec!["apps.example.com".to_string()]);
        assert_eq!(ingress.spec.tls[0].secret_name, "apps-tls");
        assert_eq!(
            ingress.metadata.annotations.get("nginx.ingress.kubernetes.io/rewrite-target").map(String::as_str),
            Some("/$2")
        );
    }

    #[test]
    fn yaml_layout() {
        let (app, descriptor) = demo();
        let set = render(&app, &descriptor, IMAGE, &options()).unwrap();
        let yaml = set.to_yaml().unwrap();
        assert!(yaml.starts_with(
            "---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: whanos-demo\n  labels:\n    app.kubernetes.io/managed-by: whanos\n    whanos/app: demo\n"
        ));
        assert_eq!(yaml.matches("---\n").count(), 6);
    }

    #[test]
    fn write_one_file_per_document() {
        let (app, descriptor) = demo();
        let set = render(&app, &descriptor, IMAGE, &options()).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("manifests");
        let written = set.write_to_dir(&out).unwrap();
        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "namespace.yaml",
                "deployment.yaml",
                "service.yaml",
                "ingress.yaml",
                "role.yaml",
                "rolebinding.yaml",
            ]
        );
        let namespace = std::fs::read_to_string(out.join("namespace.yaml")).unwrap();
        assert!(namespace.contains("name: whanos-demo"));
    }

    #[test]
    fn hand_built_descriptor_without_domain_is_refused() {
        let (app, mut descriptor) = demo();
        descriptor.domain = None;
        assert!(matches!(
            render(&app, &descriptor, IMAGE, &options()),
            Err(Error::MissingDomain { .. })
        ));
    }

    #[test]
    fn service_account_parsing() {
        let account: ServiceAccount = "ci/deployer".parse().unwrap();
        assert_eq!(account.namespace, "ci");
        assert_eq!(account.to_string(), "ci/deployer");
        assert!("deployer".parse::<ServiceAccount>().is_err());
        assert!("/deployer".parse::<ServiceAccount>().is_err());
        assert!("a/b/c".parse::<ServiceAccount>().is_err());
    }
}
