//! Execution unit construction.
//!
//! A run executes as one pod with two containers: the certification suite
//! and a harvester side-process that waits for the suite's claim file. The
//! pod starts from a fixed template and is completed by an ordered list of
//! [`PodMutation`]s; later mutations may rely on containers the template (or
//! an earlier mutation) provides, and fail loudly when they are missing.

pub mod definitions;

use thiserror::Error;

use crate::cluster::objects::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, OwnerReference, Pod, PodSpec,
    SecretVolumeSource, Volume, VolumeMount,
};
use crate::crd::CertSuiteRun;
use self::definitions as defs;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The template lacks a container a mutation has to modify.
    #[error("container {container} not found in pod {pod} (needed to apply {mutation})")]
    MissingContainer {
        container: &'static str,
        pod: String,
        mutation: &'static str,
    },
}

// ---------------------------------------------------------------------------
// PodMutation
// ---------------------------------------------------------------------------

/// One step of execution-unit construction.
#[derive(Debug, Clone, PartialEq)]
pub enum PodMutation {
    Name(String),
    Namespace(String),
    /// Tell the harvester which run it reports into.
    RunName(String),
    LabelsFilter(String),
    LogLevel(String),
    Timeout(String),
    ConfigMap(String),
    /// Preflight credentials; `None` leaves the pod untouched.
    PreflightSecret(Option<String>),
    SidecarImage(String),
    RunnerImage(String),
    DataCollection(bool),
    Owner(OwnerReference),
}

impl PodMutation {
    fn label(&self) -> &'static str {
        match self {
            PodMutation::Name(_) => "name",
            PodMutation::Namespace(_) => "namespace",
            PodMutation::RunName(_) => "run name",
            PodMutation::LabelsFilter(_) => "labels filter",
            PodMutation::LogLevel(_) => "log level",
            PodMutation::Timeout(_) => "timeout",
            PodMutation::ConfigMap(_) => "config map",
            PodMutation::PreflightSecret(_) => "preflight secret",
            PodMutation::SidecarImage(_) => "sidecar image",
            PodMutation::RunnerImage(_) => "runner image",
            PodMutation::DataCollection(_) => "data collection",
            PodMutation::Owner(_) => "owner reference",
        }
    }

    /// Apply this step to `pod`.
    pub fn apply(&self, pod: &mut Pod) -> Result<(), BuildError> {
        match self {
            PodMutation::Name(name) => pod.metadata.name = name.clone(),
            PodMutation::Namespace(ns) => pod.metadata.namespace = ns.clone(),
            PodMutation::RunName(run) => {
                self.sidecar(pod)?
                    .env
                    .push(EnvVar::value(defs::RUN_NAME_ENV_VAR, run));
            }
            PodMutation::LabelsFilter(filter) => {
                self.certsuite(pod)?
                    .args
                    .extend(["-l".to_string(), filter.clone()]);
            }
            PodMutation::LogLevel(level) => {
                self.certsuite(pod)?
                    .args
                    .extend(["--log-level".to_string(), level.clone()]);
            }
            PodMutation::Timeout(timeout) => {
                self.certsuite(pod)?
                    .args
                    .extend(["--timeout".to_string(), timeout.clone()]);
            }
            PodMutation::ConfigMap(name) => {
                pod.spec.volumes.push(Volume {
                    name: defs::CONFIG_VOLUME.to_string(),
                    config_map: Some(ConfigMapVolumeSource { name: name.clone() }),
                    ..Volume::default()
                });
            }
            PodMutation::PreflightSecret(None) => {}
            PodMutation::PreflightSecret(Some(secret)) => {
                self.certsuite(pod)?.volume_mounts.push(VolumeMount {
                    name: defs::PREFLIGHT_VOLUME.to_string(),
                    mount_path: defs::PREFLIGHT_CONFIG_FOLDER.to_string(),
                    read_only: true,
                });
                pod.spec.volumes.push(Volume {
                    name: defs::PREFLIGHT_VOLUME.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: secret.clone(),
                    }),
                    ..Volume::default()
                });
            }
            PodMutation::SidecarImage(image) => self.sidecar(pod)?.image = image.clone(),
            PodMutation::RunnerImage(image) => self.certsuite(pod)?.image = image.clone(),
            PodMutation::DataCollection(enabled) => {
                self.certsuite(pod)?
                    .args
                    .extend(["--enable-data-collection".to_string(), enabled.to_string()]);
            }
            PodMutation::Owner(owner) => pod.metadata.owner_references = vec![owner.clone()],
        }
        Ok(())
    }

    fn sidecar<'p>(&self, pod: &'p mut Pod) -> Result<&'p mut Container, BuildError> {
        self.container(pod, defs::SIDECAR_CONTAINER_NAME)
    }

    fn certsuite<'p>(&self, pod: &'p mut Pod) -> Result<&'p mut Container, BuildError> {
        self.container(pod, defs::CERTSUITE_CONTAINER_NAME)
    }

    fn container<'p>(
        &self,
        pod: &'p mut Pod,
        container: &'static str,
    ) -> Result<&'p mut Container, BuildError> {
        let pod_name = pod.metadata.name.clone();
        pod.container_mut(container)
            .ok_or(BuildError::MissingContainer {
                container,
                pod: pod_name,
                mutation: self.label(),
            })
    }
}

// ---------------------------------------------------------------------------
// JobPodBuilder
// ---------------------------------------------------------------------------

/// Collects mutations in order and applies them to a template on `build()`.
#[derive(Debug, Clone)]
pub struct JobPodBuilder {
    template: Pod,
    mutations: Vec<PodMutation>,
}

impl Default for JobPodBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl JobPodBuilder {
    /// Builder over the standard two-container template.
    pub fn new() -> Self {
        Self::with_template(base_template())
    }

    pub fn with_template(template: Pod) -> Self {
        Self {
            template,
            mutations: Vec::new(),
        }
    }

    /// Builder pre-loaded with every mutation a run needs, in the order the
    /// controller applies them.
    pub fn for_run(run: &CertSuiteRun, pod_name: &str, sidecar_image: &str, runner_image: &str) -> Self {
        Self::new()
            .name(pod_name)
            .namespace(&run.metadata.namespace)
            .run_name(&run.metadata.name)
            .labels_filter(&run.spec.labels_filter)
            .log_level(&run.spec.log_level)
            .timeout(&run.spec.timeout)
            .config_map(&run.spec.config_map_name)
            .preflight_secret(run.spec.preflight_secret_name.as_deref())
            .sidecar_image(sidecar_image)
            .runner_image(runner_image)
            .data_collection(run.spec.enable_data_collection)
            .owner(run.owner_reference())
    }

    pub fn mutate(mut self, mutation: PodMutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn name(self, name: &str) -> Self {
        self.mutate(PodMutation::Name(name.to_string()))
    }

    pub fn namespace(self, namespace: &str) -> Self {
        self.mutate(PodMutation::Namespace(namespace.to_string()))
    }

    pub fn run_name(self, run: &str) -> Self {
        self.mutate(PodMutation::RunName(run.to_string()))
    }

    pub fn labels_filter(self, filter: &str) -> Self {
        self.mutate(PodMutation::LabelsFilter(filter.to_string()))
    }

    pub fn log_level(self, level: &str) -> Self {
        self.mutate(PodMutation::LogLevel(level.to_string()))
    }

    pub fn timeout(self, timeout: &str) -> Self {
        self.mutate(PodMutation::Timeout(timeout.to_string()))
    }

    pub fn config_map(self, name: &str) -> Self {
        self.mutate(PodMutation::ConfigMap(name.to_string()))
    }

    pub fn preflight_secret(self, secret: Option<&str>) -> Self {
        self.mutate(PodMutation::PreflightSecret(secret.map(str::to_string)))
    }

    pub fn sidecar_image(self, image: &str) -> Self {
        self.mutate(PodMutation::SidecarImage(image.to_string()))
    }

    pub fn runner_image(self, image: &str) -> Self {
        self.mutate(PodMutation::RunnerImage(image.to_string()))
    }

    pub fn data_collection(self, enabled: bool) -> Self {
        self.mutate(PodMutation::DataCollection(enabled))
    }

    pub fn owner(self, owner: OwnerReference) -> Self {
        self.mutate(PodMutation::Owner(owner))
    }

    /// Apply all mutations in insertion order. The first failure aborts.
    pub fn build(self) -> Result<Pod, BuildError> {
        let mut pod = self.template;
        for mutation in &self.mutations {
            mutation.apply(&mut pod)?;
        }
        Ok(pod)
    }
}

/// The fixed part of every execution unit.
pub fn base_template() -> Pod {
    let sidecar = Container {
        name: defs::SIDECAR_CONTAINER_NAME.to_string(),
        env: vec![
            EnvVar::field_ref(defs::POD_NAME_ENV_VAR, "metadata.name"),
            EnvVar::field_ref(defs::POD_NAMESPACE_ENV_VAR, "metadata.namespace"),
            EnvVar::value(defs::RESULTS_FOLDER_ENV_VAR, defs::RESULTS_FOLDER),
        ],
        image_pull_policy: "IfNotPresent".to_string(),
        volume_mounts: vec![VolumeMount {
            name: defs::OUTPUT_VOLUME.to_string(),
            mount_path: defs::RESULTS_FOLDER.to_string(),
            read_only: true,
        }],
        ..Container::default()
    };

    let certsuite = Container {
        name: defs::CERTSUITE_CONTAINER_NAME.to_string(),
        command: vec!["certsuite".to_string()],
        args: [
            "run",
            "-o",
            defs::RESULTS_FOLDER,
            "-c",
            defs::CONFIG_FILE_PATH,
            "--preflight-dockerconfig",
            defs::PREFLIGHT_DOCKERCONFIG_PATH,
            "--non-intrusive",
            "true",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        image_pull_policy: "Always".to_string(),
        volume_mounts: vec![
            VolumeMount {
                name: defs::OUTPUT_VOLUME.to_string(),
                mount_path: defs::RESULTS_FOLDER.to_string(),
                read_only: false,
            },
            VolumeMount {
                name: defs::CONFIG_VOLUME.to_string(),
                mount_path: defs::CONFIG_FOLDER.to_string(),
                read_only: true,
            },
        ],
        ..Container::default()
    };

    Pod {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        spec: PodSpec {
            service_account_name: defs::CLUSTER_ACCESS_SERVICE_ACCOUNT.to_string(),
            restart_policy: "Never".to_string(),
            containers: vec![sidecar, certsuite],
            volumes: vec![Volume {
                name: defs::OUTPUT_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource {}),
                ..Volume::default()
            }],
        },
        ..Pod::default()
    }
}
