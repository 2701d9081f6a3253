//! Single-node cluster and local registry lifecycle.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_manifest::{ClusterParams, ImageCachingMethod, RegistryParams};
use serde::Deserialize;
use tracing::info;

use crate::tool::Tool;

/// containerd image store inside the node.
const NODE_IMAGE_STORE: &str = "/var/lib/rancher/k3s/agent/containerd";

/// Port the registry listens on inside its container.
const REGISTRY_CONTAINER_PORT: u16 = 5000;

/// Everything needed to create the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSpec {
    pub node_image: String,
    /// Helper image the cluster manager runs for offline setup.
    pub tools_image: String,
    pub params: ClusterParams,
    pub data_dir: PathBuf,
    /// Upstream registries the node resolves through the local registry.
    pub mirrored_registries: Vec<String>,
}

/// Cluster manager operations.
#[async_trait]
pub trait ClusterManager: Send + Sync {
    async fn exists(&self) -> Result<bool>;

    async fn is_running(&self) -> Result<bool>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn create(&self, spec: &ClusterSpec) -> Result<()>;

    async fn delete(&self) -> Result<()>;

    /// Kubeconfig contents for the cluster.
    async fn kubeconfig(&self) -> Result<String>;

    async fn registry_exists(&self) -> Result<bool>;

    async fn create_registry(&self, image: &str, params: &RegistryParams) -> Result<()>;

    async fn delete_registry(&self) -> Result<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterListing {
    name: String,
    #[serde(default)]
    servers_running: u32,
    #[serde(default)]
    servers_count: u32,
}

#[derive(Deserialize)]
struct RegistryListing {
    name: String,
}

/// [`ClusterManager`] backed by the `k3d` CLI.
#[derive(Debug, Clone)]
pub struct K3dCli {
    k3d: Tool,
    docker: Tool,
    name: String,
    registry_name: String,
}

impl K3dCli {
    pub fn new(cluster_name: &str) -> Self {
        Self {
            k3d: Tool::new("k3d"),
            docker: Tool::new("docker"),
            name: cluster_name.to_string(),
            registry_name: format!("{cluster_name}-registry"),
        }
    }

    /// Container name k3d gives the registry.
    pub fn registry_container(&self) -> String {
        format!("k3d-{}", self.registry_name)
    }

    fn server_container(&self) -> String {
        format!("k3d-{}-server-0", self.name)
    }

    async fn listing(&self) -> Result<Option<ClusterListing>> {
        let out = self.k3d.run(&["cluster", "list", "-o", "json"]).await?;
        let clusters: Vec<ClusterListing> =
            serde_json::from_str(&out).context("failed to parse k3d cluster list")?;
        Ok(clusters.into_iter().find(|c| c.name == self.name))
    }

    /// Arguments for `k3d cluster create`.
    pub fn create_args(&self, spec: &ClusterSpec, registries_file: Option<&Path>) -> Vec<String> {
        let params = &spec.params;
        let mut args = vec![
            "cluster".to_string(),
            "create".to_string(),
            self.name.clone(),
            "--image".to_string(),
            spec.node_image.clone(),
            "--servers".to_string(),
            "1".to_string(),
            "--agents".to_string(),
            "0".to_string(),
            "--port".to_string(),
            format!("{}:80@loadbalancer", params.port),
            "--wait".to_string(),
        ];

        if let Some(tls_port) = params.tls_port {
            args.push("--port".to_string());
            args.push(format!("{tls_port}:443@loadbalancer"));
        }

        for volume in &params.volumes {
            args.push("--volume".to_string());
            args.push(format!("{volume}@server:0"));
        }

        match params.image_caching_method {
            Some(ImageCachingMethod::LocalVolume) => {
                args.push("--volume".to_string());
                args.push(format!(
                    "{}:{NODE_IMAGE_STORE}@server:0",
                    spec.data_dir.join("containerd").display()
                ));
            }
            Some(ImageCachingMethod::DockerVolume) => {
                args.push("--volume".to_string());
                args.push(format!("{}-containerd:{NODE_IMAGE_STORE}@server:0", self.name));
            }
            Some(ImageCachingMethod::Registry) => {
                args.push("--registry-use".to_string());
                args.push(format!(
                    "{}:{}",
                    self.registry_container(),
                    REGISTRY_CONTAINER_PORT
                ));
                if let Some(file) = registries_file {
                    args.push("--registry-config".to_string());
                    args.push(file.display().to_string());
                }
            }
            None => {}
        }

        if params.gpu {
            args.push("--gpus".to_string());
            args.push(match &params.gpu_devices {
                Some(devices) => format!("\"device={devices}\""),
                None => "all".to_string(),
            });
        }

        args
    }

    /// containerd mirror configuration pointing each upstream registry at
    /// the local registry.
    pub fn registries_yaml(&self, registries: &[String]) -> String {
        let endpoint = format!(
            "http://{}:{}",
            self.registry_container(),
            REGISTRY_CONTAINER_PORT
        );
        let mut yaml = String::from("mirrors:\n");
        for registry in registries {
            yaml.push_str(&format!("  \"{registry}\":\n    endpoint:\n      - {endpoint}\n"));
        }
        yaml
    }
}

#[async_trait]
impl ClusterManager for K3dCli {
    async fn exists(&self) -> Result<bool> {
        Ok(self.listing().await?.is_some())
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self
            .listing()
            .await?
            .is_some_and(|c| c.servers_count > 0 && c.servers_running == c.servers_count))
    }

    async fn start(&self) -> Result<()> {
        info!(cluster = %self.name, "Starting cluster");
        self.k3d.run(&["cluster", "start", self.name.as_str()]).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!(cluster = %self.name, "Stopping cluster");
        self.k3d.run(&["cluster", "stop", self.name.as_str()]).await?;
        Ok(())
    }

    async fn create(&self, spec: &ClusterSpec) -> Result<()> {
        let registries_file = if spec.mirrored_registries.is_empty() {
            None
        } else {
            let path = spec.data_dir.join("registries.yaml");
            tokio::fs::create_dir_all(&spec.data_dir).await?;
            tokio::fs::write(&path, self.registries_yaml(&spec.mirrored_registries))
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            Some(path)
        };

        info!(cluster = %self.name, node_image = %spec.node_image, "Creating cluster");
        let k3d = self
            .k3d
            .clone()
            .with_env("K3D_IMAGE_TOOLS", spec.tools_image.as_str());
        k3d.run(&self.create_args(spec, registries_file.as_deref()))
            .await?;

        if let Some(cpus) = &spec.params.cpu_limit {
            info!(cpus = %cpus, "Applying CPU limit");
            let container = self.server_container();
            self.docker
                .run(&["update", "--cpus", cpus.as_str(), container.as_str()])
                .await?;
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        info!(cluster = %self.name, "Deleting cluster");
        self.k3d.run(&["cluster", "delete", self.name.as_str()]).await?;
        Ok(())
    }

    async fn kubeconfig(&self) -> Result<String> {
        self.k3d.run(&["kubeconfig", "get", self.name.as_str()]).await
    }

    async fn registry_exists(&self) -> Result<bool> {
        let out = self.k3d.run(&["registry", "list", "-o", "json"]).await?;
        let registries: Vec<RegistryListing> =
            serde_json::from_str(&out).context("failed to parse k3d registry list")?;
        let container = self.registry_container();
        Ok(registries.iter().any(|r| r.name == container))
    }

    async fn create_registry(&self, image: &str, params: &RegistryParams) -> Result<()> {
        info!(registry = %self.registry_name, port = params.port, "Creating registry");
        let port = format!("0.0.0.0:{}", params.port);
        let mut args = vec![
            "registry",
            "create",
            self.registry_name.as_str(),
            "--image",
            image,
            "--port",
            port.as_str(),
        ];
        for volume in &params.volumes {
            args.push("--volume");
            args.push(volume.as_str());
        }
        self.k3d.run(&args).await?;
        Ok(())
    }

    async fn delete_registry(&self) -> Result<()> {
        let container = self.registry_container();
        info!(registry = %container, "Deleting registry");
        self.k3d
            .run(&["registry", "delete", container.as_str()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(method: ImageCachingMethod) -> ClusterSpec {
        ClusterSpec {
            node_image: "rancher/k3s:v1.31.4-k3s1".to_string(),
            tools_image: "ghcr.io/k3d-io/k3d-tools:5.7.4".to_string(),
            params: ClusterParams {
                gpu: false,
                gpu_devices: None,
                port: 4589,
                tls_port: None,
                volumes: vec!["/data:/var/lib/keel/standalone".to_string()],
                cpu_limit: None,
                image_caching_method: Some(method),
            },
            data_dir: PathBuf::from("/data"),
            mirrored_registries: Vec::new(),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_create_args_for_registry() {
        let k3d = K3dCli::new("keel");
        let args = k3d.create_args(
            &spec(ImageCachingMethod::Registry),
            Some(Path::new("/data/registries.yaml")),
        );
        assert_eq!(&args[..3], ["cluster", "create", "keel"]);
        assert!(has_pair(&args, "--port", "4589:80@loadbalancer"));
        assert!(has_pair(&args, "--volume", "/data:/var/lib/keel/standalone@server:0"));
        assert!(has_pair(&args, "--registry-use", "k3d-keel-registry:5000"));
        assert!(has_pair(&args, "--registry-config", "/data/registries.yaml"));
        assert!(!args.contains(&"--gpus".to_string()));
    }

    #[test]
    fn test_create_args_for_local_volume_with_gpu() {
        let k3d = K3dCli::new("keel");
        let mut spec = spec(ImageCachingMethod::LocalVolume);
        spec.params.gpu = true;
        spec.params.gpu_devices = Some("GPU-a,GPU-b".to_string());
        spec.params.tls_port = Some(443);

        let args = k3d.create_args(&spec, None);
        assert!(has_pair(
            &args,
            "--volume",
            "/data/containerd:/var/lib/rancher/k3s/agent/containerd@server:0"
        ));
        assert!(has_pair(&args, "--gpus", "\"device=GPU-a,GPU-b\""));
        assert!(has_pair(&args, "--port", "443:443@loadbalancer"));
        assert!(!args.contains(&"--registry-use".to_string()));
    }

    #[test]
    fn test_registries_yaml() {
        let yaml = K3dCli::new("keel").registries_yaml(&["docker.io".to_string()]);
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed["mirrors"]["docker.io"]["endpoint"][0].as_str(),
            Some("http://k3d-keel-registry:5000")
        );
    }
}
