//! Install command and the flags shared with upgrade and reinstall.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use keel_manifest::params::DEFAULT_TLS_PORT;
use keel_manifest::{GpuSelection, ImageCachingMethod, ParamsOverrides, TlsParams};

use crate::config::Config;
use crate::flow::InstallRequest;
use crate::source::InstallSource;

use super::{live_installer, print_installed};

/// Where to take the manifest from.
#[derive(Debug, Clone, Default, Args)]
pub struct SourceArgs {
    /// Release to install (for example `manifest-1.4.2` or `1.4.2`).
    #[arg(long, conflicts_with_all = ["local", "airgap"])]
    pub tag: Option<String>,

    /// Generate the manifest from a chart checkout.
    #[arg(long, value_name = "DIR", conflicts_with = "airgap")]
    pub local: Option<PathBuf>,

    /// Install offline from a bundle created with `keel pack`.
    #[arg(long, value_name = "FILE")]
    pub airgap: Option<PathBuf>,
}

impl SourceArgs {
    pub fn source(&self) -> InstallSource {
        InstallSource::from_flags(self.tag.clone(), self.local.clone(), self.airgap.clone())
    }
}

/// Installation params. Omitted flags keep the previous installation's
/// value.
#[derive(Debug, Clone, Default, Args)]
pub struct ParamsArgs {
    /// GPUs to use: `all`, a count, device indices (`0,1`) or UUIDs.
    #[arg(long, value_name = "SELECTION")]
    pub gpu: Option<GpuSelection>,

    /// Port the application is served on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Port of the local image registry.
    #[arg(long)]
    pub registry_port: Option<u16>,

    /// Host directory to mount, as `host[:container]`. Repeatable.
    #[arg(long = "dataset-volume", value_name = "VOLUME")]
    pub dataset_volumes: Vec<String>,

    /// Domain the application is reached at.
    #[arg(long)]
    pub domain: Option<String>,

    /// Public URL when served behind a proxy.
    #[arg(long)]
    pub proxy_url: Option<String>,

    /// TLS certificate file (PEM).
    #[arg(long, value_name = "FILE", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM).
    #[arg(long, value_name = "FILE", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// HTTPS port when TLS is enabled.
    #[arg(long, default_value_t = DEFAULT_TLS_PORT)]
    pub tls_port: u16,

    /// CPU limit for the cluster node (for example `4` or `2.5`).
    #[arg(long)]
    pub cpu_limit: Option<String>,

    /// Turn off usage metrics.
    #[arg(long)]
    pub disable_metrics: bool,

    /// Turn off authentication.
    #[arg(long)]
    pub disable_auth: bool,

    /// Remove installation images from docker once they are cached.
    #[arg(long)]
    pub clear_images: bool,

    /// How images reach the cluster: docker-volume, local-volume or registry.
    #[arg(long, value_name = "METHOD")]
    pub image_caching_method: Option<ImageCachingMethod>,
}

impl ParamsArgs {
    /// Turn the flags into params overrides, reading TLS material from
    /// disk.
    pub fn overrides(&self) -> Result<ParamsOverrides> {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsParams {
                enabled: true,
                cert: std::fs::read_to_string(cert)
                    .with_context(|| format!("failed to read {}", cert.display()))?,
                key: std::fs::read_to_string(key)
                    .with_context(|| format!("failed to read {}", key.display()))?,
                port: self.tls_port,
            }),
            _ => None,
        };

        Ok(ParamsOverrides {
            gpu: self.gpu.clone(),
            port: self.port,
            registry_port: self.registry_port,
            domain: self.domain.clone(),
            proxy_url: self.proxy_url.clone(),
            tls,
            dataset_volumes: self.dataset_volumes.clone(),
            cpu_limit: self.cpu_limit.clone(),
            disable_metrics: self.disable_metrics.then_some(true),
            disabled_auth: self.disable_auth.then_some(true),
            clear_installation_images: self.clear_images.then_some(true),
        })
    }

    pub fn request(&self, source: InstallSource) -> Result<InstallRequest> {
        Ok(InstallRequest {
            source,
            overrides: self.overrides()?,
            caching_method: self.image_caching_method,
        })
    }
}

/// Install keel.
#[derive(Debug, Args)]
pub struct InstallCommand {
    #[command(flatten)]
    source: SourceArgs,

    #[command(flatten)]
    params: ParamsArgs,

    /// Answer every question with its default.
    #[arg(long, short = 'y')]
    yes: bool,
}

impl InstallCommand {
    pub async fn run(self, config: Config) -> Result<()> {
        let request = self.params.request(self.source.source())?;
        let installer = live_installer("install", config, self.yes)?;
        let state = installer.install(&request).await?;
        print_installed(&state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        params: ParamsArgs,
    }

    fn parse(args: &[&str]) -> Result<Harness, clap::Error> {
        Harness::try_parse_from(std::iter::once("keel").chain(args.iter().copied()))
    }

    #[test]
    fn test_flags_become_overrides() {
        let harness = parse(&[
            "--gpu",
            "0,1",
            "--port",
            "8080",
            "--dataset-volume",
            "/data",
            "--dataset-volume",
            "/models:/mnt/models",
            "--disable-metrics",
            "--image-caching-method",
            "registry",
        ])
        .unwrap();

        let request = harness.params.request(harness.source.source()).unwrap();
        assert_eq!(request.source, InstallSource::Latest);
        assert_eq!(request.overrides.gpu, Some(GpuSelection::DeviceIndices(vec![0, 1])));
        assert_eq!(request.overrides.port, Some(8080));
        assert_eq!(request.overrides.dataset_volumes.len(), 2);
        assert_eq!(request.overrides.disable_metrics, Some(true));
        assert_eq!(request.overrides.disabled_auth, None);
        assert_eq!(request.caching_method, Some(ImageCachingMethod::Registry));
    }

    #[test]
    fn test_sources_are_exclusive() {
        assert!(parse(&["--tag", "1.0.0", "--airgap", "bundle.tar"]).is_err());
        assert!(parse(&["--local", "charts", "--airgap", "bundle.tar"]).is_err());
        let harness = parse(&["--airgap", "bundle.tar"]).unwrap();
        assert!(harness.source.source().is_airgap());
    }

    #[test]
    fn test_tls_reads_material() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "CERT").unwrap();
        std::fs::write(&key, "KEY").unwrap();

        let harness = parse(&[
            "--tls-cert",
            cert.to_str().unwrap(),
            "--tls-key",
            key.to_str().unwrap(),
        ])
        .unwrap();
        let tls = harness.params.overrides().unwrap().tls.unwrap();
        assert!(tls.enabled);
        assert_eq!(tls.cert, "CERT");
        assert_eq!(tls.key, "KEY");
        assert_eq!(tls.port, DEFAULT_TLS_PORT);
    }

    #[test]
    fn test_tls_cert_requires_key() {
        assert!(parse(&["--tls-cert", "cert.pem"]).is_err());
    }

    #[test]
    fn test_invalid_gpu_selection_is_rejected() {
        assert!(parse(&["--gpu", "0,GPU-abc"]).is_err());
    }
}
