//! Where an installation's manifest comes from.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use keel_airgap::load_manifest_only;
use keel_manifest::generate::{
    latest_manifest_tag, manifest_for_tag, ChartVersions, LocalCheckout, ManifestGenerator,
    ReleaseIndex, MANIFEST_TAG_PREFIX,
};
use keel_manifest::InstallationManifest;
use tracing::{info, warn};

use crate::error::KeelError;
use crate::prompt::Prompter;

/// Manifest source selected on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InstallSource {
    /// Read from an airgap bundle.
    Airgap(PathBuf),
    /// Generate from a chart checkout.
    Local(PathBuf),
    /// A published release tag.
    Tag(String),
    /// The newest release, unless the operator keeps the installed one.
    #[default]
    Latest,
}

impl InstallSource {
    /// Pick the source from mutually exclusive flags.
    pub fn from_flags(tag: Option<String>, local: Option<PathBuf>, airgap: Option<PathBuf>) -> Self {
        if let Some(bundle) = airgap {
            Self::Airgap(bundle)
        } else if let Some(dir) = local {
            Self::Local(dir)
        } else if let Some(tag) = tag {
            Self::tag(&tag)
        } else {
            Self::Latest
        }
    }

    /// A release tag; bare versions get the manifest tag prefix.
    pub fn tag(tag: &str) -> Self {
        let tag = tag.trim();
        if tag.starts_with(MANIFEST_TAG_PREFIX) {
            Self::Tag(tag.to_string())
        } else {
            Self::Tag(format!("{MANIFEST_TAG_PREFIX}{}", tag.trim_start_matches('v')))
        }
    }

    pub fn is_airgap(&self) -> bool {
        matches!(self, Self::Airgap(_))
    }
}

/// Where `create-manifest` generates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// A chart checkout on disk.
    Local(PathBuf),
    /// The chart repository at an application release tag.
    Remote(ChartVersions),
}

/// Resolves the manifest to install.
pub struct ManifestResolver<'a> {
    index: &'a dyn ReleaseIndex,
    prompter: &'a dyn Prompter,
    generator: ManifestGenerator,
}

impl<'a> ManifestResolver<'a> {
    pub fn new(index: &'a dyn ReleaseIndex, prompter: &'a dyn Prompter) -> Self {
        Self {
            index,
            prompter,
            generator: ManifestGenerator::default(),
        }
    }

    /// Resolve `source`. With [`InstallSource::Latest`] and a previously
    /// installed release, the operator chooses between keeping it and
    /// moving to the newest one.
    pub async fn resolve(
        &self,
        source: &InstallSource,
        previous: Option<&InstallationManifest>,
    ) -> Result<InstallationManifest, KeelError> {
        match source {
            InstallSource::Airgap(bundle) => {
                let bundle = bundle.clone();
                info!(bundle = %bundle.display(), "Reading manifest from bundle");
                let manifest = tokio::task::spawn_blocking(move || {
                    load_manifest_only(BufReader::new(File::open(&bundle)?))
                })
                .await
                .map_err(std::io::Error::other)??;
                Ok(manifest)
            }
            InstallSource::Local(dir) => {
                let checkout = LocalCheckout::new(dir);
                let repo_url = checkout.charts_dir().display().to_string();
                Ok(self.generator.from_checkout(&checkout, &repo_url).await?)
            }
            InstallSource::Tag(tag) => Ok(manifest_for_tag(self.index, tag).await?),
            InstallSource::Latest => {
                match previous.and_then(|p| p.tag.as_deref().map(|tag| (p, tag))) {
                    Some((previous, tag)) => self.latest_or_previous(previous, tag).await,
                    None => {
                        let latest = latest_manifest_tag(self.index).await?;
                        Ok(manifest_for_tag(self.index, &latest).await?)
                    }
                }
            }
        }
    }

    async fn latest_or_previous(
        &self,
        previous: &InstallationManifest,
        previous_tag: &str,
    ) -> Result<InstallationManifest, KeelError> {
        let latest = match latest_manifest_tag(self.index).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(error = %e, tag = %previous_tag, "Could not look up the latest release, keeping the installed one");
                return Ok(previous.clone());
            }
        };

        if latest == previous_tag {
            info!(tag = %latest, "Installed release is the latest");
            return Ok(previous.clone());
        }

        let question = format!(
            "A newer release is available (latest {latest}, installed {previous_tag}). Use the latest release?"
        );
        if self.prompter.confirm(&question, false)? {
            Ok(manifest_for_tag(self.index, &latest).await?)
        } else {
            info!(tag = %previous_tag, "Keeping the installed release");
            Ok(previous.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use keel_manifest::GenerateError;

    use super::*;
    use crate::prompt::ScriptedPrompter;

    struct FakeIndex {
        tags: Vec<String>,
        fail_listing: bool,
        manifests: HashMap<String, String>,
    }

    fn manifest(tag: &str, app_version: &str) -> InstallationManifest {
        ManifestGenerator::default().build(
            "https://charts.keel.dev",
            app_version,
            "0.1.9",
            vec![format!("ghcr.io/keel-dev/app:{app_version}")],
            Some(tag.to_string()),
        )
    }

    impl FakeIndex {
        fn new(releases: &[(&str, &str)]) -> Self {
            Self {
                tags: releases.iter().map(|(tag, _)| tag.to_string()).collect(),
                fail_listing: false,
                manifests: releases
                    .iter()
                    .map(|(tag, version)| (tag.to_string(), manifest(tag, version).to_yaml().unwrap()))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl ReleaseIndex for FakeIndex {
        async fn list_tags(&self) -> Result<Vec<String>, GenerateError> {
            if self.fail_listing {
                return Err(GenerateError::Fetch {
                    resource: "releases".to_string(),
                    message: "offline".to_string(),
                });
            }
            Ok(self.tags.clone())
        }

        async fn download_asset(&self, tag: &str, _name: &str) -> Result<Vec<u8>, GenerateError> {
            self.manifests
                .get(tag)
                .map(|m| m.clone().into_bytes())
                .ok_or_else(|| GenerateError::Fetch {
                    resource: tag.to_string(),
                    message: "404".to_string(),
                })
        }
    }

    fn releases() -> FakeIndex {
        FakeIndex::new(&[
            ("manifest-1.0.12", "1.0.12"),
            ("manifest-1.0.11", "1.0.11"),
            ("manifest-1.0.10", "1.0.10"),
            ("keel-1.0.12", "1.0.12"),
        ])
    }

    #[test]
    fn test_tag_normalization() {
        assert_eq!(InstallSource::tag("1.0.10"), InstallSource::Tag("manifest-1.0.10".into()));
        assert_eq!(InstallSource::tag("v1.0.10"), InstallSource::Tag("manifest-1.0.10".into()));
        assert_eq!(
            InstallSource::tag("manifest-1.0.10"),
            InstallSource::Tag("manifest-1.0.10".into())
        );
    }

    #[test]
    fn test_from_flags_precedence() {
        assert!(InstallSource::from_flags(None, Some("a".into()), Some("b".into())).is_airgap());
        assert_eq!(InstallSource::from_flags(None, None, None), InstallSource::Latest);
    }

    #[tokio::test]
    async fn test_declining_latest_keeps_previous() {
        let index = releases();
        let prompter = ScriptedPrompter::new([false]);
        let previous = manifest("manifest-1.0.10", "1.0.10");

        let resolved = ManifestResolver::new(&index, &prompter)
            .resolve(&InstallSource::Latest, Some(&previous))
            .await
            .unwrap();

        assert_eq!(resolved.tag.as_deref(), Some("manifest-1.0.10"));
        assert_eq!(resolved.app_chart.version, "1.0.10");
        let asked = prompter.asked();
        assert_eq!(asked.len(), 1);
        assert!(asked[0].contains("manifest-1.0.12"));
        assert!(asked[0].contains("manifest-1.0.10"));
    }

    #[tokio::test]
    async fn test_accepting_latest_moves_forward() {
        let index = releases();
        let prompter = ScriptedPrompter::new([true]);
        let previous = manifest("manifest-1.0.10", "1.0.10");

        let resolved = ManifestResolver::new(&index, &prompter)
            .resolve(&InstallSource::Latest, Some(&previous))
            .await
            .unwrap();
        assert_eq!(resolved.tag.as_deref(), Some("manifest-1.0.12"));
    }

    #[tokio::test]
    async fn test_previous_latest_is_not_questioned() {
        let index = releases();
        let prompter = ScriptedPrompter::default();
        let previous = manifest("manifest-1.0.12", "1.0.12");

        let resolved = ManifestResolver::new(&index, &prompter)
            .resolve(&InstallSource::Latest, Some(&previous))
            .await
            .unwrap();
        assert_eq!(resolved, previous);
        assert!(prompter.asked().is_empty());
    }

    #[tokio::test]
    async fn test_offline_index_keeps_previous() {
        let mut index = releases();
        index.fail_listing = true;
        let prompter = ScriptedPrompter::default();
        let previous = manifest("manifest-1.0.10", "1.0.10");

        let resolved = ManifestResolver::new(&index, &prompter)
            .resolve(&InstallSource::Latest, Some(&previous))
            .await
            .unwrap();
        assert_eq!(resolved, previous);
    }

    #[tokio::test]
    async fn test_fresh_latest_and_explicit_tag() {
        let index = releases();
        let prompter = ScriptedPrompter::default();
        let resolver = ManifestResolver::new(&index, &prompter);

        let latest = resolver.resolve(&InstallSource::Latest, None).await.unwrap();
        assert_eq!(latest.tag.as_deref(), Some("manifest-1.0.12"));

        let pinned = resolver
            .resolve(&InstallSource::tag("1.0.11"), None)
            .await
            .unwrap();
        assert_eq!(pinned.app_chart.version, "1.0.11");
        assert!(prompter.asked().is_empty());
    }

    #[tokio::test]
    async fn test_local_checkout_records_charts_dir() {
        let dir = tempfile::tempdir().unwrap();
        let charts = dir.path().join("charts");
        for (name, version) in [("keel", "2.0.1"), ("keel-infra", "0.3.0")] {
            std::fs::create_dir_all(charts.join(name)).unwrap();
            std::fs::write(
                charts.join(name).join("Chart.yaml"),
                format!("apiVersion: v2\nname: {name}\nversion: {version}\n"),
            )
            .unwrap();
        }
        std::fs::write(dir.path().join("images.txt"), "ghcr.io/keel-dev/app:2.0.1\n").unwrap();

        let index = releases();
        let prompter = ScriptedPrompter::default();
        let manifest = ManifestResolver::new(&index, &prompter)
            .resolve(&InstallSource::Local(dir.path().to_path_buf()), None)
            .await
            .unwrap();

        assert_eq!(manifest.app_chart.version, "2.0.1");
        assert_eq!(manifest.infra_chart.version, "0.3.0");
        assert!(manifest.app_chart.is_local());
        assert_eq!(manifest.app_chart.repo_url, charts.display().to_string());
    }
}
