//! File-based store for the installed (manifest, params) pair.
//!
//! Both documents live under `<data_dir>/manifests/` with the schema version
//! in the file name. They are read at the start of every command and
//! rewritten together after a successful install or upgrade.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ManifestError, StoreError};
use crate::manifest::InstallationManifest;
use crate::params::InstallationParams;

const MANIFEST_FILE: &str = "manifest.v1.yaml";
const PARAMS_FILE: &str = "params.v1.yaml";

/// The installed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledState {
    pub manifest: InstallationManifest,
    pub params: InstallationParams,
}

/// Persistent store for [`InstalledState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    data_dir: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn state_dir(&self) -> PathBuf {
        self.data_dir.join("manifests")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir().join(MANIFEST_FILE)
    }

    pub fn params_path(&self) -> PathBuf {
        self.state_dir().join(PARAMS_FILE)
    }

    /// Load the previously installed manifest, if any.
    pub fn load_manifest(&self) -> Result<Option<InstallationManifest>, StoreError> {
        let path = self.manifest_path();
        read_optional(&path)?
            .map(|bytes| {
                InstallationManifest::from_yaml_bytes(&bytes)
                    .map_err(|source| StoreError::Decode { path, source })
            })
            .transpose()
    }

    /// Load the previously installed params, if any.
    pub fn load_params(&self) -> Result<Option<InstallationParams>, StoreError> {
        let path = self.params_path();
        read_optional(&path)?
            .map(|bytes| {
                InstallationParams::from_yaml_bytes(&bytes)
                    .map_err(|source| StoreError::Decode { path, source })
            })
            .transpose()
    }

    /// Load the installed pair. `None` means there is no previous state and
    /// the next install is a fresh one.
    pub fn load(&self) -> Result<Option<InstalledState>, StoreError> {
        match (self.load_manifest()?, self.load_params()?) {
            (Some(manifest), Some(params)) => Ok(Some(InstalledState { manifest, params })),
            _ => {
                info!(data_dir = %self.data_dir.display(), "No previous installation state");
                Ok(None)
            }
        }
    }

    /// Persist the pair. Both documents are fully written to temporary files
    /// before either existing file is replaced.
    pub fn save(&self, state: &InstalledState) -> Result<(), StoreError> {
        let dir = self.state_dir();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let manifest_yaml = state
            .manifest
            .to_yaml()
            .map_err(encode_err(self.manifest_path()))?;
        let params_yaml = state
            .params
            .to_yaml()
            .map_err(encode_err(self.params_path()))?;

        let manifest_tmp = write_temp(&dir, manifest_yaml.as_bytes())?;
        let params_tmp = write_temp(&dir, params_yaml.as_bytes())?;

        persist(manifest_tmp, &self.manifest_path())?;
        persist(params_tmp, &self.params_path())?;

        debug!(dir = %dir.display(), "Saved installation state");
        Ok(())
    }

    /// Remove both state files.
    pub fn clear(&self) -> Result<(), StoreError> {
        for path in [self.manifest_path(), self.params_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
        Ok(())
    }
}

fn encode_err(path: PathBuf) -> impl FnOnce(ManifestError) -> StoreError {
    move |source| StoreError::Encode { path, source }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_temp(dir: &Path, contents: &[u8]) -> Result<tempfile::NamedTempFile, StoreError> {
    let io_err = |source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }

    Ok(file)
}

fn persist(file: tempfile::NamedTempFile, target: &Path) -> Result<(), StoreError> {
    file.persist(target).map_err(|e| StoreError::Io {
        path: target.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::sample_manifest;
    use crate::params::tests::sample_params;

    fn sample_state() -> InstalledState {
        InstalledState {
            manifest: sample_manifest(),
            params: sample_params(),
        }
    }

    #[test]
    fn test_load_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = sample_state();

        store.save(&state).unwrap();
        assert!(store.manifest_path().ends_with("manifests/manifest.v1.yaml"));
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[test]
    fn test_half_state_is_not_a_previous_installation() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample_state()).unwrap();
        fs::remove_file(store.params_path()).unwrap();

        assert!(store.load_manifest().unwrap().is_some());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::create_dir_all(dir.path().join("manifests")).unwrap();
        fs::write(store.manifest_path(), "version: 9.9.9\n").unwrap();

        assert!(matches!(
            store.load_manifest(),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn test_encode_failure_is_not_reported_as_decode() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let yaml = serde_yaml::from_str::<u32>("not a number").unwrap_err();
        let err = encode_err(store.params_path())(ManifestError::Yaml {
            kind: "params",
            source: yaml,
        });

        assert!(matches!(err, StoreError::Encode { ref path, .. } if path == &store.params_path()));
        assert!(err.to_string().starts_with("cannot encode state file"));
    }

    #[cfg(unix)]
    #[test]
    fn test_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample_state()).unwrap();

        let mode = fs::metadata(store.params_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample_state()).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
