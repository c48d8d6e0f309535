use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use meterbridge_common::{
    ports::{ConfigStore, StoreError},
    DeviceConfig,
};

/// Persisted device configuration as one pretty-printed JSON document.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("device.json"),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("METERBRIDGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.meterbridge"));
        Self::new(data_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&mut self) -> Result<DeviceConfig, StoreError> {
        match fs::read(&self.path) {
            Ok(raw) => {
                let mut config: DeviceConfig = serde_json::from_slice(&raw)?;
                config.sanitize();
                Ok(config)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeviceConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        // A crash mid-write leaves the previous document in place.
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, payload)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}
