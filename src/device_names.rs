use error_stack::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DeviceNamesError {
    #[error("Cannot access device names file {0}")]
    Io(String),

    #[error("Device names file {0} is not a valid name mapping")]
    Parse(String),

    #[error("Cannot save device names file {0}")]
    Save(String),
}

pub type Result<T> = error_stack::Result<T, DeviceNamesError>;

#[derive(Debug, Serialize, Deserialize)]
struct NameEntry {
    friendly_name: String,
}

/// Persisted mapping from a bus address key (`lamp_<addr>` / `group_<addr>`)
/// to a human-friendly display name. Written back only on first run, when
/// the file is still empty; a corrupted file is fatal at load time since
/// defaulting would silently rename every device.
#[derive(Debug)]
pub struct DeviceNames {
    path: PathBuf,
    names: BTreeMap<String, NameEntry>,
}

impl DeviceNames {
    pub fn load(path: &Path) -> Result<DeviceNames> {
        if !path.exists() {
            info!("No device names file, creating {}", path.display());
            std::fs::File::create(path)
                .change_context_lazy(|| DeviceNamesError::Io(path.display().to_string()))?;

            return Ok(DeviceNames {
                path: path.to_path_buf(),
                names: BTreeMap::new(),
            });
        }

        let text = std::fs::read_to_string(path)
            .change_context_lazy(|| DeviceNamesError::Io(path.display().to_string()))?;

        let names = if text.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_yaml::from_str(&text)
                .change_context_lazy(|| DeviceNamesError::Parse(path.display().to_string()))?
        };

        debug!("Loaded {} device names from {}", names.len(), path.display());

        Ok(DeviceNames {
            path: path.to_path_buf(),
            names,
        })
    }

    pub fn friendly_name(&self, key: &str) -> String {
        match self.names.get(key) {
            Some(entry) => entry.friendly_name.clone(),
            None => key.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// First-run bootstrap: persist address-derived default names so the
    /// user has a file to edit. Never called once the file has content.
    pub fn save_defaults(
        &mut self,
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> Result<()> {
        self.names = entries
            .into_iter()
            .map(|(key, friendly_name)| (key, NameEntry { friendly_name }))
            .collect();

        let text = serde_yaml::to_string(&self.names)
            .change_context_lazy(|| DeviceNamesError::Save(self.path.display().to_string()))?;
        std::fs::write(&self.path, text)
            .change_context_lazy(|| DeviceNamesError::Save(self.path.display().to_string()))?;

        info!(
            "Saved {} default device names to {}",
            self.names.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Convert a friendly name to an MQTT-topic-safe slug.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}
