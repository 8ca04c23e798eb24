use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{
    DeviceProfile, ProfileChange, ProfileError, DEFAULT_CONTROL_TOPIC, DEFAULT_SPEED_TOPIC,
};
use crate::mqtt::config::validate_topic;

const CONFIG_DIR: &str = ".config/wagner-remote";
const PROFILE_FILE: &str = "profile.toml";

/// Reads and writes the device profile as a TOML file
#[derive(Clone, Debug)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ProfileStore { path: path.into() }
    }

    /// `~/.config/wagner-remote/profile.toml`
    pub fn default_location() -> Self {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(PROFILE_FILE);
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored profile, or the defaults when there is none or it cannot be read
    pub async fn load(&self) -> DeviceProfile {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No profile at {}, using defaults", self.path.display());
                return DeviceProfile::default();
            }
            Err(e) => {
                warn!(
                    "Could not read profile {}: {}. Using defaults",
                    self.path.display(),
                    e
                );
                return DeviceProfile::default();
            }
        };

        match toml::from_str::<DeviceProfile>(&content) {
            Ok(profile) => {
                debug!("Loaded profile from {}", self.path.display());
                repair(profile)
            }
            Err(e) => {
                warn!(
                    "Profile {} is corrupt: {}. Using defaults",
                    self.path.display(),
                    e
                );
                DeviceProfile::default()
            }
        }
    }

    /// Writes `profile` and returns once it is on disk. The file is replaced
    /// atomically so a crash never leaves half a profile behind.
    pub async fn save(&self, profile: &DeviceProfile) -> Result<(), ProfileError> {
        let content = toml::to_string_pretty(profile)?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let temp_path = self.path.with_extension("toml.tmp");
        tokio::fs::write(&temp_path, content).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        info!("Saved profile to {}", self.path.display());
        Ok(())
    }

    /// Applies one settings edit and persists the result. `profile` is only
    /// updated when the edit was valid and the save succeeded.
    pub async fn apply(
        &self,
        profile: &mut DeviceProfile,
        change: ProfileChange,
    ) -> Result<(), ProfileError> {
        let mut updated = profile.clone();
        change.apply_to(&mut updated)?;
        if updated == *profile {
            debug!("Profile unchanged, skipping save");
            return Ok(());
        }
        self.save(&updated).await?;
        *profile = updated;
        Ok(())
    }
}

/// Replaces every field that parsed but would be rejected as a settings edit
/// with its default, so a hand-edited profile cannot stop the remote starting.
fn repair(mut profile: DeviceProfile) -> DeviceProfile {
    profile.control_topic =
        checked_topic("control", &profile.control_topic, DEFAULT_CONTROL_TOPIC);
    profile.speed_topic = checked_topic("speed", &profile.speed_topic, DEFAULT_SPEED_TOPIC);
    profile.broker = match profile.broker.take().map(|broker| broker.validate()) {
        Some(Ok(broker)) => Some(broker),
        Some(Err(e)) => {
            warn!("Stored broker is invalid: {}. Using the stock broker", e);
            None
        }
        None => None,
    };
    profile
}

fn checked_topic(kind: &str, topic: &str, default: &str) -> String {
    let topic = topic.trim();
    match validate_topic(topic) {
        Ok(()) => topic.to_string(),
        Err(e) => {
            warn!("Stored {} topic is invalid: {}. Using {}", kind, e, default);
            default.to_string()
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
