use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{ConfigError, OutputFormat};

/// User-facing defaults consumed by the orchestrator.
///
/// Read once at startup and again only on an explicit reload. Every key
/// is optional in the settings file:
///
/// | Key                       | Default            |
/// |---------------------------|--------------------|
/// | `default_steps`           | `4`                |
/// | `default_guidance_scale`  | `0.0`              |
/// | `default_width`           | `1024`             |
/// | `default_height`          | `768`              |
/// | `default_output_format`   | `png`              |
/// | `custom_model_cache_path` | hub default        |
/// | `selected_model_id`       | `flux.1-schnell`   |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_steps: u32,
    pub default_guidance_scale: f32,
    pub default_width: u32,
    pub default_height: u32,
    pub default_output_format: OutputFormat,
    pub custom_model_cache_path: Option<PathBuf>,
    pub selected_model_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_steps: 4,
            default_guidance_scale: 0.0,
            default_width: 1024,
            default_height: 768,
            default_output_format: OutputFormat::Png,
            custom_model_cache_path: None,
            selected_model_id: crate::registry::DEFAULT_MODEL_ID.to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn model_cache_path(&self) -> Option<&Path> {
        self.custom_model_cache_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let settings = Settings::from_toml(
            r#"
            default_steps = 20
            default_output_format = "jpeg"
            custom_model_cache_path = "/models"
            "#,
        )
        .unwrap();
        assert_eq!(settings.default_steps, 20);
        assert_eq!(settings.default_output_format, OutputFormat::Jpeg);
        assert_eq!(settings.model_cache_path(), Some(Path::new("/models")));
        assert_eq!(settings.default_width, Settings::default().default_width);
        assert_eq!(
            settings.selected_model_id,
            Settings::default().selected_model_id
        );
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "default_steps = \"many\"").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
