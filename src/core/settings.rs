use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "settings.json";
const ENV_MODELS_PATH: &str = "MODELS_PATH";
const ENV_FETCH_TOOL: &str = "WEIGHTS_FETCH_TOOL";
const ENV_VERIFY: &str = "WEIGHTS_VERIFY_CHECKSUMS";
const ENV_TOKEN: &str = "CIVITAI_API_TOKEN";

/// External fetch-and-extract tool. The URL and destination are appended
/// after `args`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchTool {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for FetchTool {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pget"),
            args: vec!["--log-level".into(), "warn".into(), "-xf".into()],
        }
    }
}

/// Offline switches handed to the model-loading collaborator when it is
/// launched. Never written into this process's environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct OfflineMode {
    pub datasets_offline: bool,
    pub transformers_offline: bool,
    pub disable_telemetry: bool,
}

impl Default for OfflineMode {
    fn default() -> Self {
        Self {
            datasets_offline: true,
            transformers_offline: true,
            disable_telemetry: true,
        }
    }
}

impl OfflineMode {
    #[must_use]
    pub fn env_pairs(&self) -> Vec<(&'static str, &'static str)> {
        let mut pairs = Vec::new();
        if self.datasets_offline {
            pairs.push(("HF_DATASETS_OFFLINE", "1"));
        }
        if self.transformers_offline {
            pairs.push(("TRANSFORMERS_OFFLINE", "1"));
        }
        if self.disable_telemetry {
            pairs.push(("HF_HUB_DISABLE_TELEMETRY", "1"));
        }
        pairs
    }

    pub fn apply_to<'a>(&self, command: &'a mut Command) -> &'a mut Command {
        command.envs(self.env_pairs())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub models_root: PathBuf,
    pub fetch_tool: FetchTool,
    pub verify_checksums: bool,
    pub offline: OfflineMode,
    #[serde(skip)]
    pub civitai_api_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            models_root: PathBuf::from("ComfyUI/models"),
            fetch_tool: FetchTool::default(),
            verify_checksums: false,
            offline: OfflineMode::default(),
            civitai_api_token: None,
        }
    }
}

impl Settings {
    /// Reads the settings file (explicit path, or the per-user default when
    /// it exists) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };
        let mut settings = match path {
            Some(path) => load_settings(&path)?,
            None => Settings::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_MODELS_PATH).filter(|value| !value.is_empty()) {
            self.models_root = PathBuf::from(root);
        }
        if let Some(tool) = lookup(ENV_FETCH_TOOL).filter(|value| !value.is_empty()) {
            self.fetch_tool.program = PathBuf::from(tool);
        }
        if let Some(verify) = lookup(ENV_VERIFY) {
            self.verify_checksums = matches!(verify.trim(), "1" | "true" | "yes");
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|value| !value.is_empty()) {
            self.civitai_api_token = Some(token);
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "WeightsProvisioner", "WeightsProvisioner")?;
    let path = project_dirs.config_dir().join(CONFIG_FILE);
    path.exists().then_some(path)
}

fn load_settings(path: &Path) -> Result<Settings> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes).context("settings json could not be parsed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_pget_invocation() {
        let settings = Settings::default();
        assert_eq!(settings.fetch_tool.program, PathBuf::from("pget"));
        assert_eq!(settings.fetch_tool.args, vec!["--log-level", "warn", "-xf"]);
        assert!(!settings.verify_checksums);
    }

    #[test]
    fn file_values_are_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "modelsRoot": "/srv/models", "verifyChecksums": true }"#).unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.models_root, PathBuf::from("/srv/models"));
        assert!(settings.verify_checksums);
        assert_eq!(settings.fetch_tool, FetchTool::default());
    }

    #[test]
    fn token_is_never_read_from_file() {
        let settings: Settings =
            serde_json::from_str(r#"{ "civitaiApiToken": "leaked" }"#).unwrap();
        assert!(settings.civitai_api_token.is_none());
        let serialized = serde_json::to_string(&Settings {
            civitai_api_token: Some("secret".into()),
            ..Settings::default()
        })
        .unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MODELS_PATH", "/models"),
            ("WEIGHTS_FETCH_TOOL", "/usr/local/bin/pget"),
            ("WEIGHTS_VERIFY_CHECKSUMS", "true"),
            ("CIVITAI_API_TOKEN", "abc"),
        ]);
        let mut settings = Settings::default();
        settings.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(settings.models_root, PathBuf::from("/models"));
        assert_eq!(settings.fetch_tool.program, PathBuf::from("/usr/local/bin/pget"));
        assert!(settings.verify_checksums);
        assert_eq!(settings.civitai_api_token.as_deref(), Some("abc"));
    }

    #[test]
    fn empty_token_is_ignored() {
        let mut settings = Settings::default();
        settings.apply_overrides(|key| (key == "CIVITAI_API_TOKEN").then(String::new));
        assert!(settings.civitai_api_token.is_none());
    }

    #[test]
    fn offline_mode_only_exports_enabled_flags() {
        let mode = OfflineMode {
            transformers_offline: false,
            ..OfflineMode::default()
        };
        assert_eq!(
            mode.env_pairs(),
            vec![("HF_DATASETS_OFFLINE", "1"), ("HF_HUB_DISABLE_TELEMETRY", "1")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn offline_mode_reaches_child_process() {
        let mut command = Command::new("/bin/sh");
        command.args(["-c", "printf %s \"$HF_DATASETS_OFFLINE\""]);
        OfflineMode::default().apply_to(&mut command);
        let output = command.output().unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "1");
    }
}
