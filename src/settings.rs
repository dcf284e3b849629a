//! Orchestrator settings.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`,
//! with environment variables taking precedence.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::agent::RunLoopConfig;
use crate::decision::RemoteWorkflowConfig;
use crate::model::{ModelConfig, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};
use crate::task::StepDefaults;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "moderras";
const APPLICATION: &str = "phone-orchestrator";

/// Settings persistence errors.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Cannot determine config directory")]
    NoConfigDir,
    #[error("Failed to write settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Settings shared by the CLI modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Vision model API base URL
    pub model_base_url: String,
    pub model_api_key: String,
    pub model_name: String,
    pub model_max_retries: u32,
    /// Seconds between model retries
    pub model_retry_delay: u64,
    /// Workflow engine API root; empty disables the remote backend
    pub workflow_base_url: String,
    pub workflow_api_key: String,
    pub workflow_user: String,
    /// Devices that get a worker
    pub device_ids: Vec<String>,
    pub adb_path: String,
    /// Language code ("cn" or "en")
    pub lang: String,
    pub max_steps: u32,
    pub max_retries: u32,
    pub step_timeout_secs: u64,
    pub decision_timeout_secs: u64,
    pub action_timeout_secs: u64,
    pub scheduler_tick_secs: u64,
    pub poll_interval_ms: u64,
    /// Where plans, rules and history live; empty means the platform data dir
    pub data_dir: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            model_base_url: "http://localhost:8000/v1".to_string(),
            model_api_key: "EMPTY".to_string(),
            model_name: "autoglm-phone-9b".to_string(),
            model_max_retries: DEFAULT_MAX_RETRIES,
            model_retry_delay: DEFAULT_RETRY_DELAY_SECS,
            workflow_base_url: String::new(),
            workflow_api_key: String::new(),
            workflow_user: "phone-orchestrator".to_string(),
            device_ids: Vec::new(),
            adb_path: "adb".to_string(),
            lang: "cn".to_string(),
            max_steps: 100,
            max_retries: 2,
            step_timeout_secs: 600,
            decision_timeout_secs: 120,
            action_timeout_secs: 30,
            scheduler_tick_secs: 10,
            poll_interval_ms: 2000,
            data_dir: String::new(),
        }
    }
}

fn parse_into<T: FromStr>(target: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *target = parsed;
    }
}

impl OrchestratorSettings {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load settings from the config file.
    pub fn load() -> Self {
        let loaded: Self = Self::settings_path()
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        loaded.backfilled()
    }

    /// Config file first, then the environment (including `.env`).
    pub fn from_env() -> Self {
        let mut settings = Self::load();
        settings.apply_env();
        settings
    }

    /// Fill fields older config files left empty or zero.
    fn backfilled(mut self) -> Self {
        let defaults = Self::default();
        if self.model_base_url.is_empty() {
            self.model_base_url = defaults.model_base_url;
        }
        if self.model_name.is_empty() {
            self.model_name = defaults.model_name;
        }
        if self.workflow_user.is_empty() {
            self.workflow_user = defaults.workflow_user;
        }
        if self.adb_path.is_empty() {
            self.adb_path = defaults.adb_path;
        }
        if self.lang.is_empty() {
            self.lang = defaults.lang;
        }
        if self.max_steps == 0 {
            self.max_steps = defaults.max_steps;
        }
        if self.step_timeout_secs == 0 {
            self.step_timeout_secs = defaults.step_timeout_secs;
        }
        if self.decision_timeout_secs == 0 {
            self.decision_timeout_secs = defaults.decision_timeout_secs;
        }
        if self.action_timeout_secs == 0 {
            self.action_timeout_secs = defaults.action_timeout_secs;
        }
        if self.scheduler_tick_secs == 0 {
            self.scheduler_tick_secs = defaults.scheduler_tick_secs;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = defaults.poll_interval_ms;
        }
        self
    }

    /// Override from process environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| env::var(key).ok());
    }

    /// Override from `lookup`; unparsable values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MODEL_BASE_URL") {
            self.model_base_url = v;
        }
        if let Some(v) = lookup("MODEL_API_KEY") {
            self.model_api_key = v;
        }
        if let Some(v) = lookup("MODEL_NAME") {
            self.model_name = v;
        }
        parse_into(&mut self.model_max_retries, lookup("MODEL_MAX_RETRIES"));
        parse_into(&mut self.model_retry_delay, lookup("MODEL_RETRY_DELAY"));
        if let Some(v) = lookup("WORKFLOW_BASE_URL") {
            self.workflow_base_url = v;
        }
        if let Some(v) = lookup("WORKFLOW_API_KEY") {
            self.workflow_api_key = v;
        }
        if let Some(v) = lookup("DEVICE_IDS") {
            self.device_ids = v
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("ADB_PATH") {
            self.adb_path = v;
        }
        if let Some(v) = lookup("AGENT_LANG") {
            self.lang = v;
        }
        parse_into(&mut self.max_steps, lookup("MAX_STEPS"));
        parse_into(&mut self.max_retries, lookup("STEP_MAX_RETRIES"));
        parse_into(&mut self.step_timeout_secs, lookup("STEP_TIMEOUT_SECS"));
        parse_into(&mut self.decision_timeout_secs, lookup("DECISION_TIMEOUT_SECS"));
        parse_into(&mut self.action_timeout_secs, lookup("ACTION_TIMEOUT_SECS"));
        parse_into(&mut self.scheduler_tick_secs, lookup("SCHEDULER_TICK_SECS"));
        if let Some(v) = lookup("DATA_DIR") {
            self.data_dir = v;
        }
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), SettingsError> {
        let dir = Self::config_dir().ok_or(SettingsError::NoConfigDir)?;
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(dir.join("settings.json"), content)?;
        Ok(())
    }

    /// Directory for plans, rules and history.
    pub fn data_path(&self) -> Option<PathBuf> {
        if !self.data_dir.trim().is_empty() {
            return Some(PathBuf::from(self.data_dir.trim()));
        }
        Self::project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    pub fn step_defaults(&self) -> StepDefaults {
        StepDefaults {
            max_retries: self.max_retries,
            timeout: Duration::from_secs(self.step_timeout_secs),
            max_steps: self.max_steps,
        }
    }

    pub fn run_loop_config(&self) -> RunLoopConfig {
        RunLoopConfig {
            decision_timeout: Duration::from_secs(self.decision_timeout_secs),
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            ..Default::default()
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::default()
            .with_base_url(&self.model_base_url)
            .with_api_key(&self.model_api_key)
            .with_model_name(&self.model_name)
            .with_max_retries(self.model_max_retries)
            .with_retry_delay(self.model_retry_delay)
            .with_request_timeout(Duration::from_secs(self.decision_timeout_secs))
    }

    /// Remote workflow connection, when one is configured.
    pub fn remote_config(&self) -> Option<RemoteWorkflowConfig> {
        if self.workflow_base_url.trim().is_empty() {
            return None;
        }
        let mut config =
            RemoteWorkflowConfig::new(self.workflow_base_url.trim(), &self.workflow_api_key)
                .with_max_retries(self.model_max_retries)
                .with_retry_delay(Duration::from_secs(self.model_retry_delay));
        config.user_id = self.workflow_user.clone();
        config.request_timeout = Duration::from_secs(self.decision_timeout_secs);
        Some(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MODEL_NAME", "other-model"),
            ("DEVICE_IDS", "emulator-5554, 192.168.1.5:5555,,"),
            ("MAX_STEPS", "42"),
            ("STEP_TIMEOUT_SECS", "not a number"),
            ("WORKFLOW_BASE_URL", "https://flow.example/v1"),
        ]
        .into_iter()
        .collect();

        let mut settings = OrchestratorSettings::default();
        settings.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.model_name, "other-model");
        assert_eq!(settings.device_ids, vec!["emulator-5554", "192.168.1.5:5555"]);
        assert_eq!(settings.max_steps, 42);
        assert_eq!(settings.step_timeout_secs, 600);
        assert_eq!(
            settings.remote_config().unwrap().base_url,
            "https://flow.example/v1"
        );
    }

    #[test]
    fn test_backfill_of_old_config() {
        let old: OrchestratorSettings =
            serde_json::from_str(r#"{"model_name": "", "max_steps": 0, "lang": "en"}"#).unwrap();
        let settings = old.backfilled();
        assert_eq!(settings.model_name, "autoglm-phone-9b");
        assert_eq!(settings.max_steps, 100);
        assert_eq!(settings.lang, "en");
    }

    #[test]
    fn test_no_remote_without_url() {
        assert!(OrchestratorSettings::default().remote_config().is_none());
    }

    #[test]
    fn test_derived_configs() {
        let settings = OrchestratorSettings {
            step_timeout_secs: 30,
            data_dir: "/tmp/orchestrator".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.step_defaults().timeout, Duration::from_secs(30));
        assert_eq!(settings.data_path(), Some(PathBuf::from("/tmp/orchestrator")));
        assert_eq!(settings.model_config().model_name, "autoglm-phone-9b");
    }
}
