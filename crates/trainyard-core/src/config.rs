use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::estimate::EstimatePolicy;
use crate::model::RelationKind;

/// Environment variables consulted for the access token, in order.
pub const TOKEN_ENV_VARS: [&str; 2] = ["TRAINYARD_PAT", "AZURE_DEVOPS_EXT_PAT"];

const DEFAULT_HOST: &str = "https://dev.azure.com";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub estimate: EstimateConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Organization name (`contoso`) or URL (`https://dev.azure.com/contoso`).
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_aggregate_type")]
    pub aggregate_type: String,
    #[serde(default = "default_member_types")]
    pub member_types: Vec<String>,
    #[serde(default = "default_rank_field")]
    pub rank_field: String,
    #[serde(default = "default_estimate_field")]
    pub estimate_field: String,
    /// Plain-text field that carries the `[ESTIMATE: n]` prefix.
    #[serde(default = "default_notes_field")]
    pub notes_field: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            organization: None,
            project: None,
            aggregate_type: default_aggregate_type(),
            member_types: default_member_types(),
            rank_field: default_rank_field(),
            estimate_field: default_estimate_field(),
            notes_field: default_notes_field(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Marker syntax and write conventions for the grouping pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Area path that scopes the input query and receives new aggregates.
    #[serde(default)]
    pub area_path: Option<String>,
    /// Tag stamped on every aggregate this tool creates.
    #[serde(default = "default_system_tag")]
    pub system_tag: String,
    /// Characters that may form a decoration run.
    #[serde(default = "default_decoration")]
    pub decoration: String,
    /// Shortest decoration run that counts as a marker or separator.
    #[serde(default = "default_min_run")]
    pub min_run: usize,
    /// Token that follows the closing run of an open marker.
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Run length used when rewriting an anchor title.
    #[serde(default = "default_canonical_run")]
    pub canonical_run: usize,
    #[serde(default = "default_relation")]
    pub relation: RelationKind,
    #[serde(default = "default_provenance_comment")]
    pub provenance_comment: String,
    /// Pause between processed groups.
    #[serde(default = "default_group_delay_ms")]
    pub group_delay_ms: u64,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            area_path: None,
            system_tag: default_system_tag(),
            decoration: default_decoration(),
            min_run: default_min_run(),
            suffix: default_suffix(),
            canonical_run: default_canonical_run(),
            relation: default_relation(),
            provenance_comment: default_provenance_comment(),
            group_delay_ms: default_group_delay_ms(),
        }
    }
}

impl GroupingConfig {
    /// Reject marker settings the title matcher cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMarkerSyntax`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.decoration.is_empty() {
            return Err(ConfigError::InvalidMarkerSyntax(
                "decoration must contain at least one character".to_string(),
            ));
        }
        if let Some(bad) = self
            .decoration
            .chars()
            .find(|c| c.is_alphanumeric() || c.is_whitespace())
        {
            return Err(ConfigError::InvalidMarkerSyntax(format!(
                "decoration character {bad:?} must be punctuation"
            )));
        }
        if self.min_run == 0 {
            return Err(ConfigError::InvalidMarkerSyntax(
                "min_run must be at least 1".to_string(),
            ));
        }
        if self.canonical_run < self.min_run {
            return Err(ConfigError::InvalidMarkerSyntax(format!(
                "canonical_run ({}) is shorter than min_run ({})",
                self.canonical_run, self.min_run
            )));
        }
        if self.suffix.is_empty() || !self.suffix.chars().all(char::is_alphanumeric) {
            return Err(ConfigError::InvalidMarkerSyntax(format!(
                "suffix {:?} must be non-empty and alphanumeric",
                self.suffix
            )));
        }
        Ok(())
    }

    /// The configured area path, required before anything is created.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingAreaPath`] when unset or blank.
    pub fn require_area_path(&self) -> Result<&str, ConfigError> {
        self.area_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .ok_or(ConfigError::MissingAreaPath)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimateConfig {
    #[serde(default)]
    pub policy: EstimatePolicy,
}

/// Resolved connection settings for the tracker client.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub organization_url: String,
    pub project: String,
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("organization_url", &self.organization_url)
            .field("project", &self.project)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Project-local config file location.
#[must_use]
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(".trainyard/config.toml")
}

/// Per-user config file location, if the platform has a config directory.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("trainyard/config.toml"))
}

/// Load and merge config layers; later paths override earlier ones key by key.
///
/// Missing files are skipped.
///
/// # Errors
///
/// Returns an error if a present file cannot be read or is not valid TOML
/// for [`ProjectConfig`].
pub fn load_layered(paths: &[PathBuf]) -> Result<ProjectConfig> {
    let mut merged = toml::Value::Table(toml::Table::new());

    for path in paths {
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let layer = toml::from_str::<toml::Value>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        merge_toml(&mut merged, layer);
    }

    ProjectConfig::deserialize(merged).context("Failed to interpret merged configuration")
}

/// Standard layering: user file, project file, then an explicit `--config`.
///
/// # Errors
///
/// Fails when `explicit` does not exist or any layer fails to load.
pub fn load_config(project_root: &Path, explicit: Option<&Path>) -> Result<ProjectConfig> {
    let mut paths = Vec::new();
    if let Some(user) = user_config_path() {
        paths.push(user);
    }
    paths.push(project_config_path(project_root));
    if let Some(explicit) = explicit {
        if !explicit.exists() {
            anyhow::bail!("config file {} does not exist", explicit.display());
        }
        paths.push(explicit.to_path_buf());
    }

    let mut config = load_layered(&paths)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Apply `TRAINYARD_ORG`, `TRAINYARD_PROJECT` and `TRAINYARD_AREA_PATH`.
pub fn apply_env_overrides(config: &mut ProjectConfig, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(org) = non_empty("TRAINYARD_ORG") {
        config.tracker.organization = Some(org);
    }
    if let Some(project) = non_empty("TRAINYARD_PROJECT") {
        config.tracker.project = Some(project);
    }
    if let Some(area) = non_empty("TRAINYARD_AREA_PATH") {
        config.grouping.area_path = Some(area);
    }
}

/// Resolve organization URL, project and token, failing fast on gaps.
///
/// # Errors
///
/// Returns [`ConfigError::MissingTrackerTarget`] or
/// [`ConfigError::MissingCredential`].
pub fn resolve_credentials(
    tracker: &TrackerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Credentials, ConfigError> {
    let organization = tracker
        .organization
        .as_deref()
        .map(str::trim)
        .filter(|org| !org.is_empty())
        .ok_or(ConfigError::MissingTrackerTarget("organization"))?;
    let project = tracker
        .project
        .as_deref()
        .map(str::trim)
        .filter(|project| !project.is_empty())
        .ok_or(ConfigError::MissingTrackerTarget("project"))?;

    let token = TOKEN_ENV_VARS
        .iter()
        .find_map(|key| lookup(key).filter(|value| !value.trim().is_empty()))
        .ok_or_else(|| ConfigError::MissingCredential(TOKEN_ENV_VARS.join(" or ")))?;

    Ok(Credentials {
        organization_url: organization_url(organization),
        project: project.to_string(),
        token: token.trim().to_string(),
    })
}

fn organization_url(organization: &str) -> String {
    if organization.starts_with("https://") || organization.starts_with("http://") {
        organization.trim_end_matches('/').to_string()
    } else {
        format!("{DEFAULT_HOST}/{organization}")
    }
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn default_aggregate_type() -> String {
    "Release Train".to_string()
}

fn default_member_types() -> Vec<String> {
    vec!["Feature".to_string()]
}

fn default_rank_field() -> String {
    "Microsoft.VSTS.Common.StackRank".to_string()
}

fn default_estimate_field() -> String {
    "Microsoft.VSTS.Scheduling.Effort".to_string()
}

fn default_notes_field() -> String {
    "Custom.Notes".to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_system_tag() -> String {
    "auto-generated".to_string()
}

fn default_decoration() -> String {
    "-".to_string()
}

const fn default_min_run() -> usize {
    3
}

fn default_suffix() -> String {
    "rt".to_string()
}

const fn default_canonical_run() -> usize {
    5
}

const fn default_relation() -> RelationKind {
    RelationKind::Related
}

fn default_provenance_comment() -> String {
    "linked by trainyard".to_string()
}

const fn default_group_delay_ms() -> u64 {
    500
}
