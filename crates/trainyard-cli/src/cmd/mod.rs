pub mod classify;
pub mod run;

use std::path::Path;
use std::process::ExitCode;

use trainyard_core::config::{ProjectConfig, load_config};
use trainyard_core::error::ErrorCode;

use crate::output::{CliError, OutputMode, render_error};

/// Layered config files with environment overrides applied.
pub fn resolve_config(project_root: &Path, explicit: Option<&Path>) -> Result<ProjectConfig, CliError> {
    load_config(project_root, explicit)
        .map_err(|err| CliError::coded(format!("{err:#}"), ErrorCode::ConfigParseError))
}

/// Render a startup error; the process exits with status 1.
pub fn fatal(output: OutputMode, error: &CliError) -> anyhow::Result<ExitCode> {
    render_error(output, error)?;
    Ok(ExitCode::FAILURE)
}
