//! `trainyard run` — grouping, estimate reconciliation and hygiene passes.
//!
//! JSON output is the serialized operation log plus a few totals. Exit
//! status is 2 when any group or aggregate was abandoned.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Args, ValueEnum};
use serde::Serialize;
use tracing::{error, info};
use trainyard_core::config::{ProjectConfig, resolve_credentials};
use trainyard_core::error::{ConfigError, ErrorCode};
use trainyard_core::estimate::{EstimatePass, EstimatePolicy, format_estimate};
use trainyard_core::grouping::GroupingEngine;
use trainyard_core::hygiene::HygienePass;
use trainyard_core::memory::{MemoryTracker, TrackerCall};
use trainyard_core::model::WorkItem;
use trainyard_core::oplog::{OperationKind, OperationLog};
use trainyard_core::tracker::{ItemFilter, TrackerClient};

use crate::ado::AdoClient;
use crate::cmd::{fatal, resolve_config};
use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render_mode};

/// Exit status when the run finished but abandoned at least one group or aggregate.
const PARTIAL_FAILURE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pass {
    Grouping,
    EstimateReconcile,
    Hygiene,
}

/// Arguments for `trainyard run`.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Pass to run (repeatable). Defaults to every pass.
    #[arg(long = "pass", value_enum, value_name = "PASS")]
    pub passes: Vec<Pass>,

    /// Only consider the first N ranked items.
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Area path to scan and to file new aggregates under.
    #[arg(long, value_name = "PATH")]
    pub area: Option<String>,

    /// Correct stored estimates on manually authored aggregates too.
    #[arg(long)]
    pub reconcile_all: bool,

    /// Run against a JSON array of work items instead of Azure DevOps.
    #[arg(long, value_name = "FILE")]
    pub fixture: Option<PathBuf>,
}

impl RunArgs {
    /// Selected passes in execution order, each once.
    fn selected_passes(&self) -> Vec<Pass> {
        if self.passes.is_empty() {
            return vec![Pass::Grouping, Pass::EstimateReconcile, Pass::Hygiene];
        }
        let mut passes = self.passes.clone();
        passes.sort_unstable();
        passes.dedup();
        passes
    }

    fn apply(&self, config: &mut ProjectConfig) {
        if let Some(area) = &self.area {
            config.grouping.area_path = Some(area.clone());
        }
        if self.reconcile_all {
            config.estimate.policy = EstimatePolicy::All;
        }
        if self.fixture.is_some() {
            config.grouping.group_delay_ms = 0;
        }
    }
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    source: &'static str,
    passes: Vec<Pass>,
    created: usize,
    updated: usize,
    added_relations: usize,
    #[serde(flatten)]
    log: &'a OperationLog,
    /// Writes the run would have issued; fixture mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    mutations: Option<Vec<TrackerCall>>,
}

/// Execute `trainyard run`.
pub fn run_run(
    args: &RunArgs,
    config_path: Option<&Path>,
    output: OutputMode,
    project_root: &Path,
) -> anyhow::Result<ExitCode> {
    let mut config = match resolve_config(project_root, config_path) {
        Ok(config) => config,
        Err(err) => return fatal(output, &err),
    };
    args.apply(&mut config);
    let passes = args.selected_passes();

    let (log, source, mutations) = if let Some(path) = &args.fixture {
        let tracker = match load_fixture(path, &config.tracker.aggregate_type) {
            Ok(tracker) => tracker,
            Err(err) => {
                return fatal(
                    output,
                    &CliError::coded(format!("{err:#}"), ErrorCode::FixtureLoadFailed),
                );
            }
        };
        let log = match execute(&passes, args.limit, &config, &tracker) {
            Ok(log) => log,
            Err(err) => return fatal(output, &CliError::from(&err)),
        };
        (log, "fixture", Some(tracker.mutations()))
    } else {
        let credentials = match resolve_credentials(&config.tracker, |key| std::env::var(key).ok()) {
            Ok(credentials) => credentials,
            Err(err) => return fatal(output, &CliError::from(&err)),
        };
        let client = match AdoClient::new(&credentials, &config.tracker) {
            Ok(client) => client,
            Err(err) => return fatal(output, &CliError::coded(err.to_string(), err.code())),
        };
        let log = match execute(&passes, args.limit, &config, &client) {
            Ok(log) => log,
            Err(err) => return fatal(output, &CliError::from(&err)),
        };
        (log, "azure-devops", None)
    };

    let report = RunReport {
        source,
        passes,
        created: log.count(OperationKind::Created),
        updated: log.count(OperationKind::Updated),
        added_relations: log.added_relations(),
        log: &log,
        mutations,
    };
    render_mode(output, &report, render_text, render_pretty)?;

    if log.has_failures() {
        Ok(ExitCode::from(PARTIAL_FAILURE))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn load_fixture(path: &Path, aggregate_type: &str) -> anyhow::Result<MemoryTracker> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let items: Vec<WorkItem> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse fixture {}", path.display()))?;
    info!(items = items.len(), fixture = %path.display(), "loaded fixture");
    Ok(MemoryTracker::with_items(aggregate_type, items))
}

/// Run `passes` against `client`. Only configuration problems abort the run.
fn execute<C>(
    passes: &[Pass],
    limit: Option<usize>,
    config: &ProjectConfig,
    client: &C,
) -> Result<OperationLog, ConfigError>
where
    C: TrackerClient + ?Sized,
{
    let engine = GroupingEngine::new(client, &config.grouping)?;
    let area = config.grouping.require_area_path()?;
    let mut log = OperationLog::new();
    let mut aggregates: Option<Vec<WorkItem>> = None;

    for pass in passes {
        info!(?pass, "starting pass");
        match pass {
            Pass::Grouping => {
                let filter = ItemFilter {
                    area_path: Some(area.to_string()),
                    item_types: config.tracker.member_types.clone(),
                    limit,
                };
                if let Some(items) = query(client, &filter, "ranked backlog", &mut log) {
                    engine.run(&items, &mut log);
                }
            }
            Pass::EstimateReconcile => {
                if let Some(found) = aggregates_under(client, config, area, &mut aggregates, &mut log) {
                    EstimatePass::new(client, &config.grouping.system_tag, config.estimate.policy)
                        .run(found, &mut log);
                }
            }
            Pass::Hygiene => {
                if let Some(found) = aggregates_under(client, config, area, &mut aggregates, &mut log) {
                    HygienePass::new(client).run(found, &mut log);
                }
            }
        }
    }

    Ok(log)
}

/// Aggregates are listed once, after grouping has had a chance to create new ones.
fn aggregates_under<'a, C>(
    client: &C,
    config: &ProjectConfig,
    area: &str,
    cache: &'a mut Option<Vec<WorkItem>>,
    log: &mut OperationLog,
) -> Option<&'a [WorkItem]>
where
    C: TrackerClient + ?Sized,
{
    if cache.is_none() {
        let filter = ItemFilter {
            area_path: Some(area.to_string()),
            item_types: vec![config.tracker.aggregate_type.clone()],
            limit: None,
        };
        *cache = query(client, &filter, "aggregate list", log);
    }
    cache.as_deref()
}

fn query<C>(client: &C, filter: &ItemFilter, what: &str, log: &mut OperationLog) -> Option<Vec<WorkItem>>
where
    C: TrackerClient + ?Sized,
{
    match client.query_items(filter) {
        Ok(items) => Some(items),
        Err(err) => {
            error!(%err, what, "query failed; skipping pass");
            log.fail(what, None, err.code(), &err);
            None
        }
    }
}

fn render_text(report: &RunReport<'_>, w: &mut dyn Write) -> std::io::Result<()> {
    for op in &report.log.operations {
        let kind = match op.kind {
            OperationKind::Created => "created",
            OperationKind::Updated => "updated",
        };
        write!(
            w,
            "{kind}  {}  {}  members={}  links={}",
            op.aggregate_id, op.title, op.member_count, op.added_relations
        )?;
        if let Some(previous) = op.recovered_from {
            write!(w, "  replaces={previous}")?;
        }
        writeln!(w)?;
    }
    for change in &report.log.estimate_updates {
        writeln!(
            w,
            "estimate  {}  {}  {} -> {}",
            change.aggregate_id,
            change.title,
            change
                .previous
                .map_or_else(|| "-".to_string(), format_estimate),
            format_estimate(change.total)
        )?;
    }
    for warning in &report.log.warnings {
        writeln!(w, "warning  {:?}  {}", warning.kind, warning.message)?;
    }
    for failure in &report.log.failures {
        writeln!(w, "failed  {}  {}  {}", failure.code, failure.subject, failure.error)?;
    }
    for finding in &report.log.findings {
        writeln!(
            w,
            "{}  {}  {}  {}",
            finding.severity, finding.rule, finding.item_id, finding.message
        )?;
    }
    writeln!(
        w,
        "summary  created={}  updated={}  links={}  warnings={}  failures={}",
        report.created,
        report.updated,
        report.added_relations,
        report.log.warnings.len(),
        report.log.failures.len()
    )
}

fn render_pretty(report: &RunReport<'_>, w: &mut dyn Write) -> std::io::Result<()> {
    let log = report.log;
    pretty_section(w, "Release trains")?;
    if log.operations.is_empty() {
        writeln!(w, "  (no groups found)")?;
    }
    for op in &log.operations {
        let verb = match (op.kind, op.recovered_from) {
            (OperationKind::Created, Some(_)) => "✓ recreated",
            (OperationKind::Created, None) => "✓ created",
            (OperationKind::Updated, _) => "✓ updated",
        };
        writeln!(w, "  {verb} #{} {}", op.aggregate_id, op.title)?;
        let mut detail = format!(
            "      {} members, {} new links",
            op.member_count, op.added_relations
        );
        if let Some(previous) = op.recovered_from {
            detail.push_str(&format!(", replaces missing #{previous}"));
        }
        writeln!(w, "{detail}")?;
    }

    if !log.estimate_updates.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Estimates")?;
        for change in &log.estimate_updates {
            writeln!(
                w,
                "  #{} {}: {} → {}",
                change.aggregate_id,
                change.title,
                change
                    .previous
                    .map_or_else(|| "none".to_string(), format_estimate),
                format_estimate(change.total)
            )?;
        }
    }

    if !log.warnings.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Warnings")?;
        for warning in &log.warnings {
            writeln!(w, "  ! {}", warning.message)?;
        }
    }

    if !log.failures.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Failures")?;
        for failure in &log.failures {
            writeln!(w, "  ✗ [{}] {}: {}", failure.code, failure.subject, failure.error)?;
        }
    }

    if !log.findings.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Hygiene")?;
        for finding in &log.findings {
            writeln!(w, "  {:<8} {}", finding.severity, finding.message)?;
        }
    }

    if let Some(mutations) = &report.mutations {
        writeln!(w)?;
        pretty_kv(w, "fixture", format!("{} writes simulated", mutations.len()))?;
    }

    writeln!(w)?;
    pretty_kv(
        w,
        "summary",
        format!(
            "{} created, {} updated, {} links, {} warnings, {} failures",
            report.created,
            report.updated,
            report.added_relations,
            log.warnings.len(),
            log.failures.len()
        ),
    )
}
