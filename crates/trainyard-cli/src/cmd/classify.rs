//! `trainyard classify` — show how titles are read by the marker matcher.

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use clap::Args;
use serde::Serialize;
use trainyard_core::marker::{TitleMatch, TitleMatcher};
use trainyard_core::model::ItemId;

use crate::cmd::{fatal, resolve_config};
use crate::output::{CliError, OutputMode, render};

/// Arguments for `trainyard classify`.
#[derive(Args, Debug)]
pub struct ClassifyArgs {
    /// Titles to classify.
    #[arg(required = true, value_name = "TITLE")]
    pub titles: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Kind {
    Open,
    Close,
    Plain,
}

#[derive(Debug, Serialize)]
struct Classification {
    title: String,
    kind: Kind,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    existing_id: Option<ItemId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    malformed_id: Option<String>,
}

fn classify(matcher: &TitleMatcher, title: &str) -> Classification {
    let mut out = Classification {
        title: title.to_string(),
        kind: Kind::Plain,
        name: None,
        existing_id: None,
        malformed_id: None,
    };
    match matcher.classify(title) {
        TitleMatch::Open(marker) => {
            out.kind = Kind::Open;
            out.name = Some(marker.name);
            out.existing_id = marker.existing_id;
            out.malformed_id = marker.malformed_id;
        }
        TitleMatch::Close => out.kind = Kind::Close,
        TitleMatch::Plain => {}
    }
    out
}

/// Execute `trainyard classify`.
pub fn run_classify(
    args: &ClassifyArgs,
    config_path: Option<&Path>,
    output: OutputMode,
    project_root: &Path,
) -> anyhow::Result<ExitCode> {
    let config = match resolve_config(project_root, config_path) {
        Ok(config) => config,
        Err(err) => return fatal(output, &err),
    };
    let matcher = match TitleMatcher::new(&config.grouping) {
        Ok(matcher) => matcher,
        Err(err) => return fatal(output, &CliError::from(&err)),
    };

    let results: Vec<Classification> = args
        .titles
        .iter()
        .map(|title| classify(&matcher, title))
        .collect();
    render(output, &results, |rows, w| render_human(rows, w))?;
    Ok(ExitCode::SUCCESS)
}

fn render_human(rows: &[Classification], w: &mut dyn Write) -> std::io::Result<()> {
    for row in rows {
        match row.kind {
            Kind::Open => {
                let target = match (row.existing_id, &row.malformed_id) {
                    (Some(id), _) => format!("aggregate {id}"),
                    (None, Some(raw)) => format!("new aggregate (ignoring malformed id {raw:?})"),
                    (None, None) => "new aggregate".to_string(),
                };
                writeln!(
                    w,
                    "open   {:?} -> {target}",
                    row.name.as_deref().unwrap_or_default()
                )?;
            }
            Kind::Close => writeln!(w, "close  {:?}", row.title)?,
            Kind::Plain => writeln!(w, "plain  {:?}", row.title)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainyard_core::config::GroupingConfig;

    fn matcher() -> TitleMatcher {
        TitleMatcher::new(&GroupingConfig::default()).expect("matcher")
    }

    #[test]
    fn classifies_each_kind() {
        let m = matcher();
        let open = classify(&m, "----- GCCH -----rt:4160082");
        assert_eq!(open.kind, Kind::Open);
        assert_eq!(open.name.as_deref(), Some("GCCH"));
        assert_eq!(open.existing_id, Some(4_160_082));

        assert_eq!(classify(&m, "------------").kind, Kind::Close);
        assert_eq!(classify(&m, "Feature A").kind, Kind::Plain);
    }

    #[test]
    fn human_output_explains_malformed_ids() {
        let rows = vec![classify(&matcher(), "----- X -----rt:abc")];
        let mut buf = Vec::new();
        render_human(&rows, &mut buf).expect("render");
        let text = String::from_utf8(buf).expect("utf8");
        assert_eq!(
            text,
            "open   \"X\" -> new aggregate (ignoring malformed id \"abc\")\n"
        );
    }
}
