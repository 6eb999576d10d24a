//! Title classification for release-train markers.
//!
//! An item title can open a group, close one, or be ordinary:
//!
//! ```text
//! ----- Q1 Release -----rt          open, new aggregate
//! ----- GCCH -----rt:4160082        open, existing aggregate 4160082
//! ------------                      separator (closes the open group)
//! Feature A                         plain
//! ```
//!
//! The decoration characters, the minimum run length and the suffix token
//! all come from [`GroupingConfig`].

use regex::Regex;
use tracing::warn;

use crate::config::GroupingConfig;
use crate::error::ConfigError;
use crate::model::ItemId;

/// Result of classifying a single title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleMatch {
    Open(OpenMarker),
    Close,
    Plain,
}

/// Payload of an opening marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMarker {
    /// Name with decoration and surrounding whitespace removed.
    pub name: String,
    /// Aggregate id parsed from the `:<id>` suffix.
    pub existing_id: Option<ItemId>,
    /// Raw `:<text>` value when it was present but not a positive integer.
    pub malformed_id: Option<String>,
}

/// Compiled marker grammar.
#[derive(Debug, Clone)]
pub struct TitleMatcher {
    open: Regex,
    decoration: Vec<char>,
    min_run: usize,
    suffix: String,
    canonical_run: usize,
}

impl TitleMatcher {
    /// Build a matcher from validated grouping settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMarkerSyntax`] if the settings are rejected.
    pub fn new(config: &GroupingConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let decoration: Vec<char> = config.decoration.chars().collect();
        let class: String = decoration
            .iter()
            .map(|c| regex::escape(&c.to_string()))
            .collect();
        let run = format!("[{class}]{{{},}}", config.min_run);
        let pattern = format!(
            r"^\s*{run}\s*(?P<name>.*?)\s*{run}\s*(?i:{suffix})(?:\s*:\s*(?P<id>\S*))?\s*$",
            suffix = regex::escape(&config.suffix),
        );
        let open =
            Regex::new(&pattern).map_err(|err| ConfigError::InvalidMarkerSyntax(err.to_string()))?;

        Ok(Self {
            open,
            decoration,
            min_run: config.min_run,
            suffix: config.suffix.clone(),
            canonical_run: config.canonical_run,
        })
    }

    /// Classify one title. Open takes precedence over the separator rule.
    #[must_use]
    pub fn classify(&self, title: &str) -> TitleMatch {
        if let Some(marker) = self.match_open(title) {
            return TitleMatch::Open(marker);
        }
        if self.is_separator(title) {
            return TitleMatch::Close;
        }
        TitleMatch::Plain
    }

    /// Canonical open-marker title embedding `id`, e.g. `----- Q1 -----rt:42`.
    #[must_use]
    pub fn canonical_title(&self, name: &str, id: ItemId) -> String {
        let fill = self.decoration.first().copied().unwrap_or('-');
        let run: String = std::iter::repeat_n(fill, self.canonical_run).collect();
        format!("{run} {name} {run}{}:{id}", self.suffix)
    }

    /// Strip decoration characters and whitespace from both ends until none remain.
    #[must_use]
    pub fn clean_name(&self, raw: &str) -> String {
        raw.trim_matches(|c: char| c.is_whitespace() || self.decoration.contains(&c))
            .to_string()
    }

    fn match_open(&self, title: &str) -> Option<OpenMarker> {
        let captures = self.open.captures(title)?;
        let name = self.clean_name(captures.name("name").map_or("", |m| m.as_str()));
        if name.is_empty() {
            return None;
        }

        let (existing_id, malformed_id) = match captures.name("id").map(|m| m.as_str()) {
            None => (None, None),
            Some(raw) => match raw.parse::<ItemId>() {
                Ok(id) if id > 0 => (Some(id), None),
                _ => {
                    warn!(title, raw, "ignoring malformed aggregate id in marker");
                    (None, Some(raw.to_string()))
                }
            },
        };

        Some(OpenMarker {
            name,
            existing_id,
            malformed_id,
        })
    }

    /// A title whose first `min_run` non-blank characters are all decoration.
    fn is_separator(&self, title: &str) -> bool {
        let mut chars = title.trim_start().chars();
        (0..self.min_run).all(|_| chars.next().is_some_and(|c| self.decoration.contains(&c)))
    }
}
