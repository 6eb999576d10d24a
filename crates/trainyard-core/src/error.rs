use std::fmt;

use crate::model::item::ItemId;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    MissingCredential,
    MissingTrackerTarget,
    MissingAreaPath,
    InvalidMarkerSyntax,
    Unauthorized,
    TransportFailure,
    UpstreamRejected,
    DecodeFailure,
    InvalidCreatedId,
    FixtureLoadFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::MissingCredential => "E1002",
            Self::MissingTrackerTarget => "E1003",
            Self::MissingAreaPath => "E1004",
            Self::InvalidMarkerSyntax => "E1005",
            Self::Unauthorized => "E2001",
            Self::TransportFailure => "E2002",
            Self::UpstreamRejected => "E2003",
            Self::DecodeFailure => "E2004",
            Self::InvalidCreatedId => "E3001",
            Self::FixtureLoadFailed => "E4001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::MissingCredential => "No access token configured",
            Self::MissingTrackerTarget => "Organization or project not configured",
            Self::MissingAreaPath => "Area path not configured",
            Self::InvalidMarkerSyntax => "Invalid marker syntax settings",
            Self::Unauthorized => "Tracker rejected the credential",
            Self::TransportFailure => "Tracker request failed",
            Self::UpstreamRejected => "Tracker rejected the request",
            Self::DecodeFailure => "Unexpected tracker response",
            Self::InvalidCreatedId => "Tracker returned an invalid id",
            Self::FixtureLoadFailed => "Fixture file could not be loaded",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .trainyard/config.toml and retry."),
            Self::MissingCredential => {
                Some("Export TRAINYARD_PAT (or AZURE_DEVOPS_EXT_PAT) with a personal access token.")
            }
            Self::MissingTrackerTarget => {
                Some("Set tracker.organization and tracker.project, or TRAINYARD_ORG / TRAINYARD_PROJECT.")
            }
            Self::MissingAreaPath => Some("Set grouping.area_path or pass --area."),
            Self::InvalidMarkerSyntax => {
                Some("Decoration characters must be punctuation and the suffix alphanumeric.")
            }
            Self::Unauthorized => Some("Check the token scopes (Work Items: Read & Write)."),
            Self::TransportFailure => Some("Check network connectivity and retry."),
            Self::UpstreamRejected | Self::DecodeFailure | Self::InvalidCreatedId => None,
            Self::FixtureLoadFailed => Some("The fixture must be a JSON array of work items."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failures reported by a tracker client.
///
/// A clean "not found" is not an error: fetch calls return `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The credential was rejected (HTTP 401/403).
    #[error("unauthorized (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Any other non-success status.
    #[error("tracker returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// The response body did not have the expected shape.
    #[error("could not decode tracker response: {0}")]
    Decode(String),
}

impl TrackerError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(_) => ErrorCode::TransportFailure,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::Api { .. } => ErrorCode::UpstreamRejected,
            Self::Decode(_) => ErrorCode::DecodeFailure,
        }
    }
}

/// Hard failure while processing one group or aggregate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("tracker returned non-positive id {0} for a new aggregate")]
    InvalidCreatedId(ItemId),
}

impl EngineError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Tracker(err) => err.code(),
            Self::InvalidCreatedId(_) => ErrorCode::InvalidCreatedId,
        }
    }
}

/// Startup errors that abort the run before any group is processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no access token found in {0}")]
    MissingCredential(String),

    #[error("tracker {0} is not configured")]
    MissingTrackerTarget(&'static str),

    #[error("grouping.area_path is not configured")]
    MissingAreaPath,

    #[error("invalid marker syntax: {0}")]
    InvalidMarkerSyntax(String),
}

impl ConfigError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingCredential(_) => ErrorCode::MissingCredential,
            Self::MissingTrackerTarget(_) => ErrorCode::MissingTrackerTarget,
            Self::MissingAreaPath => ErrorCode::MissingAreaPath,
            Self::InvalidMarkerSyntax(_) => ErrorCode::InvalidMarkerSyntax,
        }
    }
}
