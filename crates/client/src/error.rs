use parlor_storage::StorageError;
use snafu::Snafu;

use crate::copilot::CopilotError;
use crate::session::SessionError;
use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("{field} must not be empty"))]
    EmptyInput {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("no active session, set a display name first"))]
    NoSession { stage: &'static str },
    #[snafu(display("no conversation selected"))]
    NoSelection { stage: &'static str },
    #[snafu(display("conversation '{reference}' is not in the current list"))]
    UnknownConversation {
        stage: &'static str,
        reference: String,
    },
    #[snafu(display("backend request failed on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("session update failed on `{stage}`: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("saving settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("copilot reply failed on `{stage}`: {source}"))]
    Copilot {
        stage: &'static str,
        source: CopilotError,
    },
}

impl ClientError {
    /// True when the command was rejected locally, before reaching the backend.
    pub fn is_validation(&self) -> bool {
        match self {
            Self::EmptyInput { .. } | Self::NoSession { .. } | Self::NoSelection { .. } => true,
            Self::Session { source, .. } => source.is_validation(),
            Self::Backend { source, .. } => source.is_validation(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::UnknownConversation { .. } => true,
            Self::Backend { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
