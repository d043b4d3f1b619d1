//! # Fixture Errors
//!
//! Error taxonomy for containerized database fixtures.
//!
//! - Uses `thiserror` for structured error definitions
//! - Every error names the setup stage that produced it, so a failed fixture
//!   tells the test author whether the container, the connection or the
//!   migrations were at fault

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stage of fixture setup (or teardown) that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStage {
    Configure,
    Start,
    Discover,
    Address,
    Connect,
    Migrate,
    Teardown
}

impl SetupStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupStage::Configure => "configure",
            SetupStage::Start => "start",
            SetupStage::Discover => "discover",
            SetupStage::Address => "address",
            SetupStage::Connect => "connect",
            SetupStage::Migrate => "migrate",
            SetupStage::Teardown => "teardown"
        }
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while provisioning or releasing a database fixture.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Invalid fixture configuration: {reason}")]
    Configuration { reason: String },

    #[error("Container {image} failed to start: {reason}")]
    ContainerStart { image: String, reason: String },

    #[error("Container {image} not started within {timeout:?}")]
    StartTimeout { image: String, timeout: Duration },

    #[error("Container discovery failed for {what}: {reason}")]
    Discovery { what: String, reason: String },

    #[error("Invalid connection address: {reason}")]
    InvalidAddress { reason: String },

    #[error(
        "Database not ready within {timeout:?} after {attempts} probe attempts: {}",
        .last_error.as_deref().unwrap_or("no probe completed")
    )]
    ReadinessTimeout {
        timeout: Duration,
        attempts: u32,
        last_error: Option<String>
    },

    #[error("Migration from {source_path} failed: {reason}")]
    Migration { source_path: String, reason: String },

    #[error("Teardown of {resource} failed: {reason}")]
    Teardown { resource: String, reason: String }
}

impl FixtureError {
    /// The setup stage this error belongs to.
    pub fn stage(&self) -> SetupStage {
        match self {
            FixtureError::Configuration { .. } => SetupStage::Configure,
            FixtureError::ContainerStart { .. } | FixtureError::StartTimeout { .. } => {
                SetupStage::Start
            }
            FixtureError::Discovery { .. } => SetupStage::Discover,
            FixtureError::InvalidAddress { .. } => SetupStage::Address,
            FixtureError::ReadinessTimeout { .. } => SetupStage::Connect,
            FixtureError::Migration { .. } => SetupStage::Migrate,
            FixtureError::Teardown { .. } => SetupStage::Teardown
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FixtureError::ReadinessTimeout { .. } | FixtureError::StartTimeout { .. }
        )
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        FixtureError::Configuration {
            reason: reason.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_mapping() {
        let err = FixtureError::ContainerStart {
            image: "postgres:16-alpine".to_string(),
            reason: "no docker".to_string()
        };
        assert_eq!(err.stage(), SetupStage::Start);

        let err = FixtureError::Migration {
            source_path: "./migrations".to_string(),
            reason: "syntax error".to_string()
        };
        assert_eq!(err.stage(), SetupStage::Migrate);
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_message_names_last_error() {
        let err = FixtureError::ReadinessTimeout {
            timeout: Duration::from_secs(1),
            attempts: 7,
            last_error: Some("connection refused".to_string())
        };
        assert!(err.is_timeout());
        assert_eq!(err.stage(), SetupStage::Connect);
        let message = err.to_string();
        assert!(message.contains("7 probe attempts"));
        assert!(message.contains("connection refused"));
    }

    #[test]
    fn test_start_timeout_is_a_start_stage_timeout() {
        let err = FixtureError::StartTimeout {
            image: "postgres:16-alpine".to_string(),
            timeout: Duration::from_millis(500)
        };
        assert!(err.is_timeout());
        assert_eq!(err.stage(), SetupStage::Start);
        assert_eq!(
            err.to_string(),
            "Container postgres:16-alpine not started within 500ms"
        );
    }

    #[test]
    fn test_timeout_message_without_probe() {
        let err = FixtureError::ReadinessTimeout {
            timeout: Duration::from_millis(5),
            attempts: 0,
            last_error: None
        };
        assert!(err.to_string().ends_with("no probe completed"));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(SetupStage::Connect.to_string(), "connect");
        assert_eq!(
            serde_json::to_string(&SetupStage::Migrate).unwrap(),
            "\"migrate\""
        );
    }
}
