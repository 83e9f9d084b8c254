//! Error types for the instrumentation engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the instrumentation engine and its collaborators
///
/// Instrumentation misuse is never reported through this type; it is logged and
/// ignored. These errors surface from configuration loading and from probes or
/// sinks, where the robust wrappers absorb them.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Prometheus registry or encoding error
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// A metric or environment probe failed
    #[error("Probe {probe} failed: {reason}")]
    Probe { probe: String, reason: String },

    /// A data sink failed
    #[error("Data sink {sink} failed: {reason}")]
    Sink { sink: String, reason: String },

    /// Malformed input read from the OS
    #[error("Parse error: {0}")]
    Parse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a probe failure
    pub fn probe(probe: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Probe {
            probe: probe.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a sink failure
    pub fn sink(sink: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Sink {
            sink: sink.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::probe("loadavg", "file missing");
        assert_eq!(err.to_string(), "Probe loadavg failed: file missing");

        let err = Error::Config("sampling period must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: sampling period must be positive"
        );
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<u32>("[not, a, number]").unwrap_err();
        let err: Error = yaml_err.into();
        assert!(matches!(err, Error::Yaml(_)));
    }
}
