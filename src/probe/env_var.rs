//! Process environment variables as environment facts

use std::env;

use super::{EnvironmentCollector, EnvironmentProbe};
use crate::error::Result;

/// Contributes `["env", <NAME>] = <value>` for each environment variable,
/// sorted by name. Variables whose name matches one of the configured
/// substrings (case-insensitive) are masked.
#[derive(Debug, Clone)]
pub struct EnvVarProbe {
    masked: Vec<String>,
}

impl Default for EnvVarProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvVarProbe {
    pub fn new() -> Self {
        Self {
            masked: vec![
                "password".to_string(),
                "secret".to_string(),
                "token".to_string(),
            ],
        }
    }

    /// Replace the list of masked name fragments
    pub fn with_masked(masked: Vec<String>) -> Self {
        Self {
            masked: masked.into_iter().map(|m| m.to_lowercase()).collect(),
        }
    }

    fn is_masked(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.masked.iter().any(|m| name.contains(m.as_str()))
    }

    /// Add the given variables to `collector`
    pub fn collect<I>(&self, vars: I, collector: &mut EnvironmentCollector)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars: Vec<(String, String)> = vars.into_iter().collect();
        vars.sort();
        for (name, value) in vars {
            let value = if self.is_masked(&name) {
                "***".to_string()
            } else {
                value
            };
            collector.add(&["env", name.as_str()], value);
        }
    }
}

impl EnvironmentProbe for EnvVarProbe {
    fn name(&self) -> &str {
        "env-vars"
    }

    fn contribute(&self, collector: &mut EnvironmentCollector) -> Result<()> {
        // non-UTF-8 variables are skipped
        let vars = env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        self.collect(vars, collector);
        Ok(())
    }
}
