//! Scalar samples and environment facts

use serde::{Deserialize, Serialize};

/// One sampled value of a named metric, stored as a fixed-point number
///
/// `value` is scaled by `10^num_fraction_digits`: a load average of 1.23 is
/// stored as value 123 with 2 fraction digits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarDataPoint {
    pub timestamp_millis: i64,
    pub name: String,
    pub value: i64,
    pub num_fraction_digits: u8,
}

impl ScalarDataPoint {
    pub fn new(
        timestamp_millis: i64,
        name: impl Into<String>,
        value: i64,
        num_fraction_digits: u8,
    ) -> Self {
        Self {
            timestamp_millis,
            name: name.into(),
            value,
            num_fraction_digits,
        }
    }

    /// Render the fixed-point value, e.g. `123` with 2 digits as `"1.23"`
    pub fn formatted_value(&self) -> String {
        if self.num_fraction_digits == 0 {
            return self.value.to_string();
        }

        let digits = self.num_fraction_digits as usize;
        let sign = if self.value < 0 { "-" } else { "" };
        let raw = format!("{:0>width$}", self.value.unsigned_abs(), width = digits + 1);
        let (int_part, frac_part) = raw.split_at(raw.len() - digits);
        format!("{}{}.{}", sign, int_part, frac_part)
    }

    /// Approximate floating point value, for display and export only
    pub fn as_f64(&self) -> f64 {
        self.value as f64 / 10f64.powi(self.num_fraction_digits as i32)
    }
}

/// A discrete fact about the environment, e.g. an environment variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentData {
    /// Hierarchical name, e.g. `["env", "PATH"]`
    pub name: Vec<String>,
    pub value: String,
}

impl EnvironmentData {
    pub fn new(name: Vec<String>, value: impl Into<String>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}
