//! System load average probe

use std::fs;
use std::path::PathBuf;

use super::{Mementos, ScalarProbe, ScalarResults};
use crate::data::ScalarDataPoint;
use crate::error::{Error, Result};

const LOADAVG_PATH: &str = "/proc/loadavg";

/// Fraction digits of the published load averages
const LOAD_DIGITS: u8 = 2;

/// Publishes the 1, 5 and 15 minute load averages as
/// `load-1-minute`, `load-5-minutes` and `load-15-minutes`
#[derive(Debug, Clone)]
pub struct SystemLoadProbe {
    path: PathBuf,
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemLoadProbe {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(LOADAVG_PATH),
        }
    }

    /// Read from a different file, e.g. a fixture
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ScalarProbe for SystemLoadProbe {
    fn name(&self) -> &str {
        "system-load"
    }

    fn contribute(
        &self,
        results: &mut ScalarResults,
        timestamp_millis: i64,
        _mementos: &Mementos,
    ) -> Result<()> {
        let content = fs::read_to_string(&self.path)?;
        let [one, five, fifteen] = parse_loadavg(&content)?;

        for (name, value) in [
            ("load-1-minute", one),
            ("load-5-minutes", five),
            ("load-15-minutes", fifteen),
        ] {
            results.insert(
                name.to_string(),
                ScalarDataPoint::new(timestamp_millis, name, value, LOAD_DIGITS),
            );
        }
        Ok(())
    }
}

/// Parse the first three fields of `/proc/loadavg` as fixed-point values with
/// two fraction digits
pub fn parse_loadavg(content: &str) -> Result<[i64; 3]> {
    let mut fields = content.split_whitespace();
    let mut values = [0i64; 3];
    for value in values.iter_mut() {
        let field = fields
            .next()
            .ok_or_else(|| Error::Parse(format!("truncated loadavg: {:?}", content)))?;
        *value = parse_fixed(field, LOAD_DIGITS)?;
    }
    Ok(values)
}

/// `"1.5"` with 2 digits becomes 150
fn parse_fixed(field: &str, digits: u8) -> Result<i64> {
    let invalid = || Error::Parse(format!("invalid decimal: {:?}", field));

    let (int_part, frac_part) = field.split_once('.').unwrap_or((field, ""));
    if frac_part.len() > digits as usize {
        return Err(invalid());
    }
    let int_value: i64 = int_part.parse().map_err(|_| invalid())?;
    let frac_value: i64 = if frac_part.is_empty() {
        0
    } else {
        frac_part.parse().map_err(|_| invalid())?
    };
    let scale = 10i64.pow(digits as u32);
    let frac_scale = 10i64.pow(digits as u32 - frac_part.len() as u32);
    Ok(int_value * scale + frac_value * frac_scale)
}
