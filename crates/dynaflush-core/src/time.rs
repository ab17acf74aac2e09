//! Event time formatting.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, Utc};

use crate::error::{FlushError, Result};

/// Default format when times are rendered in UTC.
pub const DEFAULT_UTC_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Default format when times are rendered in the local timezone.
pub const DEFAULT_LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Renders event times with a strftime-style format string.
#[derive(Debug, Clone)]
pub struct TimeFormatter {
    format: String,
    localtime: bool,
}

impl TimeFormatter {
    /// Build a formatter, validating `format` up front.
    ///
    /// With no explicit format the default depends on `localtime`.
    pub fn new(format: Option<&str>, localtime: bool) -> Result<Self> {
        let format = match format {
            Some(f) => f.to_string(),
            None if localtime => DEFAULT_LOCAL_FORMAT.to_string(),
            None => DEFAULT_UTC_FORMAT.to_string(),
        };

        if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
            return Err(FlushError::Config(format!(
                "invalid time.format '{}'",
                format
            )));
        }

        Ok(Self { format, localtime })
    }

    pub fn format_str(&self) -> &str {
        &self.format
    }

    pub fn format(&self, time: DateTime<Utc>) -> String {
        if self.localtime {
            time.with_timezone(&Local).format(&self.format).to_string()
        } else {
            time.format(&self.format).to_string()
        }
    }
}

impl Default for TimeFormatter {
    fn default() -> Self {
        Self {
            format: DEFAULT_UTC_FORMAT.to_string(),
            localtime: false,
        }
    }
}
