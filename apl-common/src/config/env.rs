//! `APL_*` environment overrides.
//!
//! Values are looked up through a pluggable source so tests can feed a map
//! instead of mutating the process environment. Bad values are collected,
//! not returned one at a time, so a misconfigured run reports everything.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send>;

/// Typed reader for prefixed environment variables.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl std::fmt::Debug for EnvParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvParser")
            .field("prefix", &self.prefix)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvParser {
    pub const PREFIX: &'static str = "APL_";

    /// Parser over the process environment.
    pub fn new() -> Self {
        Self {
            prefix: Self::PREFIX,
            lookup: Box::new(|name| env::var(name).ok()),
            errors: Vec::new(),
        }
    }

    /// Parser over a fixed set of variables.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            prefix: Self::PREFIX,
            lookup: Box::new(move |name| vars.get(name).cloned()),
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var = self.var_name(name);
        (self.lookup)(&var).map(|value| (var, value))
    }

    pub fn get_string(&mut self, name: &str) -> Option<String> {
        self.raw(name).map(|(_, v)| v)
    }

    /// Accepts 1/true/yes/on and 0/false/no/off/"".
    pub fn get_bool(&mut self, name: &str) -> Option<bool> {
        let (var, value) = self.raw(name)?;
        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                None
            }
        }
    }

    pub fn get_u64_range(&mut self, name: &str, min: u64, max: u64) -> Option<u64> {
        let (var, value) = self.raw(name)?;
        match value.trim().parse::<u64>() {
            Ok(n) if (min..=max).contains(&n) => Some(n),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned integer".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Whole seconds, e.g. `APL_SSH_CONNECT_TIMEOUT=30`.
    pub fn get_duration_secs(&mut self, name: &str, max: u64) -> Option<Duration> {
        self.get_u64_range(name, 1, max).map(Duration::from_secs)
    }

    /// Path with `~/` expanded to the home directory.
    pub fn get_path(&mut self, name: &str) -> Option<PathBuf> {
        let (_, value) = self.raw(name)?;
        Some(expand_home(&value))
    }

    /// Whitespace or comma separated list.
    pub fn get_string_list(&mut self, name: &str) -> Option<Vec<String>> {
        let (_, value) = self.raw(name)?;
        Some(
            value
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

pub(crate) fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(pairs: &[(&str, &str)]) -> EnvParser {
        EnvParser::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_get_bool_values() {
        for val in ["1", "true", "yes", "on", "TRUE", "Yes"] {
            let mut p = parser(&[("APL_FLAG", val)]);
            assert_eq!(p.get_bool("FLAG"), Some(true), "expected true for '{val}'");
        }
        for val in ["0", "false", "no", "off", ""] {
            let mut p = parser(&[("APL_FLAG", val)]);
            assert_eq!(p.get_bool("FLAG"), Some(false), "expected false for '{val}'");
        }
        let mut p = parser(&[]);
        assert_eq!(p.get_bool("FLAG"), None);
        assert!(!p.has_errors());
    }

    #[test]
    fn test_invalid_values_are_collected() {
        let mut p = parser(&[("APL_FLAG", "maybe"), ("APL_N", "abc"), ("APL_M", "99")]);
        assert_eq!(p.get_bool("FLAG"), None);
        assert_eq!(p.get_u64_range("N", 1, 10), None);
        assert_eq!(p.get_u64_range("M", 1, 10), None);
        let errors = p.take_errors();
        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[2], EnvError::OutOfRange { .. }));
        assert!(!p.has_errors());
    }

    #[test]
    fn test_duration_and_list() {
        let mut p = parser(&[
            ("APL_SSH_CONNECT_TIMEOUT", "45"),
            ("APL_CLOCK_SERVERS", "0.pool.ntp.org, 1.pool.ntp.org  2.pool.ntp.org"),
        ]);
        assert_eq!(
            p.get_duration_secs("SSH_CONNECT_TIMEOUT", 600),
            Some(Duration::from_secs(45))
        );
        assert_eq!(
            p.get_string_list("CLOCK_SERVERS").unwrap(),
            vec!["0.pool.ntp.org", "1.pool.ntp.org", "2.pool.ntp.org"]
        );
    }

    #[test]
    fn test_path_expands_home() {
        let mut p = parser(&[("APL_IDENTITY_FILE", "/keys/id_rsa")]);
        assert_eq!(p.get_path("IDENTITY_FILE"), Some(PathBuf::from("/keys/id_rsa")));
        if let Some(home) = dirs::home_dir() {
            let mut p = parser(&[("APL_IDENTITY_FILE", "~/.ssh/id_rsa")]);
            assert_eq!(p.get_path("IDENTITY_FILE"), Some(home.join(".ssh/id_rsa")));
        }
    }
}
