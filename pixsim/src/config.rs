//! Configuration sections with typed, on-demand value access.
//!
//! A configuration file is an ordered list of sections, each introduced by a
//! header naming a module type and optionally a target detector:
//!
//! ```text
//! [Pixsim]
//! number_of_events = 1000
//! workers = 4
//!
//! # Runs once for every detector.
//! [ChargeDepositor]
//! mean_charge = 22000
//!
//! # Runs for `dut` only.
//! [ThresholdDigitizer:dut]
//! threshold = 1500
//! ```
//!
//! Each section is represented by a [`Configuration`]. Values are stored as
//! raw text and are only parsed when a module requests them with a concrete
//! type, see [`Configuration::get`] and [`FromConfig`].

mod reader;
mod value;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

pub use reader::{ConfigManager, ConfigReader, GlobalSettings, GLOBAL_SECTION};
pub use value::{FromConfig, Value};

/// Error raised while reading or querying a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("could not read configuration file '{}': {source}", .path.display())]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The configuration text is malformed.
    #[error("syntax error in {origin} at line {line}: {reason}")]
    Syntax {
        /// File name or `<string>` for in-memory configurations.
        origin: String,
        /// One-based line number.
        line: usize,
        /// What is wrong.
        reason: String,
    },
    /// A required key is absent and no default was provided.
    #[error("key '{key}' in section [{section}] does not exist")]
    MissingKey {
        /// Section identifier.
        section: String,
        /// Requested key.
        key: String,
    },
    /// A value could not be converted to the requested type.
    #[error("could not convert value '{value}' of key '{key}' in section [{section}] to type {type_name}: {reason}")]
    InvalidType {
        /// Section identifier.
        section: String,
        /// Requested key.
        key: String,
        /// Raw value.
        value: String,
        /// Name of the requested type.
        type_name: &'static str,
        /// Reason of the conversion failure.
        reason: String,
    },
    /// A value has the right type but is not acceptable.
    #[error("invalid value for key '{key}' in section [{section}]: {reason}")]
    InvalidValue {
        /// Section identifier.
        section: String,
        /// Offending key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// A single configuration section.
///
/// The section identity is the module name from the header plus the optional
/// detector qualifier. Keys are unique within a section; setting an existing
/// key replaces its value.
///
/// Accessed keys are tracked so that keys never read by a module can be
/// reported once setup completes.
pub struct Configuration {
    name: String,
    detector: Option<String>,
    origin: Option<PathBuf>,
    values: BTreeMap<String, String>,
    accessed: Mutex<BTreeSet<String>>,
}

impl Configuration {
    /// Creates an empty section with the specified name and optional detector
    /// qualifier.
    pub fn new(name: impl Into<String>, detector: Option<String>) -> Self {
        Self {
            name: name.into(),
            detector,
            origin: None,
            values: BTreeMap::new(),
            accessed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Sets the file this section was read from, used to resolve relative
    /// paths.
    pub fn with_origin(mut self, origin: impl Into<PathBuf>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Returns the section (module) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the detector qualifier of the section header, if any.
    pub fn detector_name(&self) -> Option<&str> {
        self.detector.as_deref()
    }

    /// Returns the file this section was read from, if any.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// Returns the section identifier as written in the header, e.g.
    /// `Digitizer` or `Digitizer:dut`.
    pub fn identifier(&self) -> String {
        match &self.detector {
            Some(detector) => format!("{}:{}", self.name, detector),
            None => self.name.clone(),
        }
    }

    /// Checks whether the key is set.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the number of keys in the section.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the section holds no key.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over keys in lexicographic order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Returns the raw text of a value.
    pub fn get_text(&self, key: &str) -> Result<&str, ConfigError> {
        self.mark_accessed(key);
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingKey {
                section: self.identifier(),
                key: key.to_string(),
            })
    }

    /// Returns the value of a key converted to `T`.
    ///
    /// Fails with [`ConfigError::MissingKey`] if the key is absent and with
    /// [`ConfigError::InvalidType`] if the value cannot be converted.
    pub fn get<T: FromConfig>(&self, key: &str) -> Result<T, ConfigError> {
        let raw = self.get_text(key)?;
        let invalid = |reason: String| ConfigError::InvalidType {
            section: self.identifier(),
            key: key.to_string(),
            value: raw.to_string(),
            type_name: std::any::type_name::<T>(),
            reason,
        };

        let value = Value::parse(raw).map_err(invalid)?;
        T::from_value(&value).map_err(invalid)
    }

    /// Returns the value of a key converted to `T`, or `default` if the key
    /// is absent.
    ///
    /// A present but unconvertible value is still an error.
    pub fn get_or<T: FromConfig>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        if self.has(key) {
            self.get(key)
        } else {
            self.mark_accessed(key);
            Ok(default)
        }
    }

    /// Returns the value of a key, or `None` if the key is absent.
    pub fn get_opt<T: FromConfig>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        if self.has(key) {
            self.get(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Returns which of the allowed choices the value of a key designates.
    ///
    /// The comparison ignores ASCII case; the returned choice is the one from
    /// the `choices` list.
    pub fn get_choice<'c>(&self, key: &str, choices: &[&'c str]) -> Result<&'c str, ConfigError> {
        let text: String = self.get(key)?;

        choices
            .iter()
            .find(|choice| choice.eq_ignore_ascii_case(&text))
            .copied()
            .ok_or_else(|| {
                self.invalid_value(
                    key,
                    format!("'{}' is not one of {}", text, choices.join(", ")),
                )
            })
    }

    /// Returns a path value resolved relative to the directory of the
    /// configuration file.
    ///
    /// If `check_exists` is set, a path that does not exist is rejected with
    /// [`ConfigError::InvalidValue`].
    pub fn get_path(&self, key: &str, check_exists: bool) -> Result<PathBuf, ConfigError> {
        let path: PathBuf = self.get(key)?;
        let path = match self.origin.as_deref().and_then(Path::parent) {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        };

        if check_exists && !path.exists() {
            return Err(self.invalid_value(
                key,
                format!("path '{}' does not exist", path.display()),
            ));
        }

        Ok(path)
    }

    /// Sets a key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Display) {
        self.values.insert(key.into(), value.to_string());
    }

    /// Sets a key to a list of values.
    pub fn set_list<T: Display>(&mut self, key: impl Into<String>, values: &[T]) {
        let text = values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        self.values.insert(key.into(), format!("[{text}]"));
    }

    /// Sets a key only if it is not set yet.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Display) {
        self.values
            .entry(key.into())
            .or_insert_with(|| value.to_string());
    }

    /// Builds an [`ConfigError::InvalidValue`] error for a key of this section.
    pub fn invalid_value(&self, key: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.identifier(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the keys that are set but were never read.
    pub fn unused_keys(&self) -> Vec<String> {
        let accessed = self.accessed.lock().unwrap_or_else(PoisonError::into_inner);

        self.values
            .keys()
            .filter(|key| !accessed.contains(*key))
            .cloned()
            .collect()
    }

    fn mark_accessed(&self, key: &str) {
        self.accessed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }
}

impl Clone for Configuration {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            detector: self.detector.clone(),
            origin: self.origin.clone(),
            values: self.values.clone(),
            accessed: Mutex::new(
                self.accessed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            ),
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("name", &self.name)
            .field("detector", &self.detector)
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section() -> Configuration {
        let mut config = Configuration::new("Digitizer", Some("dut".to_string()));
        config.set("threshold", 1500.0);
        config.set("size", "[256, 256]");
        config.set("mode", "Binary");
        config
    }

    #[test]
    fn missing_key_without_default() {
        let config = section();
        match config.get::<f64>("gain") {
            Err(ConfigError::MissingKey { section, key }) => {
                assert_eq!(section, "Digitizer:dut");
                assert_eq!(key, "gain");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn default_is_returned_verbatim() {
        let config = Configuration::new("Digitizer", None);
        assert_eq!(config.get_or::<f64>("threshold", 5.0).unwrap(), 5.0);
    }

    #[test]
    fn default_does_not_hide_type_errors() {
        let mut config = Configuration::new("Digitizer", None);
        config.set("threshold", "high");
        assert!(matches!(
            config.get_or::<f64>("threshold", 5.0),
            Err(ConfigError::InvalidType { .. })
        ));
    }

    #[test]
    fn typed_access() {
        let config = section();
        assert_eq!(config.get::<f64>("threshold").unwrap(), 1500.0);
        assert_eq!(config.get::<[u32; 2]>("size").unwrap(), [256, 256]);
        assert_eq!(
            config.get_choice("mode", &["binary", "analog"]).unwrap(),
            "binary"
        );
        assert!(matches!(
            config.get_choice("mode", &["analog"]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn set_default_keeps_existing_values() {
        let mut config = section();
        config.set_default("threshold", 10);
        config.set_default("gain", 2);
        assert_eq!(config.get::<f64>("threshold").unwrap(), 1500.0);
        assert_eq!(config.get::<u32>("gain").unwrap(), 2);
    }

    #[test]
    fn unused_keys_are_reported() {
        let config = section();
        config.get::<f64>("threshold").unwrap();
        config.get_or::<u32>("gain", 1).unwrap();
        assert_eq!(config.unused_keys(), vec!["mode", "size"]);
    }

    #[test]
    fn relative_paths_follow_the_origin() {
        let mut config = Configuration::new("Pixsim", None).with_origin("/data/run/main.conf");
        config.set("detectors_file", "geometry/telescope.conf");
        config.set("absolute", "/etc/models.conf");
        assert_eq!(
            config.get_path("detectors_file", false).unwrap(),
            PathBuf::from("/data/run/geometry/telescope.conf")
        );
        assert_eq!(
            config.get_path("absolute", false).unwrap(),
            PathBuf::from("/etc/models.conf")
        );
    }

    #[test]
    fn list_round_trip() {
        let mut config = Configuration::new("Pixsim", None);
        config.set_list("position", &[0.0, 1.5, -3.0]);
        assert_eq!(
            config.get::<[f64; 3]>("position").unwrap(),
            [0.0, 1.5, -3.0]
        );
    }
}
