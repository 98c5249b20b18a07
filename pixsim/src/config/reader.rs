//! Reading of configuration files and run-wide settings.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use super::{ConfigError, Configuration};

/// Name of the section holding run-wide parameters.
pub const GLOBAL_SECTION: &str = "Pixsim";

/// Reader of the sectioned `key = value` configuration format.
///
/// Lines starting with `#` or `;` are comments, as is any text following an
/// unquoted `#` on a value line. Section headers are either `[Name]` or
/// `[Name:detector]`. Sections are kept in file order and may repeat.
#[derive(Debug, Default)]
pub struct ConfigReader {
    sections: Vec<Configuration>,
}

impl ConfigReader {
    /// Reads and parses a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse_with_origin(&text, Some(path))
    }

    /// Parses configuration text held in memory.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Self::parse_with_origin(text, None)
    }

    /// Parses configuration text, recording `origin` as the source file of
    /// every section.
    pub fn parse_with_origin(text: &str, origin: Option<&Path>) -> Result<Self, ConfigError> {
        let origin_name = origin
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<string>".to_string());
        let syntax = |line: usize, reason: &str| ConfigError::Syntax {
            origin: origin_name.clone(),
            line,
            reason: reason.to_string(),
        };

        let mut sections: Vec<Configuration> = Vec::new();

        for (number, line) in text.lines().enumerate() {
            let number = number + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let header = header
                    .strip_suffix(']')
                    .ok_or_else(|| syntax(number, "section header is missing the closing ']'"))?;
                let (name, detector) = match header.split_once(':') {
                    Some((name, detector)) => (name.trim(), Some(detector.trim())),
                    None => (header.trim(), None),
                };
                if !is_identifier(name) {
                    return Err(syntax(number, "section name must be a non-empty identifier"));
                }
                if detector.is_some_and(|detector| !is_identifier(detector)) {
                    return Err(syntax(number, "detector qualifier must be a non-empty identifier"));
                }
                if detector.is_some() && name.eq_ignore_ascii_case(GLOBAL_SECTION) {
                    return Err(syntax(number, "the global section cannot target a detector"));
                }

                let mut section = Configuration::new(name, detector.map(str::to_string));
                if let Some(origin) = origin {
                    section = section.with_origin(origin);
                }
                sections.push(section);
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| syntax(number, "expected 'key = value' or a section header"))?;
            let key = key.trim();
            if !is_identifier(key) {
                return Err(syntax(number, "key must be a non-empty identifier"));
            }
            let section = sections
                .last_mut()
                .ok_or_else(|| syntax(number, "key defined before the first section header"))?;

            if section.has(key) {
                debug!(section = %section.identifier(), key, "key is set twice, the last value wins");
            }
            section.set(key, strip_comment(value).trim());
        }

        Ok(Self { sections })
    }

    /// Returns the sections in file order.
    pub fn sections(&self) -> &[Configuration] {
        &self.sections
    }

    /// Consumes the reader and returns the sections in file order.
    pub fn into_sections(self) -> Vec<Configuration> {
        self.sections
    }
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Removes a trailing `# comment` that is not part of a quoted string.
fn strip_comment(value: &str) -> &str {
    let mut quote = None;
    for (i, c) in value.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '#') => return &value[..i],
            _ => {}
        }
    }

    value
}

/// Run-wide parameters read from the global section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalSettings {
    /// Number of events to simulate.
    pub number_of_events: u64,
    /// Requested number of worker threads.
    pub workers: usize,
    /// Seed from which every per-event random engine is derived.
    pub random_seed: u64,
    /// Whether events may be processed by several workers.
    pub multithreading: bool,
}

/// Configuration of a full simulation run.
///
/// The manager separates the global section (see [`GLOBAL_SECTION`]) from the
/// module sections, whose relative order is preserved.
#[derive(Debug)]
pub struct ConfigManager {
    global: Configuration,
    modules: Vec<Configuration>,
}

impl ConfigManager {
    /// Builds a manager from parsed sections.
    ///
    /// Repeated global sections are merged, later values winning. A random
    /// seed is drawn and written back to the global section if none is
    /// configured, so the run can be reproduced from the logged value.
    pub fn new(sections: Vec<Configuration>) -> Result<Self, ConfigError> {
        let mut global: Option<Configuration> = None;
        let mut modules = Vec::new();

        for section in sections {
            if !section.name().eq_ignore_ascii_case(GLOBAL_SECTION) {
                modules.push(section);
                continue;
            }
            match global.as_mut() {
                None => global = Some(section),
                Some(merged) => {
                    for key in section.keys() {
                        merged.set(key, section.get_text(key)?);
                    }
                }
            }
        }

        let mut global = global.unwrap_or_else(|| Configuration::new(GLOBAL_SECTION, None));
        if !global.has("random_seed") {
            let seed: u64 = rand::random();
            info!(seed, "no random seed configured, using a fresh one");
            global.set("random_seed", seed);
        }

        Ok(Self { global, modules })
    }

    /// Reads a configuration file and builds a manager from its sections.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::new(ConfigReader::from_file(path)?.into_sections())
    }

    /// Parses configuration text held in memory.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Self::new(ConfigReader::parse(text)?.into_sections())
    }

    /// Returns the global section.
    pub fn global(&self) -> &Configuration {
        &self.global
    }

    /// Returns the global section for modification.
    pub fn global_mut(&mut self) -> &mut Configuration {
        &mut self.global
    }

    /// Returns the module sections in file order.
    pub fn module_sections(&self) -> &[Configuration] {
        &self.modules
    }

    /// Reads the run-wide settings from the global section.
    ///
    /// The number of workers defaults to the number of logical CPUs.
    pub fn settings(&self) -> Result<GlobalSettings, ConfigError> {
        let global = &self.global;
        let workers = global.get_or("workers", num_cpus::get())?;
        if workers == 0 {
            return Err(global.invalid_value("workers", "at least one worker is required"));
        }

        Ok(GlobalSettings {
            number_of_events: global.get_or("number_of_events", 1)?,
            workers,
            random_seed: global.get("random_seed")?,
            multithreading: global.get_or("multithreading", true)?,
        })
    }

    /// Splits the manager into the global section and the module sections.
    pub fn into_parts(self) -> (Configuration, Vec<Configuration>) {
        (self.global, self.modules)
    }
}
