//! Configuration and lookup errors of the binding.

use derive_more::{Display, Error, From};
use metrics_exporter_prometheus::BuildError;

/// Misconfiguration detected while assembling clients.
///
/// Messages are stable: they name the offending setting and value.
#[derive(Debug, Display, Error, From)]
pub enum ConfigurationError {
    /// A list entry cannot be split.
    #[display("Invalid value {entry} in {setting}[{index}]")]
    InvalidEntry {
        /// The raw entry.
        entry: String,
        /// Setting holding the list.
        setting: String,
        /// Position of the entry among the non-blank entries.
        index: usize,
    },

    /// A required setting is absent.
    #[display("Missing setting {_0}")]
    MissingSetting(#[error(not(source))] String),

    /// A setting holds a value outside its allowed set.
    #[display("Invalid value {value} for {setting}: not in {choices}")]
    InvalidChoice {
        /// The value found.
        value: String,
        /// The setting.
        setting: String,
        /// Allowed values, comma separated.
        choices: String,
    },

    /// A required key of a settings block is absent.
    #[display("Missing sub-key {key} in setting {setting}")]
    MissingSubKey {
        /// The missing key.
        key: String,
        /// The settings block.
        setting: String,
    },

    /// A value is not an unsigned integer.
    #[display("Invalid integer {value} for {setting}")]
    InvalidInteger {
        /// The value found.
        value: String,
        /// The setting.
        setting: String,
    },

    /// A value is not a number.
    #[display("Invalid number {value} for {setting}")]
    InvalidNumber {
        /// The value found.
        value: String,
        /// The setting.
        setting: String,
    },

    /// A value is not a URL.
    #[display("Invalid URL {value} for {setting}")]
    InvalidUrl {
        /// The value found.
        value: String,
        /// The setting.
        setting: String,
    },

    /// A reference is not of the form `<module>:<attribute>`.
    #[display("Invalid entry point {_0}: expected <module>:<attribute>")]
    MalformedEntryPoint(#[error(not(source))] String),

    /// No plugin is registered under a reference.
    #[display("Unresolvable entry point {_0}")]
    UnresolvableEntryPoint(#[error(not(source))] String),

    /// The settings document is not valid TOML.
    #[display("Invalid settings document: {_0}")]
    #[from]
    Document(toml::de::Error),

    /// Prometheus rejected the histogram buckets.
    #[display("Invalid prometheus buckets: {_0}")]
    #[from]
    Buckets(BuildError),
}

/// A request asked for a client that was never declared.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("Client {name} is not registered")]
pub struct UnknownClient {
    /// Name of the missing client.
    #[error(not(source))]
    pub name: String,
}
