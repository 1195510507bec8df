//! Provides the CLI option parser and the configuration document
//!
//! Sawmill takes one JSON configuration file, a mode and a list of globs on
//! the command line. The document is parsed once at startup into the structs
//! here and is immutable afterward. Anything wrong with it -- unreadable
//! file, bad JSON, bad regex downstream -- is fatal; a telemetry agent with a
//! half-working configuration is worse than one that refuses to start.

use clap::{App, Arg};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use thiserror::Error;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

/// Everything that can go wrong between process start and a running agent.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration file was not valid JSON of the expected shape.
    #[error("could not parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// An `if_match` pattern did not compile.
    #[error("bad if_match pattern: {0}")]
    Regex(#[from] regex::Error),
    /// A metric declared a type other than counter or summary.
    #[error("metric {metric} has unsupported type {kind:?}")]
    UnknownKind {
        /// Offending metric name.
        metric: String,
        /// The unrecognised `type` value.
        kind: String,
    },
    /// The metrics registry rejected a registration, e.g. a duplicate name.
    #[error("could not register metric: {0}")]
    Registry(#[from] prometheus::Error),
    /// The selected mode needs a configuration section that is absent.
    #[error("mode requires missing configuration section {0:?}")]
    MissingSection(&'static str),
}

/// One entry of the `metrics` section: a counter or summary fed from a
/// numeric log field.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    /// `counter` or `summary`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Field whose value is parsed as a double.
    pub value_source: String,
    /// Output label name to input field name.
    #[serde(default)]
    pub label_map: BTreeMap<String, String>,
    /// Field name to regex; every entry must find a match for a record to be
    /// admitted.
    #[serde(default)]
    pub if_match: BTreeMap<String, String>,
}

/// One entry of the `unique` section: a sliding-window distinct counter.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct DistinctConfig {
    /// Comma-separated field names concatenated into the identity string.
    pub value_source: String,
    /// Sliding window in seconds.
    pub time_window: u64,
    /// Output label name to input field name.
    #[serde(default)]
    pub label_map: BTreeMap<String, String>,
    /// Field name to regex gate, as for `MetricConfig`.
    #[serde(default)]
    pub if_match: BTreeMap<String, String>,
    /// Events-per-second threshold at or above which a rate alert fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_rate_threshold: Option<f64>,
}

/// The `nel` section: where report uploads land and the URL slug that guards
/// them.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Path NEL reports are appended to, one JSON document per line.
    pub nel_report_log: PathBuf,
    /// Path CSP violation reports are appended to.
    pub csp_report_log: PathBuf,
    /// Slug embedded in the upload URLs, `POST /nel/<uuid>`.
    pub uuid: String,
}

/// The whole configuration document.
#[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Standard metric definitions, by metric name. A `BTreeMap` so that
    /// registration order is deterministic.
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricConfig>,
    /// Unique metric definitions, by metric name.
    #[serde(default)]
    pub unique: BTreeMap<String, DistinctConfig>,
    /// Report collector settings, required only in nel mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nel: Option<ReportConfig>,
}

/// Parse a configuration document from a string.
pub fn parse_config(buffer: &str) -> Result<Config, ConfigError> {
    let config = serde_json::from_str(buffer)?;
    Ok(config)
}

/// Load the configuration document from a file.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let mut fp = File::open(path)?;
    let mut buffer = String::new();
    fp.read_to_string(&mut buffer)?;
    parse_config(&buffer)
}

/// Which of the agent's three personalities this process runs.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Mode {
    /// Counters and summaries on port 9802.
    Standard,
    /// Sliding-window distinct counters on port 9803.
    Unique,
    /// NEL / CSP report collection on port 10666.
    Report,
}

/// Parsed command line.
#[derive(Debug)]
pub struct Args {
    /// Path of the configuration file, as given.
    pub config_path: String,
    /// The selected mode.
    pub mode: Mode,
    /// Glob patterns naming the log files to follow.
    pub globs: Vec<String>,
    /// Occurrences of `-v`.
    pub verbose: u64,
}

/// Parse argv. Exits the process with a usage message on malformed input,
/// which is clap's behaviour for required arguments.
pub fn parse_args() -> Args {
    let matches = App::new("sawmill")
        .version(VERSION.unwrap_or("unknown"))
        .about("log-tailing telemetry agent")
        .arg(
            Arg::with_name("config")
                .help("The JSON config file to feed in.")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("mode")
                .help("One of: standard, unique, nel.")
                .required(true)
                .possible_values(&["standard", "unique", "nel"])
                .index(2),
        )
        .arg(
            Arg::with_name("glob")
                .help("Glob pattern(s) of log files to follow.")
                .multiple(true)
                .index(3),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
        .get_matches();

    let mode = match matches.value_of("mode").expect("mode is required") {
        "standard" => Mode::Standard,
        "unique" => Mode::Unique,
        "nel" => Mode::Report,
        _ => unreachable!("clap restricts mode values"),
    };

    Args {
        config_path: matches
            .value_of("config")
            .expect("config is required")
            .to_string(),
        mode,
        globs: matches
            .values_of("glob")
            .map(|vs| vs.map(String::from).collect())
            .unwrap_or_default(),
        verbose: if matches.is_present("verbose") {
            matches.occurrences_of("verbose")
        } else {
            0
        },
    }
}
