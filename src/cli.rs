//! Command-line interface parsing for flagsync
//!
//! This module handles parsing of CLI arguments using clap and turns them into
//! a `RunConfig` plus the consumer the binary registers with the repository.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::CacheSettings;
use crate::consumer::FeatureConsumer;

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// A JSON-valued flag could not be parsed
    #[error("Invalid JSON for --{flag}: {source}")]
    InvalidJson {
        flag: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A JSON-valued flag parsed, but not to an object
    #[error("--{0} must be a JSON object")]
    NotAnObject(&'static str),
}

/// flagsync - fetch and follow feature payloads
#[derive(Parser, Debug)]
#[command(name = "flagsync")]
#[command(about = "Fetch a feature payload, cache it locally and follow live updates")]
#[command(version)]
pub struct Cli {
    /// Base URL of the features API
    #[arg(long, value_name = "URL")]
    pub api_host: String,

    /// Client key of the SDK connection
    #[arg(long, value_name = "KEY")]
    pub client_key: String,

    /// Base URL of the streaming endpoint (defaults to the API host)
    #[arg(long, value_name = "URL")]
    pub streaming_host: Option<String>,

    /// Ask the server to evaluate features for the given context
    #[arg(long)]
    pub remote_eval: bool,

    /// Targeting attributes as a JSON object
    ///
    /// Example: --attributes '{"id":"user-1","country":"CA"}'
    #[arg(long, value_name = "JSON")]
    pub attributes: Option<String>,

    /// Forced variations as a JSON object
    #[arg(long, value_name = "JSON")]
    pub forced_variations: Option<String>,

    /// Page URL sent with remote evaluation requests
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,

    /// Give up waiting on the network after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Seconds a cached payload stays fresh
    #[arg(long, value_name = "SECS")]
    pub stale_ttl_secs: Option<u64>,

    /// Poll for updates every this many seconds when streaming is unavailable
    #[arg(long, value_name = "SECS")]
    pub poll_secs: Option<u64>,

    /// Keep the cache in memory only
    #[arg(long)]
    pub no_persist: bool,

    /// Keep running and print every payload update until Ctrl-C
    #[arg(long)]
    pub watch: bool,
}

/// Configuration derived from CLI arguments for a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub api_host: String,
    pub client_key: String,
    pub streaming_host: Option<String>,
    pub remote_eval: bool,
    pub attributes: Map<String, Value>,
    pub forced_variations: Map<String, Value>,
    pub url: String,
    pub timeout: Option<Duration>,
    pub settings: CacheSettings,
    pub persist: bool,
    pub watch: bool,
}

/// Parses a JSON-object flag value
fn parse_object_arg(flag: &'static str, raw: Option<&str>) -> Result<Map<String, Value>, CliError> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CliError::NotAnObject(flag)),
        Err(source) => Err(CliError::InvalidJson { flag, source }),
    }
}

impl RunConfig {
    /// Creates a RunConfig from parsed CLI arguments.
    ///
    /// # Returns
    /// * `Ok(RunConfig)` with appropriate settings
    /// * `Err(CliError)` if a JSON-valued flag is malformed
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let attributes = parse_object_arg("attributes", cli.attributes.as_deref())?;
        let forced_variations =
            parse_object_arg("forced-variations", cli.forced_variations.as_deref())?;

        let mut settings = CacheSettings::default();
        if let Some(secs) = cli.stale_ttl_secs {
            settings.stale_ttl = Duration::from_secs(secs);
        }
        settings.poll_interval = cli.poll_secs.map(Duration::from_secs);

        Ok(RunConfig {
            api_host: cli.api_host.trim_end_matches('/').to_string(),
            client_key: cli.client_key.clone(),
            streaming_host: cli
                .streaming_host
                .as_deref()
                .map(|host| host.trim_end_matches('/').to_string()),
            remote_eval: cli.remote_eval,
            attributes,
            forced_variations,
            url: cli.url.clone().unwrap_or_default(),
            timeout: cli.timeout_ms.map(Duration::from_millis),
            settings,
            persist: !cli.no_persist,
            watch: cli.watch,
        })
    }
}

/// Consumer driven by the command line; prints every applied payload
pub struct CliConsumer {
    config: RunConfig,
    payload: Mutex<Option<Value>>,
}

impl CliConsumer {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            payload: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FeatureConsumer for CliConsumer {
    fn api_host(&self) -> String {
        self.config.api_host.clone()
    }

    fn client_key(&self) -> String {
        self.config.client_key.clone()
    }

    fn streaming_host(&self) -> String {
        self.config
            .streaming_host
            .clone()
            .unwrap_or_else(|| self.config.api_host.clone())
    }

    fn is_remote_eval(&self) -> bool {
        self.config.remote_eval
    }

    fn attributes(&self) -> Map<String, Value> {
        self.config.attributes.clone()
    }

    fn forced_variations(&self) -> Map<String, Value> {
        self.config.forced_variations.clone()
    }

    fn url(&self) -> String {
        self.config.url.clone()
    }

    fn payload(&self) -> Option<Value> {
        self.payload
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    async fn set_payload(&self, payload: Value) {
        println!("{}", payload);
        *self
            .payload
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(payload);
    }

    fn log(&self, message: &str, context: &Value) {
        tracing::warn!(%context, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{cache_key, subscription_key};

    fn base_args() -> Vec<&'static str> {
        vec!["flagsync", "--api-host", "https://cdn.example.com/", "--client-key", "sdk-1"]
    }

    #[test]
    fn test_cli_parse_required_args() {
        let cli = Cli::parse_from(base_args());
        assert_eq!(cli.api_host, "https://cdn.example.com/");
        assert_eq!(cli.client_key, "sdk-1");
        assert!(!cli.watch);
        assert!(!cli.remote_eval);
    }

    #[test]
    fn test_cli_missing_client_key_is_rejected() {
        let result = Cli::try_parse_from(["flagsync", "--api-host", "https://cdn.example.com"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_config_defaults() {
        let cli = Cli::parse_from(base_args());
        let config = RunConfig::from_cli(&cli).unwrap();
        assert_eq!(config.api_host, "https://cdn.example.com");
        assert!(config.attributes.is_empty());
        assert!(config.timeout.is_none());
        assert!(config.persist);
        assert_eq!(config.settings, CacheSettings::default());
    }

    #[test]
    fn test_run_config_cache_flags() {
        let mut args = base_args();
        args.extend([
            "--timeout-ms",
            "250",
            "--stale-ttl-secs",
            "5",
            "--poll-secs",
            "30",
            "--no-persist",
            "--watch",
        ]);
        let config = RunConfig::from_cli(&Cli::parse_from(args)).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.settings.stale_ttl, Duration::from_secs(5));
        assert_eq!(config.settings.poll_interval, Some(Duration::from_secs(30)));
        assert!(!config.persist);
        assert!(config.watch);
    }

    #[test]
    fn test_run_config_remote_eval_context() {
        let mut args = base_args();
        args.extend([
            "--remote-eval",
            "--attributes",
            r#"{"id":"u1"}"#,
            "--forced-variations",
            r#"{"exp":1}"#,
            "--url",
            "https://app.example.com/home",
        ]);
        let config = RunConfig::from_cli(&Cli::parse_from(args)).unwrap();
        let consumer = CliConsumer::new(config);

        assert!(consumer.is_remote_eval());
        assert_eq!(consumer.attributes()["id"], "u1");
        assert_eq!(consumer.forced_variations()["exp"], 1);
        assert_eq!(subscription_key(&consumer), "https://cdn.example.com||sdk-1");
        assert!(cache_key(&consumer).starts_with("https://cdn.example.com||sdk-1||"));
    }

    #[test]
    fn test_run_config_invalid_attributes() {
        let mut args = base_args();
        args.extend(["--attributes", "{not json"]);
        let err = RunConfig::from_cli(&Cli::parse_from(args)).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON for --attributes"));
    }

    #[test]
    fn test_run_config_attributes_must_be_object() {
        let mut args = base_args();
        args.extend(["--attributes", "[1,2]"]);
        let err = RunConfig::from_cli(&Cli::parse_from(args)).unwrap_err();
        assert!(matches!(err, CliError::NotAnObject("attributes")));
    }

    #[test]
    fn test_streaming_host_defaults_to_api_host() {
        let config = RunConfig::from_cli(&Cli::parse_from(base_args())).unwrap();
        assert_eq!(CliConsumer::new(config).streaming_host(), "https://cdn.example.com");

        let mut args = base_args();
        args.extend(["--streaming-host", "https://stream.example.com"]);
        let config = RunConfig::from_cli(&Cli::parse_from(args)).unwrap();
        assert_eq!(CliConsumer::new(config).streaming_host(), "https://stream.example.com");
    }

    #[tokio::test]
    async fn test_cli_consumer_keeps_applied_payload() {
        let config = RunConfig::from_cli(&Cli::parse_from(base_args())).unwrap();
        let consumer = CliConsumer::new(config);
        assert!(consumer.payload().is_none());

        consumer.set_payload(serde_json::json!({ "features": {} })).await;

        assert_eq!(consumer.payload(), Some(serde_json::json!({ "features": {} })));
    }
}
