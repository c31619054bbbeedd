//! Relayer configuration.
//!
//! Settings are assembled from layers, later layers overriding earlier ones key by key:
//!
//! 1. `<config_dir>/base.yaml`
//! 2. `<config_dir>/<env>.yaml`
//! 3. environment variables starting with the prefix (`RELAYER_` by default), with `__`
//!    separating nested keys, e.g. `RELAYER_LISTENER__BATCH_SIZE=50`.

use crate::{gas_oracle::DEFAULT_GAS_PRICE_FLOOR_WEI, processor::DEFAULT_UNLOCK_GAS_LIMIT};
use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};
use url::Url;

/// Default environment name
pub const DEFAULT_ENV: &str = "development";

/// Default prefix of configuration environment variables
pub const DEFAULT_ENV_PREFIX: &str = "RELAYER_";

/// Variable selecting the environment layer. Not part of the settings tree.
pub const ENV_SELECTOR_VAR: &str = "RELAYER_ENV";

const GWEI: u128 = 1_000_000_000;

/// Complete relayer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayerSettings {
    /// Chain the lock events are read from
    pub source: SourceSettings,
    /// Chain the unlock transactions are built for
    pub destination: DestinationSettings,
    /// Polling and checkpoint settings
    #[serde(default)]
    pub listener: ListenerSettings,
    /// External gas price feed
    #[serde(default)]
    pub gas_oracle: GasOracleSettings,
}

/// Source chain settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Chain name used in logs and metrics
    #[serde(default = "default_source_name", deserialize_with = "scalar::string")]
    pub name: String,
    /// JSON-RPC endpoint
    #[serde(deserialize_with = "scalar::string")]
    pub rpc_url: String,
    /// Bridge contract emitting `TokensLocked`
    pub bridge_contract_address: Address,
    /// Checkpoint to use when none is persisted
    #[serde(default = "default_start_block")]
    pub start_block: u64,
}

/// Destination chain settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationSettings {
    /// Chain name used in logs and metrics
    #[serde(default = "default_destination_name", deserialize_with = "scalar::string")]
    pub name: String,
    /// JSON-RPC endpoint
    #[serde(deserialize_with = "scalar::string")]
    pub rpc_url: String,
    /// Bridge contract exposing `unlockTokens`
    pub bridge_contract_address: Address,
    /// Hex encoded key of the relayer account
    #[serde(deserialize_with = "scalar::string")]
    pub relayer_private_key: String,
    /// Gas limit ceiling of unlock transactions
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

impl fmt::Debug for DestinationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationSettings")
            .field("name", &self.name)
            .field("rpc_url", &self.rpc_url)
            .field("bridge_contract_address", &self.bridge_contract_address)
            .field("relayer_private_key", &"<redacted>")
            .field("gas_limit", &self.gas_limit)
            .finish()
    }
}

impl DestinationSettings {
    /// Parses the relayer key.
    pub fn signer(&self) -> Result<PrivateKeySigner> {
        self.relayer_private_key
            .trim()
            .parse::<PrivateKeySigner>()
            .context("Invalid relayer private key")
    }
}

/// Polling and checkpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Seconds between cycles
    pub poll_interval_secs: u64,
    /// Maximum blocks per scan
    pub batch_size: u64,
    /// Checkpoint file
    #[serde(deserialize_with = "scalar::path")]
    pub checkpoint_path: PathBuf,
    /// Upper bound for every RPC request
    pub rpc_timeout_secs: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            batch_size: 100,
            checkpoint_path: PathBuf::from("listener_state.json"),
            rpc_timeout_secs: 30,
        }
    }
}

impl ListenerSettings {
    /// Sleep between cycles
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// RPC request timeout
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// External gas price feed settings. The feed is disabled without an endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasOracleSettings {
    /// Feed URL
    #[serde(deserialize_with = "scalar::optional_string")]
    pub endpoint: Option<String>,
    /// Sent as the `apiKey` query parameter
    #[serde(deserialize_with = "scalar::optional_string")]
    pub api_key: Option<String>,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    /// Last-resort price in gwei
    pub floor_gwei: u64,
}

impl fmt::Debug for GasOracleSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GasOracleSettings")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_ms", &self.timeout_ms)
            .field("floor_gwei", &self.floor_gwei)
            .finish()
    }
}

impl Default for GasOracleSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_ms: 5_000,
            floor_gwei: (DEFAULT_GAS_PRICE_FLOOR_WEI / GWEI) as u64,
        }
    }
}

impl GasOracleSettings {
    /// Feed request timeout
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Floor price in wei
    pub const fn floor_wei(&self) -> u128 {
        self.floor_gwei as u128 * GWEI
    }
}

fn default_source_name() -> String {
    "source".to_string()
}

fn default_destination_name() -> String {
    "destination".to_string()
}

const fn default_start_block() -> u64 {
    1_000_000
}

const fn default_gas_limit() -> u64 {
    DEFAULT_UNLOCK_GAS_LIMIT
}

impl RelayerSettings {
    /// Rejects settings the relayer cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.listener.batch_size > 0, "listener.batch_size must be greater than 0");
        ensure!(self.listener.poll_interval_secs > 0, "listener.poll_interval_secs must be greater than 0");
        ensure!(self.listener.rpc_timeout_secs > 0, "listener.rpc_timeout_secs must be greater than 0");
        ensure!(self.destination.gas_limit > 0, "destination.gas_limit must be greater than 0");

        Url::parse(&self.source.rpc_url)
            .with_context(|| format!("Invalid source.rpc_url: {}", self.source.rpc_url))?;
        Url::parse(&self.destination.rpc_url)
            .with_context(|| format!("Invalid destination.rpc_url: {}", self.destination.rpc_url))?;
        if let Some(endpoint) = &self.gas_oracle.endpoint {
            Url::parse(endpoint).with_context(|| format!("Invalid gas_oracle.endpoint: {endpoint}"))?;
        }

        self.destination.signer()?;
        Ok(())
    }
}

/// Loads [`RelayerSettings`] from a configuration directory and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: PathBuf,
    env: String,
    env_prefix: String,
}

impl ConfigLoader {
    /// Creates a loader for `config_dir` using the default environment and prefix.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            env: DEFAULT_ENV.to_string(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    /// Selects the environment layer, e.g. `production` for `production.yaml`.
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    /// Sets the prefix of configuration environment variables.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads, merges, deserializes and validates the settings.
    pub fn load(&self) -> Result<RelayerSettings> {
        self.load_with_vars(std::env::vars())
    }

    /// Like [`Self::load`], reading variables from `vars` instead of the process environment.
    pub fn load_with_vars<I>(&self, vars: I) -> Result<RelayerSettings>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let merged = self.merged_value(vars)?;
        let settings: RelayerSettings =
            serde_yaml::from_value(merged).context("Failed to deserialize relayer settings")?;
        settings.validate()?;
        Ok(settings)
    }

    /// All layers merged into one document.
    pub fn merged_value<I>(&self, vars: I) -> Result<Value>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if !self.config_dir.is_dir() {
            bail!("Config directory not found: {}", self.config_dir.display());
        }

        let mut merged = Value::Mapping(Mapping::new());
        for file in ["base.yaml".to_string(), format!("{}.yaml", self.env)] {
            if let Some(layer) = read_layer(&self.config_dir.join(file)) {
                deep_merge(&mut merged, layer);
            }
        }
        deep_merge(&mut merged, self.env_layer(vars));
        Ok(merged)
    }

    /// Builds a document from the variables carrying the prefix.
    fn env_layer<I>(&self, vars: I) -> Value
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut layer = Value::Mapping(Mapping::new());
        for (key, raw) in vars {
            if key == ENV_SELECTOR_VAR {
                continue;
            }
            let Some(path) = key.strip_prefix(&self.env_prefix) else { continue };
            let segments: Vec<String> = path
                .split("__")
                .filter(|s| !s.is_empty())
                .map(str::to_ascii_lowercase)
                .collect();
            if segments.is_empty() {
                continue;
            }
            if raw.trim().is_empty() {
                debug!(target: "relayer::config", var = %key, "Ignoring empty environment override");
                continue;
            }
            debug!(target: "relayer::config", var = %key, "Applying environment override");
            insert_path(&mut layer, &segments, coerce_scalar(&raw));
        }
        layer
    }
}

/// Reads one YAML layer. Missing files are skipped silently, broken ones with a warning.
fn read_layer(path: &Path) -> Option<Value> {
    if !path.is_file() {
        debug!(target: "relayer::config", path = %path.display(), "Config layer not present");
        return None;
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|content| serde_yaml::from_str::<Value>(&content).map_err(|e| e.to_string()));
    match parsed {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(error) => {
            warn!(target: "relayer::config", path = %path.display(), %error, "Skipping unreadable config layer");
            None
        }
    }
}

/// Merges `overlay` into `base`. Mappings merge key by key; anything else replaces.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn insert_path(root: &mut Value, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *root = value;
        return;
    };
    if !root.is_mapping() {
        *root = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(map) = root {
        let key = Value::String(first.clone());
        if !map.contains_key(&key) {
            map.insert(key.clone(), Value::Null);
        }
        if let Some(child) = map.get_mut(&key) {
            insert_path(child, rest, value);
        }
    }
}

/// Interprets an environment value as bool, integer, float or string, in that order.
///
/// A value only becomes a number when printing the number gives back the same text, so
/// string settings can recover it verbatim (see [`scalar`]).
pub fn coerce_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(int) = trimmed.parse::<u64>() {
        if int.to_string() == trimmed {
            return Value::Number(int.into());
        }
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        if int.to_string() == trimmed {
            return Value::Number(int.into());
        }
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if float.is_finite() && float.to_string() == trimmed {
            return Value::Number(float.into());
        }
    }
    Value::String(raw.to_string())
}

/// Deserializers for text settings that also accept the scalars produced by
/// [`coerce_scalar`], so `RELAYER_GAS_ORACLE__API_KEY=123456` stays a string.
mod scalar {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_yaml::Value;
    use std::path::PathBuf;

    fn text<E: Error>(value: Value) -> Result<Option<String>, E> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            Value::Number(n) => Ok(Some(n.to_string())),
            Value::Bool(b) => Ok(Some(b.to_string())),
            other => Err(E::custom(format!("expected a string, found {other:?}"))),
        }
    }

    pub(super) fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        text(Value::deserialize(deserializer)?)?.ok_or_else(|| D::Error::custom("expected a string, found null"))
    }

    /// Null and blank values mean "not set".
    pub(super) fn optional_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(text(Value::deserialize(deserializer)?)?.filter(|s| !s.trim().is_empty()))
    }

    pub(super) fn path<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        string(deserializer).map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const KEY: &str = "0x4242424242424242424242424242424242424242424242424242424242424242";

    fn base_yaml() -> String {
        format!(
            r#"
source:
  rpc_url: http://localhost:8545
  bridge_contract_address: "0x1212121212121212121212121212121212121212"
destination:
  name: polygon
  rpc_url: http://localhost:9545
  bridge_contract_address: "0x0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d"
  relayer_private_key: "{KEY}"
listener:
  batch_size: 100
"#
        )
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), base_yaml()).unwrap();

        let settings = ConfigLoader::new(dir.path()).load_with_vars(vec![]).unwrap();
        assert_eq!(settings.source.name, "source");
        assert_eq!(settings.source.start_block, 1_000_000);
        assert_eq!(settings.destination.name, "polygon");
        assert_eq!(settings.destination.gas_limit, 200_000);
        assert_eq!(settings.listener, ListenerSettings::default());
        assert_eq!(settings.listener.poll_interval(), Duration::from_secs(15));
        assert_eq!(settings.listener.checkpoint_path, PathBuf::from("listener_state.json"));
        assert_eq!(settings.gas_oracle.floor_wei(), 20_000_000_000);
        assert_eq!(settings.gas_oracle.endpoint, None);
    }

    #[test]
    fn test_layers_override_in_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), base_yaml()).unwrap();
        fs::write(
            dir.path().join("production.yaml"),
            "listener:\n  batch_size: 500\n  poll_interval_secs: 5\nsource:\n  start_block: 42\n",
        )
        .unwrap();

        let settings = ConfigLoader::new(dir.path())
            .with_env("production")
            .load_with_vars(vars(&[
                ("RELAYER_LISTENER__BATCH_SIZE", "250"),
                ("RELAYER_GAS_ORACLE__ENDPOINT", "https://gas.example.com/v1"),
                ("RELAYER_GAS_ORACLE__API_KEY", "secret"),
                ("RELAYER_ENV", "production"),
                ("OTHER_LISTENER__BATCH_SIZE", "1"),
            ]))
            .unwrap();

        assert_eq!(settings.listener.batch_size, 250);
        assert_eq!(settings.listener.poll_interval_secs, 5);
        assert_eq!(settings.source.start_block, 42);
        // untouched keys of the base layer survive the merge
        assert_eq!(settings.source.rpc_url, "http://localhost:8545");
        assert_eq!(settings.gas_oracle.endpoint.as_deref(), Some("https://gas.example.com/v1"));
        assert_eq!(settings.gas_oracle.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_missing_env_layer_is_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), base_yaml()).unwrap();
        assert!(ConfigLoader::new(dir.path()).with_env("staging").load_with_vars(vec![]).is_ok());
    }

    #[test]
    fn test_malformed_layer_is_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), base_yaml()).unwrap();
        fs::write(dir.path().join("development.yaml"), "listener: [unclosed").unwrap();
        let settings = ConfigLoader::new(dir.path()).load_with_vars(vec![]).unwrap();
        assert_eq!(settings.listener.batch_size, 100);
    }

    #[test]
    fn test_missing_config_dir_is_fatal() {
        let dir = tempdir().unwrap();
        let err = ConfigLoader::new(dir.path().join("nope")).load_with_vars(vec![]).unwrap_err();
        assert!(err.to_string().contains("Config directory not found"));
    }

    #[test]
    fn test_validation() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), base_yaml()).unwrap();
        let loader = ConfigLoader::new(dir.path());

        assert!(loader.load_with_vars(vars(&[("RELAYER_LISTENER__BATCH_SIZE", "0")])).is_err());
        assert!(loader.load_with_vars(vars(&[("RELAYER_LISTENER__POLL_INTERVAL_SECS", "0")])).is_err());
        assert!(loader.load_with_vars(vars(&[("RELAYER_SOURCE__RPC_URL", "not a url")])).is_err());
        assert!(loader
            .load_with_vars(vars(&[("RELAYER_DESTINATION__RELAYER_PRIVATE_KEY", "0xdeadbeef")]))
            .is_err());
    }

    #[test]
    fn test_private_key_is_redacted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), base_yaml()).unwrap();
        let settings = ConfigLoader::new(dir.path()).load_with_vars(vec![]).unwrap();
        let debug = format!("{settings:?}");
        assert!(!debug.contains(&KEY[2..]));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_numeric_overrides_of_text_settings() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), base_yaml()).unwrap();

        let settings = ConfigLoader::new(dir.path())
            .load_with_vars(vars(&[
                ("RELAYER_GAS_ORACLE__ENDPOINT", "https://gas.example.com"),
                ("RELAYER_GAS_ORACLE__API_KEY", "123456"),
                ("RELAYER_SOURCE__NAME", "1"),
                ("RELAYER_DESTINATION__NAME", "007"),
                ("RELAYER_LISTENER__CHECKPOINT_PATH", "2024"),
            ]))
            .unwrap();

        assert_eq!(settings.gas_oracle.api_key.as_deref(), Some("123456"));
        assert_eq!(settings.source.name, "1");
        assert_eq!(settings.destination.name, "007");
        assert_eq!(settings.listener.checkpoint_path, PathBuf::from("2024"));
    }

    #[test]
    fn test_empty_values_mean_unset() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.yaml"), base_yaml()).unwrap();
        fs::write(dir.path().join("development.yaml"), "gas_oracle:\n  api_key: \"\"\n").unwrap();

        let settings = ConfigLoader::new(dir.path())
            .load_with_vars(vars(&[
                ("RELAYER_GAS_ORACLE__ENDPOINT", ""),
                ("RELAYER_LISTENER__BATCH_SIZE", "  "),
            ]))
            .unwrap();

        assert_eq!(settings.gas_oracle.endpoint, None);
        assert_eq!(settings.gas_oracle.api_key, None);
        assert_eq!(settings.listener.batch_size, 100);
    }

    #[test]
    fn test_coerce_scalar() {
        assert_eq!(coerce_scalar("TRUE"), Value::Bool(true));
        assert_eq!(coerce_scalar("false"), Value::Bool(false));
        assert_eq!(coerce_scalar("42"), Value::Number(42u64.into()));
        assert_eq!(coerce_scalar("-7"), Value::Number((-7i64).into()));
        assert_eq!(coerce_scalar("1.5"), Value::Number(1.5f64.into()));
        assert_eq!(coerce_scalar("http://x"), Value::String("http://x".to_string()));
        assert_eq!(coerce_scalar("nan"), Value::String("nan".to_string()));
        assert_eq!(coerce_scalar("007"), Value::String("007".to_string()));
        assert_eq!(coerce_scalar("1e3"), Value::String("1e3".to_string()));
        let long_digits = "1".repeat(64);
        assert_eq!(coerce_scalar(&long_digits), Value::String(long_digits.clone()));
    }

    #[test]
    fn test_deep_merge() {
        let mut base: Value = serde_yaml::from_str("a: {b: 1, c: 2}\nd: [1]").unwrap();
        let overlay: Value = serde_yaml::from_str("a: {c: 3}\nd: [2, 3]").unwrap();
        deep_merge(&mut base, overlay);
        let expected: Value = serde_yaml::from_str("a: {b: 1, c: 3}\nd: [2, 3]").unwrap();
        assert_eq!(base, expected);
    }
}
