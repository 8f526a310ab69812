//! # Client Configuration
//!
//! [`SiiConfig`] is read from `SII_*` environment variables or a YAML file.
//! Every field has a default except the credentials, which are checked when
//! a component needs them.
//!
//! | Variable | Default |
//! |---|---|
//! | `SII_AMBIENTE` | `certificacion` |
//! | `SII_BASE_URL` | host of the environment |
//! | `SII_CERT_PATH` / `SII_KEY_PATH` / `SII_CERT_PASSWORD` | none |
//! | `SII_TIMEOUT_SECS` | 30 |
//! | `SII_MAX_RETRIES` | 3 |
//! | `SII_RETRY_DELAY_MS` / `SII_RETRY_MAX_DELAY_MS` | 1000 / 30000 |
//! | `SII_RETRY_MULTIPLIER` | 2.0 |
//! | `SII_SCHEMA_PATH` | none |
//! | `SII_RUT_EMPRESA` / `SII_RUT_ENVIA` | none |
//! | `SII_FECHA_RESOLUCION` / `SII_NUMERO_RESOLUCION` | none |
//! | `SII_TOKEN_TTL_SECS` / `SII_CACHE_TTL_SECS` | 3600 / 86400 |
//! | `SII_REDIS_URL` | none (in-memory cache) |
//! | `SII_CAF_DIR` | `data/caf` |
//! | `SII_CAF_LOW_STOCK_THRESHOLD` | 1000 |
//! | `SII_CAF_EXPIRY_WARNING_DAYS` | 15 |
//! | `SII_AUTHORITY_KEYS_DIR` | none |
//! | `SII_SEED_ALGORITHM` / `SII_DOCUMENT_ALGORITHM` | `sha1` / `sha1` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use sii_core::{Ambiente, DigestAlgorithm, Endpoint, ErrorKind, Rut, SiiError};
use url::Url;
use zeroize::Zeroizing;

use crate::retry::RetryConfig;

/// A secret string, wiped on drop and never printed.
#[derive(Clone, Default)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wrap a value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// The secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret::new)
    }
}

/// Configuration for every client component.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiiConfig {
    /// Target environment.
    pub ambiente: Ambiente,
    /// Override of the environment host, for tests and proxies.
    pub base_url: Option<String>,
    /// PKCS#12 bundle, or PEM certificate when `key_path` is set.
    pub cert_path: Option<PathBuf>,
    /// PEM private key.
    pub key_path: Option<PathBuf>,
    /// Password of the bundle or key.
    pub cert_password: Option<Secret>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First retry wait in milliseconds.
    pub retry_delay_ms: u64,
    /// Upper bound on any retry wait in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Growth factor between waits.
    pub retry_multiplier: f64,
    /// Optional YAML file of structural validation rules.
    pub schema_path: Option<PathBuf>,
    /// Company issuing documents.
    pub rut_empresa: Option<Rut>,
    /// Person submitting on behalf of the company.
    pub rut_envia: Option<Rut>,
    /// Authorization resolution date.
    pub fecha_resolucion: Option<NaiveDate>,
    /// Authorization resolution number.
    pub numero_resolucion: Option<u32>,
    /// Session token lifetime in seconds when the authority states none.
    pub token_ttl_secs: u64,
    /// Lifetime of cached certificates and folio authorizations in seconds.
    pub cache_ttl_secs: u64,
    /// Remote cache; the in-memory store is used when absent.
    pub redis_url: Option<Secret>,
    /// Directory of the file-system folio authorization store.
    pub caf_dir: PathBuf,
    /// Available-folio count under which alerts fire.
    pub caf_low_stock_threshold: u64,
    /// Days before expiry at which a folio authorization is reported as expiring.
    pub caf_expiry_warning_days: u32,
    /// Directory of `<idk>.pem` authority keys.
    pub authority_keys_dir: Option<PathBuf>,
    /// Algorithm for signing authentication seeds.
    pub seed_algorithm: DigestAlgorithm,
    /// Algorithm for signing documents and envelopes.
    pub document_algorithm: DigestAlgorithm,
}

impl Default for SiiConfig {
    fn default() -> Self {
        Self {
            ambiente: Ambiente::Certificacion,
            base_url: None,
            cert_path: None,
            key_path: None,
            cert_password: None,
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            retry_multiplier: 2.0,
            schema_path: None,
            rut_empresa: None,
            rut_envia: None,
            fecha_resolucion: None,
            numero_resolucion: None,
            token_ttl_secs: 3_600,
            cache_ttl_secs: 86_400,
            redis_url: None,
            caf_dir: PathBuf::from("data/caf"),
            caf_low_stock_threshold: 1_000,
            caf_expiry_warning_days: 15,
            authority_keys_dir: None,
            seed_algorithm: DigestAlgorithm::Sha1,
            document_algorithm: DigestAlgorithm::Sha1,
        }
    }
}

impl std::fmt::Debug for SiiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiiConfig")
            .field("ambiente", &self.ambiente)
            .field("base_url", &self.base_url)
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("cert_password", &self.cert_password.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("retry_max_delay_ms", &self.retry_max_delay_ms)
            .field("retry_multiplier", &self.retry_multiplier)
            .field("schema_path", &self.schema_path)
            .field("rut_empresa", &self.rut_empresa)
            .field("rut_envia", &self.rut_envia)
            .field("fecha_resolucion", &self.fecha_resolucion)
            .field("numero_resolucion", &self.numero_resolucion)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("caf_dir", &self.caf_dir)
            .field("caf_low_stock_threshold", &self.caf_low_stock_threshold)
            .field("caf_expiry_warning_days", &self.caf_expiry_warning_days)
            .field("authority_keys_dir", &self.authority_keys_dir)
            .field("seed_algorithm", &self.seed_algorithm)
            .field("document_algorithm", &self.document_algorithm)
            .finish()
    }
}

impl SiiConfig {
    /// Load from `SII_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SII_AMBIENTE") {
            config.ambiente = parse_var("SII_AMBIENTE", &v)?;
        }
        config.base_url = get("SII_BASE_URL").or(config.base_url);
        config.cert_path = get("SII_CERT_PATH").map(PathBuf::from);
        config.key_path = get("SII_KEY_PATH").map(PathBuf::from);
        config.cert_password = lookup("SII_CERT_PASSWORD").map(Secret::new);
        if let Some(v) = get("SII_TIMEOUT_SECS") {
            config.timeout_secs = parse_var("SII_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("SII_MAX_RETRIES") {
            config.max_retries = parse_var("SII_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("SII_RETRY_DELAY_MS") {
            config.retry_delay_ms = parse_var("SII_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("SII_RETRY_MAX_DELAY_MS") {
            config.retry_max_delay_ms = parse_var("SII_RETRY_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = get("SII_RETRY_MULTIPLIER") {
            config.retry_multiplier = parse_var("SII_RETRY_MULTIPLIER", &v)?;
        }
        config.schema_path = get("SII_SCHEMA_PATH").map(PathBuf::from);
        if let Some(v) = get("SII_RUT_EMPRESA") {
            config.rut_empresa = Some(parse_var("SII_RUT_EMPRESA", &v)?);
        }
        if let Some(v) = get("SII_RUT_ENVIA") {
            config.rut_envia = Some(parse_var("SII_RUT_ENVIA", &v)?);
        }
        if let Some(v) = get("SII_FECHA_RESOLUCION") {
            config.fecha_resolucion = Some(parse_var("SII_FECHA_RESOLUCION", &v)?);
        }
        if let Some(v) = get("SII_NUMERO_RESOLUCION") {
            config.numero_resolucion = Some(parse_var("SII_NUMERO_RESOLUCION", &v)?);
        }
        if let Some(v) = get("SII_TOKEN_TTL_SECS") {
            config.token_ttl_secs = parse_var("SII_TOKEN_TTL_SECS", &v)?;
        }
        if let Some(v) = get("SII_CACHE_TTL_SECS") {
            config.cache_ttl_secs = parse_var("SII_CACHE_TTL_SECS", &v)?;
        }
        config.redis_url = get("SII_REDIS_URL").map(Secret::new);
        if let Some(v) = get("SII_CAF_DIR") {
            config.caf_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SII_CAF_LOW_STOCK_THRESHOLD") {
            config.caf_low_stock_threshold = parse_var("SII_CAF_LOW_STOCK_THRESHOLD", &v)?;
        }
        if let Some(v) = get("SII_CAF_EXPIRY_WARNING_DAYS") {
            config.caf_expiry_warning_days = parse_var("SII_CAF_EXPIRY_WARNING_DAYS", &v)?;
        }
        config.authority_keys_dir = get("SII_AUTHORITY_KEYS_DIR").map(PathBuf::from);
        if let Some(v) = get("SII_SEED_ALGORITHM") {
            config.seed_algorithm = parse_var("SII_SEED_ALGORITHM", &v)?;
        }
        if let Some(v) = get("SII_DOCUMENT_ALGORITHM") {
            config.document_algorithm = parse_var("SII_DOCUMENT_ALGORITHM", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text. Missing keys keep their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be positive".into()));
        }
        if !(self.retry_multiplier.is_finite() && self.retry_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry_multiplier must be a finite number >= 1".into(),
            ));
        }
        if self.retry_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry_delay_ms must not exceed retry_max_delay_ms".into(),
            ));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token_ttl_secs must be positive".into()));
        }
        if self.key_path.is_some() && self.cert_path.is_none() {
            return Err(ConfigError::Invalid(
                "key_path is set but cert_path is not".into(),
            ));
        }
        self.base_url()?;
        Ok(())
    }

    /// Root URL of the authority services.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .base_url
            .clone()
            .unwrap_or_else(|| self.ambiente.base_url());
        Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl(raw, e.to_string()))
    }

    /// Full URL of one endpoint.
    pub fn endpoint_url(&self, endpoint: Endpoint) -> Result<Url, ConfigError> {
        let base = self.base_url()?;
        base.join(endpoint.path())
            .map_err(|e| ConfigError::InvalidUrl(endpoint.path().to_string(), e.to_string()))
    }

    /// Retry policy.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_wait: Duration::from_millis(self.retry_delay_ms),
            max_wait: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
        }
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Default session token lifetime.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Lifetime of cached certificates and authorizations.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Load the configured signing certificate.
    pub fn load_certificate(&self) -> Result<sii_crypto::Certificate, SiiError> {
        let cert_path = self.cert_path.as_ref().ok_or_else(|| {
            SiiError::new(ErrorKind::CertInvalid, "no certificate configured (SII_CERT_PATH)")
        })?;
        let password = self.cert_password.as_ref().map(Secret::expose);
        let certificate = match &self.key_path {
            Some(key_path) => sii_crypto::Certificate::load_pem(cert_path, key_path, password)?,
            None => sii_crypto::Certificate::load_pkcs12(cert_path, password.unwrap_or_default())?,
        };
        Ok(certificate)
    }
}

fn parse_var<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("invalid value for {var}: {reason}")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// Parse failure.
        reason: String,
    },
    /// A URL could not be parsed.
    #[error("invalid URL for {0}: {1}")]
    InvalidUrl(String, String),
    /// The configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The configuration file is not valid YAML for this schema.
    #[error("invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Fields are individually valid but inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for SiiError {
    fn from(err: ConfigError) -> Self {
        SiiError::wrap(ErrorKind::Procesamiento, err.to_string(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = SiiConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.ambiente, Ambiente::Certificacion);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        let retry = config.retry();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.initial_wait, Duration::from_secs(1));
        assert_eq!(retry.max_wait, Duration::from_secs(30));
        assert_eq!(config.token_ttl(), Duration::from_secs(3600));
        assert_eq!(
            config.endpoint_url(Endpoint::Seed).unwrap().as_str(),
            "https://maullin.sii.cl/DTEWS/CrSeed.jws"
        );
    }

    #[test]
    fn reads_variables() {
        let config = SiiConfig::from_lookup(lookup(&[
            ("SII_AMBIENTE", "produccion"),
            ("SII_MAX_RETRIES", "5"),
            ("SII_RUT_EMPRESA", "76.192.083-9"),
            ("SII_FECHA_RESOLUCION", "2014-08-22"),
            ("SII_NUMERO_RESOLUCION", "80"),
            ("SII_CERT_PASSWORD", "hunter2"),
            ("SII_SEED_ALGORITHM", "sha256"),
            ("SII_CAF_EXPIRY_WARNING_DAYS", "30"),
        ]))
        .unwrap();
        assert_eq!(config.ambiente, Ambiente::Produccion);
        assert_eq!(config.caf_expiry_warning_days, 30);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.rut_empresa.as_ref().unwrap().to_string(), "76192083-9");
        assert_eq!(config.numero_resolucion, Some(80));
        assert_eq!(config.seed_algorithm, DigestAlgorithm::Sha256);
        assert_eq!(config.cert_password.as_ref().unwrap().expose(), "hunter2");
        assert!(config.endpoint_url(Endpoint::Upload).unwrap().as_str().starts_with("https://palena.sii.cl/"));
    }

    #[test]
    fn rejects_bad_values() {
        let err = SiiConfig::from_lookup(lookup(&[("SII_MAX_RETRIES", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "SII_MAX_RETRIES"));
        let err = SiiConfig::from_lookup(lookup(&[("SII_BASE_URL", "not a url")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl(..)));
        let err = SiiConfig::from_lookup(lookup(&[("SII_RETRY_MULTIPLIER", "0.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = SiiConfig::from_lookup(lookup(&[
            ("SII_CERT_PASSWORD", "hunter2"),
            ("SII_REDIS_URL", "redis://:pw@cache:6379"),
        ]))
        .unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("pw@cache"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn yaml_overrides_defaults() {
        let config = SiiConfig::from_yaml_str(
            "ambiente: produccion\nbase_url: http://127.0.0.1:9000\nmax_retries: 1\nrut_envia: 11111111-1\n",
        )
        .unwrap();
        assert_eq!(config.ambiente, Ambiente::Produccion);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.retry_delay_ms, 1_000);
        assert_eq!(
            config.endpoint_url(Endpoint::Token).unwrap().as_str(),
            "http://127.0.0.1:9000/DTEWS/GetTokenFromSeed.jws"
        );
    }

    #[test]
    fn yaml_rejects_unknown_keys() {
        assert!(matches!(
            SiiConfig::from_yaml_str("retries: 3\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn missing_certificate_is_cert_invalid() {
        let err = SiiConfig::default().load_certificate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CertInvalid);
    }
}
