//! Environment configuration for workers
//!
//! Configuration is read through the [`EnvSource`] trait so that parsing and
//! validation can be unit tested without touching process-global state.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::{
    DEFAULT_DEGRADED_AFTER_FAILURES, DEFAULT_HEALTH_ADDR, DEFAULT_HEARTBEAT_INTERVAL_SECS,
    DEFAULT_LISTEN_ADDR, DEFAULT_MAX_CONCURRENCY, DEFAULT_RENEWAL_MARGIN_SECS,
    DEFAULT_SHUTDOWN_GRACE_SECS,
};

/// Environment variable names
pub mod vars {
    pub const SERVICE_NAME: &str = "TRELLIS_SERVICE_NAME";
    pub const SERVICE_TYPE: &str = "TRELLIS_SERVICE_TYPE";
    pub const INSTANCE_ID: &str = "TRELLIS_INSTANCE_ID";
    pub const HOSTNAME: &str = "HOSTNAME";
    pub const AUTHORITY_URL: &str = "TRELLIS_AUTHORITY_URL";
    pub const HTTPS_ONLY: &str = "TRELLIS_HTTPS_ONLY";
    pub const BOOTSTRAP_TOKEN: &str = "TRELLIS_BOOTSTRAP_TOKEN";
    pub const AUTHORITY_CA_FILE: &str = "TRELLIS_AUTHORITY_CA_FILE";
    pub const LISTEN_ADDR: &str = "TRELLIS_LISTEN_ADDR";
    pub const HEALTH_ADDR: &str = "TRELLIS_HEALTH_ADDR";
    pub const ADVERTISE_ENDPOINT: &str = "TRELLIS_ADVERTISE_ENDPOINT";
    pub const CERT_SANS: &str = "TRELLIS_CERT_SANS";
    pub const HEARTBEAT_INTERVAL_SECS: &str = "TRELLIS_HEARTBEAT_INTERVAL_SECS";
    pub const RENEWAL_MARGIN_SECS: &str = "TRELLIS_RENEWAL_MARGIN_SECS";
    pub const DEGRADED_AFTER_FAILURES: &str = "TRELLIS_DEGRADED_AFTER_FAILURES";
    pub const SHUTDOWN_GRACE_SECS: &str = "TRELLIS_SHUTDOWN_GRACE_SECS";
    pub const API_TOKENS: &str = "TRELLIS_API_TOKENS";
    pub const MAX_CONCURRENCY: &str = "TRELLIS_MAX_CONCURRENCY";
}

/// Source of configuration values
///
/// Empty values are treated the same as unset ones by [`WorkerConfig::from_env`].
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Look up a variable by name
    fn var(&self, key: &str) -> Option<String>;
}

/// Default implementation that reads from process environment variables
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// A caller credential accepted on the mesh endpoints
#[derive(Clone)]
pub struct ApiToken {
    /// Caller identity the token authenticates as
    pub caller_id: String,
    /// Tenant the caller is scoped to, if any
    pub tenant: Option<String>,
    /// The raw token value
    pub token: Zeroizing<String>,
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiToken")
            .field("caller_id", &self.caller_id)
            .field("tenant", &self.tenant)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Fully validated worker configuration
#[derive(Clone)]
pub struct WorkerConfig {
    /// Service identity placed in the certificate subject
    pub service_name: String,
    /// Registry key selecting the capability set
    pub service_type: String,
    /// Instance discriminator; combined with the service name into the worker id
    pub instance_id: String,
    /// Base URL of the authority/platform
    pub authority_url: String,
    /// Reject non-https authority URLs
    pub https_only: bool,
    /// Pre-shared bootstrap credential for CSR submission
    pub bootstrap_token: Zeroizing<String>,
    /// Pre-provisioned root CA (PEM) for the bootstrap channel
    pub authority_ca_pem: Option<String>,
    /// mTLS listener address
    pub listen_addr: SocketAddr,
    /// Plaintext liveness listener address
    pub health_addr: SocketAddr,
    /// Endpoint advertised to the platform
    pub advertise_endpoint: String,
    /// Extra subject alternative names requested for the certificate
    pub cert_sans: Vec<String>,
    /// Heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Safety margin before `not_after` at which renewal starts
    pub renewal_margin: Duration,
    /// Consecutive heartbeat failures before the worker reports Degraded
    pub degraded_after_failures: u32,
    /// Drain period for in-flight requests at shutdown
    pub shutdown_grace: Duration,
    /// Caller tokens accepted on the mesh endpoints
    pub api_tokens: Vec<ApiToken>,
    /// Denominator for the load score
    pub max_concurrency: u32,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("service_name", &self.service_name)
            .field("service_type", &self.service_type)
            .field("instance_id", &self.instance_id)
            .field("authority_url", &self.authority_url)
            .field("https_only", &self.https_only)
            .field("bootstrap_token", &"[REDACTED]")
            .field("authority_ca_pem", &self.authority_ca_pem.is_some())
            .field("listen_addr", &self.listen_addr)
            .field("health_addr", &self.health_addr)
            .field("advertise_endpoint", &self.advertise_endpoint)
            .field("cert_sans", &self.cert_sans)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("renewal_margin", &self.renewal_margin)
            .field("degraded_after_failures", &self.degraded_after_failures)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("api_tokens", &self.api_tokens)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl WorkerConfig {
    /// Read and validate configuration from an environment source
    ///
    /// Fails with [`Error::Config`] naming the offending variable. The
    /// authority CA file, when configured, is read here so that a missing
    /// file fails before any network activity.
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        let get = |key: &str| env.var(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).ok_or_else(|| Error::config(key, "is required"));

        let service_name = required(vars::SERVICE_NAME)?;
        validate_service_name(vars::SERVICE_NAME, &service_name)?;

        let service_type = get(vars::SERVICE_TYPE).unwrap_or_else(|| service_name.clone());
        let instance_id = get(vars::INSTANCE_ID)
            .or_else(|| get(vars::HOSTNAME))
            .unwrap_or_else(|| "0".to_string());

        let https_only = match get(vars::HTTPS_ONLY) {
            Some(v) => parse_bool(vars::HTTPS_ONLY, &v)?,
            None => true,
        };
        let authority_url = required(vars::AUTHORITY_URL)?
            .trim_end_matches('/')
            .to_string();
        validate_authority_url(&authority_url, https_only)?;

        let bootstrap_token = Zeroizing::new(required(vars::BOOTSTRAP_TOKEN)?);

        let authority_ca_pem = match get(vars::AUTHORITY_CA_FILE) {
            Some(path) => {
                let path = PathBuf::from(path);
                let pem = std::fs::read_to_string(&path).map_err(|e| {
                    Error::config(
                        vars::AUTHORITY_CA_FILE,
                        format!("failed to read {}: {}", path.display(), e),
                    )
                })?;
                Some(pem)
            }
            None => None,
        };

        let listen_addr = parse_addr(
            vars::LISTEN_ADDR,
            get(vars::LISTEN_ADDR).as_deref().unwrap_or(DEFAULT_LISTEN_ADDR),
        )?;
        let health_addr = parse_addr(
            vars::HEALTH_ADDR,
            get(vars::HEALTH_ADDR).as_deref().unwrap_or(DEFAULT_HEALTH_ADDR),
        )?;

        let advertise_endpoint = get(vars::ADVERTISE_ENDPOINT)
            .unwrap_or_else(|| format!("https://{}:{}", service_name, listen_addr.port()));

        let cert_sans = get(vars::CERT_SANS)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let heartbeat_secs = parse_u64(
            vars::HEARTBEAT_INTERVAL_SECS,
            get(vars::HEARTBEAT_INTERVAL_SECS),
            DEFAULT_HEARTBEAT_INTERVAL_SECS,
        )?;
        if heartbeat_secs == 0 {
            return Err(Error::config(vars::HEARTBEAT_INTERVAL_SECS, "must be at least 1"));
        }

        let renewal_margin_secs = parse_u64(
            vars::RENEWAL_MARGIN_SECS,
            get(vars::RENEWAL_MARGIN_SECS),
            DEFAULT_RENEWAL_MARGIN_SECS,
        )?;

        let degraded_after_failures = parse_u64(
            vars::DEGRADED_AFTER_FAILURES,
            get(vars::DEGRADED_AFTER_FAILURES),
            DEFAULT_DEGRADED_AFTER_FAILURES as u64,
        )?;
        let degraded_after_failures = u32::try_from(degraded_after_failures)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| Error::config(vars::DEGRADED_AFTER_FAILURES, "must be between 1 and 2^32-1"))?;

        let shutdown_grace_secs = parse_u64(
            vars::SHUTDOWN_GRACE_SECS,
            get(vars::SHUTDOWN_GRACE_SECS),
            DEFAULT_SHUTDOWN_GRACE_SECS,
        )?;

        let api_tokens = match get(vars::API_TOKENS) {
            Some(v) => parse_api_tokens(&v)?,
            None => Vec::new(),
        };

        let max_concurrency = parse_u64(
            vars::MAX_CONCURRENCY,
            get(vars::MAX_CONCURRENCY),
            DEFAULT_MAX_CONCURRENCY as u64,
        )?;
        let max_concurrency = u32::try_from(max_concurrency)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| Error::config(vars::MAX_CONCURRENCY, "must be between 1 and 2^32-1"))?;

        Ok(Self {
            service_name,
            service_type,
            instance_id,
            authority_url,
            https_only,
            bootstrap_token,
            authority_ca_pem,
            listen_addr,
            health_addr,
            advertise_endpoint,
            cert_sans,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            renewal_margin: Duration::from_secs(renewal_margin_secs),
            degraded_after_failures,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            api_tokens,
            max_concurrency,
        })
    }

    /// Stable worker identifier: service name plus instance
    pub fn worker_id(&self) -> String {
        format!("{}-{}", self.service_name, self.instance_id)
    }
}

/// Service names become certificate subjects and DNS SANs, so they are
/// restricted to a single lowercase DNS label.
pub fn validate_service_name(key: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(Error::config(key, "must be 1-63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::config(
            key,
            "must contain only lowercase letters, digits and '-'",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::config(key, "must not start or end with '-'"));
    }
    Ok(())
}

fn validate_authority_url(url: &str, https_only: bool) -> Result<()> {
    let scheme_ok = url.starts_with("https://") || (!https_only && url.starts_with("http://"));
    if !scheme_ok {
        let message = if https_only {
            format!("'{}' must use https ({} is enabled)", url, vars::HTTPS_ONLY)
        } else {
            format!("'{}' must use http or https", url)
        };
        return Err(Error::config(vars::AUTHORITY_URL, message));
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(key, format!("'{}' is not a boolean", other))),
    }
}

fn parse_u64(key: &str, value: Option<String>, default: u64) -> Result<u64> {
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| Error::config(key, format!("'{}' is not a non-negative integer", v))),
        None => Ok(default),
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(key, format!("'{}' is not a socket address", value)))
}

/// Parse `caller:tenant:token` triples separated by commas
///
/// An empty tenant (`caller::token`) means the caller is not tenant scoped.
fn parse_api_tokens(value: &str) -> Result<Vec<ApiToken>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let caller = parts.next().unwrap_or_default();
            let tenant = parts.next();
            let token = parts.next();
            match (tenant, token) {
                (Some(tenant), Some(token)) if !caller.is_empty() && !token.is_empty() => {
                    Ok(ApiToken {
                        caller_id: caller.to_string(),
                        tenant: (!tenant.is_empty()).then(|| tenant.to_string()),
                        token: Zeroizing::new(token.to_string()),
                    })
                }
                _ => Err(Error::config(
                    vars::API_TOKENS,
                    "entries must have the form caller:tenant:token",
                )),
            }
        })
        .collect()
}
