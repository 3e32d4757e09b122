//! Environment-driven configuration, parsed once at startup.

use std::collections::HashSet;
use std::env;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENCY: u64 = 8;
const DEFAULT_MAX_RETRIES: u64 = 3;

/// What to do when a correlation id arrives while the same id is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Fail the new request, preserve the original (the safe default).
    #[default]
    Reject,
    /// Cancel the original and admit the new request.
    Supersede,
}

/// Resolved proxy configuration, passed down explicitly.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Base URL of the signed endpoint, without a trailing slash.
    pub endpoint: String,
    /// Region used in the signing scope.
    pub region: String,
    /// Per-attempt request timeout; also bounds the gap between streamed
    /// chunks.
    pub timeout: Duration,
    /// Maximum concurrent outstanding requests.
    pub max_concurrency: usize,
    /// Total attempts per retryable call.
    pub max_retries: u32,
    /// Method names dispatched in streaming mode.
    pub streaming_methods: HashSet<String>,
    pub duplicate_policy: DuplicatePolicy,
}

impl ProxyConfig {
    /// Read the configuration from the environment.
    ///
    /// # Errors
    ///
    /// Fails when `API_GATEWAY_URL` is unset or empty; every other option
    /// has a default.
    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint = env::var("API_GATEWAY_URL")
            .ok()
            .map(|raw| normalize_endpoint(&raw))
            .filter(|url| !url.is_empty())
            .context("API_GATEWAY_URL is not set")?;

        let region = env::var("AWS_REGION")
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|region| !region.is_empty())
            .unwrap_or_else(|| "us-east-1".to_string());

        let max_concurrency = usize::try_from(positive_env(
            "MCP_PROXY_MAX_CONCURRENCY",
            DEFAULT_MAX_CONCURRENCY,
        ))
        .unwrap_or(usize::MAX);
        let max_retries =
            u32::try_from(positive_env("MCP_PROXY_MAX_RETRIES", DEFAULT_MAX_RETRIES))
                .unwrap_or(u32::MAX);

        Ok(Self {
            endpoint,
            region,
            timeout: Duration::from_secs(positive_env(
                "MCP_PROXY_TIMEOUT_SECS",
                DEFAULT_TIMEOUT_SECS,
            )),
            max_concurrency,
            max_retries,
            streaming_methods: env::var("MCP_PROXY_STREAMING_METHODS")
                .map(|raw| parse_csv(&raw))
                .unwrap_or_default(),
            duplicate_policy: duplicate_policy_env(),
        })
    }
}

fn normalize_endpoint(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

fn positive_env(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Err(_) => default,
        Ok(raw) => parse_positive(&raw).unwrap_or_else(|| {
            warn!(var = name, value = %raw, "not a positive integer, using default");
            default
        }),
    }
}

fn parse_positive(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|v| *v > 0)
}

fn parse_csv(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn duplicate_policy_env() -> DuplicatePolicy {
    match env::var("MCP_PROXY_DUPLICATE_POLICY") {
        Err(_) => DuplicatePolicy::default(),
        Ok(raw) => parse_duplicate_policy(&raw).unwrap_or_else(|| {
            warn!(value = %raw, "unknown duplicate policy, using reject");
            DuplicatePolicy::default()
        }),
    }
}

fn parse_duplicate_policy(raw: &str) -> Option<DuplicatePolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "reject" => Some(DuplicatePolicy::Reject),
        "supersede" => Some(DuplicatePolicy::Supersede),
        _ => None,
    }
}
