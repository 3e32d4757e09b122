//! Credential model and resolution.
//!
//! Resolution is deliberately narrow: the standard environment variables,
//! falling back to a named profile in the shared credentials file. No STS,
//! no instance metadata, no refresh.

pub mod sigv4;

use std::env;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use tracing::debug;

/// A resolved signing credential. The secret never appears in Debug output.
#[derive(Clone)]
pub struct Credential {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("region", &self.region)
            .finish()
    }
}

/// Resolve a credential from the environment, falling back to the shared
/// credentials file (`AWS_SHARED_CREDENTIALS_FILE` or `~/.aws/credentials`)
/// and the profile named by `AWS_PROFILE`.
///
/// # Errors
///
/// Fails when neither source yields a complete key pair.
pub fn resolve_credential(region: &str) -> anyhow::Result<Credential> {
    let access_key = non_empty_env("AWS_ACCESS_KEY_ID");
    let secret_key = non_empty_env("AWS_SECRET_ACCESS_KEY");
    if let (Some(access_key), Some(secret_key)) = (access_key, secret_key) {
        debug!("using credential from environment");
        return Ok(Credential {
            access_key,
            secret_key,
            session_token: non_empty_env("AWS_SESSION_TOKEN"),
            region: region.to_string(),
        });
    }

    let path = non_empty_env("AWS_SHARED_CREDENTIALS_FILE")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".aws/credentials")))
        .context("no credential in the environment and no home directory to locate the shared credentials file")?;
    let profile = non_empty_env("AWS_PROFILE").unwrap_or_else(|| "default".to_string());

    let contents = fs::read_to_string(&path)
        .with_context(|| format!("reading credentials file {}", path.display()))?;
    let keys = parse_profile(&contents, &profile).with_context(|| {
        format!(
            "profile '{profile}' with a complete key pair not found in {}",
            path.display()
        )
    })?;
    debug!(profile = %profile, "using credential from the shared credentials file");

    Ok(Credential {
        access_key: keys.access_key,
        secret_key: keys.secret_key,
        session_token: keys.session_token,
        region: region.to_string(),
    })
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

struct ProfileKeys {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

/// Extract one profile's key material from the INI-style credentials file.
fn parse_profile(contents: &str, profile: &str) -> Option<ProfileKeys> {
    let mut in_profile = false;
    let mut access_key = None;
    let mut secret_key = None;
    let mut session_token = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            match key.trim().to_ascii_lowercase().as_str() {
                "aws_access_key_id" => access_key = Some(value),
                "aws_secret_access_key" => secret_key = Some(value),
                "aws_session_token" => session_token = Some(value),
                _ => {}
            }
        }
    }

    Some(ProfileKeys {
        access_key: access_key?,
        secret_key: secret_key?,
        session_token,
    })
}
