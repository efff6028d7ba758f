use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// Closed set of identity providers this service links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Bluesky,
    Google,
    Github,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Bluesky, Provider::Google, Provider::Github];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Bluesky => "bluesky",
            Provider::Google => "google",
            Provider::Github => "github",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProvider(pub String);

impl std::fmt::Display for UnknownProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown provider '{}'", self.0)
    }
}

impl std::error::Error for UnknownProvider {}

impl std::str::FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bluesky" => Ok(Provider::Bluesky),
            "google" => Ok(Provider::Google),
            "github" => Ok(Provider::Github),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// A freshly exchanged access/refresh pair as returned by a provider.
///
/// `refresh_token` is `None` for rotation-less grants; the caller retains the
/// previously stored refresh credential in that case. `expires_at` is `None`
/// when the provider declared no validity horizon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The stored refresh credential is structurally absent. Raised before
    /// any network call and excluded from failure-threshold counting: the
    /// condition can never succeed on retry.
    NoRefreshCredential,

    /// Network-level failure reaching the provider.
    Transport(String),

    /// The provider answered with an explicit error payload or an error
    /// status.
    Provider {
        error: String,
        description: Option<String>,
    },

    /// The body was readable but did not contain a credential.
    BadResponse(String),

    /// The sealed refresh credential could not be decrypted.
    Decrypt,
}

impl RefreshError {
    /// Whether this failure advances the per-account failure counter.
    pub fn counts_toward_threshold(&self) -> bool {
        !matches!(self, RefreshError::NoRefreshCredential)
    }
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::NoRefreshCredential => write!(f, "no refresh credential stored"),
            RefreshError::Transport(msg) => write!(f, "transport error: {msg}"),
            RefreshError::Provider { error, description } => {
                write!(f, "provider refresh returned error '{error}'")?;
                if let Some(desc) = description {
                    if !desc.is_empty() {
                        write!(f, ": {desc}")?;
                    }
                }
                Ok(())
            }
            RefreshError::BadResponse(msg) => write!(f, "unusable refresh response: {msg}"),
            RefreshError::Decrypt => write!(f, "stored refresh credential is unreadable"),
        }
    }
}

impl std::error::Error for RefreshError {}

/// Parse an OAuth2 refresh-grant (or code-exchange) response body.
///
/// Supports JSON (preferred) and `application/x-www-form-urlencoded` bodies;
/// GitHub historically serves the latter without an Accept header. Provider
/// error payloads are surfaced even on HTTP 200.
///
/// This intentionally does **not** echo the raw body in errors to avoid
/// leaking access tokens into logs.
pub fn parse_oauth_refresh_body(body: &str) -> Result<RefreshedCredential, RefreshError> {
    // 1) JSON
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        if let Some(tok) = v.get("access_token").and_then(|v| v.as_str()) {
            let refresh_token = v
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            let expires_at = v
                .get("expires_in")
                .and_then(|v| v.as_i64())
                .map(|secs| Utc::now() + Duration::seconds(secs));

            return Ok(RefreshedCredential {
                access_token: tok.to_string(),
                refresh_token,
                expires_at,
            });
        }

        if let Some(err) = v.get("error").and_then(|v| v.as_str()) {
            return Err(RefreshError::Provider {
                error: err.to_string(),
                description: v
                    .get("error_description")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            });
        }

        return Err(RefreshError::BadResponse(
            "missing access_token".to_string(),
        ));
    }

    // 2) x-www-form-urlencoded
    let pairs = parse_form_urlencoded(body);
    if !pairs.is_empty() {
        let mut access_token: Option<String> = None;
        let mut refresh_token: Option<String> = None;
        let mut expires_in: Option<i64> = None;
        let mut err: Option<String> = None;
        let mut desc: Option<String> = None;

        for (k, v) in pairs {
            match k.as_str() {
                "access_token" => access_token = Some(v),
                "refresh_token" if !v.is_empty() => refresh_token = Some(v),
                "expires_in" => expires_in = v.parse().ok(),
                "error" => err = Some(v),
                "error_description" => desc = Some(v),
                _ => {}
            }
        }

        if let Some(tok) = access_token {
            return Ok(RefreshedCredential {
                access_token: tok,
                refresh_token,
                expires_at: expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            });
        }

        if let Some(err) = err {
            return Err(RefreshError::Provider {
                error: err,
                description: desc,
            });
        }

        return Err(RefreshError::BadResponse(
            "missing access_token".to_string(),
        ));
    }

    Err(RefreshError::BadResponse(
        "unrecognized response format".to_string(),
    ))
}

/// Parse a `com.atproto.server.refreshSession` response body.
pub fn parse_bsky_refresh_body(body: &str) -> Result<RefreshedCredential, RefreshError> {
    let v: Value = serde_json::from_str(body)
        .map_err(|e| RefreshError::BadResponse(format!("invalid JSON: {e}")))?;

    if let Some(err) = v.get("error").and_then(|v| v.as_str()) {
        return Err(RefreshError::Provider {
            error: err.to_string(),
            description: v
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        });
    }

    let access = v
        .get("accessJwt")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RefreshError::BadResponse("missing accessJwt".to_string()))?;
    let refresh = v
        .get("refreshJwt")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let active_until = v.get("activeUntil").and_then(|v| v.as_str()).unwrap_or("");

    Ok(RefreshedCredential {
        access_token: access.to_string(),
        refresh_token: refresh,
        expires_at: Some(parse_active_until(active_until)),
    })
}

/// PDS responses do not always carry `activeUntil`; fall back to a
/// conservative six-hour horizon so the scheduler revisits the account.
pub fn parse_active_until(s: &str) -> DateTime<Utc> {
    if s.is_empty() {
        return Utc::now() + Duration::hours(6);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now() + Duration::hours(6))
}

fn parse_form_urlencoded(body: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();

    // Fast check to avoid treating arbitrary strings as form bodies.
    if !body.contains('=') {
        return out;
    }

    for part in body.split('&') {
        if part.is_empty() {
            continue;
        }
        let (k, v) = match part.split_once('=') {
            Some((k, v)) => (k, v),
            None => (part, ""),
        };

        let k = urlencoding::decode(k)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| k.to_string());
        let v = urlencoding::decode(v)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| v.to_string());

        out.push((k, v));
    }

    out
}
