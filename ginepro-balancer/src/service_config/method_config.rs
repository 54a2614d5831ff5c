use super::ServiceConfigError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tonic::Code;

const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Call settings a service recommends for one method, a whole service, or every method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodConfig {
    /// Whether calls wait for a ready connection instead of failing fast.
    /// A value set on the call takes precedence.
    pub wait_for_ready: Option<bool>,
    /// Default timeout for calls.
    pub timeout: Option<Duration>,
    /// Largest request message the client may send, in bytes.
    pub max_request_bytes: Option<u64>,
    /// Largest response message the client may receive, in bytes.
    pub max_response_bytes: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
}

/// How calls to a method are retried.
///
/// Attempt `n` is delayed by a random duration between zero and
/// `min(initial_backoff * backoff_multiplier^(n-1), max_backoff)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the original call. Between 2 and 5.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Status codes that make a call eligible for a retry. Never empty.
    pub retryable_status_codes: HashSet<Code>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RawMethodConfig {
    #[serde(default)]
    pub(super) name: Vec<RawName>,
    wait_for_ready: Option<bool>,
    timeout: Option<String>,
    max_request_message_bytes: Option<u64>,
    max_response_message_bytes: Option<u64>,
    retry_policy: Option<RawRetryPolicy>,
}

#[derive(Debug, Deserialize)]
pub(super) struct RawName {
    #[serde(default)]
    service: String,
    #[serde(default)]
    method: String,
}

impl RawName {
    /// The lookup key: `/service/method`, `/service/` for every method of a
    /// service, or the empty string for every method of every service.
    pub(super) fn path(&self) -> Result<String, ServiceConfigError> {
        if self.service.is_empty() {
            if !self.method.is_empty() {
                return Err(ServiceConfigError::EmptyServiceNonEmptyMethod);
            }
            return Ok(String::new());
        }
        Ok(format!("/{}/{}", self.service, self.method))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryPolicy {
    #[serde(default)]
    max_attempts: i64,
    #[serde(default)]
    initial_backoff: String,
    #[serde(default)]
    max_backoff: String,
    #[serde(default)]
    backoff_multiplier: f64,
    #[serde(default)]
    retryable_status_codes: Vec<Value>,
}

impl RawMethodConfig {
    pub(super) fn convert(self) -> Result<MethodConfig, ServiceConfigError> {
        let timeout = self.timeout.as_deref().map(parse_duration).transpose()?;
        let retry_policy = match self.retry_policy {
            Some(raw) => convert_retry_policy(raw)?,
            None => None,
        };

        Ok(MethodConfig {
            wait_for_ready: self.wait_for_ready,
            timeout,
            max_request_bytes: self.max_request_message_bytes,
            max_response_bytes: self.max_response_message_bytes,
            retry_policy,
        })
    }
}

// An illegal retry policy is dropped rather than failing the whole service config.
fn convert_retry_policy(raw: RawRetryPolicy) -> Result<Option<RetryPolicy>, ServiceConfigError> {
    let initial_backoff = parse_duration(&raw.initial_backoff)?;
    let max_backoff = parse_duration(&raw.max_backoff)?;
    let retryable_status_codes = raw
        .retryable_status_codes
        .iter()
        .map(parse_status_code)
        .collect::<Result<HashSet<_>, _>>()?;

    if raw.max_attempts <= 1
        || initial_backoff.is_zero()
        || max_backoff.is_zero()
        || raw.backoff_multiplier <= 0.0
        || retryable_status_codes.is_empty()
    {
        tracing::warn!(policy = ?raw, "ignoring retry policy due to illegal configuration");
        return Ok(None);
    }

    Ok(Some(RetryPolicy {
        max_attempts: raw.max_attempts.min(i64::from(MAX_RETRY_ATTEMPTS)) as u32,
        initial_backoff,
        max_backoff,
        backoff_multiplier: raw.backoff_multiplier,
        retryable_status_codes,
    }))
}

/// Parse a protobuf JSON duration such as `"1.5s"` or `".000000001s"`.
pub(crate) fn parse_duration(s: &str) -> Result<Duration, ServiceConfigError> {
    let malformed = || ServiceConfigError::MalformedDuration(s.to_string());

    let number = s.strip_suffix('s').ok_or_else(malformed)?;
    let mut parts = number.splitn(3, '.');
    let seconds = parts.next().unwrap_or_default();
    let fraction = parts.next();
    if parts.next().is_some() {
        return Err(malformed());
    }

    let mut has_digits = false;
    let mut duration = Duration::ZERO;
    if !seconds.is_empty() {
        let seconds: u32 = seconds.parse().map_err(|_| malformed())?;
        duration += Duration::from_secs(u64::from(seconds));
        has_digits = true;
    }
    if let Some(fraction) = fraction.filter(|f| !f.is_empty()) {
        if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let nanos: u32 = fraction.parse().map_err(|_| malformed())?;
        let scale = 10_u32.pow(9 - fraction.len() as u32);
        duration += Duration::from_nanos(u64::from(nanos * scale));
        has_digits = true;
    }

    if !has_digits {
        return Err(malformed());
    }
    Ok(duration)
}

/// Status codes are accepted by name (`"UNAVAILABLE"`) or by number (`14`).
fn parse_status_code(value: &Value) -> Result<Code, ServiceConfigError> {
    let invalid = || ServiceConfigError::InvalidStatusCode(value.to_string());
    match value {
        Value::String(name) => code_from_name(name).ok_or_else(invalid),
        Value::Number(number) => number
            .as_u64()
            .filter(|n| *n <= 16)
            .map(|n| Code::from_i32(n as i32))
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn code_from_name(name: &str) -> Option<Code> {
    let code = match name {
        "OK" => Code::Ok,
        "CANCELLED" => Code::Cancelled,
        "UNKNOWN" => Code::Unknown,
        "INVALID_ARGUMENT" => Code::InvalidArgument,
        "DEADLINE_EXCEEDED" => Code::DeadlineExceeded,
        "NOT_FOUND" => Code::NotFound,
        "ALREADY_EXISTS" => Code::AlreadyExists,
        "PERMISSION_DENIED" => Code::PermissionDenied,
        "RESOURCE_EXHAUSTED" => Code::ResourceExhausted,
        "FAILED_PRECONDITION" => Code::FailedPrecondition,
        "ABORTED" => Code::Aborted,
        "OUT_OF_RANGE" => Code::OutOfRange,
        "UNIMPLEMENTED" => Code::Unimplemented,
        "INTERNAL" => Code::Internal,
        "UNAVAILABLE" => Code::Unavailable,
        "DATA_LOSS" => Code::DataLoss,
        "UNAUTHENTICATED" => Code::Unauthenticated,
        _ => return None,
    };
    Some(code)
}
