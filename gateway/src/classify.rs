//! Upstream failure classification.
//!
//! Maps an upstream error (HTTP status and/or body text) to a category that
//! drives cooldown duration, rotation, and model fallback. Input is the
//! concatenation of the status (as a leading `"NNN "` token when available)
//! and the response body text.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    RateLimit,
    Quota,
    Auth,
    Timeout,
    Overloaded,
    Billing,
    ModelNotFound,
    Format,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Quota => "quota",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Overloaded => "overloaded",
            ErrorCategory::Billing => "billing",
            ErrorCategory::ModelNotFound => "model_not_found",
            ErrorCategory::Format => "format",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the rotation loop should do after a failure of a given category.
#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    pub should_retry: bool,
    pub should_rotate_account: bool,
    pub should_try_fallback_model: bool,
}

pub fn retry_strategy(category: ErrorCategory) -> RetryStrategy {
    use ErrorCategory::*;
    match category {
        RateLimit | Quota => RetryStrategy {
            should_retry: true,
            should_rotate_account: true,
            should_try_fallback_model: true,
        },
        // Dead credentials: rotate away and stay away until manual recovery.
        Auth | Billing => RetryStrategy {
            should_retry: true,
            should_rotate_account: true,
            should_try_fallback_model: false,
        },
        Overloaded | Timeout | Unknown => RetryStrategy {
            should_retry: true,
            should_rotate_account: true,
            should_try_fallback_model: false,
        },
        // The account isn't at fault; retrying it would repeat the error.
        ModelNotFound => RetryStrategy {
            should_retry: false,
            should_rotate_account: false,
            should_try_fallback_model: true,
        },
        Format => RetryStrategy {
            should_retry: false,
            should_rotate_account: false,
            should_try_fallback_model: false,
        },
    }
}

// ── Pattern banks ───────────────────────────────────────────────
// Checked in a fixed order; first hit wins.

static LEADING_STATUS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d{3})\b").unwrap());

static MODEL_NOT_FOUND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)unknown model|models/\S+ is not found").unwrap());

static QUOTA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)resource has been exhausted|resource_exhausted|quota exceeded|insufficient_quota")
        .unwrap()
});

static RATE_LIMIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate[_ ]limit|too many requests|exceeded your current quota|usage limit")
        .unwrap()
});

static OVERLOADED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)overloaded_error|overloaded|service unavailable|high demand").unwrap()
});

static AUTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)invalid[_ ]api[_ ]key|invalid_grant|token refresh failed|unauthorized|forbidden|re-authenticate|\b401\b|\b403\b",
    )
    .unwrap()
});

static FORMAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)invalid request format|string should match pattern").unwrap());

static BILLING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)status[:=]\s*402|payment required|insufficient credits").unwrap()
});

static TIMEOUT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)timeout|timed out|deadline exceeded|without sending (any )?chunks?|stop reason:\s*abort")
        .unwrap()
});

/// Classify an upstream failure. Total: always returns a category.
pub fn classify(text: &str) -> ErrorCategory {
    // Status shortcut when the text carries a leading "NNN " token.
    if let Some(caps) = LEADING_STATUS_RE.captures(text) {
        let status: u16 = caps[1].parse().unwrap_or(0);
        match status {
            429 => {
                return if QUOTA_RE.is_match(text) {
                    ErrorCategory::Quota
                } else {
                    ErrorCategory::RateLimit
                };
            }
            401 | 403 => return ErrorCategory::Auth,
            402 => return ErrorCategory::Billing,
            404 => return ErrorCategory::ModelNotFound,
            408 | 500 | 502 | 503 | 504 | 521..=524 | 529 => return ErrorCategory::Timeout,
            _ => {}
        }
    }

    if MODEL_NOT_FOUND_RE.is_match(text) {
        ErrorCategory::ModelNotFound
    } else if QUOTA_RE.is_match(text) {
        ErrorCategory::Quota
    } else if RATE_LIMIT_RE.is_match(text) {
        ErrorCategory::RateLimit
    } else if OVERLOADED_RE.is_match(text) {
        ErrorCategory::Overloaded
    } else if AUTH_RE.is_match(text) {
        ErrorCategory::Auth
    } else if FORMAT_RE.is_match(text) {
        ErrorCategory::Format
    } else if BILLING_RE.is_match(text) {
        ErrorCategory::Billing
    } else if TIMEOUT_RE.is_match(text) {
        ErrorCategory::Timeout
    } else {
        ErrorCategory::Unknown
    }
}

/// Convenience for responses: prepend the status so the shortcut rules apply.
pub fn classify_response(status: u16, body: &str) -> ErrorCategory {
    classify(&format!("{} {}", status, body))
}
