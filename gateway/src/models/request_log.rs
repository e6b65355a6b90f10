use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Maximum characters of prompt / response text kept in a log row.
const TEXT_LIMIT: usize = 2_000;

/// Audit record for one fulfilled (or failed) request. Display-only; nothing
/// in the control plane reads these back.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub id: Uuid,
    pub account_email: String,
    pub model: String,
    pub prompt: String,
    pub response_text: String,
    pub tokens: i64,
    pub success: bool,
    pub system_instruction: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RequestLog {
    /// Build a log entry, truncating free text and scrubbing any occurrence
    /// of the account's token material. Prompts can quote tokens back at us
    /// (users paste error output), so scrubbing the row is not optional.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_email: &str,
        model: &str,
        prompt: &str,
        response_text: &str,
        tokens: i64,
        success: bool,
        system_instruction: Option<&str>,
        secrets: &[&str],
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_email: account_email.to_string(),
            model: model.to_string(),
            prompt: scrub_secrets(&truncate(prompt), secrets),
            response_text: scrub_secrets(&truncate(response_text), secrets),
            tokens,
            success,
            system_instruction: system_instruction.map(|s| scrub_secrets(&truncate(s), secrets)),
            created_at: Utc::now(),
        }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= TEXT_LIMIT {
        return text.to_string();
    }
    text.chars().take(TEXT_LIMIT).collect()
}

/// Replace every occurrence of each secret with a fixed marker.
pub fn scrub_secrets(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if secret.is_empty() {
            continue;
        }
        out = out.replace(secret, "[REDACTED]");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_replaces_all_occurrences() {
        let out = scrub_secrets("token ya29.abc then ya29.abc again", &["ya29.abc"]);
        assert_eq!(out, "token [REDACTED] then [REDACTED] again");
    }

    #[test]
    fn test_scrub_ignores_empty_secret() {
        assert_eq!(scrub_secrets("hello", &[""]), "hello");
    }

    #[test]
    fn test_log_entry_never_contains_tokens() {
        let access = "ya29.A0ARrdaM-secret-access";
        let refresh = "1//0gsecret-refresh";
        let prompt = format!("my error says {} and {}", access, refresh);

        let entry = RequestLog::new(
            "a@x.com",
            "gemini-2.5-flash",
            &prompt,
            "ok",
            3,
            true,
            Some(&format!("context: {}", access)),
            &[access, refresh],
        );

        assert!(!entry.prompt.contains(access));
        assert!(!entry.prompt.contains(refresh));
        assert!(!entry.system_instruction.as_deref().unwrap().contains(access));
        assert!(entry.prompt.contains("[REDACTED]"));
    }

    #[test]
    fn test_truncation() {
        let long = "x".repeat(5_000);
        let entry = RequestLog::new("a@x.com", "m", &long, "", 0, false, None, &[]);
        assert_eq!(entry.prompt.chars().count(), 2_000);
    }
}
