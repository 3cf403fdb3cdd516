fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A degraded-but-continuing condition. Rendered as sanitized key=value
/// fields so log lines stay greppable by `code`.
#[derive(Debug, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    pub stage: &'a str,
    pub action: &'a str,
    pub session: &'a str,
    pub artifact: &'a str,
    pub source: &'a str,
    pub retry: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

pub fn emit(event: WarnEvent<'_>) {
    tracing::warn!(
        code = %sanitize_value(event.code),
        stage = %sanitize_value(event.stage),
        action = %sanitize_value(event.action),
        session = %sanitize_value(event.session),
        artifact = %sanitize_value(event.artifact),
        source = %sanitize_value(event.source),
        retry = %sanitize_value(event.retry),
        reason = %sanitize_value(event.reason),
        err = %sanitize_value(event.err),
        "CTX_BUDGET_WARN"
    );
}

#[cfg(test)]
mod tests {
    use super::sanitize_value;

    #[test]
    fn sanitize_value_rewrites_whitespace() {
        assert_eq!(sanitize_value("a b\tc"), "a_b_c");
    }

    #[test]
    fn sanitize_value_falls_back_for_empty() {
        assert_eq!(sanitize_value("   "), "na");
    }

    #[test]
    fn sanitize_value_drops_non_ascii_and_collapses_runs() {
        assert_eq!(sanitize_value("  lock\n\n held é "), "lock_held");
    }
}
