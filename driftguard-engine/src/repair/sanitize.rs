//! Strip page HTML of anything that must not leave the process before it is
//! sent to the repair model.
use lol_html::html_content::ContentType;
use lol_html::{doc_comments, element, rewrite_str, RewriteStrSettings};

pub const REDACTED: &str = "[redacted]";

/// Hidden inputs whose name contains one of these are dropped entirely.
pub const SENSITIVE_NAME_KEYWORDS: &[&str] = &["token", "csrf", "session", "nonce", "secret", "key"];

fn is_sensitive_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE_NAME_KEYWORDS.iter().any(|k| name.contains(k))
}

fn is_stripped_attribute(name: &str) -> bool {
    name.starts_with("data-") || name.starts_with("on")
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> (&str, bool) {
    match s.char_indices().nth(max_chars) {
        Some((byte, _)) => (&s[..byte], true),
        None => (s, false),
    }
}

/// Remove or redact:
/// - `<script>` and `<style>` elements with their contents
/// - `value` of every `<input>` and the body of every `<textarea>`
/// - `content` of every `<meta>`
/// - all `data-*` and inline `on*` handler attributes
/// - hidden inputs with a sensitive name
/// - comments
///
/// The result is capped at `max_chars` characters.
pub fn sanitize_html(html: &str, max_chars: usize) -> Result<String, lol_html::errors::RewritingError> {
    let cleaned = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("script, style", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("input", |el| {
                    let hidden = el
                        .get_attribute("type")
                        .is_some_and(|t| t.eq_ignore_ascii_case("hidden"));
                    let sensitive = el.get_attribute("name").is_some_and(|n| is_sensitive_name(&n));
                    if hidden && sensitive {
                        el.remove();
                    } else if el.has_attribute("value") {
                        el.set_attribute("value", REDACTED)?;
                    }
                    Ok(())
                }),
                element!("textarea", |el| {
                    el.set_inner_content(REDACTED, ContentType::Text);
                    Ok(())
                }),
                element!("meta[content]", |el| {
                    el.set_attribute("content", REDACTED)?;
                    Ok(())
                }),
                element!("*", |el| {
                    let doomed: Vec<String> = el
                        .attributes()
                        .iter()
                        .map(|a| a.name())
                        .filter(|n| is_stripped_attribute(n))
                        .collect();
                    for name in doomed {
                        el.remove_attribute(&name);
                    }
                    Ok(())
                }),
            ],
            document_content_handlers: vec![doc_comments!(|c| {
                c.remove();
                Ok(())
            })],
            ..RewriteStrSettings::new()
        },
    )?;

    let (kept, truncated) = truncate_chars(&cleaned, max_chars);
    if truncated {
        tracing::debug!(
            original_chars = cleaned.chars().count(),
            max_chars,
            "repair.sanitize.truncated"
        );
    }
    Ok(kept.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
<meta name="csrf-token" content="meta-secret-123">
<style>.login { color: red }</style>
<script>window.apiKey = "sk-live-abc";</script>
</head><body>
<!-- build 7f3a internal -->
<form id="login" data-tracking="trk-998" onsubmit="steal()">
  <input type="email" name="email" value="alice@example.com">
  <input type="hidden" name="authenticity_token" value="tok-555">
  <input type="hidden" name="step" value="two">
  <textarea name="notes">private notes here</textarea>
  <button type="submit" onclick="go()" data-qa="submit-btn">Sign in</button>
</form>
</body></html>"#;

    #[test]
    fn removes_every_sensitive_literal() {
        let out = sanitize_html(PAGE, 50_000).unwrap();
        for secret in [
            "color: red",
            "sk-live-abc",
            "alice@example.com",
            "tok-555",
            "authenticity_token",
            "private notes here",
            "meta-secret-123",
            "trk-998",
            "data-tracking",
            "submit-btn",
            "steal()",
            "go()",
            "onclick",
            "build 7f3a",
            "two",
        ] {
            assert!(!out.contains(secret), "{secret:?} survived in {out}");
        }
    }

    #[test]
    fn keeps_structure_needed_for_repair() {
        let out = sanitize_html(PAGE, 50_000).unwrap();
        assert!(out.contains(r#"<form id="login">"#));
        assert!(out.contains(r#"type="email""#));
        assert!(out.contains(r#"name="email""#));
        assert!(out.contains("Sign in"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn output_is_capped_on_a_char_boundary() {
        let html = format!("<p>{}</p>", "é".repeat(100));
        let out = sanitize_html(&html, 10).unwrap();
        assert_eq!(out.chars().count(), 10);
        assert!(out.starts_with("<p>é"));
    }

    #[test]
    fn truncate_reports_when_cut() {
        assert_eq!(truncate_chars("abc", 5), ("abc", false));
        assert_eq!(truncate_chars("abcdef", 3), ("abc", true));
        assert_eq!(truncate_chars("ñño", 2), ("ññ", true));
    }
}
