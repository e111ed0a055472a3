//! Shared text helpers for pulling structured data out of agent output.

/// Extract the first balanced JSON object from text that may contain other
/// content. Braces inside JSON strings are ignored.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Content of the last `<tag>...</tag>` pair in `text`, trimmed.
pub fn extract_tagged<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.rfind(&open)? + open.len();
    let end = start + text[start..].find(&close)?;
    let inner = text[start..end].trim();
    (!inner.is_empty()).then_some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_surrounding_text() {
        let text = r#"Here is the JSON: {"key": "value"} and some more text"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"{"code": "fn main() { }", "note": "a \"quoted\" }"} tail"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"code": "fn main() { }", "note": "a \"quoted\" }"}"#)
        );
    }

    #[test]
    fn test_extract_json_object_missing_or_unclosed() {
        assert_eq!(extract_json_object("No JSON here"), None);
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_extract_tagged_takes_last_pair() {
        let text = "<commit>first</commit> later <commit>\n  feat: second \n</commit>";
        assert_eq!(extract_tagged(text, "commit"), Some("feat: second"));
    }

    #[test]
    fn test_extract_tagged_missing_or_empty() {
        assert_eq!(extract_tagged("nothing", "commit"), None);
        assert_eq!(extract_tagged("<commit>  </commit>", "commit"), None);
        assert_eq!(extract_tagged("<commit>unterminated", "commit"), None);
    }
}
