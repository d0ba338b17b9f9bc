//! # INI Settings Parser
//!
//! Parses and renders the settings section of a compound object.
//!
//! Grammar (one construct per line):
//! - `; comment` or `# comment`
//! - `[section]` opens a nested map; keys until the next header go there
//! - `key = value`, where value is bare or quoted; quoted values may span
//!   several lines
//! - `key[] = value` appends to an array
//!
//! Bare values `true/on/yes` and `false/off/no` become booleans and bare
//! integers become numbers; everything else is a string.

use crate::CmsError;
use serde_json::{Map, Value};

/// Parse INI text into an ordered map.
pub fn parse(text: &str) -> Result<Map<String, Value>, CmsError> {
    let mut root = Map::new();
    let mut section: Option<String> = None;
    let lines: Vec<&str> = text.lines().collect();
    let mut index = 0;

    while index < lines.len() {
        let line_no = index + 1;
        let line = lines[index].trim();
        index += 1;

        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or_else(|| CmsError::IniSyntax {
                line: line_no,
                message: format!("unterminated section header '{}'", line),
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(CmsError::IniSyntax {
                    line: line_no,
                    message: "empty section name".to_string(),
                });
            }
            root.entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            section = Some(name.to_string());
            continue;
        }

        let (raw_key, raw_value) = line.split_once('=').ok_or_else(|| CmsError::IniSyntax {
            line: line_no,
            message: format!("expected 'key = value', found '{}'", line),
        })?;
        let raw_key = raw_key.trim();
        let raw_value = raw_value.trim();

        let (key, append) = match raw_key.strip_suffix("[]") {
            Some(k) => (k.trim(), true),
            None => (raw_key, false),
        };
        if key.is_empty() {
            return Err(CmsError::IniSyntax {
                line: line_no,
                message: "empty key".to_string(),
            });
        }

        let value = match quote_char(raw_value) {
            Some(quote) => {
                let mut buffer = raw_value[1..].to_string();
                loop {
                    if let Some(text) = close_quoted(&buffer, quote) {
                        break Value::String(text);
                    }
                    if index >= lines.len() {
                        return Err(CmsError::IniSyntax {
                            line: line_no,
                            message: format!("unterminated quoted value for '{}'", key),
                        });
                    }
                    buffer.push('\n');
                    buffer.push_str(lines[index]);
                    index += 1;
                }
            }
            None => bare_value(strip_comment(raw_value)),
        };

        let in_section = section
            .as_deref()
            .filter(|name| matches!(root.get(*name), Some(Value::Object(_))));
        match in_section.and_then(|name| root.get_mut(name)) {
            Some(Value::Object(map)) => insert(map, key, value, append),
            _ => insert(&mut root, key, value, append),
        }
    }

    Ok(root)
}

fn insert(target: &mut Map<String, Value>, key: &str, value: Value, append: bool) {
    if !append {
        target.insert(key.to_string(), value);
        return;
    }
    match target.get_mut(key) {
        Some(Value::Array(items)) => items.push(value),
        _ => {
            target.insert(key.to_string(), Value::Array(vec![value]));
        }
    }
}

fn quote_char(raw: &str) -> Option<char> {
    match raw.chars().next() {
        Some(c @ ('"' | '\'')) => Some(c),
        _ => None,
    }
}

/// Returns the unescaped text if `buffer` contains the closing quote.
fn close_quoted(buffer: &str, quote: char) -> Option<String> {
    let mut out = String::with_capacity(buffer.len());
    let mut chars = buffer.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) if next == quote || next == '\\' => out.push(next),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        } else if c == quote {
            return Some(out);
        } else {
            out.push(c);
        }
    }
    None
}

fn strip_comment(raw: &str) -> &str {
    match raw.find(" ;") {
        Some(pos) => raw[..pos].trim_end(),
        None => raw,
    }
}

fn bare_value(raw: &str) -> Value {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" => return Value::Bool(true),
        "false" | "off" | "no" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    Value::String(raw.to_string())
}

// =============================================================================
// RENDERING
// =============================================================================

/// Render a map back to INI text.
///
/// Scalars come first, then one `[section]` per nested map, preserving
/// map order inside each group.
#[must_use]
pub fn render(map: &Map<String, Value>) -> String {
    let mut out = String::new();
    for (key, value) in map {
        if !value.is_object() {
            render_entry(&mut out, key, value);
        }
    }
    for (key, value) in map {
        if let Value::Object(section) = value {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", key));
            for (k, v) in section {
                render_entry(&mut out, k, v);
            }
        }
    }
    out
}

fn render_entry(out: &mut String, key: &str, value: &Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                out.push_str(&format!("{}[] = {}\n", key, render_scalar(item)));
            }
        }
        other => out.push_str(&format!("{} = {}\n", key, render_scalar(other))),
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        other => format!("\"{}\"", other.to_string().replace('"', "\\\"")),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_and_sections() {
        let map = parse(
            r#"
url = "/blog/:slug"
layout = default
is_hidden = 0
published = true

[blogPost post]
slug = "{{ :slug }}"
"#,
        )
        .expect("parse");

        assert_eq!(map["url"], "/blog/:slug");
        assert_eq!(map["layout"], "default");
        assert_eq!(map["is_hidden"], 0);
        assert_eq!(map["published"], true);
        assert_eq!(map["blogPost post"]["slug"], "{{ :slug }}");
    }

    #[test]
    fn keys_keep_declaration_order() {
        let map = parse("[hero]\n[nav banner]\n[alpha]\n").expect("parse");
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, vec!["hero", "nav banner", "alpha"]);
    }

    #[test]
    fn arrays_and_multiline_quotes() {
        let map = parse("tags[] = one\ntags[] = \"two\"\ndescription = \"first\nsecond\"\n")
            .expect("parse");
        assert_eq!(map["tags"], serde_json::json!(["one", "two"]));
        assert_eq!(map["description"], "first\nsecond");
    }

    #[test]
    fn escaped_quotes() {
        let map = parse(r#"title = "Say \"hi\"""#).expect("parse");
        assert_eq!(map["title"], "Say \"hi\"");
    }

    #[test]
    fn comments_are_ignored() {
        let map = parse("; heading\n# other\ntitle = Home ; trailing\n").expect("parse");
        assert_eq!(map.len(), 1);
        assert_eq!(map["title"], "Home");
    }

    #[test]
    fn missing_equals_reports_line() {
        let err = parse("title = ok\nthis is wrong\n").expect_err("should fail");
        match err {
            CmsError::IniSyntax { line, .. } => assert_eq!(line, 2),
            other => unreachable!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unterminated_quote_fails() {
        assert!(parse("title = \"open\n").is_err());
    }

    #[test]
    fn render_then_parse_preserves_values() {
        let original = parse("url = \"/\"\ntitle = \"Home \\\"page\\\"\"\n\n[hero]\nsize = 3\n")
            .expect("parse");
        let rendered = render(&original);
        assert!(rendered.starts_with("url = \"/\"\n"));
        assert_eq!(parse(&rendered).expect("reparse"), original);
    }
}
