//! Validation and repair of JSON returned by chat models.
//!
//! Every LLM stage funnels its raw text through [`parse_with_retry`]:
//! 1. [`clean_json_text`] strips code fences and isolates the first balanced object.
//! 2. The text is parsed into the stage's typed record, with
//!    [`repair_json_string`] tried before giving up.
//! 3. One corrective follow-up asks the model to fix its own output.
//!    A second failure is a fatal [`PostforgeError::Schema`].
//!
//! [`repair_chain`] is the looser best-effort path for imported data.

use postforge_llm::{CompletionRequest, LlmClient};
use postforge_shared::{PostforgeError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// System prompt for the corrective follow-up. Test doubles route on its prefix.
pub const JSON_FORMATTER_SYSTEM: &str = "You are a JSON formatter. Fix the JSON to match the \
     required schema and output ONLY valid JSON, no other text. Inside strings use \\n for \
     newlines and \\\" for quotes. No trailing commas.";

const CORRECTIVE_TEMPERATURE: f32 = 0.3;

// ---------------------------------------------------------------------------
// Stage schemas
// ---------------------------------------------------------------------------

/// How one LLM stage's output is checked and corrected.
#[derive(Debug, Clone, Copy)]
pub struct StageSchema {
    /// Stage name used in error messages and logs.
    pub stage: &'static str,
    /// Field list shown to the model in the corrective prompt.
    pub hint: &'static str,
    /// How much of the offending output is echoed back.
    pub snippet_chars: usize,
    pub max_tokens: u32,
}

/// Semantic checks that run after a record deserializes.
pub trait CheckedRecord {
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Parse `raw` model output into `T`, with one corrective LLM call on failure.
#[instrument(skip_all, fields(stage = schema.stage))]
pub async fn parse_with_retry<T>(llm: &dyn LlmClient, raw: &str, schema: &StageSchema) -> Result<T>
where
    T: DeserializeOwned + CheckedRecord,
{
    let cleaned = clean_json_text(raw);
    let error = match parse_record::<T>(&cleaned) {
        Ok(record) => return Ok(record),
        Err(e) => e,
    };

    warn!(error = %error, "model output failed validation, requesting correction");
    let prompt = format!(
        "{hint}\n\nInvalid JSON received:\n{snippet}\n\nError: {error}\n\n\
         Fix the JSON to match the required schema and output only valid JSON.",
        hint = schema.hint,
        snippet = truncate_chars(&cleaned, schema.snippet_chars),
    );
    let request = CompletionRequest::new(JSON_FORMATTER_SYSTEM, prompt)
        .with_temperature(CORRECTIVE_TEMPERATURE)
        .with_max_tokens(schema.max_tokens);
    let corrected = llm.complete(request).await?;

    parse_record::<T>(&clean_json_text(&corrected))
        .map_err(|e| PostforgeError::schema(schema.stage, e))
}

/// Parse already-cleaned text into `T`, allowing only [`repair_json_string`].
pub fn parse_record<T>(cleaned: &str) -> std::result::Result<T, String>
where
    T: DeserializeOwned + CheckedRecord,
{
    let value = match serde_json::from_str::<Value>(cleaned) {
        Ok(v) => v,
        Err(first) => serde_json::from_str::<Value>(&repair_json_string(cleaned))
            .map_err(|_| format!("invalid JSON: {first}"))?,
    };

    let record: T = serde_json::from_value(value).map_err(|e| format!("schema mismatch: {e}"))?;
    record.check()?;
    Ok(record)
}

// ---------------------------------------------------------------------------
// Cleaning
// ---------------------------------------------------------------------------

/// Strip code fences and return the first balanced `{...}` object.
///
/// Braces inside string literals are ignored. Text after the object is
/// dropped. When no object closes, everything from the first `{` is returned
/// so later repairs can work on it.
pub fn clean_json_text(text: &str) -> String {
    let mut body = text.trim();
    if let Some(rest) = body
        .strip_prefix("```json")
        .or_else(|| body.strip_prefix("```JSON"))
        .or_else(|| body.strip_prefix("```"))
    {
        body = rest;
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest;
    }
    let body = body.trim();

    match body.find('{') {
        Some(start) => match find_matching(body, start) {
            Some(end) => body[start..=end].to_string(),
            None => body[start..].to_string(),
        },
        None => body.to_string(),
    }
}

/// Fix the most common model JSON mistakes without changing valid input.
///
/// Outside strings, trailing commas before `}` or `]` are removed. Inside
/// strings, raw newlines, carriage returns and tabs are escaped, and a quote
/// is only treated as closing when the next significant character could
/// follow a string (`,` `}` `]` `:` or end of input); otherwise it is escaped.
pub fn repair_json_string(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 16);
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            match c {
                '\\' => {
                    out.push(c);
                    if let Some(&next) = chars.get(i + 1) {
                        out.push(next);
                        i += 1;
                    }
                }
                '"' if closes_string(&chars[i + 1..]) => {
                    in_string = false;
                    out.push(c);
                }
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
        } else {
            match c {
                '"' => {
                    in_string = true;
                    out.push(c);
                }
                ',' if matches!(next_significant(&chars[i + 1..]), Some('}' | ']')) => {}
                _ => out.push(c),
            }
        }
        i += 1;
    }
    out
}

fn next_significant(rest: &[char]) -> Option<char> {
    rest.iter().copied().find(|c| !c.is_whitespace())
}

fn closes_string(rest: &[char]) -> bool {
    matches!(next_significant(rest), None | Some(',' | '}' | ']' | ':'))
}

/// Truncate to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Repair chain
// ---------------------------------------------------------------------------

/// One best-effort repair heuristic. Receives the text and the items key.
pub type RepairStep = fn(&str, &str) -> Option<Value>;

/// Heuristics in the order they are tried. The first success wins.
pub const REPAIR_STEPS: &[(&str, RepairStep)] = &[
    ("direct", parse_container),
    ("outer_braces", add_outer_braces),
    ("truncated", close_truncated),
    ("quotes_and_commas", fix_quotes_and_commas),
    ("manual_scan", manual_scan),
    ("extract_items", extract_items),
];

/// Best-effort recovery of a JSON object or array from malformed text.
///
/// `items_key` names the array worth salvaging (for example `"products"`);
/// pass an empty string when there is none.
pub fn repair_chain(text: &str, items_key: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    REPAIR_STEPS.iter().find_map(|(name, step)| {
        let value = step(text, items_key)?;
        debug!(step = name, "json recovered");
        Some(value)
    })
}

/// Parse as-is, accepting only objects and arrays.
fn parse_container(text: &str, _items_key: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text.trim())
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

/// Supply a missing opening brace and the matching closing brace.
fn add_outer_braces(text: &str, items_key: &str) -> Option<Value> {
    let mut body = text.trim().to_string();
    if !items_key.is_empty() && (body == items_key || body == format!("\"{items_key}\"")) {
        return Some(wrap_items(items_key, Value::Array(Vec::new())));
    }

    if !body.starts_with('{') && !body.starts_with('[') {
        if items_key.is_empty() || !body.contains(&format!("\"{items_key}\"")) {
            return None;
        }
        body.insert(0, '{');
    }
    if body.starts_with('{') && unclosed_suffix(&body)? == "}" {
        body.push('}');
    }
    parse_container(&body, items_key)
}

/// Cut at the last complete array element and close every open container.
fn close_truncated(text: &str, items_key: &str) -> Option<Value> {
    let start = text.find(['{', '['])?;
    let body = &text[start..];
    let bytes = body.as_bytes();

    let mut stack: Vec<u8> = Vec::new();
    let mut cuts: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop()? != b {
                    return None;
                }
                if stack.last() == Some(&b']') {
                    cuts.push((i, stack.clone()));
                }
            }
            _ => {}
        }
    }

    cuts.iter().rev().find_map(|(end, open)| {
        let mut candidate = body[..=*end].to_string();
        candidate.extend(open.iter().rev().map(|&b| b as char));
        let value = parse_container(&candidate, items_key)?;
        let salvaged = items_key.is_empty()
            || value
                .get(items_key)
                .and_then(Value::as_array)
                .is_some_and(|items| !items.is_empty());
        salvaged.then_some(value)
    })
}

/// Normalize typographic quotes, then apply [`repair_json_string`].
fn fix_quotes_and_commas(text: &str, items_key: &str) -> Option<Value> {
    let mut body = text
        .trim()
        .replace(['\u{201C}', '\u{201D}', '\u{201E}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    if !body.starts_with('{')
        && !body.starts_with('[')
        && !items_key.is_empty()
        && body.contains(&format!("\"{items_key}\""))
    {
        body.insert(0, '{');
    }
    parse_container(&repair_json_string(&body), items_key)
}

/// Take the first brace-delimited span and escape control characters in it.
fn manual_scan(text: &str, items_key: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = find_matching(text, start).map_or(text.len(), |e| e + 1);
    parse_container(&repair_json_string(&text[start..end]), items_key)
}

/// Salvage only the `items_key` array.
fn extract_items(text: &str, items_key: &str) -> Option<Value> {
    if items_key.is_empty() {
        return None;
    }
    let key_at = text.find(&format!("\"{items_key}\""))?;
    let open = key_at + text[key_at..].find('[')?;
    let close = find_matching(text, open)?;
    let items: Value = serde_json::from_str(&text[open..=close]).ok()?;
    Some(wrap_items(items_key, items))
}

fn wrap_items(items_key: &str, items: Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(items_key.to_string(), items);
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Scanning helpers
// ---------------------------------------------------------------------------

/// Byte index of the bracket that closes the one at `open`, skipping strings.
fn find_matching(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let (opener, closer) = match bytes.get(open)? {
        b'{' => (b'{', b'}'),
        b'[' => (b'[', b']'),
        _ => return None,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else if b == opener {
            depth += 1;
        } else if b == closer {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Closers needed to balance `text`, or `None` when brackets are mismatched.
fn unclosed_suffix(text: &str) -> Option<String> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for &b in text.as_bytes() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop()? != b {
                    return None;
                }
            }
            _ => {}
        }
    }

    let mut suffix = String::new();
    if in_string {
        suffix.push('"');
    }
    suffix.extend(stack.iter().rev().map(|&b| b as char));
    Some(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLlm;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        topic: String,
        #[serde(default)]
        angle: String,
    }

    impl CheckedRecord for Sample {
        fn check(&self) -> std::result::Result<(), String> {
            if self.topic.trim().is_empty() {
                return Err("topic must not be empty".into());
            }
            Ok(())
        }
    }

    const SAMPLE_SCHEMA: StageSchema = StageSchema {
        stage: "sample stage",
        hint: "Return {\"topic\": string, \"angle\": string}.",
        snippet_chars: 500,
        max_tokens: 500,
    };

    #[test]
    fn fenced_object_with_trailing_prose() {
        let raw = "```json\n{\"topic\": \"a {b}\", \"n\": 1}\n```\nHope this helps! {not json}";
        assert_eq!(clean_json_text(raw), r#"{"topic": "a {b}", "n": 1}"#);
    }

    #[test]
    fn prose_before_object() {
        let raw = "Sure, here it is:\n{\"topic\": \"x\"} trailing";
        assert_eq!(clean_json_text(raw), r#"{"topic": "x"}"#);
    }

    #[test]
    fn unclosed_object_is_returned_from_first_brace() {
        assert_eq!(clean_json_text("note {\"a\": [1, 2"), "{\"a\": [1, 2");
    }

    #[test]
    fn record_parse_does_not_salvage_truncated_output() {
        let raw = r#"{"topic": "Riego", "angle": "agua", "extra": [{"a": 1}, {"a": 2}, {"a""#;
        assert!(repair_chain(raw, "").is_some());
        let err = parse_record::<Sample>(raw).expect_err("truncated record");
        assert!(err.starts_with("invalid JSON"), "{err}");

        let fixed = parse_record::<Sample>("{\"topic\": \"Riego\",}").expect("trailing comma repaired");
        assert_eq!(fixed.topic, "Riego");
    }

    #[test]
    fn repair_removes_trailing_commas() {
        let fixed = repair_json_string(r#"{"a": [1, 2,], "b": "x, }",}"#);
        let v: Value = serde_json::from_str(&fixed).expect("valid after repair");
        assert_eq!(v["a"], serde_json::json!([1, 2]));
        assert_eq!(v["b"], "x, }");
    }

    #[test]
    fn repair_escapes_control_chars_and_stray_quotes() {
        let raw = "{\"caption\": \"Línea uno\nel \"mejor\" riego\tya\"}";
        let v: Value = serde_json::from_str(&repair_json_string(raw)).expect("valid after repair");
        assert_eq!(v["caption"], "Línea uno\nel \"mejor\" riego\tya");
    }

    #[test]
    fn repair_leaves_valid_json_alone() {
        let raw = r#"{"a": "b \"c\"", "d": [1, {"e": null}]}"#;
        assert_eq!(repair_json_string(raw), raw);
    }

    #[test]
    fn truncated_array_keeps_complete_elements() {
        let raw = r#"{"products": [{"id": "1"}, {"id": "2"}, {"id": "3", "name": "cinti"#;
        let v = repair_chain(raw, "products").expect("recovered");
        let ids: Vec<&str> = v["products"]
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|p| p["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn missing_outer_brace() {
        let v = repair_chain(r#""products": [{"id": "1"}]"#, "products").expect("recovered");
        assert_eq!(v["products"][0]["id"], "1");
        assert_eq!(repair_chain("products", "products"), Some(serde_json::json!({"products": []})));
    }

    #[test]
    fn smart_quotes_are_normalized() {
        let v = repair_chain("{\u{201C}a\u{201D}: \u{201C}b\u{201D},}", "").expect("recovered");
        assert_eq!(v["a"], "b");
    }

    #[test]
    fn items_extracted_from_broken_envelope() {
        let raw = r#"{"products": [{"id": "9"}], "notes": "x" "y" oops }"#;
        let v = repair_chain(raw, "products").expect("recovered");
        assert_eq!(v, serde_json::json!({"products": [{"id": "9"}]}));
    }

    #[test]
    fn hopeless_input_yields_none() {
        assert!(repair_chain("no json here", "products").is_none());
        assert!(repair_chain("   ", "").is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("añoñ", 2), "añ");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn valid_output_needs_no_llm_call() {
        let llm = ScriptedLlm::new();
        let parsed: Sample = parse_with_retry(&llm, "```json\n{\"topic\": \"riego\"}\n```", &SAMPLE_SCHEMA)
            .await
            .expect("parse");
        assert_eq!(parsed.topic, "riego");
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn corrective_call_fixes_output() {
        let llm = ScriptedLlm::new().on("JSON formatter", r#"{"topic": "riego", "angle": "costo"}"#);
        let parsed: Sample = parse_with_retry(&llm, "{\"angle\": \"costo\"}", &SAMPLE_SCHEMA)
            .await
            .expect("parse after correction");
        assert_eq!(parsed.angle, "costo");

        let calls = llm.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].system.starts_with("You are a JSON formatter"));
        assert!(calls[0].prompt.contains("missing field `topic`"));
    }

    #[tokio::test]
    async fn check_failure_triggers_correction() {
        let llm = ScriptedLlm::new().on("JSON formatter", r#"{"topic": "  "}"#);
        let err = parse_with_retry::<Sample>(&llm, r#"{"topic": ""}"#, &SAMPLE_SCHEMA)
            .await
            .expect_err("still invalid");
        match err {
            PostforgeError::Schema { stage, message } => {
                assert_eq!(stage, "sample stage");
                assert!(message.contains("topic must not be empty"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn snippet_is_truncated() {
        let llm = ScriptedLlm::new().on("JSON formatter", r#"{"topic": "ok"}"#);
        let long = format!("{{\"angle\": \"{}\"}}", "x".repeat(2000));
        let _: Sample = parse_with_retry(&llm, &long, &SAMPLE_SCHEMA).await.expect("parse");
        let prompt = &llm.calls()[0].prompt;
        assert!(prompt.len() < 1000);
    }
}
