//! Parsing of model answers into SQL, explanation and chart hints.
//!
//! Models are asked for a JSON object, but they wrap it in fences, add prose
//! around it, or ignore the format entirely. Parsing therefore tries the
//! JSON form first and falls back to pulling SQL out of the raw text.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::query::Visualization;

/// What a model answer contained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AiResponse {
    pub sql: Option<String>,
    pub explanation: Option<String>,
    pub visualization: Option<Visualization>,
}

/// Fenced block with its language tag in group 1 and body in group 2.
static FENCED_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(\w*)[ \t]*\r?\n(.*?)```").ok());

/// First SELECT/WITH statement in prose, up to a semicolon or fence.
static INLINE_QUERY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)\b((?:SELECT|WITH)\s.+?)(?:;|```|$)").ok());

static ANY_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").ok());

#[derive(Debug, Deserialize)]
struct JsonAnswer {
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    visualization: Option<Visualization>,
}

/// Parses a model answer.
pub fn parse_ai_response(text: &str) -> AiResponse {
    if let Some(answer) = parse_json_answer(text) {
        return AiResponse {
            sql: non_empty(answer.sql),
            explanation: non_empty(answer.explanation),
            visualization: answer.visualization,
        };
    }

    let sql = extract_sql_heuristic(text);
    let explanation = non_empty(Some(remove_code_blocks(text)));
    AiResponse {
        sql,
        explanation,
        visualization: None,
    }
}

fn parse_json_answer(text: &str) -> Option<JsonAnswer> {
    let body = strip_code_fence(text);
    if let Ok(answer) = serde_json::from_str::<JsonAnswer>(body) {
        return Some(answer);
    }

    // Prose around a bare object.
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<JsonAnswer>(&body[start..=end]).ok()
}

/// Returns the inside of a fenced block if `text` is one, or `text` trimmed.
///
/// A ```json block anywhere in the text also counts.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();

    let fenced = if trimmed.starts_with("```") {
        Some(trimmed)
    } else {
        trimmed.find("```json").map(|idx| &trimmed[idx..])
    };

    let Some(fenced) = fenced else {
        return trimmed;
    };

    let Some(newline) = fenced.find('\n') else {
        return trimmed;
    };
    let inner = &fenced[newline + 1..];
    match inner.find("```") {
        Some(end) => inner[..end].trim(),
        None => inner.trim(),
    }
}

/// Pulls SQL out of free text: a ```sql block, then any fenced block that
/// reads like a query, then the first SELECT/WITH statement in the prose.
fn extract_sql_heuristic(text: &str) -> Option<String> {
    let block = FENCED_BLOCK.as_ref()?;

    let mut generic = None;
    for caps in block.captures_iter(text) {
        let lang = caps.get(1).map_or("", |m| m.as_str()).to_lowercase();
        let body = caps.get(2).map_or("", |m| m.as_str()).trim();
        if body.is_empty() {
            continue;
        }
        if lang == "sql" {
            return Some(body.to_string());
        }
        if generic.is_none() && (lang.is_empty() || lang == "postgresql") && looks_like_sql(body) {
            generic = Some(body.to_string());
        }
    }
    if generic.is_some() {
        return generic;
    }

    INLINE_QUERY
        .as_ref()?
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|sql| !sql.is_empty())
}

fn looks_like_sql(body: &str) -> bool {
    let upper = body.trim_start().to_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH")
}

fn remove_code_blocks(text: &str) -> String {
    match ANY_FENCE.as_ref() {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
