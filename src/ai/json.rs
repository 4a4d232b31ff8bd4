//! Recovery of JSON payloads from model output.
//!
//! Models asked for JSON still wrap it in markdown fences or add prose
//! around it. We strip the fences and cut the outermost object or array.

use serde::de::DeserializeOwned;

use super::AIError;

/// Extract the JSON block embedded in a model response.
///
/// Removes code fences, then takes the span from the first `{` to the last `}`.
/// When that span is not valid JSON, the span from the first `[` to the last
/// `]` is tried instead. Returns the first candidate that parses, or the
/// object span when neither does.
pub fn extract_json(text: &str) -> Option<String> {
    let blocks = candidates(text);
    blocks
        .iter()
        .find(|block| serde_json::from_str::<serde_json::Value>(block).is_ok())
        .or_else(|| blocks.first())
        .cloned()
}

/// Candidate JSON spans in the order they should be tried, object first.
fn candidates(text: &str) -> Vec<String> {
    let cleaned = text.replace("```json", "").replace("```JSON", "").replace("```", "");

    [span(&cleaned, '{', '}'), span(&cleaned, '[', ']')]
        .into_iter()
        .flatten()
        .map(|(start, end)| cleaned[start..=end].to_string())
        .collect()
}

fn span(text: &str, open: char, close: char) -> Option<(usize, usize)> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then_some((start, end))
}

/// Extract and deserialize the JSON block of a model response.
///
/// Each candidate span is tried in turn; the error of the first one is
/// reported when none deserializes.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, AIError> {
    let mut first_error = None;

    for block in candidates(text) {
        match serde_json::from_str(&block) {
            Ok(value) => return Ok(value),
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(_) => {}
        }
    }

    Err(AIError::InvalidJson(first_error.map_or_else(
        || "no JSON object or array found".to_string(),
        |e| e.to_string(),
    )))
}
