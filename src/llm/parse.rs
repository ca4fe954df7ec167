//! Tolerant JSON extraction from model responses
//!
//! Backends return a single string that should parse as JSON but often
//! arrives fenced in markdown or lightly damaged. Extraction is tolerant;
//! schema enforcement lives in `schema`.

/// Strip markdown code fences from a response
pub(crate) fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Extract the outermost JSON object from a response, handling fences and
/// surrounding prose.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let clean = strip_markdown_fences(response);
    extract_json_fragment(clean, '{', '}')
}

/// Try to fix common JSON issues from model responses
pub(crate) fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    // Remove trailing commas before ] or }
    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    // Smart quotes to regular quotes
    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");
    fixed = fixed.replace('\u{2018}', "'");
    fixed = fixed.replace('\u{2019}', "'");

    // Remove control characters that slipped in
    fixed = fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    fixed
}

/// Parse a response into `T`: raw JSON, fenced JSON, or JSON with light
/// damage are all accepted.
pub fn parse_lenient<T: serde::de::DeserializeOwned>(response: &str) -> Result<T, String> {
    let json_str =
        extract_json_object(response).ok_or_else(|| "no JSON object in response".to_string())?;

    match serde_json::from_str::<T>(json_str) {
        Ok(parsed) => Ok(parsed),
        Err(initial_error) => {
            let fixed = fix_json_issues(json_str);
            serde_json::from_str::<T>(&fixed).map_err(|_| initial_error.to_string())
        }
    }
}

/// Truncate a string for display (Unicode-safe)
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    if s.chars().count() <= max_chars {
        s
    } else {
        let byte_idx = s
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        &s[..byte_idx]
    }
}
