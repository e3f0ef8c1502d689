use crate::domain::models::ValidationResult;

pub const MAX_TAG_LENGTH: usize = 128;
pub const NO_VALID_TAGS: &str = "no valid tags found";

const SEPARATORS: [char; 2] = [',', ';'];
const FORBIDDEN_CHARACTERS: [char; 12] = [';', '&', '|', '`', '\\', '$', '(', ')', '{', '}', '[', ']'];

/// Splits free-form text into tag tokens.
///
/// Whitespace, commas and semicolons are equivalent separators and runs of them
/// collapse, so `"a, b;c"` and `"a b c"` yield the same tokens.
pub fn parse_tags(input: &str) -> Vec<String> {
    input
        .split(|ch: char| ch.is_whitespace() || SEPARATORS.contains(&ch))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

pub fn parse_optional_tags(input: Option<&str>) -> Vec<String> {
    input.map(parse_tags).unwrap_or_default()
}

pub fn validate_tags(input: &str) -> ValidationResult {
    check_tokens(parse_tags(input))
}

/// Validates tags that already arrive as a list. Elements are trimmed and blank
/// elements dropped, but an element is never split: embedded whitespace stays
/// in the token and is reported.
pub fn validate_tag_list(tags: &[String]) -> ValidationResult {
    let tokens = tags
        .iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    check_tokens(tokens)
}

fn check_tokens(tokens: Vec<String>) -> ValidationResult {
    if tokens.is_empty() {
        return ValidationResult {
            is_valid: false,
            errors: vec![NO_VALID_TAGS.to_string()],
            tags: tokens,
        };
    }

    let mut errors = Vec::new();
    for (index, token) in tokens.iter().enumerate() {
        let position = index + 1;
        let length = token.chars().count();
        if length == 0 || length > MAX_TAG_LENGTH {
            errors.push(format!(
                "tag {position} (\"{}\"): length {length} is outside 1..={MAX_TAG_LENGTH}",
                preview(token)
            ));
        }
        if let Some(ch) = token.chars().find(|ch| FORBIDDEN_CHARACTERS.contains(ch)) {
            errors.push(format!(
                "tag {position} (\"{}\"): contains forbidden character '{ch}'",
                preview(token)
            ));
        }
        if token.chars().any(char::is_whitespace) {
            errors.push(format!(
                "tag {position} (\"{}\"): contains whitespace",
                preview(token).escape_default()
            ));
        }
        // The tracker would read a leading dash as an option.
        if token.starts_with('-') {
            errors.push(format!(
                "tag {position} (\"{}\"): must not start with '-'",
                preview(token)
            ));
        }
    }

    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        tags: tokens,
    }
}

fn preview(token: &str) -> String {
    const PREVIEW_CHARS: usize = 32;
    if token.chars().count() <= PREVIEW_CHARS {
        return token.to_string();
    }
    let head: String = token.chars().take(PREVIEW_CHARS).collect();
    format!("{head}...")
}
