use regex::Regex;
use std::collections::HashMap;

use crate::error::PipelineError;

/// One extractable field: a canonical key plus the section labels and
/// delimiter tags models actually emit for it. `key` doubles as the
/// tool-schema property name (snake_case); a camelCase spelling of the same
/// key is accepted from tool output as well.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldSpec {
    pub key: &'static str,
    pub labels: &'static [&'static str],
    pub tags: &'static [&'static str],
}

/// Extract fields from structured tool-call arguments. No text parsing:
/// values are already discrete, only presence and non-emptiness are checked.
pub(crate) fn fields_from_tool_args(
    args: &serde_json::Value,
    required: &FieldSpec,
    optional: &[FieldSpec],
) -> Result<HashMap<&'static str, String>, PipelineError> {
    let mut fields = HashMap::new();
    for spec in std::iter::once(required).chain(optional) {
        if let Some(value) = arg_value(args, spec.key) {
            fields.insert(spec.key, value);
        }
    }
    require(fields, required)
}

/// Extract fields from free-form model text using the fallback cascade:
/// labeled blocks, then delimiter tags, then (for the required field only) a
/// first-sentence heuristic. Optional fields degrade to absent; a required
/// field no strategy can produce is a parse failure.
pub(crate) fn fields_from_text(
    text: &str,
    required: &FieldSpec,
    optional: &[FieldSpec],
) -> Result<HashMap<&'static str, String>, PipelineError> {
    let all: Vec<&FieldSpec> = std::iter::once(required).chain(optional).collect();
    let labeled = labeled_blocks(text, &all);

    let mut fields = HashMap::new();
    for spec in all.iter().copied() {
        let value = labeled
            .get(spec.key)
            .cloned()
            .filter(|value| !value.is_empty())
            .or_else(|| tag_block(text, spec));
        if let Some(value) = value {
            fields.insert(spec.key, value);
        }
    }

    if !fields.contains_key(required.key)
        && let Some(sentence) = first_sentence(text)
    {
        fields.insert(required.key, sentence);
    }

    require(fields, required)
}

fn require(
    fields: HashMap<&'static str, String>,
    required: &FieldSpec,
) -> Result<HashMap<&'static str, String>, PipelineError> {
    match fields.get(required.key) {
        Some(value) if !value.trim().is_empty() => Ok(fields),
        _ => Err(PipelineError::parse(format!(
            "required field '{}' missing from model response",
            required.key
        ))),
    }
}

fn arg_value(args: &serde_json::Value, key: &str) -> Option<String> {
    let value = args.get(key).or_else(|| args.get(camel_case(key)))?;
    let text = value.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for ch in key.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Line-oriented labeled-section scanner. A line whose leading token matches
/// a known label opens that section; following lines accumulate into it until
/// the next known label. Unknown `word:` lines are content, not labels.
fn labeled_blocks(text: &str, fields: &[&FieldSpec]) -> HashMap<&'static str, String> {
    let label_line = Regex::new(r"^\s*([A-Za-z][A-Za-z0-9 _-]{0,40}?)\s*:\s*(.*)$")
        .expect("label regex is valid");

    let mut by_label: HashMap<String, &'static str> = HashMap::new();
    for spec in fields {
        for label in spec.labels {
            by_label.insert(canonical_label(label), spec.key);
        }
    }

    let mut sections: HashMap<&'static str, String> = HashMap::new();
    let mut current: Option<&'static str> = None;
    for line in text.lines() {
        if let Some(captures) = label_line.captures(line)
            && let Some(key) = by_label.get(&canonical_label(&captures[1])).copied()
        {
            current = Some(key);
            let rest = captures[2].trim();
            let section = sections.entry(key).or_default();
            if !rest.is_empty() {
                if !section.is_empty() {
                    section.push('\n');
                }
                section.push_str(rest);
            }
            continue;
        }
        if let Some(key) = current {
            let section = sections.entry(key).or_default();
            if !section.is_empty() {
                section.push('\n');
            }
            section.push_str(line.trim_end());
        }
    }

    sections
        .into_iter()
        .map(|(key, value)| (key, value.trim().to_string()))
        .filter(|(_, value)| !value.is_empty())
        .collect()
}

fn canonical_label(label: &str) -> String {
    let mut out = String::new();
    let mut last_was_sep = false;
    for ch in label.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.extend(ch.to_uppercase());
            last_was_sep = false;
        } else if !out.is_empty() && !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

fn tag_block(text: &str, spec: &FieldSpec) -> Option<String> {
    for tag in spec.tags {
        let pattern = format!("(?is)<{tag}>(.*?)</{tag}>", tag = regex::escape(tag));
        let regex = Regex::new(&pattern).expect("tag regex is valid");
        if let Some(captures) = regex.captures(text) {
            let value = captures[1].trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Degraded last resort for the required field: the first sentence-like span.
/// Returns None when the text holds nothing resembling prose, so the caller
/// fails loudly instead of fabricating content.
fn first_sentence(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|line| {
        !line.is_empty() && line.chars().any(char::is_alphanumeric)
    })?;

    let terminators = ['.', '!', '?', '。', '！', '？'];
    let end = line
        .char_indices()
        .find(|(_, ch)| terminators.contains(ch))
        .map(|(idx, ch)| idx + ch.len_utf8())
        .unwrap_or(line.len());
    let sentence = line[..end].trim();
    if sentence.is_empty() {
        None
    } else {
        Some(sentence.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TRANSLATION: FieldSpec = FieldSpec {
        key: "translation",
        labels: &["TRANSLATION"],
        tags: &["translation"],
    };
    const NOTES: FieldSpec = FieldSpec {
        key: "cultural_notes",
        labels: &["CULTURAL_NOTES", "CULTURAL NOTES"],
        tags: &["cultural_notes"],
    };

    #[test]
    fn three_shapes_normalize_to_equivalent_fields() {
        let from_args = fields_from_tool_args(
            &json!({"translation": "Hola, amigo.", "cultural_notes": "Informal register."}),
            &TRANSLATION,
            &[NOTES],
        )
        .unwrap();

        let labeled = "TRANSLATION: Hola, amigo.\nCULTURAL_NOTES: Informal register.";
        let from_labels = fields_from_text(labeled, &TRANSLATION, &[NOTES]).unwrap();

        let tagged =
            "<translation>Hola, amigo.</translation>\n<cultural_notes>Informal register.</cultural_notes>";
        let from_tags = fields_from_text(tagged, &TRANSLATION, &[NOTES]).unwrap();

        for fields in [&from_labels, &from_tags] {
            assert_eq!(fields["translation"], from_args["translation"]);
            assert_eq!(fields["cultural_notes"], from_args["cultural_notes"]);
        }
    }

    #[test]
    fn tool_args_accept_camel_case_keys() {
        let fields = fields_from_tool_args(
            &json!({"translation": "Hola", "culturalNotes": "ok"}),
            &TRANSLATION,
            &[NOTES],
        )
        .unwrap();
        assert_eq!(fields["cultural_notes"], "ok");
    }

    #[test]
    fn labels_are_case_insensitive_and_multiline() {
        let text = "translation:\n  Hola, amigo.\n  ¿Qué tal?\nCultural Notes: casual";
        let fields = fields_from_text(text, &TRANSLATION, &[NOTES]).unwrap();
        assert_eq!(fields["translation"], "Hola, amigo.\n  ¿Qué tal?");
        assert_eq!(fields["cultural_notes"], "casual");
    }

    #[test]
    fn unknown_colon_lines_stay_inside_sections() {
        let text = "TRANSLATION: Hola.\nNote: interior detail\nCULTURAL_NOTES: fine";
        let fields = fields_from_text(text, &TRANSLATION, &[NOTES]).unwrap();
        assert_eq!(fields["translation"], "Hola.\nNote: interior detail");
    }

    #[test]
    fn heuristic_grabs_first_sentence_when_no_markers() {
        let text = "Hola, amigo. Espero que bien.";
        let fields = fields_from_text(text, &TRANSLATION, &[NOTES]).unwrap();
        assert_eq!(fields["translation"], "Hola, amigo.");
        assert!(!fields.contains_key("cultural_notes"));
    }

    #[test]
    fn missing_required_field_is_a_parse_error() {
        let err = fields_from_text("###\n---", &TRANSLATION, &[NOTES]).unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));

        let err =
            fields_from_tool_args(&json!({"cultural_notes": "x"}), &TRANSLATION, &[NOTES])
                .unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
    }

    #[test]
    fn empty_required_tool_arg_is_a_parse_error() {
        let err = fields_from_tool_args(&json!({"translation": "  "}), &TRANSLATION, &[NOTES])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
    }

    #[test]
    fn tag_aliases_cover_legacy_spellings() {
        const LITERAL: FieldSpec = FieldSpec {
            key: "literal_translation",
            labels: &["LITERAL_TRANSLATION", "BACK_TRANSLATION"],
            tags: &["literal_translation", "back_translation"],
        };
        let fields = fields_from_text(
            "<back_translation>Take it with food.</back_translation>",
            &LITERAL,
            &[],
        )
        .unwrap();
        assert_eq!(fields["literal_translation"], "Take it with food.");
    }
}
