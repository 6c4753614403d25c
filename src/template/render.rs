use serde_json::Value;

use crate::dataset::DatasetRecord;
use crate::error::EvalError;

/// One parsed piece of a format string.
#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Field(&'a str),
}

/// Split a `{field}` format string into segments. `{{` and `}}` escape braces.
fn parse<'a>(format: &'a str, template: &'static str) -> Result<Vec<Segment<'a>>, EvalError> {
    let malformed = |message: String| EvalError::Format { template, message };

    let mut segments = Vec::new();
    let mut rest = format;
    while let Some(pos) = rest.find(['{', '}']) {
        if pos > 0 {
            segments.push(Segment::Literal(&rest[..pos]));
        }
        let tail = &rest[pos..];
        if tail.starts_with("{{") {
            segments.push(Segment::Brace('{'));
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            segments.push(Segment::Brace('}'));
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            return Err(malformed(format!(
                "single '}}' encountered at offset {}",
                format.len() - tail.len()
            )));
        } else {
            let close = tail[1..].find('}').ok_or_else(|| {
                malformed(format!(
                    "unclosed '{{' at offset {}",
                    format.len() - tail.len()
                ))
            })?;
            let field = &tail[1..=close];
            if field.contains('{') {
                return Err(malformed(format!("unexpected '{{' in field name {:?}", field)));
            }
            if field.is_empty() {
                return Err(malformed(
                    "positional fields are not supported, name the dataset key".to_string(),
                ));
            }
            if let Some(idx) = field.find([':', '!']) {
                return Err(malformed(format!(
                    "conversion or format spec {:?} is not supported",
                    &field[idx..]
                )));
            }
            segments.push(Segment::Field(field.trim()));
            rest = &tail[close + 2..];
        }
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Keys a format string references, in order of appearance.
pub fn referenced_fields(format: &str, template: &'static str) -> Result<Vec<String>, EvalError> {
    Ok(parse(format, template)?
        .into_iter()
        .filter_map(|seg| match seg {
            Segment::Field(name) => Some(name.to_string()),
            _ => None,
        })
        .collect())
}

/// Substitute dataset fields into `format`. A referenced key that the record
/// lacks is an error, never a blank.
pub fn render(
    format: &str,
    data: &DatasetRecord,
    template: &'static str,
) -> Result<String, EvalError> {
    let mut out = String::with_capacity(format.len());
    for segment in parse(format, template)? {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Brace(c) => out.push(c),
            Segment::Field(name) => {
                let value = data.get(name).ok_or_else(|| EvalError::MissingField {
                    key: name.to_string(),
                    template,
                })?;
                out.push_str(&value_to_string(value));
            }
        }
    }
    Ok(out)
}
