//! Normalization of raw model text into a canonical answer.
//!
//! Every function here is total: arbitrary input yields a value, and a
//! missing answer is represented in the result rather than raised.

use regex::Regex;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::{OutputKind, OutputLang};
use crate::record::Extracted;

static TRIPLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)"""(.*?)""""#).expect("valid triple-quote pattern"));

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(.*?)```").expect("valid code-fence pattern"));

static FENCE_INFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_+#.\-]+)[ \t]*\r?\n").expect("valid fence-info pattern")
});

// Info strings recognised on an opening fence. Any other first word is code.
const FENCE_LANGUAGES: &[&str] = &[
    "py", "python", "python3", "py3", "cpp", "c++", "c", "cc", "h", "js", "javascript", "ts",
    "typescript", "rs", "rust", "java", "go", "kotlin", "swift", "ruby", "rb", "php", "cs",
    "csharp", "sh", "bash", "shell", "zsh", "console", "sql", "json", "yaml", "yml", "toml",
    "xml", "html", "css", "text", "txt", "plaintext", "markdown", "md",
];

static DEF_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*def\b").expect("valid def pattern"));

// A function body ends right before the next `def` that starts a line, or
// at trailing whitespace running to the end of the text.
static DEF_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*(?:def\b|\z)").expect("valid def-end pattern"));

// `(B)`, `B.`, `2 ...` or a bare `B` leading the first line.
static CHOICE_LEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\(([0-9]+|[A-J])\)|([0-9]+|[A-J])[.):]|([0-9]+)\s|([0-9]+|[A-J])$)")
        .expect("valid choice-lead pattern")
});

static CHOICE_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([0-9]+|[A-J])\)").expect("valid choice-paren pattern"));

static CHOICE_DIGIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([0-9]+)\b").expect("valid choice-digit pattern"));

pub fn normalize(kind: &OutputKind, prompt: &str, text: &str) -> Extracted {
    match kind {
        OutputKind::DefaultNl => Extracted::Text(format_natural_language(prompt, text)),
        OutputKind::DefaultCode => Extracted::Text(format_programming_language(text)),
        OutputKind::Xml { tag, lang } => format_xml(tag, *lang, prompt, text),
        OutputKind::HumanEval => Extracted::Text(format_humaneval(prompt, text)),
        OutputKind::MultipleChoice => Extracted::Text(extract_choice(text)),
        OutputKind::Tag { open, close } => Extracted::Text(extract_tag(open, close, text)),
        OutputKind::Line => Extracted::Text(first_line(text).to_string()),
    }
}

fn format_natural_language(prompt: &str, text: &str) -> String {
    remove_prompt_lines(prompt, extract_triple_quoted(text))
}

fn format_programming_language(text: &str) -> String {
    let mut code = extract_code_blocks(text).into_owned();
    code.push('\n');
    dedent(&extract_functions(&code))
}

fn format_humaneval(prompt: &str, text: &str) -> String {
    let code = format!("{}{}\n", prompt, text);
    dedent(&extract_functions(&code))
}

/// The first span enclosed in `"""`; the whole text when there is none.
pub fn extract_triple_quoted(text: &str) -> &str {
    TRIPLE_QUOTED
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or(text, |m| m.as_str())
}

/// Drop every line whose trimmed content equals a trimmed prompt line.
pub fn remove_prompt_lines(prompt: &str, text: &str) -> String {
    let prompt_lines: HashSet<&str> = prompt.lines().map(str::trim).collect();
    text.lines()
        .filter(|line| !prompt_lines.contains(line.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Contents of every fenced code block in order, without the info string.
pub fn extract_code_blocks(text: &str) -> Cow<'_, str> {
    let blocks: Vec<&str> = CODE_FENCE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .map(|block| match FENCE_INFO.captures(block) {
            Some(info) if FENCE_LANGUAGES.contains(&info[1].to_ascii_lowercase().as_str()) => {
                &block[info[0].len()..]
            }
            _ => block,
        })
        .collect();
    if blocks.is_empty() {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(blocks.join("\n"))
    }
}

/// Import header lines plus every `def` block containing `return`,
/// reassembled as `imports + "\n\n" + functions`.
pub fn extract_functions(code: &str) -> String {
    let imports: Vec<&str> = code
        .split('\n')
        .filter(|line| line.starts_with("from") || line.starts_with("import"))
        .collect();

    let mut functions = Vec::new();
    let mut pos = 0;
    while let Some(start) = DEF_START.find_at(code, pos) {
        let body_from = start.end();
        match DEF_END.find_at(code, body_from) {
            Some(end) => {
                let func = &code[start.start()..end.start()];
                if func.contains("return") {
                    functions.push(func);
                }
                pos = end.start();
            }
            None => break,
        }
    }

    // Leading indentation of the first function is kept for `dedent`.
    let functions = functions.join("\n");
    format!(
        "{}\n\n{}",
        imports.join("\n").trim(),
        functions.trim_start_matches(['\r', '\n']).trim_end()
    )
}

fn is_blank(line: &str) -> bool {
    line.chars().all(|c| c == ' ' || c == '\t')
}

/// Remove the leading whitespace common to every non-blank line, then trim.
pub fn dedent(code: &str) -> String {
    let mut margin: Option<&str> = None;
    for line in code.split('\n').filter(|l| !is_blank(l)) {
        let indent = &line[..line.len() - line.trim_start_matches([' ', '\t']).len()];
        margin = Some(match margin {
            None => indent,
            Some(m) => {
                let common = m
                    .char_indices()
                    .zip(indent.chars())
                    .find(|((_, a), b)| a != b)
                    .map(|((i, _), _)| i)
                    .unwrap_or(m.len().min(indent.len()));
                &m[..common]
            }
        });
    }
    let cut = margin.map(str::len).unwrap_or(0);

    code.split('\n')
        .map(|line| if is_blank(line) { "" } else { &line[cut..] })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn format_xml(tag: &str, lang: OutputLang, prompt: &str, text: &str) -> Extracted {
    let stop_sequence = format!("</{}>", tag);
    match text.find(&stop_sequence) {
        Some(idx) => {
            let found = &text[..idx];
            let output = match lang {
                OutputLang::Natural => remove_prompt_lines(prompt, found),
                OutputLang::Code => dedent(found),
            };
            Extracted::Checked {
                formatted_correctly: 1,
                output: Some(output),
            }
        }
        None => Extracted::Checked {
            formatted_correctly: 0,
            output: None,
        },
    }
}

/// Text between `open` and the next `close`, trimmed; the raw text when the
/// markers are absent.
pub fn extract_tag(open: &str, close: &str, text: &str) -> String {
    if let Some(start) = text.find(open) {
        let inner = &text[start + open.len()..];
        if let Some(end) = inner.find(close) {
            return inner[..end].trim().to_string();
        }
    }
    text.to_string()
}

pub fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

/// Choice token: a leading `0`/`(B)`/`C.` on the first line, else the first
/// parenthesised choice, else the first standalone number, else the first line.
pub fn extract_choice(text: &str) -> String {
    let line = first_line(text);
    if let Some(token) = CHOICE_LEAD
        .captures(line)
        .and_then(|c| c.iter().skip(1).flatten().next())
    {
        return token.as_str().to_string();
    }
    if let Some(c) = CHOICE_PAREN.captures(text) {
        return c[1].to_string();
    }
    if let Some(c) = CHOICE_DIGIT.captures(text) {
        return c[1].to_string();
    }
    line.to_string()
}

/// Slice between `begin` and `end`. Returns the original text and `false`
/// when a configured marker is missing or the two are out of order.
pub fn apply_markers<'a>(text: &'a str, begin: Option<&str>, end: Option<&str>) -> (&'a str, bool) {
    let from = match begin {
        Some(b) => match text.find(b) {
            Some(i) => i + b.len(),
            None => return (text, false),
        },
        None => 0,
    };
    let to = match end {
        Some(e) => match text.find(e) {
            Some(i) if i >= from => i,
            _ => return (text, false),
        },
        None => text.len(),
    };
    (&text[from..to], true)
}

/// Keep the lines after the first line starting with `begin` and before the
/// first following line starting with `end`.
pub fn line_window<'a>(text: &'a str, begin: Option<&str>, end: Option<&str>) -> Cow<'a, str> {
    if begin.is_none() && end.is_none() {
        return Cow::Borrowed(text);
    }
    let mut included = begin.is_none();
    let mut kept = Vec::new();
    for line in text.lines() {
        if !included {
            if begin.is_some_and(|b| line.starts_with(b)) {
                included = true;
            }
            continue;
        }
        if end.is_some_and(|e| line.starts_with(e)) {
            break;
        }
        kept.push(line);
    }
    Cow::Owned(kept.join("\n"))
}
