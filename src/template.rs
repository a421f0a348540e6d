//! Query template rendering
//!
//! Substitutes `{{name}}` placeholders in subset queries. Names with no
//! matching var are kept as written.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Render `template` against `vars`
///
/// Fails only when the template contains a `{{` that is never closed.
pub fn render(template: &str, vars: &HashMap<String, String>) -> Result<String, String> {
    if let Some(pos) = unclosed_tag(template) {
        return Err(format!("unclosed `{{{{` at byte {}", pos));
    }

    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
        Some(value) => value.clone(),
        None => caps[0].to_string(),
    });
    Ok(rendered.into_owned())
}

fn unclosed_tag(template: &str) -> Option<usize> {
    let mut rest = template;
    let mut offset = 0;
    while let Some(open) = rest.find("{{") {
        let after = open + 2;
        match rest[after..].find("}}") {
            Some(close) => {
                let consumed = after + close + 2;
                offset += consumed;
                rest = &rest[consumed..];
            }
            None => return Some(offset + open),
        }
    }
    None
}
