//! `{placeholder}` substitution for command templates.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex_lite::Regex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unresolved placeholder '{{{name}}}' in '{template}'")]
pub struct UnresolvedPlaceholder {
    pub name: String,
    pub template: String,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern must compile"))
}

/// Substitute every `{name}` in `template` from `values`. Braces that do
/// not enclose an identifier are left as they are.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> Result<String, UnresolvedPlaceholder> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = values.get(name.as_str()).ok_or_else(|| UnresolvedPlaceholder {
            name: name.as_str().to_string(),
            template: template.to_string(),
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Render each element of an argv template.
pub fn render_all(templates: &[String], values: &BTreeMap<String, String>) -> Result<Vec<String>, UnresolvedPlaceholder> {
    templates.iter().map(|t| render(t, values)).collect()
}

/// Placeholder names referenced by `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}
