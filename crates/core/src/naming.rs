//! Run identifiers, filesystem-safe names and filename-prefix templates.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::combination::SamplerParams;
use crate::error::CoreError;
use crate::types::Seed;

/// Default truncation length for [`safe_filename`].
pub const SAFE_FILENAME_MAX_LEN: usize = 50;

/// Default prefix template for axis sweeps.
pub const DEFAULT_AXIS_PREFIX_TEMPLATE: &str = "{run}/img";

/// Default prefix template for image batches.
pub const DEFAULT_IMAGE_PREFIX_TEMPLATE: &str = "{image}/{expr}/{run}/img";

const UNSAFE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Escaped braces or one `{name}` placeholder.
static PLACEHOLDER_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\{\{|\}\}|\{([^{}]*)\}").expect("valid regex"));

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Axis-sweep run id: `{index:04}_{6 hex chars}`. `index` is 1-based.
pub fn axis_run_id(index: usize) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{index:04}_{}", &hex[..6])
}

/// Image-batch run id: 8 hex chars.
pub fn batch_run_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..8].to_string()
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Make `text` usable as a single path component.
///
/// Replaces path and shell-hostile characters with `_`, collapses runs of
/// `_`, trims `_` and spaces from both ends and truncates to `max_len`
/// characters.
pub fn safe_filename(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        let ch = if UNSAFE_CHARS.contains(&ch) { '_' } else { ch };
        if ch == '_' && out.ends_with('_') {
            continue;
        }
        out.push(ch);
    }

    out.trim_matches(|c: char| c == '_' || c == ' ')
        .chars()
        .take(max_len)
        .collect()
}

/// Three decimals with trailing zeros and a bare trailing dot removed:
/// `0.320` becomes `0.32`, `8.000` becomes `8`.
pub fn fmt_float(x: f64) -> String {
    let s = format!("{x:.3}");
    if !s.contains('.') {
        return s;
    }
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// Prefix templates
// ---------------------------------------------------------------------------

/// Variables available to a filename-prefix template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefixVars {
    values: BTreeMap<&'static str, String>,
}

impl PrefixVars {
    /// The variables every run has: `{run}` and `{seed}`.
    pub fn new(run_id: &str, seed: Seed) -> Self {
        let mut values = BTreeMap::new();
        values.insert("run", safe_filename(run_id, SAFE_FILENAME_MAX_LEN));
        values.insert("seed", seed.to_string());
        Self { values }
    }

    /// Add a free-text variable, sanitized for use in a path.
    pub fn text(mut self, name: &'static str, value: &str) -> Self {
        self.values
            .insert(name, safe_filename(value, SAFE_FILENAME_MAX_LEN));
        self
    }

    /// Add `{steps}`, `{cfg}`, `{sampler}`, `{scheduler}` and, when set,
    /// `{denoise}`.
    pub fn sampler(mut self, params: &SamplerParams) -> Self {
        self.values.insert("steps", params.steps.to_string());
        self.values.insert("cfg", fmt_float(params.cfg));
        if let Some(d) = params.denoise {
            self.values.insert("denoise", fmt_float(d));
        }
        self.text("sampler", &params.sampler_name)
            .text("scheduler", &params.scheduler)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.values.keys().copied()
    }
}

/// Substitute `{name}` placeholders. `{{` and `}}` produce literal braces.
///
/// An unknown placeholder, an empty `{}` or an unbalanced brace is an
/// error.
pub fn render_prefix(template: &str, vars: &PrefixVars) -> Result<String, CoreError> {
    let mut unknown = Vec::new();
    let rendered = PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| match &caps[0] {
            "{{" => "{".to_string(),
            "}}" => "}".to_string(),
            _ => {
                let name = caps[1].trim();
                match vars.get(name) {
                    Some(value) => value.to_string(),
                    None => {
                        unknown.push(format!("{{{name}}}"));
                        String::new()
                    }
                }
            }
        })
        .into_owned();

    if !unknown.is_empty() {
        let known: Vec<&str> = vars.names().collect();
        return Err(CoreError::Template(format!(
            "unknown placeholder '{}' in '{template}' (available: {})",
            unknown.join("', '"),
            known.join(", ")
        )));
    }

    let leftover = PLACEHOLDER_RE.replace_all(template, "");
    if leftover.contains(['{', '}']) {
        return Err(CoreError::Template(format!(
            "unbalanced brace in '{template}'"
        )));
    }

    Ok(rendered)
}
