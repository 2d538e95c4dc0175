//! Canonical facility roster: building it from a raw, section-headed source list and
//! loading the cleaned, flat form used for matching.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matcher::match_candidate;
use crate::MatchResult;

/// Cleaned names shorter than this are noise ("Total", "Notes").
pub const MIN_NAME_CHARS: usize = 6;

const ADMIN_MARKERS: &[&str] = &[
    "Department",
    "Division",
    "Criminal Injuries",
    "Emergency Number",
    "Office of",
];
const RESIDUAL_BOILERPLATE: &[&str] = &["operated by", "formerly known", "including:"];

static PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)").expect("parenthetical pattern"));
static TRAILING_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*,.*$").expect("suffix pattern"));
static DASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*[\x{2013}\x{2014}]\s*").expect("dash pattern"));

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("reading roster {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One cleaned facility with the jurisdiction it was listed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub state: String,
    pub facility: String,
}

/// Parse a raw, line-oriented facility source into cleaned entries.
///
/// Headers such as `List of Ohio state prisons` or `Ohio Department of Corrections`
/// set the jurisdiction for following lines. Administrative lines are dropped; the
/// rest lose parentheticals and trailing `, <location>` suffixes.
pub fn build(raw_source: &str) -> Vec<RosterEntry> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut current_state = String::new();

    for line in raw_source.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(state) = list_header_state(line) {
            current_state = state;
            continue;
        }
        if line.contains("Department of Corrections") || line.contains("Division of") {
            current_state = line.split_whitespace().next().unwrap_or_default().to_string();
            continue;
        }
        if ADMIN_MARKERS.iter().any(|marker| line.contains(marker)) {
            continue;
        }
        if char_len(line) < MIN_NAME_CHARS || line.starts_with("List") {
            continue;
        }

        let facility = clean_facility_line(line);
        if char_len(&facility) < MIN_NAME_CHARS || has_residual_boilerplate(&facility) {
            continue;
        }
        if seen.insert(facility.clone()) {
            entries.push(RosterEntry {
                state: current_state.clone(),
                facility,
            });
        }
    }

    entries
}

/// Render entries in the roster file format: a `<State>:` header before each
/// jurisdiction group, one facility per line.
pub fn render(entries: &[RosterEntry]) -> String {
    let mut out = String::new();
    let mut current_state = "";
    for entry in entries {
        if entry.state != current_state {
            out.push_str(&format!("\n{}:\n", entry.state));
            current_state = entry.state.as_str();
        }
        out.push_str(&entry.facility);
        out.push('\n');
    }
    out
}

/// Flat facility names from roster file text; header lines (any line with a
/// colon) and blank separators are skipped.
pub fn parse(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(':') && char_len(line) >= MIN_NAME_CHARS)
        .map(ToString::to_string)
        .collect()
}

pub fn clean_facility_line(line: &str) -> String {
    let without_parens = PARENTHETICAL.replace_all(line, "");
    let without_suffix = TRAILING_SUFFIX.replace(&without_parens, "");
    DASHES.replace_all(&without_suffix, " - ").trim().to_string()
}

fn list_header_state(line: &str) -> Option<String> {
    if !(line.starts_with("List of ") && line.contains("state prisons")) {
        return None;
    }
    let state = line.replacen("List of ", "", 1).replace(" state prisons", "");
    Some(title_case(state.trim()))
}

fn has_residual_boilerplate(facility: &str) -> bool {
    let lower = facility.to_lowercase();
    RESIDUAL_BOILERPLATE.iter().any(|phrase| lower.contains(phrase))
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_alpha = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Ordered, flat lookup sequence of known facility names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalRoster {
    names: Vec<String>,
}

impl CanonicalRoster {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names: names.into_iter().filter(|n| !n.trim().is_empty()).collect(),
        }
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(parse(text))
    }

    pub fn from_entries(entries: &[RosterEntry]) -> Self {
        Self::new(entries.iter().map(|e| e.facility.clone()).collect())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| RosterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_text(&text))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn best_match(&self, candidate: Option<&str>, threshold: f64) -> MatchResult {
        match_candidate(candidate, self.names.as_slice(), threshold)
    }
}
