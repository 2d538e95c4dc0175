//! Candidate facility name extraction from posting titles and descriptions.
//!
//! Titles are tried first: a `" - "` separated title names the facility after the
//! first separator. Titles without a separator, and descriptions, go through ordered
//! rule lists where the first rule that yields a candidate wins.

use std::sync::LazyLock;

use regex::Regex;

use crate::FacilityCandidate;

pub const TITLE_SEPARATOR: &str = " - ";

/// A pure extraction rule over free text.
pub type Rule = fn(&str) -> FacilityCandidate;

/// Title rules in priority order, used when the title has no separator.
pub const TITLE_RULES: &[Rule] = &[county_facility, custody_facility, penitentiary_or_institution];

/// Description rules in priority order, anchored on `at <facility>`.
pub const DESCRIPTION_RULES: &[Rule] = &[at_county_or_state_facility, at_correctional_or_institution];

static CODED_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*-\s*([A-Z]{2})(?:/[A-Z]{2})?\s*-\s*\([^)]+\)$").expect("coded suffix pattern")
});
static PAREN_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*-\s*\([^)]+\)$").expect("paren suffix pattern"));
static DC_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bDC\b").expect("dc pattern"));

static COUNTY_FACILITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([A-Za-z\s]+County\s+(?:Jail|Sheriff|Detention|Correctional)[^,]*)")
        .expect("county pattern")
});
static CUSTODY_FACILITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)([A-Za-z\s]+(?:Jail|Prison|Correctional|Detention)(?:\s+(?:Facility|Center|Institution))?)",
    )
    .expect("custody pattern")
});
static PENITENTIARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([A-Za-z\s]+(?:Penitentiary|Institution))").expect("penitentiary pattern")
});

static AT_COUNTY_OR_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bat\s+([A-Za-z\s]+(?:County|State)\s+(?:Jail|Prison|Correctional|Institution))")
        .expect("description county pattern")
});
static AT_CORRECTIONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bat\s+([A-Za-z\s]+(?:Correctional|Institution))").expect("description correctional pattern")
});

/// Full extraction: title first, description only when the title yields nothing.
pub fn extract(title: &str, description: Option<&str>) -> FacilityCandidate {
    extract_from_title(title).or_else(|| description.and_then(extract_from_description))
}

pub fn extract_from_title(title: &str) -> FacilityCandidate {
    if let Some((_, remainder)) = title.split_once(TITLE_SEPARATOR) {
        return non_empty(strip_title_codes(remainder));
    }
    first_match(TITLE_RULES, title).map(|candidate| expand_dc(&candidate))
}

pub fn extract_from_description(description: &str) -> FacilityCandidate {
    first_match(DESCRIPTION_RULES, description)
}

/// Runs rules in order and returns the first candidate produced.
pub fn first_match(rules: &[Rule], text: &str) -> FacilityCandidate {
    rules.iter().find_map(|rule| rule(text))
}

/// Expands the standalone `DC` token to "Detention Center".
pub fn expand_dc(name: &str) -> String {
    DC_WORD.replace_all(name, "Detention Center").into_owned()
}

/// Drops trailing staffing codes such as `- WC - (110/125)` or `- (110/125)`.
/// A `DC` code is kept and expanded instead of stripped.
fn strip_title_codes(remainder: &str) -> String {
    let mut name = remainder.trim_end().to_string();
    let coded = CODED_SUFFIX
        .captures(&name)
        .and_then(|caps| caps.get(0).map(|m| (m.start(), &caps[1] == "DC")));
    if let Some((start, false)) = coded {
        name.truncate(start);
    }
    let paren = PAREN_SUFFIX.find(&name).map(|m| m.start());
    if let Some(start) = paren {
        name.truncate(start);
    }
    expand_dc(name.trim()).trim().to_string()
}

pub fn county_facility(text: &str) -> FacilityCandidate {
    capture(&COUNTY_FACILITY, text)
}

pub fn custody_facility(text: &str) -> FacilityCandidate {
    capture(&CUSTODY_FACILITY, text)
}

pub fn penitentiary_or_institution(text: &str) -> FacilityCandidate {
    capture(&PENITENTIARY, text)
}

pub fn at_county_or_state_facility(text: &str) -> FacilityCandidate {
    capture(&AT_COUNTY_OR_STATE, text).map(|c| after_last_anchor(&c))
}

pub fn at_correctional_or_institution(text: &str) -> FacilityCandidate {
    capture(&AT_CORRECTIONAL, text).map(|c| after_last_anchor(&c))
}

fn capture(pattern: &Regex, text: &str) -> FacilityCandidate {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| non_empty(m.as_str().trim().to_string()))
}

// "the kitchen at Example County Jail" -> "Example County Jail"
fn after_last_anchor(candidate: &str) -> String {
    match candidate.rfind(" at ") {
        Some(idx) => candidate[idx + 4..].trim().to_string(),
        None => candidate.to_string(),
    }
}

fn non_empty(value: String) -> FacilityCandidate {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
