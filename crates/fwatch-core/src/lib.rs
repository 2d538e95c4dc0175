//! Core domain model, facility extraction and roster matching for facility-watch.

use serde::{Deserialize, Serialize};

pub mod extract;
pub mod matcher;
pub mod normalize;
pub mod roster;

pub use extract::{extract, extract_from_description, extract_from_title};
pub use matcher::{match_candidate, similarity, CROSSCHECK_THRESHOLD, PIPELINE_THRESHOLD};
pub use normalize::normalize;
pub use roster::{CanonicalRoster, RosterEntry, RosterError};

pub const CRATE_NAME: &str = "fwatch-core";

/// Output of facility extraction. Absence is a valid result, not an error.
pub type FacilityCandidate = Option<String>;

/// One job listing as handed over by a posting source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub posted_at: Option<String>,
    #[serde(default)]
    pub url: String,
}

impl Posting {
    /// `"<city>, <state>"` with dangling separators removed when either part is missing.
    pub fn location(&self) -> String {
        format!("{}, {}", self.city.trim(), self.state.trim())
            .trim_matches(|c: char| c == ',' || c == ' ')
            .to_string()
    }
}

/// Detail text fetched for a single posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingDetail {
    pub id: String,
    pub description: String,
}

/// Outcome of scoring a candidate against the canonical roster.
///
/// `verified` is true exactly when `standard_name` is present, which happens only when
/// `score` strictly exceeded the acceptance threshold. `score` is the best score seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub standard_name: Option<String>,
    pub verified: bool,
    pub score: f64,
}

impl MatchResult {
    pub fn unverified(score: f64) -> Self {
        Self {
            standard_name: None,
            verified: false,
            score,
        }
    }

    pub fn verified(standard_name: impl Into<String>, score: f64) -> Self {
        Self {
            standard_name: Some(standard_name.into()),
            verified: true,
            score,
        }
    }
}

/// Persisted job row, keyed on `job_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub title: String,
    pub url: String,
    pub location: String,
    pub posted_date: Option<String>,
    pub description: Option<String>,
    pub facility_name_raw: Option<String>,
    pub facility_name_standard: Option<String>,
    pub verified_facility: bool,
}

impl JobRecord {
    /// Fresh row for a first sighting; description is attached later.
    pub fn from_posting(posting: &Posting, candidate: FacilityCandidate, matched: &MatchResult) -> Self {
        Self {
            job_id: posting.id.clone(),
            title: posting.title.clone(),
            url: posting.url.clone(),
            location: posting.location(),
            posted_date: posting.posted_at.clone(),
            description: None,
            facility_name_raw: candidate,
            facility_name_standard: matched.standard_name.clone(),
            verified_facility: matched.verified,
        }
    }

    pub fn facility_status(&self) -> FacilityStatus {
        match (&self.facility_name_standard, &self.facility_name_raw) {
            (Some(standard), _) if self.verified_facility => FacilityStatus::Verified(standard.clone()),
            (_, Some(raw)) => FacilityStatus::Unverified(raw.clone()),
            _ => FacilityStatus::NotFound,
        }
    }
}

/// Terminal facility classification of a job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacilityStatus {
    Verified(String),
    Unverified(String),
    NotFound,
}

impl std::fmt::Display for FacilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacilityStatus::Verified(name) => write!(f, "VERIFIED: {name}"),
            FacilityStatus::Unverified(name) => write!(f, "UNVERIFIED: {name}"),
            FacilityStatus::NotFound => f.write_str("No facility found"),
        }
    }
}
