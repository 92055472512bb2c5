use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One job posting as fetched from the upstream search API.
/// Immutable snapshot; the `id` is unique within the source system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub company: String,
    pub salary: Option<SalaryRange>,
    pub area: Option<String>,
    pub remote: bool,
    pub description: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalaryRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub currency: Option<String>,
}

impl fmt::Display for SalaryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cur = self.currency.as_deref().unwrap_or("");
        match (self.from, self.to) {
            (Some(a), Some(b)) => write!(f, "{}-{} {}", a, b, cur),
            (Some(a), None) => write!(f, "{}+ {}", a, cur),
            (None, Some(b)) => write!(f, "up to {} {}", b, cur),
            (None, None) => write!(f, "not specified"),
        }
    }
}

/// Per-user search criteria. An empty keyword list is valid and matches
/// broadly; `salary_min` is clamped to >= 0 on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchFilter {
    pub keywords: Vec<String>,
    pub area: Option<String>,
    pub remote_only: bool,
    pub salary_min: i64,
    pub employment: Option<Employment>,
    pub experience: Option<Experience>,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            area: None,
            remote_only: false,
            salary_min: 0,
            employment: None,
            experience: None,
        }
    }
}

impl SearchFilter {
    /// Copy of this filter narrowed to a single keyword. The scheduler runs
    /// one search per keyword.
    pub fn with_keyword(&self, keyword: &str) -> Self {
        let mut f = self.clone();
        f.keywords = vec![keyword.to_string()];
        f
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Employment {
    Full,
    Part,
    Project,
    Probation,
}

impl Employment {
    pub fn as_param(&self) -> &'static str {
        match self {
            Employment::Full => "full",
            Employment::Part => "part",
            Employment::Project => "project",
            Employment::Probation => "probation",
        }
    }
}

impl FromStr for Employment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "full" => Ok(Employment::Full),
            "part" => Ok(Employment::Part),
            "project" => Ok(Employment::Project),
            "probation" => Ok(Employment::Probation),
            _ => Err(anyhow!(
                "Unknown employment '{}'. Available: full, part, project, probation",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Experience {
    NoExperience,
    Between1And3,
    Between3And6,
    MoreThan6,
}

impl Experience {
    pub fn as_param(&self) -> &'static str {
        match self {
            Experience::NoExperience => "noExperience",
            Experience::Between1And3 => "between1And3",
            Experience::Between3And6 => "between3And6",
            Experience::MoreThan6 => "moreThan6",
        }
    }
}

impl FromStr for Experience {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "none" | "noExperience" => Ok(Experience::NoExperience),
            "1-3" | "between1And3" => Ok(Experience::Between1And3),
            "3-6" | "between3And6" => Ok(Experience::Between3And6),
            "6+" | "moreThan6" => Ok(Experience::MoreThan6),
            _ => Err(anyhow!(
                "Unknown experience '{}'. Available: none, 1-3, 3-6, 6+",
                s
            )),
        }
    }
}

/// Everything the scheduler needs to act for one user: the search filter,
/// the auto-apply switch, and submission credentials.
#[derive(Debug, Clone)]
pub struct UserPrefs {
    pub chat_id: i64,
    pub filter: SearchFilter,
    pub auto_apply: bool,
    pub resume_id: Option<String>,
    pub letter_prompt: Option<String>,
}

impl UserPrefs {
    pub fn defaults(chat_id: i64) -> Self {
        Self {
            chat_id,
            filter: SearchFilter::default(),
            auto_apply: false,
            resume_id: None,
            letter_prompt: None,
        }
    }
}

/// Per-user monitoring lifecycle. Created on first enable, updated every
/// tick, never deleted so checks resume across restarts.
#[derive(Debug, Clone)]
pub struct MonitoringState {
    pub chat_id: i64,
    pub enabled: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Success,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Success => "success",
            Outcome::Failed => "failed",
        }
    }
}

impl FromStr for Outcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(Outcome::Pending),
            "success" => Ok(Outcome::Success),
            "failed" => Ok(Outcome::Failed),
            _ => Err(anyhow!("Unknown application outcome '{}'", s)),
        }
    }
}

/// One submission attempt (or a manual-review placeholder). The outcome is
/// decided before the record is written and never changed afterwards.
#[derive(Debug, Clone)]
pub struct Application {
    pub id: i64,
    pub chat_id: i64,
    pub vacancy_id: String,
    pub vacancy_title: String,
    pub company_name: String,
    pub cover_letter: String,
    pub outcome: Outcome,
    pub error_message: Option<String>,
    pub applied_at: String,
}
