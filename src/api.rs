use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Listing, SalaryRange, SearchFilter};
use crate::pacing::{RateGate, RetryPolicy};

#[derive(Debug, Error)]
pub enum ApiError {
    /// 429 responses persisted through the whole retry budget.
    #[error("rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    /// Network failures, timeouts and 5xx responses, retries exhausted.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// 2xx response whose body did not parse as expected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Non-retriable 4xx (bad credentials, malformed filter, ...).
    #[error("request rejected (HTTP {status}): {body}")]
    ClientRequest { status: u16, body: String },

    /// The listing was removed upstream.
    #[error("listing '{0}' not found")]
    NotFound(String),

    /// Application submission rejected; reason preserved for display.
    #[error("application rejected: {0}")]
    Apply(String),
}

impl ApiError {
    /// Actionable text for end-user notifications; raw protocol detail
    /// stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::RateLimitExceeded { .. } => {
                "rate limit reached, will retry next cycle".to_string()
            }
            ApiError::UpstreamUnavailable(_) => {
                "job service temporarily unavailable, will retry next cycle".to_string()
            }
            ApiError::Protocol(_) => "unexpected response from the job service".to_string(),
            ApiError::ClientRequest { status, .. } => {
                format!("request rejected by the job service (HTTP {})", status)
            }
            ApiError::NotFound(_) => "this listing is no longer available".to_string(),
            ApiError::Apply(reason) => reason.clone(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The only gateway to the upstream job API. All implementations must pace
/// and retry internally; callers never talk to the upstream directly.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// One page of search results for the given filter.
    async fn search(&self, filter: &SearchFilter, per_page: u32) -> ApiResult<Vec<Listing>>;

    /// Full listing text. `NotFound` if it was removed upstream.
    async fn vacancy_details(&self, id: &str) -> ApiResult<Listing>;

    /// Submit an application. `Apply` errors carry the rejection reason.
    async fn submit_application(
        &self,
        vacancy_id: &str,
        resume_id: &str,
        cover_letter: &str,
    ) -> ApiResult<()>;
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct SearchPage {
    items: Vec<Vacancy>,
}

#[derive(Debug, Deserialize)]
struct Vacancy {
    id: String,
    name: String,
    employer: Option<NamedRef>,
    salary: Option<WireSalary>,
    area: Option<NamedRef>,
    schedule: Option<IdRef>,
    alternate_url: Option<String>,
    description: Option<String>,
    snippet: Option<Snippet>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireSalary {
    from: Option<i64>,
    to: Option<i64>,
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    requirement: Option<String>,
    responsibility: Option<String>,
}

impl Vacancy {
    fn into_listing(self) -> Listing {
        let description = self.description.or_else(|| match self.snippet {
            Some(s) => match (s.responsibility, s.requirement) {
                (Some(a), Some(b)) => Some(format!("{}\n{}", a, b)),
                (Some(a), None) | (None, Some(a)) => Some(a),
                (None, None) => None,
            },
            None => None,
        });
        Listing {
            url: self
                .alternate_url
                .unwrap_or_else(|| format!("https://hh.ru/vacancy/{}", self.id)),
            remote: self
                .schedule
                .as_ref()
                .map(|s| s.id == "remote")
                .unwrap_or(false),
            id: self.id,
            title: self.name,
            company: self
                .employer
                .map(|e| e.name)
                .unwrap_or_else(|| "Unknown".to_string()),
            salary: self.salary.map(|s| SalaryRange {
                from: s.from,
                to: s.to,
                currency: s.currency,
            }),
            area: self.area.map(|a| a.name),
            description,
        }
    }
}

// --- Retry plumbing ---

#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Success,
    RateLimited,
    Retriable,
    Rejected,
}

fn classify(status: StatusCode) -> Disposition {
    if status.is_success() {
        Disposition::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Disposition::RateLimited
    } else if status.is_server_error() {
        Disposition::Retriable
    } else {
        Disposition::Rejected
    }
}

/// Server-supplied `Retry-After` in seconds, if present and well-formed.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// HTTP client for the upstream job board. Every request goes through the
/// shared `RateGate` and the 429/5xx retry loop; 4xx responses are
/// surfaced immediately.
pub struct HhClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    gate: RateGate,
    retry: RetryPolicy,
}

impl HhClient {
    pub fn new(
        base: impl Into<String>,
        token: Option<String>,
        gate: RateGate,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("jobscout/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            token,
            gate,
            retry,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Single choke point for outbound traffic: paces via the gate, retries
    /// 429/5xx/transport errors with exponential backoff, honors a
    /// server-supplied Retry-After, and gives up after the attempt budget.
    async fn send_with_retry<F>(&self, what: &str, build: F) -> ApiResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let max = self.retry.max_attempts();
        for attempt in 1..=max {
            self.gate.acquire().await;

            let outcome = build().send().await;
            let response = match outcome {
                Ok(response) => response,
                Err(err) => {
                    warn!(what, attempt, error = %err, "request failed");
                    if attempt == max {
                        return Err(ApiError::UpstreamUnavailable(err.to_string()));
                    }
                    tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
                    continue;
                }
            };

            let status = response.status();
            match classify(status) {
                Disposition::Success => return Ok(response),
                Disposition::RateLimited => {
                    if attempt == max {
                        return Err(ApiError::RateLimitExceeded { attempts: max });
                    }
                    let delay = retry_after(response.headers())
                        .unwrap_or_else(|| self.retry.delay_for(attempt - 1));
                    warn!(what, attempt, ?delay, "rate limited, backing off");
                    tokio::time::sleep(delay).await;
                }
                Disposition::Retriable => {
                    warn!(what, attempt, %status, "server error");
                    if attempt == max {
                        return Err(ApiError::UpstreamUnavailable(format!("HTTP {}", status)));
                    }
                    tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
                }
                Disposition::Rejected => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ApiError::ClientRequest {
                        status: status.as_u16(),
                        body,
                    });
                }
            }
        }
        unreachable!("retry loop always returns within the attempt budget")
    }

    fn search_params(filter: &SearchFilter, per_page: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![("per_page", per_page.to_string())];
        let text = filter.keywords.join(" ");
        if !text.is_empty() {
            params.push(("text", text));
        }
        if let Some(area) = &filter.area {
            params.push(("area", area.clone()));
        }
        if filter.remote_only {
            params.push(("schedule", "remote".to_string()));
        }
        if filter.salary_min > 0 {
            params.push(("salary", filter.salary_min.to_string()));
            params.push(("only_with_salary", "true".to_string()));
        }
        if let Some(employment) = filter.employment {
            params.push(("employment", employment.as_param().to_string()));
        }
        if let Some(experience) = filter.experience {
            params.push(("experience", experience.as_param().to_string()));
        }
        params
    }
}

#[async_trait]
impl JobApi for HhClient {
    async fn search(&self, filter: &SearchFilter, per_page: u32) -> ApiResult<Vec<Listing>> {
        let url = format!("{}/vacancies", self.base);
        let params = Self::search_params(filter, per_page);
        let response = self
            .send_with_retry("search", || {
                self.authorize(self.http.get(&url).query(&params))
            })
            .await?;

        let page: SearchPage = response
            .json()
            .await
            .map_err(|e| ApiError::Protocol(format!("search response: {}", e)))?;
        debug!(count = page.items.len(), "search page fetched");
        Ok(page.items.into_iter().map(Vacancy::into_listing).collect())
    }

    async fn vacancy_details(&self, id: &str) -> ApiResult<Listing> {
        let url = format!("{}/vacancies/{}", self.base, id);
        let response = self
            .send_with_retry("details", || self.authorize(self.http.get(&url)))
            .await;

        let response = match response {
            Err(ApiError::ClientRequest { status: 404, .. }) => {
                return Err(ApiError::NotFound(id.to_string()));
            }
            other => other?,
        };

        let vacancy: Vacancy = response
            .json()
            .await
            .map_err(|e| ApiError::Protocol(format!("details response: {}", e)))?;
        Ok(vacancy.into_listing())
    }

    async fn submit_application(
        &self,
        vacancy_id: &str,
        resume_id: &str,
        cover_letter: &str,
    ) -> ApiResult<()> {
        if self.token.is_none() {
            return Err(ApiError::Apply(
                "no API token configured, cannot submit applications".to_string(),
            ));
        }

        let url = format!("{}/negotiations", self.base);
        let form = [
            ("vacancy_id", vacancy_id),
            ("resume_id", resume_id),
            ("message", cover_letter),
        ];
        let result = self
            .send_with_retry("apply", || {
                self.authorize(self.http.post(&url).form(&form))
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            // The board rejected this specific application (already applied,
            // resume not suitable, ...). Keep the reason for the user.
            Err(ApiError::ClientRequest { status, body }) => {
                Err(ApiError::Apply(apply_reason(status, &body)))
            }
            Err(other) => Err(other),
        }
    }
}

/// Extract a human-readable rejection reason from an error body, falling
/// back to the HTTP status when the body is opaque.
fn apply_reason(status: u16, body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        description: Option<String>,
        #[serde(default)]
        errors: Vec<ErrorItem>,
    }
    #[derive(Deserialize)]
    struct ErrorItem {
        value: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(description) = parsed.description {
            return description;
        }
        if let Some(value) = parsed.errors.into_iter().find_map(|e| e.value) {
            return value;
        }
    }
    format!("submission rejected (HTTP {})", status)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    /// Scripted `JobApi` for scheduler and pipeline tests. Search results
    /// are consumed per call; an exhausted script returns empty pages.
    #[derive(Default)]
    pub struct MockApi {
        pub search_script: Mutex<VecDeque<ApiResult<Vec<Listing>>>>,
        pub details: Mutex<HashMap<String, Listing>>,
        pub gone: Mutex<HashSet<String>>,
        pub apply_script: Mutex<VecDeque<ApiResult<()>>>,
        pub submitted: Mutex<Vec<(String, String, String)>>,
        pub search_calls: Mutex<usize>,
    }

    impl MockApi {
        pub fn push_search(&self, result: ApiResult<Vec<Listing>>) {
            self.search_script.lock().unwrap().push_back(result);
        }

        pub fn push_apply(&self, result: ApiResult<()>) {
            self.apply_script.lock().unwrap().push_back(result);
        }

        pub fn listing(id: &str) -> Listing {
            Listing {
                id: id.to_string(),
                title: format!("Listing {}", id),
                company: "Acme".to_string(),
                salary: None,
                area: None,
                remote: false,
                description: Some("A job".to_string()),
                url: format!("https://hh.ru/vacancy/{}", id),
            }
        }
    }

    #[async_trait]
    impl JobApi for MockApi {
        async fn search(&self, _filter: &SearchFilter, _per_page: u32) -> ApiResult<Vec<Listing>> {
            *self.search_calls.lock().unwrap() += 1;
            self.search_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn vacancy_details(&self, id: &str) -> ApiResult<Listing> {
            if self.gone.lock().unwrap().contains(id) {
                return Err(ApiError::NotFound(id.to_string()));
            }
            Ok(self
                .details
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .unwrap_or_else(|| Self::listing(id)))
        }

        async fn submit_application(
            &self,
            vacancy_id: &str,
            resume_id: &str,
            cover_letter: &str,
        ) -> ApiResult<()> {
            self.submitted.lock().unwrap().push((
                vacancy_id.to_string(),
                resume_id.to_string(),
                cover_letter.to_string(),
            ));
            self.apply_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }
}
