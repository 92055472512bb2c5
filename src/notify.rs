use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::models::Listing;

/// User-facing events produced by the scheduler and the pipeline. Rendering
/// is plain text; delivery is whatever `Notifier` is plugged in.
#[derive(Debug, Clone)]
pub enum Event {
    NewListing {
        chat_id: i64,
        listing: Listing,
    },
    ApplicationResult {
        chat_id: i64,
        title: String,
        success: bool,
        detail: Option<String>,
    },
    ManualReview {
        chat_id: i64,
        listing: Listing,
    },
    CapReached {
        chat_id: i64,
        cap: u32,
    },
}

impl Event {
    pub fn chat_id(&self) -> i64 {
        match self {
            Event::NewListing { chat_id, .. }
            | Event::ApplicationResult { chat_id, .. }
            | Event::ManualReview { chat_id, .. }
            | Event::CapReached { chat_id, .. } => *chat_id,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Event::NewListing { listing, .. } => {
                let mut text = format!("New listing: {} at {}", listing.title, listing.company);
                if let Some(salary) = &listing.salary {
                    text.push_str(&format!("\nSalary: {}", salary));
                }
                if let Some(area) = &listing.area {
                    text.push_str(&format!("\nLocation: {}", area));
                }
                if listing.remote {
                    text.push_str(" (remote)");
                }
                text.push_str(&format!("\n{}", listing.url));
                text
            }
            Event::ApplicationResult {
                title,
                success,
                detail,
                ..
            } => {
                if *success {
                    format!("Application submitted: {}", title)
                } else {
                    format!(
                        "Application failed: {}: {}",
                        title,
                        detail.as_deref().unwrap_or("unknown reason")
                    )
                }
            }
            Event::ManualReview { listing, .. } => format!(
                "Manual review: {} at {}\nApply yourself if interested: {}",
                listing.title, listing.company, listing.url
            ),
            Event::CapReached { cap, .. } => format!(
                "Daily application limit reached ({}). \
                 New listings will be sent for manual review until tomorrow.",
                cap
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: Event) -> Result<()>;
}

// --- Telegram delivery ---

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

/// Delivers events as plain-text Telegram messages. Menu and command
/// handling live outside this crate; this is delivery glue only.
pub struct TelegramNotifier {
    client: reqwest::Client,
    token: String,
}

impl TelegramNotifier {
    pub fn new(token: String, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, token })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: Event) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let body = SendMessage {
            chat_id: event.chat_id(),
            text: &event.render(),
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to send Telegram message")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Telegram API error {}: {}", status, text));
        }
        Ok(())
    }
}

/// Stand-in sink for runs without a bot token: events go to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: Event) -> Result<()> {
        info!(chat_id = event.chat_id(), "{}", event.render());
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SalaryRange;

    fn listing() -> Listing {
        Listing {
            id: "77".into(),
            title: "Rust Developer".into(),
            company: "Ferrous".into(),
            salary: Some(SalaryRange {
                from: Some(5000),
                to: None,
                currency: Some("EUR".into()),
            }),
            area: Some("Berlin".into()),
            remote: true,
            description: None,
            url: "https://hh.ru/vacancy/77".into(),
        }
    }

    #[test]
    fn test_new_listing_render() {
        let text = Event::NewListing {
            chat_id: 1,
            listing: listing(),
        }
        .render();
        assert!(text.contains("Rust Developer"));
        assert!(text.contains("Ferrous"));
        assert!(text.contains("5000+ EUR"));
        assert!(text.contains("(remote)"));
        assert!(text.contains("https://hh.ru/vacancy/77"));
    }

    #[test]
    fn test_application_result_render() {
        let ok = Event::ApplicationResult {
            chat_id: 1,
            title: "Rust Developer".into(),
            success: true,
            detail: None,
        };
        assert_eq!(ok.render(), "Application submitted: Rust Developer");

        let failed = Event::ApplicationResult {
            chat_id: 1,
            title: "Rust Developer".into(),
            success: false,
            detail: Some("already applied".into()),
        };
        assert!(failed.render().contains("already applied"));
    }

    #[test]
    fn test_cap_reached_render_names_the_cap() {
        let text = Event::CapReached { chat_id: 1, cap: 20 }.render();
        assert!(text.contains("20"));
        assert!(text.contains("manual review"));
    }
}
