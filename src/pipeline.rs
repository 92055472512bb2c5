use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::api::{ApiError, JobApi};
use crate::config::Profile;
use crate::db::Store;
use crate::letter::{fallback_letter, LetterGenerator, LetterParams};
use crate::models::{Application, Listing, Outcome, UserPrefs};

/// Turns one new listing into either a submitted application or a
/// manual-review placeholder, and persists exactly one record per
/// invocation. Submissions are never retried here: duplicate applications
/// are worse than a missed cycle, and transient errors were already
/// retried inside the client.
pub struct Pipeline {
    api: Arc<dyn JobApi>,
    letters: Option<Arc<dyn LetterGenerator>>,
    store: Store,
    profile: Profile,
}

impl Pipeline {
    pub fn new(
        api: Arc<dyn JobApi>,
        letters: Option<Arc<dyn LetterGenerator>>,
        store: Store,
        profile: Profile,
    ) -> Self {
        Self {
            api,
            letters,
            store,
            profile,
        }
    }

    pub async fn process(
        &self,
        prefs: &UserPrefs,
        listing: &Listing,
        auto_apply: bool,
    ) -> Result<Application> {
        if !auto_apply {
            // Manual path: record a pending placeholder so the review
            // request shows up in the history, submit nothing.
            return self.record(prefs.chat_id, listing, "", Outcome::Pending, None);
        }

        let cover_letter = self.cover_letter(prefs, listing).await;

        let Some(resume_id) = prefs.resume_id.as_deref() else {
            return self.record(
                prefs.chat_id,
                listing,
                &cover_letter,
                Outcome::Failed,
                Some("no resume configured"),
            );
        };

        match self
            .api
            .submit_application(&listing.id, resume_id, &cover_letter)
            .await
        {
            Ok(()) => {
                info!(chat_id = prefs.chat_id, vacancy = %listing.id, "application submitted");
                self.record(prefs.chat_id, listing, &cover_letter, Outcome::Success, None)
            }
            Err(err) => {
                warn!(
                    chat_id = prefs.chat_id,
                    vacancy = %listing.id,
                    error = %err,
                    "application rejected"
                );
                let reason = match &err {
                    ApiError::Apply(reason) => reason.clone(),
                    other => other.user_message(),
                };
                self.record(
                    prefs.chat_id,
                    listing,
                    &cover_letter,
                    Outcome::Failed,
                    Some(&reason),
                )
            }
        }
    }

    /// Generated letter if the generator is configured and answers in time,
    /// otherwise the deterministic fallback. Never an error.
    async fn cover_letter(&self, prefs: &UserPrefs, listing: &Listing) -> String {
        let params = LetterParams {
            listing,
            profile: &self.profile,
            prompt_override: prefs.letter_prompt.as_deref(),
        };
        if let Some(generator) = &self.letters {
            match generator.generate(&params).await {
                Ok(letter) => return letter,
                Err(err) => {
                    warn!(
                        chat_id = prefs.chat_id,
                        vacancy = %listing.id,
                        error = %err,
                        "letter generation failed, using fallback"
                    );
                }
            }
        }
        fallback_letter(listing, &self.profile)
    }

    fn record(
        &self,
        chat_id: i64,
        listing: &Listing,
        cover_letter: &str,
        outcome: Outcome,
        error_message: Option<&str>,
    ) -> Result<Application> {
        let (id, applied_at) = self.store.record_application(
            chat_id,
            &listing.id,
            &listing.title,
            &listing.company,
            cover_letter,
            outcome,
            error_message,
        )?;
        Ok(Application {
            id,
            chat_id,
            vacancy_id: listing.id.clone(),
            vacancy_title: listing.title.clone(),
            company_name: listing.company.clone(),
            cover_letter: cover_letter.to_string(),
            outcome,
            error_message: error_message.map(|s| s.to_string()),
            applied_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockApi;
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct FixedLetter(&'static str);

    #[async_trait]
    impl LetterGenerator for FixedLetter {
        async fn generate(&self, _params: &LetterParams<'_>) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct BrokenLetter;

    #[async_trait]
    impl LetterGenerator for BrokenLetter {
        async fn generate(&self, _params: &LetterParams<'_>) -> Result<String> {
            Err(anyhow!("generator timed out"))
        }
    }

    fn profile() -> Profile {
        Profile {
            name: "Jane".into(),
            position: "Engineer".into(),
            summary: "Summary.".into(),
            skills: vec!["Rust".into()],
        }
    }

    fn setup(
        letters: Option<Arc<dyn LetterGenerator>>,
    ) -> (Pipeline, Arc<MockApi>, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        store.init().unwrap();
        store.get_or_create_user(1, None).unwrap();
        let api = Arc::new(MockApi::default());
        let pipeline = Pipeline::new(api.clone(), letters, store.clone(), profile());
        (pipeline, api, store, dir)
    }

    fn prefs_with_resume() -> UserPrefs {
        let mut prefs = UserPrefs::defaults(1);
        prefs.resume_id = Some("resume-1".into());
        prefs
    }

    #[tokio::test]
    async fn test_manual_path_records_pending_and_submits_nothing() {
        let (pipeline, api, store, _dir) = setup(None);
        let listing = MockApi::listing("v1");

        let app = pipeline
            .process(&prefs_with_resume(), &listing, false)
            .await
            .unwrap();

        assert_eq!(app.outcome, Outcome::Pending);
        assert!(api.submitted.lock().unwrap().is_empty());
        assert_eq!(store.applications_count(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_auto_apply_success_uses_generated_letter() {
        let (pipeline, api, store, _dir) = setup(Some(Arc::new(FixedLetter("Dear Acme"))));
        let listing = MockApi::listing("v1");

        let app = pipeline
            .process(&prefs_with_resume(), &listing, true)
            .await
            .unwrap();

        assert_eq!(app.outcome, Outcome::Success);
        assert_eq!(app.cover_letter, "Dear Acme");
        let submitted = api.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, "v1");
        assert_eq!(submitted[0].1, "resume-1");
        assert_eq!(store.applications_count(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_generator_failure_falls_back_and_still_submits() {
        let (pipeline, api, _store, _dir) = setup(Some(Arc::new(BrokenLetter)));
        let listing = MockApi::listing("v1");

        let app = pipeline
            .process(&prefs_with_resume(), &listing, true)
            .await
            .unwrap();

        // Scenario: generator times out, the pipeline still produces a
        // terminal application with the fallback letter.
        assert_eq!(app.outcome, Outcome::Success);
        assert!(app.cover_letter.contains("Listing v1"));
        assert_eq!(api.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_rejection_preserves_reason_verbatim() {
        let (pipeline, api, store, _dir) = setup(None);
        api.push_apply(Err(ApiError::Apply("already applied".into())));
        let listing = MockApi::listing("v1");

        let app = pipeline
            .process(&prefs_with_resume(), &listing, true)
            .await
            .unwrap();

        assert_eq!(app.outcome, Outcome::Failed);
        assert_eq!(app.error_message.as_deref(), Some("already applied"));
        // One attempt, one record, no pipeline-level retry
        assert_eq!(api.submitted.lock().unwrap().len(), 1);
        assert_eq!(store.applications_count(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_failure_gets_actionable_message() {
        let (pipeline, api, _store, _dir) = setup(None);
        api.push_apply(Err(ApiError::RateLimitExceeded { attempts: 3 }));
        let listing = MockApi::listing("v1");

        let app = pipeline
            .process(&prefs_with_resume(), &listing, true)
            .await
            .unwrap();

        assert_eq!(app.outcome, Outcome::Failed);
        let message = app.error_message.unwrap();
        assert!(message.contains("rate limit"));
        assert!(!message.contains("ApiError"));
    }

    #[tokio::test]
    async fn test_returned_record_matches_stored_row() {
        let (pipeline, _api, store, _dir) = setup(None);
        let listing = MockApi::listing("v1");

        let app = pipeline
            .process(&prefs_with_resume(), &listing, true)
            .await
            .unwrap();

        let stored = store.recent_applications(1, 1).unwrap().remove(0);
        assert_eq!(app.id, stored.id);
        assert_eq!(app.outcome, stored.outcome);
        assert!(!app.applied_at.is_empty());
        assert_eq!(app.applied_at, stored.applied_at);
    }

    #[tokio::test]
    async fn test_missing_resume_fails_without_submitting() {
        let (pipeline, api, store, _dir) = setup(None);
        let listing = MockApi::listing("v1");

        let app = pipeline
            .process(&UserPrefs::defaults(1), &listing, true)
            .await
            .unwrap();

        assert_eq!(app.outcome, Outcome::Failed);
        assert_eq!(app.error_message.as_deref(), Some("no resume configured"));
        assert!(api.submitted.lock().unwrap().is_empty());
        assert_eq!(store.applications_count(1).unwrap(), 1);
    }
}
