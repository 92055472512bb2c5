use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::{Application, MonitoringState, Outcome, SearchFilter, UserPrefs};

const TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// SQLite-backed store for preferences, monitoring state, seen listings and
/// the application log. Cheap to clone; all clones share one connection
/// guarded by a mutex, which also gives per-key atomicity for the dedup
/// table (`mark_seen` claims are serialized).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    pub fn open_default() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open(&path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobscout") {
            Ok(proj_dirs.data_dir().join("jobscout.db"))
        } else {
            Ok(PathBuf::from("jobscout.db"))
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-query;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn init(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                chat_id INTEGER PRIMARY KEY,
                username TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS preferences (
                chat_id INTEGER PRIMARY KEY REFERENCES users(chat_id),
                keywords TEXT NOT NULL DEFAULT '[]',
                area TEXT,
                remote_only INTEGER NOT NULL DEFAULT 0,
                salary_min INTEGER NOT NULL DEFAULT 0,
                employment TEXT,
                experience TEXT,
                auto_apply INTEGER NOT NULL DEFAULT 0,
                resume_id TEXT,
                letter_prompt TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS monitoring_state (
                chat_id INTEGER PRIMARY KEY REFERENCES users(chat_id),
                enabled INTEGER NOT NULL DEFAULT 0,
                last_check TEXT,
                last_error TEXT
            );

            CREATE TABLE IF NOT EXISTS seen_vacancies (
                chat_id INTEGER NOT NULL REFERENCES users(chat_id),
                vacancy_id TEXT NOT NULL,
                first_seen TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (chat_id, vacancy_id)
            );

            CREATE TABLE IF NOT EXISTS applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL REFERENCES users(chat_id),
                vacancy_id TEXT NOT NULL,
                vacancy_title TEXT NOT NULL,
                company_name TEXT NOT NULL,
                cover_letter TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'success', 'failed')),
                error_message TEXT,
                applied_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_applications_user
                ON applications(chat_id, status, applied_at);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='applications'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'jobscout init' first."
            ));
        }
        Ok(())
    }

    // --- Users & preferences ---

    pub fn get_or_create_user(&self, chat_id: i64, username: Option<&str>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO users (chat_id, username) VALUES (?1, ?2)",
            params![chat_id, username],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO preferences (chat_id) VALUES (?1)",
            [chat_id],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO monitoring_state (chat_id) VALUES (?1)",
            [chat_id],
        )?;
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT chat_id FROM users ORDER BY chat_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list users")
    }

    /// Preference Provider contract: the set of users the scheduler should
    /// act for on each tick.
    pub fn list_enabled_users(&self) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT chat_id FROM monitoring_state WHERE enabled = 1 ORDER BY chat_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list enabled users")
    }

    pub fn get_prefs(&self, chat_id: i64) -> Result<UserPrefs> {
        let row = self
            .conn()
            .query_row(
                "SELECT keywords, area, remote_only, salary_min, employment, experience,
                        auto_apply, resume_id, letter_prompt
                 FROM preferences WHERE chat_id = ?1",
                [chat_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            keywords,
            area,
            remote_only,
            salary_min,
            employment,
            experience,
            auto_apply,
            resume_id,
            letter_prompt,
        )) = row
        else {
            return Ok(UserPrefs::defaults(chat_id));
        };

        // Keywords are stored as a JSON array, like the rest of the tooling
        // around this schema expects. Unparseable text degrades to empty.
        let keywords: Vec<String> = serde_json::from_str(&keywords).unwrap_or_default();
        let filter = SearchFilter {
            keywords,
            area,
            remote_only,
            salary_min: salary_min.max(0),
            employment: employment.as_deref().and_then(|s| s.parse().ok()),
            experience: experience.as_deref().and_then(|s| s.parse().ok()),
        };
        Ok(UserPrefs {
            chat_id,
            filter,
            auto_apply,
            resume_id,
            letter_prompt,
        })
    }

    pub fn save_prefs(&self, prefs: &UserPrefs) -> Result<()> {
        self.get_or_create_user(prefs.chat_id, None)?;
        let keywords = serde_json::to_string(&prefs.filter.keywords)?;
        self.conn().execute(
            "UPDATE preferences
             SET keywords = ?1, area = ?2, remote_only = ?3, salary_min = ?4,
                 employment = ?5, experience = ?6, auto_apply = ?7,
                 resume_id = ?8, letter_prompt = ?9, updated_at = datetime('now')
             WHERE chat_id = ?10",
            params![
                keywords,
                prefs.filter.area,
                prefs.filter.remote_only,
                prefs.filter.salary_min.max(0),
                prefs.filter.employment.map(|e| e.as_param()),
                prefs.filter.experience.map(|e| e.as_param()),
                prefs.auto_apply,
                prefs.resume_id,
                prefs.letter_prompt,
                prefs.chat_id,
            ],
        )?;
        Ok(())
    }

    // --- Monitoring state ---

    pub fn set_enabled(&self, chat_id: i64, enabled: bool) -> Result<()> {
        self.get_or_create_user(chat_id, None)?;
        self.conn().execute(
            "UPDATE monitoring_state SET enabled = ?1 WHERE chat_id = ?2",
            params![enabled, chat_id],
        )?;
        Ok(())
    }

    pub fn monitoring_state(&self, chat_id: i64) -> Result<Option<MonitoringState>> {
        let row = self
            .conn()
            .query_row(
                "SELECT enabled, last_check, last_error FROM monitoring_state WHERE chat_id = ?1",
                [chat_id],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(enabled, last_check, last_error)| MonitoringState {
            chat_id,
            enabled,
            last_check: last_check.and_then(|s| parse_time(&s)),
            last_error,
        }))
    }

    /// Advance `last_check` and record the tick's terminal error (or clear
    /// it). Called unconditionally at the end of per-user processing so
    /// staleness stays observable even on partial failure.
    pub fn record_check(&self, chat_id: i64, error: Option<&str>) -> Result<()> {
        self.conn().execute(
            "UPDATE monitoring_state SET last_check = ?1, last_error = ?2 WHERE chat_id = ?3",
            params![Utc::now().format(TIME_FMT).to_string(), error, chat_id],
        )?;
        Ok(())
    }

    // --- Dedup ---

    pub fn has_seen(&self, chat_id: i64, vacancy_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM seen_vacancies WHERE chat_id = ?1 AND vacancy_id = ?2",
                params![chat_id, vacancy_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Idempotent claim on a (user, listing) pair. Returns true only for
    /// the call that actually inserted the record, so concurrent paths
    /// cannot both treat the same pair as new.
    pub fn mark_seen(&self, chat_id: i64, vacancy_id: &str) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO seen_vacancies (chat_id, vacancy_id, first_seen)
             VALUES (?1, ?2, ?3)",
            params![
                chat_id,
                vacancy_id,
                Utc::now().format(TIME_FMT).to_string()
            ],
        )?;
        Ok(inserted > 0)
    }

    // --- Application log ---

    pub fn record_application(
        &self,
        chat_id: i64,
        vacancy_id: &str,
        vacancy_title: &str,
        company_name: &str,
        cover_letter: &str,
        outcome: Outcome,
        error_message: Option<&str>,
    ) -> Result<(i64, String)> {
        let applied_at = Utc::now().format(TIME_FMT).to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO applications
             (chat_id, vacancy_id, vacancy_title, company_name, cover_letter,
              status, error_message, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                chat_id,
                vacancy_id,
                vacancy_title,
                company_name,
                cover_letter,
                outcome.as_str(),
                error_message,
                applied_at,
            ],
        )?;
        Ok((conn.last_insert_rowid(), applied_at))
    }

    /// Successful submissions since the given instant; drives the daily cap.
    pub fn successes_since(&self, chat_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM applications
             WHERE chat_id = ?1 AND status = 'success' AND applied_at >= ?2",
            params![chat_id, since.format(TIME_FMT).to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn applications_count(&self, chat_id: i64) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM applications WHERE chat_id = ?1",
            [chat_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn recent_applications(&self, chat_id: i64, limit: usize) -> Result<Vec<Application>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, vacancy_id, vacancy_title, company_name,
                    cover_letter, status, error_message, applied_at
             FROM applications
             WHERE chat_id = ?1
             ORDER BY applied_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chat_id, limit as i64], row_to_application)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list applications")
    }

    pub fn seen_count(&self, chat_id: i64) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM seen_vacancies WHERE chat_id = ?1",
            [chat_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<Application> {
    let status: String = row.get(6)?;
    Ok(Application {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        vacancy_id: row.get(2)?,
        vacancy_title: row.get(3)?,
        company_name: row.get(4)?,
        cover_letter: row.get(5)?,
        outcome: status.parse().unwrap_or(Outcome::Failed),
        error_message: row.get(7)?,
        applied_at: row.get(8)?,
    })
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, TIME_FMT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        store.init().unwrap();
        (store, dir)
    }

    #[test]
    fn test_prefs_round_trip() {
        let (store, _dir) = test_store();
        store.get_or_create_user(42, Some("tester")).unwrap();

        let mut prefs = store.get_prefs(42).unwrap();
        assert!(prefs.filter.keywords.is_empty());
        assert!(!prefs.auto_apply);

        prefs.filter.keywords = vec!["rust".into(), "backend".into()];
        prefs.filter.salary_min = 120_000;
        prefs.filter.remote_only = true;
        prefs.auto_apply = true;
        prefs.resume_id = Some("resume-1".into());
        store.save_prefs(&prefs).unwrap();

        let loaded = store.get_prefs(42).unwrap();
        assert_eq!(loaded.filter.keywords, vec!["rust", "backend"]);
        assert_eq!(loaded.filter.salary_min, 120_000);
        assert!(loaded.filter.remote_only);
        assert!(loaded.auto_apply);
        assert_eq!(loaded.resume_id.as_deref(), Some("resume-1"));
    }

    #[test]
    fn test_prefs_for_unknown_user_are_defaults() {
        let (store, _dir) = test_store();
        let prefs = store.get_prefs(999).unwrap();
        assert_eq!(prefs.chat_id, 999);
        assert!(prefs.filter.keywords.is_empty());
        assert!(!prefs.auto_apply);
    }

    #[test]
    fn test_mark_seen_idempotent() {
        let (store, _dir) = test_store();
        store.get_or_create_user(1, None).unwrap();

        assert!(!store.has_seen(1, "vac_123").unwrap());
        assert!(store.mark_seen(1, "vac_123").unwrap());
        // Second claim loses
        assert!(!store.mark_seen(1, "vac_123").unwrap());
        assert!(store.has_seen(1, "vac_123").unwrap());
        assert_eq!(store.seen_count(1).unwrap(), 1);

        // Same listing for another user is independent
        store.get_or_create_user(2, None).unwrap();
        assert!(store.mark_seen(2, "vac_123").unwrap());
    }

    #[test]
    fn test_enable_disable_and_record_check() {
        let (store, _dir) = test_store();
        store.set_enabled(7, true).unwrap();
        assert_eq!(store.list_enabled_users().unwrap(), vec![7]);

        let state = store.monitoring_state(7).unwrap().unwrap();
        assert!(state.enabled);
        assert!(state.last_check.is_none());

        store.record_check(7, Some("search failed")).unwrap();
        let state = store.monitoring_state(7).unwrap().unwrap();
        assert!(state.last_check.is_some());
        assert_eq!(state.last_error.as_deref(), Some("search failed"));

        // A clean tick clears the error but keeps advancing last_check
        store.record_check(7, None).unwrap();
        let state = store.monitoring_state(7).unwrap().unwrap();
        assert!(state.last_error.is_none());

        store.set_enabled(7, false).unwrap();
        assert!(store.list_enabled_users().unwrap().is_empty());
        // State survives disable
        assert!(store.monitoring_state(7).unwrap().is_some());
    }

    #[test]
    fn test_application_log_and_daily_count() {
        let (store, _dir) = test_store();
        store.get_or_create_user(5, None).unwrap();

        store
            .record_application(5, "v1", "Dev", "Acme", "letter", Outcome::Success, None)
            .unwrap();
        store
            .record_application(
                5,
                "v2",
                "Dev 2",
                "Acme",
                "letter",
                Outcome::Failed,
                Some("already applied"),
            )
            .unwrap();
        store
            .record_application(5, "v3", "Dev 3", "Acme", "", Outcome::Pending, None)
            .unwrap();

        assert_eq!(store.applications_count(5).unwrap(), 3);

        // Only successes count against the cap
        let day_ago = Utc::now() - ChronoDuration::hours(24);
        assert_eq!(store.successes_since(5, day_ago).unwrap(), 1);
        // Nothing before the boundary
        let tomorrow = Utc::now() + ChronoDuration::hours(1);
        assert_eq!(store.successes_since(5, tomorrow).unwrap(), 0);

        let recent = store.recent_applications(5, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].vacancy_id, "v3");
        assert_eq!(recent[0].outcome, Outcome::Pending);
    }

    #[test]
    fn test_store_shared_across_clones() {
        let (store, _dir) = test_store();
        store.get_or_create_user(1, None).unwrap();
        let clone = store.clone();
        assert!(clone.mark_seen(1, "v1").unwrap());
        assert!(store.has_seen(1, "v1").unwrap());
    }
}
