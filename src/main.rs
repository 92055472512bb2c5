mod api;
mod config;
mod db;
mod letter;
mod models;
mod monitor;
mod notify;
mod pacing;
mod pipeline;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::HhClient;
use config::Config;
use db::Store;
use letter::{LetterGenerator, OpenAiLetterGenerator};
use models::UserPrefs;
use monitor::{Monitor, MonitorConfig};
use notify::{LogNotifier, Notifier, TelegramNotifier};
use pacing::{RateGate, RetryPolicy};
use pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "jobscout")]
#[command(about = "Vacancy monitoring and application automation for job boards")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Run the monitoring loop until interrupted
    Run,

    /// Show monitoring state and application history
    Status {
        /// Show recent applications for this user
        #[arg(short, long)]
        user: Option<i64>,
    },

    /// Manage monitored users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Register a user
    Add {
        /// Chat id the user is notified on
        chat_id: i64,

        /// Optional display name
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Enable monitoring for a user
    Enable { chat_id: i64 },

    /// Disable monitoring for a user
    Disable { chat_id: i64 },

    /// Show a user's preferences and state
    Show { chat_id: i64 },

    /// Update search preferences
    Set {
        chat_id: i64,

        /// Comma-separated search keywords
        #[arg(long)]
        keywords: Option<String>,

        /// Region code understood by the job board
        #[arg(long)]
        area: Option<String>,

        /// Only match remote listings
        #[arg(long)]
        remote_only: Option<bool>,

        /// Minimum salary (0 disables the filter)
        #[arg(long)]
        salary_min: Option<i64>,

        /// Employment type (full, part, project, probation)
        #[arg(long)]
        employment: Option<String>,

        /// Experience bracket (none, 1-3, 3-6, 6+)
        #[arg(long)]
        experience: Option<String>,

        /// Submit applications automatically
        #[arg(long)]
        auto_apply: Option<bool>,

        /// Resume identifier used for submissions
        #[arg(long)]
        resume: Option<String>,

        /// Custom cover-letter prompt
        #[arg(long)]
        prompt: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let store = Store::open_default()?;

    match cli.command {
        Commands::Init => {
            store.init()?;
            println!("Database initialized at {}", store.path().display());
        }

        Commands::Run => {
            store.ensure_initialized()?;
            let config = Config::from_env()?;
            run_monitor(store, config).await?;
        }

        Commands::Status { user } => {
            store.ensure_initialized()?;
            match user {
                Some(chat_id) => show_user_status(&store, chat_id)?,
                None => show_overview(&store)?,
            }
        }

        Commands::User { command } => {
            store.ensure_initialized()?;
            handle_user_command(&store, command)?;
        }
    }

    Ok(())
}

async fn run_monitor(store: Store, config: Config) -> Result<()> {
    let gate = RateGate::new(config.requests_per_second);
    let retry = RetryPolicy::new(
        config.backoff_base,
        config.backoff_cap,
        config.retry_attempts,
    );
    let api = Arc::new(HhClient::new(
        config.api_base.clone(),
        config.api_token.clone(),
        gate,
        retry,
        config.http_timeout,
    )?);

    let letters: Option<Arc<dyn LetterGenerator>> = match &config.openai_api_key {
        Some(key) => Some(Arc::new(OpenAiLetterGenerator::new(
            key.clone(),
            config.http_timeout,
        )?)),
        None => {
            warn!("OPENAI_API_KEY not set, cover letters fall back to the fixed template");
            None
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.telegram_token {
        Some(token) => Arc::new(TelegramNotifier::new(token.clone(), config.http_timeout)?),
        None => {
            warn!("TELEGRAM_BOT_TOKEN not set, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    let pipeline = Arc::new(Pipeline::new(
        api.clone(),
        letters,
        store.clone(),
        config.profile.clone(),
    ));
    let monitor = Monitor::new(
        store,
        api,
        pipeline,
        notifier,
        MonitorConfig {
            tick_interval: config.tick_interval,
            per_page: config.per_page,
            daily_cap: config.max_applications_per_day,
            concurrency: config.tick_concurrency,
        },
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = tokio::spawn(async move { monitor.run(stop_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested, finishing the current user");
    let _ = stop_tx.send(true);

    runner.await.context("Monitor task failed")?;
    Ok(())
}

fn show_overview(store: &Store) -> Result<()> {
    let users = store.list_users()?;
    if users.is_empty() {
        println!("No users registered.");
        return Ok(());
    }
    println!(
        "{:<12} {:<9} {:<20} {:<8} {:<8} {}",
        "CHAT ID", "ENABLED", "LAST CHECK", "SEEN", "APPS", "LAST ERROR"
    );
    println!("{}", "-".repeat(80));
    for chat_id in users {
        let state = store.monitoring_state(chat_id)?;
        let (enabled, last_check, last_error) = match state {
            Some(s) => (
                if s.enabled { "yes" } else { "no" }.to_string(),
                s.last_check
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string()),
                s.last_error.unwrap_or_default(),
            ),
            None => ("no".to_string(), "never".to_string(), String::new()),
        };
        println!(
            "{:<12} {:<9} {:<20} {:<8} {:<8} {}",
            chat_id,
            enabled,
            last_check,
            store.seen_count(chat_id)?,
            store.applications_count(chat_id)?,
            truncate(&last_error, 30),
        );
    }
    Ok(())
}

fn show_user_status(store: &Store, chat_id: i64) -> Result<()> {
    let prefs = store.get_prefs(chat_id)?;
    println!("User {}", chat_id);
    println!("Keywords: {}", prefs.filter.keywords.join(", "));
    if let Some(area) = &prefs.filter.area {
        println!("Area: {}", area);
    }
    println!("Remote only: {}", prefs.filter.remote_only);
    println!("Salary min: {}", prefs.filter.salary_min);
    println!("Auto-apply: {}", prefs.auto_apply);
    if let Some(resume) = &prefs.resume_id {
        println!("Resume: {}", resume);
    }

    let apps = store.recent_applications(chat_id, 10)?;
    if apps.is_empty() {
        println!("\nNo applications yet.");
    } else {
        println!("\n{:<10} {:<9} {:<30} {}", "VACANCY", "STATUS", "TITLE", "DETAIL");
        println!("{}", "-".repeat(70));
        for app in apps {
            println!(
                "{:<10} {:<9} {:<30} {}",
                app.vacancy_id,
                app.outcome.as_str(),
                truncate(&app.vacancy_title, 28),
                truncate(app.error_message.as_deref().unwrap_or(""), 25),
            );
        }
    }
    Ok(())
}

fn handle_user_command(store: &Store, command: UserCommands) -> Result<()> {
    match command {
        UserCommands::Add { chat_id, username } => {
            store.get_or_create_user(chat_id, username.as_deref())?;
            println!("Registered user {}", chat_id);
        }

        UserCommands::Enable { chat_id } => {
            store.set_enabled(chat_id, true)?;
            println!("Monitoring enabled for {}", chat_id);
        }

        UserCommands::Disable { chat_id } => {
            store.set_enabled(chat_id, false)?;
            println!("Monitoring disabled for {}", chat_id);
        }

        UserCommands::Show { chat_id } => {
            show_user_status(store, chat_id)?;
        }

        UserCommands::Set {
            chat_id,
            keywords,
            area,
            remote_only,
            salary_min,
            employment,
            experience,
            auto_apply,
            resume,
            prompt,
        } => {
            let mut prefs = store.get_prefs(chat_id)?;
            apply_updates(
                &mut prefs,
                keywords,
                area,
                remote_only,
                salary_min,
                employment,
                experience,
                auto_apply,
                resume,
                prompt,
            )?;
            store.save_prefs(&prefs)?;
            println!("Preferences updated for {}", chat_id);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_updates(
    prefs: &mut UserPrefs,
    keywords: Option<String>,
    area: Option<String>,
    remote_only: Option<bool>,
    salary_min: Option<i64>,
    employment: Option<String>,
    experience: Option<String>,
    auto_apply: Option<bool>,
    resume: Option<String>,
    prompt: Option<String>,
) -> Result<()> {
    if let Some(raw) = keywords {
        prefs.filter.keywords = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(area) = area {
        prefs.filter.area = if area.is_empty() { None } else { Some(area) };
    }
    if let Some(remote) = remote_only {
        prefs.filter.remote_only = remote;
    }
    if let Some(salary) = salary_min {
        prefs.filter.salary_min = salary.max(0);
    }
    if let Some(raw) = employment {
        prefs.filter.employment = Some(raw.parse()?);
    }
    if let Some(raw) = experience {
        prefs.filter.experience = Some(raw.parse()?);
    }
    if let Some(auto) = auto_apply {
        prefs.auto_apply = auto;
    }
    if let Some(resume) = resume {
        prefs.resume_id = if resume.is_empty() { None } else { Some(resume) };
    }
    if let Some(prompt) = prompt {
        prefs.letter_prompt = if prompt.is_empty() { None } else { Some(prompt) };
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // Titles from the job board are routinely non-ASCII, so the cut must
    // land on a char boundary.
    let budget = max.saturating_sub(3);
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= budget)
        .last()
        .unwrap_or(0);
    format!("{}...", &s[..cut])
}
