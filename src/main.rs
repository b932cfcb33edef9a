mod api;
mod commands;
mod engine;
mod gateway;
mod provider_builder;

use chrono::Utc;
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use engine::Engine;
use nudge_calendar::GoogleCalendar;
use nudge_channels::TelegramChannel;
use nudge_core::{
    auth::AuthKeys,
    clock::SystemClock,
    config::{self, Config},
    traits::{CalendarMirror, Channel, ParseOutcome, ParseRequest, Provider, ReminderParser},
};
use nudge_providers::LlmReminderParser;
use nudge_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "nudge",
    version,
    about = "Nudge: reminders that arrive on time"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot: channels, scheduler and API.
    Start,
    /// Show configuration and task counts.
    Status,
    /// List the tasks the next sweep would promote. Changes nothing.
    Sweep,
    /// Put a task whose delivery gave up back in line for delivery.
    Requeue {
        /// Task id.
        task_id: String,
    },
    /// Run the reminder parser on a line of text.
    Parse {
        /// IANA timezone the text is interpreted in.
        #[arg(long, default_value = "UTC")]
        tz: String,
        /// The text to parse.
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let _guard = init_logging(&cfg, matches!(cli.command, Commands::Start));

    match cli.command {
        Commands::Start => {
            let provider = provider_builder::build_provider(&cfg)?;
            if !provider.is_available().await {
                anyhow::bail!(
                    "parser backend '{}' is not available. Is its api_key set?",
                    provider.name()
                );
            }
            let parser: Arc<dyn ReminderParser> = Arc::new(LlmReminderParser::new(provider));

            // Build channels.
            let mut channels: HashMap<String, Arc<dyn Channel>> = HashMap::new();
            if let Some(ref tg) = cfg.channel.telegram {
                if tg.enabled {
                    if tg.bot_token.is_empty() {
                        anyhow::bail!(
                            "Telegram is enabled but bot_token is empty. \
                             Set it in config.toml or the NUDGE_BOT_TOKEN env var."
                        );
                    }
                    channels.insert(
                        "telegram".to_string(),
                        Arc::new(TelegramChannel::new(tg.clone())),
                    );
                }
            }
            if channels.is_empty() {
                anyhow::bail!("No channels enabled. Enable at least one channel in config.toml.");
            }

            let mirror: Option<Arc<dyn CalendarMirror>> = match &cfg.calendar {
                c if c.enabled && !c.access_token.is_empty() => {
                    Some(Arc::new(GoogleCalendar::from_config(
                        c.base_url.clone(),
                        c.calendar_id.clone(),
                        c.access_token.clone(),
                    )))
                }
                c if c.enabled => {
                    tracing::warn!("calendar mirror enabled without an access token; skipping");
                    None
                }
                _ => None,
            };

            let store = Store::new(&cfg.store).await?;
            let engine = Arc::new(Engine::new(
                store,
                Arc::new(SystemClock),
                channels.clone(),
                parser,
                mirror,
                cfg.scheduler.clone(),
                cfg.calendar.max_attempts,
            ));

            let auth_keys = AuthKeys {
                bot_token: cfg.bot_token().unwrap_or_default().to_string(),
                internal_api_key: cfg.api.internal_api_key.clone(),
                init_data_ttl_secs: cfg.api.init_data_ttl_secs,
            };

            println!("Nudge: starting...");
            let gw = Arc::new(gateway::Gateway::new(
                engine,
                channels,
                cfg.scheduler.clone(),
                cfg.api.clone(),
                auth_keys,
            ));
            gw.run().await?;
        }
        Commands::Status => {
            println!("Nudge: status\n");
            println!("Config: {}", cli.config);
            println!("Parser: {}", cfg.parser.default);
            println!(
                "  {}: {}",
                cfg.parser.default,
                match cfg.parser.resolve(&cfg.parser.default) {
                    Some(b) if !b.api_key.is_empty() => "configured",
                    Some(_) => "missing api_key",
                    None => "not configured",
                }
            );
            println!(
                "  telegram: {}",
                match &cfg.channel.telegram {
                    Some(tg) if tg.enabled && !tg.bot_token.is_empty() => "configured",
                    Some(tg) if tg.enabled => "enabled but missing bot_token",
                    Some(_) => "disabled",
                    None => "not configured",
                }
            );
            println!(
                "  calendar: {}",
                if cfg.calendar.enabled { "enabled" } else { "disabled" }
            );
            println!(
                "  api: {}",
                if cfg.api.enabled {
                    format!("{}:{}", cfg.api.host, cfg.api.port)
                } else {
                    "disabled".to_string()
                }
            );

            let store = Store::new(&cfg.store).await?;
            let stats = store
                .stats(cfg.scheduler.max_send_attempts.max(1))
                .await?;
            println!();
            println!("Tasks:");
            println!("  created:   {}", stats.created);
            println!("  scheduled: {}", stats.scheduled);
            println!("  sent:      {}", stats.sent);
            println!("  completed: {}", stats.completed);
            if stats.stuck > 0 {
                println!(
                    "  {} scheduled task(s) gave up delivering; see `nudge requeue`",
                    stats.stuck
                );
            }
        }
        Commands::Sweep => {
            let engine = offline_engine(&cfg).await?;
            let candidates = engine.sweep_candidates().await?;
            if candidates.is_empty() {
                println!("Nothing due within the next {}s.", cfg.scheduler.horizon_secs);
            }
            for task in candidates {
                println!(
                    "{}  {}  {}  {}",
                    task.id,
                    task.due_at.to_rfc3339(),
                    task.owner,
                    task.description
                );
            }
        }
        Commands::Requeue { task_id } => {
            let engine = offline_engine(&cfg).await?;
            let task = engine.requeue(&task_id).await?;
            println!(
                "Requeued {} ({}), due {}.",
                task.id,
                task.status.as_str(),
                task.due_at.to_rfc3339()
            );
        }
        Commands::Parse { tz, text } => {
            if text.is_empty() {
                anyhow::bail!("no text provided. Usage: nudge parse <text>");
            }
            let timezone: Tz = tz
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown timezone: {tz}"))?;
            let parser = LlmReminderParser::new(provider_builder::build_provider(&cfg)?);
            let outcome = parser
                .parse(&ParseRequest {
                    text: text.join(" "),
                    now: Utc::now(),
                    timezone,
                })
                .await?;
            match outcome {
                ParseOutcome::Parsed {
                    due_at,
                    description,
                } => println!(
                    "{} ({} local): {description}",
                    due_at.to_rfc3339(),
                    engine::render::local_time(due_at, timezone)
                ),
                ParseOutcome::Unparseable { reason } => println!("unparseable: {reason}"),
            }
        }
    }

    Ok(())
}

/// Console logging, plus a daily log file under `{data_dir}/logs` for the daemon.
///
/// `RUST_LOG` wins over `nudge.log_level`.
fn init_logging(cfg: &Config, to_file: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.nudge.log_level));

    if !to_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return None;
    }

    config::ensure_layout(&cfg.nudge.data_dir);
    let log_dir = std::path::Path::new(&config::shellexpand(&cfg.nudge.data_dir)).join("logs");
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "nudge.log"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Some(guard)
}

/// An engine for one-shot admin commands: no channels, no parser, no mirror.
async fn offline_engine(cfg: &Config) -> anyhow::Result<Arc<Engine>> {
    let store = Store::new(&cfg.store).await?;
    Ok(Arc::new(Engine::new(
        store,
        Arc::new(SystemClock),
        HashMap::new(),
        Arc::new(NoParser),
        None,
        cfg.scheduler.clone(),
        cfg.calendar.max_attempts,
    )))
}

struct NoParser;

#[async_trait::async_trait]
impl ReminderParser for NoParser {
    async fn parse(
        &self,
        _request: &ParseRequest,
    ) -> Result<ParseOutcome, nudge_core::error::NudgeError> {
        Ok(ParseOutcome::Unparseable {
            reason: "parser not loaded".to_string(),
        })
    }
}
