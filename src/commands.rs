//! Built-in bot commands: instant responses, no parser call.

use crate::engine::render;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use nudge_core::message::{Location, ReplyKeyboard};
use nudge_store::Store;
use std::sync::OnceLock;
use tzf_rs::DefaultFinder;

/// Grouped context for command execution.
pub struct CommandContext<'a> {
    pub store: &'a Store,
    pub owner: &'a str,
    pub text: &'a str,
    pub now: DateTime<Utc>,
}

/// Known bot commands.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Timezone,
    AutoTimezone,
    Tasks,
}

impl Command {
    /// Parse a command from message text. Accepts the `/cmd@botname` form.
    pub fn parse(text: &str) -> Option<Self> {
        let first = text.split_whitespace().next()?;
        let cmd = first.split('@').next()?;
        match cmd {
            "/start" => Some(Self::Start),
            "/help" => Some(Self::Help),
            "/timezone" | "/tz" => Some(Self::Timezone),
            "/autotimezone" => Some(Self::AutoTimezone),
            "/tasks" => Some(Self::Tasks),
            _ => None,
        }
    }

    /// Keyboard to show under the command's reply, if any.
    pub fn reply_keyboard(&self) -> Option<ReplyKeyboard> {
        match self {
            Self::AutoTimezone => Some(ReplyKeyboard::RequestLocation {
                label: "\u{1f4cd} Send my location".to_string(),
            }),
            _ => None,
        }
    }
}

/// Handle a command and return the response text.
pub async fn handle(cmd: Command, ctx: &CommandContext<'_>) -> String {
    match cmd {
        Command::Start => handle_start(ctx).await,
        Command::Help => HELP.to_string(),
        Command::Timezone => handle_timezone(ctx).await,
        Command::AutoTimezone => AUTO_TIMEZONE.to_string(),
        Command::Tasks => handle_tasks(ctx).await,
    }
}

const HELP: &str = "\
Send me a message like \"remind me to call mom tomorrow at 18:00\" and I'll \
ping you at that time.

/timezone <Area/City>: set your timezone (e.g. /timezone Europe/Berlin)
/autotimezone: set your timezone from a shared location
/tasks: list pending reminders
/help: this message";

const AUTO_TIMEZONE: &str =
    "Tap the button below to share your location and I'll set your timezone from it.";

/// IANA timezone containing a point, if any. Open sea maps to `Etc/GMT±N`.
pub fn timezone_at(latitude: f64, longitude: f64) -> Option<Tz> {
    static FINDER: OnceLock<DefaultFinder> = OnceLock::new();
    let finder = FINDER.get_or_init(DefaultFinder::new);
    finder.get_tz_name(longitude, latitude).parse().ok()
}

/// Set the sender's timezone from a shared location.
pub async fn handle_location(
    store: &Store,
    owner: &str,
    location: Location,
    now: DateTime<Utc>,
) -> String {
    let Some(tz) = timezone_at(location.latitude, location.longitude) else {
        return "I couldn't work out a timezone for that location. \
                Try /timezone <Area/City> instead."
            .to_string();
    };
    match store.set_timezone(owner, tz.name(), now).await {
        Ok(()) => format!(
            "Timezone set to {}. Your local time is {}.",
            tz.name(),
            render::local_time(now, tz)
        ),
        Err(e) => format!("Error: {e}"),
    }
}

async fn handle_start(ctx: &CommandContext<'_>) -> String {
    if let Err(e) = ctx.store.register_user(ctx.owner, ctx.now).await {
        return format!("Error: {e}");
    }
    match ctx.store.get_timezone(ctx.owner).await {
        Ok(Some(tz)) => format!("Welcome back! Your timezone is {tz}.\n\n{HELP}"),
        Ok(None) => format!(
            "Hi! I'm a reminder bot.\n\nFirst tell me your timezone, e.g. \
             /timezone Europe/Berlin\n\n{HELP}"
        ),
        Err(e) => format!("Error: {e}"),
    }
}

async fn handle_timezone(ctx: &CommandContext<'_>) -> String {
    let arg = ctx.text.split_whitespace().nth(1).unwrap_or("").trim();
    if arg.is_empty() {
        return match ctx.store.get_timezone(ctx.owner).await {
            Ok(Some(tz)) => format!("Your timezone is {tz}."),
            Ok(None) => "No timezone set. Usage: /timezone <Area/City>".to_string(),
            Err(e) => format!("Error: {e}"),
        };
    }

    let tz: Tz = match arg.parse() {
        Ok(tz) => tz,
        Err(_) => return format!("Unknown timezone: {arg}. Try e.g. Europe/Berlin."),
    };
    match ctx.store.set_timezone(ctx.owner, tz.name(), ctx.now).await {
        Ok(()) => format!(
            "Timezone set to {}. Your local time is {}.",
            tz.name(),
            render::local_time(ctx.now, tz)
        ),
        Err(e) => format!("Error: {e}"),
    }
}

async fn handle_tasks(ctx: &CommandContext<'_>) -> String {
    let tz = match ctx.store.get_timezone(ctx.owner).await {
        Ok(tz) => tz.and_then(|name| name.parse().ok()).unwrap_or(chrono_tz::UTC),
        Err(e) => return format!("Error: {e}"),
    };
    match ctx.store.tasks_for_owner(ctx.owner, false).await {
        Ok(tasks) => render::task_list(&tasks, tz),
        Err(e) => format!("Error: {e}"),
    }
}
