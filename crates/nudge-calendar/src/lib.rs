//! # nudge-calendar
//!
//! Calendar mirror integrations for Nudge. A mirror is a best-effort
//! projection of a task; the task row stays authoritative.

pub mod google;

pub use google::GoogleCalendar;
