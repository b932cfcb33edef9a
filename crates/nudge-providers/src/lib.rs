//! # nudge-providers
//!
//! LLM provider implementations and the natural-language reminder parser
//! built on top of them.

pub mod gemini;
pub mod openai;
pub mod parser;

pub use parser::LlmReminderParser;
