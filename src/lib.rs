//! Ticket order bot: watches a storefront for ticket orders, asks the operator to approve each
//! one over Telegram, texts the buyer through an SMS console and reports sales.

pub mod browser;
pub mod commands;
pub mod config;
pub mod error;
pub mod intake;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod report;
pub mod scheduler;
pub mod scrape;
pub mod sms;
pub mod store;
pub mod storefront;
pub mod telegram;

pub use config::AppSettings;
pub use error::{BotError, Result};
