//! Discord bot that logs GPU usage sessions to a Google spreadsheet.
//!
//! `/start` appends a row and posts a summary with an end button; pressing the
//! button fills in the end time. The [`ledger`] remembers which row each
//! posted message belongs to, across restarts.
//!
//! Types, events, session rules, the ledger, and the handlers always compile.
//! The `io` feature adds the gateway, the Discord and Google HTTP clients,
//! and the event loop in [`bot::start`].

pub mod bot;
pub mod config;
pub mod events;
#[cfg(feature = "io")]
pub mod gateway;
pub mod handlers;
#[cfg(feature = "io")]
pub mod http;
pub mod ledger;
pub mod session;
pub mod sheets;
pub mod types;

/// Load configuration from the environment and run the bot until the gateway
/// stream ends.
#[cfg(feature = "io")]
pub async fn run() -> Result<(), handlers::HandlerError> {
    let config = config::BotConfig::from_env().map_err(|e| {
        tracing::error!(error = %e, "invalid configuration");
        e
    })?;
    tracing::info!(?config, "configuration loaded");
    bot::start(config).await
}
