//! Core bot infrastructure: shared handler context, per-process state, and
//! the async event loop that feeds gateway events to the handlers.

use crate::config::{AccessPolicy, CommandScope};
use crate::ledger::SessionLedger;

#[cfg(feature = "io")]
use tracing::{error, info, warn};

#[cfg(feature = "io")]
use crate::{
    config::BotConfig,
    events::GatewayEvent,
    gateway::{self, GatewayConfig},
    handlers::{self, HandlerError},
    http::DiscordHttpClient,
    ledger::JsonFileStore,
    sheets::google::{GoogleSheetsClient, ServiceAccountKey},
    types::Intents,
};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Everything a handler needs, owned for the life of the process.
pub struct Context<G, C> {
    pub access: AccessPolicy,
    pub command_scope: CommandScope,
    pub ledger: SessionLedger,
    pub sheets: G,
    pub chat: C,
}

impl<G, C> Context<G, C> {
    pub fn new(
        access: AccessPolicy,
        command_scope: CommandScope,
        ledger: SessionLedger,
        sheets: G,
        chat: C,
    ) -> Self {
        Self {
            access,
            command_scope,
            ledger,
            sheets,
            chat,
        }
    }
}

/// Identity and lifecycle state, updated from READY.
#[derive(Debug, Default)]
pub struct BotState {
    /// The application ID (set on READY).
    pub application_id: Option<String>,
    /// Whether slash commands have been registered this process.
    pub commands_registered: bool,
}

// ---------------------------------------------------------------------------
// Gateway intents
// ---------------------------------------------------------------------------

/// Interactions arrive regardless of intents; GUILDS keeps channel data
/// flowing for the placement check.
#[cfg(feature = "io")]
fn gateway_intents() -> Intents {
    Intents::GUILDS
}

// ---------------------------------------------------------------------------
// Bot entry point
// ---------------------------------------------------------------------------

/// Build the clients and ledger from `config`, connect to the gateway, and
/// run the event loop until the gateway gives up.
///
/// Events are handled one at a time: each handler is awaited before the next
/// event is taken.
#[cfg(feature = "io")]
pub async fn start(config: BotConfig) -> Result<(), HandlerError> {
    let http = DiscordHttpClient::new(config.discord_token.as_str())?;

    let key = ServiceAccountKey::from_json(&config.service_account.read()?)?;
    let sheets = GoogleSheetsClient::new(key, &config.spreadsheet_id, &config.sheet_name)?;

    let ledger = SessionLedger::load(JsonFileStore::new(&config.ledger_path)).map_err(|e| {
        error!(path = %config.ledger_path.display(), error = %e, "failed to load session ledger");
        e
    })?;

    let ctx = Context::new(
        config.access.clone(),
        config.command_scope.clone(),
        ledger,
        sheets,
        http,
    );
    let mut state = BotState::default();

    let mut gw = gateway::connect(GatewayConfig {
        token: config.discord_token.clone(),
        intents: gateway_intents(),
    });

    info!(
        spreadsheet_id = %config.spreadsheet_id,
        sheet = %config.sheet_name,
        "gateway connected, entering event loop"
    );

    while let Some(event) = gw.events.recv().await {
        match event {
            GatewayEvent::Ready(ready) => {
                handlers::on_ready(&ctx, &mut state, ready).await;
            }

            GatewayEvent::Resumed => {
                info!("gateway session resumed");
            }

            GatewayEvent::InteractionCreate(interaction) => {
                if let Err(e) = handlers::on_interaction(&ctx, &interaction).await {
                    error!(
                        interaction_id = %interaction.id,
                        error = %e,
                        "failed to handle interaction"
                    );
                }
            }

            // Reconnect / InvalidSession are handled inside the gateway driver.
            GatewayEvent::HeartbeatAck
            | GatewayEvent::HeartbeatRequest
            | GatewayEvent::Reconnect
            | GatewayEvent::InvalidSession(_) => {}

            GatewayEvent::Unknown {
                event_name: Some(ref name),
                ..
            } => {
                tracing::trace!(event = %name, "unhandled gateway event");
            }

            GatewayEvent::Unknown { .. } => {}
        }
    }

    warn!(
        open_sessions = ctx.ledger.len().await,
        "event stream ended, bot shutting down"
    );
    if let Err(e) = gw.driver.await {
        warn!(error = %e, "gateway driver task failed");
    }
    Ok(())
}
