//! Event handlers for the session bot.
//!
//! Handlers are generic over [`SheetGateway`] and [`ChatApi`]: production
//! wires in the Google Sheets and Discord clients, tests wire in in-memory
//! fakes. Each handler returns a [`HandlerError`] for external-service
//! failures; user mistakes are answered with an ephemeral reply instead.

use tracing::{debug, error, info, warn};

use crate::bot::{BotState, Context};
use crate::config::CommandScope;
use crate::session::{
    self, column, SessionRecord, StartRejection, TeamRoster, ALREADY_HANDLED, END_BUTTON_LABEL,
    END_FAILED, END_NOT_SHOWN, END_RECORDED, END_SESSION_BUTTON_ID, MIN_PURPOSE_LEN, START_FAILED,
};
use crate::sheets::SheetGateway;
use crate::types::*;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub const START_COMMAND: &str = "start";
/// Wire name of the `team_name` option.
pub const TEAM_OPTION: &str = "사용팀명";
/// Wire name of the `usage_purpose` option.
pub const PURPOSE_OPTION: &str = "사용목적";

// ---------------------------------------------------------------------------
// Chat platform seam
// ---------------------------------------------------------------------------

/// The Discord REST calls the handlers make.
#[allow(async_fn_in_trait)]
pub trait ChatApi {
    /// Initial interaction callback.
    async fn respond(
        &self,
        interaction: &Interaction,
        response: &InteractionResponse,
    ) -> Result<(), HandlerError>;

    /// Edit the (possibly deferred) original response; returns the message.
    async fn edit_original_response(
        &self,
        interaction: &Interaction,
        edit: &EditMessage,
    ) -> Result<Message, HandlerError>;

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        edit: &EditMessage,
    ) -> Result<Message, HandlerError>;

    async fn fetch_channel(&self, channel_id: &str) -> Result<Channel, HandlerError>;

    /// Overwrite the registered commands; returns how many are registered.
    async fn register_commands(
        &self,
        application_id: &str,
        scope: &CommandScope,
        commands: &[ApplicationCommand],
    ) -> Result<usize, HandlerError>;
}

// ---------------------------------------------------------------------------
// Slash command definitions
// ---------------------------------------------------------------------------

/// The commands to register with Discord.
pub fn slash_commands(roster: &TeamRoster) -> Vec<ApplicationCommand> {
    vec![ApplicationCommand::chat_input(START_COMMAND, "GPU 사용 시작!!")
        .option(
            ApplicationCommandOption::string(TEAM_OPTION, "팀명을 선택해주세요.")
                .string_choices(roster.teams()),
        )
        .option(
            ApplicationCommandOption::string(PURPOSE_OPTION, "GPU 사용 목적을 입력해주세요.")
                .min_length(MIN_PURPOSE_LEN as u16),
        )]
}

// ---------------------------------------------------------------------------
// READY handler
// ---------------------------------------------------------------------------

/// Records identity and registers slash commands once per process.
pub async fn on_ready<G, C: ChatApi>(ctx: &Context<G, C>, state: &mut BotState, ready: ReadyEvent) {
    info!(user = %ready.user.tag(), guilds = ready.guilds.len(), "bot is ready!");

    let app_id = ready.application.id;
    state.application_id = Some(app_id.clone());

    if state.commands_registered {
        return;
    }

    let cmds = slash_commands(&ctx.access.roster);
    match ctx
        .chat
        .register_commands(&app_id, &ctx.command_scope, &cmds)
        .await
    {
        Ok(count) => {
            info!(count, scope = ?ctx.command_scope, "registered slash commands");
            state.commands_registered = true;
        }
        Err(e) => {
            warn!(error = %e, "failed to register slash commands");
        }
    }
}

// ---------------------------------------------------------------------------
// INTERACTION_CREATE handler
// ---------------------------------------------------------------------------

/// Top-level interaction dispatcher.
pub async fn on_interaction<G: SheetGateway, C: ChatApi>(
    ctx: &Context<G, C>,
    interaction: &Interaction,
) -> Result<(), HandlerError> {
    match interaction.kind {
        InteractionType::ApplicationCommand => {
            let name = interaction
                .data
                .as_ref()
                .and_then(|d| d.name.as_deref())
                .ok_or("missing interaction data")?;
            if name == START_COMMAND {
                handle_start_command(ctx, interaction).await
            } else {
                info!(command = name, "unknown slash command");
                ctx.chat
                    .respond(
                        interaction,
                        &ephemeral_response(format!("알 수 없는 명령어입니다: /{}", name)),
                    )
                    .await
            }
        }
        InteractionType::MessageComponent => {
            let custom_id = interaction
                .data
                .as_ref()
                .and_then(|d| d.custom_id.as_deref())
                .ok_or("missing interaction data")?;
            if custom_id == END_SESSION_BUTTON_ID {
                handle_end_button(ctx, interaction).await
            } else {
                debug!(custom_id, "ignoring component interaction");
                Ok(())
            }
        }
        InteractionType::Ping => {
            let resp = InteractionResponse {
                kind: InteractionCallbackType::Pong,
                data: None,
            };
            ctx.chat.respond(interaction, &resp).await
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// /start
// ---------------------------------------------------------------------------

/// Open a session: write its row, post the summary with an end button, and
/// remember which row the posted message belongs to.
pub async fn handle_start_command<G: SheetGateway, C: ChatApi>(
    ctx: &Context<G, C>,
    interaction: &Interaction,
) -> Result<(), HandlerError> {
    let data = interaction.data.as_ref().ok_or("missing interaction data")?;
    let username = interaction.author().map(|u| u.username.as_str());

    let checked = match check_placement(ctx, interaction, username).await {
        Ok(()) => validate_start(&ctx.access.roster, data),
        Err(rejection) => Err(rejection),
    };
    let (team, purpose) = match checked {
        Ok(fields) => fields,
        Err(rejection) => {
            info!(user = ?username, reason = %rejection, "start request rejected");
            return ctx
                .chat
                .respond(interaction, &ephemeral_response(rejection.to_string()))
                .await;
        }
    };

    // Sheet writes can outlast the interaction deadline.
    ctx.chat.respond(interaction, &deferred_response(false)).await?;

    let record = SessionRecord::open(team, session::now_timestamp(), purpose);
    if let Err(e) = open_session(ctx, interaction, &record).await {
        let notice = EditMessage::new().content(START_FAILED);
        if let Err(notice_err) = ctx.chat.edit_original_response(interaction, &notice).await {
            warn!(error = %notice_err, "failed to post start failure notice");
        }
        return Err(e);
    }
    Ok(())
}

async fn open_session<G: SheetGateway, C: ChatApi>(
    ctx: &Context<G, C>,
    interaction: &Interaction,
    record: &SessionRecord,
) -> Result<(), HandlerError> {
    let row = ctx.sheets.append_row(&record.to_row()).await?;

    let summary = EditMessage::new()
        .content(session::format_started(record))
        .component_row(action_row(vec![button(
            ButtonStyle::Primary,
            END_BUTTON_LABEL,
            END_SESSION_BUTTON_ID,
        )]));
    let message = ctx.chat.edit_original_response(interaction, &summary).await?;

    ctx.ledger.insert(&message.id, row).await?;
    info!(
        team = %record.team_name,
        row,
        message_id = %message.id,
        "session started"
    );
    Ok(())
}

/// The allowed channel only, unless the user is the administrator.
async fn check_placement<G, C: ChatApi>(
    ctx: &Context<G, C>,
    interaction: &Interaction,
    username: Option<&str>,
) -> Result<(), StartRejection> {
    if ctx.access.is_admin(username) {
        return Ok(());
    }
    let name = channel_name(&ctx.chat, interaction).await;
    if ctx.access.allows_channel(name.as_deref()) {
        Ok(())
    } else {
        Err(StartRejection::WrongChannel {
            required: ctx.access.allowed_channel.clone(),
        })
    }
}

/// Name of the invoking channel: embedded in the interaction, else fetched.
async fn channel_name<C: ChatApi>(chat: &C, interaction: &Interaction) -> Option<String> {
    if let Some(name) = interaction.channel.as_ref().and_then(|c| c.name.clone()) {
        return Some(name);
    }
    let channel_id = interaction.channel_id.as_deref()?;
    match chat.fetch_channel(channel_id).await {
        Ok(channel) => channel.name,
        Err(e) => {
            warn!(channel_id, error = %e, "could not fetch invoking channel");
            None
        }
    }
}

fn validate_start<'a>(
    roster: &TeamRoster,
    data: &'a InteractionData,
) -> Result<(&'a str, &'a str), StartRejection> {
    let team = data
        .option_str(TEAM_OPTION)
        .ok_or(StartRejection::MissingOption(TEAM_OPTION))?;
    if !roster.contains(team) {
        return Err(StartRejection::UnknownTeam(team.to_string()));
    }
    let purpose = data
        .option_str(PURPOSE_OPTION)
        .ok_or(StartRejection::MissingOption(PURPOSE_OPTION))?;
    let purpose = session::validate_purpose(purpose)?;
    Ok((team, purpose))
}

// ---------------------------------------------------------------------------
// End button
// ---------------------------------------------------------------------------

/// Close the session behind the pressed button.
pub async fn handle_end_button<G: SheetGateway, C: ChatApi>(
    ctx: &Context<G, C>,
    interaction: &Interaction,
) -> Result<(), HandlerError> {
    let message = interaction
        .message
        .as_ref()
        .ok_or("component interaction without a message")?;
    let message_id = message.id.as_str();

    let row = match ctx.ledger.lookup_and_remove(message_id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            info!(message_id, "end pressed on a closed or unknown session");
            return ctx
                .chat
                .respond(interaction, &ephemeral_response(ALREADY_HANDLED))
                .await;
        }
        Err(e) => {
            // The entry is still in the ledger, so pressing again can work.
            if let Err(notice_err) = ctx
                .chat
                .respond(interaction, &ephemeral_response(END_FAILED))
                .await
            {
                warn!(error = %notice_err, "failed to post end failure notice");
            }
            return Err(e.into());
        }
    };

    if let Err(e) = ctx.chat.respond(interaction, &deferred_response(true)).await {
        restore_entry(ctx, message_id, row).await;
        return Err(e);
    }

    let end_time = session::now_timestamp();
    if let Err(e) = ctx.sheets.update_cell(row, column::END_TIME, &end_time).await {
        restore_entry(ctx, message_id, row).await;
        let notice = EditMessage::new().content(END_FAILED);
        if let Err(notice_err) = ctx.chat.edit_original_response(interaction, &notice).await {
            warn!(error = %notice_err, "failed to post end failure notice");
        }
        return Err(e.into());
    }

    // From here on the end time is recorded; the entry stays removed.
    let record = match finish_session_message(ctx, message, row).await {
        Ok(record) => record,
        Err(e) => {
            let notice = EditMessage::new().content(END_NOT_SHOWN);
            if let Err(notice_err) = ctx.chat.edit_original_response(interaction, &notice).await {
                warn!(error = %notice_err, "failed to post end notice");
            }
            return Err(e);
        }
    };

    ctx.chat
        .edit_original_response(interaction, &EditMessage::new().content(END_RECORDED))
        .await?;

    info!(
        team = %record.team_name,
        row,
        message_id,
        end_time = %end_time,
        "session ended"
    );
    Ok(())
}

/// Read the closed row back and rewrite the session message with it.
async fn finish_session_message<G: SheetGateway, C: ChatApi>(
    ctx: &Context<G, C>,
    message: &Message,
    row: u32,
) -> Result<SessionRecord, HandlerError> {
    let record = SessionRecord::from_row(&ctx.sheets.read_row(row).await?);
    let finished = EditMessage::new()
        .content(session::format_finished(&record))
        .clear_components();
    ctx.chat
        .edit_message(&message.channel_id, &message.id, &finished)
        .await?;
    Ok(record)
}

/// Put a removed entry back so the session can still be closed.
async fn restore_entry<G, C>(ctx: &Context<G, C>, message_id: &str, row: u32) {
    match ctx.ledger.insert(message_id, row).await {
        Ok(()) => info!(message_id, row, "ledger entry restored after failure"),
        Err(e) => error!(message_id, row, error = %e, "failed to restore ledger entry"),
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// A message only the invoking user sees.
fn ephemeral_response(text: impl Into<String>) -> InteractionResponse {
    InteractionResponse {
        kind: InteractionCallbackType::ChannelMessageWithSource,
        data: Some(InteractionCallbackData {
            content: Some(text.into()),
            flags: Some(MessageFlags::EPHEMERAL.bits()),
            ..Default::default()
        }),
    }
}

/// "Bot is thinking…" acknowledgement, edited later.
fn deferred_response(ephemeral: bool) -> InteractionResponse {
    InteractionResponse {
        kind: InteractionCallbackType::DeferredChannelMessageWithSource,
        data: ephemeral.then(|| InteractionCallbackData {
            flags: Some(MessageFlags::EPHEMERAL.bits()),
            ..Default::default()
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
