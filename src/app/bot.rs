use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::adapters::telegram::{InlineKeyboardMarkup, TelegramClient, Update};
use crate::app::commands::PowerCommands;
use crate::app::messages::{
    HELP_TEXT, WELCOME_TEXT, history_keyboard, main_keyboard, render_fix, render_history,
    render_status,
};

const LONG_POLL_SECS: u64 = 10;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Status,
    History { page: u32 },
    Fix,
}

impl BotCommand {
    /// Parses `/command [arg]`, tolerating the `@botname` suffix group chats add.
    pub fn parse_text(text: &str) -> Option<Self> {
        let mut words = text.split_whitespace();
        let head = words.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head);

        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "help" => Some(Self::Help),
            "status" => Some(Self::Status),
            "history" => Some(Self::History {
                page: parse_page(words.next()),
            }),
            "fix" => Some(Self::Fix),
            _ => None,
        }
    }

    pub fn parse_callback(data: &str) -> Option<Self> {
        let (name, arg) = match data.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (data, None),
        };

        match name {
            "status" => Some(Self::Status),
            "history" => Some(Self::History {
                page: parse_page(arg),
            }),
            "fix" => Some(Self::Fix),
            "help" => Some(Self::Help),
            _ => None,
        }
    }
}

fn parse_page(raw: Option<&str>) -> u32 {
    raw.and_then(|value| value.parse::<u32>().ok())
        .filter(|page| *page > 0)
        .unwrap_or(1)
}

#[derive(Debug, PartialEq, Eq)]
struct Incoming {
    chat_id: i64,
    command: Option<BotCommand>,
    callback_id: Option<String>,
}

fn incoming(update: Update) -> Option<Incoming> {
    if let Some(callback) = update.callback_query {
        return Some(Incoming {
            chat_id: callback.message?.chat.id,
            command: callback.data.as_deref().and_then(BotCommand::parse_callback),
            callback_id: Some(callback.id),
        });
    }

    let message = update.message?;
    Some(Incoming {
        chat_id: message.chat.id,
        command: BotCommand::parse_text(message.text.as_deref()?),
        callback_id: None,
    })
}

struct Reply {
    text: String,
    markdown: bool,
    keyboard: InlineKeyboardMarkup,
}

fn respond(commands: &PowerCommands, command: BotCommand) -> Reply {
    let result = match command {
        BotCommand::Start => Ok((WELCOME_TEXT.to_string(), main_keyboard())),
        BotCommand::Help => Ok((HELP_TEXT.to_string(), main_keyboard())),
        BotCommand::Status => commands
            .status()
            .map(|report| (render_status(&report), main_keyboard())),
        BotCommand::History { page } => commands.history(page).map(|history| {
            (
                render_history(&history),
                history_keyboard(history.page, history.page_count),
            )
        }),
        BotCommand::Fix => commands
            .fix()
            .map(|outcome| (render_fix(&outcome), main_keyboard())),
    };

    match result {
        Ok((text, keyboard)) => Reply {
            text,
            markdown: true,
            keyboard,
        },
        Err(error) => {
            tracing::warn!(?command, error = %error, "bot command failed");
            Reply {
                text: format!("Command failed: {error}"),
                markdown: false,
                keyboard: main_keyboard(),
            }
        }
    }
}

/// Long-polls `getUpdates` until `stop` is raised. Updates from any chat
/// other than `chat_id` are ignored.
pub fn start_bot(
    client: TelegramClient,
    commands: PowerCommands,
    chat_id: i64,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("telegram-bot".to_string())
        .spawn(move || {
            let mut offset = None;
            while !stop.load(Ordering::Relaxed) {
                match client.get_updates(offset, LONG_POLL_SECS) {
                    Ok(updates) => {
                        for update in updates {
                            offset = Some(update.update_id + 1);
                            handle_update(&client, &commands, chat_id, update);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "telegram poll failed");
                        thread::sleep(ERROR_BACKOFF);
                    }
                }
            }
            tracing::info!("telegram bot stopped");
        })
}

fn handle_update(
    client: &TelegramClient,
    commands: &PowerCommands,
    chat_id: i64,
    update: Update,
) {
    let update_id = update.update_id;
    let Some(incoming) = incoming(update) else {
        return;
    };

    if incoming.chat_id != chat_id {
        tracing::warn!(update_id, chat_id = incoming.chat_id, "ignoring update from unknown chat");
        return;
    }

    if let Some(command) = incoming.command {
        tracing::info!(update_id, ?command, "bot command received");
        let reply = respond(commands, command);
        if let Err(error) = client.send_message(&reply.text, reply.markdown, Some(&reply.keyboard)) {
            tracing::warn!(update_id, error = %error, "failed to send bot reply");
        }
    }

    if let Some(callback_id) = incoming.callback_id
        && let Err(error) = client.answer_callback_query(&callback_id)
    {
        tracing::debug!(update_id, error = %error, "failed to answer callback query");
    }
}
