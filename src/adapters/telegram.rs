use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::messages::{main_keyboard, render_event};
use crate::app::notifier::{Notifier, NotifierError};
use crate::domain::models::PowerEvent;

/// Must outlive the long-poll timeout passed to `getUpdates`.
const HTTP_TIMEOUT: Duration = Duration::from_secs(40);

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("telegram api rejected {method}: {description}")]
    Api { method: String, description: String },
}

impl TelegramError {
    // Request URLs carry the bot token; strip them before the error is logged.
    fn http(error: reqwest::Error) -> Self {
        Self::Http(error.without_url())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

impl InlineKeyboardMarkup {
    pub fn new(rows: Vec<Vec<InlineKeyboardButton>>) -> Self {
        Self {
            inline_keyboard: rows,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

impl InlineKeyboardButton {
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: Some(data.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<&'a InlineKeyboardMarkup>,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: [&'static str; 2],
}

#[derive(Debug, Serialize)]
struct AnswerCallbackQuery<'a> {
    callback_query_id: &'a str,
}

/// Blocking Bot API client bound to the one chat this monitor reports to.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::blocking::Client,
    base_url: String,
    chat_id: String,
}

impl TelegramClient {
    pub fn new(api_url: &str, bot_token: &str, chat_id: &str) -> Result<Self, TelegramError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(TelegramError::http)?;

        Ok(Self {
            http,
            base_url: format!("{}/bot{bot_token}", api_url.trim_end_matches('/')),
            chat_id: chat_id.to_string(),
        })
    }

    pub fn send_message(
        &self,
        text: &str,
        markdown: bool,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<(), TelegramError> {
        let _: serde_json::Value = self.call(
            "sendMessage",
            &SendMessage {
                chat_id: &self.chat_id,
                text,
                parse_mode: markdown.then_some("Markdown"),
                reply_markup: keyboard,
            },
        )?;
        Ok(())
    }

    pub fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            &GetUpdates {
                offset,
                timeout: timeout_secs,
                allowed_updates: ["message", "callback_query"],
            },
        )
    }

    pub fn answer_callback_query(&self, callback_query_id: &str) -> Result<(), TelegramError> {
        let _: bool = self.call(
            "answerCallbackQuery",
            &AnswerCallbackQuery { callback_query_id },
        )?;
        Ok(())
    }

    fn call<B, T>(&self, method: &str, body: &B) -> Result<T, TelegramError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let response: ApiResponse<T> = self
            .http
            .post(format!("{}/{method}", self.base_url))
            .json(body)
            .send()
            .map_err(TelegramError::http)?
            .json()
            .map_err(TelegramError::http)?;

        into_result(method, response)
    }
}

fn into_result<T>(method: &str, response: ApiResponse<T>) -> Result<T, TelegramError> {
    match response {
        ApiResponse {
            ok: true,
            result: Some(result),
            ..
        } => Ok(result),
        ApiResponse { description, .. } => Err(TelegramError::Api {
            method: method.to_string(),
            description: description.unwrap_or_else(|| "no description".to_string()),
        }),
    }
}

impl Notifier for TelegramClient {
    fn notify(&self, event: &PowerEvent) -> Result<(), NotifierError> {
        self.send_message(&render_event(event), true, Some(&main_keyboard()))
            .map_err(|error| NotifierError::Delivery(error.to_string()))
    }
}
