//! The relay's operations, independent of the HTTP layer.

use std::sync::Arc;

use log::{Level, debug, info};
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use uuid::Uuid;

use crate::api::CompletionClient;
use crate::config::AppConfig;
use crate::conversation::{self, Conversation, Message, SamplingParams, User};
use crate::error::{RelayError, RelayResult};
use crate::locks::ConversationLocks;
use crate::models;
use crate::store::{Store, StoreError};
use crate::tokenizer::{self, TokenCounter};
use crate::webhook::Notifier;

const UNKNOWN_USER: &str = "Failed to authorize user from cluster.";
const RELAY_FAILED: &str = "Error in calling the OpenAI API.";
const REPLY_NOT_STORED: &str = "Failed to add message to current conversation";

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterUserRequest {
    #[serde(rename = "userID")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub user_id: i64,
    #[serde(rename = "permLevel")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub perm_level: i64,
    #[serde(rename = "dailyLimit")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub daily_limit: i64,
    #[serde(rename = "limitedAccess", deserialize_with = "deserialize_flag")]
    pub limited_access: bool,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct RemoveUserRequest {
    #[serde(rename = "userID")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub user_id: i64,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ValidateConversationRequest {
    #[serde(rename = "convID")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub conversation_id: i64,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(rename = "userID")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub user_id: i64,
    #[serde(rename = "conversationID")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub conversation_id: i64,
    pub message: String,
    #[serde(rename = "startingSystemMessage", default = "default_system_request")]
    pub starting_system_message: String,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub temperature: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub top_p: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub freq_penalty: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub pres_penalty: Option<f64>,
}

impl ChatCompletionRequest {
    /// Sampling values with defaults filled in. Non-finite values are refused:
    /// they cannot be stored as JSON numbers.
    fn sampling(&self) -> RelayResult<SamplingParams> {
        let defaults = SamplingParams::default();
        Ok(SamplingParams {
            temperature: finite("temperature", self.temperature, defaults.temperature)?,
            top_p: finite("top_p", self.top_p, defaults.top_p)?,
            freq_penalty: finite("freq_penalty", self.freq_penalty, defaults.freq_penalty)?,
            pres_penalty: finite("pres_penalty", self.pres_penalty, defaults.pres_penalty)?,
        })
    }
}

fn finite(name: &str, value: Option<f64>, default: f64) -> RelayResult<f64> {
    let value = value.unwrap_or(default);
    if !value.is_finite() {
        return Err(RelayError::Validation(format!(
            "invalid request body: {name} must be a finite number"
        )));
    }
    Ok(value)
}

fn default_system_request() -> String {
    "DEFAULT".to_string()
}

/// Accepts `true`/`false` or a string, where only `"true"` (any case) is true.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Text(text) => text.trim().eq_ignore_ascii_case("true"),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub message_content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

pub struct Relay {
    config: Arc<AppConfig>,
    store: Arc<dyn Store>,
    counter: Arc<dyn TokenCounter>,
    client: CompletionClient,
    notifier: Notifier,
    locks: ConversationLocks,
}

impl Relay {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn Store>,
        counter: Arc<dyn TokenCounter>,
        client: CompletionClient,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            store,
            counter,
            client,
            notifier,
            locks: ConversationLocks::default(),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Checks a caller-supplied token against the shared secret. Refusals are
    /// reported with the caller's origin.
    pub fn authorize(&self, token: Option<&str>, origin: &str) -> RelayResult<()> {
        if token == Some(self.config.auth_token.as_str()) {
            return Ok(());
        }
        self.notifier.notify(
            Level::Warn,
            format!("failed authorization attempt from {origin}"),
        );
        Err(RelayError::Unauthorized)
    }

    pub async fn register_user(&self, req: RegisterUserRequest) -> RelayResult<String> {
        let user = User {
            user_id: req.user_id,
            perm_level: req.perm_level,
            daily_limit: req.daily_limit,
            limited_access: req.limited_access,
        };
        if !self.store.create_user(&user).await? {
            debug!("User {} already registered", user.user_id);
            return Ok("User was already registered.".to_string());
        }
        self.notifier.notify(
            Level::Info,
            format!("Created user with User ID {}", user.user_id),
        );
        Ok("User registered".to_string())
    }

    pub async fn remove_user(&self, req: RemoveUserRequest) -> RelayResult<String> {
        if !self.store.delete_user(req.user_id).await? {
            return Err(RelayError::NotFound("No such user found.".to_string()));
        }
        self.notifier.notify(
            Level::Info,
            format!("Deleted user with user ID {}", req.user_id),
        );
        Ok("User deleted".to_string())
    }

    pub async fn validate_conversation(
        &self,
        req: ValidateConversationRequest,
    ) -> RelayResult<String> {
        let exists = self
            .store
            .find_conversation(req.conversation_id)
            .await?
            .is_some();
        Ok(if exists { "yes" } else { "no" }.to_string())
    }

    /// Appends the caller's turn, trims the history to the token budget,
    /// relays it to the user's model and stores the reply.
    pub async fn chat_completion(&self, req: ChatCompletionRequest) -> RelayResult<ChatReply> {
        let turn = Uuid::new_v4();
        let conversation_id = req.conversation_id;
        info!(
            "[turn {}] chat completion for user {} on conversation {}",
            turn, req.user_id, conversation_id
        );

        let sampling = req.sampling()?;
        let user = self
            .store
            .find_user(req.user_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(UNKNOWN_USER.to_string()))?;

        let system_message = conversation::resolve_system_message(&req.starting_system_message);
        let _guard = self.locks.lock(conversation_id).await;

        let seed = Conversation::start(conversation_id, system_message, sampling);
        if self.store.create_conversation(&seed).await? {
            info!("[turn {}] created conversation {}", turn, conversation_id);
        }

        let mut conversation = self
            .store
            .find_conversation(conversation_id)
            .await?
            .ok_or(StoreError::MissingConversation(conversation_id))?;
        conversation.messages.push(Message::user(req.message));
        let removed = tokenizer::trim_messages(
            &mut conversation.messages,
            0,
            self.config.token_budget,
            self.counter.as_ref(),
        );
        if removed > 0 {
            info!(
                "[turn {}] dropped {} oldest message(s) to fit {} tokens",
                turn, removed, self.config.token_budget
            );
        }
        self.store
            .update_messages(conversation_id, &conversation.messages)
            .await?;

        let model = models::select_model(&self.config.models, user.perm_level)
            .ok_or_else(|| RelayError::Validation(RELAY_FAILED.to_string()))?;

        let completion = self
            .client
            .complete(model, &conversation.messages, &conversation.sampling)
            .await
            .map_err(|err| RelayError::upstream(RELAY_FAILED, err))?;

        if let Err(err) = self
            .store
            .push_message(conversation_id, &completion.message)
            .await
        {
            self.notifier.notify(
                Level::Error,
                "[server] post-api: failed to add message to conversation",
            );
            return Err(RelayError::upstream(REPLY_NOT_STORED, err.into()));
        }

        info!(
            "[turn {}] reply stored ({} prompt / {} completion tokens)",
            turn, completion.prompt_tokens, completion.completion_tokens
        );
        Ok(ChatReply {
            message_content: completion.message.content,
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_accepts_string_flags_and_ids() {
        let req: RegisterUserRequest = serde_json::from_value(serde_json::json!({
            "userID": "123456789012345678",
            "permLevel": 2,
            "dailyLimit": "50",
            "limitedAccess": "TRUE"
        }))
        .unwrap();
        assert_eq!(req.user_id, 123456789012345678);
        assert_eq!(req.daily_limit, 50);
        assert!(req.limited_access);

        let req: RegisterUserRequest = serde_json::from_value(serde_json::json!({
            "userID": 1, "permLevel": 1, "dailyLimit": 5, "limitedAccess": "nope"
        }))
        .unwrap();
        assert!(!req.limited_access);

        let req: RegisterUserRequest = serde_json::from_value(serde_json::json!({
            "userID": 1, "permLevel": 1, "dailyLimit": 5, "limitedAccess": true
        }))
        .unwrap();
        assert!(req.limited_access);
    }

    #[test]
    fn chat_request_defaults() {
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "userID": 1,
            "conversationID": 2,
            "message": "hi",
            "temperature": "0.5"
        }))
        .unwrap();
        assert_eq!(req.starting_system_message, "DEFAULT");
        let sampling = req.sampling().unwrap();
        assert_eq!(sampling.temperature, 0.5);
        assert_eq!(sampling.top_p, 1.0);
        assert_eq!(sampling.pres_penalty, 0.0);
    }

    #[test]
    fn non_finite_sampling_values_are_refused() {
        for (field, raw) in [("temperature", "NaN"), ("top_p", "inf"), ("pres_penalty", "-inf")] {
            let mut body = serde_json::json!({"userID": 1, "conversationID": 2, "message": "hi"});
            body[field] = serde_json::json!(raw);
            let req: ChatCompletionRequest = serde_json::from_value(body).unwrap();
            assert!(
                matches!(req.sampling(), Err(RelayError::Validation(_))),
                "{field} = {raw}"
            );
        }
    }

    #[test]
    fn reply_serializes_camel_case() {
        let reply = ChatReply {
            message_content: "hi".into(),
            prompt_tokens: 3,
            completion_tokens: 1,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"messageContent": "hi", "promptTokens": 3, "completionTokens": 1})
        );
    }
}
