use serde::{Deserialize, Serialize};

/// System prompt used when a caller asks for the `DEFAULT` starting message.
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling controls stored with a conversation and forwarded on every turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "one")]
    pub temperature: f64,
    #[serde(default = "one")]
    pub top_p: f64,
    #[serde(default)]
    pub freq_penalty: f64,
    #[serde(default)]
    pub pres_penalty: f64,
}

fn one() -> f64 {
    1.0
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            freq_penalty: 0.0,
            pres_penalty: 0.0,
        }
    }
}

/// Stored conversation document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "conversationID")]
    pub conversation_id: i64,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(
        rename = "startingSystemMessage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub starting_system_message: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// A fresh conversation seeded with its system message.
    pub fn start(conversation_id: i64, system_message: &str, sampling: SamplingParams) -> Self {
        Self {
            conversation_id,
            sampling,
            starting_system_message: Some(system_message.to_string()),
            messages: vec![Message::system(system_message)],
        }
    }
}

/// Stored permission record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "userID")]
    pub user_id: i64,
    #[serde(rename = "permLevel")]
    pub perm_level: i64,
    #[serde(rename = "dailyLimit")]
    pub daily_limit: i64,
    #[serde(rename = "limitedAccess")]
    pub limited_access: bool,
}

/// Resolves the caller's starting system message. `DEFAULT` (any case) maps to
/// [`DEFAULT_SYSTEM_MESSAGE`].
pub fn resolve_system_message(requested: &str) -> &str {
    if requested.eq_ignore_ascii_case("default") {
        DEFAULT_SYSTEM_MESSAGE
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_system_message_is_case_insensitive() {
        assert_eq!(resolve_system_message("DEFAULT"), DEFAULT_SYSTEM_MESSAGE);
        assert_eq!(resolve_system_message("default"), DEFAULT_SYSTEM_MESSAGE);
        assert_eq!(resolve_system_message("Be terse."), "Be terse.");
    }

    #[test]
    fn started_conversation_opens_with_system_message() {
        let conv = Conversation::start(7, "Be terse.", SamplingParams::default());
        assert_eq!(conv.messages, vec![Message::system("Be terse.")]);
    }

    #[test]
    fn conversation_document_uses_stored_field_names() {
        let conv = Conversation::start(42, DEFAULT_SYSTEM_MESSAGE, SamplingParams::default());
        let json = serde_json::to_value(&conv).unwrap();
        assert_eq!(json["conversationID"], 42);
        assert_eq!(json["top_p"], 1.0);
        assert_eq!(json["pres_penalty"], 0.0);
        assert_eq!(json["messages"][0]["role"], "system");

        let back: Conversation = serde_json::from_value(json).unwrap();
        assert_eq!(back, conv);
    }

    #[test]
    fn missing_sampling_fields_take_schema_defaults() {
        let conv: Conversation =
            serde_json::from_str(r#"{"conversationID": 1, "messages": []}"#).unwrap();
        assert_eq!(conv.sampling, SamplingParams::default());
    }
}
