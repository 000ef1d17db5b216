use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::JsonClient;
use crate::error::{PosmapError, Result};
use crate::settings::RemoteSettings;

/// Instruction-following model used to adjudicate account matches.
pub trait ChatModel {
    /// Free-text reply to a single-turn prompt. An empty string means the
    /// service answered but said nothing usable.
    fn complete(&self, prompt: &str) -> Result<String>;
}

pub struct HttpChatModel {
    client: JsonClient,
    model: String,
}

impl HttpChatModel {
    pub fn new(settings: &RemoteSettings) -> Result<Self> {
        Ok(Self {
            client: JsonClient::new(settings)?,
            model: settings.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f64,
    max_tokens: u32,
}

impl ChatModel for HttpChatModel {
    fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
            max_tokens: 128,
        };
        match self.client.post::<_, Value>("chat/completions", &request) {
            Ok(resp) => Ok(reply_text(&resp)),
            // A body that is not JSON is an unusable answer, not an outage.
            Err(PosmapError::Http(e)) if e.is_decode() => {
                warn!(error = %e, "unreadable chat response");
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }
}

/// Pull the reply out of a chat response, tolerating both the
/// `choices[0].message.content` and the `content[0].text` shapes.
fn reply_text(resp: &Value) -> String {
    resp.pointer("/choices/0/message/content")
        .or_else(|| resp.pointer("/content/0/text"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
