use crate::messages::{Control, OutboundMessage};
use crate::services::Gateway;
use crate::types::{Destination, MessageHandle};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

const ACTION_ROW: u8 = 1;
const BUTTON: u8 = 2;
const STRING_SELECT: u8 = 3;
const BUTTON_STYLE_DANGER: u8 = 4;

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
}

/// Chat REST client speaking the Discord v10 message endpoints.
#[derive(Clone)]
pub struct ChatApi {
    client: Client,
    base_url: String,
    token: String,
}

impl ChatApi {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn messages_url(&self, channel_id: &str) -> String {
        format!("{}/channels/{}/messages", self.base_url, channel_id)
    }

    fn message_url(&self, handle: &MessageHandle) -> String {
        format!("{}/{}", self.messages_url(&handle.channel_id), handle.message_id)
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.token)
    }
}

fn render_control(control: &Control) -> Value {
    match control {
        Control::Select {
            custom_id,
            placeholder,
            options,
        } => json!({
            "type": STRING_SELECT,
            "custom_id": custom_id,
            "placeholder": placeholder,
            "options": options
                .iter()
                .map(|option| json!({
                    "label": option.label,
                    "value": option.value,
                    "emoji": { "name": option.emoji },
                }))
                .collect::<Vec<_>>(),
        }),
        Control::Button { custom_id, label } => json!({
            "type": BUTTON,
            "style": BUTTON_STYLE_DANGER,
            "custom_id": custom_id,
            "label": label,
        }),
    }
}

/// Request body for create and edit. An empty control list clears the
/// components of an edited message.
pub fn render(message: &OutboundMessage) -> Value {
    let components: Vec<Value> = message
        .controls
        .iter()
        .map(|control| json!({ "type": ACTION_ROW, "components": [render_control(control)] }))
        .collect();

    let mut body = json!({ "components": components });
    if let Some(content) = &message.content {
        body["content"] = json!(content);
    }
    if let Some(embed) = &message.embed {
        let mut rendered = json!({ "description": embed.description });
        if let Some(title) = &embed.title {
            rendered["title"] = json!(title);
        }
        body["embeds"] = json!([rendered]);
    }
    if let Some(reply_to) = &message.reply_to {
        body["message_reference"] = json!({
            "message_id": reply_to.message_id,
            "channel_id": reply_to.channel_id,
        });
    }
    body
}

impl Gateway for ChatApi {
    async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> Result<MessageHandle> {
        let response = self
            .client
            .post(self.messages_url(&destination.channel_id))
            .header("Authorization", self.authorization())
            .header("Content-Type", "application/json")
            .json(&render(&message))
            .send()
            .await
            .context("send chat message")?
            .error_for_status()
            .context("chat api rejected message")?;

        let created: CreatedMessage = response.json().await.context("decode chat message")?;
        Ok(MessageHandle {
            channel_id: destination.channel_id.clone(),
            message_id: created.id,
        })
    }

    async fn edit(&self, handle: &MessageHandle, message: OutboundMessage) -> Result<()> {
        self.client
            .patch(self.message_url(handle))
            .header("Authorization", self.authorization())
            .header("Content-Type", "application/json")
            .json(&render(&message))
            .send()
            .await
            .context("edit chat message")?
            .error_for_status()
            .context("chat api rejected edit")?;
        Ok(())
    }

    async fn retract(&self, handle: &MessageHandle) -> Result<()> {
        self.client
            .delete(self.message_url(handle))
            .header("Authorization", self.authorization())
            .send()
            .await
            .context("delete chat message")?
            .error_for_status()
            .context("chat api rejected delete")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages;
    use crate::testing::game_fixture;

    #[test]
    fn test_question_renders_select_row() {
        let body = render(&messages::question(&game_fixture("g1", "l1")));
        let row = &body["components"][0];
        assert_eq!(row["type"], 1);
        assert_eq!(row["components"][0]["type"], 3);
        assert_eq!(row["components"][0]["custom_id"], "quiz_game_g1");
        assert_eq!(row["components"][0]["options"][2]["value"], "3");
        assert!(body["embeds"][0]["title"].is_string());
        assert!(body.get("message_reference").is_none());
    }

    #[test]
    fn test_closed_question_clears_components() {
        let body = render(&messages::closed_question(&game_fixture("g1", "l1")));
        assert_eq!(body["components"], json!([]));
    }

    #[test]
    fn test_answer_references_question() {
        let mut game = game_fixture("g1", "l1");
        game.question_message_id = Some("m42".to_string());
        let body = render(&messages::answer(&game));
        assert_eq!(body["message_reference"]["message_id"], "m42");
        assert_eq!(body["components"][0]["components"][0]["style"], 4);
        assert!(body["embeds"][0].get("title").is_none());
    }

    #[test]
    fn test_urls() {
        let api = ChatApi::new("https://chat.example/api/v10/", "secret");
        let handle = MessageHandle {
            channel_id: "c1".to_string(),
            message_id: "m1".to_string(),
        };
        assert_eq!(api.messages_url("c1"), "https://chat.example/api/v10/channels/c1/messages");
        assert_eq!(api.message_url(&handle), "https://chat.example/api/v10/channels/c1/messages/m1");
        assert_eq!(api.authorization(), "Bot secret");
    }
}
