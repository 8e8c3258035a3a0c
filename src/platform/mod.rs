pub(crate) mod pathway;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub use pathway::Pathway;

pub const DEFAULT_API_BASE: &str = "https://api.bland.ai/v1";
pub const DEFAULT_CHAT_BASE: &str = "https://us.api.bland.ai/v1";

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Failed to {action}")]
    Http {
        action: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Platform reported errors while trying to {action}: {errors}")]
    Rejected { action: &'static str, errors: String },
    #[error("Unexpected platform response while trying to {action}")]
    Decode {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// One response of the pathway engine to a chat message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformReply {
    #[serde(default, deserialize_with = "null_as_default")]
    pub assistant_responses: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variables: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completed: bool,
    #[serde(default)]
    pub current_node_name: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The conversation surface of the pathway platform.
pub trait Platform {
    async fn create_chat(&self, pathway_id: &str) -> Result<String, PlatformError>;

    /// `None` asks the pathway for its opening line.
    async fn send_message(
        &self,
        chat_id: &str,
        message: Option<&str>,
    ) -> Result<PlatformReply, PlatformError>;
}

#[derive(Deserialize)]
struct CreatedChat {
    chat_id: String,
}

#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    chat_base: String,
}

/// Mirrors how the platform signals failure: a truthy `errors` field.
fn reported_errors(body: &Value) -> Option<String> {
    match body.get("errors")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(text) if text.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(fields) if fields.is_empty() => None,
        errors => Some(errors.to_string()),
    }
}

fn take_data(body: &mut Value) -> Value {
    body.get_mut("data").map(Value::take).unwrap_or_default()
}

fn decode<T: DeserializeOwned>(action: &'static str, value: Value) -> Result<T, PlatformError> {
    serde_json::from_value(value).map_err(|source| PlatformError::Decode { action, source })
}

impl PlatformClient {
    pub fn new(api_key: &str, api_base: &str, chat_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_owned(),
            api_base: api_base.trim_end_matches('/').to_owned(),
            chat_base: chat_base.trim_end_matches('/').to_owned(),
        }
    }

    async fn send(
        &self,
        action: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, PlatformError> {
        let body: Value = request
            .header("authorization", &self.api_key)
            .send()
            .await
            .map_err(|source| PlatformError::Http { action, source })?
            .error_for_status()
            .map_err(|source| PlatformError::Http { action, source })?
            .json()
            .await
            .map_err(|source| PlatformError::Http { action, source })?;

        if let Some(errors) = reported_errors(&body) {
            return Err(PlatformError::Rejected { action, errors });
        }

        Ok(body)
    }

    /// Fetches the full pathway definition (nodes and their variables).
    pub async fn fetch_pathway(&self, pathway_id: &str) -> Result<Pathway, PlatformError> {
        const ACTION: &str = "fetch pathway";

        let body = self
            .send(
                ACTION,
                self.http
                    .get(format!("{}/pathway/{pathway_id}", self.api_base)),
            )
            .await?;

        decode(ACTION, body)
    }
}

impl Platform for PlatformClient {
    async fn create_chat(&self, pathway_id: &str) -> Result<String, PlatformError> {
        const ACTION: &str = "create pathway chat";

        let mut body = self
            .send(
                ACTION,
                self.http
                    .post(format!("{}/pathway/chat/create", self.chat_base))
                    .json(&serde_json::json!({ "pathway_id": pathway_id })),
            )
            .await?;

        let created: CreatedChat = decode(ACTION, take_data(&mut body))?;
        tracing::debug!(chat_id = %created.chat_id, pathway_id, "created pathway chat");
        Ok(created.chat_id)
    }

    async fn send_message(
        &self,
        chat_id: &str,
        message: Option<&str>,
    ) -> Result<PlatformReply, PlatformError> {
        const ACTION: &str = "send pathway chat message";

        let payload = match message {
            Some(message) if !message.is_empty() => serde_json::json!({ "message": message }),
            _ => serde_json::json!({}),
        };

        let mut body = self
            .send(
                ACTION,
                self.http
                    .post(format!("{}/pathway/chat/{chat_id}", self.chat_base))
                    .json(&payload),
            )
            .await?;

        decode(ACTION, take_data(&mut body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn client(server: &mockito::ServerGuard) -> PlatformClient {
        PlatformClient::new("bland-key", &server.url(), &server.url())
    }

    #[tokio::test]
    async fn fetches_pathway_definition() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/pathway/abc")
            .match_header("authorization", "bland-key")
            .with_status(200)
            .with_body(
                json!({
                    "name": "Reception",
                    "nodes": [{"id": "n1", "type": "Default", "data": {"name": "Start"}}],
                    "errors": null
                })
                .to_string(),
            )
            .create_async()
            .await;

        let pathway = client(&server).fetch_pathway("abc").await.unwrap();

        assert_eq!(pathway.display_name(), "Reception");
        assert_eq!(pathway.nodes[0].name(), "Start");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn reported_errors_reject_the_request() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/pathway/missing")
            .with_status(200)
            .with_body(r#"{"errors": ["Pathway not found"]}"#)
            .create_async()
            .await;

        let error = client(&server).fetch_pathway("missing").await.unwrap_err();

        match error {
            PlatformError::Rejected { errors, .. } => {
                assert_eq!(errors, r#"["Pathway not found"]"#)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn creates_chat_and_sends_messages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/pathway/chat/create")
            .match_body(Matcher::Json(json!({"pathway_id": "abc"})))
            .with_status(200)
            .with_body(r#"{"data": {"chat_id": "chat-1"}, "errors": null}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/pathway/chat/chat-1")
            .match_body(Matcher::Json(json!({"message": "Hi there"})))
            .with_status(200)
            .with_body(
                json!({
                    "data": {
                        "assistant_responses": ["Hello! What's your name?"],
                        "variables": {"name": "Ada", "party_size": 4},
                        "completed": false,
                        "current_node_name": "Greeting",
                        "chat_history": []
                    },
                    "errors": []
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = client(&server);
        let chat_id = client.create_chat("abc").await.unwrap();
        let reply = client.send_message(&chat_id, Some("Hi there")).await.unwrap();

        assert_eq!(chat_id, "chat-1");
        assert_eq!(reply.assistant_responses, vec!["Hello! What's your name?"]);
        assert_eq!(reply.variables["party_size"], json!(4));
        assert_eq!(reply.current_node_name.as_deref(), Some("Greeting"));
        assert!(!reply.completed);
    }

    #[tokio::test]
    async fn opening_message_has_empty_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/pathway/chat/chat-1")
            .match_body(Matcher::Json(json!({})))
            .with_status(200)
            .with_body(r#"{"data": {"assistant_responses": ["Hi"]}}"#)
            .create_async()
            .await;

        let reply = client(&server).send_message("chat-1", None).await.unwrap();

        assert_eq!(reply.assistant_responses, vec!["Hi"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn null_reply_fields_read_as_empty() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/pathway/chat/chat-1")
            .with_status(200)
            .with_body(
                r#"{"data": {"assistant_responses": null, "variables": null, "completed": null, "current_node_name": null}}"#,
            )
            .create_async()
            .await;

        let reply = client(&server)
            .send_message("chat-1", Some("Hello?"))
            .await
            .unwrap();

        assert_eq!(reply, PlatformReply::default());
    }

    #[tokio::test]
    async fn http_failures_are_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/pathway/chat/create")
            .with_status(401)
            .create_async()
            .await;

        let error = client(&server).create_chat("abc").await.unwrap_err();

        assert!(matches!(error, PlatformError::Http { .. }));
    }
}
