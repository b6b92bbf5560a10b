use crate::config::{Config, LLMConfig};
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

pub const FAILURE_MARKER: &str = "❌ Fehler: ";
pub const UNKNOWN_ERROR: &str = "Unbekannter Fehler";
pub const NO_ANSWER: &str = "Keine Antwort erhalten.";

/// Body of one chat-completions call carrying a single image.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    ImageUrl { image_url: ImageUrl },
    Text { text: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl AnalysisRequest {
    pub fn new(config: &Config, image_base64: &str) -> Self {
        Self {
            model: config.llm.model.clone(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: MessageContent::Text(config.prompts.system.clone()),
                },
                ChatMessage {
                    role: Role::User,
                    content: MessageContent::Parts(vec![
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: jpeg_data_uri(image_base64),
                            },
                        },
                        ContentPart::Text {
                            text: config.prompts.user.clone(),
                        },
                    ]),
                },
            ],
            max_tokens: config.llm.max_tokens,
        }
    }
}

pub fn jpeg_data_uri(image_base64: &str) -> String {
    format!("data:image/jpeg;base64,{}", image_base64)
}

/// Status and body as received, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request and hands back whatever came back.
///
/// An `Err` means no usable response arrived at all (connection failure,
/// missing credential, unreadable body); HTTP error statuses are `Ok`.
pub trait Dispatcher {
    fn dispatch(&self, request: &AnalysisRequest) -> impl Future<Output = Result<RawResponse>>;
}

/// What the user ends up seeing for one analyze action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisResult {
    Answer(String),
    ApiError(String),
    TransportError(String),
}

impl AnalysisResult {
    pub fn is_error(&self) -> bool {
        !matches!(self, AnalysisResult::Answer(_))
    }

    pub fn display_text(&self) -> String {
        match self {
            AnalysisResult::Answer(text) => text.clone(),
            AnalysisResult::ApiError(message) | AnalysisResult::TransportError(message) => {
                format!("{}{}", FAILURE_MARKER, message)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CompletionBody {
    error: Option<ErrorBody>,
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Project a raw response into the result shown to the user.
pub fn interpret(response: &RawResponse) -> AnalysisResult {
    if !response.is_success() {
        let body: CompletionBody = serde_json::from_str(&response.body).unwrap_or_default();
        tracing::error!(status = response.status, body = %response.body, "Model API returned an error");
        let message = body
            .error
            .and_then(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| UNKNOWN_ERROR.to_string());
        return AnalysisResult::ApiError(message);
    }

    let body: CompletionBody = match serde_json::from_str(&response.body) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "Model API response is not valid JSON");
            return AnalysisResult::TransportError(format!("Ungültige Antwort: {}", e));
        }
    };

    let content = body
        .choices
        .and_then(|choices| choices.into_iter().next())
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .filter(|content| !content.is_empty())
        .unwrap_or_else(|| NO_ANSWER.to_string());
    AnalysisResult::Answer(content)
}

/// `reqwest`-backed dispatcher talking to an OpenAI-compatible endpoint.
pub struct LLMClient {
    config: LLMConfig,
    client: Client,
}

impl LLMClient {
    pub fn new(config: LLMConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(secs) = config.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self { config, client })
    }

    async fn send(&self, request: &AnalysisRequest) -> Result<RawResponse> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow!("OpenAI API key not provided (set OPENAI_API_KEY)"))?;
        let endpoint = self.config.endpoint();

        tracing::debug!(
            model = %request.model,
            %endpoint,
            max_tokens = request.max_tokens,
            "Dispatching analysis request"
        );

        let response = self
            .client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", endpoint))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        tracing::debug!(status, bytes = body.len(), "Received analysis response");
        Ok(RawResponse { status, body })
    }
}

impl Dispatcher for LLMClient {
    async fn dispatch(&self, request: &AnalysisRequest) -> Result<RawResponse> {
        self.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(body: &str) -> RawResponse {
        RawResponse {
            status: 200,
            body: body.to_string(),
        }
    }

    fn failed(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_request_body_shape() {
        let request = AnalysisRequest::new(&Config::default(), "QUJD");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "gpt-4-vision-preview");
        assert_eq!(json["max_tokens"], 1000);
        assert_eq!(json["messages"][0]["role"], "system");
        assert!(json["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("DIN 18202"));
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"][0]["type"], "image_url");
        assert_eq!(
            json["messages"][1]["content"][0]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
        assert_eq!(json["messages"][1]["content"][1]["type"], "text");
        assert!(json["messages"][1]["content"][1]["text"]
            .as_str()
            .unwrap()
            .starts_with("Bitte überprüfe"));
    }

    #[test]
    fn test_request_uses_configured_prompts() {
        let mut config = Config::default();
        config.prompts.system = "sys".to_string();
        config.prompts.user = "usr".to_string();
        config.llm.max_tokens = 50;

        let json = serde_json::to_value(AnalysisRequest::new(&config, "x")).unwrap();
        assert_eq!(json["messages"][0]["content"], "sys");
        assert_eq!(json["messages"][1]["content"][1]["text"], "usr");
        assert_eq!(json["max_tokens"], 50);
    }

    #[test]
    fn test_success_answer() {
        let result = interpret(&ok(r#"{"choices":[{"message":{"content":"No defects found."}}]}"#));
        assert_eq!(result, AnalysisResult::Answer("No defects found.".to_string()));
        assert_eq!(result.display_text(), "No defects found.");
        assert!(!result.is_error());
    }

    #[test]
    fn test_answer_keeps_whitespace() {
        let result = interpret(&ok(
            r#"{"choices":[{"message":{"content":"1. Riss\n   2. Fuge \n"}}]}"#,
        ));
        assert_eq!(result.display_text(), "1. Riss\n   2. Fuge \n");
    }

    #[test]
    fn test_error_with_message() {
        let result = interpret(&failed(401, r#"{"error":{"message":"Invalid API key"}}"#));
        assert_eq!(result, AnalysisResult::ApiError("Invalid API key".to_string()));
        assert_eq!(result.display_text(), "❌ Fehler: Invalid API key");
    }

    #[test]
    fn test_error_without_message() {
        assert_eq!(
            interpret(&failed(500, "{}")).display_text(),
            format!("{}{}", FAILURE_MARKER, UNKNOWN_ERROR)
        );
        assert_eq!(
            interpret(&failed(502, "<html>Bad Gateway</html>")).display_text(),
            "❌ Fehler: Unbekannter Fehler"
        );
    }

    #[test]
    fn test_missing_content_placeholder() {
        for body in [
            r#"{"choices":[]}"#,
            r#"{"choices":[{"message":{}}]}"#,
            r#"{"choices":[{"message":{"content":""}}]}"#,
            r#"{}"#,
        ] {
            assert_eq!(
                interpret(&ok(body)),
                AnalysisResult::Answer(NO_ANSWER.to_string()),
                "body: {}",
                body
            );
        }
    }

    #[test]
    fn test_success_status_with_garbage_body() {
        let result = interpret(&ok("not json"));
        assert!(matches!(result, AnalysisResult::TransportError(_)));
        assert!(result.display_text().starts_with(FAILURE_MARKER));
    }

    // Loopback server: accepts one connection, captures the request, then
    // answers with `reply` or, when `reply` is None, stalls without answering.
    async fn serve_once(
        reply: Option<(&'static str, &'static str)>,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let request = String::from_utf8_lossy(&raw).to_string();

            match reply {
                Some((status_line, body)) => {
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status_line,
                        body.len(),
                        body
                    );
                    stream.write_all(response.as_bytes()).await.unwrap();
                    stream.shutdown().await.ok();
                }
                None => tokio::time::sleep(Duration::from_secs(30)).await,
            }
            request
        });

        (base_url, server)
    }

    fn client_for(base_url: String, timeout_seconds: Option<u64>) -> LLMClient {
        LLMClient::new(LLMConfig {
            api_key: Some("sk-test".to_string()),
            base_url: Some(base_url),
            timeout_seconds,
            ..LLMConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_client_sends_bearer_post_to_chat_completions() {
        let (base_url, server) = serve_once(Some((
            "401 Unauthorized",
            r#"{"error":{"message":"Invalid API key"}}"#,
        )))
        .await;
        let client = client_for(base_url, None);
        let request = AnalysisRequest::new(&Config::default(), "aGVsbG8=");

        let response = client.dispatch(&request).await.unwrap();
        let captured = server.await.unwrap();

        assert!(
            captured.starts_with("POST /v1/chat/completions HTTP/1.1\r\n"),
            "request: {captured}"
        );
        let lower = captured.to_ascii_lowercase();
        assert!(lower.contains("\r\nauthorization: bearer sk-test\r\n"));
        assert!(lower.contains("\r\ncontent-type: application/json\r\n"));
        assert!(captured.contains("\"url\":\"data:image/jpeg;base64,aGVsbG8=\""));
        assert!(captured.contains("\"max_tokens\":1000"));

        assert_eq!(response.status, 401);
        assert_eq!(
            interpret(&response),
            AnalysisResult::ApiError("Invalid API key".to_string())
        );
    }

    #[tokio::test]
    async fn test_client_success_status_with_non_json_body() {
        let (base_url, server) = serve_once(Some(("200 OK", "upstream hiccup"))).await;
        let client = client_for(base_url, None);
        let request = AnalysisRequest::new(&Config::default(), "QUJD");

        let response = client.dispatch(&request).await.unwrap();
        server.await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.body, "upstream hiccup");
        assert!(matches!(
            interpret(&response),
            AnalysisResult::TransportError(_)
        ));
    }

    #[tokio::test]
    async fn test_client_answer_through_pipeline() {
        let (base_url, server) = serve_once(Some((
            "200 OK",
            r#"{"choices":[{"message":{"content":"No defects found."}}]}"#,
        )))
        .await;
        let client = client_for(base_url, None);
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("site.jpg");
        std::fs::write(&image, b"hello").unwrap();

        let mut pipeline = crate::pipeline::Pipeline::new(Config::default());
        pipeline.select_image(Some(image));
        pipeline.analyze(&client).await;
        server.await.unwrap();

        assert_eq!(pipeline.result_text(), "No defects found.");
        assert!(!pipeline.is_analyzing());
    }

    #[tokio::test]
    async fn test_client_timeout_ends_in_transport_error() {
        let (base_url, _server) = serve_once(None).await;
        let client = client_for(base_url, Some(1));
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("site.jpg");
        std::fs::write(&image, b"hello").unwrap();

        let mut pipeline = crate::pipeline::Pipeline::new(Config::default());
        pipeline.select_image(Some(image));
        tokio::time::timeout(Duration::from_secs(10), pipeline.analyze(&client))
            .await
            .expect("configured timeout should end the request");

        assert!(matches!(
            pipeline.result(),
            Some(AnalysisResult::TransportError(_))
        ));
        assert!(pipeline.result_text().starts_with(FAILURE_MARKER));
        assert!(!pipeline.is_analyzing());
    }

    #[tokio::test]
    async fn test_client_without_key_fails_before_sending() {
        let client = LLMClient::new(LLMConfig::default()).unwrap();
        let request = AnalysisRequest::new(&Config::default(), "QUJD");
        let err = client.dispatch(&request).await.unwrap_err();
        assert!(err.to_string().contains("API key"));
    }
}
