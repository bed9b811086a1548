//! Slack Web API client for pulling whole threads.

use crate::brain::text::clean_chat_text;
use crate::error::AppError;
use crate::models::ThreadMessage;
use crate::oracles::traits::MessageSource;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument};

const PAGE_LIMIT: u32 = 100;
const MAX_PAGES: usize = 10;

#[derive(Deserialize)]
struct RepliesResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct SlackMessage {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    ts: String,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
}

impl SlackMessage {
    fn is_from_bot(&self) -> bool {
        self.bot_id.is_some() || self.subtype.as_deref() == Some("bot_message")
    }
}

/// Slack message ids are `seconds.micros` strings.
pub fn parse_slack_ts(ts: &str) -> Result<i64, AppError> {
    let seconds = ts.split('.').next().unwrap_or_default();
    seconds
        .parse::<i64>()
        .map_err(|_| AppError::MessageSource(format!("Invalid Slack timestamp: {}", ts)))
}

/// Permalink to a thread: `{workspace}/archives/{channel}/p{ts without the dot}`.
pub fn thread_link(workspace_url: &str, channel_id: &str, thread_id: &str) -> String {
    format!(
        "{}/archives/{}/p{}",
        workspace_url.trim_end_matches('/'),
        channel_id,
        thread_id.replace('.', "")
    )
}

/// Reads threads through `conversations.replies`, skipping bot chatter and empty messages.
pub struct SlackThreadSource {
    client: Client,
    api_url: String,
    token: String,
    request_timeout: Duration,
}

impl SlackThreadSource {
    pub fn new(api_url: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        thread_id: &str,
        cursor: Option<&str>,
    ) -> Result<RepliesResponse, AppError> {
        let url = format!("{}/conversations.replies", self.api_url);
        let limit = PAGE_LIMIT.to_string();
        let mut params = vec![("channel", channel_id), ("ts", thread_id), ("limit", limit.as_str())];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor));
        }

        let request = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&params);

        let response = timeout(self.request_timeout, request.send())
            .await?
            .map_err(|e| AppError::MessageSource(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::MessageSource(format!(
                "conversations.replies returned {}",
                status
            )));
        }

        let page = timeout(self.request_timeout, response.json::<RepliesResponse>())
            .await?
            .map_err(|e| AppError::MessageSource(e.to_string()))?;
        if !page.ok {
            return Err(AppError::MessageSource(format!(
                "conversations.replies failed: {}",
                page.error.as_deref().unwrap_or("unknown_error")
            )));
        }
        Ok(page)
    }
}

#[async_trait]
impl MessageSource for SlackThreadSource {
    #[instrument(skip(self))]
    async fn fetch_thread(
        &self,
        channel_id: &str,
        thread_id: &str,
    ) -> Result<Vec<ThreadMessage>, AppError> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page = self
                .fetch_page(channel_id, thread_id, cursor.as_deref())
                .await?;

            for message in page.messages {
                if message.is_from_bot() {
                    continue;
                }
                let text = clean_chat_text(message.text.as_deref().unwrap_or_default());
                if text.is_empty() {
                    continue;
                }
                messages.push(ThreadMessage {
                    author_id: message.user.unwrap_or_default(),
                    text,
                    timestamp: parse_slack_ts(&message.ts)?,
                });
            }

            cursor = page
                .response_metadata
                .and_then(|m| m.next_cursor)
                .filter(|c| !c.is_empty());
            if !page.has_more || cursor.is_none() {
                break;
            }
        }

        debug!(count = messages.len(), "Fetched thread");
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn link_drops_the_dot() {
        assert_eq!(
            thread_link("https://acme.slack.com/", "C1", "1700000000.000100"),
            "https://acme.slack.com/archives/C1/p1700000000000100"
        );
    }

    #[test]
    fn ts_keeps_whole_seconds() {
        assert_eq!(parse_slack_ts("1700000000.000100").unwrap(), 1_700_000_000);
        assert!(parse_slack_ts("abc").is_err());
    }

    #[tokio::test]
    async fn drops_bots_and_empty_messages() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.replies"))
            .and(query_param("channel", "C1"))
            .and(query_param("ts", "1700000000.000100"))
            .and(header("authorization", "Bearer xoxb-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "messages": [
                    { "user": "U1", "text": "<@U2> A1100 durdu", "ts": "1700000000.000100" },
                    { "bot_id": "B1", "text": "Bot reply", "ts": "1700000001.000100" },
                    { "subtype": "bot_message", "text": "Another bot", "ts": "1700000002.000100" },
                    { "user": "U2", "text": "", "ts": "1700000003.000100" },
                    { "user": "U2", "text": "Hızı düşürün", "ts": "1700000004.000100" }
                ],
                "has_more": false
            })))
            .mount(&mock_server)
            .await;

        let source = SlackThreadSource::new(&mock_server.uri(), "xoxb-test");
        let messages = source.fetch_thread("C1", "1700000000.000100").await.unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "A1100 durdu");
        assert_eq!(messages[1].author_id, "U2");
        assert_eq!(messages[1].timestamp, 1_700_000_004);
    }

    #[tokio::test]
    async fn api_error_is_a_message_source_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.replies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": false,
                "error": "thread_not_found"
            })))
            .mount(&mock_server)
            .await;

        let source = SlackThreadSource::new(&mock_server.uri(), "xoxb-test");
        let err = source.fetch_thread("C1", "1.2").await.unwrap_err();
        assert!(matches!(err, AppError::MessageSource(ref m) if m.contains("thread_not_found")));
        assert!(err.is_transient());
    }
}
