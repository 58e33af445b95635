//! Streaming chat client for OpenAI-compatible endpoints.
//!
//! Transport and API failures never surface as errors to the agent loop:
//! they are delivered as a single bracketed error chunk so the conversation
//! can continue.

use anyhow::{Result, anyhow};
use castellan_core::{LlmConfig, Message, Role};
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::io::BufRead;
use std::time::Duration;

/// Seam for the model backend. Implementations stream content chunks
/// through `on_chunk` and return the assembled response text.
pub trait LlmClient: Send + Sync {
    fn stream_chat(&self, messages: &[Message], on_chunk: &dyn Fn(&str)) -> Result<String>;
}

pub struct HttpLlmClient {
    cfg: LlmConfig,
    http: Client,
}

impl HttpLlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, http })
    }

    fn api_key(&self) -> Result<String> {
        if let Some(key) = self.cfg.api_key.as_deref() {
            if !key.trim().is_empty() {
                return Ok(key.to_string());
            }
        }
        std::env::var(&self.cfg.api_key_env).map_err(|_| {
            anyhow!(
                "no API key configured; set the {} environment variable",
                self.cfg.api_key_env
            )
        })
    }

    fn build_payload(&self, messages: &[Message]) -> Value {
        let wire: Vec<Value> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    // Tool output travels as user-side automated content in
                    // the tag protocol; there are no tool_call ids to echo.
                    Role::ToolResult => "user",
                };
                json!({"role": role, "content": m.content})
            })
            .collect();
        json!({
            "model": self.cfg.model,
            "messages": wire,
            "stream": true,
        })
    }

    fn stream_inner(&self, messages: &[Message], on_chunk: &dyn Fn(&str)) -> Result<String> {
        let api_key = self.api_key()?;
        let response = self
            .http
            .post(&self.cfg.endpoint)
            .bearer_auth(api_key)
            .json(&self.build_payload(messages))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let detail = body.trim();
            return Err(if detail.is_empty() {
                anyhow!("API error: {status}")
            } else {
                anyhow!("API error: {status} ({detail})")
            });
        }

        let mut assembled = String::new();
        let reader = std::io::BufReader::new(response);
        for line_result in reader.lines() {
            let line = line_result.map_err(|e| anyhow!("stream read error: {e}"))?;
            let trimmed = line.trim();
            if !trimmed.starts_with("data:") {
                continue;
            }
            let chunk = trimmed.trim_start_matches("data:").trim();
            if chunk == "[DONE]" {
                break;
            }
            let Ok(value) = serde_json::from_str::<Value>(chunk) else {
                continue;
            };
            if let Some(delta) = value
                .pointer("/choices/0/delta/content")
                .and_then(|v| v.as_str())
            {
                if !delta.is_empty() {
                    on_chunk(delta);
                    assembled.push_str(delta);
                }
            }
        }
        Ok(assembled)
    }
}

impl LlmClient for HttpLlmClient {
    fn stream_chat(&self, messages: &[Message], on_chunk: &dyn Fn(&str)) -> Result<String> {
        match self.stream_inner(messages, on_chunk) {
            Ok(text) => Ok(text),
            Err(err) => {
                let marker = format!("[Error: {err}]");
                on_chunk(&marker);
                Ok(marker)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;

    fn sse_fixture(events: &[&str]) -> (String, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fixture");
        let addr = listener.local_addr().expect("fixture addr");
        let mut body = String::new();
        for event in events {
            body.push_str(&format!("data: {event}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://{addr}/chat/completions"), handle)
    }

    fn client_for(endpoint: String) -> HttpLlmClient {
        let cfg = LlmConfig {
            endpoint,
            model: "test-model".to_string(),
            api_key: Some("test-key".to_string()),
            api_key_env: "UNUSED".to_string(),
            timeout_seconds: 5,
        };
        HttpLlmClient::new(cfg).expect("client")
    }

    #[test]
    fn assembles_streamed_deltas_in_order() {
        let (endpoint, handle) = sse_fixture(&[
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"{"choices":[{"delta":{"content":", "}}]}"#,
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"world"}}]}"#,
        ]);
        let client = client_for(endpoint);
        let chunks = Mutex::new(Vec::new());
        let text = client
            .stream_chat(&[Message::user("hi")], &|c| {
                chunks.lock().expect("lock").push(c.to_string());
            })
            .expect("stream");
        handle.join().expect("fixture thread");
        assert_eq!(text, "Hello, world");
        assert_eq!(
            chunks.into_inner().expect("chunks"),
            vec!["Hello", ", ", "world"]
        );
    }

    #[test]
    fn transport_failure_becomes_error_chunk() {
        // Nothing listens on this port by construction: bind then drop.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let client = client_for(format!("http://127.0.0.1:{port}/chat"));
        let chunks = Mutex::new(Vec::new());
        let text = client
            .stream_chat(&[Message::user("hi")], &|c| {
                chunks.lock().expect("lock").push(c.to_string());
            })
            .expect("degrades to marker");
        assert!(text.starts_with("[Error: "));
        assert_eq!(chunks.into_inner().expect("chunks").len(), 1);
    }

    #[test]
    fn missing_api_key_becomes_error_chunk() {
        let cfg = LlmConfig {
            api_key: None,
            api_key_env: "CASTELLAN_NO_SUCH_KEY_VAR".to_string(),
            ..LlmConfig::default()
        };
        let client = HttpLlmClient::new(cfg).expect("client");
        let text = client
            .stream_chat(&[Message::user("hi")], &|_| {})
            .expect("degrades to marker");
        assert!(text.contains("CASTELLAN_NO_SUCH_KEY_VAR"));
        assert!(text.starts_with("[Error: "));
    }

    #[test]
    fn api_error_status_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request);
                let body = r#"{"error":"bad model"}"#;
                let response = format!(
                    "HTTP/1.1 401 Unauthorized\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        let client = client_for(format!("http://{addr}/chat"));
        let text = client
            .stream_chat(&[Message::user("hi")], &|_| {})
            .expect("degrades to marker");
        handle.join().expect("fixture thread");
        assert!(text.starts_with("[Error: API error: 401"));
    }
}
