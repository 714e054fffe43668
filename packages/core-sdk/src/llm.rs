use anyhow::{anyhow, bail, Result};
use async_stream::try_stream;
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::pin::Pin;

use crate::models::{ChatMessage, ModelSelector};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_API_BASE: &str = "https://api.openai.com";
const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const CLAUDE_MAX_TOKENS: u32 = 1024;

/** \brief 统一的流式增量类型。 */
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/**
 * \brief 单次请求的提供商访问配置。
 * \details 密钥由调用方逐请求传入，中继不缓存、不落盘；基地址按选择器取默认值，
 *          可覆盖以指向自建网关或测试桩。
 */
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub selector: ModelSelector,
    pub api_base: String,
    pub api_key: String,
}

impl ProviderEndpoint {
    pub fn new(selector: ModelSelector, api_key: impl Into<String>) -> Self {
        let api_base = match selector {
            ModelSelector::Gpt4o => OPENAI_API_BASE,
            ModelSelector::ClaudeSonnet35 => ANTHROPIC_API_BASE,
        };
        ProviderEndpoint {
            selector,
            api_base: api_base.to_string(),
            api_key: api_key.into(),
        }
    }

    /** \brief 覆盖 API 基地址。 */
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

/**
 * \brief 取要转发给提供商的那条消息：序列中的最后一条。
 * \details 历史轮次不回放进模型上下文，这是有意的简化而非遗漏。
 */
pub fn latest_prompt(messages: &[ChatMessage]) -> Result<&str> {
    match messages.last() {
        Some(message) => Ok(message.content.as_str()),
        None => bail!("empty message sequence"),
    }
}

/**
 * \brief 以统一接口返回流式增量；按选择器构造且仅构造一个提供商客户端。
 */
pub async fn stream_chat(endpoint: &ProviderEndpoint, prompt: &str) -> Result<DeltaStream> {
    match endpoint.selector {
        ModelSelector::Gpt4o => stream_openai(endpoint, prompt).await,
        ModelSelector::ClaudeSonnet35 => stream_claude(endpoint, prompt).await,
    }
}

async fn stream_openai(endpoint: &ProviderEndpoint, prompt: &str) -> Result<DeltaStream> {
    let url = format!(
        "{}/v1/chat/completions",
        endpoint.api_base.trim_end_matches('/')
    );
    let client = reqwest::Client::builder().build()?;
    let body = json!({
        "model": endpoint.selector.model_id(),
        "messages": [{"role": "user", "content": prompt}],
        "stream": true
    });

    let resp = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", endpoint.api_key))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("openai request failed: {} -> {}", status, text));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = Vec::<u8>::new();

    let out = try_stream! {
        use futures_util::StreamExt;
        let mut done = false;
        while let Some(chunk) = stream.next().await {
            if done {
                break;
            }
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            for line in drain_data_lines(&mut buf) {
                if line.trim() == "[DONE]" {
                    done = true;
                    break;
                }
                if let Some(delta) = parse_openai_delta(&line) {
                    yield delta;
                }
            }
        }
        if !done {
            if let Some(line) = extract_data_line(&buf) {
                if line.trim() != "[DONE]" {
                    if let Some(delta) = parse_openai_delta(&line) {
                        yield delta;
                    }
                }
            }
        }
    };

    Ok(Box::pin(out))
}

async fn stream_claude(endpoint: &ProviderEndpoint, prompt: &str) -> Result<DeltaStream> {
    let url = format!("{}/v1/messages", endpoint.api_base.trim_end_matches('/'));
    let client = reqwest::Client::builder().build()?;
    let body = json!({
        "model": endpoint.selector.model_id(),
        "max_tokens": CLAUDE_MAX_TOKENS,
        "messages": [{"role": "user", "content": [{"type": "text", "text": prompt}]}],
        "stream": true
    });

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-api-key", HeaderValue::from_str(&endpoint.api_key)?);
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );

    let resp = client.post(url).headers(headers).json(&body).send().await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("claude request failed: {} -> {}", status, text));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = Vec::<u8>::new();

    let out = try_stream! {
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            for line in drain_data_lines(&mut buf) {
                claude_error_guard(&line)?;
                if let Some(delta) = parse_claude_delta(&line) {
                    yield delta;
                }
            }
        }
    };

    Ok(Box::pin(out))
}

/**
 * \brief 从缓冲区取出所有完整 SSE 事件块的 data 行，残块留待后续字节。
 */
fn drain_data_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = find_double_newline(buf) {
        let block = buf.drain(..pos + 2).collect::<Vec<u8>>();
        if let Some(line) = extract_data_line(&block) {
            lines.push(line);
        }
    }
    lines
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_data_line(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    for line in text.lines() {
        let line = line.trim_start();
        if line.starts_with("data:") {
            return Some(line[5..].trim().to_string());
        }
    }
    None
}

fn parse_openai_delta(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn parse_claude_delta(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line).ok()?;
    if v.get("type")?.as_str()? != "content_block_delta" {
        return None;
    }
    v.get("delta")?
        .get("text")?
        .as_str()
        .map(|s| s.to_string())
}

/** \brief 遇到提供商错误事件时中断流。 */
fn claude_error_guard(line: &str) -> Result<()> {
    if let Some(message) = parse_claude_error(line) {
        bail!("claude stream error: {}", message);
    }
    Ok(())
}

fn parse_claude_error(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line).ok()?;
    if v.get("type")?.as_str()? != "error" {
        return None;
    }
    let message = v
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("unknown provider error");
    Some(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_base_follows_selector() {
        let openai = ProviderEndpoint::new(ModelSelector::Gpt4o, "sk-x");
        assert_eq!(openai.api_base, "https://api.openai.com");
        let claude = ProviderEndpoint::new(ModelSelector::ClaudeSonnet35, "sk-ant");
        assert_eq!(claude.api_base, "https://api.anthropic.com");
        let overridden = openai.with_api_base("http://127.0.0.1:9000/");
        assert_eq!(overridden.api_base, "http://127.0.0.1:9000/");
    }

    #[test]
    fn test_latest_prompt_takes_tail_only() {
        let messages = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ];
        assert_eq!(latest_prompt(&messages).expect("latest"), "second");
        assert!(latest_prompt(&[]).is_err());
    }

    #[test]
    fn test_parse_openai_delta() {
        let line = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_openai_delta(line).as_deref(), Some("Hel"));
        assert_eq!(parse_openai_delta(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(parse_openai_delta("not json"), None);
    }

    #[test]
    fn test_parse_claude_delta_only_accepts_text_events() {
        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(parse_claude_delta(delta).as_deref(), Some("Hi"));
        let ping = r#"{"type":"ping"}"#;
        assert_eq!(parse_claude_delta(ping), None);
        let stop = r#"{"type":"message_stop"}"#;
        assert_eq!(parse_claude_delta(stop), None);
    }

    #[test]
    fn test_parse_claude_error_event() {
        let line = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(parse_claude_error(line).as_deref(), Some("Overloaded"));
        assert_eq!(parse_claude_error(r#"{"type":"ping"}"#), None);
    }

    #[test]
    fn test_drain_data_lines_handles_split_events() {
        let payload = b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: {\"c\"";
        let mut buf = payload.to_vec();
        let lines = drain_data_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(buf, b"data: {\"c\"".to_vec());

        buf.extend_from_slice(b":3}\n\n");
        let rest = drain_data_lines(&mut buf);
        assert_eq!(rest, vec!["{\"c\":3}".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extract_data_line_skips_event_names() {
        let block = b"event: content_block_delta\ndata: {\"x\":1}\n\n";
        assert_eq!(extract_data_line(block).as_deref(), Some("{\"x\":1}"));
        assert_eq!(extract_data_line(b": keep-alive\n\n"), None);
    }
}
