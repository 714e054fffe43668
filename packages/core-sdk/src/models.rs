use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/**
 * \brief 模型选择器。设置界面与聊天中继共享同一枚举，标签漂移在编译期即可发现。
 * \details 规范标签取设置端的集合："GPT-4o" 与 "Claude-Sonnet-3.5"。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModelSelector {
    /** \brief OpenAI 托管模型。 */
    #[default]
    #[serde(rename = "GPT-4o")]
    Gpt4o,
    /** \brief Anthropic 托管模型。 */
    #[serde(rename = "Claude-Sonnet-3.5")]
    ClaudeSonnet35,
}

impl ModelSelector {
    /** \brief 全部受支持的选择器。 */
    pub const ALL: [ModelSelector; 2] = [ModelSelector::Gpt4o, ModelSelector::ClaudeSonnet35];

    /**
     * \brief 从规范标签解析；未知标签直接报错，中继在任何网络调用前拒绝。
     */
    pub fn from_label(label: &str) -> Result<Self> {
        match label {
            "GPT-4o" => Ok(ModelSelector::Gpt4o),
            "Claude-Sonnet-3.5" => Ok(ModelSelector::ClaudeSonnet35),
            other => Err(anyhow!("unsupported model: {}", other)),
        }
    }

    /** \brief 规范标签，与序列化形式一致。 */
    pub fn label(&self) -> &'static str {
        match self {
            ModelSelector::Gpt4o => "GPT-4o",
            ModelSelector::ClaudeSonnet35 => "Claude-Sonnet-3.5",
        }
    }

    /** \brief 提供商侧的模型 ID。 */
    pub fn model_id(&self) -> &'static str {
        match self {
            ModelSelector::Gpt4o => "gpt-4",
            ModelSelector::ClaudeSonnet35 => "claude-3-5-sonnet-20240620",
        }
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief POST /api/chat 的请求体。密钥逐请求携带，服务端不落盘。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /** \brief 有序消息序列；中继只向提供商转发最后一条。 */
    pub messages: Vec<ChatMessage>,
    /** \brief 模型选择器。 */
    pub model: ModelSelector,
    /** \brief 对应提供商的 API Key。 */
    pub api_key: String,
}

/**
 * \brief 外观设置。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appearance {
    pub theme: String,
}

impl Default for Appearance {
    fn default() -> Self {
        Appearance {
            theme: "light".to_string(),
        }
    }
}

/**
 * \brief 用户设置，按认证身份隔离存储。
 */
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub appearance: Appearance,
    pub chatgpt_api_key: String,
    pub claude_api_key: String,
    pub model: ModelSelector,
}

impl Settings {
    /** \brief 按选择器取对应提供商的密钥。 */
    pub fn api_key_for(&self, model: ModelSelector) -> &str {
        match model {
            ModelSelector::Gpt4o => &self.chatgpt_api_key,
            ModelSelector::ClaudeSonnet35 => &self.claude_api_key,
        }
    }

    /** \brief 应用一次部分更新，仅覆盖补丁中出现的字段。 */
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(appearance) = &patch.appearance {
            self.appearance = appearance.clone();
        }
        if let Some(key) = &patch.chatgpt_api_key {
            self.chatgpt_api_key = key.clone();
        }
        if let Some(key) = &patch.claude_api_key {
            self.claude_api_key = key.clone();
        }
        if let Some(model) = patch.model {
            self.model = model;
        }
    }
}

/**
 * \brief 设置的部分更新体，全部字段可选。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default)]
    pub appearance: Option<Appearance>,
    #[serde(default)]
    pub chatgpt_api_key: Option<String>,
    #[serde(default)]
    pub claude_api_key: Option<String>,
    #[serde(default)]
    pub model: Option<ModelSelector>,
}
