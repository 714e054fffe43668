use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

use crate::models::{ChatMessage, ChatRequest, Settings};
use crate::protocol::{Frame, FrameAssembler, FrameBody};
use crate::telemetry;

/**
 * \brief 聊天面板的开合状态。
 * \details 由应用外壳持有并向下传递；键盘监听只派发动作，不触碰全局单例。
 */
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PanelState {
    open: bool,
}

impl PanelState {
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn toggle(&mut self) {
        self.open = !self.open;
    }

    pub fn open(&mut self) {
        self.open = true;
    }

    pub fn close(&mut self) {
        self.open = false;
    }
}

/** \brief 全局快捷键判定：Ctrl/Cmd + C 切换面板。 */
pub fn matches_toggle_shortcut(key: char, ctrl: bool, meta: bool) -> bool {
    (ctrl || meta) && key.eq_ignore_ascii_case(&'c')
}

/**
 * \brief 聊天会话：有序消息列表加一条读取循环。
 * \details 消息只存在于会话生命周期内，不跨重载持久化。新的提交会取消
 *          仍在途的上一次读取（单飞策略），读取循环在取消点退出。
 */
pub struct ChatSession {
    server_base: String,
    client: reqwest::Client,
    messages: Vec<ChatMessage>,
    loading: bool,
    last_error: Option<String>,
    streaming_reply: bool,
    in_flight: Option<CancellationToken>,
}

impl ChatSession {
    pub fn new(server_base: impl Into<String>) -> Self {
        ChatSession {
            server_base: server_base.into(),
            client: reqwest::Client::new(),
            messages: Vec::new(),
            loading: false,
            last_error: None,
            streaming_reply: false,
            in_flight: None,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /** \brief 上一次提交失败的原因；成功或尚未提交时为 None。 */
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /** \brief 在途请求的取消令牌，供外层在新提交之外主动中止。 */
    pub fn in_flight_token(&self) -> Option<CancellationToken> {
        self.in_flight.clone()
    }

    /**
     * \brief 提交一条用户输入并流式接收助手回复。
     * \details 空白输入不产生消息也不发起网络调用。传输或提供商失败记入
     *          last_error，loading 随流结束或出错一并清除，不自动重试。
     */
    pub async fn submit(&mut self, input: &str, settings: &Settings) {
        self.submit_with(input, settings, |_| {}).await
    }

    /**
     * \brief 同 submit，另将每段增量回调给调用方（如终端即时打印）。
     */
    pub async fn submit_with<F>(&mut self, input: &str, settings: &Settings, mut on_delta: F)
    where
        F: FnMut(&str),
    {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return;
        }

        let token = self.begin_flight();
        let user = ChatMessage::user(trimmed);
        self.messages.push(user.clone());
        self.loading = true;
        self.last_error = None;
        self.streaming_reply = false;

        let request = ChatRequest {
            messages: vec![user],
            model: settings.model,
            api_key: settings.api_key_for(settings.model).to_string(),
        };

        let result = self.read_stream(&request, &token, &mut on_delta).await;
        self.loading = false;
        self.in_flight = None;

        if let Err(e) = result {
            telemetry::log_error("client.chat", &format!("submit failed: {}", e));
            self.last_error = Some(e.to_string());
        }
    }

    /** \brief 注册新的在途请求，并取消被取代的上一个。 */
    fn begin_flight(&mut self) -> CancellationToken {
        if let Some(previous) = self.in_flight.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        self.in_flight = Some(token.clone());
        token
    }

    async fn read_stream<F>(
        &mut self,
        request: &ChatRequest,
        token: &CancellationToken,
        on_delta: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&str),
    {
        let url = format!("{}/api/chat", self.server_base.trim_end_matches('/'));
        let resp = self.client.post(url).json(request).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("chat request failed: {} -> {}", status, text));
        }

        let mut stream = resp.bytes_stream();
        let mut assembler = FrameAssembler::new();
        use futures_util::StreamExt;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { break };
                    let chunk = chunk?;
                    for frame in assembler.push(&chunk)? {
                        if self.apply_frame(frame, on_delta)? {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /**
     * \brief 把一帧应用到消息列表；返回 true 表示流已正常结束。
     * \details 首个增量先补上空的助手占位消息，之后逐帧增长同一条。
     */
    fn apply_frame<F>(&mut self, frame: Frame, on_delta: &mut F) -> Result<bool>
    where
        F: FnMut(&str),
    {
        match frame.body {
            FrameBody::Delta { content } => {
                if !self.streaming_reply {
                    self.messages.push(ChatMessage::assistant(""));
                    self.streaming_reply = true;
                }
                if let Some(last) = self.messages.last_mut() {
                    last.content.push_str(&content);
                }
                on_delta(&content);
                Ok(false)
            }
            FrameBody::Error { message } => Err(anyhow!(message)),
            FrameBody::Done => Ok(true),
        }
    }
}

/**
 * \brief 从服务端读取当前用户设置；未认证时得到默认值。
 */
pub async fn fetch_settings(server_base: &str, user: Option<&str>) -> Result<Settings> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/settings", server_base.trim_end_matches('/'));
    let mut req = client.get(url);
    if let Some(uid) = user {
        req = req.header("x-user-id", uid);
    }
    let resp = req.send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("fetch settings failed: {} -> {}", status, text));
    }
    Ok(resp.json::<Settings>().await?)
}

/**
 * \brief 上传本地文件，返回服务端给出的公开 URL。
 */
pub async fn upload_file(server_base: &str, path: &std::path::Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();
    let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
    let form = reqwest::multipart::Form::new().part("file", part);

    let client = reqwest::Client::new();
    let url = format!("{}/api/upload", server_base.trim_end_matches('/'));
    let resp = client.post(url).multipart(form).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("upload failed: {} -> {}", status, text));
    }
    let v: serde_json::Value = resp.json().await?;
    v.get("url")
        .and_then(|u| u.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing url in upload response"))
}
