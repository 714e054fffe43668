use std::convert::Infallible;
use std::path::PathBuf;

use anyhow::Result;
use axum::{
    body::Body,
    extract::Multipart,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::{get, get_service, post},
    Json, Router,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;

use crate::{
    db, llm,
    models::{ChatRequest, Settings, SettingsPatch},
    protocol::Frame,
    telemetry,
};

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 * \param addr 监听地址，如 "127.0.0.1:3000"
 */
pub async fn run(addr: &str) -> Result<()> {
    let ui_root =
        std::env::var("COLLABAI_UI_DIR").unwrap_or_else(|_| "packages/ui/dist".to_string());
    let fallback_root =
        std::env::var("COLLABAI_UI_FALLBACK").unwrap_or_else(|_| "web".to_string());

    let static_handler = if std::path::Path::new(&ui_root).exists() {
        ServeDir::new(ui_root)
    } else {
        ServeDir::new(fallback_root)
    }
    .append_index_html_on_directories(true);

    let static_service = get_service(static_handler);
    let files_service = get_service(ServeDir::new(upload_dir()));

    let app = Router::new()
        .route("/api/chat", post(relay_chat))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/upload", post(upload_file))
        .nest_service("/files", files_service)
        .fallback_service(static_service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 从请求头解析认证身份。
 * \details 托管身份服务在本仓库范围之外，`x-user-id` 承载其校验后的主体；
 *          缺失即视为未认证。
 */
fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn send_frame(tx: &mpsc::UnboundedSender<Result<String, Infallible>>, frame: Frame) {
    match frame.encode() {
        Ok(line) => {
            let _ = tx.send(Ok(line));
        }
        Err(e) => telemetry::log_error("server.chat", &format!("encode frame failed: {}", e)),
    }
}

/**
 * \brief 聊天中继：POST /api/chat。
 * \details 校验选择器与消息序列后构造唯一的提供商客户端，把增量逐帧写进
 *          NDJSON 响应体，不做整体缓冲，也不重试。
 */
async fn relay_chat(
    Json(request): Json<ChatRequest>,
) -> Result<Response, (StatusCode, String)> {
    let prompt = llm::latest_prompt(&request.messages)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        .to_string();

    if let Ok(conn) = db::open_default_db() {
        let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
        telemetry::set_enabled(telemetry_enabled);
    }
    telemetry::log_event(
        "server.chat",
        &format!("relay model={} prompt_len={}", request.model, prompt.len()),
    );

    let endpoint = llm::ProviderEndpoint::new(request.model, request.api_key.clone());
    let (tx, rx) = mpsc::unbounded_channel::<Result<String, Infallible>>();

    tokio::spawn(async move {
        match llm::stream_chat(&endpoint, &prompt).await {
            Ok(mut s) => {
                use futures_util::StreamExt;
                while let Some(item) = s.as_mut().next().await {
                    match item {
                        Ok(delta) => send_frame(&tx, Frame::delta(delta)),
                        Err(e) => {
                            telemetry::log_error("server.chat", &format!("stream error: {}", e));
                            send_frame(&tx, Frame::error(e.to_string()));
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                telemetry::log_error("server.chat", &format!("stream failed: {}", e));
                send_frame(&tx, Frame::error(e.to_string()));
            }
        }
        send_frame(&tx, Frame::done());
    });

    let body = Body::from_stream(UnboundedReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .map_err(internal_err)
}

/**
 * \brief 读取当前用户设置；未认证或无记录时返回默认值。
 */
async fn get_settings(headers: HeaderMap) -> Result<Json<Settings>, (StatusCode, String)> {
    let settings = match user_id(&headers) {
        Some(uid) => {
            let conn = db::open_default_db().map_err(internal_err)?;
            db::get_settings(&conn, &uid).map_err(internal_err)?
        }
        None => Settings::default(),
    };
    Ok(Json(settings))
}

/**
 * \brief 部分更新当前用户设置；未认证时静默忽略并返回 null。
 */
async fn update_settings(
    headers: HeaderMap,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<Option<Settings>>, (StatusCode, String)> {
    let Some(uid) = user_id(&headers) else {
        return Ok(Json(None));
    };
    let conn = db::open_default_db().map_err(internal_err)?;
    let merged = db::update_settings(&conn, &uid, &patch).map_err(internal_err)?;
    telemetry::log_event("server.settings", &format!("update user={}", uid));
    Ok(Json(Some(merged)))
}

fn upload_dir() -> PathBuf {
    std::env::var("COLLABAI_UPLOAD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("uploads"))
}

/** \brief 文件名仅保留字母数字与 `.`/`-`/`_`，其余替换为 `-`。 */
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.trim_matches('-').is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

fn stored_file_name(original: &str) -> String {
    let stamp = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("{}-{}", stamp, sanitize_file_name(original))
}

/**
 * \brief 接收单个文件并返回可公开访问的 URL。
 */
async fn upload_file(
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let dir = upload_dir();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let Some(original) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

        tokio::fs::create_dir_all(&dir).await.map_err(internal_err)?;
        let stored = stored_file_name(&original);
        tokio::fs::write(dir.join(&stored), &data)
            .await
            .map_err(internal_err)?;

        telemetry::log_event(
            "server.upload",
            &format!("stored name={} bytes={}", stored, data.len()),
        );
        return Ok(Json(serde_json::json!({
            "url": format!("/files/{}", stored)
        })));
    }
    Err((
        StatusCode::BAD_REQUEST,
        "no file field in request".to_string(),
    ))
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
