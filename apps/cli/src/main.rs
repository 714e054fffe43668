use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use collabai_core_sdk::{
    db,
    models::{Appearance, ModelSelector, SettingsPatch},
    server, session, telemetry,
};

/**
 * \brief CLI 程序入口：启动服务、配置设置、通过中继聊天或上传文件。
 */
#[derive(Parser, Debug)]
#[command(name = "collabai", version, about = "Collab AI notes backend and chat client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
    },

    /**
     * \brief 通过中继发送一条用户消息并流式打印模型回复。
     */
    Chat {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        prompt: String,
    },

    /**
     * \brief 写入指定用户的设置（部分更新）。
     */
    Configure {
        #[arg(long)]
        user: String,
        #[arg(long)]
        chatgpt_api_key: Option<String>,
        #[arg(long)]
        claude_api_key: Option<String>,
        /** \brief 模型标签："GPT-4o" 或 "Claude-Sonnet-3.5"。 */
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        theme: Option<String>,
        #[arg(long)]
        enable_telemetry: Option<bool>,
    },

    /**
     * \brief 查看指定用户当前生效的设置。
     */
    Settings {
        #[arg(long)]
        user: String,
    },

    /**
     * \brief 上传文件并打印可公开访问的 URL。
     */
    Upload {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        server: String,
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_default_db().context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::Serve { addr } => {
            server::run(&addr).await?;
        }
        Commands::Chat {
            server,
            user,
            prompt,
        } => {
            let settings = session::fetch_settings(&server, user.as_deref())
                .await
                .context("load settings failed")?;
            if settings.api_key_for(settings.model).is_empty() {
                bail!(
                    "no API key configured for {}, run: collabai configure --user ... --chatgpt-api-key ... (or --claude-api-key ...)",
                    settings.model
                );
            }

            telemetry::log_event(
                "cli.chat",
                &format!("model={} prompt_len={}", settings.model, prompt.len()),
            );

            let mut session = session::ChatSession::new(&server);
            session
                .submit_with(&prompt, &settings, |delta| {
                    print!("{}", delta);
                    use std::io::Write;
                    std::io::stdout().flush().ok();
                })
                .await;
            println!();

            if let Some(err) = session.last_error() {
                bail!("chat failed: {}", err);
            }
        }
        Commands::Configure {
            user,
            chatgpt_api_key,
            claude_api_key,
            model,
            theme,
            enable_telemetry,
        } => {
            let patch = SettingsPatch {
                appearance: theme.map(|theme| Appearance { theme }),
                chatgpt_api_key,
                claude_api_key,
                model: model
                    .as_deref()
                    .map(ModelSelector::from_label)
                    .transpose()
                    .context("parse model label failed")?,
            };
            let merged = db::update_settings(&conn, &user, &patch).context("save settings failed")?;
            if let Some(enabled) = enable_telemetry {
                db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
                telemetry::set_enabled(enabled);
            }
            println!(
                "Saved settings for {} (model={} theme={})",
                user, merged.model, merged.appearance.theme
            );
        }
        Commands::Settings { user } => {
            let settings = db::get_settings(&conn, &user).context("load settings failed")?;
            println!("user={}", user);
            println!("theme={}", settings.appearance.theme);
            println!("model={}", settings.model);
            println!("chatgptApiKey={}", key_status(&settings.chatgpt_api_key));
            println!("claudeApiKey={}", key_status(&settings.claude_api_key));
        }
        Commands::Upload { server, file } => {
            let url = session::upload_file(&server, &file)
                .await
                .context("upload failed")?;
            println!("{}", url);
        }
    }

    Ok(())
}

fn key_status(key: &str) -> &'static str {
    if key.is_empty() {
        "(unset)"
    } else {
        "(set)"
    }
}
