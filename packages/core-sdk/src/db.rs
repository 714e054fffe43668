use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{thread, time::Duration};

use crate::models::{Appearance, ModelSelector, Settings, SettingsPatch};

/**
 * \brief 打开默认数据库文件（本地目录下的 collabai.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    let conn = Connection::open("collabai.db")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS settings (
            user_id TEXT PRIMARY KEY,
            theme   TEXT NOT NULL DEFAULT 'light',
            chatgpt_api_key TEXT NOT NULL DEFAULT '',
            claude_api_key  TEXT NOT NULL DEFAULT '',
            model   TEXT NOT NULL DEFAULT 'GPT-4o'
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 读取指定用户的设置；无记录时返回默认值。
 * \details 库中残留的未知模型标签按默认模型处理，不向上抛错。
 */
pub fn get_settings(conn: &Connection, user_id: &str) -> Result<Settings> {
    let row = conn
        .query_row(
            "SELECT theme, chatgpt_api_key, claude_api_key, model FROM settings WHERE user_id=?1",
            params![user_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let settings = match row {
        Some((theme, chatgpt_api_key, claude_api_key, model_label)) => Settings {
            appearance: Appearance { theme },
            chatgpt_api_key,
            claude_api_key,
            model: ModelSelector::from_label(&model_label).unwrap_or_default(),
        },
        None => Settings::default(),
    };
    Ok(settings)
}

/**
 * \brief 应用一次部分更新并返回合并后的设置。
 * \details 无记录时先以默认值建档再打补丁，与补丁未覆盖的字段保持原值。
 */
pub fn update_settings(conn: &Connection, user_id: &str, patch: &SettingsPatch) -> Result<Settings> {
    let mut merged = get_settings(conn, user_id)?;
    merged.apply(patch);

    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO settings (user_id, theme, chatgpt_api_key, claude_api_key, model)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id) DO UPDATE SET
            theme=excluded.theme,
            chatgpt_api_key=excluded.chatgpt_api_key,
            claude_api_key=excluded.claude_api_key,
            model=excluded.model",
            params![
                user_id,
                merged.appearance.theme,
                merged.chatgpt_api_key,
                merged.claude_api_key,
                merged.model.label(),
            ],
        )
    })?;
    Ok(merged)
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked` 等错误并指数退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_missing_user_gets_defaults() {
        let conn = mem_conn();
        let settings = get_settings(&conn, "user-1").expect("get settings");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_settings_round_trip_with_partial_patch() {
        let conn = mem_conn();
        let patch = SettingsPatch {
            claude_api_key: Some("k".to_string()),
            model: Some(ModelSelector::ClaudeSonnet35),
            ..SettingsPatch::default()
        };
        update_settings(&conn, "user-1", &patch).expect("update settings");

        let stored = get_settings(&conn, "user-1").expect("get settings");
        assert_eq!(stored.model, ModelSelector::ClaudeSonnet35);
        assert_eq!(stored.claude_api_key, "k");
        assert_eq!(stored.chatgpt_api_key, "");
        assert_eq!(stored.appearance.theme, "light");
    }

    #[test]
    fn test_second_patch_keeps_earlier_fields() {
        let conn = mem_conn();
        update_settings(
            &conn,
            "user-1",
            &SettingsPatch {
                chatgpt_api_key: Some("sk-openai".to_string()),
                ..SettingsPatch::default()
            },
        )
        .expect("first update");
        update_settings(
            &conn,
            "user-1",
            &SettingsPatch {
                appearance: Some(Appearance {
                    theme: "dark".to_string(),
                }),
                ..SettingsPatch::default()
            },
        )
        .expect("second update");

        let stored = get_settings(&conn, "user-1").expect("get settings");
        assert_eq!(stored.chatgpt_api_key, "sk-openai");
        assert_eq!(stored.appearance.theme, "dark");
    }

    #[test]
    fn test_settings_are_scoped_per_user() {
        let conn = mem_conn();
        update_settings(
            &conn,
            "user-1",
            &SettingsPatch {
                chatgpt_api_key: Some("sk-1".to_string()),
                ..SettingsPatch::default()
            },
        )
        .expect("update user-1");

        let other = get_settings(&conn, "user-2").expect("get user-2");
        assert_eq!(other, Settings::default());
    }

    #[test]
    fn test_unknown_stored_label_degrades_to_default() {
        let conn = mem_conn();
        conn.execute(
            "INSERT INTO settings (user_id, model) VALUES ('user-1', 'Sonnet 3.5')",
            [],
        )
        .expect("seed drifted label");
        let stored = get_settings(&conn, "user-1").expect("get settings");
        assert_eq!(stored.model, ModelSelector::Gpt4o);
    }

    #[test]
    fn test_telemetry_flag_round_trip() {
        let conn = mem_conn();
        assert!(!get_telemetry_enabled(&conn).expect("default off"));
        set_telemetry_enabled(&conn, true).expect("enable");
        assert!(get_telemetry_enabled(&conn).expect("read back"));
    }
}
