use crate::db::{self, Database};

const WIFI_ONLY_KEY: &str = "upload_wifi_only";
const AUTO_UPLOAD_ACTIVE_KEY: &str = "auto_upload_active";
const AUTO_UPLOAD_ALBUM_KEY: &str = "auto_upload_album_id";
const AUTO_UPLOAD_CATEGORY_KEY: &str = "auto_upload_category_id";
const AUTO_UPLOAD_TAGS_KEY: &str = "auto_upload_tag_ids";
const AUTO_UPLOAD_COMMENTS_KEY: &str = "auto_upload_comments";
const LAST_DELETION_PROPOSAL_KEY: &str = "last_deletion_proposal_millis";

/// 自动上传配置快照。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoUploadConfig {
    pub active: bool,
    /// 监听新资源的本地媒体集合。
    pub album_id: String,
    /// 目标 Piwigo 相册。
    pub category_id: Option<i64>,
    pub tag_ids: String,
    pub comments: String,
}

pub fn get_wifi_only(db: &Database) -> Result<bool, String> {
    read_bool(db, WIFI_ONLY_KEY)
}

pub fn set_wifi_only(db: &Database, value: bool) -> Result<bool, String> {
    write_bool(db, WIFI_ONLY_KEY, value)
}

pub fn is_auto_upload_active(db: &Database) -> Result<bool, String> {
    read_bool(db, AUTO_UPLOAD_ACTIVE_KEY)
}

pub fn set_auto_upload_active(db: &Database, value: bool) -> Result<bool, String> {
    write_bool(db, AUTO_UPLOAD_ACTIVE_KEY, value)
}

pub fn get_auto_upload_config(db: &Database) -> Result<AutoUploadConfig, String> {
    let category_id = match db::get_setting(db, AUTO_UPLOAD_CATEGORY_KEY)? {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|e| format!("invalid auto-upload category: {e}"))?,
        ),
        None => None,
    };
    Ok(AutoUploadConfig {
        active: is_auto_upload_active(db)?,
        album_id: db::get_setting(db, AUTO_UPLOAD_ALBUM_KEY)?.unwrap_or_default(),
        category_id,
        tag_ids: db::get_setting(db, AUTO_UPLOAD_TAGS_KEY)?.unwrap_or_default(),
        comments: db::get_setting(db, AUTO_UPLOAD_COMMENTS_KEY)?.unwrap_or_default(),
    })
}

pub fn set_auto_upload_config(db: &Database, config: &AutoUploadConfig) -> Result<(), String> {
    set_auto_upload_active(db, config.active)?;
    db::set_setting(db, AUTO_UPLOAD_ALBUM_KEY, &config.album_id)?;
    match config.category_id {
        Some(id) if id > 0 => db::set_setting(db, AUTO_UPLOAD_CATEGORY_KEY, &id.to_string())?,
        _ => db::delete_setting(db, AUTO_UPLOAD_CATEGORY_KEY)?,
    }
    db::set_setting(db, AUTO_UPLOAD_TAGS_KEY, &config.tag_ids)?;
    db::set_setting(db, AUTO_UPLOAD_COMMENTS_KEY, &config.comments)?;
    Ok(())
}

/// 清除本地来源集合。
pub fn reset_auto_upload_album(db: &Database) -> Result<(), String> {
    db::delete_setting(db, AUTO_UPLOAD_ALBUM_KEY)
}

/// 清除目标相册，例如它已在服务器上被删除。
pub fn reset_auto_upload_category(db: &Database) -> Result<(), String> {
    db::delete_setting(db, AUTO_UPLOAD_CATEGORY_KEY)
}

pub fn get_last_deletion_proposal(db: &Database) -> Result<Option<i64>, String> {
    match db::get_setting(db, LAST_DELETION_PROPOSAL_KEY)? {
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|e| format!("invalid deletion proposal date: {e}")),
        None => Ok(None),
    }
}

pub fn set_last_deletion_proposal(db: &Database, millis: i64) -> Result<(), String> {
    db::set_setting(db, LAST_DELETION_PROPOSAL_KEY, &millis.to_string())
}

fn read_bool(db: &Database, key: &str) -> Result<bool, String> {
    Ok(matches!(db::get_setting(db, key)?.as_deref(), Some("1") | Some("true")))
}

fn write_bool(db: &Database, key: &str, value: bool) -> Result<bool, String> {
    db::set_setting(db, key, if value { "1" } else { "0" })?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_upload_config_round_trips_through_settings() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(get_auto_upload_config(&db).unwrap(), AutoUploadConfig::default());

        let config = AutoUploadConfig {
            active: true,
            album_id: "camera-roll".to_string(),
            category_id: Some(12),
            tag_ids: "3,4".to_string(),
            comments: "auto".to_string(),
        };
        set_auto_upload_config(&db, &config).unwrap();
        assert_eq!(get_auto_upload_config(&db).unwrap(), config);

        reset_auto_upload_category(&db).unwrap();
        assert_eq!(get_auto_upload_config(&db).unwrap().category_id, None);
    }

    #[test]
    fn wifi_only_defaults_to_false() {
        let db = Database::open_in_memory().unwrap();
        assert!(!get_wifi_only(&db).unwrap());
        set_wifi_only(&db, true).unwrap();
        assert!(get_wifi_only(&db).unwrap());
    }
}
