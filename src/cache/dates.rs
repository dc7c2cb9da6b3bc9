//! 服务器日期与“未知日期”哨兵值。

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;

/// 缺失、非法或早得离谱的日期统一存为该值。
pub static UNKNOWN_DATE: Lazy<DateTime<Utc>> =
    Lazy::new(|| Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).single().unwrap_or_default());

/// 早于此时间的日期一律视为未知。
pub static UNKNOWN_DATE_THRESHOLD: Lazy<DateTime<Utc>> =
    Lazy::new(|| Utc.with_ymd_and_hms(1900, 1, 8, 0, 0, 0).single().unwrap_or_default());

const SERVER_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn unknown_date_millis() -> i64 {
    UNKNOWN_DATE.timestamp_millis()
}

/// 解析服务器下发的 "yyyy-MM-dd HH:mm:ss"（或仅日期）。
pub fn parse_server_date(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return *UNKNOWN_DATE;
    };
    let parsed = NaiveDateTime::parse_from_str(raw, SERVER_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        });
    match parsed {
        Some(naive) => normalize(naive.and_utc()),
        None => *UNKNOWN_DATE,
    }
}

pub fn parse_server_date_millis(raw: Option<&str>) -> i64 {
    parse_server_date(raw).timestamp_millis()
}

pub fn normalize(date: DateTime<Utc>) -> DateTime<Utc> {
    if date < *UNKNOWN_DATE_THRESHOLD {
        *UNKNOWN_DATE
    } else {
        date
    }
}

pub fn normalize_millis(millis: i64) -> i64 {
    if millis < UNKNOWN_DATE_THRESHOLD.timestamp_millis() {
        unknown_date_millis()
    } else {
        millis
    }
}

pub fn format_server_date(date: DateTime<Utc>) -> String {
    date.format(SERVER_FORMAT).to_string()
}
