//! 服务器版本处理，以及针对已知服务器缺陷的兼容处理。

use std::{cmp::Ordering, fmt, str::FromStr};

/// 较新的服务器会把上传先放进 lounge，需要显式清空。
pub const LOUNGE_MIN_VERSION: ServerVersion = ServerVersion::new(12, 0, 0);
pub const MIN_SUPPORTED_VERSION: ServerVersion = ServerVersion::new(2, 10, 0);

// 这些版本的 `paging.total_count` 有误（Piwigo issue #1871）。
const TOTAL_COUNT_BUG_FIRST: ServerVersion = ServerVersion::new(13, 0, 0);
const TOTAL_COUNT_BUG_LAST: ServerVersion = ServerVersion::new(13, 5, 0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// 宽松解析：缺失或非数字的部分按 0 处理，
    /// 因此 "14.0.0RC1" 视为 14.0.0。
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.trim().split('.').map(leading_number);
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }

    pub fn at_least(&self, other: ServerVersion) -> bool {
        *self >= other
    }

    /// 完成的上传是通过清空 lounge 发布，而不是调用 `pwg.images.setInfo`。
    pub fn uses_lounge(&self) -> bool {
        self.at_least(LOUNGE_MIN_VERSION)
    }
}

fn leading_number(part: &str) -> u32 {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ServerVersion {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// 取分页列表的图片总数。
///
/// 收藏夹只返回 `count`；13.0.0 到 13.5.0 的服务器 `total_count` 有误，
/// 同样改用 `count`。
pub fn paging_total_count(
    version: ServerVersion,
    count: i64,
    total_count: Option<i64>,
    favorites: bool,
) -> i64 {
    if favorites || (TOTAL_COUNT_BUG_FIRST..=TOTAL_COUNT_BUG_LAST).contains(&version) {
        return count;
    }
    total_count.unwrap_or(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_orders_versions() {
        assert_eq!(ServerVersion::parse("13.5.0"), ServerVersion::new(13, 5, 0));
        assert_eq!(ServerVersion::parse("14.0.0RC1"), ServerVersion::new(14, 0, 0));
        assert_eq!(ServerVersion::parse("2.10"), ServerVersion::new(2, 10, 0));
        assert!(ServerVersion::parse("2.10.1") > ServerVersion::parse("2.9.5"));
        assert!(ServerVersion::parse("12.0.0").uses_lounge());
        assert!(!ServerVersion::parse("11.5.0").uses_lounge());
    }

    #[test]
    fn total_count_shim_follows_bug_range() {
        let count = 100;
        let total = Some(250);
        assert_eq!(paging_total_count(ServerVersion::new(12, 3, 0), count, total, false), 250);
        assert_eq!(paging_total_count(ServerVersion::new(13, 0, 0), count, total, false), 100);
        assert_eq!(paging_total_count(ServerVersion::new(13, 5, 0), count, total, false), 100);
        assert_eq!(paging_total_count(ServerVersion::new(13, 5, 1), count, total, false), 250);
        assert_eq!(paging_total_count(ServerVersion::new(14, 0, 0), count, total, true), 100);
        assert_eq!(paging_total_count(ServerVersion::new(14, 0, 0), count, None, false), 100);
    }
}
