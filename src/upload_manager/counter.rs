use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadCounter {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl UploadCounter {
    pub fn progress(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_sent as f64 / self.total_bytes as f64).min(1.0) as f32
    }
}

/// 传输中的字节进度，以本地资源 id 为键。
///
/// 计数器不会持久化。访问未知 id 会新建计数器，
/// 重启后仍有传输在运行时就会出现这种情况。
#[derive(Clone, Default)]
pub struct UploadCounters {
    counters: Arc<Mutex<HashMap<String, UploadCounter>>>,
}

impl UploadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_counter(&self, identifier: &str) {
        recover_lock(&self.counters).insert(identifier.to_string(), UploadCounter::default());
    }

    pub fn set_total_bytes(&self, identifier: &str, total_bytes: u64) {
        let mut counters = recover_lock(&self.counters);
        counters
            .entry(identifier.to_string())
            .or_default()
            .total_bytes = total_bytes;
    }

    pub fn add_bytes(&self, identifier: &str, bytes: u64) {
        let mut counters = recover_lock(&self.counters);
        let counter = counters.entry(identifier.to_string()).or_default();
        counter.bytes_sent = counter.bytes_sent.saturating_add(bytes);
    }

    /// 已发送比例，取值 `[0, 1]`；未知计数器返回 0。
    pub fn progress(&self, identifier: &str) -> f32 {
        recover_lock(&self.counters)
            .get(identifier)
            .map(UploadCounter::progress)
            .unwrap_or(0.0)
    }

    pub fn get(&self, identifier: &str) -> Option<UploadCounter> {
        recover_lock(&self.counters).get(identifier).copied()
    }

    pub fn remove_counter(&self, identifier: &str) {
        recover_lock(&self.counters).remove(identifier);
    }

    pub fn len(&self) -> usize {
        recover_lock(&self.counters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn recover_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_stays_within_bounds() {
        let counters = UploadCounters::new();
        counters.init_counter("a");
        assert_eq!(counters.progress("a"), 0.0);

        counters.set_total_bytes("a", 1_000);
        counters.add_bytes("a", 250);
        assert!((counters.progress("a") - 0.25).abs() < f32::EPSILON);

        for _ in 0..10 {
            counters.add_bytes("a", 400);
            let progress = counters.progress("a");
            assert!((0.0..=1.0).contains(&progress));
        }
        assert_eq!(counters.progress("a"), 1.0);

        counters.add_bytes("a", u64::MAX);
        assert_eq!(counters.progress("a"), 1.0);
    }

    #[test]
    fn zero_total_reports_no_progress() {
        let counters = UploadCounters::new();
        counters.add_bytes("b", 10);
        assert_eq!(counters.progress("b"), 0.0);
        assert_eq!(counters.progress("missing"), 0.0);
    }

    #[test]
    fn unknown_identifiers_are_created_implicitly() {
        let counters = UploadCounters::new();
        counters.add_bytes("late", 5);
        counters.set_total_bytes("late", 10);
        assert_eq!(
            counters.get("late"),
            Some(UploadCounter {
                bytes_sent: 5,
                total_bytes: 10
            })
        );
        counters.remove_counter("late");
        assert!(counters.is_empty());
    }

    #[test]
    fn clones_share_the_same_counters() {
        let counters = UploadCounters::new();
        let reader = counters.clone();
        counters.set_total_bytes("c", 4);
        counters.add_bytes("c", 2);
        assert!((reader.progress("c") - 0.5).abs() < f32::EPSILON);
    }
}
