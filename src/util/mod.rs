//! util — общие утилиты планировщика и GC.
//!
//! Содержит:
//! - now_millis(): текущее Unix-время в миллисекундах (u64).
//! - env_flag()/env_u64()/env_string(): разбор ENV в стиле P1_* (1|true|yes|on).
//! - percent_of(): целочисленный процент без переполнения.
//!
//! Задача: убрать дублирование простых хелперов по коду и централизовать поведение.

/// Текущее Unix-время в миллисекундах.
#[inline]
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis().min(u64::MAX as u128) as u64
}

/// Булев флаг из ENV: "1|true|yes|on" => true, любое другое значение => false.
/// None, если переменная не задана.
pub fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "yes" || s == "on"
    })
}

/// Число из ENV (None, если не задано или не парсится).
pub fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Непустая строка из ENV.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let s = v.trim();
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    })
}

/// value * 100 / total, 0 при total == 0. Считаем в u128, чтобы не переполниться.
#[inline]
pub fn percent_of(value: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        ((value as u128) * 100 / (total as u128)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_monotonic_nonzero() {
        let a = now_millis();
        let b = now_millis();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn percent_of_edges() {
        assert_eq!(percent_of(0, 0), 0);
        assert_eq!(percent_of(50, 100), 50);
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(u64::MAX, u64::MAX), 100);
    }
}
