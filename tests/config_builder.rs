use anyhow::Result;

use QuiverGC::config::GcConfig;
use QuiverGC::env::oom::{guard_for, OomGuard, RssOomGuard};
use QuiverGC::{Environment, MemEnvironment, RemoveMode};

const VARS: &[(&str, &str)] = &[
    ("P1_GC_ENABLED", "yes"),
    ("P1_GC_MIN_UTILIZATION", "65"),
    ("P1_GC_START_IN_MS", "250"),
    ("P1_GC_FILE_MIN_AGE", "4"),
    ("P1_GC_FILES_INTERVAL", "0"),
    ("P1_GC_RUN_PERIOD_MS", "1500"),
    ("P1_GC_TXN_ACQUIRE_TIMEOUT_MS", "75"),
    ("P1_GC_TXN_TIMEOUT_MS", "900"),
    ("P1_GC_FILES_DELETION_DELAY_MS", "0"),
    ("P1_GC_RENAME_FILES", "on"),
    ("P1_GC_USE_EXCLUSIVE_TXN", "false"),
    ("P1_GC_UTILIZATION_FROM_SCRATCH", "1"),
    ("P1_GC_UTILIZATION_FROM_FILE", "  "),
    ("P1_GC_SOFT_MEMORY_LIMIT", "0"),
];

// Единственный тест, трогающий ENV: остальные конфиги собираются билдером
#[test]
fn from_env_reads_every_knob() -> Result<()> {
    for (k, v) in VARS {
        std::env::set_var(k, v);
    }
    let cfg = GcConfig::from_env();
    for (k, _) in VARS {
        std::env::remove_var(k);
    }

    assert!(cfg.enabled);
    assert!(!cfg.read_only);
    assert_eq!(cfg.min_utilization, 65);
    assert_eq!(cfg.max_free_space_percent(), 35);
    assert_eq!(cfg.start_in_ms, 250);
    assert_eq!(cfg.file_min_age, 4);
    // 0 файлов между пробуждениями не имеет смысла — минимум 1
    assert_eq!(cfg.files_interval, 1);
    assert_eq!(cfg.run_period_ms, 1500);
    assert_eq!(cfg.transaction_acquire_timeout_ms, 75);
    assert_eq!(cfg.transaction_timeout_ms, 900);
    assert_eq!(cfg.files_deletion_delay_ms, 0);
    assert!(cfg.rename_files);
    assert!(!cfg.use_exclusive_transaction);
    assert!(cfg.utilization_from_scratch);
    // пустая строка = не задано
    assert_eq!(cfg.utilization_from_file, None);
    assert_eq!(cfg.soft_memory_limit_bytes, None);
    assert_eq!(RemoveMode::from_config(&cfg), RemoveMode::Rename);
    Ok(())
}

#[test]
fn builder_overrides_reach_the_environment() -> Result<()> {
    let cfg = GcConfig::default()
        .with_min_utilization(90)
        .with_read_only(true)
        .with_use_exclusive_transaction(false)
        .with_utilization_from_file(Some("/tmp/quivergc-profile.json"))
        .with_soft_memory_limit_bytes(Some(64 << 20))
        .build();

    let env = MemEnvironment::new(cfg.clone(), 4096);
    let seen = env.config();
    assert_eq!(seen.max_free_space_percent(), 10);
    assert!(seen.read_only);
    assert!(!seen.use_exclusive_transaction);
    assert_eq!(RemoveMode::from_config(seen), RemoveMode::Delete);

    let text = seen.to_string();
    assert!(text.contains("min_utilization: 90%"), "{text}");
    assert!(text.contains("/tmp/quivergc-profile.json"), "{text}");
    assert!(text.contains(&format!("soft_memory_limit: {}", 64u64 << 20)), "{text}");
    Ok(())
}

#[test]
fn oom_guard_follows_soft_limit() -> Result<()> {
    // без лимита guard никогда не срабатывает
    let off = guard_for(&GcConfig::default());
    assert!(!off.is_near_oom());

    // лимит в 1 байт: на Linux RSS процесса заведомо больше
    let tiny = RssOomGuard::new(1);
    assert_eq!(tiny.limit_bytes(), 1);
    if cfg!(target_os = "linux") {
        assert!(tiny.is_near_oom());
    }

    let huge = RssOomGuard::new(u64::MAX);
    assert!(!huge.is_near_oom());
    Ok(())
}
