#![allow(non_snake_case)]

// Базовые модули
pub mod config;
pub mod metrics;
pub mod hash;   // стабильный xxhash64 для шардирования задач
pub mod util;   // src/util/mod.rs

// Планировщик задач
pub mod jobs;   // src/jobs/{mod,queue,latch,processor,thread,delegating,multi}.rs

// Контракты окружения (лог, хранилища, транзакции) + in-memory реализация
pub mod env;    // src/env/{mod,oom,mem}.rs

// Сборщик мусора
pub mod gc;     // src/gc/{mod,utilization,profile_store,cleaner,jobs,collector}.rs

// Удобные реэкспорты
pub use config::GcConfig;
pub use env::mem::MemEnvironment;
pub use env::{Environment, Log, Loggable, RemoveMode, Store, Transaction};
pub use gc::{BackgroundCleaner, GarbageCollector, GcStats, UtilizationProfile};
pub use jobs::{
    DelegatingJobProcessor, FnJob, Job, JobKey, JobProcessor, JobRef, JobState, Latch, LatchJob,
    MultiThreadDelegatingJobProcessor, Priority, Schedule, ThreadJobProcessor,
};
