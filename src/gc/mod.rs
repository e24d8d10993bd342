//! gc — сборщик мусора лога на основе профиля утилизации.
//!
//! Поток управления: новый файл / таймер → GarbageCollector::wake → BackgroundCleaningJob
//! в процессор BackgroundCleaner → кандидаты из UtilizationProfile → перенос живых записей
//! в ограниченной транзакции → файлы в pending → отложенное удаление тем же процессором.
//!
//! Все структурные изменения файлов выполняются только на потоке очистителя.

pub mod cleaner;
pub mod collector;
pub mod jobs;
pub mod profile_store;
pub mod utilization;

pub use cleaner::BackgroundCleaner;
pub use collector::{GarbageCollector, GcStats};
pub use jobs::{
    BackgroundCleaningJob, CleanEntireLogJob, ComputeUtilizationFromScratchJob,
    DeletePendingFilesJob,
};
pub use profile_store::{FileProfileStore, MemProfileStore, ProfileDump, ProfileStore};
pub use utilization::{ProfileSource, UtilizationProfile};
