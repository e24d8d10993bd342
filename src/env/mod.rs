//! env — контракты окружения, с которыми работает GC.
//!
//! GC не знает формата лога и структур данных. Ему нужны:
//! - Log: файлы фиксированной длины, итератор записей (loggable) по адресу, удаление файла;
//! - Store: "reclaim" записи в транзакцию (перезаписать, если жива) и обход живых записей;
//! - Transaction: GC-транзакция (read-write, возможно exclusive) и read-only снимок;
//! - Environment: всё вместе + отложенные задачи, flush/sync, слушатели событий.
//!
//! Эталонная реализация для тестов и CLI — mem::MemEnvironment.

use anyhow::Result;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GcConfig;
use crate::gc::profile_store::ProfileStore;

pub mod mem;
pub mod oom;

pub use oom::{NoOomGuard, OomGuard, RssOomGuard};

/// Padding record (file tail that could not fit a record).
pub const KIND_NULL: u8 = 0;
/// Internal metadata record; never relocated by the GC.
pub const KIND_META: u8 = 1;
/// Regular record owned by a store.
pub const KIND_DATA: u8 = 2;

/// structure_id of records that belong to no store.
pub const NO_STRUCTURE: u64 = 0;

/// A record of the log as seen by the GC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loggable {
    pub address: u64,
    pub kind: u8,
    pub structure_id: u64,
    /// Full on-disk length including the header.
    pub length: u64,
    pub data: Vec<u8>,
}

impl Loggable {
    /// Does the record belong to a real store (not padding, not metadata)?
    #[inline]
    pub fn is_relocatable(&self) -> bool {
        self.kind != KIND_NULL && self.kind != KIND_META && self.structure_id != NO_STRUCTURE
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.address + self.length
    }
}

/// A record that just became dead (superseded or deleted by a commit).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiredLoggable {
    pub address: u64,
    pub length: u64,
}

/// What to do with a cleaned file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveMode {
    Delete,
    Rename,
}

impl RemoveMode {
    pub fn from_config(cfg: &GcConfig) -> Self {
        if cfg.rename_files {
            RemoveMode::Rename
        } else {
            RemoveMode::Delete
        }
    }
}

pub type NewFileListener = Arc<dyn Fn(u64) + Send + Sync + 'static>;
pub type ExpiredLoggablesListener = Arc<dyn Fn(&[ExpiredLoggable]) + Send + Sync + 'static>;
pub type LoggableIter<'a> = Box<dyn Iterator<Item = Result<Loggable>> + 'a>;

pub trait Log: Send + Sync {
    /// Fixed length of every file.
    fn file_length(&self) -> u64;

    #[inline]
    fn file_address(&self, address: u64) -> u64 {
        address - address % self.file_length()
    }

    /// Addresses of all live files, ascending.
    fn all_file_addresses(&self) -> Vec<u64>;

    fn number_of_files(&self) -> usize {
        self.all_file_addresses().len()
    }

    /// Address the next record will be written at.
    fn high_address(&self) -> u64;

    /// File currently being written. The GC never touches it.
    fn high_file_address(&self) -> u64 {
        self.file_address(self.high_address())
    }

    /// Bytes written into `file` so far.
    fn file_written_size(&self, file: u64) -> u64 {
        let high = self.high_address();
        if file == self.high_file_address() {
            high - file
        } else {
            self.file_length()
        }
    }

    /// Records starting at `address` in address order, across file boundaries.
    fn loggables_from(&self, address: u64) -> LoggableIter<'_>;

    fn read(&self, address: u64) -> Result<Loggable>;

    fn add_new_file_listener(&self, listener: NewFileListener);

    fn remove_file(&self, file: u64, mode: RemoveMode) -> Result<()>;
}

pub trait Store: Send + Sync {
    fn structure_id(&self) -> u64;

    fn name(&self) -> String;

    /// Re-append `loggable` through `txn` if it is still live; otherwise do nothing.
    fn reclaim(&self, txn: &mut dyn Transaction, loggable: &Loggable) -> Result<()>;

    /// Visit (address, length) of every live record.
    fn for_each_live(&self, txn: &dyn Transaction, f: &mut dyn FnMut(u64, u64)) -> Result<()>;
}

pub trait Transaction: Send {
    fn is_read_only(&self) -> bool;

    fn is_exclusive(&self) -> bool;

    fn open_store(&mut self, structure_id: u64) -> Result<Option<Arc<dyn Store>>>;

    fn all_stores(&self) -> Vec<Arc<dyn Store>>;

    /// Commits buffered changes. Ok(false) means "could not flush, retry later".
    fn force_flush(&mut self) -> Result<bool>;

    fn abort(&mut self);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait Environment: Send + Sync {
    fn config(&self) -> &GcConfig;

    fn log(&self) -> Arc<dyn Log>;

    fn is_open(&self) -> bool;

    /// Read-write transaction for the GC. Ok(None) if it could not be acquired in time.
    fn begin_gc_transaction(&self, acquire_timeout: Duration) -> Result<Option<Box<dyn Transaction>>>;

    fn begin_read_only_transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Runs `task` once no reader can still see the data it affects.
    fn execute_transaction_safe_task(&self, task: Box<dyn FnOnce() + Send + 'static>);

    fn flush_and_sync(&self) -> Result<()>;

    fn remove_files(&self, files: &[u64], mode: RemoveMode) -> Result<()> {
        let log = self.log();
        for f in files {
            log.remove_file(*f, mode)?;
        }
        Ok(())
    }

    fn set_expired_loggables_listener(&self, listener: Option<ExpiredLoggablesListener>);

    /// Persistent storage of the utilization profile, if the environment has one.
    fn profile_store(&self) -> Option<Arc<dyn ProfileStore>>;
}
