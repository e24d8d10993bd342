// src/env/mem.rs — in-memory окружение (эталонный коллаборатор GC)
//
// Лог: файлы фиксированной длины, записи добавляются только в конец.
// Формат записи (LE):
//   u8  kind          (0 = NULL/padding, 1 = META, 2 = DATA)
//   u8  reserved[3]
//   u32 length        (полная длина записи с заголовком)
//   u64 structure_id  (0 = не принадлежит хранилищу)
//   payload:
//     DATA: u16 klen | u32 vlen | key | value
// Хвост файла, в который запись не влезла, закрывается NULL-записью
// (или нулями, если хвост короче заголовка) — записи не пересекают границу файла.
//
// Хранилища: key -> (address, length) последней версии. Старая версия при commit
// становится "expired" и уходит слушателю (профилю утилизации GC).
//
// Симуляции для тестов: таймауты захвата GC-транзакции, read-only GC-транзакции,
// неудачные flush, хук в reclaim.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use super::{
    Environment, ExpiredLoggable, ExpiredLoggablesListener, Log, LoggableIter, Loggable,
    NewFileListener, RemoveMode, Store, Transaction, KIND_DATA, KIND_META, KIND_NULL, NO_STRUCTURE,
};
use crate::config::GcConfig;
use crate::gc::profile_store::{MemProfileStore, ProfileStore};

pub const RECORD_HEADER: u64 = 16;
const PAYLOAD_HEADER: usize = 6;

pub type ReclaimHook = Arc<dyn Fn(&Loggable) + Send + Sync + 'static>;
/// Called whenever a transaction lists all stores (utilization scans).
pub type ScanHook = Arc<dyn Fn() + Send + Sync + 'static>;

fn encode_record(kind: u8, structure_id: u64, data: &[u8]) -> Vec<u8> {
    let len = RECORD_HEADER as usize + data.len();
    let mut buf = vec![0u8; len];
    buf[0] = kind;
    LittleEndian::write_u32(&mut buf[4..8], len as u32);
    LittleEndian::write_u64(&mut buf[8..16], structure_id);
    buf[16..].copy_from_slice(data);
    buf
}

fn encode_kv(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; PAYLOAD_HEADER + key.len() + value.len()];
    LittleEndian::write_u16(&mut buf[0..2], key.len() as u16);
    LittleEndian::write_u32(&mut buf[2..6], value.len() as u32);
    buf[PAYLOAD_HEADER..PAYLOAD_HEADER + key.len()].copy_from_slice(key);
    buf[PAYLOAD_HEADER + key.len()..].copy_from_slice(value);
    buf
}

/// Splits a DATA payload into (key, value).
pub fn decode_kv(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < PAYLOAD_HEADER {
        return Err(anyhow!("kv payload too short: {}", data.len()));
    }
    let klen = LittleEndian::read_u16(&data[0..2]) as usize;
    let vlen = LittleEndian::read_u32(&data[2..6]) as usize;
    if PAYLOAD_HEADER + klen + vlen != data.len() {
        return Err(anyhow!(
            "kv payload size mismatch: klen={} vlen={} total={}",
            klen,
            vlen,
            data.len()
        ));
    }
    let key = &data[PAYLOAD_HEADER..PAYLOAD_HEADER + klen];
    let value = &data[PAYLOAD_HEADER + klen..];
    Ok((key, value))
}

/// On-log size of a DATA record holding `key`/`value`.
pub fn kv_record_len(key_len: usize, value_len: usize) -> u64 {
    RECORD_HEADER + (PAYLOAD_HEADER + key_len + value_len) as u64
}

// ---------------- log ----------------

struct LogState {
    files: BTreeMap<u64, Vec<u8>>,
    high: u64,
    removed: Vec<(u64, RemoveMode)>,
}

pub struct MemLog {
    file_length: u64,
    state: RwLock<LogState>,
    listeners: Mutex<Vec<NewFileListener>>,
}

impl MemLog {
    pub fn new(file_length: u64) -> Self {
        Self {
            file_length,
            state: RwLock::new(LogState {
                files: BTreeMap::new(),
                high: 0,
                removed: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Appends one record and returns its address.
    pub fn append(&self, kind: u8, structure_id: u64, data: &[u8]) -> Result<u64> {
        let rec = encode_record(kind, structure_id, data);
        let len = rec.len() as u64;
        if len > self.file_length {
            return Err(anyhow!(
                "record of {} bytes does not fit a {}-byte file",
                len,
                self.file_length
            ));
        }
        let fl = self.file_length;
        let mut created = Vec::new();
        let addr = {
            let mut st = self.state.write().unwrap();
            let off = st.high % fl;
            if off != 0 && off + len > fl {
                let file = st.high - off;
                let rest = fl - off;
                if let Some(buf) = st.files.get_mut(&file) {
                    if rest >= RECORD_HEADER {
                        let pad = encode_record(KIND_NULL, NO_STRUCTURE, &[]);
                        let at = buf.len();
                        buf.extend_from_slice(&pad);
                        LittleEndian::write_u32(&mut buf[at + 4..at + 8], rest as u32);
                    }
                    buf.resize(fl as usize, 0);
                }
                st.high = file + fl;
            }
            let file = st.high - st.high % fl;
            if !st.files.contains_key(&file) {
                st.files.insert(file, Vec::with_capacity(fl as usize));
                created.push(file);
            }
            let addr = st.high;
            if let Some(buf) = st.files.get_mut(&file) {
                buf.extend_from_slice(&rec);
            }
            st.high += len;
            addr
        };
        // слушатели — после отпускания блокировки лога
        if !created.is_empty() {
            let ls: Vec<NewFileListener> = self.listeners.lock().unwrap().clone();
            for f in created {
                for l in &ls {
                    l(f);
                }
            }
        }
        Ok(addr)
    }

    /// Files removed so far, in removal order.
    pub fn removed_files(&self) -> Vec<(u64, RemoveMode)> {
        self.state.read().unwrap().removed.clone()
    }

    fn decode_at(&self, st: &LogState, address: u64) -> Result<Loggable> {
        let fl = self.file_length;
        let file = address - address % fl;
        let off = (address - file) as usize;
        let buf = st
            .files
            .get(&file)
            .ok_or_else(|| anyhow!("no file at {} for address {}", file, address))?;
        if off + RECORD_HEADER as usize > buf.len() {
            return Err(anyhow!("no record at address {}", address));
        }
        let kind = buf[off];
        let length = LittleEndian::read_u32(&buf[off + 4..off + 8]) as u64;
        let structure_id = LittleEndian::read_u64(&buf[off + 8..off + 16]);
        if length < RECORD_HEADER || off as u64 + length > buf.len() as u64 {
            return Err(anyhow!("corrupt record at {}: length {}", address, length));
        }
        let data = if kind == KIND_NULL {
            Vec::new()
        } else {
            buf[off + RECORD_HEADER as usize..off + length as usize].to_vec()
        };
        Ok(Loggable {
            address,
            kind,
            structure_id,
            length,
            data,
        })
    }
}

struct MemLogIter<'a> {
    log: &'a MemLog,
    cursor: u64,
    done: bool,
}

impl<'a> Iterator for MemLogIter<'a> {
    type Item = Result<Loggable>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let fl = self.log.file_length;
        let st = self.log.state.read().unwrap();
        loop {
            if self.cursor >= st.high {
                self.done = true;
                return None;
            }
            let file = self.cursor - self.cursor % fl;
            let off = self.cursor - file;
            let written = match st.files.get(&file) {
                Some(buf) => buf.len() as u64,
                None => {
                    // файл удалён — к следующему существующему
                    match st.files.range(file + 1..).next() {
                        Some((f, _)) => {
                            self.cursor = *f;
                            continue;
                        }
                        None => {
                            self.done = true;
                            return None;
                        }
                    }
                }
            };
            if fl - off < RECORD_HEADER || off >= written {
                self.cursor = file + fl;
                continue;
            }
            return match self.log.decode_at(&st, self.cursor) {
                Ok(l) => {
                    self.cursor += l.length;
                    Some(Ok(l))
                }
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            };
        }
    }
}

impl Log for MemLog {
    fn file_length(&self) -> u64 {
        self.file_length
    }

    fn all_file_addresses(&self) -> Vec<u64> {
        self.state.read().unwrap().files.keys().copied().collect()
    }

    fn number_of_files(&self) -> usize {
        self.state.read().unwrap().files.len()
    }

    fn high_address(&self) -> u64 {
        self.state.read().unwrap().high
    }

    fn loggables_from(&self, address: u64) -> LoggableIter<'_> {
        Box::new(MemLogIter {
            log: self,
            cursor: address,
            done: false,
        })
    }

    fn read(&self, address: u64) -> Result<Loggable> {
        let st = self.state.read().unwrap();
        self.decode_at(&st, address)
    }

    fn add_new_file_listener(&self, listener: NewFileListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn remove_file(&self, file: u64, mode: RemoveMode) -> Result<()> {
        let mut st = self.state.write().unwrap();
        let fl = self.file_length;
        if file == st.high - st.high % fl {
            return Err(anyhow!("cannot remove file {} being written", file));
        }
        if st.files.remove(&file).is_none() {
            return Err(anyhow!("file {} does not exist", file));
        }
        st.removed.push((file, mode));
        debug!("mem log: removed file {} ({:?})", file, mode);
        Ok(())
    }
}

// ---------------- stores ----------------

pub struct MemStore {
    id: u64,
    name: String,
    index: Mutex<BTreeMap<Vec<u8>, (u64, u64)>>,
}

impl MemStore {
    fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            index: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of the live record for `key`.
    pub fn address_of(&self, key: &[u8]) -> Option<u64> {
        self.index.lock().unwrap().get(key).map(|(a, _)| *a)
    }

    /// Points `key` to a new record; returns the superseded one.
    fn install(&self, key: &[u8], address: u64, length: u64) -> Option<ExpiredLoggable> {
        self.index
            .lock()
            .unwrap()
            .insert(key.to_vec(), (address, length))
            .map(|(address, length)| ExpiredLoggable { address, length })
    }

    fn remove(&self, key: &[u8]) -> Option<ExpiredLoggable> {
        self.index
            .lock()
            .unwrap()
            .remove(key)
            .map(|(address, length)| ExpiredLoggable { address, length })
    }
}

impl Store for MemStore {
    fn structure_id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn reclaim(&self, txn: &mut dyn Transaction, loggable: &Loggable) -> Result<()> {
        if loggable.kind != KIND_DATA {
            return Ok(());
        }
        let (key, value) = decode_kv(&loggable.data)?;
        if self.address_of(key) != Some(loggable.address) {
            // запись уже перекрыта новой версией или удалена
            return Ok(());
        }
        let mt = txn
            .as_any_mut()
            .downcast_mut::<MemTransaction>()
            .ok_or_else(|| anyhow!("store {} needs a MemTransaction", self.name))?;
        if mt.read_only {
            return Err(anyhow!("reclaim in a read-only transaction"));
        }
        mt.env.fire_reclaim_hook(loggable);
        mt.writes.push(PendingWrite {
            structure_id: self.id,
            key: key.to_vec(),
            value: value.to_vec(),
            expected: loggable.address,
        });
        Ok(())
    }

    fn for_each_live(&self, _txn: &dyn Transaction, f: &mut dyn FnMut(u64, u64)) -> Result<()> {
        let snapshot: Vec<(u64, u64)> = self.index.lock().unwrap().values().copied().collect();
        for (addr, len) in snapshot {
            f(addr, len);
        }
        Ok(())
    }
}

// ---------------- transactions ----------------

struct PendingWrite {
    structure_id: u64,
    key: Vec<u8>,
    value: Vec<u8>,
    /// Address the record had when it was reclaimed; the rewrite is dropped if it moved.
    expected: u64,
}

pub struct MemTransaction {
    env: Arc<MemEnvironment>,
    read_only: bool,
    exclusive: bool,
    holds_writer: bool,
    writes: Vec<PendingWrite>,
}

impl MemTransaction {
    fn release(&mut self) {
        if self.holds_writer {
            self.holds_writer = false;
            self.env.release_writer();
        }
    }

    /// Buffered rewrites not flushed yet.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }
}

impl Transaction for MemTransaction {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    fn open_store(&mut self, structure_id: u64) -> Result<Option<Arc<dyn Store>>> {
        Ok(self.env.store(structure_id).map(|s| {
            let s: Arc<dyn Store> = s;
            s
        }))
    }

    fn all_stores(&self) -> Vec<Arc<dyn Store>> {
        self.env.fire_scan_hook();
        self.env
            .stores
            .read()
            .unwrap()
            .values()
            .map(|s| {
                let s: Arc<dyn Store> = s.clone();
                s
            })
            .collect()
    }

    fn force_flush(&mut self) -> Result<bool> {
        if self.read_only {
            return Err(anyhow!("cannot flush a read-only transaction"));
        }
        if self.env.take_simulated(&self.env.flush_failures) {
            return Ok(false);
        }
        let writes = std::mem::take(&mut self.writes);
        let mut expired = Vec::with_capacity(writes.len());
        for w in writes {
            let store = match self.env.store(w.structure_id) {
                Some(s) => s,
                None => continue,
            };
            if store.address_of(&w.key) != Some(w.expected) {
                continue;
            }
            let payload = encode_kv(&w.key, &w.value);
            let addr = self.env.log.append(KIND_DATA, w.structure_id, &payload)?;
            let len = RECORD_HEADER + payload.len() as u64;
            if let Some(old) = store.install(&w.key, addr, len) {
                expired.push(old);
            }
        }
        self.release();
        self.env.notify_expired(&expired);
        Ok(true)
    }

    fn abort(&mut self) {
        self.writes.clear();
        self.release();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for MemTransaction {
    fn drop(&mut self) {
        self.release();
        if self.read_only {
            self.env.reader_finished();
        }
    }
}

// ---------------- environment ----------------

#[derive(Default)]
struct Readers {
    open: usize,
    deferred: Vec<Box<dyn FnOnce() + Send + 'static>>,
}

pub struct MemEnvironment {
    me: Weak<MemEnvironment>,
    config: GcConfig,
    log: Arc<MemLog>,
    stores: RwLock<BTreeMap<u64, Arc<MemStore>>>,
    next_structure_id: AtomicU64,
    writer: Mutex<bool>,
    writer_cv: Condvar,
    open: AtomicBool,
    readers: Mutex<Readers>,
    expired_listener: RwLock<Option<ExpiredLoggablesListener>>,
    profile_store: RwLock<Option<Arc<dyn ProfileStore>>>,
    reclaim_hook: RwLock<Option<ReclaimHook>>,
    scan_hook: RwLock<Option<ScanHook>>,
    gc_txn_timeouts: AtomicUsize,
    gc_txn_read_only: AtomicUsize,
    flush_failures: AtomicUsize,
    gc_txn_attempts: AtomicUsize,
    syncs: AtomicU64,
}

impl MemEnvironment {
    pub fn new(config: GcConfig, file_length: u64) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            log: Arc::new(MemLog::new(file_length)),
            stores: RwLock::new(BTreeMap::new()),
            next_structure_id: AtomicU64::new(1),
            writer: Mutex::new(false),
            writer_cv: Condvar::new(),
            open: AtomicBool::new(true),
            readers: Mutex::new(Readers::default()),
            expired_listener: RwLock::new(None),
            profile_store: RwLock::new(Some(Arc::new(MemProfileStore::new()))),
            reclaim_hook: RwLock::new(None),
            scan_hook: RwLock::new(None),
            gc_txn_timeouts: AtomicUsize::new(0),
            gc_txn_read_only: AtomicUsize::new(0),
            flush_failures: AtomicUsize::new(0),
            gc_txn_attempts: AtomicUsize::new(0),
            syncs: AtomicU64::new(0),
        })
    }

    pub fn mem_log(&self) -> &Arc<MemLog> {
        &self.log
    }

    pub fn create_store(&self, name: &str) -> Arc<MemStore> {
        let id = self.next_structure_id.fetch_add(1, Ordering::AcqRel);
        let s = Arc::new(MemStore::new(id, name));
        self.stores.write().unwrap().insert(id, s.clone());
        s
    }

    pub fn store(&self, structure_id: u64) -> Option<Arc<MemStore>> {
        self.stores.read().unwrap().get(&structure_id).cloned()
    }

    pub fn put(&self, structure_id: u64, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(structure_id, &[(key.to_vec(), Some(value.to_vec()))])
    }

    pub fn delete(&self, structure_id: u64, key: &[u8]) -> Result<()> {
        self.write_batch(structure_id, &[(key.to_vec(), None)])
    }

    /// Commits puts (`Some(value)`) and deletes (`None`) as one user transaction.
    pub fn write_batch(&self, structure_id: u64, ops: &[(Vec<u8>, Option<Vec<u8>>)]) -> Result<()> {
        let store = self
            .store(structure_id)
            .ok_or_else(|| anyhow!("unknown store {}", structure_id))?;
        if !self.open.load(Ordering::Acquire) {
            return Err(anyhow!("environment is closed"));
        }
        self.acquire_writer(None);
        let res = (|| -> Result<Vec<ExpiredLoggable>> {
            let mut expired = Vec::new();
            for (key, value) in ops {
                let old = match value {
                    Some(v) => {
                        let payload = encode_kv(key, v);
                        let addr = self.log.append(KIND_DATA, structure_id, &payload)?;
                        store.install(key, addr, RECORD_HEADER + payload.len() as u64)
                    }
                    None => store.remove(key),
                };
                expired.extend(old);
            }
            Ok(expired)
        })();
        self.release_writer();
        let expired = res?;
        self.notify_expired(&expired);
        Ok(())
    }

    /// Appends a metadata record (never relocated by the GC).
    pub fn append_meta(&self, data: &[u8]) -> Result<u64> {
        self.acquire_writer(None);
        let res = self.log.append(KIND_META, NO_STRUCTURE, data);
        self.release_writer();
        res
    }

    pub fn get(&self, structure_id: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let store = self
            .store(structure_id)
            .ok_or_else(|| anyhow!("unknown store {}", structure_id))?;
        match store.address_of(key) {
            None => Ok(None),
            Some(addr) => {
                let l = self.log.read(addr)?;
                let (_, v) = decode_kv(&l.data)?;
                Ok(Some(v.to_vec()))
            }
        }
    }

    /// Full key/value contents of a store, read through the log.
    pub fn contents(&self, structure_id: u64) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let store = self
            .store(structure_id)
            .ok_or_else(|| anyhow!("unknown store {}", structure_id))?;
        let addrs: Vec<u64> = store.index.lock().unwrap().values().map(|(a, _)| *a).collect();
        let mut out = BTreeMap::new();
        for a in addrs {
            let l = self.log.read(a)?;
            let (k, v) = decode_kv(&l.data)?;
            out.insert(k.to_vec(), v.to_vec());
        }
        Ok(out)
    }

    /// Sum of lengths of all live records.
    pub fn live_bytes(&self) -> u64 {
        self.stores
            .read()
            .unwrap()
            .values()
            .map(|s| s.index.lock().unwrap().values().map(|(_, l)| *l).sum::<u64>())
            .sum()
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn set_profile_store(&self, store: Option<Arc<dyn ProfileStore>>) {
        *self.profile_store.write().unwrap() = store;
    }

    pub fn set_reclaim_hook(&self, hook: Option<ReclaimHook>) {
        *self.reclaim_hook.write().unwrap() = hook;
    }

    pub fn set_scan_hook(&self, hook: Option<ScanHook>) {
        *self.scan_hook.write().unwrap() = hook;
    }

    /// The next `n` GC transaction acquisitions time out.
    pub fn simulate_gc_txn_timeouts(&self, n: usize) {
        self.gc_txn_timeouts.store(n, Ordering::Release);
    }

    /// The next `n` GC transactions come back read-only.
    pub fn simulate_read_only_gc_txns(&self, n: usize) {
        self.gc_txn_read_only.store(n, Ordering::Release);
    }

    /// The next `n` flushes fail.
    pub fn simulate_flush_failures(&self, n: usize) {
        self.flush_failures.store(n, Ordering::Release);
    }

    pub fn gc_txn_attempts(&self) -> usize {
        self.gc_txn_attempts.load(Ordering::Acquire)
    }

    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Acquire)
    }

    fn take_simulated(&self, counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn fire_reclaim_hook(&self, loggable: &Loggable) {
        let hook = self.reclaim_hook.read().unwrap().clone();
        if let Some(h) = hook {
            h(loggable);
        }
    }

    fn fire_scan_hook(&self) {
        let hook = self.scan_hook.read().unwrap().clone();
        if let Some(h) = hook {
            h();
        }
    }

    fn notify_expired(&self, expired: &[ExpiredLoggable]) {
        if expired.is_empty() {
            return;
        }
        let l = self.expired_listener.read().unwrap().clone();
        if let Some(l) = l {
            l(expired);
        }
    }

    /// Blocks for the writer slot; `None` waits forever. Returns false on timeout.
    fn acquire_writer(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut busy = self.writer.lock().unwrap();
        while *busy {
            match deadline {
                None => busy = self.writer_cv.wait(busy).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    busy = self.writer_cv.wait_timeout(busy, d - now).unwrap().0;
                }
            }
        }
        *busy = true;
        true
    }

    fn release_writer(&self) {
        *self.writer.lock().unwrap() = false;
        self.writer_cv.notify_one();
    }

    fn reader_started(&self) {
        self.readers.lock().unwrap().open += 1;
    }

    fn reader_finished(&self) {
        let tasks = {
            let mut r = self.readers.lock().unwrap();
            r.open = r.open.saturating_sub(1);
            if r.open == 0 {
                std::mem::take(&mut r.deferred)
            } else {
                Vec::new()
            }
        };
        for t in tasks {
            t();
        }
    }

    fn arc(&self) -> Result<Arc<MemEnvironment>> {
        self.me
            .upgrade()
            .ok_or_else(|| anyhow!("environment is being dropped"))
    }
}

impl Environment for MemEnvironment {
    fn config(&self) -> &GcConfig {
        &self.config
    }

    fn log(&self) -> Arc<dyn Log> {
        let l: Arc<dyn Log> = self.log.clone();
        l
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn begin_gc_transaction(&self, acquire_timeout: Duration) -> Result<Option<Box<dyn Transaction>>> {
        self.gc_txn_attempts.fetch_add(1, Ordering::AcqRel);
        if !self.is_open() {
            return Err(anyhow!("environment is closed"));
        }
        if self.take_simulated(&self.gc_txn_timeouts) {
            return Ok(None);
        }
        let env = self.arc()?;
        if self.take_simulated(&self.gc_txn_read_only) {
            self.reader_started();
            return Ok(Some(Box::new(MemTransaction {
                env,
                read_only: true,
                exclusive: false,
                holds_writer: false,
                writes: Vec::new(),
            })));
        }
        if !self.acquire_writer(Some(acquire_timeout)) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemTransaction {
            env,
            read_only: false,
            exclusive: self.config.use_exclusive_transaction,
            holds_writer: true,
            writes: Vec::new(),
        })))
    }

    fn begin_read_only_transaction(&self) -> Result<Box<dyn Transaction>> {
        if !self.is_open() {
            return Err(anyhow!("environment is closed"));
        }
        let env = self.arc()?;
        self.reader_started();
        Ok(Box::new(MemTransaction {
            env,
            read_only: true,
            exclusive: false,
            holds_writer: false,
            writes: Vec::new(),
        }))
    }

    fn execute_transaction_safe_task(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        {
            let mut r = self.readers.lock().unwrap();
            if r.open > 0 {
                r.deferred.push(task);
                return;
            }
        }
        task();
    }

    fn flush_and_sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn set_expired_loggables_listener(&self, listener: Option<ExpiredLoggablesListener>) {
        *self.expired_listener.write().unwrap() = listener;
    }

    fn profile_store(&self) -> Option<Arc<dyn ProfileStore>> {
        self.profile_store.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_never_cross_file_boundary() -> Result<()> {
        let log = MemLog::new(100);
        // 16 + 40 = 56; второй не влезает (56 + 56 > 100) → padding и новый файл
        let a = log.append(KIND_DATA, 1, &[7u8; 40])?;
        let b = log.append(KIND_DATA, 1, &[8u8; 40])?;
        assert_eq!(a, 0);
        assert_eq!(b, 100);
        assert_eq!(log.all_file_addresses(), vec![0, 100]);

        let all: Vec<Loggable> = log.loggables_from(0).collect::<Result<_>>()?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].kind, KIND_NULL);
        assert_eq!(all[1].end(), 100);
        assert_eq!(all[2].address, 100);
        assert_eq!(log.read(100)?.data, vec![8u8; 40]);

        // хвост короче заголовка: 56 + 30 = 86, остаётся 14 < 16
        let log = MemLog::new(100);
        log.append(KIND_DATA, 1, &[1u8; 40])?;
        log.append(KIND_DATA, 1, &[2u8; 14])?;
        let c = log.append(KIND_DATA, 1, &[3u8; 1])?;
        assert_eq!(c, 100);
        assert_eq!(log.loggables_from(0).count(), 3);
        Ok(())
    }

    #[test]
    fn overwrites_expire_old_versions() -> Result<()> {
        let env = MemEnvironment::new(GcConfig::default(), 1024);
        let s = env.create_store("t");
        let seen = Arc::new(Mutex::new(Vec::<ExpiredLoggable>::new()));
        let seen2 = seen.clone();
        env.set_expired_loggables_listener(Some(Arc::new(move |ex: &[ExpiredLoggable]| {
            seen2.lock().unwrap().extend_from_slice(ex)
        })));

        env.put(s.structure_id(), b"k", b"v1")?;
        let first = s.address_of(b"k").unwrap();
        env.put(s.structure_id(), b"k", b"v2")?;
        env.delete(s.structure_id(), b"k")?;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].address, first);
        assert_eq!(seen[0].length, kv_record_len(1, 2));
        assert_eq!(env.get(s.structure_id(), b"k")?, None);
        Ok(())
    }

    #[test]
    fn deferred_tasks_wait_for_readers() -> Result<()> {
        let env = MemEnvironment::new(GcConfig::default(), 1024);
        let ran = Arc::new(AtomicBool::new(false));
        let txn = env.begin_read_only_transaction()?;
        let r = ran.clone();
        env.execute_transaction_safe_task(Box::new(move || r.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
        drop(txn);
        assert!(ran.load(Ordering::SeqCst));
        Ok(())
    }
}
