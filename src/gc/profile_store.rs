// src/gc/profile_store.rs — хранение профиля утилизации
//
// Бинарный файл профиля (LE):
// MAGIC8 = "P1GCUTIL"
// u32 version = 1
// u64 count
// count × { u64 file_address, u64 free_bytes }   (по возрастанию адреса)
// u32 crc32 (crc32fast) всех предыдущих байт
//
// Политика:
// - Атомарная запись: tmp+rename, затем fsync родительского каталога (best‑effort).
// - Битый/чужой файл — ошибка чтения; профиль тогда пересчитывается с нуля.
//
// Внешний дамп (utilization-from-file) — JSON:
// {"files":[{"address":N,"free_bytes":N}, ...]}

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
#[cfg(unix)]
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const PROFILE_MAGIC: &[u8; 8] = b"P1GCUTIL";
const PROFILE_VERSION: u32 = 1;

/// Persisted utilization: file address -> free bytes.
pub trait ProfileStore: Send + Sync {
    /// Was a profile ever saved?
    fn exists(&self) -> bool;

    fn load(&self) -> Result<BTreeMap<u64, u64>>;

    /// Replaces the stored profile with `entries`.
    fn save(&self, entries: &BTreeMap<u64, u64>) -> Result<()>;
}

// ---------------- file store ----------------

pub struct FileProfileStore {
    path: PathBuf,
}

impl FileProfileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

pub fn encode_profile(entries: &BTreeMap<u64, u64>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + 4 + 8 + entries.len() * 16 + 4);
    buf.write_all(PROFILE_MAGIC)?;
    buf.write_u32::<LittleEndian>(PROFILE_VERSION)?;
    buf.write_u64::<LittleEndian>(entries.len() as u64)?;
    for (addr, free) in entries {
        buf.write_u64::<LittleEndian>(*addr)?;
        buf.write_u64::<LittleEndian>(*free)?;
    }
    let crc = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

pub fn decode_profile(bytes: &[u8]) -> Result<BTreeMap<u64, u64>> {
    if bytes.len() < 8 + 4 + 8 + 4 {
        return Err(anyhow!("profile too short: {} bytes", bytes.len()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored = Cursor::new(trailer).read_u32::<LittleEndian>()?;
    let actual = crc32fast::hash(body);
    if stored != actual {
        return Err(anyhow!(
            "profile checksum mismatch (stored {:08x}, actual {:08x})",
            stored,
            actual
        ));
    }

    let mut rd = Cursor::new(body);
    let mut magic = [0u8; 8];
    rd.read_exact(&mut magic)?;
    if &magic != PROFILE_MAGIC {
        return Err(anyhow!("bad profile magic {:?}", magic));
    }
    let version = rd.read_u32::<LittleEndian>()?;
    if version != PROFILE_VERSION {
        return Err(anyhow!("unsupported profile version {}", version));
    }
    let count = rd.read_u64::<LittleEndian>()?;
    if count.saturating_mul(16) != (body.len() as u64).saturating_sub(20) {
        return Err(anyhow!("profile entry count {} does not match size", count));
    }
    let mut out = BTreeMap::new();
    for _ in 0..count {
        let addr = rd.read_u64::<LittleEndian>()?;
        let free = rd.read_u64::<LittleEndian>()?;
        out.insert(addr, free);
    }
    Ok(out)
}

impl ProfileStore for FileProfileStore {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn load(&self) -> Result<BTreeMap<u64, u64>> {
        let bytes = fs::read(&self.path)
            .with_context(|| format!("read profile {}", self.path.display()))?;
        decode_profile(&bytes).with_context(|| format!("decode profile {}", self.path.display()))
    }

    fn save(&self, entries: &BTreeMap<u64, u64>) -> Result<()> {
        let buf = encode_profile(entries)?;
        let tmp = self.path.with_extension("tmp");
        let _ = fs::remove_file(&tmp);

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open profile tmp {}", tmp.display()))?;
        f.write_all(&buf)?;
        f.sync_all()?;

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        let _ = fsync_dir(&self.path);
        Ok(())
    }
}

// ---------------- in-memory store ----------------

#[derive(Default)]
pub struct MemProfileStore {
    saved: Mutex<Option<BTreeMap<u64, u64>>>,
    saves: Mutex<u64>,
}

impl MemProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times save() was called.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap()
    }
}

impl ProfileStore for MemProfileStore {
    fn exists(&self) -> bool {
        self.saved.lock().unwrap().is_some()
    }

    fn load(&self) -> Result<BTreeMap<u64, u64>> {
        self.saved
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("no profile saved"))
    }

    fn save(&self, entries: &BTreeMap<u64, u64>) -> Result<()> {
        *self.saved.lock().unwrap() = Some(entries.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

// ---------------- JSON dump ----------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DumpEntry {
    pub address: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileDump {
    pub files: Vec<DumpEntry>,
}

impl ProfileDump {
    pub fn from_map(entries: &BTreeMap<u64, u64>) -> Self {
        Self {
            files: entries
                .iter()
                .map(|(a, f)| DumpEntry {
                    address: *a,
                    free_bytes: *f,
                })
                .collect(),
        }
    }

    pub fn into_map(self) -> BTreeMap<u64, u64> {
        self.files
            .into_iter()
            .map(|e| (e.address, e.free_bytes))
            .collect()
    }

    pub fn read(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("read utilization dump {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parse utilization dump {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let s = serde_json::to_string_pretty(self)?;
        fs::write(path, s).with_context(|| format!("write utilization dump {}", path.display()))
    }
}
