//! gc/utilization — профиль утилизации: адрес файла -> свободные байты.
//!
//! Инварианты:
//! - free(file) <= file_length;
//! - нет записи для живого файла => считаем файл полностью свободным (худший случай);
//! - файл, выбранный для чистки, обнуляется (reset), а не удаляется — до физического
//!   удаления он просто не попадает в кандидаты (он в pending);
//! - total_bytes/total_free — кэш, пересчитывается estimate_total_bytes() после
//!   каждого структурного изменения.

use anyhow::Result;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::profile_store::ProfileDump;
use crate::config::GcConfig;
use crate::env::{Environment, ExpiredLoggable, Log};
use crate::util::percent_of;

/// Where the profile came from on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    /// Seeded from an external JSON dump.
    Dump,
    /// Read back from the environment's profile store.
    Store,
    /// Nothing usable: the caller must recompute from scratch.
    Scratch,
}

#[derive(Default)]
struct ProfileState {
    files: BTreeMap<u64, u64>,
    total_bytes: u64,
    total_free: u64,
    dirty: bool,
}

pub struct UtilizationProfile {
    env: Arc<dyn Environment>,
    log: Arc<dyn Log>,
    cfg: GcConfig,
    state: Mutex<ProfileState>,
}

impl UtilizationProfile {
    pub fn new(env: Arc<dyn Environment>) -> Self {
        let log = env.log();
        let cfg = env.config().clone();
        Self {
            env,
            log,
            cfg,
            state: Mutex::new(ProfileState::default()),
        }
    }

    fn file_length(&self) -> u64 {
        self.log.file_length()
    }

    /// Registers a freshly created file as fully used.
    pub fn add_file(&self, file: u64) {
        let mut st = self.state.lock().unwrap();
        st.files.entry(file).or_insert(0);
        st.dirty = true;
    }

    /// Adds lengths of just-expired records to their files. Consecutive records
    /// of one file are summed before touching the map.
    pub fn fetch_expired_loggables(&self, expired: &[ExpiredLoggable]) {
        if expired.is_empty() {
            return;
        }
        let fl = self.file_length();
        let mut st = self.state.lock().unwrap();
        let mut last_file = u64::MAX;
        let mut acc = 0u64;
        for e in expired {
            let file = self.log.file_address(e.address);
            if file != last_file {
                if last_file != u64::MAX {
                    Self::add_free(&mut st, last_file, acc, fl);
                }
                last_file = file;
                acc = 0;
            }
            acc += e.length;
        }
        Self::add_free(&mut st, last_file, acc, fl);
    }

    fn add_free(st: &mut ProfileState, file: u64, bytes: u64, file_length: u64) {
        // неизвестный файл остаётся неизвестным (= полностью свободным)
        if let Some(free) = st.files.get_mut(&file) {
            *free = free.saturating_add(bytes).min(file_length);
            st.dirty = true;
        }
    }

    /// Zeroes the entry of a file chosen for cleaning.
    pub fn reset_file(&self, file: u64) {
        let mut st = self.state.lock().unwrap();
        st.files.insert(file, 0);
        st.dirty = true;
    }

    pub fn remove_file(&self, file: u64) {
        let mut st = self.state.lock().unwrap();
        if st.files.remove(&file).is_some() {
            st.dirty = true;
        }
    }

    pub fn free_bytes(&self, file: u64) -> Option<u64> {
        self.state.lock().unwrap().files.get(&file).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<u64, u64> {
        self.state.lock().unwrap().files.clone()
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes
    }

    pub fn total_free_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_free
    }

    pub fn total_free_space_percent(&self) -> u64 {
        let st = self.state.lock().unwrap();
        percent_of(st.total_free, st.total_bytes)
    }

    pub fn is_too_much_free_space(&self) -> bool {
        self.total_free_space_percent() > self.cfg.max_free_space_percent()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    /// Recomputes aggregate totals. The newest `file_min_age` files and files
    /// pending deletion are not accounted.
    pub fn estimate_total_bytes(&self, pending: &BTreeSet<u64>) {
        let fl = self.file_length();
        let files = self.log.all_file_addresses();
        let skip_newest = (self.cfg.file_min_age as usize).min(files.len());
        let accounted = &files[..files.len() - skip_newest];

        let mut st = self.state.lock().unwrap();
        let mut total = 0u64;
        let mut free = 0u64;
        for f in accounted.iter().filter(|f| !pending.contains(f)) {
            total += fl;
            free += st.files.get(f).copied().unwrap_or(fl).min(fl);
        }
        st.total_bytes = total;
        st.total_free = free;
        debug!(
            "utilization estimate: {} files, total {} bytes, free {} bytes ({}%)",
            accounted.len(),
            total,
            free,
            percent_of(free, total)
        );
    }

    /// Cleaning candidates below `high_file`, most free first.
    ///
    /// Files pending deletion and files with too little free space are skipped;
    /// files without data count as fully free. The sequence stops once the
    /// yielded files cover the free space above the allowed maximum.
    pub fn files_sorted_by_utilization(
        &self,
        high_file: u64,
        pending: &BTreeSet<u64>,
    ) -> FragmentedFiles {
        let fl = self.file_length();
        let max_free_percent = self.cfg.max_free_space_percent();
        let file_threshold = fl.saturating_mul(max_free_percent) / 100;

        let st = self.state.lock().unwrap();
        let mut candidates: Vec<(u64, u64)> = self
            .log
            .all_file_addresses()
            .into_iter()
            .filter(|f| *f < high_file && !pending.contains(f))
            .filter_map(|f| {
                let free = st.files.get(&f).copied().unwrap_or(fl);
                if free > file_threshold || !st.files.contains_key(&f) {
                    Some((f, free))
                } else {
                    None
                }
            })
            .collect();
        // по убыванию свободного места, при равенстве — старые файлы первыми
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let allowed = st.total_bytes.saturating_mul(max_free_percent) / 100;
        let excess = st.total_free.saturating_sub(allowed);
        FragmentedFiles {
            candidates: candidates.into_iter(),
            excess,
            consumed: 0,
        }
    }

    /// Picks the profile source. Precedence: forced rescan, external dump,
    /// persisted store (non-trivial log, consistent data), rescan.
    pub fn load(&self) -> Result<ProfileSource> {
        if self.cfg.utilization_from_scratch {
            info!("utilization: forced recomputation from scratch");
            return Ok(ProfileSource::Scratch);
        }

        if let Some(path) = self.cfg.utilization_from_file.as_deref() {
            match ProfileDump::read(Path::new(path)) {
                Ok(dump) => {
                    let n = self.install(dump.into_map());
                    info!("utilization: loaded {} file(s) from dump {}", n, path);
                    return Ok(ProfileSource::Dump);
                }
                Err(e) => {
                    warn!("utilization: cannot use dump {}: {:#}; recomputing", path, e);
                    return Ok(ProfileSource::Scratch);
                }
            }
        }

        let store = match self.env.profile_store() {
            Some(s) if s.exists() && self.log.number_of_files() > 1 => s,
            _ => return Ok(ProfileSource::Scratch),
        };
        let stored = match store.load() {
            Ok(m) => m,
            Err(e) => {
                warn!("utilization: persisted profile unreadable: {:#}; recomputing", e);
                return Ok(ProfileSource::Scratch);
            }
        };
        let high_file = self.log.high_file_address();
        let missing = self
            .log
            .all_file_addresses()
            .into_iter()
            .filter(|f| *f < high_file && !stored.contains_key(f))
            .count();
        if missing > 0 {
            warn!("utilization: persisted profile misses {} file(s); recomputing", missing);
            return Ok(ProfileSource::Scratch);
        }
        let n = self.install(stored);
        {
            self.state.lock().unwrap().dirty = false;
        }
        info!("utilization: loaded {} file(s) from profile store", n);
        Ok(ProfileSource::Store)
    }

    /// Replaces the map with `files`, keeping only live files and clamping to file length.
    /// Returns the number of installed entries.
    pub fn install(&self, files: BTreeMap<u64, u64>) -> usize {
        let fl = self.file_length();
        let live: BTreeSet<u64> = self.log.all_file_addresses().into_iter().collect();
        let mut st = self.state.lock().unwrap();
        st.files = files
            .into_iter()
            .filter(|(f, _)| live.contains(f))
            .map(|(f, free)| (f, free.min(fl)))
            .collect();
        st.dirty = true;
        st.files.len()
    }

    /// Persists the profile if it changed since the last save.
    pub fn save(&self) -> Result<bool> {
        let store = match self.env.profile_store() {
            Some(s) => s,
            None => return Ok(false),
        };
        let files = {
            let st = self.state.lock().unwrap();
            if !st.dirty {
                return Ok(false);
            }
            st.files.clone()
        };
        store.save(&files)?;
        self.state.lock().unwrap().dirty = false;
        debug!("utilization: saved {} file(s)", files.len());
        Ok(true)
    }

    /// Writes the profile as a JSON dump readable by `utilization_from_file`.
    pub fn dump(&self, path: &Path) -> Result<()> {
        ProfileDump::from_map(&self.snapshot()).write(path)
    }
}

/// Self-limiting sequence of (file, free bytes) cleaning candidates.
pub struct FragmentedFiles {
    candidates: std::vec::IntoIter<(u64, u64)>,
    excess: u64,
    consumed: u64,
}

impl FragmentedFiles {
    /// Free bytes above the allowed maximum at the time the sequence was built.
    pub fn excess(&self) -> u64 {
        self.excess
    }
}

impl Iterator for FragmentedFiles {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.consumed >= self.excess {
            return None;
        }
        let (file, free) = self.candidates.next()?;
        self.consumed = self.consumed.saturating_add(free);
        Some((file, free))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::mem::MemEnvironment;

    fn env_with_files(n: u64, fl: u64, cfg: GcConfig) -> Arc<MemEnvironment> {
        let env = MemEnvironment::new(cfg, fl);
        // заполняем n полных файлов метаданными (по одной записи на файл)
        for _ in 0..n {
            env.append_meta(&vec![0u8; (fl - 16) as usize]).unwrap();
        }
        // и начинаем (n+1)-й — high file
        env.append_meta(&[1u8; 4]).unwrap();
        env
    }

    #[test]
    fn expired_bytes_clamped_and_unknown_files_skipped() {
        let env = env_with_files(3, 1000, GcConfig::default());
        let p = UtilizationProfile::new(env.clone());
        p.add_file(0);
        p.add_file(1000);
        p.fetch_expired_loggables(&[
            ExpiredLoggable { address: 10, length: 600 },
            ExpiredLoggable { address: 700, length: 600 },
            ExpiredLoggable { address: 1010, length: 50 },
            ExpiredLoggable { address: 2010, length: 50 },
        ]);
        assert_eq!(p.free_bytes(0), Some(1000));
        assert_eq!(p.free_bytes(1000), Some(50));
        assert_eq!(p.free_bytes(2000), None);

        p.reset_file(0);
        assert_eq!(p.free_bytes(0), Some(0));
        p.remove_file(0);
        assert_eq!(p.free_bytes(0), None);
    }

    #[test]
    fn candidates_sorted_filtered_and_self_limited() {
        let cfg = GcConfig::default().with_min_utilization(50).with_file_min_age(0);
        let env = env_with_files(5, 1000, cfg);
        let p = UtilizationProfile::new(env.clone());
        // файлы 0..4000 полные, 5000 — high
        let mut m = BTreeMap::new();
        m.insert(0, 900);
        m.insert(1000, 100); // ниже порога 50%
        m.insert(2000, 700);
        // 3000 — нет данных => считается полностью свободным
        m.insert(4000, 600);
        m.insert(5000, 0);
        p.install(m);

        let pending: BTreeSet<u64> = [4000u64].into_iter().collect();
        p.estimate_total_bytes(&pending);
        // учтены 0,1000,2000,3000,5000: total 5000, free 900+100+700+1000+0 = 2700
        assert_eq!(p.total_bytes(), 5000);
        assert_eq!(p.total_free_bytes(), 2700);
        assert!(p.is_too_much_free_space());

        // excess = 2700 - 2500 = 200 → хватает одного файла
        let v: Vec<u64> = p
            .files_sorted_by_utilization(5000, &pending)
            .map(|(f, _)| f)
            .collect();
        assert_eq!(v, vec![3000]);

        // без самоограничения порядок: 3000 (1000), 0 (900), 2000 (700)
        let mut big = p.files_sorted_by_utilization(5000, &pending);
        big.excess = u64::MAX;
        let all: Vec<u64> = big.map(|(f, _)| f).collect();
        assert_eq!(all, vec![3000, 0, 2000]);
    }

    #[test]
    fn load_prefers_dump_then_store() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "qgc-util-{}-{}",
            std::process::id(),
            crate::util::now_millis()
        ));
        std::fs::create_dir_all(&dir)?;
        let dump = dir.join("u.json");
        let mut m = BTreeMap::new();
        m.insert(0u64, 5000u64);
        m.insert(77_000, 1);
        ProfileDump::from_map(&m).write(&dump)?;

        let cfg = GcConfig::default().with_utilization_from_file(Some(dump.to_string_lossy()));
        let env = env_with_files(2, 1000, cfg);
        let p = UtilizationProfile::new(env.clone());
        assert_eq!(p.load()?, ProfileSource::Dump);
        // чужие адреса отброшены, значение обрезано длиной файла
        assert_eq!(p.snapshot().into_iter().collect::<Vec<_>>(), vec![(0, 1000)]);

        // без дампа и без сохранённого профиля — пересчёт
        let env = env_with_files(2, 1000, GcConfig::default());
        let p = UtilizationProfile::new(env.clone());
        assert_eq!(p.load()?, ProfileSource::Scratch);
        p.add_file(0);
        p.add_file(1000);
        assert!(p.save()?);
        assert!(!p.save()?, "clean profile is not rewritten");
        let p2 = UtilizationProfile::new(env.clone());
        assert_eq!(p2.load()?, ProfileSource::Store);
        Ok(())
    }
}
