use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;

use QuiverGC::gc::profile_store::{FileProfileStore, ProfileDump, ProfileStore};

pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    // Бинарный профиль или JSON-дамп — пробуем по очереди.
    let entries: BTreeMap<u64, u64> = match FileProfileStore::new(path.clone()).load() {
        Ok(m) => m,
        Err(bin_err) => match ProfileDump::read(&path) {
            Ok(d) => d.into_map(),
            Err(_) => return Err(bin_err),
        },
    };

    if json {
        println!("{}", serde_json::to_string(&ProfileDump::from_map(&entries))?);
        return Ok(());
    }

    let total_free: u64 = entries.values().sum();
    println!("profile: {}", path.display());
    println!("  files:      {}", entries.len());
    println!("  free bytes: {}", total_free);
    for (addr, free) in &entries {
        println!("  file {:>12}  free {:>10}", addr, free);
    }
    Ok(())
}
