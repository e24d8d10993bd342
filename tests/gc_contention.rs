use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use QuiverGC::env::OomGuard;
use QuiverGC::{
    FnJob, GarbageCollector, GcConfig, Job, JobProcessor, Log, MemEnvironment, Priority, Store,
    ThreadJobProcessor,
};

const FILE_LEN: u64 = 1024;
const WAIT: Duration = Duration::from_secs(20);

type Errors = Arc<Mutex<Vec<String>>>;

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let t0 = Instant::now();
    while t0.elapsed() < timeout {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

fn half_free_log(env: &MemEnvironment, sid: u64) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut model = BTreeMap::new();
    for i in 0..320usize {
        let k = format!("k{:07}", i).into_bytes();
        let mut v = format!("v{:07}", i).into_bytes();
        v.resize(34, b'~');
        env.put(sid, &k, &v)?;
        model.insert(k, v);
    }
    for i in (1..320usize).step_by(2) {
        let k = format!("k{:07}", i).into_bytes();
        env.delete(sid, &k)?;
        model.remove(&k);
    }
    Ok(model)
}

// Процессор очистителя, собирающий ошибки задач
fn collecting_processor(name: &str) -> (Arc<ThreadJobProcessor>, Errors) {
    let _ = env_logger::builder().is_test(true).try_init();
    let p = ThreadJobProcessor::new(name);
    let errors: Errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    p.set_exception_handler(Some(Arc::new(
        move |_p: &dyn JobProcessor, job: &dyn Job, err: &anyhow::Error| {
            e.lock().unwrap().push(format!("{}: {:#}", job.name(), err));
        },
    )));
    (p, errors)
}

fn background_cfg() -> GcConfig {
    GcConfig::default()
        .with_min_utilization(70)
        .with_start_in_ms(0)
        .with_run_period_ms(0)
        .with_transaction_acquire_timeout_ms(20)
        .with_files_deletion_delay_ms(0)
        .with_transaction_timeout_ms(60_000)
}

#[test]
fn acquire_timeouts_postpone_passes_until_contention_clears() -> Result<()> {
    let before = QuiverGC::metrics::snapshot();
    let env = MemEnvironment::new(background_cfg(), FILE_LEN);
    let sid = env.create_store("contended").structure_id();
    let model = half_free_log(&env, sid)?;
    let files = env.mem_log().all_file_addresses();

    // пять проходов подряд не получают транзакцию
    env.simulate_gc_txn_timeouts(5);

    let (p, errors) = collecting_processor("gc-contended");
    let gc = GarbageCollector::with_processor(env.clone(), p.clone());
    gc.start()?;

    let mut observed_before_sixth = 0;
    let done = wait_until(WAIT, || {
        let cleaned = files.iter().any(|f| gc.is_file_cleaned(*f))
            || !env.mem_log().removed_files().is_empty();
        // попытка №6 ещё не начиналась — значит, ни один файл не мог быть очищен
        if env.gc_txn_attempts() < 6 {
            assert!(!cleaned, "file cleaned before contention cleared");
            observed_before_sixth += 1;
        }
        cleaned
    });
    assert!(done, "gc never recovered from contention");
    assert!(observed_before_sixth > 0);
    assert!(env.gc_txn_attempts() >= 6);

    assert!(p.wait_for_jobs(WAIT));
    assert!(errors.lock().unwrap().is_empty(), "errors: {:?}", errors.lock().unwrap());
    assert_eq!(env.contents(sid)?, model);

    let after = QuiverGC::metrics::snapshot();
    assert!(after.gc_txn_acquire_timeouts >= before.gc_txn_acquire_timeouts + 5);
    assert!(after.gc_passes_failed >= before.gc_passes_failed + 5);

    gc.finish();
    Ok(())
}

#[test]
fn read_only_gc_transactions_are_retried() -> Result<()> {
    let before = QuiverGC::metrics::snapshot();
    let env = MemEnvironment::new(background_cfg(), FILE_LEN);
    let sid = env.create_store("ro").structure_id();
    let model = half_free_log(&env, sid)?;

    env.simulate_read_only_gc_txns(3);
    let (p, errors) = collecting_processor("gc-ro");
    let gc = GarbageCollector::with_processor(env.clone(), p.clone());
    gc.start()?;

    assert!(wait_until(WAIT, || !env.mem_log().removed_files().is_empty()));
    assert!(p.wait_for_jobs(WAIT));
    assert!(env.gc_txn_attempts() >= 4);
    assert!(errors.lock().unwrap().is_empty());
    assert_eq!(env.contents(sid)?, model);
    assert!(QuiverGC::metrics::snapshot().gc_txn_read_only >= before.gc_txn_read_only + 3);

    gc.finish();
    Ok(())
}

#[test]
fn failed_non_exclusive_flush_is_not_an_error() -> Result<()> {
    let env = MemEnvironment::new(background_cfg().with_use_exclusive_transaction(false), FILE_LEN);
    let sid = env.create_store("shared").structure_id();
    let model = half_free_log(&env, sid)?;

    env.simulate_flush_failures(1);
    let (p, errors) = collecting_processor("gc-nonexcl");
    let gc = GarbageCollector::with_processor(env.clone(), p.clone());
    gc.start()?;

    assert!(wait_until(WAIT, || !env.mem_log().removed_files().is_empty()));
    assert!(p.wait_for_jobs(WAIT));
    assert!(errors.lock().unwrap().is_empty());
    assert!(gc.pending_files().is_empty());
    assert!(!gc.utilization_profile().is_too_much_free_space());
    assert_eq!(env.contents(sid)?, model);

    gc.finish();
    Ok(())
}

#[test]
fn failed_exclusive_flush_is_reported() -> Result<()> {
    let cfg = GcConfig::default()
        .with_start_in_ms(3_600_000)
        .with_files_deletion_delay_ms(0)
        .with_transaction_timeout_ms(60_000);
    let env = MemEnvironment::new(cfg, FILE_LEN);
    let sid = env.create_store("strict").structure_id();
    let model = half_free_log(&env, sid)?;
    let files = env.mem_log().all_file_addresses();

    let (p, errors) = collecting_processor("gc-strict");
    let gc = GarbageCollector::with_processor(env.clone(), p.clone());
    gc.start()?;

    env.simulate_flush_failures(1);
    assert!(gc.clean_entire_log(WAIT)?);
    {
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1, "errors: {:?}", *errors);
        assert!(errors[0].contains("failed to flush"), "{}", errors[0]);
    }
    // ничего не перенесено и не помечено
    assert!(gc.pending_files().is_empty());
    assert!(env.mem_log().removed_files().is_empty());
    assert_eq!(env.mem_log().all_file_addresses(), files);
    assert_eq!(env.contents(sid)?, model);

    // со второй попытки всё получается
    assert!(gc.clean_entire_log(WAIT)?);
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert_eq!(env.mem_log().removed_files().len(), files.len());
    assert_eq!(env.contents(sid)?, model);

    gc.finish();
    Ok(())
}

#[test]
fn exhausted_time_budget_ends_the_pass_after_one_file() -> Result<()> {
    // нулевой бюджет: после первого файла транзакция фиксируется и проход заканчивается
    let cfg = GcConfig::default()
        .with_start_in_ms(3_600_000)
        .with_files_deletion_delay_ms(0)
        .with_transaction_timeout_ms(0);
    let env = MemEnvironment::new(cfg, FILE_LEN);
    let sid = env.create_store("budget").structure_id();
    let model = half_free_log(&env, sid)?;

    let gc = GarbageCollector::new(env.clone());
    gc.start()?;
    let attempts = env.gc_txn_attempts();
    assert!(gc.clean_entire_log(WAIT)?);

    assert_eq!(env.gc_txn_attempts() - attempts, 1);
    assert_eq!(env.mem_log().removed_files().len(), 1);
    assert_eq!(env.mem_log().removed_files()[0].0, 0);
    assert!(gc.pending_files().is_empty());
    assert_eq!(env.contents(sid)?, model);

    // следующий вызов продолжает со следующего файла
    assert!(gc.clean_entire_log(WAIT)?);
    assert!(env.mem_log().removed_files().len() >= 2);
    assert_eq!(env.contents(sid)?, model);

    gc.finish();
    Ok(())
}

/// Память "на исходе" с первого же вопроса; считает обращения.
struct AlwaysNearOom {
    asked: AtomicUsize,
}

impl OomGuard for AlwaysNearOom {
    fn is_near_oom(&self) -> bool {
        self.asked.fetch_add(1, Ordering::AcqRel);
        true
    }
}

#[test]
fn memory_pressure_stops_relocation_but_keeps_flushed_work() -> Result<()> {
    let cfg = GcConfig::default()
        .with_start_in_ms(3_600_000)
        .with_files_deletion_delay_ms(0)
        .with_use_exclusive_transaction(true)
        .with_transaction_timeout_ms(60_000);
    let env = MemEnvironment::new(cfg, FILE_LEN);
    let sid = env.create_store("oom").structure_id();
    let model = half_free_log(&env, sid)?;
    let files = env.mem_log().all_file_addresses();
    assert!(files.len() > 2);

    let (p, errors) = collecting_processor("gc-oom");
    let gc = GarbageCollector::with_processor(env.clone(), p.clone());
    gc.start()?;
    assert!(p.wait_for_jobs(WAIT));

    let guard = Arc::new(AlwaysNearOom {
        asked: AtomicUsize::new(0),
    });
    gc.set_oom_guard(guard.clone());

    // первый файл очищается всегда, дальше guard останавливает проход
    let outcome: Arc<Mutex<Option<(bool, Vec<u64>)>>> = Arc::new(Mutex::new(None));
    {
        let (gc2, o) = (gc.clone(), outcome.clone());
        let candidates: Vec<u64> = files[..files.len() - 1].to_vec();
        p.queue(
            FnJob::new("clean-under-pressure", move || {
                let ok = gc2.do_clean_files(candidates.clone())?;
                *o.lock().unwrap() = Some((ok, gc2.pending_files()));
                Ok(())
            }),
            Priority::Normal,
        );
        assert!(p.wait_for_jobs(WAIT));
    }

    let (ok, pending) = outcome.lock().unwrap().clone().expect("job ran");
    assert!(ok, "pass must report success");
    assert_eq!(pending, vec![files[0]]);
    assert!(guard.asked.load(Ordering::Acquire) >= 1);
    assert!(errors.lock().unwrap().is_empty(), "errors: {:?}", errors.lock().unwrap());

    // перенесённое зафиксировано, файл удалён, данные целы
    let removed: Vec<u64> = env.mem_log().removed_files().iter().map(|(f, _)| *f).collect();
    assert_eq!(removed, vec![files[0]]);
    assert!(gc.pending_files().is_empty());
    assert_eq!(env.contents(sid)?, model);

    gc.finish();
    Ok(())
}
