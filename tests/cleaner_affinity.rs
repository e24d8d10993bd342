use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use QuiverGC::gc::{CleanEntireLogJob, DeletePendingFilesJob};
use QuiverGC::jobs::processor::same_processor;
use QuiverGC::{
    DelegatingJobProcessor, FnJob, GarbageCollector, GcConfig, Job, JobProcessor,
    MemEnvironment, MultiThreadDelegatingJobProcessor, Priority, Store, ThreadJobProcessor,
};

const FILE_LEN: u64 = 1024;
const WAIT: Duration = Duration::from_secs(20);

fn fragmented_env() -> Result<Arc<MemEnvironment>> {
    let cfg = GcConfig::default()
        .with_start_in_ms(3_600_000)
        .with_files_deletion_delay_ms(0)
        .with_transaction_timeout_ms(60_000);
    let env = MemEnvironment::new(cfg, FILE_LEN);
    let sid = env.create_store("kv").structure_id();
    for i in 0..160usize {
        let mut v = format!("v{:07}", i).into_bytes();
        v.resize(34, b'#');
        env.put(sid, format!("k{:07}", i).as_bytes(), &v)?;
    }
    for i in (0..160usize).step_by(2) {
        env.delete(sid, format!("k{:07}", i).as_bytes())?;
    }
    Ok(env)
}

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

/// Фоновый GC с отложенным удалением; половина записей лога мертва.
fn half_free_env(delay_ms: u64) -> Result<(Arc<MemEnvironment>, u64, BTreeMap<Vec<u8>, Vec<u8>>)> {
    let cfg = GcConfig::default()
        .with_min_utilization(70)
        .with_start_in_ms(0)
        .with_run_period_ms(0)
        .with_transaction_acquire_timeout_ms(20)
        .with_files_deletion_delay_ms(delay_ms)
        .with_transaction_timeout_ms(60_000);
    let env = MemEnvironment::new(cfg, FILE_LEN);
    let sid = env.create_store("kv").structure_id();
    let mut model = BTreeMap::new();
    for i in 0..320usize {
        let k = format!("k{:07}", i).into_bytes();
        let mut v = format!("v{:07}", i).into_bytes();
        v.resize(34, b'#');
        env.put(sid, &k, &v)?;
        model.insert(k, v);
    }
    for i in (1..320usize).step_by(2) {
        let k = format!("k{:07}", i).into_bytes();
        env.delete(sid, &k)?;
        model.remove(&k);
    }
    Ok((env, sid, model))
}

fn deletions_done(gc: &GarbageCollector, env: &MemEnvironment) -> bool {
    !env.mem_log().removed_files().is_empty() && gc.pending_files().is_empty()
}

#[test]
fn structural_operations_off_cleaner_thread_are_rejected() -> Result<()> {
    let env = fragmented_env()?;
    let gc = GarbageCollector::new(env.clone());
    gc.start()?;

    assert!(gc.cleaner().thread_id().is_some());
    assert!(!gc.cleaner().is_cleaner_thread());
    assert!(gc.cleaner().check_thread().is_err());
    assert!(gc.do_clean_files(vec![0]).is_err());
    assert!(gc.clean_fragmented_files().is_err());
    assert!(gc.delete_pending_files().is_err());
    assert!(gc.pending_files().is_empty());
    assert!(env.mem_log().removed_files().is_empty());

    // на потоке очистителя те же операции проходят
    let results: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let (gc2, r) = (gc.clone(), results.clone());
        let job = FnJob::new("on-cleaner", move || {
            let mut r = r.lock().unwrap();
            r.push(format!("check={}", gc2.cleaner().check_thread().is_ok()));
            r.push(format!("first={:?}", gc2.do_clean_files(vec![0]).ok()));
            // файл уже в pending — повторная очистка запрещена
            r.push(format!("again_err={}", gc2.do_clean_files(vec![0]).is_err()));
            Ok(())
        });
        let p = gc.cleaner().processor().expect("processor");
        p.queue(job, Priority::Normal);
        assert!(p.wait_for_jobs(WAIT));
    }
    assert_eq!(
        *results.lock().unwrap(),
        vec!["check=true", "first=Some(true)", "again_err=true"]
    );
    let removed: Vec<u64> = env.mem_log().removed_files().iter().map(|(f, _)| *f).collect();
    assert_eq!(removed, vec![0]);
    assert!(gc.pending_files().is_empty());

    gc.finish();
    Ok(())
}

#[test]
fn cleaner_refuses_multi_threaded_processor() -> Result<()> {
    let env = fragmented_env()?;
    let gc = GarbageCollector::new(env.clone());
    gc.start()?;
    let before = gc.cleaner().processor().expect("processor");

    let multi = MultiThreadDelegatingJobProcessor::new("pool", 2);
    assert!(gc.cleaner().set_job_processor(multi.clone()).is_err());
    assert!(!multi.is_started());

    let now = gc.cleaner().processor().expect("processor");
    assert!(same_processor(&before, &now));
    assert!(before.is_started());

    gc.finish();
    Ok(())
}

#[test]
fn cleaner_moves_to_a_shared_thread() -> Result<()> {
    let env = fragmented_env()?;
    let gc = GarbageCollector::new(env.clone());
    gc.start()?;
    let old = gc.cleaner().processor().expect("processor");

    let host = ThreadJobProcessor::new("host");
    let on_host = DelegatingJobProcessor::new("gc-on-host", host.clone());
    gc.cleaner().set_job_processor(on_host.clone())?;

    assert!(old.is_finished());
    assert_eq!(gc.cleaner().thread_id(), host.thread_id());
    assert!(gc.cleaner().check_thread().is_err());

    assert!(gc.clean_entire_log(WAIT)?);
    assert_eq!(env.mem_log().removed_files().len(), 10);

    // другие владельцы общего потока продолжают работать
    let other = DelegatingJobProcessor::new("neighbour", host.clone());
    other.start()?;
    let ran = Arc::new(Mutex::new(false));
    let r = ran.clone();
    other.queue(
        FnJob::new("neighbour-job", move || {
            *r.lock().unwrap() = true;
            Ok(())
        }),
        Priority::Normal,
    );
    assert!(other.wait_for_jobs(WAIT));
    assert!(*ran.lock().unwrap());

    gc.finish();
    assert!(on_host.is_finished());
    // общий поток не остановлен финишем GC
    assert!(host.is_started());
    other.finish();
    host.finish();
    Ok(())
}

#[test]
fn gc_job_queued_elsewhere_moves_to_cleaner() -> Result<()> {
    let env = fragmented_env()?;
    let gc = GarbageCollector::new(env.clone());
    gc.start()?;

    let foreign = ThreadJobProcessor::new("foreign");
    foreign.start()?;
    let job = CleanEntireLogJob::new(Arc::downgrade(&gc));
    assert!(foreign.queue(job.as_job(), Priority::Normal));
    assert!(foreign.wait_for_jobs(WAIT));

    let p = gc.cleaner().processor().expect("processor");
    assert!(p.wait_for_jobs(WAIT));
    assert_eq!(job.state().thread(), gc.cleaner().thread_id());
    assert_eq!(env.mem_log().removed_files().len(), 10);

    foreign.finish();
    gc.finish();
    Ok(())
}

#[test]
fn cancelled_gc_job_is_inert_until_renewed() -> Result<()> {
    let env = fragmented_env()?;
    let gc = GarbageCollector::new(env.clone());
    gc.start()?;
    let p = gc.cleaner().processor().expect("processor");

    let job = CleanEntireLogJob::new(Arc::downgrade(&gc));
    job.cancel();
    assert!(job.link().is_cancelled());
    p.queue(job.as_job(), Priority::Normal);
    assert!(p.wait_for_jobs(WAIT));
    assert!(job.state().is_completed());
    assert!(env.mem_log().removed_files().is_empty());

    job.renew(Arc::downgrade(&gc));
    assert!(!job.link().is_cancelled());
    p.queue(job.as_job(), Priority::Normal);
    assert!(p.wait_for_jobs(WAIT));
    assert_eq!(env.mem_log().removed_files().len(), 10);

    gc.finish();
    Ok(())
}

#[test]
fn collectors_on_one_thread_keep_their_own_jobs() -> Result<()> {
    let host = ThreadJobProcessor::new("shared-host");
    let (env_a, sid_a, model_a) = half_free_env(300)?;
    let (env_b, sid_b, model_b) = half_free_env(300)?;
    let gc_a = GarbageCollector::with_processor(
        env_a.clone(),
        DelegatingJobProcessor::new("gc-a", host.clone()),
    );
    let gc_b = GarbageCollector::with_processor(
        env_b.clone(),
        DelegatingJobProcessor::new("gc-b", host.clone()),
    );

    // одинаковые задачи одного коллектора сливаются, разных — нет
    let a1 = DeletePendingFilesJob::new(Arc::downgrade(&gc_a));
    let a2 = DeletePendingFilesJob::new(Arc::downgrade(&gc_a));
    let b1 = DeletePendingFilesJob::new(Arc::downgrade(&gc_b));
    assert_eq!(a1.key(), a2.key());
    assert_ne!(a1.key(), b1.key());
    assert_ne!(
        CleanEntireLogJob::new(Arc::downgrade(&gc_a)).key(),
        CleanEntireLogJob::new(Arc::downgrade(&gc_b)).key()
    );

    gc_a.start()?;
    gc_b.start()?;
    assert_eq!(gc_a.cleaner().thread_id(), gc_b.cleaner().thread_id());

    // оба коллектора удаляют свои файлы, хотя отложенные удаления совпали по времени
    assert!(wait_until(WAIT, || deletions_done(&gc_a, &env_a)), "a: {:?}", gc_a.pending_files());
    assert!(wait_until(WAIT, || deletions_done(&gc_b, &env_b)), "b: {:?}", gc_b.pending_files());
    assert_eq!(env_a.contents(sid_a)?, model_a);
    assert_eq!(env_b.contents(sid_b)?, model_b);

    gc_a.finish();
    gc_b.finish();
    host.finish();
    Ok(())
}

#[test]
fn delayed_deletion_survives_processor_swap() -> Result<()> {
    let (env, sid, model) = half_free_env(300)?;
    let gc = GarbageCollector::new(env.clone());
    gc.start()?;

    // проход пометил файлы, удаление ждёт задержки в timed-очереди
    assert!(wait_until(WAIT, || !gc.pending_files().is_empty()));

    let fresh = ThreadJobProcessor::new("fresh-cleaner");
    gc.cleaner().set_job_processor(fresh.clone())?;
    assert_eq!(gc.cleaner().thread_id(), fresh.thread_id());

    assert!(
        wait_until(WAIT, || deletions_done(&gc, &env)),
        "still pending after swap: {:?}",
        gc.pending_files()
    );
    assert_eq!(env.contents(sid)?, model);

    // фоновые проходы продолжаются на новом процессоре
    assert!(wait_until(WAIT, || {
        !gc.utilization_profile().is_too_much_free_space() && gc.pending_files().is_empty()
    }));
    assert!(fresh.wait_for_jobs(WAIT));
    assert_eq!(env.contents(sid)?, model);

    gc.finish();
    assert!(fresh.is_finished());
    Ok(())
}
