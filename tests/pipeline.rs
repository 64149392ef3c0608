//! End-to-end runs of the scatter-gather pipeline on the local backend.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};
use chunkwise::{
    Error,
    dispatch::{Backend, DispatchParams, Dispatcher, LocalBackend, WorkerContext},
    genome::{
        Chromosome, GeneticMap, Record,
        source::MemorySource,
        sink::{CollectSink, Sink},
    },
    pipeline::{ChromState, Params, Pipeline},
    plan::{self, Chunk, EmptyPolicy, WindowParams},
};

fn chromosome(name: &str, positions: impl IntoIterator<Item = u32>) -> Chromosome {
    let records = positions.into_iter().map(|p| Record::new(p, format!("{}:{}", name, p))).collect();
    Chromosome::new(name, records, Arc::new(GeneticMap::uniform())).unwrap()
}

/// 100-unit windows with 20-unit overlaps (1 unit = 1e-6 cM = 1 bp at uniform rate).
fn params() -> Params {
    Params {
        windows: WindowParams { chunk_size_cm: 0.0001, overlap_cm: 0.00002 },
        dispatch: DispatchParams {
            max_in_flight: 4,
            poll_interval: Duration::from_millis(1),
            backoff_base: Duration::ZERO,
            ..DispatchParams::default()
        },
        chrom_threads: 2,
        seed: Some(1),
        ..Params::default()
    }
}

/// Worker output: every input record with a new payload.
fn phase(chunk: &Chunk) -> Vec<Record> {
    chunk.records().iter().map(|rec| Record::new(rec.pos(), format!("{}|phased", rec.data()))).collect()
}

fn expected(chrom: &Chromosome) -> Vec<Record> {
    chrom.records().iter().map(|rec| Record::new(rec.pos(), format!("{}|phased", rec.data()))).collect()
}

type Calls = Arc<Mutex<HashMap<(String, usize), u32>>>;

/// Counts calls per `(chrom, window)`, returns the new count.
fn count(calls: &Calls, chunk: &Chunk) -> u32 {
    let mut calls = calls.lock().unwrap();
    let n = calls.entry((chunk.window().chrom().to_owned(), chunk.index())).or_default();
    *n += 1;
    *n
}

fn backend<F>(f: F) -> Arc<dyn Backend>
where F: Fn(&Chunk, &WorkerContext) -> Result<Vec<Record>, Error> + Send + Sync + 'static,
{
    Arc::new(LocalBackend::new(f, 3))
}

#[test]
fn partial_failure_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr1", (1..=450).step_by(3));
    let calls = Calls::default();
    let worker_calls = Arc::clone(&calls);
    let backend = backend(move |chunk, ctx| {
        count(&worker_calls, chunk);
        if chunk.index() == 2 && ctx.attempt <= 2 {
            Err(Error::JobFailed(format!("attempt {} crashed", ctx.attempt)))
        } else {
            Ok(phase(chunk))
        }
    });
    let params = Params {
        dispatch: DispatchParams { max_retries: 3, ..params().dispatch },
        ..params()
    };
    let pipeline = Pipeline::new(params, backend, dir.path()).unwrap();
    let mut sink = CollectSink::new();
    pipeline.run(&MemorySource::new(vec![chrom.clone()]), &mut sink).unwrap();

    let merged = sink.get("chr1").unwrap();
    assert_eq!(merged.records(), &expected(&chrom)[..]);
    assert_eq!(merged.span(), chrom.extent());
    let status = pipeline.status();
    assert_eq!(status.chrom_state("chr1"), Some(ChromState::Succeeded));
    assert_eq!(status.retries("chr1", 2), Some(2));
    assert_eq!(status.retries("chr1", 1), Some(0));
    assert_eq!(calls.lock().unwrap()[&("chr1".to_owned(), 2)], 3);
    assert!(dir.path().join("chr1").join("window_0002").join("attempt_3").exists());
    assert!(dir.path().join("chr1").join("regions.lines").exists());
    assert!(dir.path().join("params.json").exists());
}

#[test]
fn preempted_jobs_are_resubmitted() {
    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr1", (10..=300).step_by(5));
    let backend = backend(move |chunk, ctx| {
        if ctx.attempt == 1 {
            Err(Error::JobPreempted("spot instance reclaimed".to_owned()))
        } else {
            Ok(phase(chunk))
        }
    });
    let pipeline = Pipeline::new(params(), backend, dir.path()).unwrap();
    let mut sink = CollectSink::new();
    pipeline.run(&MemorySource::new(vec![chrom.clone()]), &mut sink).unwrap();
    assert_eq!(sink.get("chr1").unwrap().records(), &expected(&chrom)[..]);
    let status = pipeline.status().chrom("chr1").unwrap();
    assert!(status.jobs.values().all(|job| job.retries == 1));
}

#[test]
fn retries_are_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr1", (1..=450).step_by(3));
    let windows = params().windows.plan(&chrom).unwrap();
    let chunks = plan::extract_all(&chrom, &windows, EmptyPolicy::Fail).unwrap();
    let calls = Calls::default();
    let worker_calls = Arc::clone(&calls);
    let backend = backend(move |chunk, _ctx| {
        count(&worker_calls, chunk);
        if chunk.index() == 1 { Err(Error::JobFailed("always fails".to_owned())) } else { Ok(phase(chunk)) }
    });
    let dispatch = DispatchParams { max_retries: 2, fail_fast: false, ..params().dispatch };
    let mut dispatcher = Dispatcher::new(backend, dispatch, dir.path());
    let outcomes = dispatcher.run("chr1", chunks).unwrap();

    assert_eq!(outcomes.keys().copied().collect::<Vec<_>>(), (0..windows.len()).collect::<Vec<_>>());
    match &outcomes[&1] {
        Err(Error::FatallyFailed { chrom, window, attempts, reason }) => {
            assert_eq!((chrom.as_str(), *window, *attempts), ("chr1", 1, 3));
            assert!(reason.contains("always fails"));
        }
        res => panic!("Unexpected outcome {:?}", res),
    }
    assert!(outcomes.iter().filter(|&(&i, _)| i != 1).all(|(_, res)| res.is_ok()));
    assert_eq!(calls.lock().unwrap()[&("chr1".to_owned(), 1)], 3);
}

#[test]
fn fatal_failure_blocks_only_its_chromosome() {
    let dir = tempfile::tempdir().unwrap();
    let chr1 = chromosome("chr1", (1..=450).step_by(3));
    let chr2 = chromosome("chr2", (1..=450).step_by(4));
    let backend = backend(move |chunk, _ctx| {
        if chunk.window().chrom() == "chr2" && chunk.index() == 1 {
            Err(Error::JobFailed("segmentation fault".to_owned()))
        } else {
            Ok(phase(chunk))
        }
    });
    let params = Params {
        dispatch: DispatchParams { max_retries: 1, ..params().dispatch },
        ..params()
    };
    let pipeline = Pipeline::new(params, backend, dir.path()).unwrap();
    let mut sink = CollectSink::new();
    let res = pipeline.run(&MemorySource::new(vec![chr1.clone(), chr2]), &mut sink);
    assert!(matches!(res, Err(Error::RuntimeError(_))));

    assert_eq!(sink.get("chr1").unwrap().records(), &expected(&chr1)[..]);
    assert!(sink.get("chr2").is_none());
    let status = pipeline.status();
    assert_eq!(status.chrom_state("chr1"), Some(ChromState::Succeeded));
    assert!(matches!(status.chrom_state("chr2"), Some(ChromState::Failed(_))));
    assert_eq!(status.retries("chr2", 1), Some(1));
    assert!(!status.all_succeeded());
}

#[test]
fn empty_windows() {
    let dir = tempfile::tempdir().unwrap();
    // Windows [161, 261) and [241, 341) contain no records.
    let chrom = chromosome("chr1", (1..=100).chain(400..=450));
    let calls = Calls::default();
    let worker_calls = Arc::clone(&calls);
    let backend = backend(move |chunk, _ctx| {
        assert!(!chunk.is_empty());
        count(&worker_calls, chunk);
        Ok(phase(chunk))
    });

    let pipeline = Pipeline::new(params(), Arc::clone(&backend), dir.path().join("fail")).unwrap();
    let res = pipeline.run(&MemorySource::new(vec![chrom.clone()]), &mut CollectSink::new());
    assert!(res.is_err());
    match pipeline.status().chrom_state("chr1") {
        Some(ChromState::Failed(reason)) => assert!(reason.contains("window 2")),
        state => panic!("Unexpected state {:?}", state),
    }

    let params = Params { empty_policy: EmptyPolicy::Allow, ..params() };
    let pipeline = Pipeline::new(params, backend, dir.path().join("allow")).unwrap();
    let mut sink = CollectSink::new();
    pipeline.run(&MemorySource::new(vec![chrom.clone()]), &mut sink).unwrap();
    let merged = sink.get("chr1").unwrap();
    assert_eq!(merged.records(), &expected(&chrom)[..]);
    assert_eq!(merged.contributions()[2..4], [0, 0]);
    assert_eq!(calls.lock().unwrap().len(), 4);
}

#[test]
fn timeout_triggers_retry() {
    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr1", (1..=200).step_by(2));
    let backend = backend(move |chunk, ctx| {
        if chunk.index() == 0 && ctx.attempt == 1 {
            let timer = Instant::now();
            while !ctx.cancel.is_cancelled() && timer.elapsed() < Duration::from_secs(10) {
                thread::sleep(Duration::from_millis(1));
            }
            return Err(Error::Cancelled("interrupted".to_owned()));
        }
        Ok(phase(chunk))
    });
    let params = Params {
        dispatch: DispatchParams { timeout: Some(Duration::from_millis(100)), ..params().dispatch },
        ..params()
    };
    let pipeline = Pipeline::new(params, backend, dir.path()).unwrap();
    let mut sink = CollectSink::new();
    pipeline.run(&MemorySource::new(vec![chrom.clone()]), &mut sink).unwrap();
    assert_eq!(sink.get("chr1").unwrap().records(), &expected(&chrom)[..]);
    assert_eq!(pipeline.status().retries("chr1", 0), Some(1));
}

#[test]
fn queued_tasks_do_not_time_out() {
    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr1", (1..=700).step_by(2));
    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(|chunk: &Chunk, _ctx: &WorkerContext| {
        thread::sleep(Duration::from_millis(20));
        Ok::<_, Error>(phase(chunk))
    }, 1));
    let params = Params {
        dispatch: DispatchParams {
            max_in_flight: 8,
            max_retries: 0,
            timeout: Some(Duration::from_millis(150)),
            ..params().dispatch
        },
        ..params()
    };
    let pipeline = Pipeline::new(params, backend, dir.path()).unwrap();
    let mut sink = CollectSink::new();
    pipeline.run(&MemorySource::new(vec![chrom.clone()]), &mut sink).unwrap();
    assert_eq!(sink.get("chr1").unwrap().records(), &expected(&chrom)[..]);
    for index in 0..9 {
        assert_eq!(pipeline.status().retries("chr1", index), Some(0));
    }
}

#[test]
fn in_flight_jobs_are_bounded() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr1", (1..=1000).step_by(2));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (worker_running, worker_peak) = (Arc::clone(&running), Arc::clone(&peak));
    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(move |chunk: &Chunk, _ctx: &WorkerContext| {
        let now = worker_running.fetch_add(1, Ordering::SeqCst) + 1;
        worker_peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        worker_running.fetch_sub(1, Ordering::SeqCst);
        Ok::<_, Error>(phase(chunk))
    }, 8));
    let params = Params {
        dispatch: DispatchParams { max_in_flight: 2, ..params().dispatch },
        ..params()
    };
    let pipeline = Pipeline::new(params, backend, dir.path()).unwrap();
    let mut sink = CollectSink::new();
    pipeline.run(&MemorySource::new(vec![chrom.clone()]), &mut sink).unwrap();
    assert_eq!(sink.get("chr1").unwrap().records(), &expected(&chrom)[..]);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak concurrency {}", peak);
}

#[test]
fn cancellation_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr1", (1..=450).step_by(3));
    let backend = backend(move |_chunk, ctx| {
        let timer = Instant::now();
        while !ctx.cancel.is_cancelled() {
            if timer.elapsed() > Duration::from_secs(10) {
                return Ok(Vec::new());
            }
            thread::sleep(Duration::from_millis(1));
        }
        Err(Error::Cancelled("interrupted".to_owned()))
    });
    let pipeline = Pipeline::new(params(), backend, dir.path()).unwrap();
    let token = pipeline.cancel_token().clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        token.cancel();
    });
    let timer = Instant::now();
    let mut sink = CollectSink::new();
    assert!(pipeline.run(&MemorySource::new(vec![chrom]), &mut sink).is_err());
    canceller.join().unwrap();
    assert!(timer.elapsed() < Duration::from_secs(5));
    assert!(sink.outputs().is_empty());
    let status = pipeline.status().chrom("chr1").unwrap();
    assert!(matches!(status.state, ChromState::Failed(_)));
    assert!(status.jobs.values().all(|job| job.state.is_terminal()));
}

#[test]
fn resume_from_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr1", (1..=450).step_by(3));
    let params = Params {
        dispatch: DispatchParams { max_retries: 0, fail_fast: false, ..params().dispatch },
        ..params()
    };
    let source = MemorySource::new(vec![chrom.clone()]);

    let backend1 = backend(move |chunk, _ctx| {
        if chunk.index() == 2 { Err(Error::JobFailed("disk full".to_owned())) } else { Ok(phase(chunk)) }
    });
    let pipeline = Pipeline::new(params.clone(), backend1, dir.path()).unwrap().enable_checkpoints();
    assert!(pipeline.run(&source, &mut CollectSink::new()).is_err());

    let calls = Calls::default();
    let worker_calls = Arc::clone(&calls);
    let backend2 = backend(move |chunk, _ctx| {
        count(&worker_calls, chunk);
        Ok(phase(chunk))
    });
    let pipeline = Pipeline::new(params, backend2, dir.path()).unwrap().enable_checkpoints();
    let mut sink = CollectSink::new();
    pipeline.run(&source, &mut sink).unwrap();
    assert_eq!(sink.get("chr1").unwrap().records(), &expected(&chrom)[..]);
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[&("chr1".to_owned(), 2)], 1);
}

#[test]
fn changed_parameters_require_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr1", (1..=200).step_by(2));
    let source = MemorySource::new(vec![chrom]);
    let backend = backend(|chunk, _ctx| Ok(phase(chunk)));
    Pipeline::new(params(), Arc::clone(&backend), dir.path()).unwrap()
        .run(&source, &mut CollectSink::new()).unwrap();

    let wider = Params { windows: WindowParams { chunk_size_cm: 0.00015, overlap_cm: 0.00002 }, ..params() };
    let res = Pipeline::new(wider.clone(), Arc::clone(&backend), dir.path()).unwrap()
        .run(&source, &mut CollectSink::new());
    assert!(matches!(res, Err(Error::InvalidConfig(_))));

    let wider = Params { rerun: chunkwise::pipeline::Rerun::All, ..wider };
    Pipeline::new(wider, backend, dir.path()).unwrap()
        .run(&source, &mut CollectSink::new()).unwrap();
}

#[test]
fn invalid_windows_are_rejected_before_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(|chunk, _ctx| Ok(phase(chunk)));
    let params = Params { windows: WindowParams { chunk_size_cm: 0.0001, overlap_cm: 0.00008 }, ..params() };
    let res = Pipeline::new(params, backend, dir.path());
    assert!(matches!(res, Err(Error::InvalidConfig(_))));
    assert!(!dir.path().join("params.json").exists());
}

#[test]
fn tsv_sink_skips_finished_chromosomes() {
    use chunkwise::genome::{sink::TsvSink, source::{Source, TsvSource}};

    let dir = tempfile::tempdir().unwrap();
    let chrom = chromosome("chr7", (1..=200).step_by(2));
    let backend = backend(|chunk, _ctx| Ok(phase(chunk)));
    let mut sink = TsvSink::new(dir.path().join("out")).unwrap();
    assert!(!sink.is_done("chr7"));
    let pipeline = Pipeline::new(params(), backend, dir.path().join("work")).unwrap();
    let source = MemorySource::new(vec![chrom.clone()]);
    pipeline.run(&source, &mut sink).unwrap();
    assert!(sink.is_done("chr7"));

    let written = TsvSource::new(sink.path("chr7")).load("chr7").unwrap();
    assert_eq!(written.records(), &expected(&chrom)[..]);

    // Second run does nothing with the default rerun mode.
    pipeline.run(&source, &mut sink).unwrap();
    assert_eq!(pipeline.status().chrom_state("chr7"), Some(ChromState::Succeeded));
}

#[cfg(unix)]
mod command_worker {
    use std::path::Path;
    use chunkwise::dispatch::{AlgoConfig, CancelToken, CommandWorker, Worker};
    use super::*;

    fn run(worker: &CommandWorker, dir: &Path) -> Result<Vec<Record>, Error> {
        let chrom = chromosome("chr3", (1..=50).step_by(5));
        let windows = plan::plan("chr3", chrom.extent(), 100, 20).unwrap();
        let chunk = plan::extract(&chrom, &windows[0], EmptyPolicy::Fail).unwrap();
        let ctx = WorkerContext {
            attempt: 1,
            work_dir: dir.to_owned(),
            algo: Arc::new(AlgoConfig::default()),
            cancel: CancelToken::new(),
        };
        worker.run(&chunk, &ctx)
    }

    #[test]
    fn copies_input() {
        let dir = tempfile::tempdir().unwrap();
        let worker = CommandWorker::new("sh", ["-c", "cp {input} {output}"]).unwrap();
        let records = run(&worker, dir.path()).unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[1], Record::new(6, "chr3:6"));
    }

    #[test]
    fn exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let worker = CommandWorker::new("sh", ["-c", "exit 143"]).unwrap();
        assert!(matches!(run(&worker, &dir.path().join("a")), Err(Error::JobPreempted(_))));
        let worker = CommandWorker::new("sh", ["-c", "echo broken >&2; exit 3"]).unwrap();
        match run(&worker, &dir.path().join("b")) {
            Err(Error::JobFailed(reason)) => assert!(reason.contains("broken")),
            res => panic!("Unexpected result {:?}", res),
        }
        let worker = CommandWorker::new("sh", ["-c", "cat {reference}"]).unwrap();
        assert!(matches!(run(&worker, &dir.path().join("c")), Err(Error::InvalidConfig(_))));
    }
}
