//! Process wiring: connect the two channels, spawn the reactors and
//! background threads, and block until shutdown.
//!
//! Shutdown is driven by stdin EOF from the controller (or SIGTERM /
//! SIGINT): the flag flips, worker queues close and drain, both sockets
//! shut down, and every thread is joined before `serve` returns.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crossbeam::channel::Receiver;

use crate::config::{Limits, WorkerArgs};
use crate::daemon::checkpoint::{run_checkpoint_loop, wait_or_stop};
use crate::daemon::control::Control;
use crate::daemon::metrics::Metrics;
use crate::daemon::responder::Responder;
use crate::daemon::transport::{read_chunk, Conn, Endpoint, ReadEvent, RetryWriter};
use crate::daemon::worker::{WorkMsg, WorkerHandle};
use crate::kv::StoreFactory;
use crate::proto::{Event, FrameSplitter, InternalOpcode};
use crate::telemetry::Telemetry;
use crate::vm::EngineFactory;
use crate::Result;

const READ_CHUNK: usize = 64 * 1024;
const IDLE_PAUSE: Duration = Duration::from_millis(2);
const TICKER_STARTUP_DELAY: Duration = Duration::from_secs(2);
const TICKER_PERIOD: Duration = Duration::from_secs(7);

/// External collaborators injected at process start.
pub struct Collaborators {
    pub engines: Arc<dyn EngineFactory>,
    pub kv: Arc<dyn StoreFactory>,
    pub telemetry: Telemetry,
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Watch stdin and treat EOF as the shutdown signal. Disabled by
    /// in-process tests, which flip the shutdown flag directly.
    pub watch_stdin: bool,
    pub limits: Limits,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            watch_stdin: true,
            limits: Limits::default(),
        }
    }
}

pub fn serve(args: WorkerArgs, collaborators: Collaborators) -> Result<()> {
    serve_with(
        args,
        collaborators,
        Arc::new(AtomicBool::new(false)),
        ServeOptions::default(),
    )
}

pub fn serve_with(
    args: WorkerArgs,
    collaborators: Collaborators,
    shutdown: Arc<AtomicBool>,
    options: ServeOptions,
) -> Result<()> {
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    let feedback_endpoint = Endpoint::feedback_from_args(&args).map_err(crate::Error::from)?;
    let main_endpoint = Endpoint::main_from_args(&args).map_err(crate::Error::from)?;

    tracing::info!(
        app = %args.appname,
        worker_id = %args.worker_id,
        batch_size = args.batch_size,
        feedback_batch_size = args.feedback_batch_size,
        "starting worker"
    );

    let feedback_conn = Conn::connect(&feedback_endpoint).map_err(crate::Error::from)?;
    let main_conn = Conn::connect(&main_endpoint).map_err(crate::Error::from)?;
    tracing::info!("connected to controller on both channels");

    let metrics = Arc::new(Metrics::default());
    let responder = Arc::new(Responder::new(args.batch_size, Arc::clone(&metrics)));
    let workers: Arc<RwLock<Vec<Arc<WorkerHandle>>>> = Arc::new(RwLock::new(Vec::new()));
    let using_timer = Arc::new(AtomicBool::new(false));
    let checkpoint_interval_ms = Arc::new(AtomicU64::new(1000));
    // Hanging up this channel wakes every background loop.
    let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(0);

    // Feedback channel: reads are drained, writes belong to the
    // checkpoint thread.
    let feedback_reader = feedback_conn
        .try_clone()
        .map_err(|err| crate::Error::Transport(err.into()))?;
    let feedback_writer = RetryWriter::new(
        feedback_conn,
        Arc::clone(&metrics),
        Arc::clone(&shutdown),
    );

    let main_writer = RetryWriter::new(
        main_conn
            .try_clone()
            .map_err(|err| crate::Error::Transport(err.into()))?,
        Arc::clone(&metrics),
        Arc::clone(&shutdown),
    );

    let control = Control::new(
        args.clone(),
        options.limits.clone(),
        Arc::clone(&metrics),
        Arc::clone(&responder),
        Arc::clone(&workers),
        Arc::clone(&collaborators.engines),
        Arc::clone(&collaborators.kv),
        collaborators.telemetry.clone(),
        Arc::clone(&using_timer),
        Arc::clone(&checkpoint_interval_ms),
        Arc::clone(&shutdown),
    );

    let reactor = {
        let metrics = Arc::clone(&metrics);
        let shutdown = Arc::clone(&shutdown);
        let limits = options.limits.clone();
        std::thread::Builder::new()
            .name("main-reactor".into())
            .spawn(move || run_main_reactor(main_conn, main_writer, control, metrics, limits, shutdown))
            .expect("failed to spawn main reactor")
    };

    let feedback = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("feedback-reactor".into())
            .spawn(move || run_feedback_drain(feedback_reader, shutdown))
            .expect("failed to spawn feedback reactor")
    };

    let checkpointer = {
        let workers = Arc::clone(&workers);
        let interval = Arc::clone(&checkpoint_interval_ms);
        let stop = stop_rx.clone();
        let batch = args.feedback_batch_size;
        std::thread::Builder::new()
            .name("checkpointer".into())
            .spawn(move || run_checkpoint_loop(workers, feedback_writer, interval, batch, stop))
            .expect("failed to spawn checkpoint writer")
    };

    let ticker = {
        let workers = Arc::clone(&workers);
        let using_timer = Arc::clone(&using_timer);
        let stop = stop_rx.clone();
        std::thread::Builder::new()
            .name("timer-ticker".into())
            .spawn(move || run_timer_ticker(workers, using_timer, stop))
            .expect("failed to spawn timer ticker")
    };
    drop(stop_rx);

    if options.watch_stdin {
        // Not joined: a blocked stdin read dies with the process.
        let shutdown = Arc::clone(&shutdown);
        let _ = std::thread::Builder::new()
            .name("stdin-watcher".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    if line.is_err() || shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
                tracing::info!("stdin closed; shutting down");
                shutdown.store(true, Ordering::Release);
            });
    }

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
    }

    // Wake the background loops, then let the workers drain.
    drop(stop_tx);
    tracing::info!("draining worker queues");
    for worker in workers.read().expect("worker list lock poisoned").iter() {
        worker.queue.close();
    }

    let _ = reactor.join();
    let _ = feedback.join();
    let _ = checkpointer.join();
    let _ = ticker.join();

    tracing::info!("worker stopped");
    Ok(())
}

fn run_main_reactor(
    mut conn: Conn,
    mut writer: RetryWriter,
    mut control: Control,
    metrics: Arc<Metrics>,
    limits: Limits,
    shutdown: Arc<AtomicBool>,
) {
    let mut splitter = FrameSplitter::new(limits.max_frame_bytes);
    let mut scratch = vec![0u8; READ_CHUNK];
    let mut seen_oversize = 0u64;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match read_chunk(&mut conn, &mut scratch) {
            ReadEvent::Data(n) => {
                splitter.extend(&scratch[..n]);
                while let Some(frame) = splitter.next_frame() {
                    control.handle_frame(frame);
                }
                let oversize = splitter.oversize_dropped();
                if oversize > seen_oversize {
                    metrics.add(&metrics.frames_dropped, oversize - seen_oversize);
                    seen_oversize = oversize;
                }
                control.maybe_flush(&mut writer);
            }
            ReadEvent::WouldBlock => {
                // Workers tick the batch counter asynchronously; idle
                // boundaries still flush.
                control.maybe_flush(&mut writer);
                std::thread::sleep(IDLE_PAUSE);
            }
            ReadEvent::Eof => {
                tracing::info!("main channel closed by controller");
                break;
            }
            ReadEvent::Failed(err) => {
                tracing::error!(%err, "main channel read failed");
                break;
            }
        }
    }

    // A dead main channel is a process-level failure: propagate it to the
    // shutdown sequence, which closes the queues these joins wait on.
    shutdown.store(true, Ordering::Release);
    for worker in control.take_joins() {
        let _ = worker.join();
    }
    writer.shutdown_conn();
}

fn run_feedback_drain(mut conn: Conn, shutdown: Arc<AtomicBool>) {
    let mut scratch = vec![0u8; 8 * 1024];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match read_chunk(&mut conn, &mut scratch) {
            ReadEvent::Data(n) => {
                tracing::trace!(bytes = n, "discarding feedback channel input");
            }
            ReadEvent::WouldBlock => std::thread::sleep(Duration::from_millis(10)),
            ReadEvent::Eof => {
                tracing::info!("feedback channel closed by controller");
                break;
            }
            ReadEvent::Failed(err) => {
                tracing::error!(%err, "feedback channel read failed");
                break;
            }
        }
    }
}

fn run_timer_ticker(
    workers: Arc<RwLock<Vec<Arc<WorkerHandle>>>>,
    using_timer: Arc<AtomicBool>,
    stop: Receiver<()>,
) {
    if wait_or_stop(&stop, TICKER_STARTUP_DELAY) {
        return;
    }
    loop {
        if using_timer.load(Ordering::Relaxed) {
            for worker in workers.read().expect("worker list lock poisoned").iter() {
                worker.queue.push_front(WorkMsg::control(
                    Event::Internal,
                    InternalOpcode::ScanTimer.as_u8(),
                ));
            }
        }
        if wait_or_stop(&stop, TICKER_PERIOD) {
            return;
        }
    }
}
