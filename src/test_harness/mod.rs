//! Test doubles and fixtures: a scripted engine standing in for the real
//! script runtime, and an in-process controller driving a worker over real
//! sockets.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::{HandlerConfig, IpMode, IpcType, ServerSettings, WorkerArgs};
use crate::daemon::run::{serve_with, Collaborators, ServeOptions};
use crate::daemon::worker::unix_now;
use crate::kv::MemoryStore;
use crate::proto::{
    encode_inbound_frame, Header, OutboundSplitter, Payload, Response,
};
use crate::telemetry;
use crate::timer::TimerEvent;
use crate::vm::{
    render_exception, CompileInfo, Engine, EngineFactory, HandlerFlags, HostGlobals, Terminator,
    VmError,
};

// =============================================================================
// Scripted engine
// =============================================================================

/// Everything the scripted engine observed, for assertions.
#[derive(Default)]
pub struct Recorder {
    pub installed: AtomicBool,
    pub loads: AtomicU32,
    pub updates: Mutex<Vec<(String, String)>>,
    pub deletes: Mutex<Vec<String>>,
    pub callbacks: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    pub fn update_count(&self) -> usize {
        self.updates.lock().expect("recorder lock poisoned").len()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.lock().expect("recorder lock poisoned").len()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().expect("recorder lock poisoned").len()
    }

    /// Poll until `count` updates were observed or the timeout elapses.
    pub fn wait_for_updates(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.update_count() >= count)
    }

    pub fn wait_for_deletes(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.delete_count() >= count)
    }

    pub fn wait_for_callbacks(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.callback_count() >= count)
    }
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

struct ScriptedTerminator {
    flag: Arc<AtomicBool>,
}

impl Terminator for ScriptedTerminator {
    fn terminate(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Behaviour directives parsed from the "script" source:
///
/// - `function OnUpdate` / `function OnDelete` export the entry points;
/// - `// fail OnUpdate` makes `OnUpdate` raise;
/// - `// hang OnUpdate <ms>` makes it run until terminated or `<ms>` pass;
/// - `// timer <ref> <delta_secs> <callback>` creates a timer from inside
///   `OnUpdate` (delta may be negative);
/// - a source containing `syntax error` refuses to compile.
#[derive(Default)]
struct Behaviour {
    has_on_update: bool,
    has_on_delete: bool,
    fail_on_update: bool,
    hang_on_update_ms: Option<u64>,
    timer: Option<(String, i64, String)>,
}

impl Behaviour {
    fn parse(source: &str) -> Result<Self, ()> {
        if source.contains("syntax error") {
            return Err(());
        }
        let mut behaviour = Behaviour {
            has_on_update: source.contains("function OnUpdate"),
            has_on_delete: source.contains("function OnDelete"),
            ..Behaviour::default()
        };
        for line in source.lines() {
            let line = line.trim();
            if line == "// fail OnUpdate" {
                behaviour.fail_on_update = true;
            } else if let Some(rest) = line.strip_prefix("// hang OnUpdate ") {
                behaviour.hang_on_update_ms = rest.trim().parse().ok();
            } else if let Some(rest) = line.strip_prefix("// timer ") {
                let mut parts = rest.split_whitespace();
                if let (Some(reference), Some(delta), Some(callback)) =
                    (parts.next(), parts.next(), parts.next())
                {
                    if let Ok(delta) = delta.parse::<i64>() {
                        behaviour.timer =
                            Some((reference.to_string(), delta, callback.to_string()));
                    }
                }
            }
        }
        Ok(behaviour)
    }
}

pub struct ScriptedEngine {
    recorder: Arc<Recorder>,
    globals: Option<HostGlobals>,
    behaviour: Behaviour,
    terminated: Arc<AtomicBool>,
}

impl ScriptedEngine {
    fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            globals: None,
            behaviour: Behaviour::default(),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    fn hang(&self, total_ms: u64) -> Result<(), VmError> {
        let deadline = Instant::now() + Duration::from_millis(total_ms);
        while Instant::now() < deadline {
            if self.terminated.swap(false, Ordering::AcqRel) {
                return Err(VmError::Terminated);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn create_staged_timer(&self) -> Result<(), VmError> {
        let Some((reference, delta, callback)) = self.behaviour.timer.clone() else {
            return Ok(());
        };
        let Some(globals) = &self.globals else {
            return Ok(());
        };
        let Some(timers) = &globals.timers else {
            return Ok(());
        };
        let alarm = unix_now().saturating_add_signed(delta);
        let event = TimerEvent {
            partition: globals.current.vb(),
            alarm_time: alarm,
            reference,
            callback,
            context: r#"{"src":"timer"}"#.into(),
            origin_seq: globals.current.seq(),
        };
        timers.set(event).map_err(|err| VmError::Exception {
            rendered: render_exception(
                &format!("Uncaught Error: createTimer failed: {err}"),
                "handler.js",
                1,
                1,
                "",
                &[],
            ),
        })?;
        Ok(())
    }
}

impl Engine for ScriptedEngine {
    fn install_globals(&mut self, globals: HostGlobals) -> Result<(), VmError> {
        self.recorder.installed.store(true, Ordering::Release);
        self.globals = Some(globals);
        Ok(())
    }

    fn load(&mut self, source: &str) -> Result<HandlerFlags, VmError> {
        let behaviour = Behaviour::parse(source).map_err(|_| {
            VmError::Compile(CompileInfo {
                language: "JavaScript".into(),
                compile_success: false,
                index: 0,
                line_number: 1,
                column_number: 1,
                description: "SyntaxError: unexpected token".into(),
                area: "load".into(),
            })
        })?;
        if !behaviour.has_on_update && !behaviour.has_on_delete {
            return Err(VmError::NoHandlersDefined);
        }
        let flags = HandlerFlags {
            has_on_update: behaviour.has_on_update,
            has_on_delete: behaviour.has_on_delete,
        };
        self.behaviour = behaviour;
        self.recorder.loads.fetch_add(1, Ordering::Release);
        Ok(flags)
    }

    fn compile(&mut self, source: &str) -> CompileInfo {
        match Behaviour::parse(source) {
            Ok(_) => CompileInfo::success(),
            Err(()) => CompileInfo {
                language: "JavaScript".into(),
                compile_success: false,
                index: 0,
                line_number: 1,
                column_number: 1,
                description: "SyntaxError: unexpected token".into(),
                area: "compile".into(),
            },
        }
    }

    fn on_update(&mut self, value: &str, meta: &str) -> Result<(), VmError> {
        if !self.behaviour.has_on_update {
            return Err(VmError::UnknownCallback {
                name: "OnUpdate".into(),
            });
        }
        if let Some(ms) = self.behaviour.hang_on_update_ms {
            self.hang(ms)?;
        }
        self.create_staged_timer()?;
        self.recorder
            .updates
            .lock()
            .expect("recorder lock poisoned")
            .push((value.to_string(), meta.to_string()));
        if self.behaviour.fail_on_update {
            return Err(VmError::Exception {
                rendered: render_exception(
                    "Uncaught Error: scripted failure",
                    "handler.js",
                    3,
                    11,
                    "  throw new Error('scripted failure');",
                    &["at OnUpdate (handler.js:3:11)".into()],
                ),
            });
        }
        Ok(())
    }

    fn on_delete(&mut self, meta: &str) -> Result<(), VmError> {
        if !self.behaviour.has_on_delete {
            return Err(VmError::UnknownCallback {
                name: "OnDelete".into(),
            });
        }
        self.recorder
            .deletes
            .lock()
            .expect("recorder lock poisoned")
            .push(meta.to_string());
        Ok(())
    }

    fn fire_callback(&mut self, name: &str, context: &str) -> Result<(), VmError> {
        if name == "Missing" {
            return Err(VmError::UnknownCallback {
                name: name.to_string(),
            });
        }
        self.recorder
            .callbacks
            .lock()
            .expect("recorder lock poisoned")
            .push((name.to_string(), context.to_string()));
        Ok(())
    }

    fn terminator(&self) -> Arc<dyn Terminator> {
        Arc::new(ScriptedTerminator {
            flag: Arc::clone(&self.terminated),
        })
    }

    fn start_debugger(&mut self, _port: u16) -> Result<(), VmError> {
        Ok(())
    }

    fn stop_debugger(&mut self) {}
}

pub struct ScriptedFactory {
    pub recorder: Arc<Recorder>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
        }
    }
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for ScriptedFactory {
    fn create(
        &self,
        _config: &HandlerConfig,
        _settings: &ServerSettings,
    ) -> Result<Box<dyn Engine>, VmError> {
        Ok(Box::new(ScriptedEngine::new(Arc::clone(&self.recorder))))
    }
}

// =============================================================================
// In-process controller fixture
// =============================================================================

/// Drives a real worker over loopback TCP the way the controller would.
pub struct TestController {
    pub recorder: Arc<Recorder>,
    pub kv: MemoryStore,
    main: TcpStream,
    feedback: TcpStream,
    main_split: OutboundSplitter,
    feedback_split: OutboundSplitter,
    shutdown: Arc<AtomicBool>,
    serve_thread: Option<std::thread::JoinHandle<()>>,
}

impl TestController {
    pub fn start(batch_size: usize) -> Self {
        let main_listener = TcpListener::bind("127.0.0.1:0").expect("bind main listener");
        let feedback_listener =
            TcpListener::bind("127.0.0.1:0").expect("bind feedback listener");
        let main_port = main_listener.local_addr().unwrap().port();
        let feedback_port = feedback_listener.local_addr().unwrap().port();

        let args = WorkerArgs {
            appname: "harness".into(),
            ipc_type: IpcType::AfInet,
            port_or_uds: main_port.to_string(),
            feedback_port_or_uds: feedback_port.to_string(),
            worker_id: "worker_harness_0".into(),
            batch_size,
            feedback_batch_size: 4,
            diag_dir: std::env::temp_dir(),
            ip_mode: IpMode::Ipv4,
            breakpad_on: "false".into(),
            function_id: "fn-harness".into(),
            user_prefix: Some("test".into()),
        };

        let factory = ScriptedFactory::new();
        let recorder = Arc::clone(&factory.recorder);
        let kv = MemoryStore::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let serve_thread = {
            let collaborators = Collaborators {
                engines: Arc::new(factory),
                kv: Arc::new(kv.clone()),
                telemetry: telemetry::init(0),
            };
            let shutdown = Arc::clone(&shutdown);
            let options = ServeOptions {
                watch_stdin: false,
                ..ServeOptions::default()
            };
            std::thread::spawn(move || {
                if let Err(err) = serve_with(args, collaborators, shutdown, options) {
                    eprintln!("serve failed: {err}");
                }
            })
        };

        let (main, _) = main_listener.accept().expect("worker connects main");
        let (feedback, _) = feedback_listener.accept().expect("worker connects feedback");
        main.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        feedback
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        Self {
            recorder,
            kv,
            main,
            feedback,
            main_split: OutboundSplitter::new(),
            feedback_split: OutboundSplitter::new(),
            shutdown,
            serve_thread: Some(serve_thread),
        }
    }

    /// Send one frame on the main channel.
    pub fn send(&mut self, header: &Header, payload: &Payload) {
        let frame = encode_inbound_frame(header, payload);
        self.main.write_all(&frame).expect("write to worker");
    }

    /// Send raw bytes (corruption and chunking tests).
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.main.write_all(bytes).expect("write to worker");
    }

    /// Collect main-channel responses until the deadline passes.
    pub fn drain_responses(&mut self, window: Duration) -> Vec<Response> {
        Self::drain(&mut self.main, &mut self.main_split, window)
    }

    /// Collect feedback-channel responses until the deadline passes.
    pub fn drain_feedback(&mut self, window: Duration) -> Vec<Response> {
        Self::drain(&mut self.feedback, &mut self.feedback_split, window)
    }

    fn drain(
        stream: &mut TcpStream,
        splitter: &mut OutboundSplitter,
        window: Duration,
    ) -> Vec<Response> {
        let deadline = Instant::now() + window;
        let mut out = Vec::new();
        let mut scratch = [0u8; 16 * 1024];
        while Instant::now() < deadline {
            match stream.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    splitter.extend(&scratch[..n]);
                    while let Some(result) = splitter.next_response() {
                        out.push(result.expect("worker emitted an undecodable frame"));
                    }
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => break,
            }
        }
        out
    }

    /// Wait for a response matching the predicate.
    pub fn wait_for_response(
        &mut self,
        timeout: Duration,
        predicate: impl Fn(&Response) -> bool,
    ) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            for response in self.drain_responses(remaining.min(Duration::from_millis(100))) {
                if predicate(&response) {
                    return Some(response);
                }
            }
        }
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.serve_thread.take() {
            let _ = thread.join();
        }
    }
}
