//! Embedded script engine seam.
//!
//! The engine itself (isolate pool, bindings, inspector) is a collaborator
//! linked by the embedder; the worker depends only on [`Engine`]. The
//! worker guarantees the lifecycle: host globals (`log`, the bucket
//! accessor, the query helper) are installed before the first event is
//! dispatched and the engine is dropped on worker exit.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;

use crate::config::{HandlerConfig, ServerSettings};
use crate::kv;
use crate::timer::TimerHandle;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("no script engine is linked into this build")]
    EngineUnavailable,
    #[error("handler failed to compile")]
    Compile(CompileInfo),
    #[error("neither OnUpdate nor OnDelete is defined")]
    NoHandlersDefined,
    #[error("uncaught exception:\n{rendered}")]
    Exception { rendered: String },
    #[error("invocation terminated after exceeding the execution timeout")]
    Terminated,
    #[error("no callback named `{name}` in the loaded handler")]
    UnknownCallback { name: String },
    #[error("debugger: {0}")]
    Debugger(String),
}

/// Compilation report, serialised verbatim into the `GetCompileInfo`
/// response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileInfo {
    pub language: String,
    pub compile_success: bool,
    pub index: i32,
    pub line_number: i32,
    pub column_number: i32,
    pub description: String,
    pub area: String,
}

impl CompileInfo {
    pub fn success() -> Self {
        Self {
            language: "JavaScript".into(),
            compile_success: true,
            index: 0,
            line_number: 0,
            column_number: 0,
            description: String::new(),
            area: String::new(),
        }
    }

    pub fn to_json(&self) -> String {
        json!({
            "language": self.language,
            "compile_success": self.compile_success,
            "index": self.index,
            "line_number": self.line_number,
            "column_number": self.column_number,
            "description": self.description,
            "area": self.area,
        })
        .to_string()
    }
}

/// Which of the two entry points the loaded script exports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerFlags {
    pub has_on_update: bool,
    pub has_on_delete: bool,
}

/// The mutation currently being dispatched, visible to host calls made
/// from inside the invocation (timer creation records its origin).
#[derive(Debug, Default)]
pub struct CurrentEvent {
    vb: AtomicU32,
    seq: AtomicU64,
}

impl CurrentEvent {
    pub fn set(&self, vb: u16, seq: u64) {
        self.vb.store(u32::from(vb), Ordering::Relaxed);
        self.seq.store(seq, Ordering::Relaxed);
    }

    pub fn vb(&self) -> u16 {
        self.vb.load(Ordering::Relaxed) as u16
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

/// Host surface handed to the engine when globals are installed.
#[derive(Clone)]
pub struct HostGlobals {
    pub app_name: String,
    /// Backs the bucket accessor object.
    pub kv: Arc<dyn kv::Store>,
    /// Backs `createTimer`/`cancelTimer`; absent when the handler does not
    /// use timers.
    pub timers: Option<TimerHandle>,
    pub current: Arc<CurrentEvent>,
}

/// Cross-thread handle used by the watchdog to abort a runaway invocation.
pub trait Terminator: Send + Sync {
    fn terminate(&self);
}

/// One engine instance, exclusively owned by its worker thread.
pub trait Engine: Send {
    fn install_globals(&mut self, globals: HostGlobals) -> Result<(), VmError>;

    /// Compile and evaluate the handler source, resolving `OnUpdate` and
    /// `OnDelete`.
    fn load(&mut self, source: &str) -> Result<HandlerFlags, VmError>;

    /// Compile-only check; never evaluates.
    fn compile(&mut self, source: &str) -> CompileInfo;

    fn on_update(&mut self, value: &str, meta: &str) -> Result<(), VmError>;

    fn on_delete(&mut self, meta: &str) -> Result<(), VmError>;

    /// Invoke a named timer callback with its persisted context.
    fn fire_callback(&mut self, name: &str, context: &str) -> Result<(), VmError>;

    fn terminator(&self) -> Arc<dyn Terminator>;

    fn start_debugger(&mut self, port: u16) -> Result<(), VmError>;

    fn stop_debugger(&mut self);
}

/// Creates engines at `Init` time, one per worker.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        config: &HandlerConfig,
        settings: &ServerSettings,
    ) -> Result<Box<dyn Engine>, VmError>;
}

/// Factory for builds without a linked engine. Workers come up without a
/// VM and keep serving control traffic so the controller can observe the
/// failure.
pub struct UnlinkedFactory;

impl EngineFactory for UnlinkedFactory {
    fn create(
        &self,
        _config: &HandlerConfig,
        _settings: &ServerSettings,
    ) -> Result<Box<dyn Engine>, VmError> {
        Err(VmError::EngineUnavailable)
    }
}

/// Render an uncaught script exception the way it is logged: message,
/// location, offending source line, and a caret underlining the column.
pub fn render_exception(
    message: &str,
    file: &str,
    line: u32,
    column: u32,
    source_line: &str,
    stack: &[String],
) -> String {
    let mut out = String::new();
    out.push_str(message);
    out.push('\n');
    out.push_str(&format!("  at {file}:{line}:{column}\n"));
    if !source_line.is_empty() {
        out.push_str("    ");
        out.push_str(source_line);
        out.push('\n');
        // Column is 1-based; the caret sits under the offending character.
        let pad = (column as usize).saturating_sub(1);
        out.push_str("    ");
        out.push_str(&" ".repeat(pad));
        out.push('^');
        out.push('\n');
    }
    for frame in stack {
        out.push_str("  ");
        out.push_str(frame);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_caret_under_column() {
        let rendered = render_exception(
            "Uncaught TypeError: x is not a function",
            "billing.js",
            12,
            9,
            "let y = x();",
            &["at OnUpdate (billing.js:12:9)".into()],
        );
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "Uncaught TypeError: x is not a function");
        assert_eq!(lines[1], "  at billing.js:12:9");
        assert_eq!(lines[2], "    let y = x();");
        assert_eq!(lines[3], "            ^");
        assert_eq!(lines[4], "  at OnUpdate (billing.js:12:9)");
    }

    #[test]
    fn compile_info_serialises_stable_keys() {
        let info = CompileInfo::success();
        let value: serde_json::Value = serde_json::from_str(&info.to_json()).unwrap();
        assert_eq!(value["compile_success"], serde_json::json!(true));
        assert_eq!(value["language"], serde_json::json!("JavaScript"));
    }
}
