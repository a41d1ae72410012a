use thiserror::Error;

use crate::daemon::TransportError;
use crate::kv::KvError;
use crate::proto::DecodeError;
use crate::timer::TimerError;
use crate::vm::VmError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Decode(_) => Transience::Permanent,
            Error::Transport(e) => e.transience(),
            Error::Kv(e) => {
                if e.is_retriable() {
                    Transience::Retryable
                } else {
                    Transience::Permanent
                }
            }
            Error::Vm(_) => Transience::Permanent,
            Error::Timer(e) => e.transience(),
            Error::Config(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Decode(_) | Error::Config(_) => Effect::None,
            Error::Transport(_) => Effect::Unknown,
            Error::Kv(_) => Effect::Unknown,
            Error::Vm(_) => Effect::Some,
            Error::Timer(_) => Effect::Unknown,
        }
    }
}
