//! Wire protocol between controller and worker.
//!
//! Inbound frames carry a verified header (event, opcode, partition,
//! metadata) and an opcode-specific payload; outbound frames carry a
//! `{msg_type, opcode, msg}` response record. Framing and integrity live in
//! [`frame`], record schemas in [`codec`].

pub mod codec;
pub mod frame;

pub use codec::{
    decode_header, decode_payload, decode_response, encode_header, encode_payload,
    encode_response, DecodeError,
};
pub use frame::{
    encode_inbound_frame, encode_outbound_frame, FrameSplitter, OutboundSplitter, RawFrame,
};

/// Top-level event class of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    V8Worker,
    Dcp,
    Filter,
    AppWorkerSetting,
    Debugger,
    Internal,
}

impl Event {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Event::V8Worker),
            2 => Some(Event::Dcp),
            3 => Some(Event::Filter),
            4 => Some(Event::AppWorkerSetting),
            5 => Some(Event::Debugger),
            6 => Some(Event::Internal),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Event::V8Worker => 1,
            Event::Dcp => 2,
            Event::Filter => 3,
            Event::AppWorkerSetting => 4,
            Event::Debugger => 5,
            Event::Internal => 6,
        }
    }
}

macro_rules! opcode_enum {
    ($name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant = $value,)+
        }

        impl $name {
            pub fn from_u8(raw: u8) -> Option<Self> {
                match raw {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_u8(self) -> u8 {
                self as u8
            }
        }
    };
}

opcode_enum!(V8WorkerOpcode {
    Dispose = 1,
    Init = 2,
    Load = 3,
    Terminate = 4,
    GetLatencyStats = 5,
    GetFailureStats = 6,
    GetExecutionStats = 7,
    GetCompileInfo = 8,
});

opcode_enum!(DcpOpcode {
    Delete = 1,
    Mutation = 2,
});

opcode_enum!(FilterOpcode {
    VbFilter = 1,
    ProcessedSeqNo = 2,
});

opcode_enum!(AppWorkerSettingOpcode {
    LogLevel = 1,
    WorkerThreadCount = 2,
    WorkerThreadMap = 3,
    TimerContextSize = 4,
    VbMap = 5,
});

opcode_enum!(DebuggerOpcode {
    Start = 1,
    Stop = 2,
});

opcode_enum!(InternalOpcode {
    ScanTimer = 1,
    UpdateVbMap = 2,
});

/// Decoded inbound header. Event and opcode stay raw so unknown values can
/// be counted rather than rejected at the framing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub event: u8,
    pub opcode: u8,
    pub partition: u16,
    pub metadata: String,
}

impl Header {
    pub fn new(event: Event, opcode: u8, partition: u16, metadata: impl Into<String>) -> Self {
        Self {
            event: event.as_u8(),
            opcode,
            partition,
            metadata: metadata.into(),
        }
    }
}

/// Opcode-specific inbound payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Dcp(DcpPayload),
    Init(InitPayload),
    ThreadMap(ThreadMapPayload),
    VbMap(VbMapPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DcpPayload {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitPayload {
    pub app_name: String,
    pub depcfg: String,
    /// Seconds a single callback invocation may run.
    pub execution_timeout: u64,
    pub lcb_inst_capacity: u32,
    /// Milliseconds between checkpoint flushes.
    pub checkpoint_interval: u64,
    pub handler_headers: Vec<String>,
    pub handler_footers: Vec<String>,
    pub using_timer: bool,
    pub timer_context_size: u64,
    pub debugger_port: String,
    pub eventing_dir: String,
    pub curr_eventing_port: String,
    pub curr_host: String,
    pub kv_host_port: String,
    pub function_instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadMapPayload {
    pub partition_count: u64,
    pub entries: Vec<ThreadMapEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMapEntry {
    pub thread_id: u16,
    pub partitions: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VbMapPayload {
    pub vbuckets: Vec<u16>,
}

/// Outbound response record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub msg_type: u8,
    pub opcode: u8,
    pub msg: String,
}

impl Response {
    pub fn new(msg_type: u8, opcode: u8, msg: impl Into<String>) -> Self {
        Self {
            msg_type,
            opcode,
            msg: msg.into(),
        }
    }
}

/// Outbound message type and opcode values.
pub mod response {
    pub const MSG_V8_WORKER_CONFIG: u8 = 1;
    pub const MSG_FILTER_ACK: u8 = 2;
    pub const MSG_BUCKET_OPS: u8 = 3;

    pub const OP_QUEUE_SIZE: u8 = 1;
    pub const OP_EXECUTION_STATS: u8 = 2;
    pub const OP_FAILURE_STATS: u8 = 3;
    pub const OP_LATENCY_STATS: u8 = 4;
    pub const OP_COMPILE_INFO: u8 = 5;

    pub const OP_VB_FILTER: u8 = 1;

    pub const OP_CHECKPOINT: u8 = 1;
}
