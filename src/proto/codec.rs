//! Record schemas and their CBOR encoding.
//!
//! Headers, payloads, and responses are definite-length CBOR maps with
//! string keys, each sealed with a trailing little-endian crc32c over the
//! CBOR body. Unknown keys are skipped so either side can grow the schema.
//! Declared lengths are checked against [`Limits`] before anything is
//! allocated: a frame inside the byte budget can still announce an
//! enormous array in a handful of bytes.

use std::convert::Infallible;

use crc32c::crc32c;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::{
    DcpPayload, Event, Header, InitPayload, Payload, Response, ThreadMapEntry, ThreadMapPayload,
    VbMapPayload,
};
use super::{AppWorkerSettingOpcode, DcpOpcode, V8WorkerOpcode};
use crate::config::Limits;

const CRC_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record truncated: {0} bytes, need at least the checksum")]
    Truncated(usize),
    #[error("record checksum mismatch: expected {expected:#010x} got {got:#010x}")]
    ChecksumMismatch { expected: u32, got: u32 },
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("decode limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("trailing bytes after record body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

type EncodeError = minicbor::encode::Error<Infallible>;

/// Append the crc32c seal to an encoded CBOR body.
fn seal(mut body: Vec<u8>) -> Vec<u8> {
    let crc = crc32c(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

/// Verify and strip the crc32c seal.
fn open(bytes: &[u8]) -> Result<&[u8], DecodeError> {
    if bytes.len() < CRC_LEN {
        return Err(DecodeError::Truncated(bytes.len()));
    }
    let (body, tail) = bytes.split_at(bytes.len() - CRC_LEN);
    let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let got = crc32c(body);
    if got != expected {
        return Err(DecodeError::ChecksumMismatch { expected, got });
    }
    Ok(body)
}

fn finish(dec: &Decoder) -> Result<(), DecodeError> {
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(())
}

pub fn encode_header(header: &Header) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_header_body(&mut enc, header).expect("encoding into Vec cannot fail");
    seal(buf)
}

fn encode_header_body(
    enc: &mut Encoder<&mut Vec<u8>>,
    header: &Header,
) -> Result<(), EncodeError> {
    enc.map(4)?;
    enc.str("event")?;
    enc.u8(header.event)?;
    enc.str("opcode")?;
    enc.u8(header.opcode)?;
    enc.str("partition")?;
    enc.u16(header.partition)?;
    enc.str("metadata")?;
    enc.str(&header.metadata)?;
    Ok(())
}

pub fn decode_header(bytes: &[u8], limits: &Limits) -> Result<Header, DecodeError> {
    let body = open(bytes)?;
    let mut dec = Decoder::new(body);
    let map_len = map_len(&mut dec, limits)?;

    let mut event = None;
    let mut opcode = None;
    let mut partition = None;
    let mut metadata = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "event" => event = Some(dec.u8()?),
            "opcode" => opcode = Some(dec.u8()?),
            "partition" => partition = Some(dec.u16()?),
            "metadata" => metadata = Some(decode_text(&mut dec, limits)?.to_string()),
            _ => dec.skip()?,
        }
    }
    finish(&dec)?;

    Ok(Header {
        event: event.ok_or(DecodeError::MissingField("event"))?,
        opcode: opcode.ok_or(DecodeError::MissingField("opcode"))?,
        partition: partition.ok_or(DecodeError::MissingField("partition"))?,
        metadata: metadata.ok_or(DecodeError::MissingField("metadata"))?,
    })
}

pub fn encode_payload(payload: &Payload) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    let encoded = match payload {
        Payload::Empty => return Vec::new(),
        Payload::Dcp(p) => encode_dcp(&mut enc, p),
        Payload::Init(p) => encode_init(&mut enc, p),
        Payload::ThreadMap(p) => encode_thread_map(&mut enc, p),
        Payload::VbMap(p) => encode_vb_map(&mut enc, p),
    };
    encoded.expect("encoding into Vec cannot fail");
    seal(buf)
}

/// Decode the payload for a given event/opcode pair. Empty payload bytes
/// always decode to [`Payload::Empty`]; opcodes without a structured
/// payload ignore whatever was sent.
pub fn decode_payload(
    event: u8,
    opcode: u8,
    bytes: &[u8],
    limits: &Limits,
) -> Result<Payload, DecodeError> {
    if bytes.is_empty() {
        return Ok(Payload::Empty);
    }
    let body = open(bytes)?;
    match Event::from_u8(event) {
        Some(Event::Dcp) => match DcpOpcode::from_u8(opcode) {
            Some(DcpOpcode::Mutation) | Some(DcpOpcode::Delete) => {
                Ok(Payload::Dcp(decode_dcp(body, limits)?))
            }
            None => Ok(Payload::Empty),
        },
        Some(Event::V8Worker) => match V8WorkerOpcode::from_u8(opcode) {
            Some(V8WorkerOpcode::Init) => Ok(Payload::Init(decode_init(body, limits)?)),
            _ => Ok(Payload::Empty),
        },
        Some(Event::AppWorkerSetting) => match AppWorkerSettingOpcode::from_u8(opcode) {
            Some(AppWorkerSettingOpcode::WorkerThreadMap) => {
                Ok(Payload::ThreadMap(decode_thread_map(body, limits)?))
            }
            Some(AppWorkerSettingOpcode::VbMap) => {
                Ok(Payload::VbMap(decode_vb_map(body, limits)?))
            }
            _ => Ok(Payload::Empty),
        },
        _ => Ok(Payload::Empty),
    }
}

fn encode_dcp(enc: &mut Encoder<&mut Vec<u8>>, payload: &DcpPayload) -> Result<(), EncodeError> {
    enc.map(1)?;
    enc.str("value")?;
    enc.str(&payload.value)?;
    Ok(())
}

fn decode_dcp(body: &[u8], limits: &Limits) -> Result<DcpPayload, DecodeError> {
    let mut dec = Decoder::new(body);
    let map_len = map_len(&mut dec, limits)?;
    let mut value = None;
    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "value" => value = Some(decode_text(&mut dec, limits)?.to_string()),
            _ => dec.skip()?,
        }
    }
    finish(&dec)?;
    Ok(DcpPayload {
        value: value.ok_or(DecodeError::MissingField("value"))?,
    })
}

fn encode_init(enc: &mut Encoder<&mut Vec<u8>>, init: &InitPayload) -> Result<(), EncodeError> {
    enc.map(15)?;
    enc.str("app_name")?;
    enc.str(&init.app_name)?;
    enc.str("depcfg")?;
    enc.str(&init.depcfg)?;
    enc.str("execution_timeout")?;
    enc.u64(init.execution_timeout)?;
    enc.str("lcb_inst_capacity")?;
    enc.u32(init.lcb_inst_capacity)?;
    enc.str("checkpoint_interval")?;
    enc.u64(init.checkpoint_interval)?;
    enc.str("handler_headers")?;
    encode_str_list(enc, &init.handler_headers)?;
    enc.str("handler_footers")?;
    encode_str_list(enc, &init.handler_footers)?;
    enc.str("using_timer")?;
    enc.bool(init.using_timer)?;
    enc.str("timer_context_size")?;
    enc.u64(init.timer_context_size)?;
    enc.str("debugger_port")?;
    enc.str(&init.debugger_port)?;
    enc.str("eventing_dir")?;
    enc.str(&init.eventing_dir)?;
    enc.str("curr_eventing_port")?;
    enc.str(&init.curr_eventing_port)?;
    enc.str("curr_host")?;
    enc.str(&init.curr_host)?;
    enc.str("kv_host_port")?;
    enc.str(&init.kv_host_port)?;
    enc.str("function_instance_id")?;
    enc.str(&init.function_instance_id)?;
    Ok(())
}

fn decode_init(body: &[u8], limits: &Limits) -> Result<InitPayload, DecodeError> {
    let mut dec = Decoder::new(body);
    let map_len = map_len(&mut dec, limits)?;
    let mut init = InitPayload::default();
    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "app_name" => init.app_name = decode_text(&mut dec, limits)?.to_string(),
            "depcfg" => init.depcfg = decode_text(&mut dec, limits)?.to_string(),
            "execution_timeout" => init.execution_timeout = dec.u64()?,
            "lcb_inst_capacity" => init.lcb_inst_capacity = dec.u32()?,
            "checkpoint_interval" => init.checkpoint_interval = dec.u64()?,
            "handler_headers" => init.handler_headers = decode_str_list(&mut dec, limits)?,
            "handler_footers" => init.handler_footers = decode_str_list(&mut dec, limits)?,
            "using_timer" => init.using_timer = dec.bool()?,
            "timer_context_size" => init.timer_context_size = dec.u64()?,
            "debugger_port" => init.debugger_port = decode_text(&mut dec, limits)?.to_string(),
            "eventing_dir" => init.eventing_dir = decode_text(&mut dec, limits)?.to_string(),
            "curr_eventing_port" => {
                init.curr_eventing_port = decode_text(&mut dec, limits)?.to_string()
            }
            "curr_host" => init.curr_host = decode_text(&mut dec, limits)?.to_string(),
            "kv_host_port" => init.kv_host_port = decode_text(&mut dec, limits)?.to_string(),
            "function_instance_id" => {
                init.function_instance_id = decode_text(&mut dec, limits)?.to_string()
            }
            _ => dec.skip()?,
        }
    }
    finish(&dec)?;
    Ok(init)
}

fn encode_thread_map(
    enc: &mut Encoder<&mut Vec<u8>>,
    map: &ThreadMapPayload,
) -> Result<(), EncodeError> {
    enc.map(2)?;
    enc.str("partition_count")?;
    enc.u64(map.partition_count)?;
    enc.str("entries")?;
    enc.array(map.entries.len() as u64)?;
    for entry in &map.entries {
        enc.map(2)?;
        enc.str("thread_id")?;
        enc.u16(entry.thread_id)?;
        enc.str("partitions")?;
        enc.array(entry.partitions.len() as u64)?;
        for vb in &entry.partitions {
            enc.u16(*vb)?;
        }
    }
    Ok(())
}

fn decode_thread_map(body: &[u8], limits: &Limits) -> Result<ThreadMapPayload, DecodeError> {
    let mut dec = Decoder::new(body);
    let outer_len = map_len(&mut dec, limits)?;
    let mut partition_count = None;
    let mut entries = None;

    for _ in 0..outer_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "partition_count" => partition_count = Some(dec.u64()?),
            "entries" => {
                let arr_len = array_len(&mut dec, limits)?;
                let mut out = Vec::with_capacity(arr_len);
                for _ in 0..arr_len {
                    let inner_len = map_len(&mut dec, limits)?;
                    let mut thread_id = None;
                    let mut partitions = None;
                    for _ in 0..inner_len {
                        let key = decode_text(&mut dec, limits)?;
                        match key {
                            "thread_id" => thread_id = Some(dec.u16()?),
                            "partitions" => partitions = Some(decode_u16_list(&mut dec, limits)?),
                            _ => dec.skip()?,
                        }
                    }
                    out.push(ThreadMapEntry {
                        thread_id: thread_id.ok_or(DecodeError::MissingField("thread_id"))?,
                        partitions: partitions.ok_or(DecodeError::MissingField("partitions"))?,
                    });
                }
                entries = Some(out);
            }
            _ => dec.skip()?,
        }
    }
    finish(&dec)?;

    Ok(ThreadMapPayload {
        partition_count: partition_count.ok_or(DecodeError::MissingField("partition_count"))?,
        entries: entries.ok_or(DecodeError::MissingField("entries"))?,
    })
}

fn encode_vb_map(enc: &mut Encoder<&mut Vec<u8>>, map: &VbMapPayload) -> Result<(), EncodeError> {
    enc.map(1)?;
    enc.str("vbuckets")?;
    enc.array(map.vbuckets.len() as u64)?;
    for vb in &map.vbuckets {
        enc.u16(*vb)?;
    }
    Ok(())
}

fn decode_vb_map(body: &[u8], limits: &Limits) -> Result<VbMapPayload, DecodeError> {
    let mut dec = Decoder::new(body);
    let map_len = map_len(&mut dec, limits)?;
    let mut vbuckets = None;
    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "vbuckets" => vbuckets = Some(decode_u16_list(&mut dec, limits)?),
            _ => dec.skip()?,
        }
    }
    finish(&dec)?;
    Ok(VbMapPayload {
        vbuckets: vbuckets.ok_or(DecodeError::MissingField("vbuckets"))?,
    })
}

pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_response_body(&mut enc, response).expect("encoding into Vec cannot fail");
    seal(buf)
}

fn encode_response_body(
    enc: &mut Encoder<&mut Vec<u8>>,
    response: &Response,
) -> Result<(), EncodeError> {
    enc.map(3)?;
    enc.str("msg_type")?;
    enc.u8(response.msg_type)?;
    enc.str("opcode")?;
    enc.u8(response.opcode)?;
    enc.str("msg")?;
    enc.str(&response.msg)?;
    Ok(())
}

pub fn decode_response(bytes: &[u8], limits: &Limits) -> Result<Response, DecodeError> {
    let body = open(bytes)?;
    let mut dec = Decoder::new(body);
    let map_len = map_len(&mut dec, limits)?;

    let mut msg_type = None;
    let mut opcode = None;
    let mut msg = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "msg_type" => msg_type = Some(dec.u8()?),
            "opcode" => opcode = Some(dec.u8()?),
            "msg" => msg = Some(decode_text(&mut dec, limits)?.to_string()),
            _ => dec.skip()?,
        }
    }
    finish(&dec)?;

    Ok(Response {
        msg_type: msg_type.ok_or(DecodeError::MissingField("msg_type"))?,
        opcode: opcode.ok_or(DecodeError::MissingField("opcode"))?,
        msg: msg.ok_or(DecodeError::MissingField("msg"))?,
    })
}

fn encode_str_list(enc: &mut Encoder<&mut Vec<u8>>, list: &[String]) -> Result<(), EncodeError> {
    enc.array(list.len() as u64)?;
    for item in list {
        enc.str(item)?;
    }
    Ok(())
}

fn decode_str_list(dec: &mut Decoder, limits: &Limits) -> Result<Vec<String>, DecodeError> {
    let len = array_len(dec, limits)?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(decode_text(dec, limits)?.to_string());
    }
    Ok(out)
}

fn decode_u16_list(dec: &mut Decoder, limits: &Limits) -> Result<Vec<u16>, DecodeError> {
    let len = array_len(dec, limits)?;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(dec.u16()?);
    }
    Ok(out)
}

/// Read a text string, refusing anything over `max_cbor_text_len`.
fn decode_text<'a>(dec: &mut Decoder<'a>, limits: &Limits) -> Result<&'a str, DecodeError> {
    let s = dec.str()?;
    if s.len() > limits.max_cbor_text_len {
        return Err(DecodeError::LimitExceeded("max_cbor_text_len"));
    }
    Ok(s)
}

/// Read a definite map length, refusing anything over `max_cbor_entries`.
/// The declared count is never trusted for allocation.
fn map_len(dec: &mut Decoder, limits: &Limits) -> Result<usize, DecodeError> {
    let len = dec
        .map()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite-length map"))?;
    if len > limits.max_cbor_entries as u64 {
        return Err(DecodeError::LimitExceeded("max_cbor_entries"));
    }
    usize::try_from(len).map_err(|_| DecodeError::LimitExceeded("max_cbor_entries"))
}

/// Read a definite array length, refusing anything over `max_cbor_entries`.
fn array_len(dec: &mut Decoder, limits: &Limits) -> Result<usize, DecodeError> {
    let len = dec
        .array()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite-length array"))?;
    if len > limits.max_cbor_entries as u64 {
        return Err(DecodeError::LimitExceeded("max_cbor_entries"));
    }
    usize::try_from(len).map_err(|_| DecodeError::LimitExceeded("max_cbor_entries"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::DcpOpcode;

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn header_round_trip() {
        let header = Header::new(Event::Dcp, DcpOpcode::Mutation.as_u8(), 17, r#"{"vb":17}"#);
        let bytes = encode_header(&header);
        let decoded = decode_header(&bytes, &limits()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn corrupted_header_fails_checksum() {
        let header = Header::new(Event::Dcp, DcpOpcode::Mutation.as_u8(), 17, "meta");
        let mut bytes = encode_header(&header);
        bytes[2] ^= 0xff;
        let err = decode_header(&bytes, &limits()).unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn init_payload_round_trip() {
        let init = InitPayload {
            app_name: "billing".into(),
            depcfg: r#"{"source_bucket":"src","metadata_bucket":"meta"}"#.into(),
            execution_timeout: 5,
            lcb_inst_capacity: 5,
            checkpoint_interval: 1000,
            handler_headers: vec!["'use strict';".into()],
            handler_footers: Vec::new(),
            using_timer: true,
            timer_context_size: 1024,
            debugger_port: "9140".into(),
            eventing_dir: "/tmp/eventing".into(),
            curr_eventing_port: "8096".into(),
            curr_host: "127.0.0.1".into(),
            kv_host_port: "127.0.0.1:11210".into(),
            function_instance_id: "abc123".into(),
        };
        let bytes = encode_payload(&Payload::Init(init.clone()));
        let decoded = decode_payload(
            Event::V8Worker.as_u8(),
            V8WorkerOpcode::Init.as_u8(),
            &bytes,
            &limits(),
        )
        .unwrap();
        assert_eq!(decoded, Payload::Init(init));
    }

    #[test]
    fn thread_map_round_trip() {
        let map = ThreadMapPayload {
            partition_count: 1024,
            entries: vec![
                ThreadMapEntry {
                    thread_id: 0,
                    partitions: vec![17, 19],
                },
                ThreadMapEntry {
                    thread_id: 1,
                    partitions: vec![18],
                },
            ],
        };
        let bytes = encode_payload(&Payload::ThreadMap(map.clone()));
        let decoded = decode_payload(
            Event::AppWorkerSetting.as_u8(),
            AppWorkerSettingOpcode::WorkerThreadMap.as_u8(),
            &bytes,
            &limits(),
        )
        .unwrap();
        assert_eq!(decoded, Payload::ThreadMap(map));
    }

    #[test]
    fn empty_payload_decodes_without_bytes() {
        let decoded = decode_payload(
            Event::V8Worker.as_u8(),
            V8WorkerOpcode::Load.as_u8(),
            &[],
            &limits(),
        )
        .unwrap();
        assert_eq!(decoded, Payload::Empty);
    }

    #[test]
    fn response_round_trip() {
        let resp = Response::new(1, 2, r#"{"on_update_success":3}"#);
        let bytes = encode_response(&resp);
        assert_eq!(decode_response(&bytes, &limits()).unwrap(), resp);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        // A future controller may add fields; build a header with an extra
        // key by hand and check it still decodes.
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(5).unwrap();
        enc.str("event").unwrap();
        enc.u8(2).unwrap();
        enc.str("opcode").unwrap();
        enc.u8(2).unwrap();
        enc.str("partition").unwrap();
        enc.u16(3).unwrap();
        enc.str("metadata").unwrap();
        enc.str("m").unwrap();
        enc.str("future_field").unwrap();
        enc.str("ignored").unwrap();
        let sealed = {
            let crc = crc32c::crc32c(&buf);
            buf.extend_from_slice(&crc.to_le_bytes());
            buf
        };
        let header = decode_header(&sealed, &limits()).unwrap();
        assert_eq!(header.partition, 3);
    }

    #[test]
    fn declared_array_length_is_capped() {
        // A vb-map whose array header claims u64::MAX entries in a few
        // bytes must be refused before any allocation, not trusted.
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap();
        enc.str("vbuckets").unwrap();
        enc.array(u64::MAX).unwrap();
        let sealed = {
            let crc = crc32c::crc32c(&buf);
            buf.extend_from_slice(&crc.to_le_bytes());
            buf
        };

        let err = decode_payload(
            Event::AppWorkerSetting.as_u8(),
            AppWorkerSettingOpcode::VbMap.as_u8(),
            &sealed,
            &limits(),
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::LimitExceeded("max_cbor_entries")));
    }

    #[test]
    fn declared_map_length_is_capped() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1_000_000).unwrap();
        let sealed = {
            let crc = crc32c::crc32c(&buf);
            buf.extend_from_slice(&crc.to_le_bytes());
            buf
        };

        let mut tight = Limits::default();
        tight.max_cbor_entries = 64;
        let err = decode_header(&sealed, &tight).unwrap_err();
        assert!(matches!(err, DecodeError::LimitExceeded("max_cbor_entries")));
    }

    #[test]
    fn oversized_text_is_refused() {
        let mut tight = Limits::default();
        tight.max_cbor_text_len = 8;
        let header = Header::new(
            Event::Dcp,
            DcpOpcode::Mutation.as_u8(),
            1,
            "metadata far beyond eight bytes",
        );
        let bytes = encode_header(&header);
        let err = decode_header(&bytes, &tight).unwrap_err();
        assert!(matches!(err, DecodeError::LimitExceeded("max_cbor_text_len")));
    }
}
