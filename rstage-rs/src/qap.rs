//! Rserve QAP1 wire codec.
//!
//! Pure encoding/decoding of the QAP1 message framing and the SEXP
//! serialisation used for values.  No I/O lives here; [`crate::rserve`]
//! owns the socket and delegates all byte handling to this module, so the
//! codec is testable without a server.
//!
//! Framing summary (all integers little-endian):
//!
//! | Part | Layout |
//! |------|--------|
//! | message header | `cmd:u32 len_lo:u32 offset:u32 len_hi:u32` |
//! | parameter | `type:u8 len:u24` (or `type\|DT_LARGE len:u56`) + payload |
//! | SEXP | `xt:u8 len:u24` (or `xt\|XT_LARGE len:u56`) + [attr SEXP] + payload |

use thiserror::Error;

use crate::value::{RData, RValue};

// ── Constants ─────────────────────────────────────────────────────────────────

pub const CMD_EVAL: u32 = 0x003;
pub const CMD_SET_SEXP: u32 = 0x020;

pub const RESP_OK: u32 = 0x1_0001;
pub const RESP_ERR: u32 = 0x1_0002;

/// Size of the server identification block sent on connect.
pub const ID_LEN: usize = 32;
/// Size of a message header.
pub const HEADER_LEN: usize = 16;

/// Parameter (data) types.
pub mod dt {
    pub const STRING: u8 = 4;
    pub const BYTESTREAM: u8 = 5;
    pub const SEXP: u8 = 10;
    pub const LARGE: u8 = 0x40;
}

/// SEXP expression types.
pub mod xt {
    pub const NULL: u8 = 0;
    pub const INT: u8 = 1;
    pub const DOUBLE: u8 = 2;
    pub const STR: u8 = 3;
    pub const LANG: u8 = 4;
    pub const SYM: u8 = 5;
    pub const BOOL: u8 = 6;
    pub const VECTOR: u8 = 16;
    pub const LIST: u8 = 17;
    pub const SYMNAME: u8 = 19;
    pub const LIST_NOTAG: u8 = 20;
    pub const LIST_TAG: u8 = 21;
    pub const VECTOR_EXP: u8 = 26;
    pub const ARRAY_INT: u8 = 32;
    pub const ARRAY_DOUBLE: u8 = 33;
    pub const ARRAY_STR: u8 = 34;
    pub const ARRAY_BOOL: u8 = 36;
    pub const RAW: u8 = 37;

    pub const LARGE: u8 = 0x40;
    pub const HAS_ATTR: u8 = 0x80;
    pub const TYPE_MASK: u8 = 0x3f;
}

/// Integer missing marker.
pub const NA_INTEGER: i32 = i32::MIN;
/// Double missing marker: a NaN whose low word is 1954.
pub const NA_DOUBLE_BITS: u64 = 0x7FF0_0000_0000_07A2;
/// Logical missing marker inside `XT_ARRAY_BOOL`.
pub const NA_LOGICAL: u8 = 2;
/// Character missing marker inside `XT_ARRAY_STR`.
pub const NA_STRING: u8 = 0xFF;

/// Largest length that fits a short (24-bit) header.
const SMALL_MAX: usize = 0xff_fff0;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated message: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("not an Rserve QAP1 server (id {0:?})")]
    BadId(String),
    #[error("server requires authentication, which is not supported")]
    AuthRequired,
    #[error("malformed response: {0}")]
    Malformed(String),
}

fn need(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        Err(CodecError::Truncated { needed, available: buf.len() })
    } else {
        Ok(())
    }
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, CodecError> {
    need(buf, at + 4)?;
    Ok(u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]))
}

fn read_i32(buf: &[u8], at: usize) -> Result<i32, CodecError> {
    read_u32(buf, at).map(|v| v as i32)
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Validate the 32-byte identification block the server sends on connect.
///
/// Layout: `Rsrv` + 4-char protocol version + `QAP1` + `\r\n\r\n`, then
/// 4-byte attribute words.  `ARpt`/`ARuc` demand a login.
pub fn check_server_id(id: &[u8]) -> Result<(), CodecError> {
    need(id, ID_LEN)?;
    let text = String::from_utf8_lossy(&id[..ID_LEN]).into_owned();
    if &id[0..4] != b"Rsrv" || &id[8..12] != b"QAP1" {
        return Err(CodecError::BadId(text));
    }
    for word in id[16..ID_LEN].chunks(4) {
        if word == b"ARpt" || word == b"ARuc" {
            return Err(CodecError::AuthRequired);
        }
    }
    Ok(())
}

// ── Item headers ──────────────────────────────────────────────────────────────

/// Append a parameter or SEXP header, switching to the 8-byte large form
/// when `len` does not fit 24 bits.
fn write_item_header(out: &mut Vec<u8>, ty: u8, large_flag: u8, len: usize) {
    let len = len as u64;
    if len as usize > SMALL_MAX {
        out.push(ty | large_flag);
        out.extend_from_slice(&(len as u32).to_le_bytes()[..3]);
        out.extend_from_slice(&((len >> 24) as u32).to_le_bytes());
    } else {
        out.push(ty);
        out.extend_from_slice(&(len as u32).to_le_bytes()[..3]);
    }
}

/// Read an item header.  Returns `(type with flags, payload length, header length)`.
fn read_item_header(buf: &[u8], large_flag: u8) -> Result<(u8, usize, usize), CodecError> {
    let word = read_u32(buf, 0)?;
    let ty = (word & 0xff) as u8;
    let mut len = (word >> 8) as u64;
    let mut hdr = 4;
    if ty & large_flag != 0 {
        len |= (read_u32(buf, 4)? as u64) << 24;
        hdr = 8;
    }
    Ok((ty, len as usize, hdr))
}

fn pad_to_word(out: &mut Vec<u8>, fill: u8) {
    while out.len() % 4 != 0 {
        out.push(fill);
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// A command parameter.
#[derive(Debug, Clone, Copy)]
pub enum Param<'a> {
    Str(&'a str),
    Sexp(&'a RValue),
}

/// Encode a complete command message (header plus parameters).
pub fn encode_command(cmd: u32, params: &[Param<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for param in params {
        match param {
            Param::Str(s) => {
                let mut payload = s.as_bytes().to_vec();
                payload.push(0);
                pad_to_word(&mut payload, 0);
                write_item_header(&mut body, dt::STRING, dt::LARGE, payload.len());
                body.extend_from_slice(&payload);
            }
            Param::Sexp(v) => {
                let payload = encode_sexp(v);
                write_item_header(&mut body, dt::SEXP, dt::LARGE, payload.len());
                body.extend_from_slice(&payload);
            }
        }
    }

    let len = body.len() as u64;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&cmd.to_le_bytes());
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&((len >> 32) as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// A decoded response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub cmd: u32,
    pub len: usize,
}

impl ResponseHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        need(buf, HEADER_LEN)?;
        let cmd = read_u32(buf, 0)?;
        let lo = read_u32(buf, 4)? as u64;
        let hi = read_u32(buf, 12)? as u64;
        Ok(Self { cmd, len: (lo | (hi << 32)) as usize })
    }

    pub fn is_ok(&self) -> bool {
        self.cmd & 0xf_ffff == RESP_OK
    }

    pub fn is_error(&self) -> bool {
        self.cmd & 0xf_ffff == RESP_ERR
    }

    /// Status code carried in the top byte of an error response.
    pub fn status(&self) -> u8 {
        ((self.cmd >> 24) & 0x7f) as u8
    }
}

/// Human-readable text for a server status code.
pub fn status_text(code: u8) -> &'static str {
    match code {
        0x41 => "authentication failed",
        0x42 => "connection broken",
        0x43 => "invalid command",
        0x44 => "invalid parameter",
        0x45 => "evaluation error",
        0x46 => "I/O error",
        0x47 => "file not open",
        0x48 => "access denied",
        0x49 => "unsupported command",
        0x4a => "unknown command",
        0x4b => "data overflow",
        0x4c => "object too big",
        0x4d => "out of memory",
        0x4e => "control pipe closed",
        0x50 => "session busy",
        0x51 => "unable to detach session",
        _ => "unknown status",
    }
}

/// Decode the SEXP parameter of a response body.
///
/// Returns `None` for an empty body (commands with no result).
pub fn decode_sexp_param(body: &[u8]) -> Result<Option<RValue>, CodecError> {
    if body.is_empty() {
        return Ok(None);
    }
    let (ty, len, hdr) = read_item_header(body, dt::LARGE)?;
    if ty & !dt::LARGE != dt::SEXP {
        return Err(CodecError::Malformed(format!("expected SEXP parameter, got type {ty}")));
    }
    need(body, hdr + len)?;
    let (value, _) = decode_sexp(&body[hdr..hdr + len])?;
    Ok(Some(value))
}

// ── SEXP encoding ─────────────────────────────────────────────────────────────

/// Serialise a value, attributes included.
pub fn encode_sexp(value: &RValue) -> Vec<u8> {
    let mut body = Vec::new();
    let mut ty = 0u8;
    if !value.attrs.is_empty() {
        ty |= xt::HAS_ATTR;
        body.extend_from_slice(&encode_pairlist(&value.attrs));
    }

    ty |= match &value.data {
        RData::Null | RData::Other(_) => xt::NULL,
        RData::Logical(v) => {
            body.extend_from_slice(&(v.len() as i32).to_le_bytes());
            body.extend(v.iter().map(|b| match b {
                Some(true) => 1,
                Some(false) => 0,
                None => NA_LOGICAL,
            }));
            pad_to_word(&mut body, 0xff);
            xt::ARRAY_BOOL
        }
        RData::Integer(v) => {
            for i in v {
                body.extend_from_slice(&i.unwrap_or(NA_INTEGER).to_le_bytes());
            }
            xt::ARRAY_INT
        }
        RData::Double(v) => {
            for d in v {
                let bits = d.map(f64::to_bits).unwrap_or(NA_DOUBLE_BITS);
                body.extend_from_slice(&bits.to_le_bytes());
            }
            xt::ARRAY_DOUBLE
        }
        RData::Character(v) => {
            for s in v {
                match s {
                    Some(s) => body.extend_from_slice(s.as_bytes()),
                    None => body.push(NA_STRING),
                }
                body.push(0);
            }
            pad_to_word(&mut body, 0x01);
            xt::ARRAY_STR
        }
        RData::Raw(bytes) => {
            body.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            body.extend_from_slice(bytes);
            pad_to_word(&mut body, 0);
            xt::RAW
        }
        RData::List(items) => {
            for item in items {
                body.extend_from_slice(&encode_sexp(item));
            }
            xt::VECTOR
        }
        RData::Symbol(name) => {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            pad_to_word(&mut body, 0);
            xt::SYMNAME
        }
    };

    let mut out = Vec::with_capacity(body.len() + 8);
    write_item_header(&mut out, ty, xt::LARGE, body.len());
    out.extend_from_slice(&body);
    out
}

/// Encode an attribute pairlist as `XT_LIST_TAG`: value, then tag symbol.
fn encode_pairlist(attrs: &[(String, RValue)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in attrs {
        body.extend_from_slice(&encode_sexp(value));
        body.extend_from_slice(&encode_sexp(&RData::Symbol(name.clone()).into()));
    }
    let mut out = Vec::with_capacity(body.len() + 8);
    write_item_header(&mut out, xt::LIST_TAG, xt::LARGE, body.len());
    out.extend_from_slice(&body);
    out
}

// ── SEXP decoding ─────────────────────────────────────────────────────────────

/// Decode one SEXP from the front of `buf`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_sexp(buf: &[u8]) -> Result<(RValue, usize), CodecError> {
    let (ty, len, hdr) = read_item_header(buf, xt::LARGE)?;
    let end = hdr + len;
    need(buf, end)?;
    let mut body = &buf[hdr..end];

    let mut attrs = Vec::new();
    if ty & xt::HAS_ATTR != 0 {
        let (attr, used) = decode_sexp(body)?;
        attrs = into_pairs(attr);
        body = &body[used..];
    }

    let data = match ty & xt::TYPE_MASK {
        xt::NULL => RData::Null,
        xt::INT => RData::Integer(vec![na_int(read_i32(body, 0)?)]),
        xt::DOUBLE => RData::Double(decode_doubles(body)?.into_iter().take(1).collect()),
        xt::BOOL => RData::Logical(vec![logical(*body.first().unwrap_or(&NA_LOGICAL))]),
        xt::STR | xt::SYMNAME => RData::Symbol(c_string(body)),
        xt::SYM => {
            let (inner, _) = decode_sexp(body)?;
            RData::Symbol(inner.as_string().unwrap_or_default().to_owned())
        }
        xt::ARRAY_INT => RData::Integer(
            body.chunks_exact(4)
                .map(|c| na_int(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
        ),
        xt::ARRAY_DOUBLE => RData::Double(decode_doubles(body)?),
        xt::ARRAY_STR => RData::Character(decode_strings(body)),
        xt::ARRAY_BOOL => {
            let n = read_i32(body, 0)?.max(0) as usize;
            need(body, 4 + n)?;
            RData::Logical(body[4..4 + n].iter().map(|&b| logical(b)).collect())
        }
        xt::RAW => {
            let n = read_i32(body, 0)?.max(0) as usize;
            need(body, 4 + n)?;
            RData::Raw(body[4..4 + n].to_vec())
        }
        xt::VECTOR | xt::VECTOR_EXP | xt::LIST_NOTAG => RData::List(decode_sequence(body)?),
        xt::LIST_TAG => {
            let pairs = decode_tagged(body)?;
            let names: Vec<String> = pairs.iter().map(|(n, _)| n.clone()).collect();
            let values = pairs.into_iter().map(|(_, v)| v).collect();
            attrs.push(("names".to_owned(), RValue::strings(names)));
            RData::List(values)
        }
        other => RData::Other(other),
    };

    Ok((RValue { data, attrs }, end))
}

fn na_int(v: i32) -> Option<i32> {
    (v != NA_INTEGER).then_some(v)
}

fn logical(b: u8) -> Option<bool> {
    match b {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

fn is_na_double(d: f64) -> bool {
    d.is_nan() && (d.to_bits() & 0xffff_ffff) == 1954
}

fn decode_doubles(body: &[u8]) -> Result<Vec<Option<f64>>, CodecError> {
    if body.len() % 8 != 0 {
        return Err(CodecError::Malformed(format!("double array of {} bytes", body.len())));
    }
    Ok(body
        .chunks_exact(8)
        .map(|c| {
            let d = f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
            (!is_na_double(d)).then_some(d)
        })
        .collect())
}

/// Null-terminated strings; bytes after the last terminator are padding.
fn decode_strings(body: &[u8]) -> Vec<Option<String>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in body.iter().enumerate() {
        if b == 0 {
            let s = &body[start..i];
            out.push(if s == [NA_STRING] {
                None
            } else {
                Some(String::from_utf8_lossy(s).into_owned())
            });
            start = i + 1;
        }
    }
    out
}

fn c_string(body: &[u8]) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

fn decode_sequence(mut body: &[u8]) -> Result<Vec<RValue>, CodecError> {
    let mut items = Vec::new();
    while !body.is_empty() {
        let (item, used) = decode_sexp(body)?;
        items.push(item);
        body = &body[used..];
    }
    Ok(items)
}

fn decode_tagged(mut body: &[u8]) -> Result<Vec<(String, RValue)>, CodecError> {
    let mut pairs = Vec::new();
    while !body.is_empty() {
        let (value, used) = decode_sexp(body)?;
        body = &body[used..];
        let (tag, used) = decode_sexp(body)?;
        body = &body[used..];
        let name = tag.as_string().unwrap_or_default().to_owned();
        pairs.push((name, value));
    }
    Ok(pairs)
}

/// Flatten a decoded tagged list back into `(name, value)` attribute pairs.
fn into_pairs(list: RValue) -> Vec<(String, RValue)> {
    let names: Vec<String> = list
        .names()
        .into_iter()
        .map(|n| n.unwrap_or_default().to_owned())
        .collect();
    match list.data {
        RData::List(values) => names.into_iter().zip(values).collect(),
        _ => Vec::new(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_vector_bytes() {
        let bytes = encode_sexp(&RValue::integer(vec![Some(1), None]));
        assert_eq!(bytes, [0x20, 8, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0x80]);
    }

    #[test]
    fn logical_vector_is_padded_with_ff() {
        let bytes = encode_sexp(&RValue::logical(vec![Some(true), None, Some(false)]));
        assert_eq!(bytes, [0x24, 8, 0, 0, 3, 0, 0, 0, 1, 2, 0, 0xff]);
    }

    #[test]
    fn string_vector_with_missing_marker() {
        let bytes = encode_sexp(&RValue::character(vec![Some("a".into()), None]));
        assert_eq!(bytes, [0x22, 4, 0, 0, b'a', 0, 0xff, 0]);
    }

    #[test]
    fn string_vector_padding_is_ignored_on_decode() {
        // "ab\0" padded with one 0x01.
        let buf = [0x22, 4, 0, 0, b'a', b'b', 0, 0x01];
        let (v, used) = decode_sexp(&buf).unwrap();
        assert_eq!(used, 8);
        assert_eq!(v, RValue::strings(["ab"]));
    }

    #[test]
    fn double_missing_marker_is_distinct_from_nan() {
        let v = RValue::double(vec![Some(1.5), None]);
        let (back, _) = decode_sexp(&encode_sexp(&v)).unwrap();
        assert_eq!(back, v);

        let mut buf = vec![0x21, 8, 0, 0];
        buf.extend_from_slice(&f64::NAN.to_le_bytes());
        let (plain_nan, _) = decode_sexp(&buf).unwrap();
        match plain_nan.data {
            RData::Double(ref d) => assert!(d[0].is_some_and(f64::is_nan)),
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn data_frame_survives_codec() {
        let df = RValue::data_frame(vec![
            ("flag".into(), RValue::logical(vec![Some(true), None])),
            ("n".into(), RValue::integer(vec![Some(7), Some(8)])),
            ("x".into(), RValue::double(vec![None, Some(2.25)])),
            ("s".into(), RValue::character(vec![Some("hi".into()), None])),
        ]);
        let (back, used) = decode_sexp(&encode_sexp(&df)).unwrap();
        assert_eq!(used, encode_sexp(&df).len());
        assert!(back.is_data_frame());
        assert_eq!(back.column("n"), df.column("n"));
        assert_eq!(back.column("s"), df.column("s"));
        assert_eq!(back, df);
    }

    #[test]
    fn raw_vector() {
        let v = RValue::raw(vec![1, 2, 3, 4, 5]);
        let bytes = encode_sexp(&v);
        assert_eq!(bytes.len(), 4 + 4 + 8);
        assert_eq!(decode_sexp(&bytes).unwrap().0, v);
    }

    #[test]
    fn large_header_roundtrip() {
        let mut out = Vec::new();
        write_item_header(&mut out, xt::RAW, xt::LARGE, 0x0123_4567_89);
        assert_eq!(out.len(), 8);
        let (ty, len, hdr) = read_item_header(&out, xt::LARGE).unwrap();
        assert_eq!(ty, xt::RAW | xt::LARGE);
        assert_eq!(len, 0x0123_4567_89);
        assert_eq!(hdr, 8);
    }

    #[test]
    fn eval_command_layout() {
        let msg = encode_command(CMD_EVAL, &[Param::Str("1+1")]);
        // header(16) + param header(4) + "1+1\0"(4)
        assert_eq!(msg.len(), 24);
        assert_eq!(&msg[0..4], &CMD_EVAL.to_le_bytes());
        assert_eq!(&msg[4..8], &8u32.to_le_bytes());
        assert_eq!(&msg[16..20], &[dt::STRING, 4, 0, 0]);
        assert_eq!(&msg[20..24], b"1+1\0");
    }

    #[test]
    fn response_header_status() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(RESP_ERR | (0x45 << 24)).to_le_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        let h = ResponseHeader::decode(&buf).unwrap();
        assert!(h.is_error());
        assert!(!h.is_ok());
        assert_eq!(h.status(), 0x45);
        assert_eq!(status_text(h.status()), "evaluation error");
    }

    #[test]
    fn sexp_param_decoding() {
        let sexp = encode_sexp(&RValue::integer(vec![Some(2)]));
        let mut body = vec![dt::SEXP, sexp.len() as u8, 0, 0];
        body.extend_from_slice(&sexp);
        assert_eq!(
            decode_sexp_param(&body).unwrap(),
            Some(RValue::integer(vec![Some(2)]))
        );
        assert_eq!(decode_sexp_param(&[]).unwrap(), None);
    }

    #[test]
    fn server_id_checks() {
        let ok = b"Rsrv0103QAP1\r\n\r\n--------\r\n\r\n\r\n\r\n";
        assert_eq!(ok.len(), ID_LEN);
        assert!(check_server_id(ok).is_ok());

        let auth = b"Rsrv0103QAP1\r\n\r\nARpt----\r\n\r\n\r\n\r\n";
        assert_eq!(check_server_id(auth), Err(CodecError::AuthRequired));

        let bogus = [b'x'; ID_LEN];
        assert!(matches!(check_server_id(&bogus), Err(CodecError::BadId(_))));
    }

    #[test]
    fn truncated_input_is_an_error() {
        let bytes = encode_sexp(&RValue::integer(vec![Some(1), Some(2)]));
        assert!(matches!(
            decode_sexp(&bytes[..6]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_type_decodes_as_other() {
        let buf = [7u8, 0, 0, 0];
        assert_eq!(decode_sexp(&buf).unwrap().0.data, RData::Other(7));
    }
}
