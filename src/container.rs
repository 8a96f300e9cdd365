//! NMSG container wire format.
//!
//! A transfer unit on the wire is a frame: 4-byte magic, 1 flag byte, a
//! 32-bit big-endian body length, and a protobuf body. The body is either a
//! whole [`Nmsg`] container or, when the `FLAG_FRAGMENT` bit is set, one
//! [`NmsgFragment`] piece of an oversized container. `FLAG_ZLIB` marks a
//! zlib-deflated body (for fragments, the flag describes the reassembled
//! container, not the individual piece).

use std::io::{Read, Write};

use prost::Message;

use crate::error::{Error, Result};

pub const MAGIC: [u8; 4] = *b"NMSG";
pub const FLAG_ZLIB: u8 = 0x01;
pub const FLAG_FRAGMENT: u8 = 0x02;

/// Frame header bytes: magic + flags + length.
pub const HDR_LEN: usize = 4 + 1 + 4;

/// Upper bound on a frame body; larger lengths are treated as corruption.
pub const MAX_BODY_LEN: usize = 4 * 1024 * 1024;

/// One NMSG transfer unit: a batch of payloads.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Nmsg {
    #[prost(message, repeated, tag = "1")]
    pub payloads: Vec<NmsgPayload>,
    #[prost(uint32, tag = "2")]
    pub flags: u32,
}

/// A typed, timestamped event record.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NmsgPayload {
    #[prost(uint32, tag = "1")]
    pub vid: u32,
    #[prost(uint32, tag = "2")]
    pub msgtype: u32,
    #[prost(uint64, tag = "3")]
    pub time_sec: u64,
    #[prost(uint32, tag = "4")]
    pub time_nsec: u32,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub payload: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "6")]
    pub source: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub operator: Option<u32>,
    #[prost(uint32, optional, tag = "8")]
    pub group: Option<u32>,
}

/// One piece of a container split to fit a transport MTU.
/// `current == last` marks the terminal piece.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NmsgFragment {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub current: u32,
    #[prost(uint32, tag = "3")]
    pub last: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub fragment: Vec<u8>,
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub flags: u8,
    pub len: usize,
}

impl FrameHeader {
    pub fn is_fragment(&self) -> bool {
        self.flags & FLAG_FRAGMENT != 0
    }

    pub fn is_zlib(&self) -> bool {
        self.flags & FLAG_ZLIB != 0
    }
}

/// Serialize one frame into `out`.
pub fn put_frame(out: &mut Vec<u8>, flags: u8, body: &[u8]) {
    out.extend_from_slice(&MAGIC);
    out.push(flags);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
}

/// Write one frame to a byte stream.
pub fn write_frame(w: &mut dyn Write, flags: u8, body: &[u8]) -> Result<()> {
    w.write_all(&MAGIC)?;
    w.write_all(&[flags])?;
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(body)?;
    Ok(())
}

/// Read one frame header from a byte stream.
///
/// A clean end of stream before the first header byte maps to `Eof`; an end
/// of stream inside the header also maps to `Eof` (the peer went away
/// mid-frame, nothing can be resynchronized).
pub fn read_frame_header(r: &mut dyn Read) -> Result<FrameHeader> {
    let mut hdr = [0u8; HDR_LEN];
    let mut filled = 0;
    while filled < HDR_LEN {
        let n = r.read(&mut hdr[filled..])?;
        if n == 0 {
            return Err(Error::Eof);
        }
        filled += n;
    }
    parse_frame_header(&hdr)
}

fn parse_frame_header(hdr: &[u8; HDR_LEN]) -> Result<FrameHeader> {
    if hdr[..4] != MAGIC {
        return Err(Error::Malformed("bad frame magic".into()));
    }
    let len = u32::from_be_bytes([hdr[5], hdr[6], hdr[7], hdr[8]]) as usize;
    if len > MAX_BODY_LEN {
        return Err(Error::Malformed(format!("frame body of {len} bytes")));
    }
    Ok(FrameHeader { flags: hdr[4], len })
}

/// Split a datagram into its frame header and body.
pub fn parse_dgram_frame(buf: &[u8]) -> Result<(FrameHeader, &[u8])> {
    if buf.len() < HDR_LEN {
        return Err(Error::Malformed("short datagram".into()));
    }
    let mut hdr = [0u8; HDR_LEN];
    hdr.copy_from_slice(&buf[..HDR_LEN]);
    let header = parse_frame_header(&hdr)?;
    let body = &buf[HDR_LEN..];
    if body.len() != header.len {
        return Err(Error::Malformed("datagram length mismatch".into()));
    }
    Ok((header, body))
}

/// zlib-deflate a container body.
pub fn deflate(body: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(body)?;
    Ok(enc.finish()?)
}

/// Inflate a zlib-deflated container body.
pub fn inflate(body: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;

    let mut out = Vec::new();
    ZlibDecoder::new(body).read_to_end(&mut out)?;
    Ok(out)
}

/// Decode a (possibly deflated) container body.
pub fn decode_container(header: FrameHeader, body: &[u8]) -> Result<Nmsg> {
    if header.is_zlib() {
        let raw = inflate(body)?;
        Ok(Nmsg::decode(raw.as_slice())?)
    } else {
        Ok(Nmsg::decode(body)?)
    }
}
