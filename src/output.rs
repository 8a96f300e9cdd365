//! Output sinks for NMSG payloads.
//!
//! All sinks speak the same trait: payloads go in one at a time, containers
//! come out whenever a sink's own policy says so. Byte-stream outputs pack
//! payloads into containers up to a buffer size; datagram outputs emit one
//! container per datagram and fragment containers that exceed the MTU;
//! presentation outputs render text lines; callback and channel outputs
//! hand payloads straight to the embedder.

use std::io::Write;
use std::net::UdpSocket;
use std::sync::Arc;

use prost::Message;

use crate::container::{self, Nmsg, NmsgPayload, FLAG_FRAGMENT, FLAG_ZLIB, HDR_LEN};
use crate::error::{Error, Result};
use crate::frag::split_container;
use crate::module::ModuleSet;

pub const WBUFSZ_MIN: usize = 512;
pub const WBUFSZ_MAX: usize = 1024 * 1024;
/// Fits one Ethernet frame after IP + UDP headers.
pub const WBUFSZ_ETHER: usize = 1280;
/// Fits one jumbo Ethernet frame.
pub const WBUFSZ_JUMBO: usize = 8962;

/// Default presentation line continuation.
pub const DEFAULT_ENDLINE: &str = "\\\n";

/// What a write-path call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The payload was buffered; nothing reached the wire.
    Buffered,
    /// At least one full container left this sink.
    ContainerWritten,
}

/// Which concrete sink a trait object is, for close-event metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stream,
    Datagram,
    Pres,
    Callback,
}

/// A payload sink.
pub trait Output: Send {
    /// Accept one payload; the sink owns it afterwards.
    fn append(&mut self, payload: NmsgPayload) -> Result<WriteOutcome>;

    /// Force any buffered container out.
    fn flush(&mut self) -> Result<WriteOutcome>;

    /// Flush and release the underlying resource.
    fn close(&mut self) -> Result<WriteOutcome>;

    fn kind(&self) -> OutputKind;

    /// zlib-compress emitted containers. Ignored by sinks that do not
    /// serialize.
    fn set_zlib(&mut self, _on: bool) {}

    /// Presentation line continuation. Ignored by non-presentation sinks.
    fn set_endline(&mut self, _endline: &str) {}

    /// Suppress presentation headers. Ignored by non-presentation sinks.
    fn set_quiet(&mut self, _quiet: bool) {}
}

fn clamp_bufsz(bufsz: usize) -> usize {
    bufsz.clamp(WBUFSZ_MIN, WBUFSZ_MAX)
}

/// Accumulates payloads and tracks the estimated packed container size.
struct ContainerBuf {
    container: Nmsg,
    estimate: usize,
}

// Frame header plus the container's own flags field.
const CONTAINER_OVERHEAD: usize = HDR_LEN + 8;

impl ContainerBuf {
    fn new() -> Self {
        Self {
            container: Nmsg::default(),
            estimate: CONTAINER_OVERHEAD,
        }
    }

    fn is_empty(&self) -> bool {
        self.container.payloads.is_empty()
    }

    fn would_overflow(&self, payload: &NmsgPayload, bufsz: usize) -> bool {
        !self.is_empty() && self.estimate + payload.packed_size() > bufsz
    }

    fn push(&mut self, payload: NmsgPayload) {
        self.estimate += payload.packed_size();
        self.container.payloads.push(payload);
    }

    /// Encode and reset. Returns `(flags, body)`.
    fn encode(&mut self, zlib: bool) -> Result<(u8, Vec<u8>)> {
        let body = self.container.encode_to_vec();
        self.container.payloads.clear();
        self.estimate = CONTAINER_OVERHEAD;
        if zlib {
            Ok((FLAG_ZLIB, container::deflate(&body)?))
        } else {
            Ok((0, body))
        }
    }
}

// ─── Byte-stream output ──────────────────────────────────────────────────────

/// Length-prefixed containers over any byte stream (file, pipe, TCP).
pub struct StreamOutput {
    w: Box<dyn Write + Send>,
    bufsz: usize,
    zlib: bool,
    buffered: bool,
    buf: ContainerBuf,
}

impl StreamOutput {
    /// `bufsz` is clamped to `WBUFSZ_MIN..=WBUFSZ_MAX`.
    pub fn new(w: impl Write + Send + 'static, bufsz: usize) -> Self {
        Self {
            w: Box::new(w),
            bufsz: clamp_bufsz(bufsz),
            zlib: false,
            buffered: true,
            buf: ContainerBuf::new(),
        }
    }

    /// Unbuffered outputs emit a container after every payload. Useful for
    /// very low volume streams where latency beats packing density.
    pub fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    fn write_container(&mut self) -> Result<()> {
        let (flags, body) = self.buf.encode(self.zlib)?;
        container::write_frame(&mut self.w, flags, &body)
    }
}

impl Output for StreamOutput {
    fn append(&mut self, payload: NmsgPayload) -> Result<WriteOutcome> {
        let mut wrote = false;
        if self.buf.would_overflow(&payload, self.bufsz) {
            self.write_container()?;
            wrote = true;
        }
        self.buf.push(payload);
        if !self.buffered {
            self.write_container()?;
            wrote = true;
        }
        Ok(if wrote {
            WriteOutcome::ContainerWritten
        } else {
            WriteOutcome::Buffered
        })
    }

    fn flush(&mut self) -> Result<WriteOutcome> {
        if self.buf.is_empty() {
            return Ok(WriteOutcome::Buffered);
        }
        self.write_container()?;
        self.w.flush()?;
        Ok(WriteOutcome::ContainerWritten)
    }

    fn close(&mut self) -> Result<WriteOutcome> {
        let outcome = self.flush()?;
        self.w.flush()?;
        Ok(outcome)
    }

    fn kind(&self) -> OutputKind {
        OutputKind::Stream
    }

    fn set_zlib(&mut self, on: bool) {
        self.zlib = on;
    }
}

// ─── Datagram output ─────────────────────────────────────────────────────────

/// One container per datagram over a connected UDP socket.
///
/// A container whose encoded frame would exceed the MTU is split into
/// `FLAG_FRAGMENT` frames; the zlib flag rides along on every piece so the
/// receiver knows how to treat the reassembled body.
pub struct DatagramOutput {
    sock: UdpSocket,
    mtu: usize,
    zlib: bool,
    buffered: bool,
    buf: ContainerBuf,
    next_frag_id: u32,
}

impl DatagramOutput {
    /// `sock` must already be connected. `mtu` bounds each datagram and is
    /// clamped to `WBUFSZ_MIN..=WBUFSZ_MAX`; `WBUFSZ_ETHER` or
    /// `WBUFSZ_JUMBO` are the usual choices.
    pub fn new(sock: UdpSocket, mtu: usize) -> Self {
        // seed the fragment id so concurrent senders to one socket address
        // are unlikely to collide
        let seed = crate::payload::now_timespec();
        Self {
            sock,
            mtu: clamp_bufsz(mtu),
            zlib: false,
            buffered: true,
            buf: ContainerBuf::new(),
            next_frag_id: (seed.0 as u32) ^ seed.1,
        }
    }

    pub fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    fn send_container(&mut self) -> Result<()> {
        let (flags, body) = self.buf.encode(self.zlib)?;

        if HDR_LEN + body.len() <= self.mtu {
            let mut frame = Vec::with_capacity(HDR_LEN + body.len());
            container::put_frame(&mut frame, flags, &body);
            self.sock.send(&frame)?;
            return Ok(());
        }

        let id = self.next_frag_id;
        self.next_frag_id = self.next_frag_id.wrapping_add(1);
        for piece in split_container(&body, self.mtu, id) {
            let piece_body = piece.encode_to_vec();
            let mut frame = Vec::with_capacity(HDR_LEN + piece_body.len());
            container::put_frame(&mut frame, flags | FLAG_FRAGMENT, &piece_body);
            self.sock.send(&frame)?;
        }
        Ok(())
    }
}

impl Output for DatagramOutput {
    fn append(&mut self, payload: NmsgPayload) -> Result<WriteOutcome> {
        let mut wrote = false;
        if self.buf.would_overflow(&payload, self.mtu) {
            self.send_container()?;
            wrote = true;
        }
        self.buf.push(payload);
        if !self.buffered {
            self.send_container()?;
            wrote = true;
        }
        Ok(if wrote {
            WriteOutcome::ContainerWritten
        } else {
            WriteOutcome::Buffered
        })
    }

    fn flush(&mut self) -> Result<WriteOutcome> {
        if self.buf.is_empty() {
            return Ok(WriteOutcome::Buffered);
        }
        self.send_container()?;
        Ok(WriteOutcome::ContainerWritten)
    }

    fn close(&mut self) -> Result<WriteOutcome> {
        self.flush()
    }

    fn kind(&self) -> OutputKind {
        OutputKind::Datagram
    }

    fn set_zlib(&mut self, on: bool) {
        self.zlib = on;
    }
}

// ─── Presentation output ─────────────────────────────────────────────────────

/// Line-oriented textual rendering of payloads.
///
/// Each payload becomes a header line
/// `[size] YYYY-MM-DD HH:MM:SS.nnnnnnnnn [vid:msgtype vname mname]`
/// followed by the module's rendering. Quiet mode drops the header.
pub struct PresOutput {
    w: Box<dyn Write + Send>,
    modules: Arc<ModuleSet>,
    endline: String,
    quiet: bool,
}

impl PresOutput {
    pub fn new(w: impl Write + Send + 'static, modules: Arc<ModuleSet>) -> Self {
        Self {
            w: Box::new(w),
            modules,
            endline: DEFAULT_ENDLINE.to_owned(),
            quiet: false,
        }
    }
}

impl Output for PresOutput {
    fn append(&mut self, payload: NmsgPayload) -> Result<WriteOutcome> {
        let module = match self.modules.lookup(payload.vid, payload.msgtype) {
            Some(m) => m,
            None => {
                tracing::debug!(
                    vid = payload.vid,
                    msgtype = payload.msgtype,
                    "no presentation module; payload skipped"
                );
                return Ok(WriteOutcome::Buffered);
            }
        };
        let pres = module.payload_to_pres(&payload, &self.endline)?;

        if self.quiet {
            writeln!(self.w, "{pres}")?;
        } else {
            let when = chrono::DateTime::from_timestamp(payload.time_sec as i64, 0)
                .unwrap_or_default()
                .format("%Y-%m-%d %H:%M:%S");
            writeln!(
                self.w,
                "[{}] {}.{:09} [{}:{} {} {}] {}{}",
                payload.payload_len(),
                when,
                payload.time_nsec,
                payload.vid,
                payload.msgtype,
                module.vendor_name(),
                module.msgtype_name(),
                self.endline,
                pres,
            )?;
        }
        self.w.flush()?;
        Ok(WriteOutcome::Buffered)
    }

    fn flush(&mut self) -> Result<WriteOutcome> {
        self.w.flush()?;
        Ok(WriteOutcome::Buffered)
    }

    fn close(&mut self) -> Result<WriteOutcome> {
        self.flush()
    }

    fn kind(&self) -> OutputKind {
        OutputKind::Pres
    }

    fn set_endline(&mut self, endline: &str) {
        self.endline = endline.to_owned();
    }

    fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }
}

// ─── Callback and channel outputs ────────────────────────────────────────────

/// Hands each payload to a user function; the function owns it afterwards.
pub struct CallbackOutput {
    cb: Box<dyn FnMut(NmsgPayload) + Send>,
}

impl CallbackOutput {
    pub fn new(cb: impl FnMut(NmsgPayload) + Send + 'static) -> Self {
        Self { cb: Box::new(cb) }
    }
}

impl Output for CallbackOutput {
    fn append(&mut self, payload: NmsgPayload) -> Result<WriteOutcome> {
        (self.cb)(payload);
        Ok(WriteOutcome::Buffered)
    }

    fn flush(&mut self) -> Result<WriteOutcome> {
        Ok(WriteOutcome::Buffered)
    }

    fn close(&mut self) -> Result<WriteOutcome> {
        Ok(WriteOutcome::Buffered)
    }

    fn kind(&self) -> OutputKind {
        OutputKind::Callback
    }
}

/// Sends each payload into a bounded channel, for embedders that consume the
/// pipeline programmatically.
pub struct ChannelOutput {
    tx: crossbeam_channel::Sender<NmsgPayload>,
}

impl ChannelOutput {
    pub fn new(tx: crossbeam_channel::Sender<NmsgPayload>) -> Self {
        Self { tx }
    }
}

impl Output for ChannelOutput {
    fn append(&mut self, payload: NmsgPayload) -> Result<WriteOutcome> {
        self.tx
            .send(payload)
            .map_err(|_| Error::Failure("payload channel disconnected".into()))?;
        Ok(WriteOutcome::Buffered)
    }

    fn flush(&mut self) -> Result<WriteOutcome> {
        Ok(WriteOutcome::Buffered)
    }

    fn close(&mut self) -> Result<WriteOutcome> {
        Ok(WriteOutcome::Buffered)
    }

    fn kind(&self) -> OutputKind {
        OutputKind::Callback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{read_frame_header, decode_container, NmsgFragment};
    use crate::frag::FragTable;
    use crate::module::TextModule;
    use std::io::Read;
    use std::sync::Mutex;

    /// Test writer that shares its bytes with the asserting side.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn take(&self) -> Vec<u8> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn np(bytes: &[u8]) -> NmsgPayload {
        NmsgPayload::make(bytes, 1, 1, 1_300_000_000, 0)
    }

    fn read_all_containers(mut wire: &[u8]) -> Vec<Nmsg> {
        let mut out = Vec::new();
        loop {
            let header = match read_frame_header(&mut wire) {
                Ok(h) => h,
                Err(Error::Eof) => break,
                Err(e) => panic!("bad frame: {e}"),
            };
            let mut body = vec![0u8; header.len];
            wire.read_exact(&mut body).unwrap();
            out.push(decode_container(header, &body).unwrap());
        }
        out
    }

    #[test]
    fn test_stream_packs_until_bufsz() {
        let sink = SharedBuf::default();
        let mut out = StreamOutput::new(sink.clone(), WBUFSZ_MIN);

        let payload = vec![0xab; 200];
        let mut wrote = 0;
        for _ in 0..5 {
            if out.append(np(&payload)).unwrap() == WriteOutcome::ContainerWritten {
                wrote += 1;
            }
        }
        assert!(wrote >= 1, "bufsz 512 cannot hold five 200-byte payloads");
        out.close().unwrap();

        let containers = read_all_containers(&sink.take());
        assert!(containers.len() >= 2);
        let total: usize = containers.iter().map(|c| c.payloads.len()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_stream_unbuffered_writes_each_payload() {
        let sink = SharedBuf::default();
        let mut out = StreamOutput::new(sink.clone(), WBUFSZ_MAX);
        out.set_buffered(false);

        for _ in 0..3 {
            assert_eq!(out.append(np(b"tiny")).unwrap(), WriteOutcome::ContainerWritten);
        }
        let containers = read_all_containers(&sink.take());
        assert_eq!(containers.len(), 3);
    }

    #[test]
    fn test_stream_zlib_round_trip() {
        let sink = SharedBuf::default();
        let mut out = StreamOutput::new(sink.clone(), WBUFSZ_MAX);
        out.set_zlib(true);
        out.append(np(&vec![0x11; 4096])).unwrap();
        out.close().unwrap();

        let wire = sink.take();
        let containers = read_all_containers(&wire);
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].payloads[0].payload_len(), 4096);
        // deflated frame must be smaller than the raw payload
        assert!(wire.len() < 4096);
    }

    #[test]
    fn test_datagram_fragments_oversized_container() {
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
        let send = UdpSocket::bind("127.0.0.1:0").unwrap();
        send.connect(recv.local_addr().unwrap()).unwrap();

        let mut out = DatagramOutput::new(send, WBUFSZ_ETHER);
        out.append(np(&vec![0x42; 4000])).unwrap();
        out.flush().unwrap();

        let mut table = FragTable::new();
        let mut buf = [0u8; 65535];
        let mut done = None;
        while done.is_none() {
            let n = recv.recv(&mut buf).unwrap();
            let (header, body) = container::parse_dgram_frame(&buf[..n]).unwrap();
            assert!(header.is_fragment());
            assert!(n <= WBUFSZ_ETHER + HDR_LEN);
            let piece = NmsgFragment::decode(body).unwrap();
            done = table.insert(piece, 0).unwrap();
        }
        let body = done.unwrap();
        let nmsg = Nmsg::decode(body.as_slice()).unwrap();
        assert_eq!(nmsg.payloads[0].payload_len(), 4000);
    }

    #[test]
    fn test_datagram_small_container_single_frame() {
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
        let send = UdpSocket::bind("127.0.0.1:0").unwrap();
        send.connect(recv.local_addr().unwrap()).unwrap();

        let mut out = DatagramOutput::new(send, WBUFSZ_ETHER);
        out.append(np(b"fits easily")).unwrap();
        out.flush().unwrap();

        let mut buf = [0u8; 65535];
        let n = recv.recv(&mut buf).unwrap();
        let (header, body) = container::parse_dgram_frame(&buf[..n]).unwrap();
        assert!(!header.is_fragment());
        let nmsg = decode_container(header, body).unwrap();
        assert_eq!(nmsg.payloads[0].payload.as_deref(), Some(&b"fits easily"[..]));
    }

    #[test]
    fn test_pres_output_header_format() {
        let sink = SharedBuf::default();
        let mut modules = ModuleSet::new();
        modules.register(Arc::new(TextModule));
        let mut out = PresOutput::new(sink.clone(), Arc::new(modules));

        let mut payload = NmsgPayload::make(b"hello", 1, 1, 0, 42);
        payload.time_sec = 0;
        out.append(payload).unwrap();

        let text = String::from_utf8(sink.take()).unwrap();
        assert_eq!(text, "[5] 1970-01-01 00:00:00.000000042 [1:1 base text] \\\nhello\n");
    }

    #[test]
    fn test_pres_output_quiet() {
        let sink = SharedBuf::default();
        let mut modules = ModuleSet::new();
        modules.register(Arc::new(TextModule));
        let mut out = PresOutput::new(sink.clone(), Arc::new(modules));
        out.set_quiet(true);

        out.append(NmsgPayload::make(b"just the text", 1, 1, 0, 0)).unwrap();
        assert_eq!(sink.take(), b"just the text\n");
    }

    #[test]
    fn test_pres_output_skips_unknown_type() {
        let sink = SharedBuf::default();
        let mut out = PresOutput::new(sink.clone(), Arc::new(ModuleSet::new()));
        out.append(np(b"no module")).unwrap();
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_channel_output_delivers() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let mut out = ChannelOutput::new(tx);
        out.append(np(b"one")).unwrap();
        out.append(np(b"two")).unwrap();
        assert_eq!(rx.try_iter().count(), 2);
        drop(rx);
        // receiver gone: append surfaces Failure
        assert!(matches!(out.append(np(b"three")), Err(Error::Failure(_))));
    }
}
