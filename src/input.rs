//! Input handles.
//!
//! An NMSG input produces whole containers from a byte stream or a datagram
//! socket, transparently inflating compressed bodies and reassembling
//! container fragments through its own [`FragTable`]. A presentation input
//! produces payload bytes from lines of text via a module parser.

use std::io::{BufRead, BufReader, Read};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use prost::Message;

use crate::container::{self, Nmsg, NmsgFragment};
use crate::error::{Error, Result};
use crate::frag::FragTable;
use crate::module::{MsgModule, PresParser};
use crate::payload::now_timespec;

/// Receive buffer for datagram inputs; large enough for any single frame.
const DGRAM_RECV_CAP: usize = 65536;

/// Kernel receive buffer requested for sockets built by [`NmsgInput::open_sock`].
const SOCK_RCVBUF: usize = 4 * 1024 * 1024;

enum InputKind {
    Stream(Box<dyn Read + Send>),
    Datagram { sock: UdpSocket, buf: Vec<u8> },
}

/// A source of NMSG containers.
pub struct NmsgInput {
    kind: InputKind,
    frags: FragTable,
    last_sec: u64,
}

impl NmsgInput {
    /// Length-prefixed container stream over any reader (file, pipe, TCP).
    pub fn stream(r: impl Read + Send + 'static) -> Self {
        Self {
            kind: InputKind::Stream(Box::new(r)),
            frags: FragTable::new(),
            last_sec: 0,
        }
    }

    /// One frame per datagram over a bound UDP socket.
    ///
    /// A read timeout is installed if the socket has none, so a stopped
    /// pipeline does not hang in `recv`.
    pub fn datagram(sock: UdpSocket) -> Self {
        if let Ok(None) = sock.read_timeout() {
            let _ = sock.set_read_timeout(Some(Duration::from_millis(500)));
        }
        Self {
            kind: InputKind::Datagram {
                sock,
                buf: vec![0u8; DGRAM_RECV_CAP],
            },
            frags: FragTable::new(),
            last_sec: 0,
        }
    }

    /// Bind a UDP socket on `addr` and wrap it as an input. The socket gets
    /// address reuse and a deep receive buffer so bursts survive a slow
    /// reader.
    pub fn open_sock(addr: SocketAddr) -> Result<Self> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if let Err(e) = socket.set_recv_buffer_size(SOCK_RCVBUF) {
            tracing::warn!("recv buffer request failed: {e}");
        }
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;
        Ok(Self::datagram(socket.into()))
    }

    /// The container fragment table, for counter inspection.
    pub fn frag_table(&self) -> &FragTable {
        &self.frags
    }

    /// Read the next whole container.
    ///
    /// `Again` means no complete container this round (datagram timeout, a
    /// stored fragment, a dropped duplicate); `Malformed` means the frame
    /// was unusable and skipped; `Eof` ends the stream.
    pub fn read_container(&mut self) -> Result<Nmsg> {
        self.last_sec = now_timespec().0;

        let (header, body) = match &mut self.kind {
            InputKind::Stream(r) => {
                let header = container::read_frame_header(r.as_mut())?;
                let mut body = vec![0u8; header.len];
                let mut filled = 0;
                while filled < body.len() {
                    let n = r.read(&mut body[filled..])?;
                    if n == 0 {
                        // peer vanished mid-frame; a byte stream cannot
                        // resynchronize
                        return Err(Error::Eof);
                    }
                    filled += n;
                }
                (header, body)
            }
            InputKind::Datagram { sock, buf } => {
                let n = match sock.recv(buf) {
                    Ok(n) => n,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        return Err(Error::Again)
                    }
                    Err(e) => return Err(e.into()),
                };
                if n == 0 {
                    return Err(Error::Again);
                }
                let (header, body) = container::parse_dgram_frame(&buf[..n])?;
                (header, body.to_vec())
            }
        };
        self.finish_frame(header, body)
    }

    fn finish_frame(&mut self, header: container::FrameHeader, body: Vec<u8>) -> Result<Nmsg> {
        if header.is_fragment() {
            let piece = NmsgFragment::decode(body.as_slice())?;
            let raw = match self.frags.insert(piece, self.last_sec)? {
                Some(raw) => raw,
                None => return Err(Error::Again),
            };
            let raw = if header.is_zlib() {
                container::inflate(&raw)?
            } else {
                raw
            };
            Ok(Nmsg::decode(raw.as_slice())?)
        } else {
            container::decode_container(header, &body)
        }
    }
}

/// A source of presentation-format payloads: one line at a time through a
/// module's parser.
pub struct PresInput {
    r: BufReader<Box<dyn Read + Send>>,
    parser: Box<dyn PresParser>,
    vid: u32,
    msgtype: u32,
}

impl PresInput {
    pub fn new(r: impl Read + Send + 'static, module: &dyn MsgModule) -> Self {
        Self {
            r: BufReader::new(Box::new(r)),
            parser: module.parser(),
            vid: module.vid(),
            msgtype: module.msgtype(),
        }
    }

    pub fn vid(&self) -> u32 {
        self.vid
    }

    pub fn msgtype(&self) -> u32 {
        self.msgtype
    }

    /// Read one line of text; `Eof` when the stream ends.
    pub fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.r.read_line(&mut line)? == 0 {
            return Err(Error::Eof);
        }
        Ok(line)
    }

    /// Feed one line to the module parser.
    pub fn parse_line(&mut self, line: &str) -> Result<Option<Vec<u8>>> {
        self.parser.line(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{put_frame, NmsgPayload, FLAG_FRAGMENT, FLAG_ZLIB};
    use crate::frag::split_container;
    use crate::module::TextModule;
    use std::io::Cursor;

    fn container_of(texts: &[&str]) -> Nmsg {
        Nmsg {
            payloads: texts
                .iter()
                .map(|t| NmsgPayload::make(t.as_bytes(), 1, 1, 7, 0))
                .collect(),
            flags: 0,
        }
    }

    #[test]
    fn test_stream_reads_consecutive_containers() {
        let mut wire = Vec::new();
        for texts in [&["a", "b"][..], &["c"][..]] {
            put_frame(&mut wire, 0, &container_of(texts).encode_to_vec());
        }

        let mut input = NmsgInput::stream(Cursor::new(wire));
        assert_eq!(input.read_container().unwrap().payloads.len(), 2);
        assert_eq!(input.read_container().unwrap().payloads.len(), 1);
        assert!(matches!(input.read_container(), Err(Error::Eof)));
    }

    #[test]
    fn test_stream_inflates_zlib_frames() {
        let nmsg = container_of(&["compressed payload"]);
        let body = container::deflate(&nmsg.encode_to_vec()).unwrap();
        let mut wire = Vec::new();
        put_frame(&mut wire, FLAG_ZLIB, &body);

        let mut input = NmsgInput::stream(Cursor::new(wire));
        assert_eq!(input.read_container().unwrap(), nmsg);
    }

    #[test]
    fn test_stream_reassembles_container_fragments() {
        let nmsg = container_of(&[&"x".repeat(5000)]);
        let body = nmsg.encode_to_vec();
        let mut wire = Vec::new();
        let pieces = split_container(&body, 1280, 5);
        let count = pieces.len();
        assert!(count > 1);
        for piece in pieces {
            put_frame(&mut wire, FLAG_FRAGMENT, &piece.encode_to_vec());
        }

        let mut input = NmsgInput::stream(Cursor::new(wire));
        // every piece but the final one yields Again
        for _ in 0..count - 1 {
            assert!(matches!(input.read_container(), Err(Error::Again)));
        }
        assert_eq!(input.read_container().unwrap(), nmsg);
    }

    #[test]
    fn test_stream_truncated_frame_is_eof() {
        let mut wire = Vec::new();
        put_frame(&mut wire, 0, &container_of(&["oops"]).encode_to_vec());
        wire.truncate(wire.len() - 2);
        let mut input = NmsgInput::stream(Cursor::new(wire));
        assert!(matches!(input.read_container(), Err(Error::Eof)));
    }

    #[test]
    fn test_datagram_input_round_trip() {
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let send = UdpSocket::bind("127.0.0.1:0").unwrap();
        send.connect(recv.local_addr().unwrap()).unwrap();

        let nmsg = container_of(&["over udp"]);
        let mut frame = Vec::new();
        put_frame(&mut frame, 0, &nmsg.encode_to_vec());
        send.send(&frame).unwrap();

        let mut input = NmsgInput::datagram(recv);
        assert_eq!(input.read_container().unwrap(), nmsg);
    }

    #[test]
    fn test_datagram_timeout_is_again() {
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut input = NmsgInput::datagram(recv);
        assert!(matches!(input.read_container(), Err(Error::Again)));
    }

    #[test]
    fn test_open_sock_binds() {
        let input = NmsgInput::open_sock("127.0.0.1:0".parse().unwrap()).unwrap();
        match &input.kind {
            InputKind::Datagram { sock, .. } => {
                assert!(sock.local_addr().unwrap().port() != 0);
            }
            InputKind::Stream(_) => panic!("expected datagram input"),
        }
    }

    #[test]
    fn test_pres_input_lines() {
        let text = "first record\nsecond record\n";
        let mut input = PresInput::new(Cursor::new(text.to_owned()), &TextModule);
        assert_eq!(input.vid(), 1);

        let line = input.read_line().unwrap();
        assert_eq!(input.parse_line(&line).unwrap().unwrap(), b"first record");
        let line = input.read_line().unwrap();
        assert_eq!(input.parse_line(&line).unwrap().unwrap(), b"second record");
        assert!(matches!(input.read_line(), Err(Error::Eof)));
    }
}
