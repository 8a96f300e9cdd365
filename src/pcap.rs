//! Offline packet-file frame source.
//!
//! Reads frames from a pcap file, runs them through the reassembling
//! datagram parser, and yields application payloads with their capture
//! timestamps. Snap-truncated frames, non-IP traffic, and fragments whose
//! siblings have not arrived yet are skipped.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use ip_reasm::{DatagramParser, IpReassembler, LinkType, ParseError, PktTime};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;

use crate::error::{Error, Result};

/// Default fragment timeout for offline reads, seconds.
const PCAP_REASM_TIMEOUT: u64 = 60;

/// An application-payload iterator over a pcap capture.
pub struct PcapFileSource<R: Read> {
    reader: PcapReader<R>,
    link: LinkType,
    parser: DatagramParser,
}

impl PcapFileSource<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: Read> PcapFileSource<R> {
    pub fn from_reader(r: R) -> Result<Self> {
        let reader = PcapReader::new(r).map_err(|e| Error::Malformed(e.to_string()))?;
        let link = match reader.header().datalink {
            DataLink::ETHERNET => LinkType::Ethernet,
            DataLink::LINUX_SLL => LinkType::LinuxSll,
            DataLink::RAW => LinkType::Raw,
            other => {
                return Err(Error::Failure(format!(
                    "unsupported pcap datalink {other:?}"
                )))
            }
        };
        Ok(Self {
            reader,
            link,
            parser: DatagramParser::new(PCAP_REASM_TIMEOUT),
        })
    }

    pub fn link_type(&self) -> LinkType {
        self.link
    }

    /// Counter access for the embedded reassembler.
    pub fn reassembler(&self) -> &IpReassembler {
        self.parser.reassembler()
    }

    /// See [`IpReassembler::set_timeout`].
    pub fn set_timeout(&mut self, timeout_sec: u64) -> bool {
        self.parser.set_timeout(timeout_sec)
    }

    /// The next application payload and its capture timestamp, or `None` at
    /// the end of the file.
    pub fn next_payload(&mut self) -> Result<Option<(Vec<u8>, PktTime)>> {
        loop {
            let (frame, wire_len, ts) = match self.reader.next_packet() {
                None => return Ok(None),
                Some(Err(e)) => return Err(Error::Malformed(e.to_string())),
                Some(Ok(pkt)) => (
                    pkt.data.into_owned(),
                    pkt.orig_len as usize,
                    PktTime::new(pkt.timestamp.as_secs(), pkt.timestamp.subsec_nanos()),
                ),
            };

            match self.parser.parse(self.link, &frame, wire_len, ts) {
                Ok(dg) => return Ok(Some((dg.payload.to_vec(), ts))),
                Err(ParseError::Incomplete) => continue,
                Err(e) => {
                    tracing::trace!(error = %e, "frame skipped");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
    use pcap_file::{Endianness, TsResolution};
    use std::time::Duration;

    fn ns_header() -> PcapHeader {
        PcapHeader {
            version_major: 2,
            version_minor: 4,
            ts_correction: 0,
            ts_accuracy: 0,
            snaplen: 65535,
            datalink: DataLink::ETHERNET,
            ts_resolution: TsResolution::NanoSecond,
            endianness: Endianness::native(),
        }
    }

    /// Ethernet + IPv4 + UDP frame around `payload`.
    fn udp_frame(ip_off: u16, transport: &[u8]) -> Vec<u8> {
        let total = 20 + transport.len();
        let mut ip = vec![0u8; total];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        ip[4..6].copy_from_slice(&7u16.to_be_bytes());
        ip[6..8].copy_from_slice(&ip_off.to_be_bytes());
        ip[8] = 64;
        ip[9] = 17;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
        ip[20..].copy_from_slice(transport);

        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&ip);
        frame
    }

    fn udp_segment(payload: &[u8]) -> Vec<u8> {
        let mut t = vec![0u8; 8 + payload.len()];
        t[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        t[8..].copy_from_slice(payload);
        t
    }

    fn write_capture(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut writer = PcapWriter::with_header(Vec::new(), ns_header()).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            let pkt = PcapPacket::new(Duration::from_secs(i as u64), frame.len() as u32, frame);
            writer.write_packet(&pkt).unwrap();
        }
        writer.into_writer()
    }

    #[test]
    fn test_reads_udp_payloads() {
        let capture = write_capture(&[
            udp_frame(0, &udp_segment(b"first")),
            udp_frame(0, &udp_segment(b"second")),
        ]);

        let mut source = PcapFileSource::from_reader(capture.as_slice()).unwrap();
        assert_eq!(source.link_type(), LinkType::Ethernet);

        let (payload, ts) = source.next_payload().unwrap().unwrap();
        assert_eq!(payload, b"first");
        assert_eq!(ts.sec, 0);
        let (payload, ts) = source.next_payload().unwrap().unwrap();
        assert_eq!(payload, b"second");
        assert_eq!(ts.sec, 1);
        assert!(source.next_payload().unwrap().is_none());
    }

    #[test]
    fn test_reassembles_fragmented_datagram() {
        let seg = udp_segment(&[0x66; 56]); // 64 bytes of UDP, split at 40
        let capture = write_capture(&[
            udp_frame(0x2000, &seg[..40]),
            udp_frame(5, &seg[40..]),
        ]);

        let mut source = PcapFileSource::from_reader(capture.as_slice()).unwrap();
        let (payload, _) = source.next_payload().unwrap().unwrap();
        assert_eq!(payload, vec![0x66; 56]);
        assert!(source.next_payload().unwrap().is_none());
        assert_eq!(source.reassembler().waiting(), 0);
    }

    #[test]
    fn test_skips_non_ip_frames() {
        let mut arp = vec![0u8; 12];
        arp.extend_from_slice(&0x0806u16.to_be_bytes());
        arp.extend_from_slice(&[0u8; 28]);

        let capture = write_capture(&[arp, udp_frame(0, &udp_segment(b"kept"))]);
        let mut source = PcapFileSource::from_reader(capture.as_slice()).unwrap();
        let (payload, _) = source.next_payload().unwrap().unwrap();
        assert_eq!(payload, b"kept");
    }
}
