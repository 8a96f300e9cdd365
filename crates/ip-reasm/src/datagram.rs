//! IP datagram parsing.
//!
//! Walks the IPv4 header or the IPv6 extension-header chain of a classified
//! frame, locates the transport header, and exposes the application payload.
//! [`DatagramParser`] additionally routes fragments through the reassembler
//! and re-parses completed datagrams, so callers only ever see whole
//! datagrams.

use crate::frame::{classify, IpVersion, LinkType};
use crate::reasm::{IpReassembler, PktTime, SubmitOutcome};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const IPPROTO_HOPOPTS: u8 = 0;
const IPPROTO_ROUTING: u8 = 43;
const IPPROTO_FRAGMENT: u8 = 44;
const IPPROTO_ESP: u8 = 50;
const IPPROTO_AH: u8 = 51;
const IPPROTO_DSTOPTS: u8 = 60;

const IP_MF: u16 = 0x2000;
const IP_OFFMASK: u16 = 0x1fff;
const IP6F_OFF_MASK: u16 = 0xfff8;

/// Why a frame could not be turned into a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The frame is shorter than its headers require, or the capture is
    /// incomplete.
    #[error("frame truncated")]
    Truncated,
    /// A header is internally inconsistent or extends past the captured
    /// length.
    #[error("malformed header")]
    Malformed,
    /// Link type, ether type, or transport protocol outside the supported
    /// set.
    #[error("unsupported protocol")]
    Unsupported,
    /// The frame was a fragment and was consumed; the datagram is not yet
    /// complete.
    #[error("fragmented datagram incomplete")]
    Incomplete,
}

/// A parsed IP datagram, as byte windows into the source frame (or into the
/// reassembly scratch buffer).
#[derive(Debug)]
pub struct Datagram<'a> {
    pub ip_version: IpVersion,
    /// Transport protocol number (e.g. 17 for UDP).
    pub transport_proto: u8,
    /// The packet from the network header onward.
    pub network: &'a [u8],
    /// The packet from the transport header onward. `None` in raw mode for a
    /// non-initial fragment, whose transport header lives in another piece.
    pub transport: Option<&'a [u8]>,
    /// Application payload.
    pub payload: &'a [u8],
}

struct NetHeader {
    transport_proto: u8,
    /// Offset from the network header to the transport header.
    header_end: usize,
    is_fragment: bool,
    is_initial: bool,
}

fn be16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn walk_network(version: IpVersion, pkt: &[u8]) -> Result<NetHeader, ParseError> {
    match version {
        IpVersion::V4 => {
            if pkt.len() < 20 {
                return Err(ParseError::Truncated);
            }
            let header_len = 4 * (pkt[0] & 0x0f) as usize;
            if header_len < 20 || header_len > pkt.len() {
                return Err(ParseError::Malformed);
            }
            let ip_off = be16(pkt, 6);
            Ok(NetHeader {
                transport_proto: pkt[9],
                header_end: header_len,
                is_fragment: ip_off & (IP_MF | IP_OFFMASK) != 0,
                is_initial: ip_off & IP_OFFMASK == 0,
            })
        }
        IpVersion::V6 => {
            if pkt.len() < 40 {
                return Err(ParseError::Truncated);
            }
            if pkt[0] >> 4 != 6 {
                return Err(ParseError::Malformed);
            }

            let mut nexthdr = pkt[6];
            let mut payload_len = be16(pkt, 4) as usize;
            let mut thusfar = 40usize;
            let mut is_fragment = false;
            let mut is_initial = false;

            while matches!(
                nexthdr,
                IPPROTO_ROUTING
                    | IPPROTO_HOPOPTS
                    | IPPROTO_FRAGMENT
                    | IPPROTO_DSTOPTS
                    | IPPROTO_AH
                    | IPPROTO_ESP
            ) {
                if thusfar + 8 > pkt.len() {
                    return Err(ParseError::Malformed);
                }

                if nexthdr == IPPROTO_FRAGMENT {
                    is_fragment = true;
                    if be16(pkt, thusfar + 2) & IP6F_OFF_MASK == 0 {
                        is_initial = true;
                    }
                }

                let ext_len = 8 * (pkt[thusfar + 1] as usize + 1);
                if ext_len > payload_len {
                    return Err(ParseError::Malformed);
                }
                nexthdr = pkt[thusfar];
                thusfar += ext_len;
                payload_len -= ext_len;

                if is_fragment {
                    // the upper-layer protocol came from the Fragment header
                    break;
                }
            }

            if thusfar + payload_len > pkt.len() || payload_len == 0 {
                return Err(ParseError::Malformed);
            }

            Ok(NetHeader {
                transport_proto: nexthdr,
                header_end: thusfar,
                is_fragment,
                is_initial,
            })
        }
    }
}

/// Locate the application payload inside the transport slice. Returns the
/// payload window.
fn parse_transport<'a>(
    proto: u8,
    transport: &'a [u8],
    net_len: usize,
) -> Result<&'a [u8], ParseError> {
    match proto {
        IPPROTO_UDP => {
            if transport.len() < 8 {
                return Err(ParseError::Truncated);
            }
            let udp_len = be16(transport, 4) as usize;
            let declared = udp_len.saturating_sub(8);
            let remaining = transport.len() - 8;
            Ok(&transport[8..8 + declared.min(remaining)])
        }
        IPPROTO_TCP => {
            if transport.len() < 20 {
                return Err(ParseError::Truncated);
            }
            let data_off = 4 * (transport[12] >> 4) as usize;
            if data_off < 20 || data_off > transport.len() {
                return Err(ParseError::Malformed);
            }
            let declared = net_len.saturating_sub(data_off);
            let remaining = transport.len() - data_off;
            Ok(&transport[data_off..data_off + declared.min(remaining)])
        }
        IPPROTO_ICMP => {
            if transport.len() < 8 {
                return Err(ParseError::Truncated);
            }
            Ok(&transport[8..])
        }
        _ => Err(ParseError::Unsupported),
    }
}

/// Parse a network-layer packet into a datagram, discarding fragments.
///
/// Used on whole datagrams: unfragmented traffic and the output of the
/// reassembler.
pub fn parse_datagram(version: IpVersion, pkt: &[u8]) -> Result<Datagram<'_>, ParseError> {
    let hdr = walk_network(version, pkt)?;
    if hdr.is_fragment {
        return Err(ParseError::Incomplete);
    }
    let transport = &pkt[hdr.header_end..];
    let payload = parse_transport(hdr.transport_proto, transport, pkt.len())?;
    Ok(Datagram {
        ip_version: version,
        transport_proto: hdr.transport_proto,
        network: pkt,
        transport: Some(transport),
        payload,
    })
}

/// Parse a link-layer frame without reassembly.
///
/// Fragments are surfaced rather than consumed: the initial fragment of a
/// datagram carries its transport header and is parsed normally; a
/// non-initial fragment has no transport header, so the fragment body is
/// exposed directly as the payload with `transport` set to `None`.
pub fn parse_raw(link: LinkType, frame: &[u8]) -> Result<Datagram<'_>, ParseError> {
    let (version, net_off) = classify(link, frame)?;
    let pkt = &frame[net_off..];
    let hdr = walk_network(version, pkt)?;

    if hdr.is_fragment && !hdr.is_initial {
        return Ok(Datagram {
            ip_version: version,
            transport_proto: hdr.transport_proto,
            network: pkt,
            transport: None,
            payload: &pkt[hdr.header_end..],
        });
    }

    let transport = &pkt[hdr.header_end..];
    let payload = parse_transport(hdr.transport_proto, transport, pkt.len())?;
    Ok(Datagram {
        ip_version: version,
        transport_proto: hdr.transport_proto,
        network: pkt,
        transport: Some(transport),
        payload,
    })
}

/// Frame parser with userspace fragment reassembly.
///
/// Fragmented datagrams are held in the internal [`IpReassembler`]; all but
/// the completing fragment yield [`ParseError::Incomplete`]. A completed
/// datagram is assembled into a scratch buffer and re-parsed, so the
/// returned [`Datagram`] is indistinguishable from an unfragmented one.
pub struct DatagramParser {
    reasm: IpReassembler,
    scratch: Vec<u8>,
}

impl DatagramParser {
    pub fn new(timeout_sec: u64) -> Self {
        Self {
            reasm: IpReassembler::new(timeout_sec),
            scratch: Vec::new(),
        }
    }

    /// Counter access for the embedded reassembler.
    pub fn reassembler(&self) -> &IpReassembler {
        &self.reasm
    }

    /// See [`IpReassembler::set_timeout`].
    pub fn set_timeout(&mut self, timeout_sec: u64) -> bool {
        self.reasm.set_timeout(timeout_sec)
    }

    /// Parse one captured frame.
    ///
    /// `wire_len` is the original on-the-wire length; frames not captured in
    /// full are dropped before parsing.
    pub fn parse<'a>(
        &'a mut self,
        link: LinkType,
        frame: &'a [u8],
        wire_len: usize,
        ts: PktTime,
    ) -> Result<Datagram<'a>, ParseError> {
        if frame.len() != wire_len {
            return Err(ParseError::Truncated);
        }

        let (version, net_off) = classify(link, frame)?;
        let pkt = &frame[net_off..];
        let hdr = walk_network(version, pkt)?;

        if hdr.is_fragment {
            return match self.reasm.submit(pkt, ts) {
                SubmitOutcome::Complete(set) => {
                    self.scratch = set.assemble();
                    parse_datagram(version, &self.scratch)
                }
                SubmitOutcome::Accepted | SubmitOutcome::NotFragment => {
                    Err(ParseError::Incomplete)
                }
            };
        }

        let transport = &pkt[hdr.header_end..];
        let payload = parse_transport(hdr.transport_proto, transport, pkt.len())?;
        Ok(Datagram {
            ip_version: version,
            transport_proto: hdr.transport_proto,
            network: pkt,
            transport: Some(transport),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ETHERTYPE_IP, ETHERTYPE_IPV6};

    fn v4_packet(proto: u8, ip_off: u16, transport: &[u8]) -> Vec<u8> {
        let total = 20 + transport.len();
        let mut p = vec![0u8; total];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        p[6..8].copy_from_slice(&ip_off.to_be_bytes());
        p[8] = 64;
        p[9] = proto;
        p[12..16].copy_from_slice(&[192, 0, 2, 1]);
        p[16..20].copy_from_slice(&[192, 0, 2, 2]);
        p[20..].copy_from_slice(transport);
        p
    }

    fn udp_segment(payload: &[u8]) -> Vec<u8> {
        let mut t = vec![0u8; 8 + payload.len()];
        t[0..2].copy_from_slice(&5300u16.to_be_bytes());
        t[2..4].copy_from_slice(&5300u16.to_be_bytes());
        t[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        t[8..].copy_from_slice(payload);
        t
    }

    fn ether(etype: u16, pkt: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 12];
        f.extend_from_slice(&etype.to_be_bytes());
        f.extend_from_slice(pkt);
        f
    }

    #[test]
    fn test_udp_payload_extraction() {
        let pkt = v4_packet(IPPROTO_UDP, 0, &udp_segment(b"hello nmsg"));
        let frame = ether(ETHERTYPE_IP, &pkt);
        let dg = parse_raw(LinkType::Ethernet, &frame).unwrap();
        assert_eq!(dg.ip_version, IpVersion::V4);
        assert_eq!(dg.transport_proto, IPPROTO_UDP);
        assert_eq!(dg.payload, b"hello nmsg");
    }

    #[test]
    fn test_udp_declared_length_clamped() {
        // UDP length field claims more than the capture holds
        let mut seg = udp_segment(b"abcd");
        seg[4..6].copy_from_slice(&100u16.to_be_bytes());
        let pkt = v4_packet(IPPROTO_UDP, 0, &seg);
        let dg = parse_datagram(IpVersion::V4, &pkt).unwrap();
        assert_eq!(dg.payload, b"abcd");
    }

    #[test]
    fn test_tcp_payload() {
        let mut t = vec![0u8; 20 + 6];
        t[12] = 5 << 4; // 20-byte header
        t[20..].copy_from_slice(b"tcpapp");
        let pkt = v4_packet(IPPROTO_TCP, 0, &t);
        let dg = parse_datagram(IpVersion::V4, &pkt).unwrap();
        assert_eq!(dg.transport_proto, IPPROTO_TCP);
        assert_eq!(dg.payload, b"tcpapp");
    }

    #[test]
    fn test_icmp_payload() {
        let mut t = vec![0u8; 8 + 4];
        t[0] = 8; // echo request
        t[8..].copy_from_slice(b"ping");
        let pkt = v4_packet(IPPROTO_ICMP, 0, &t);
        let dg = parse_datagram(IpVersion::V4, &pkt).unwrap();
        assert_eq!(dg.payload, b"ping");
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let pkt = v4_packet(132, 0, &[0u8; 16]); // SCTP
        assert_eq!(
            parse_datagram(IpVersion::V4, &pkt).unwrap_err(),
            ParseError::Unsupported
        );
    }

    #[test]
    fn test_short_ipv4_header_rejected() {
        let mut pkt = v4_packet(IPPROTO_UDP, 0, &udp_segment(b"x"));
        pkt[0] = 0x43; // ihl = 3 words
        assert_eq!(
            parse_datagram(IpVersion::V4, &pkt).unwrap_err(),
            ParseError::Malformed
        );
    }

    #[test]
    fn test_fragment_discarded_without_reasm() {
        let pkt = v4_packet(IPPROTO_UDP, 0x2000, &udp_segment(b"frag"));
        assert_eq!(
            parse_datagram(IpVersion::V4, &pkt).unwrap_err(),
            ParseError::Incomplete
        );
    }

    #[test]
    fn test_raw_mode_initial_fragment_has_transport() {
        let pkt = v4_packet(IPPROTO_UDP, 0x2000, &udp_segment(b"headpiece"));
        let frame = ether(ETHERTYPE_IP, &pkt);
        let dg = parse_raw(LinkType::Ethernet, &frame).unwrap();
        assert!(dg.transport.is_some());
        assert_eq!(dg.payload, b"headpiece");
    }

    #[test]
    fn test_raw_mode_tail_fragment_exposes_body() {
        // offset 8 units: a continuation fragment with no transport header
        let body = [0x5au8; 24];
        let pkt = v4_packet(IPPROTO_UDP, 0x2000 | 8, &body);
        let frame = ether(ETHERTYPE_IP, &pkt);
        let dg = parse_raw(LinkType::Ethernet, &frame).unwrap();
        assert!(dg.transport.is_none());
        assert_eq!(dg.payload, &body[..]);
    }

    #[test]
    fn test_ipv6_hop_by_hop_to_udp() {
        let seg = udp_segment(b"six");
        let plen = 8 + seg.len();
        let mut pkt = vec![0u8; 40 + plen];
        pkt[0] = 0x60;
        pkt[4..6].copy_from_slice(&(plen as u16).to_be_bytes());
        pkt[6] = 0; // hop-by-hop
        pkt[40] = IPPROTO_UDP;
        pkt[41] = 0; // 8-byte option header
        pkt[48..].copy_from_slice(&seg);
        let frame = ether(ETHERTYPE_IPV6, &pkt);
        let dg = parse_raw(LinkType::Ethernet, &frame).unwrap();
        assert_eq!(dg.ip_version, IpVersion::V6);
        assert_eq!(dg.transport_proto, IPPROTO_UDP);
        assert_eq!(dg.payload, b"six");
    }

    #[test]
    fn test_ipv6_bad_version_rejected() {
        let mut pkt = vec![0u8; 48];
        pkt[0] = 0x40;
        assert_eq!(
            walk_err(&pkt),
            ParseError::Malformed
        );
    }

    fn walk_err(pkt: &[u8]) -> ParseError {
        parse_datagram(IpVersion::V6, pkt).unwrap_err()
    }

    #[test]
    fn test_ipv6_ext_header_overruns_capture() {
        let mut pkt = vec![0u8; 44];
        pkt[0] = 0x60;
        pkt[4..6].copy_from_slice(&4u16.to_be_bytes());
        pkt[6] = 0; // hop-by-hop, but only 4 bytes of it captured
        assert_eq!(walk_err(&pkt), ParseError::Malformed);
    }

    #[test]
    fn test_parser_reassembles_fragments() {
        let mut parser = DatagramParser::new(60);

        let full_udp = udp_segment(&[0x77; 64]);
        // split the 72-byte UDP segment at 40 bytes (a multiple of 8)
        let frag1 = {
            let mut p = v4_packet(IPPROTO_UDP, 0x2000, &full_udp[..40]);
            p[4..6].copy_from_slice(&42u16.to_be_bytes());
            p
        };
        let frag2 = {
            let mut p = v4_packet(IPPROTO_UDP, 5, &full_udp[40..]);
            p[4..6].copy_from_slice(&42u16.to_be_bytes());
            p
        };

        let f1 = ether(ETHERTYPE_IP, &frag1);
        let wire1 = f1.len();
        assert_eq!(
            parser
                .parse(LinkType::Ethernet, &f1, wire1, PktTime::new(1, 0))
                .unwrap_err(),
            ParseError::Incomplete
        );

        let f2 = ether(ETHERTYPE_IP, &frag2);
        let wire2 = f2.len();
        let dg = parser
            .parse(LinkType::Ethernet, &f2, wire2, PktTime::new(1, 0))
            .unwrap();
        assert_eq!(dg.transport_proto, IPPROTO_UDP);
        assert_eq!(dg.payload, &[0x77; 64][..]);
    }

    #[test]
    fn test_parser_drops_incomplete_captures() {
        let pkt = v4_packet(IPPROTO_UDP, 0, &udp_segment(b"snap"));
        let frame = ether(ETHERTYPE_IP, &pkt);
        let mut parser = DatagramParser::new(60);
        assert_eq!(
            parser
                .parse(LinkType::Ethernet, &frame, frame.len() + 40, PktTime::new(1, 0))
                .unwrap_err(),
            ParseError::Truncated
        );
    }
}
