//! Link-layer frame classification.
//!
//! Strips the link header, skips over an 802.1Q VLAN tag if present, and
//! reports which IP version follows and at what byte offset. Only Ethernet,
//! Linux cooked capture, and raw-IP link types are recognized; everything
//! else is dropped by the caller.

use crate::datagram::ParseError;

pub const ETHERTYPE_IP: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

// Ethernet header: dst MAC (6) + src MAC (6) + ethertype (2).
const ETHER_HDR_LEN: usize = 14;
// Linux cooked (SLL) header: 14 bytes of pseudo-header + 2 bytes ethertype.
const SLL_HDR_LEN: usize = 16;

/// Link-layer framing of a captured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// DLT_EN10MB
    Ethernet,
    /// DLT_RAW — frame starts directly at the IP header.
    Raw,
    /// DLT_LINUX_SLL ("any" interface cooked capture).
    LinuxSll,
}

/// IP version of the network header following the link header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

fn be16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn version_of(etype: u16) -> Result<IpVersion, ParseError> {
    match etype {
        ETHERTYPE_IP => Ok(IpVersion::V4),
        ETHERTYPE_IPV6 => Ok(IpVersion::V6),
        _ => Err(ParseError::Unsupported),
    }
}

/// Classify a frame's link header.
///
/// Returns the IP version of the enclosed packet and the byte offset where
/// the network header begins.
pub fn classify(link: LinkType, frame: &[u8]) -> Result<(IpVersion, usize), ParseError> {
    match link {
        LinkType::Ethernet => {
            if frame.len() < ETHER_HDR_LEN {
                return Err(ParseError::Truncated);
            }
            let etype = be16(frame, 12);
            if etype == ETHERTYPE_VLAN {
                // 802.1Q: 2 bytes TCI, then the inner ethertype.
                if frame.len() < ETHER_HDR_LEN + 4 {
                    return Err(ParseError::Truncated);
                }
                let inner = be16(frame, ETHER_HDR_LEN + 2);
                Ok((version_of(inner)?, ETHER_HDR_LEN + 4))
            } else {
                Ok((version_of(etype)?, ETHER_HDR_LEN))
            }
        }
        LinkType::Raw => {
            let first = *frame.first().ok_or(ParseError::Truncated)?;
            match first >> 4 {
                4 => Ok((IpVersion::V4, 0)),
                6 => Ok((IpVersion::V6, 0)),
                _ => Err(ParseError::Unsupported),
            }
        }
        LinkType::LinuxSll => {
            if frame.len() < SLL_HDR_LEN {
                return Err(ParseError::Truncated);
            }
            let etype = be16(frame, SLL_HDR_LEN - 2);
            Ok((version_of(etype)?, SLL_HDR_LEN))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ether_frame(etype: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 12];
        f.extend_from_slice(&etype.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn test_ethernet_ipv4() {
        let frame = ether_frame(ETHERTYPE_IP, &[0x45, 0x00]);
        assert_eq!(classify(LinkType::Ethernet, &frame).unwrap(), (IpVersion::V4, 14));
    }

    #[test]
    fn test_ethernet_ipv6() {
        let frame = ether_frame(ETHERTYPE_IPV6, &[0x60, 0x00]);
        assert_eq!(classify(LinkType::Ethernet, &frame).unwrap(), (IpVersion::V6, 14));
    }

    #[test]
    fn test_ethernet_vlan_tag() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x64]); // TCI, VLAN 100
        frame.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());
        frame.extend_from_slice(&[0x45, 0x00]);
        assert_eq!(classify(LinkType::Ethernet, &frame).unwrap(), (IpVersion::V4, 18));
    }

    #[test]
    fn test_ethernet_truncated() {
        assert_eq!(
            classify(LinkType::Ethernet, &[0u8; 13]).unwrap_err(),
            ParseError::Truncated
        );
        // VLAN tag present but inner ethertype missing
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x64]);
        assert_eq!(
            classify(LinkType::Ethernet, &frame).unwrap_err(),
            ParseError::Truncated
        );
    }

    #[test]
    fn test_ethernet_unknown_etype() {
        let frame = ether_frame(0x0806, &[0u8; 28]); // ARP
        assert_eq!(
            classify(LinkType::Ethernet, &frame).unwrap_err(),
            ParseError::Unsupported
        );
    }

    #[test]
    fn test_raw_nibble_probe() {
        assert_eq!(classify(LinkType::Raw, &[0x45]).unwrap(), (IpVersion::V4, 0));
        assert_eq!(classify(LinkType::Raw, &[0x60]).unwrap(), (IpVersion::V6, 0));
        assert_eq!(classify(LinkType::Raw, &[0x35]).unwrap_err(), ParseError::Unsupported);
        assert_eq!(classify(LinkType::Raw, &[]).unwrap_err(), ParseError::Truncated);
    }

    #[test]
    fn test_linux_cooked() {
        let mut frame = vec![0u8; 14];
        frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        frame.push(0x60);
        assert_eq!(classify(LinkType::LinuxSll, &frame).unwrap(), (IpVersion::V6, 16));
        assert_eq!(
            classify(LinkType::LinuxSll, &frame[..15]).unwrap_err(),
            ParseError::Truncated
        );
    }
}
