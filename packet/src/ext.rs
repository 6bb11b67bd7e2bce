//! IPv6 extension-header chain traversal.
//!
//! The translator needs three things from the chain: where the upper layer
//! starts, the fragment header (if any), and the location of a routing
//! header's Segments Left field. Everything else is skipped over; headers
//! without an IPv4 equivalent have no bearing on the rewrite.

use anyhow::{Context as _, Result, ensure};
use etherparse::IpNumber;

use crate::fragment::{FRAGMENT_HEADER_LEN, FragmentHeader};

/// Result of walking an IPv6 extension-header chain once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtChain {
    /// Offset of the upper-layer header from the start of the packet.
    pub l4_offset: usize,
    /// The first next-header value that is not an extension header.
    pub l4_protocol: IpNumber,
    /// Fragment header and its offset within the packet.
    pub fragment: Option<(usize, FragmentHeader)>,
    /// Byte offset of the first routing header's Segments Left field
    /// (relative to the start of the packet), with the field's value.
    pub segments_left: Option<(usize, u8)>,
}

impl ExtChain {
    /// Walks the chain of `buf`, a full IPv6 packet. `first` is the fixed
    /// header's Next Header value.
    pub fn walk(buf: &[u8], first: IpNumber) -> Result<Self> {
        let mut offset = 40;
        let mut protocol = first;
        let mut fragment = None;
        let mut segments_left = None;

        // RFC 8200 allows each extension header at most once (destination
        // options twice); chains longer than that are garbage.
        for _ in 0..8 {
            match protocol {
                IpNumber::IPV6_HEADER_HOP_BY_HOP
                | IpNumber::IPV6_ROUTE_HEADER
                | IpNumber::IPV6_DESTINATION_OPTIONS => {
                    let hdr = buf
                        .get(offset..offset + 2)
                        .context("Extension header is cut short")?;

                    if protocol == IpNumber::IPV6_ROUTE_HEADER && segments_left.is_none() {
                        let value = *buf
                            .get(offset + 3)
                            .context("Routing header is cut short")?;
                        segments_left = Some((offset + 3, value));
                    }

                    protocol = IpNumber(hdr[0]);
                    offset += (usize::from(hdr[1]) + 1) * 8;
                }
                IpNumber::IPV6_FRAGMENTATION_HEADER => {
                    let parsed = buf
                        .get(offset..)
                        .and_then(FragmentHeader::parse)
                        .context("Fragment header is cut short")?;

                    ensure!(fragment.is_none(), "Duplicate fragment header");

                    fragment = Some((offset, parsed));
                    protocol = parsed.next_header;
                    offset += FRAGMENT_HEADER_LEN;
                }
                upper => {
                    ensure!(offset <= buf.len(), "Extension chain exceeds packet");

                    return Ok(Self {
                        l4_offset: offset,
                        l4_protocol: upper,
                        fragment,
                        segments_left,
                    });
                }
            }
        }

        anyhow::bail!("Extension-header chain is too long")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v6_header(next: u8, payload_len: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 40];
        buf[0] = 0x60;
        buf[4..6].copy_from_slice(&payload_len.to_be_bytes());
        buf[6] = next;
        buf
    }

    #[test]
    fn plain_udp_has_no_extensions() {
        let mut buf = v6_header(17, 8);
        buf.extend_from_slice(&[0u8; 8]);

        let chain = ExtChain::walk(&buf, IpNumber::UDP).unwrap();

        assert_eq!(chain.l4_offset, 40);
        assert_eq!(chain.l4_protocol, IpNumber::UDP);
        assert_eq!(chain.fragment, None);
        assert_eq!(chain.segments_left, None);
    }

    #[test]
    fn fragment_header_is_found() {
        let frag = FragmentHeader::new(IpNumber::UDP, 0, true, 9);
        let mut buf = v6_header(44, 16);
        buf.extend_from_slice(&frag.to_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let chain = ExtChain::walk(&buf, IpNumber::IPV6_FRAGMENTATION_HEADER).unwrap();

        assert_eq!(chain.l4_offset, 48);
        assert_eq!(chain.l4_protocol, IpNumber::UDP);
        assert_eq!(chain.fragment, Some((40, frag)));
    }

    #[test]
    fn routing_header_segments_left_location() {
        let mut buf = v6_header(43, 16);
        // Type 0 routing header, one 8-byte unit of data, segments left 3.
        buf.extend_from_slice(&[17, 1, 0, 3, 0, 0, 0, 0]);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&[0u8; 8]);

        let chain = ExtChain::walk(&buf, IpNumber::IPV6_ROUTE_HEADER).unwrap();

        assert_eq!(chain.segments_left, Some((43, 3)));
        assert_eq!(chain.l4_offset, 56);
        assert_eq!(chain.l4_protocol, IpNumber::UDP);
    }

    #[test]
    fn truncated_chain_is_an_error() {
        let buf = v6_header(0, 0);
        assert!(ExtChain::walk(&buf, IpNumber::IPV6_HEADER_HOP_BY_HOP).is_err());
    }
}
