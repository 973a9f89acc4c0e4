//! Packet classifier
//!
//! Single pass over an Ethernet/IPv4/TCP|UDP frame. Anything too short or
//! not matching the filter is left unrecorded, and the XDP program always
//! passes the packet on. Records go to two stores:
//!
//! * the per-packet store, keyed by a unique counter value so every packet
//!   gets its own slot;
//! * the XID store, keyed by the RPC transaction id of NFSv4 COMPOUND calls,
//!   where packets of the same exchange accumulate their payload size.

use crate::constants::*;
use crate::pairing::Outcome;
use crate::store::CorrelationStore;
use crate::types::{PacketFilter, PacketRecord, PacketStats};

/// Bounds-checked big-endian reads from a frame
pub trait PacketBytes {
    /// Bytes available to the classifier
    fn byte_len(&self) -> usize;

    fn u8_at(&self, offset: usize) -> Option<u8>;

    fn be16_at(&self, offset: usize) -> Option<u16>;

    fn be32_at(&self, offset: usize) -> Option<u32>;
}

impl PacketBytes for [u8] {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn u8_at(&self, offset: usize) -> Option<u8> {
        self.get(offset).copied()
    }

    fn be16_at(&self, offset: usize) -> Option<u16> {
        let b = self.get(offset..offset.checked_add(2)?)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    fn be32_at(&self, offset: usize) -> Option<u32> {
        let b = self.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Source of unique per-packet keys
pub trait PacketCounter {
    fn next_key(&self) -> u32;
}

impl PacketCounter for core::sync::atomic::AtomicU32 {
    #[inline(always)]
    fn next_key(&self) -> u32 {
        self.fetch_add(1, core::sync::atomic::Ordering::Relaxed)
    }
}

/// What the classifier learned about one frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Classified {
    /// Frame length as seen on the wire
    pub wire_len: u64,
    /// IPv4 protocol, 0 when the frame is not IPv4
    pub protocol: u8,
    /// Either transport port is the NFS port
    pub is_nfs: bool,
    /// Present when the frame parsed and passed the filter
    pub record: Option<PacketRecord>,
}

// ============================================================================
// Filters
// ============================================================================

/// The configured addresses form an allow-list; an empty list matches all
#[inline(always)]
pub fn ip_matches(filter: &PacketFilter, src_ip: u32, dst_ip: u32) -> bool {
    if filter.src_ip == 0 && filter.dst_ip == 0 {
        return true;
    }
    let listed = |ip: u32| ip != 0 && (ip == filter.src_ip || ip == filter.dst_ip);
    listed(src_ip) || listed(dst_ip)
}

/// Either packet port equal to a configured port, or to the NFS port
#[inline(always)]
pub fn port_matches(filter: &PacketFilter, src_port: u16, dst_port: u16) -> bool {
    if filter.src_port == 0 && filter.dst_port == 0 {
        return true;
    }
    let listed = |port: u16| port != 0 && (port == filter.src_port || port == filter.dst_port);
    listed(src_port) || listed(dst_port) || src_port == NFS_PORT || dst_port == NFS_PORT
}

#[inline(always)]
pub fn protocol_matches(filter: &PacketFilter, protocol: u8) -> bool {
    filter.protocol == 0 || filter.protocol == protocol
}

// ============================================================================
// Classification
// ============================================================================

/// RPC call header layout for one transport
#[derive(Clone, Copy)]
struct RpcLayout {
    /// Bytes before the xid (record marker on streams)
    mark: usize,
    header_len: usize,
}

const TCP_RPC: RpcLayout = RpcLayout {
    mark: RPC_RECORD_MARK_LEN,
    header_len: RPC_CALL_HEADER_LEN,
};

const UDP_RPC: RpcLayout = RpcLayout {
    mark: 0,
    header_len: RPC_CALL_HEADER_LEN - RPC_RECORD_MARK_LEN,
};

/// Parse a frame and apply `filter`
pub fn classify<P: PacketBytes + ?Sized>(pkt: &P, filter: &PacketFilter, now: u64) -> Classified {
    let mut out = Classified {
        wire_len: pkt.byte_len() as u64,
        ..Default::default()
    };

    if pkt.byte_len() < ETH_HLEN + IP_HLEN {
        return out;
    }
    match pkt.be16_at(12) {
        Some(ETH_P_IP) => {}
        _ => return out,
    }

    let ip = ETH_HLEN;
    let (Some(ver_ihl), Some(total_len), Some(protocol), Some(src_ip), Some(dst_ip)) = (
        pkt.u8_at(ip),
        pkt.be16_at(ip + 2),
        pkt.u8_at(ip + 9),
        pkt.be32_at(ip + 12),
        pkt.be32_at(ip + 16),
    ) else {
        return out;
    };
    out.protocol = protocol;

    let ip_hlen = ((ver_ihl & 0x0f) as usize) * 4;
    if ip_hlen < IP_HLEN {
        return out;
    }
    let l4 = ip + ip_hlen;

    let (src_port, dst_port, payload_off, payload_len, layout) = match protocol {
        IPPROTO_TCP => {
            if pkt.byte_len() < l4 + TCP_HLEN {
                return out;
            }
            let (Some(sport), Some(dport), Some(doff)) =
                (pkt.be16_at(l4), pkt.be16_at(l4 + 2), pkt.u8_at(l4 + 12))
            else {
                return out;
            };
            let tcp_hlen = ((doff >> 4) as usize) * 4;
            out.is_nfs = sport == NFS_PORT || dport == NFS_PORT;
            if tcp_hlen < TCP_HLEN {
                return out;
            }
            let len = (total_len as usize).saturating_sub(ip_hlen + tcp_hlen);
            (sport, dport, l4 + tcp_hlen, len, TCP_RPC)
        }
        IPPROTO_UDP => {
            if pkt.byte_len() < l4 + UDP_HLEN {
                return out;
            }
            let (Some(sport), Some(dport), Some(udp_len)) =
                (pkt.be16_at(l4), pkt.be16_at(l4 + 2), pkt.be16_at(l4 + 4))
            else {
                return out;
            };
            out.is_nfs = sport == NFS_PORT || dport == NFS_PORT;
            let len = (udp_len as usize).saturating_sub(UDP_HLEN);
            (sport, dport, l4 + UDP_HLEN, len, UDP_RPC)
        }
        _ => return out,
    };

    if !ip_matches(filter, src_ip, dst_ip)
        || !protocol_matches(filter, protocol)
        || !port_matches(filter, src_port, dst_port)
    {
        return out;
    }

    let mut record = PacketRecord {
        timestamp: now,
        data_size: payload_len as u64,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        ..Default::default()
    };

    if payload_len >= layout.header_len && pkt.byte_len() >= payload_off + layout.header_len {
        let hdr = payload_off + layout.mark;
        if let Some(xid) = pkt.be32_at(hdr) {
            record.xid = xid;
        }
        record.nfs_compound = is_compound_call(pkt, hdr) as u8;
    }

    out.record = Some(record);
    out
}

/// Check message type, program, version and procedure after the xid at `hdr`
fn is_compound_call<P: PacketBytes + ?Sized>(pkt: &P, hdr: usize) -> bool {
    // xid, msg_type, rpcvers, prog, vers, proc
    let (Some(msg_type), Some(prog), Some(vers), Some(proc_)) = (
        pkt.be32_at(hdr + 4),
        pkt.be32_at(hdr + 12),
        pkt.be32_at(hdr + 16),
        pkt.be32_at(hdr + 20),
    ) else {
        return false;
    };
    msg_type == RPC_MSG_CALL && prog == RPC_PROG_NFS && vers == NFS_VERSION_4 && proc_ == NFS_PROC_COMPOUND
}

// ============================================================================
// Accounting and Recording
// ============================================================================

/// Update the running counters; independent of the filter outcome
#[inline(always)]
pub fn account(stats: &mut PacketStats, c: &Classified) {
    stats.total_packets += 1;
    stats.total_bytes += c.wire_len;
    match c.protocol {
        IPPROTO_TCP => stats.tcp_packets += 1,
        IPPROTO_UDP => stats.udp_packets += 1,
        _ => {}
    }
    if c.is_nfs {
        stats.nfs_packets += 1;
        stats.nfs_bytes += c.wire_len;
    }
}

/// Store the record of a classified frame
///
/// Every record gets a per-packet slot. COMPOUND calls with a non-zero
/// transaction id are also aggregated by xid.
pub fn record<C, S, X>(c: &Classified, counter: &C, packets: &mut S, xids: &mut X) -> Outcome
where
    C: PacketCounter + ?Sized,
    S: CorrelationStore<u32, PacketRecord>,
    X: CorrelationStore<u32, PacketRecord>,
{
    let Some(rec) = c.record else {
        return Outcome::Filtered;
    };

    let key = counter.next_key();
    if let Err(e) = packets.put(&key, &rec) {
        return e.into();
    }

    if rec.nfs_compound != 0 && rec.xid != 0 {
        let merged = xids.update(&rec.xid, |agg| {
            agg.data_size += rec.data_size;
            agg.src_ip = rec.src_ip;
            agg.dst_ip = rec.dst_ip;
            agg.src_port = rec.src_port;
            agg.dst_port = rec.dst_port;
            agg.protocol = rec.protocol;
        });
        if merged.is_none() {
            if let Err(e) = xids.put(&rec.xid, &rec) {
                return e.into();
            }
        }
    }
    Outcome::Recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FixedMap, Slot};
    use core::sync::atomic::AtomicU32;
    use std::vec::Vec;

    const CLIENT: u32 = 0x0a00_0001;
    const SERVER: u32 = 0x0a00_0002;

    fn frame(protocol: u8, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let l4_len = if protocol == IPPROTO_TCP { TCP_HLEN } else { UDP_HLEN };
        let mut f = Vec::new();
        f.extend_from_slice(&[0u8; 12]);
        f.extend_from_slice(&ETH_P_IP.to_be_bytes());
        let total = (IP_HLEN + l4_len + payload.len()) as u16;
        f.push(0x45);
        f.push(0);
        f.extend_from_slice(&total.to_be_bytes());
        f.extend_from_slice(&[0, 0, 0, 0, 64, protocol, 0, 0]);
        f.extend_from_slice(&CLIENT.to_be_bytes());
        f.extend_from_slice(&SERVER.to_be_bytes());
        f.extend_from_slice(&sport.to_be_bytes());
        f.extend_from_slice(&dport.to_be_bytes());
        if protocol == IPPROTO_TCP {
            f.extend_from_slice(&[0u8; 8]);
            f.push(5 << 4);
            f.extend_from_slice(&[0u8; 7]);
        } else {
            f.extend_from_slice(&((UDP_HLEN + payload.len()) as u16).to_be_bytes());
            f.extend_from_slice(&[0, 0]);
        }
        f.extend_from_slice(payload);
        f
    }

    fn rpc_call(xid: u32, with_mark: bool, prog: u32, vers: u32, proc_: u32) -> Vec<u8> {
        let mut p = Vec::new();
        if with_mark {
            p.extend_from_slice(&0x8000_0100u32.to_be_bytes());
        }
        for word in [xid, RPC_MSG_CALL, 2, prog, vers, proc_, 1, 0] {
            p.extend_from_slice(&word.to_be_bytes());
        }
        p
    }

    fn nfs_filter() -> PacketFilter {
        PacketFilter {
            src_port: NFS_PORT,
            dst_port: NFS_PORT,
            ..Default::default()
        }
    }

    #[test]
    fn test_tcp_compound_call() {
        let payload = rpc_call(0xdead_beef, true, RPC_PROG_NFS, 4, 1);
        let pkt = frame(IPPROTO_TCP, 900, NFS_PORT, &payload);
        let c = classify(pkt.as_slice(), &nfs_filter(), 77);

        assert!(c.is_nfs);
        assert_eq!(c.protocol, IPPROTO_TCP);
        let rec = c.record.unwrap();
        assert_eq!(rec.xid, 0xdead_beef);
        assert_eq!(rec.nfs_compound, 1);
        assert_eq!(rec.data_size, RPC_CALL_HEADER_LEN as u64);
        assert_eq!(rec.src_ip, CLIENT);
        assert_eq!(rec.dst_port, NFS_PORT);
        assert_eq!(rec.timestamp, 77);
    }

    #[test]
    fn test_short_tcp_payload_has_no_xid() {
        let payload = rpc_call(0x1234, true, RPC_PROG_NFS, 4, 1);
        let pkt = frame(IPPROTO_TCP, 900, NFS_PORT, &payload[..RPC_CALL_HEADER_LEN - 1]);
        let rec = classify(pkt.as_slice(), &nfs_filter(), 0).record.unwrap();
        assert_eq!(rec.xid, 0);
        assert_eq!(rec.nfs_compound, 0);
        assert_eq!(rec.data_size, (RPC_CALL_HEADER_LEN - 1) as u64);
    }

    #[test]
    fn test_non_compound_call_is_recorded_without_flag() {
        let payload = rpc_call(0x55, true, RPC_PROG_NFS, 3, 6);
        let pkt = frame(IPPROTO_TCP, 900, NFS_PORT, &payload);
        let rec = classify(pkt.as_slice(), &nfs_filter(), 0).record.unwrap();
        assert_eq!(rec.xid, 0x55);
        assert_eq!(rec.nfs_compound, 0);
    }

    #[test]
    fn test_udp_xid_has_no_record_marker() {
        let payload = rpc_call(0x77, false, RPC_PROG_NFS, 4, 1);
        let pkt = frame(IPPROTO_UDP, NFS_PORT, 700, &payload);
        let rec = classify(pkt.as_slice(), &nfs_filter(), 0).record.unwrap();
        assert_eq!(rec.xid, 0x77);
        assert_eq!(rec.nfs_compound, 1);
        assert_eq!(rec.protocol, IPPROTO_UDP);
    }

    #[test]
    fn test_truncated_and_foreign_frames_pass_unrecorded() {
        let filter = PacketFilter::default();
        let short = [0u8; 20];
        let c = classify(&short[..], &filter, 0);
        assert_eq!(c.record, None);
        assert_eq!(c.wire_len, 20);

        let mut arp = frame(IPPROTO_TCP, 1, 2, &[]);
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert_eq!(classify(arp.as_slice(), &filter, 0).record, None);

        let mut icmp = frame(IPPROTO_UDP, 1, 2, &[]);
        icmp[ETH_HLEN + 9] = 1;
        let c = classify(icmp.as_slice(), &filter, 0);
        assert_eq!(c.record, None);
        assert_eq!(c.protocol, 1);

        let tcp = frame(IPPROTO_TCP, 1, 2, &[]);
        let cut = &tcp[..ETH_HLEN + IP_HLEN + 10];
        assert_eq!(classify(cut, &filter, 0).record, None);
    }

    #[test]
    fn test_unset_port_filter_matches_everything() {
        let filter = PacketFilter::default();
        assert!(port_matches(&filter, 1, 2));
        assert!(port_matches(&filter, 0, 0));
    }

    #[test]
    fn test_port_filter_rules() {
        let filter = PacketFilter {
            src_port: 111,
            ..Default::default()
        };
        assert!(port_matches(&filter, 111, 5));
        assert!(port_matches(&filter, 5, 111));
        assert!(port_matches(&filter, 5, NFS_PORT));
        assert!(port_matches(&filter, NFS_PORT, 5));
        assert!(!port_matches(&filter, 5, 6));
    }

    #[test]
    fn test_ip_and_protocol_filters() {
        let filter = PacketFilter {
            dst_ip: SERVER,
            protocol: IPPROTO_UDP,
            ..Default::default()
        };
        assert!(ip_matches(&filter, SERVER, 1));
        assert!(ip_matches(&filter, 1, SERVER));
        assert!(!ip_matches(&filter, 1, 2));
        assert!(protocol_matches(&filter, IPPROTO_UDP));
        assert!(!protocol_matches(&filter, IPPROTO_TCP));

        let pkt = frame(IPPROTO_TCP, 900, NFS_PORT, &[]);
        assert_eq!(classify(pkt.as_slice(), &filter, 0).record, None);
    }

    #[test]
    fn test_accounting_ignores_filter() {
        let filter = PacketFilter {
            protocol: IPPROTO_UDP,
            ..Default::default()
        };
        let pkt = frame(IPPROTO_TCP, 900, NFS_PORT, &[0u8; 10]);
        let c = classify(pkt.as_slice(), &filter, 0);
        assert_eq!(c.record, None);

        let mut stats = PacketStats::default();
        account(&mut stats, &c);
        assert_eq!(stats.total_packets, 1);
        assert_eq!(stats.tcp_packets, 1);
        assert_eq!(stats.nfs_packets, 1);
        assert_eq!(stats.total_bytes, pkt.len() as u64);
        assert_eq!(stats.nfs_bytes, pkt.len() as u64);
    }

    #[test]
    fn test_every_packet_gets_its_own_slot_and_xids_accumulate() {
        let mut packets: FixedMap<u32, PacketRecord, [Slot<u32, PacketRecord>; 8]> = FixedMap::inline();
        let mut xids: FixedMap<u32, PacketRecord, [Slot<u32, PacketRecord>; 8]> = FixedMap::inline();
        let counter = AtomicU32::new(0);

        let mut payload = rpc_call(0x99, true, RPC_PROG_NFS, 4, 1);
        payload.extend_from_slice(&[0u8; 64]);
        let pkt = frame(IPPROTO_TCP, 900, NFS_PORT, &payload);
        let c = classify(pkt.as_slice(), &nfs_filter(), 1);

        assert_eq!(record(&c, &counter, &mut packets, &mut xids), Outcome::Recorded);
        assert_eq!(record(&c, &counter, &mut packets, &mut xids), Outcome::Recorded);

        assert_eq!(packets.len(), 2);
        assert!(packets.get(&0).is_some());
        assert!(packets.get(&1).is_some());
        assert_eq!(xids.len(), 1);
        assert_eq!(xids.get(&0x99).unwrap().data_size, 2 * payload.len() as u64);
    }

    #[test]
    fn test_unrecorded_frames_do_not_consume_keys() {
        let mut packets: FixedMap<u32, PacketRecord, [Slot<u32, PacketRecord>; 2]> = FixedMap::inline();
        let mut xids: FixedMap<u32, PacketRecord, [Slot<u32, PacketRecord>; 2]> = FixedMap::inline();
        let counter = AtomicU32::new(0);
        let c = classify(&[0u8; 4][..], &PacketFilter::default(), 0);
        assert_eq!(record(&c, &counter, &mut packets, &mut xids), Outcome::Filtered);
        assert_eq!(counter.load(core::sync::atomic::Ordering::Relaxed), 0);
    }
}
