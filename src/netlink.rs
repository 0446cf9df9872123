//! Typed rtnetlink operations over a blocking socket: link enumeration,
//! addresses, HTB qdiscs and classes, the cgroup classifier filter and proxy
//! neighbour entries. Queueing parameters the packet crates have no typed
//! model for (HTB, fifo) are packed by hand the way iproute2 does.

use std::cell::Cell;
use std::convert::{TryFrom, TryInto};
use std::net::IpAddr;

use libc::ETH_P_ALL;

use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::constants::*;
use netlink_packet_route::nlas::link::Nla as LinkNla;
use netlink_packet_route::nlas::address::Nla as AddressNla;
use netlink_packet_route::nlas::tc::Nla as TcNla;
use netlink_packet_route::nlas::{DefaultNla, NlaBuffer, Parseable};
use netlink_packet_route::{
    AddressMessage, LinkMessage, NeighbourMessage, RtnlMessage, TcMessage,
};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

use crate::error::{Error, ErrorKind, Result};

/// tc handles are `major:minor` packed into 32 bits.
pub const fn tc_handle(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

pub const TC_H_ROOT: u32 = 0xFFFF_FFFF;

const TCA_OPTIONS: u16 = 2;
const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;

/// Everything the network manager wants to know about one link.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub kind: String,
    pub group: u32,
    pub loopback: bool,
    pub running: bool,
    /// Kind of the root qdisc, empty when none is installed.
    pub qdisc: String,
}

/// Counters of one tc class.
#[derive(Debug, Clone, Default)]
pub struct ClassStat {
    pub handle: u32,
    pub parent: u32,
    pub kind: String,
    pub bytes: u64,
    pub packets: u64,
    pub drops: u64,
    pub overlimits: u64,
}

/// Ticks-per-usec scaling from /proc/net/psched, needed to translate burst
/// bytes into HTB buffer ticks.
#[derive(Debug, Clone, Copy)]
struct PschedClock {
    tick_in_usec: f64,
}

impl PschedClock {
    fn read() -> PschedClock {
        Self::parse(
            &std::fs::read_to_string("/proc/net/psched").unwrap_or_default(),
        )
    }

    fn parse(text: &str) -> PschedClock {
        let mut fields = text.split_whitespace().map(|f| u64::from_str_radix(f, 16));
        let (t2us, us2t) = match (fields.next(), fields.next()) {
            (Some(Ok(a)), Some(Ok(b))) if b != 0 => (a, b),
            _ => (1, 1),
        };
        PschedClock {
            tick_in_usec: t2us as f64 / us2t as f64,
        }
    }

    /// Transmission time of `size` bytes at `rate` bytes/s, in ticks.
    fn xmit_ticks(&self, rate: u64, size: u64) -> u32 {
        if rate == 0 {
            return 0;
        }
        let usec = size as f64 * 1_000_000.0 / rate as f64;
        (usec * self.tick_in_usec) as u32
    }
}

pub struct NetlinkSocket {
    socket: Socket,
    seq: Cell<u32>,
    clock: PschedClock,
}

impl NetlinkSocket {
    pub fn connect() -> Result<NetlinkSocket> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| Error::from(e).context("netlink socket"))?;
        socket
            .bind_auto()
            .map_err(|e| Error::from(e).context("netlink bind"))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| Error::from(e).context("netlink connect"))?;
        Ok(NetlinkSocket {
            socket,
            seq: Cell::new(1),
            clock: PschedClock::read(),
        })
    }

    fn next_seq(&self) -> u32 {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));
        seq
    }

    /// Send one request and collect the response messages. `flags` must
    /// include NLM_F_REQUEST; dumps get their Done handled here, acked
    /// requests their ack.
    fn request(&self, message: RtnlMessage, flags: u16) -> Result<Vec<RtnlMessage>> {
        let mut packet = NetlinkMessage {
            header: NetlinkHeader::default(),
            payload: NetlinkPayload::from(message),
        };
        packet.header.flags = flags;
        packet.header.sequence_number = self.next_seq();
        packet.finalize();

        let mut buf = vec![0u8; packet.header.length as usize];
        packet.serialize(&mut buf);
        self.socket
            .send(&buf, 0)
            .map_err(|e| Error::from(e).context("netlink send"))?;

        let mut responses = vec![];
        let mut recv_buf = vec![0u8; 64 * 1024];
        loop {
            let size = self
                .socket
                .recv(&mut recv_buf[..], 0)
                .map_err(|e| Error::from(e).context("netlink recv"))?;
            let mut offset = 0;
            while offset < size {
                let reply = NetlinkMessage::<RtnlMessage>::deserialize(&recv_buf[offset..size])
                    .map_err(|e| {
                        Error::new(ErrorKind::Unknown, format!("netlink parse: {}", e))
                    })?;
                let length = reply.header.length as usize;
                if length == 0 {
                    return Err(Error::new(ErrorKind::Unknown, "empty netlink message"));
                }
                match reply.payload {
                    NetlinkPayload::Done => return Ok(responses),
                    NetlinkPayload::Error(err) => {
                        if err.code == 0 {
                            return Ok(responses); // ack
                        }
                        return Err(Error::with_errno(
                            ErrorKind::Unknown,
                            -err.code,
                            "netlink request failed",
                        ));
                    }
                    NetlinkPayload::InnerMessage(msg) => responses.push(msg),
                    _ => {}
                }
                offset += length;
            }
            if flags & NLM_F_DUMP == 0 && !responses.is_empty() {
                return Ok(responses);
            }
            if flags & NLM_F_DUMP == 0 && flags & NLM_F_ACK == 0 {
                return Ok(responses);
            }
        }
    }

    fn ack_request(&self, message: RtnlMessage, extra_flags: u16) -> Result<()> {
        self.request(message, NLM_F_REQUEST | NLM_F_ACK | extra_flags)
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // links

    pub fn dump_links(&self) -> Result<Vec<LinkInfo>> {
        let responses = self.request(
            RtnlMessage::GetLink(LinkMessage::default()),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;
        let mut links = vec![];
        for message in responses {
            if let RtnlMessage::NewLink(link) = message {
                links.push(Self::link_info(link));
            }
        }
        Ok(links)
    }

    fn link_info(link: LinkMessage) -> LinkInfo {
        let mut info = LinkInfo {
            index: link.header.index,
            name: String::new(),
            mtu: 1500,
            kind: String::new(),
            group: 0,
            loopback: link.header.flags & IFF_LOOPBACK != 0,
            running: link.header.flags & IFF_RUNNING != 0,
            qdisc: String::new(),
        };
        for nla in link.nlas {
            match nla {
                LinkNla::IfName(name) => info.name = name,
                LinkNla::Mtu(mtu) => info.mtu = mtu,
                LinkNla::Group(group) => info.group = group,
                LinkNla::Qdisc(qdisc) => info.qdisc = qdisc,
                LinkNla::Info(infos) => {
                    use netlink_packet_route::nlas::link::Info;
                    for i in infos {
                        if let Info::Kind(kind) = i {
                            info.kind = format!("{:?}", kind).to_lowercase();
                        }
                    }
                }
                _ => {}
            }
        }
        info
    }

    pub fn link_index(&self, name: &str) -> Result<u32> {
        self.dump_links()?
            .into_iter()
            .find(|l| l.name == name)
            .map(|l| l.index)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unknown, format!("no such link {}", name))
            })
    }

    pub fn link_set_up(&self, index: u32) -> Result<()> {
        let mut link = LinkMessage::default();
        link.header.index = index;
        link.header.flags = IFF_UP;
        link.header.change_mask = IFF_UP;
        self.ack_request(RtnlMessage::SetLink(link), 0)
    }

    pub fn link_set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        let mut link = LinkMessage::default();
        link.header.index = index;
        link.nlas.push(LinkNla::Mtu(mtu));
        self.ack_request(RtnlMessage::SetLink(link), 0)
    }

    /// Move a link into the network namespace of `pid`.
    pub fn link_set_netns(&self, index: u32, pid: u32) -> Result<()> {
        let mut link = LinkMessage::default();
        link.header.index = index;
        link.nlas.push(LinkNla::NetNsPid(pid));
        self.ack_request(RtnlMessage::SetLink(link), 0)
    }

    /// Create a veth pair; the peer is moved around afterwards.
    pub fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        use netlink_packet_route::nlas::link::{Info, InfoData, InfoKind, VethInfo};

        let mut peer_link = LinkMessage::default();
        peer_link.nlas.push(LinkNla::IfName(peer.to_string()));

        let mut link = LinkMessage::default();
        link.nlas.push(LinkNla::IfName(name.to_string()));
        link.nlas.push(LinkNla::Info(vec![
            Info::Kind(InfoKind::Veth),
            Info::Data(InfoData::Veth(VethInfo::Peer(peer_link))),
        ]));
        self.ack_request(
            RtnlMessage::NewLink(link),
            NLM_F_CREATE | NLM_F_EXCL,
        )
    }

    // ------------------------------------------------------------------
    // addresses

    pub fn dump_addresses(&self, index: u32) -> Result<Vec<IpAddr>> {
        let responses = self.request(
            RtnlMessage::GetAddress(AddressMessage::default()),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;
        let mut addrs = vec![];
        for message in responses {
            if let RtnlMessage::NewAddress(addr) = message {
                if addr.header.index != index {
                    continue;
                }
                for nla in addr.nlas {
                    if let AddressNla::Address(bytes) = nla {
                        if let Some(ip) = bytes_to_ip(&bytes) {
                            addrs.push(ip);
                        }
                    }
                }
            }
        }
        Ok(addrs)
    }

    pub fn add_address(&self, index: u32, ip: IpAddr, prefix: u8) -> Result<()> {
        let mut addr = AddressMessage::default();
        addr.header.index = index;
        addr.header.prefix_len = prefix;
        addr.header.family = match ip {
            IpAddr::V4(_) => AF_INET as u8,
            IpAddr::V6(_) => AF_INET6 as u8,
        };
        let bytes = ip_to_bytes(ip);
        addr.nlas.push(AddressNla::Local(bytes.clone()));
        addr.nlas.push(AddressNla::Address(bytes));
        self.ack_request(RtnlMessage::NewAddress(addr), NLM_F_CREATE | NLM_F_EXCL)
    }

    pub fn del_address(&self, index: u32, ip: IpAddr, prefix: u8) -> Result<()> {
        let mut addr = AddressMessage::default();
        addr.header.index = index;
        addr.header.prefix_len = prefix;
        addr.header.family = match ip {
            IpAddr::V4(_) => AF_INET as u8,
            IpAddr::V6(_) => AF_INET6 as u8,
        };
        addr.nlas.push(AddressNla::Local(ip_to_bytes(ip)));
        self.ack_request(RtnlMessage::DelAddress(addr), 0)
    }

    /// Bounded poll for any address on the named interface; used by tasks
    /// whose addresses are configured externally.
    pub fn wait_address(&self, name: &str, timeout_s: u64) -> Result<()> {
        let index = self.link_index(name)?;
        for _ in 0..timeout_s * 10 {
            if !self.dump_addresses(index)?.is_empty() {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        Err(Error::new(
            ErrorKind::Unknown,
            format!("no address appeared on {} in {}s", name, timeout_s),
        ))
    }

    // ------------------------------------------------------------------
    // qdiscs and classes

    fn tc_message(index: u32, parent: u32, handle: u32) -> TcMessage {
        let mut tc = TcMessage::default();
        tc.header.family = AF_UNSPEC as u8;
        tc.header.index = index as i32;
        tc.header.parent = parent;
        tc.header.handle = handle;
        tc
    }

    /// Install the HTB root qdisc: handle `major:0`, unclassified traffic
    /// into the default class.
    pub fn add_htb_qdisc(&self, index: u32, handle: u32, default_class: u32) -> Result<()> {
        let mut tc = Self::tc_message(index, TC_H_ROOT, handle);
        tc.nlas.push(TcNla::Kind("htb".to_string()));
        // struct tc_htb_glob
        let mut glob = Vec::with_capacity(20);
        glob.extend_from_slice(&3u32.to_ne_bytes()); // version
        glob.extend_from_slice(&10u32.to_ne_bytes()); // rate2quantum
        glob.extend_from_slice(&(default_class & 0xffff).to_ne_bytes()); // defcls
        glob.extend_from_slice(&0u32.to_ne_bytes()); // debug
        glob.extend_from_slice(&0u32.to_ne_bytes()); // direct_pkts
        tc.nlas.push(TcNla::Other(default_nla(
            TCA_OPTIONS | (1 << 15), // NLA_F_NESTED
            nla_bytes(TCA_HTB_INIT, &glob),
        )));
        self.ack_request(
            RtnlMessage::NewQueueDiscipline(tc),
            NLM_F_CREATE | NLM_F_REPLACE,
        )
    }

    /// A plain packet fifo below a leaf class.
    pub fn add_pfifo_qdisc(&self, index: u32, parent: u32, handle: u32, limit: u32) -> Result<()> {
        let mut tc = Self::tc_message(index, parent, handle);
        tc.nlas.push(TcNla::Kind("pfifo".to_string()));
        // struct tc_fifo_qopt, flat in TCA_OPTIONS
        tc.nlas.push(TcNla::Other(default_nla(
            TCA_OPTIONS,
            limit.to_ne_bytes().to_vec(),
        )));
        self.ack_request(
            RtnlMessage::NewQueueDiscipline(tc),
            NLM_F_CREATE | NLM_F_REPLACE,
        )
    }

    pub fn del_qdisc(&self, index: u32, parent: u32, handle: u32) -> Result<()> {
        let tc = Self::tc_message(index, parent, handle);
        self.ack_request(RtnlMessage::DelQueueDiscipline(tc), 0)
    }

    /// Root qdisc kind of a device, directly from a class dump request on
    /// the link; empty when the device has none we know about.
    pub fn root_qdisc_kind(&self, index: u32) -> Result<String> {
        let responses = self.request(
            RtnlMessage::GetQueueDiscipline(Self::tc_message(index, 0, 0)),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;
        for message in responses {
            if let RtnlMessage::NewQueueDiscipline(tc) = message {
                if tc.header.index == index as i32 && tc.header.parent == TC_H_ROOT {
                    for nla in tc.nlas {
                        if let TcNla::Kind(kind) = nla {
                            return Ok(kind);
                        }
                    }
                }
            }
        }
        Ok(String::new())
    }

    /// Add or replace one HTB class. Rates are bytes/s; bursts are bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn add_htb_class(
        &self,
        index: u32,
        parent: u32,
        handle: u32,
        prio: u32,
        rate: u64,
        ceil: u64,
        quantum: u32,
        rate_burst: u64,
        ceil_burst: u64,
    ) -> Result<()> {
        let rate32 = rate.min(u32::MAX as u64) as u32;
        let ceil32 = ceil.max(rate).min(u32::MAX as u64) as u32;

        // struct tc_htb_opt: two tc_ratespec, buffer, cbuffer, quantum,
        // level, prio
        let mut opt = Vec::with_capacity(44);
        opt.extend_from_slice(&ratespec(rate32));
        opt.extend_from_slice(&ratespec(ceil32));
        opt.extend_from_slice(&self.clock.xmit_ticks(rate, rate_burst).to_ne_bytes());
        opt.extend_from_slice(&self.clock.xmit_ticks(ceil, ceil_burst).to_ne_bytes());
        opt.extend_from_slice(&quantum.to_ne_bytes());
        opt.extend_from_slice(&0u32.to_ne_bytes()); // level
        opt.extend_from_slice(&prio.to_ne_bytes());

        let mut tc = Self::tc_message(index, parent, handle);
        tc.nlas.push(TcNla::Kind("htb".to_string()));
        tc.nlas.push(TcNla::Other(default_nla(
            TCA_OPTIONS | (1 << 15),
            nla_bytes(TCA_HTB_PARMS, &opt),
        )));
        self.ack_request(
            RtnlMessage::NewTrafficClass(tc),
            NLM_F_CREATE | NLM_F_REPLACE,
        )
    }

    pub fn del_class(&self, index: u32, handle: u32) -> Result<()> {
        let tc = Self::tc_message(index, 0, handle);
        self.ack_request(RtnlMessage::DelTrafficClass(tc), 0)
    }

    /// Dump every class on a device with its counters.
    pub fn dump_classes(&self, index: u32) -> Result<Vec<ClassStat>> {
        let responses = self.request(
            RtnlMessage::GetTrafficClass(Self::tc_message(index, 0, 0)),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;
        let mut stats = vec![];
        for message in responses {
            if let RtnlMessage::NewTrafficClass(tc) = message {
                if tc.header.index != index as i32 {
                    continue;
                }
                let mut stat = ClassStat {
                    handle: tc.header.handle,
                    parent: tc.header.parent,
                    ..Default::default()
                };
                for nla in tc.nlas {
                    match nla {
                        TcNla::Kind(kind) => stat.kind = kind,
                        TcNla::Stats(s) => {
                            stat.bytes = s.bytes;
                            stat.packets = s.packets as u64;
                            stat.drops = s.drops as u64;
                            stat.overlimits = s.overlimits as u64;
                        }
                        _ => {}
                    }
                }
                stats.push(stat);
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // filters

    /// Attach the cgroup classifier at the qdisc root: packets are steered
    /// by the net_cls classid of the sending task's cgroup.
    pub fn add_cgroup_filter(&self, index: u32, parent: u32, prio: u16) -> Result<()> {
        let mut tc = Self::tc_message(index, parent, tc_handle(prio, 0));
        tc.header.info = tc_filter_info(prio, ETH_P_ALL as u32);
        tc.nlas.push(TcNla::Kind("cgroup".to_string()));
        self.ack_request(RtnlMessage::NewTrafficFilter(tc), NLM_F_CREATE)
    }

    pub fn del_cgroup_filter(&self, index: u32, parent: u32, prio: u16) -> Result<()> {
        let mut tc = Self::tc_message(index, parent, tc_handle(prio, 0));
        tc.header.info = tc_filter_info(prio, ETH_P_ALL as u32);
        self.ack_request(RtnlMessage::DelTrafficFilter(tc), 0)
    }

    // ------------------------------------------------------------------
    // neighbours

    /// Add or remove a proxy arp/ndp entry announcing `ip` on the device.
    pub fn proxy_neighbour(&self, index: u32, ip: IpAddr, add: bool) -> Result<()> {
        let mut neigh = NeighbourMessage::default();
        neigh.header.family = match ip {
            IpAddr::V4(_) => AF_INET as u8,
            IpAddr::V6(_) => AF_INET6 as u8,
        };
        neigh.header.ifindex = index;
        neigh.header.flags = NTF_PROXY;
        neigh.header.state = NUD_PERMANENT;
        neigh
            .nlas
            .push(netlink_packet_route::nlas::neighbour::Nla::Destination(
                ip_to_bytes(ip),
            ));
        if add {
            self.ack_request(RtnlMessage::NewNeighbour(neigh), NLM_F_CREATE | NLM_F_REPLACE)
        } else {
            self.ack_request(RtnlMessage::DelNeighbour(neigh), 0)
        }
    }
}

/// struct tc_ratespec with the rate filled in, everything else zero the way
/// iproute2 leaves it for HTB.
fn ratespec(rate: u32) -> [u8; 12] {
    let mut spec = [0u8; 12];
    spec[8..12].copy_from_slice(&rate.to_ne_bytes());
    spec
}

/// Build a `DefaultNla` carrying `value` as its raw payload under `kind`,
/// going through the wire format since the type has no public constructor.
fn default_nla(kind: u16, value: Vec<u8>) -> DefaultNla {
    let raw = nla_bytes(kind, &value);
    DefaultNla::parse(&NlaBuffer::new(&raw)).expect("well-formed nla buffer")
}

/// One nested rtattr: length, type, payload, padded to 4 bytes.
fn nla_bytes(kind: u16, payload: &[u8]) -> Vec<u8> {
    let len = 4 + payload.len();
    let mut buf = Vec::with_capacity((len + 3) & !3);
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    buf
}

/// tcm_info of a filter: priority in the upper 16 bits, protocol in the
/// lower, protocol in network byte order.
fn tc_filter_info(prio: u16, protocol: u32) -> u32 {
    ((prio as u32) << 16) | (protocol as u16).to_be() as u32
}

fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::from(b)),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::from(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_pack() {
        assert_eq!(tc_handle(1, 0), 0x0001_0000);
        assert_eq!(tc_handle(1, 4), 0x0001_0004);
        assert_eq!(tc_handle(0xffff, 0xffff), 0xffff_ffff);
    }

    #[test]
    fn psched_parse() {
        let clock = PschedClock::parse("000003e8 00000040 000f4240 3b9aca00\n");
        // 1000 / 64 ticks per usec
        assert!((clock.tick_in_usec - 15.625).abs() < 1e-9);
        // transmitting 15000 bytes at 1.25 MB/s takes 12 ms
        let ticks = clock.xmit_ticks(1_250_000, 15_000);
        assert_eq!(ticks, (12_000.0 * 15.625) as u32);
    }

    #[test]
    fn psched_defaults_on_garbage() {
        let clock = PschedClock::parse("");
        assert_eq!(clock.tick_in_usec, 1.0);
    }

    #[test]
    fn nla_padding() {
        let buf = nla_bytes(TCA_HTB_PARMS, &[1, 2, 3, 4, 5]);
        assert_eq!(buf.len(), 12); // 4 header + 5 payload + 3 pad
        assert_eq!(buf[0], 9); // length without padding
        assert_eq!(buf[2], TCA_HTB_PARMS as u8);
    }

    #[test]
    fn filter_info_packs_protocol_big_endian() {
        let info = tc_filter_info(10, ETH_P_ALL as u32);
        assert_eq!(info >> 16, 10);
        assert_eq!((info & 0xffff) as u16, (ETH_P_ALL as u16).to_be());
    }

    #[test]
    fn ip_round_trip() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(bytes_to_ip(&ip_to_bytes(v4)), Some(v4));
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(bytes_to_ip(&ip_to_bytes(v6)), Some(v6));
        assert_eq!(bytes_to_ip(&[1, 2, 3]), None);
    }
}
