//! Shared DOM builders for the scenario tests.

use crate::xml::XmlNode;

pub fn net_guid(host_hash: u64, dev: i32) -> u64 {
    (host_hash << 8) | (0xa + dev as u64)
}

pub fn net_xml(dev: i32, guid: u64, mbps: i64) -> XmlNode {
    XmlNode::new("net")
        .with_attr("dev", dev)
        .with_attr("guid", format!("{guid:#x}"))
        .with_attr("speed", mbps)
        .with_attr("latency", "1.0")
        .with_attr("port", 1)
        .with_attr("maxConn", 8)
}

/// One Intel SKL host: a single NUMA domain, one PCI switch carrying
/// `n_apus` accelerators (ranks counted from `rank_base`) and one
/// 100 Gb NIC whose GUID derives from the host hash.
pub fn host_dom(host_hash: u64, rank_base: i32, n_apus: i32) -> XmlNode {
    host_dom_with_nics(host_hash, rank_base, n_apus, 1)
}

pub fn host_dom_with_nics(host_hash: u64, rank_base: i32, n_apus: i32, n_nics: i32) -> XmlNode {
    let ranks: Vec<i32> = (rank_base..rank_base + n_apus).collect();
    host_dom_ranks(host_hash, &ranks, n_nics, 100_000)
}

/// Like host_dom_with_nics, but with explicit (possibly non-consecutive)
/// rank assignments, one APU per rank.
pub fn host_dom_ranks(host_hash: u64, ranks: &[i32], n_nics: i32, nic_mbps: i64) -> XmlNode {
    let mut switch = XmlNode::new("pci")
        .with_attr("busid", "0000:10:00.0")
        .with_attr("link_speed", "16 GT/s")
        .with_attr("link_width", 16);
    for (i, rank) in ranks.iter().enumerate() {
        switch = switch.with_sub(
            XmlNode::new("pci")
                .with_attr("busid", format!("0000:{:02x}:00.0", 0x20 + i))
                .with_attr("link_speed", "16 GT/s")
                .with_sub(
                    XmlNode::new("apu")
                        .with_attr("dev", i as i32)
                        .with_attr("rank", *rank),
                ),
        );
    }
    for i in 0..n_nics {
        switch = switch.with_sub(
            XmlNode::new("pci")
                .with_attr("busid", format!("0000:{:02x}:00.0", 0x40 + i))
                .with_attr("link_speed", "16 GT/s")
                .with_sub(XmlNode::new("nic").with_sub(net_xml(
                    i,
                    net_guid(host_hash, i),
                    nic_mbps,
                ))),
        );
    }
    XmlNode::new("system").with_attr("version", 1).with_sub(
        XmlNode::new("cpu")
            .with_attr("numaid", 0)
            .with_attr("host_hash", format!("{host_hash:x}"))
            .with_attr("arch", "x86_64")
            .with_attr("vendor", "GenuineIntel")
            .with_attr("familyid", 6)
            .with_attr("modelid", 0x55)
            .with_sub(switch),
    )
}
