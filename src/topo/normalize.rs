/*
Graph normalization passes.

Runs between the DOM builder and path computation: Broadcom PEX switch
trees are flattened into their top-level switch, and CPU pairs on the
same server get SYS links with arch/vendor-dependent bandwidth.
*/

use crate::error::{Result, TopoError};
use crate::topo::server::{CpuInfo, NodeRef, TopoServer};
use crate::topo::types::*;
use log::debug;
use std::collections::HashSet;

/// Broadcom PEX generation encoded in the packed PCI device word.
/// `level` is 0 for a top-level switch, 1 for an exposed sub-switch.
fn bcm_gen(device: u64, level: u64) -> u32 {
    if device & 0xffff_ffff_ffff_f000 == 0x1000_c010_1000_a000 {
        return 4;
    }
    if device & 0xffff_ffff_ffff_f000 == 0x1000_c030_1000_0000 | level * 0x1000 {
        return 5;
    }
    0
}

/// Fuses recognized PEX sub-switches into their parent switch. The parent
/// ends up linking every leaf device directly; its subsystem-device bits
/// are forced to 0xffff so a second pass cannot re-match it (the arena is
/// compacted by removals, so the scan restarts from the front after every
/// fuse).
pub fn flatten_bcm_switches(server: &mut TopoServer) -> Result<()> {
    'restart: loop {
        for s in 0..server.count(NodeKind::Pci) {
            let gen = bcm_gen(server.nodes(NodeKind::Pci)[s].pci().device, 0);
            if gen == 0 {
                continue;
            }
            let parent_id = server.nodes(NodeKind::Pci)[s].id;
            let parent = NodeRef::new(NodeKind::Pci, s);

            // Sub-switches are the PCI children exposing the same generation.
            let mut sub_refs = HashSet::new();
            let mut sub_ids = Vec::new();
            for link in &server.node(parent).links {
                if link.remote.kind != NodeKind::Pci || link.remote == parent {
                    continue;
                }
                let sub = server.node(link.remote);
                if bcm_gen(sub.pci().device, 1) == gen {
                    sub_refs.insert(link.remote);
                    sub_ids.push(sub.id);
                }
            }
            server
                .node_mut(parent)
                .links
                .retain(|l| !sub_refs.contains(&l.remote));

            for sub_id in sub_ids {
                // Indices shift on every removal; resolve by id each round.
                let parent = NodeRef::new(
                    NodeKind::Pci,
                    server.id_to_index(NodeKind::Pci, parent_id)?,
                );
                let sub_index = server.id_to_index(NodeKind::Pci, sub_id)?;
                let sub = NodeRef::new(NodeKind::Pci, sub_index);
                debug!(
                    "fusing PEX gen{gen} sub-switch {sub_id:#x} into {parent_id:#x}"
                );
                let sub_links = server.node(sub).links.clone();
                for link in sub_links {
                    if link.remote == parent {
                        continue;
                    }
                    if server.node(parent).links.len() == MAX_LINKS {
                        return Err(TopoError::capacity(format!(
                            "more than {MAX_LINKS} links while flattening switch {parent_id:#x}"
                        )));
                    }
                    // Reparent the device: parent takes over the link, the
                    // device's reverse edge is rewritten in place.
                    server.node_mut(parent).links.push(link.clone());
                    for back in server.node_mut(link.remote).links.iter_mut() {
                        if back.remote == sub {
                            back.remote = parent;
                            break;
                        }
                    }
                }
                server.remove_node(NodeKind::Pci, sub_index)?;
            }

            let parent_index = server.id_to_index(NodeKind::Pci, parent_id)?;
            server.nodes_mut(NodeKind::Pci)[parent_index].pci_mut().device |= 0xffff;
            continue 'restart;
        }
        return Ok(());
    }
}

fn inter_cpu_bw(cpu: &CpuInfo) -> f32 {
    match (cpu.arch, cpu.vendor) {
        (Some(CpuArch::Power), _) => P9_BW,
        (Some(CpuArch::Arm), _) => ARM_BW,
        (Some(CpuArch::X86), Some(CpuVendor::Intel)) => {
            if cpu.model == Some(CpuModel::Skl) {
                SKL_QPI_BW
            } else {
                QPI_BW
            }
        }
        (Some(CpuArch::X86), Some(CpuVendor::Amd)) => AMD_BW,
        (Some(CpuArch::X86), Some(CpuVendor::Zhaoxin)) => {
            if cpu.model == Some(CpuModel::Yongfeng) {
                YONGFENG_ZPI_BW
            } else {
                ZPI_BW
            }
        }
        _ => LOC_BW,
    }
}

/// Adds SYS links between every ordered pair of CPUs on the same server.
pub fn connect_cpus(server: &mut TopoServer) -> Result<()> {
    let count = server.count(NodeKind::Cpu);
    for i in 0..count {
        for j in 0..count {
            if i == j {
                continue;
            }
            let a = server.nodes(NodeKind::Cpu)[i].id;
            let b = server.nodes(NodeKind::Cpu)[j].id;
            if id_server(a) != id_server(b) {
                continue;
            }
            let bw = inter_cpu_bw(server.nodes(NodeKind::Cpu)[i].cpu());
            server.connect(
                NodeRef::new(NodeKind::Cpu, i),
                NodeRef::new(NodeKind::Cpu, j),
                LinkKind::Sys,
                bw,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topo::server::NodePayload;

    const GEN4_BASE: u64 = 0x1000_c010_1000_a000;

    fn connect_both(server: &mut TopoServer, a: NodeRef, b: NodeRef, kind: LinkKind, bw: f32) {
        server.connect(a, b, kind, bw).unwrap();
        server.connect(b, a, kind, bw).unwrap();
    }

    // Parent PEX switch with two sub-switches, two APUs below each.
    fn bcm_tree() -> TopoServer {
        let mut server = TopoServer::new();
        let parent = server.create_node(NodeKind::Pci, topo_id(0, 0x100)).unwrap();
        server.node_mut(parent).pci_mut().device = GEN4_BASE | 0x1;
        for s in 0..2u64 {
            let sub = server
                .create_node(NodeKind::Pci, topo_id(0, 0x200 + s))
                .unwrap();
            server.node_mut(sub).pci_mut().device = GEN4_BASE | 0x2;
            connect_both(&mut server, parent, sub, LinkKind::Pci, 24.0);
            for a in 0..2u64 {
                let apu = server
                    .create_node(NodeKind::Apu, topo_id(0, 0x300 + s * 2 + a))
                    .unwrap();
                connect_both(&mut server, apu, sub, LinkKind::Pci, 24.0);
            }
        }
        server
    }

    #[test]
    fn flatten_fuses_sub_switches() {
        let mut server = bcm_tree();
        flatten_bcm_switches(&mut server).unwrap();

        assert_eq!(1, server.count(NodeKind::Pci));
        let parent = server.nodes(NodeKind::Pci)[0].clone();
        assert_eq!(0xffff, parent.pci().device & 0xffff);
        // Parent now links all four APUs directly.
        let apu_links = parent
            .links
            .iter()
            .filter(|l| l.remote.kind == NodeKind::Apu)
            .count();
        assert_eq!(4, apu_links);
        // Every APU's reverse edge lands on the parent.
        for apu in server.nodes(NodeKind::Apu) {
            let pci_links: Vec<_> = apu
                .links
                .iter()
                .filter(|l| l.kind == LinkKind::Pci)
                .collect();
            assert_eq!(1, pci_links.len());
            assert_eq!(NodeRef::new(NodeKind::Pci, 0), pci_links[0].remote);
        }
    }

    #[test]
    fn flatten_is_idempotent() {
        let mut once = bcm_tree();
        flatten_bcm_switches(&mut once).unwrap();
        let mut twice = bcm_tree();
        flatten_bcm_switches(&mut twice).unwrap();
        flatten_bcm_switches(&mut twice).unwrap();

        assert_eq!(once.count(NodeKind::Pci), twice.count(NodeKind::Pci));
        let (a, b) = (&once.nodes(NodeKind::Pci)[0], &twice.nodes(NodeKind::Pci)[0]);
        assert_eq!(a.id, b.id);
        assert_eq!(a.pci().device, b.pci().device);
        assert_eq!(a.links.len(), b.links.len());
        for (la, lb) in a.links.iter().zip(&b.links) {
            assert_eq!(la.remote, lb.remote);
            assert_eq!(la.bw, lb.bw);
        }
    }

    #[test]
    fn gen5_sub_switch_pattern_is_level_dependent() {
        assert_eq!(5, bcm_gen(0x1000_c030_1000_0000, 0));
        assert_eq!(0, bcm_gen(0x1000_c030_1000_0000, 1));
        assert_eq!(5, bcm_gen(0x1000_c030_1000_1000, 1));
        assert_eq!(4, bcm_gen(GEN4_BASE | 0xabc, 1));
    }

    #[test]
    fn connect_cpus_uses_vendor_table() {
        let mut server = TopoServer::new();
        for numa in 0..2u64 {
            let cpu = server.create_node(NodeKind::Cpu, topo_id(0, numa)).unwrap();
            if let NodePayload::Cpu(info) = &mut server.node_mut(cpu).payload {
                info.arch = Some(CpuArch::X86);
                info.vendor = Some(CpuVendor::Intel);
                info.model = Some(CpuModel::Skl);
            }
        }
        // A CPU on another server must stay unlinked.
        server.create_node(NodeKind::Cpu, topo_id(1, 0)).unwrap();

        connect_cpus(&mut server).unwrap();
        let first = &server.nodes(NodeKind::Cpu)[0];
        assert_eq!(1, first.links.len());
        assert_eq!(LinkKind::Sys, first.links[0].kind);
        assert_eq!(SKL_QPI_BW, first.links[0].bw);
        assert!(server.nodes(NodeKind::Cpu)[2].links.is_empty());
    }

    #[test]
    fn inter_cpu_bw_table() {
        let mk = |arch, vendor, model| CpuInfo {
            arch,
            vendor,
            model,
            ..CpuInfo::default()
        };
        assert_eq!(P9_BW, inter_cpu_bw(&mk(Some(CpuArch::Power), None, None)));
        assert_eq!(ARM_BW, inter_cpu_bw(&mk(Some(CpuArch::Arm), None, None)));
        assert_eq!(
            QPI_BW,
            inter_cpu_bw(&mk(
                Some(CpuArch::X86),
                Some(CpuVendor::Intel),
                Some(CpuModel::Bdw)
            ))
        );
        assert_eq!(
            AMD_BW,
            inter_cpu_bw(&mk(Some(CpuArch::X86), Some(CpuVendor::Amd), None))
        );
        assert_eq!(
            YONGFENG_ZPI_BW,
            inter_cpu_bw(&mk(
                Some(CpuArch::X86),
                Some(CpuVendor::Zhaoxin),
                Some(CpuModel::Yongfeng)
            ))
        );
        assert_eq!(LOC_BW, inter_cpu_bw(&mk(None, None, None)));
    }
}
