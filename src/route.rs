/*
Declarative inter-server routes.

The route file names NIC pairs and the switch tiers between them; the
effective bandwidth of a pair is the minimum of both NIC bandwidths and
every tier's contribution, where a non-top tier is derated by its
oversubscription ratio. Both directions share one bandwidth figure but
only the forward direction keeps the tier details.
*/

use crate::cluster::InterServerTopo;
use crate::error::{Result, TopoError};
use crate::topo::server::TopoServer;
use crate::topo::types::MAX_ROUTE_SWITCHES;
use crate::xml::XmlNode;
use log::debug;

/// Path of the deployment's route file, when one is configured. The XML
/// collaborator parses it; `assemble` consumes the resulting DOM.
pub fn configured_route_file() -> Option<std::path::PathBuf> {
    std::env::var_os("INTERSERVER_ROUTE_FILE").map(std::path::PathBuf::from)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchTier {
    pub down_bw: f32,
    pub up_bw: f32,
    pub up_link: i32,
    pub down_link: i32,
    pub is_top: bool,
}

impl SwitchTier {
    /// Bandwidth this tier can sustain for the route. A top tier is taken
    /// at face value; below it the uplinks may be oversubscribed.
    fn contribution(&self) -> f32 {
        if self.is_top {
            self.down_bw
        } else {
            self.down_bw
                .min(self.up_bw * self.up_link as f32 / self.down_link as f32)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterServerRoute {
    pub local_guid: u64,
    pub remote_guid: u64,
    /// Tier details, forward direction only.
    pub switches: Vec<SwitchTier>,
    pub inter_bw: f32,
}

pub fn effective_bw(local_bw: f32, remote_bw: f32, switches: &[SwitchTier]) -> f32 {
    let mut bw = local_bw.min(remote_bw);
    for tier in switches {
        bw = bw.min(tier.contribution());
    }
    bw
}

fn parse_tier(node: &XmlNode) -> Result<SwitchTier> {
    Ok(SwitchTier {
        down_bw: node.require_parsed("downBw")?,
        up_bw: node.require_parsed("upBw")?,
        up_link: node.require_parsed("upLink")?,
        down_link: node.require_parsed("downLink")?,
        is_top: node.require_parsed::<i32>("isTop")? != 0,
    })
}

fn pair_guid(pair: &XmlNode, which: &str) -> Result<u64> {
    let nic = pair
        .sub(which)
        .ok_or_else(|| TopoError::schema(format!("<pair> missing <{which}>")))?;
    nic.attr_u64_auto("guid")?
        .ok_or_else(|| TopoError::schema(format!("<{which}> missing attribute 'guid'")))
}

/// Loads an `interserver_route` DOM into the cluster view's route map.
pub fn load_routes(
    dom: &XmlNode,
    inter: &mut InterServerTopo,
    local: &TopoServer,
) -> Result<()> {
    let root = dom
        .find_tag("interserver_route")
        .ok_or_else(|| TopoError::schema("route DOM has no <interserver_route> element"))?;
    let pairs = root
        .sub("nic_pairs")
        .ok_or_else(|| TopoError::schema("<interserver_route> missing <nic_pairs>"))?;

    let mut routes = Vec::new();
    for pair in pairs.subs.iter().filter(|s| s.name == "pair") {
        let guid1 = pair_guid(pair, "nic1")?;
        let guid2 = pair_guid(pair, "nic2")?;
        let bw1 = inter.net_node(local, guid1)?.bw;
        let bw2 = inter.net_node(local, guid2)?.bw;

        let inter_switch = pair
            .sub("interSwitch")
            .ok_or_else(|| TopoError::schema("<pair> missing <interSwitch>"))?;
        let count: usize = inter_switch.require_parsed("count")?;
        if count > MAX_ROUTE_SWITCHES {
            return Err(TopoError::capacity(format!(
                "route {guid1:#x}->{guid2:#x} declares {count} switch tiers"
            )));
        }
        let switches = inter_switch
            .subs
            .iter()
            .filter(|s| s.name == "switch")
            .map(parse_tier)
            .collect::<Result<Vec<_>>>()?;
        if switches.len() != count {
            return Err(TopoError::schema(format!(
                "<interSwitch count={count}> carries {} <switch> children",
                switches.len()
            )));
        }

        let bw = effective_bw(bw1, bw2, &switches);
        debug!("route {guid1:#x} <-> {guid2:#x}: effective bw {bw} GB/s");
        routes.push(InterServerRoute {
            local_guid: guid1,
            remote_guid: guid2,
            switches,
            inter_bw: bw,
        });
        // The reverse direction shares the bandwidth figure only.
        routes.push(InterServerRoute {
            local_guid: guid2,
            remote_guid: guid1,
            switches: Vec::new(),
            inter_bw: bw,
        });
    }

    for route in routes {
        inter
            .route_map
            .entry(route.local_guid)
            .or_default()
            .insert(route.remote_guid, route);
    }
    Ok(())
}
