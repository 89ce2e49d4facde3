/*
DOM interface to the topology XML collaborator.

The core never parses XML text. An external parser hands it a tree of
tagged nodes with string attributes; this module is that tree, the typed
attribute accessors the builder relies on, and the small amount of DOM
surgery discovery performs (attaching apu/nic/net elements). Writing a
DOM back out as text is supported for TOPO_DUMP_FILE.
*/

use crate::error::{Result, TopoError};
use std::io::{self, Write};
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    pub name: String,
    attrs: Vec<(String, String)>,
    pub subs: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            subs: Vec::new(),
        }
    }

    /// Builder-style attribute setter, used heavily by tests and discovery.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_sub(mut self, sub: XmlNode) -> Self {
        self.subs.push(sub);
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        for (k, v) in self.attrs.iter_mut() {
            if *k == key {
                *v = value;
                return;
            }
        }
        self.attrs.push((key, value));
    }

    pub fn add_sub(&mut self, sub: XmlNode) -> &mut XmlNode {
        self.subs.push(sub);
        self.subs.last_mut().expect("just pushed")
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require_attr(&self, key: &str) -> Result<&str> {
        self.attr(key)
            .ok_or_else(|| TopoError::schema(format!("<{}> missing attribute '{key}'", self.name)))
    }

    /// Optional attribute parsed with FromStr; a present-but-unparseable
    /// value is a schema error, absence is Ok(None).
    pub fn attr_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.attr(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                TopoError::schema(format!("<{}> attribute '{key}' = '{raw}'", self.name))
            }),
        }
    }

    pub fn require_parsed<T: FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.require_attr(key)?;
        raw.parse::<T>()
            .map_err(|_| TopoError::schema(format!("<{}> attribute '{key}' = '{raw}'", self.name)))
    }

    pub fn attr_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.attr_parsed(key)?.unwrap_or(default))
    }

    /// Parses hex with or without a 0x prefix, else decimal (strtoul with
    /// base 0, plus the bare-hex form host hashes use).
    pub fn attr_u64_auto(&self, key: &str) -> Result<Option<u64>> {
        match self.attr(key) {
            None => Ok(None),
            Some(raw) => parse_u64_auto(raw)
                .map(Some)
                .ok_or_else(|| {
                    TopoError::schema(format!("<{}> attribute '{key}' = '{raw}'", self.name))
                }),
        }
    }

    pub fn attr_hex_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.attr(key) {
            None => Ok(None),
            Some(raw) => {
                let raw = raw.trim().trim_start_matches("0x");
                u64::from_str_radix(raw, 16).map(Some).map_err(|_| {
                    TopoError::schema(format!("<{}> attribute '{key}' = '{raw}'", self.name))
                })
            }
        }
    }

    pub fn sub(&self, name: &str) -> Option<&XmlNode> {
        self.subs.iter().find(|s| s.name == name)
    }

    pub fn sub_mut(&mut self, name: &str) -> Option<&mut XmlNode> {
        self.subs.iter_mut().find(|s| s.name == name)
    }

    /// Depth-first search for the first node with the given tag, the
    /// receiver included.
    pub fn find_tag(&self, name: &str) -> Option<&XmlNode> {
        if self.name == name {
            return Some(self);
        }
        self.subs.iter().find_map(|s| s.find_tag(name))
    }

    /// Child-index path to the first node matching the predicate, or None.
    pub fn find_path<P>(&self, pred: &P) -> Option<Vec<usize>>
    where
        P: Fn(&XmlNode) -> bool,
    {
        if pred(self) {
            return Some(Vec::new());
        }
        for (i, sub) in self.subs.iter().enumerate() {
            if let Some(mut path) = sub.find_path(pred) {
                path.insert(0, i);
                return Some(path);
            }
        }
        None
    }

    pub fn node_at(&self, path: &[usize]) -> Option<&XmlNode> {
        let mut cur = self;
        for &i in path {
            cur = cur.subs.get(i)?;
        }
        Some(cur)
    }

    fn node_at_mut(&mut self, path: &[usize]) -> Option<&mut XmlNode> {
        let mut cur = self;
        for &i in path {
            cur = cur.subs.get_mut(i)?;
        }
        Some(cur)
    }

    pub fn visit<F: FnMut(&XmlNode)>(&self, f: &mut F) {
        f(self);
        for sub in &self.subs {
            sub.visit(f);
        }
    }

    /// Serializes the DOM as indented XML text.
    pub fn write_xml<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.write_indented(w, 0)
    }

    fn write_indented<W: Write>(&self, w: &mut W, depth: usize) -> io::Result<()> {
        let pad = "  ".repeat(depth);
        write!(w, "{pad}<{}", self.name)?;
        for (k, v) in &self.attrs {
            write!(w, " {k}=\"{}\"", escape(v))?;
        }
        if self.subs.is_empty() {
            writeln!(w, "/>")
        } else {
            writeln!(w, ">")?;
            for sub in &self.subs {
                sub.write_indented(w, depth + 1)?;
            }
            writeln!(w, "{pad}</{}>", self.name)
        }
    }
}

pub fn parse_u64_auto(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        raw.parse::<u64>().ok()
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Finds the `pci` element carrying the given bus-id and makes sure it has
/// an `apu` child. Returns None when the bus-id is not in the DOM.
pub fn fill_apu<'a>(root: &'a mut XmlNode, bus_id: &str) -> Option<&'a mut XmlNode> {
    let path = root.find_path(&|n: &XmlNode| n.name == "pci" && n.attr("busid") == Some(bus_id))?;
    let pci = root.node_at_mut(&path).expect("path just found");
    if pci.sub("apu").is_none() {
        pci.add_sub(XmlNode::new("apu"));
    }
    pci.sub_mut("apu")
}

/// Walks a PCI path ("/0000:17:00.0/0000:18:00.0"), creating the `pci`
/// chain as needed under the first `cpu` element, and returns the `nic`
/// element of the terminal device.
pub fn fill_nic<'a>(root: &'a mut XmlNode, pci_path: &str) -> Result<&'a mut XmlNode> {
    let segments: Vec<&str> = pci_path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(TopoError::schema(format!("empty pci path '{pci_path}'")));
    }
    let cpu_path = root
        .find_path(&|n: &XmlNode| n.name == "cpu")
        .ok_or_else(|| TopoError::schema("topology DOM has no <cpu> element"))?;
    let mut cur = root.node_at_mut(&cpu_path).expect("path just found");
    for seg in segments {
        let existing = cur
            .subs
            .iter()
            .position(|s| s.name == "pci" && s.attr("busid") == Some(seg));
        cur = match existing {
            Some(i) => &mut cur.subs[i],
            None => cur.add_sub(XmlNode::new("pci").with_attr("busid", seg)),
        };
    }
    if cur.sub("nic").is_none() {
        cur.add_sub(XmlNode::new("nic"));
    }
    Ok(cur.sub_mut("nic").expect("just ensured"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> XmlNode {
        XmlNode::new("system").with_attr("version", 1).with_sub(
            XmlNode::new("cpu").with_attr("numaid", 0).with_sub(
                XmlNode::new("pci")
                    .with_attr("busid", "0000:17:00.0")
                    .with_sub(XmlNode::new("apu").with_attr("dev", 0)),
            ),
        )
    }

    #[test]
    fn attribute_access() {
        let dom = sample();
        assert_eq!(Some("1"), dom.attr("version"));
        assert!(dom.require_attr("missing").is_err());
        let cpu = dom.sub("cpu").unwrap();
        assert_eq!(0usize, cpu.require_parsed::<usize>("numaid").unwrap());
        assert_eq!(7, cpu.attr_or("familyid", 7).unwrap());
    }

    #[test]
    fn u64_auto_accepts_hex_and_decimal() {
        let n = XmlNode::new("net")
            .with_attr("guid", "0xa0")
            .with_attr("dev", "12");
        assert_eq!(Some(0xa0), n.attr_u64_auto("guid").unwrap());
        assert_eq!(Some(12), n.attr_u64_auto("dev").unwrap());
        let bad = XmlNode::new("net").with_attr("guid", "0xzz");
        assert!(bad.attr_u64_auto("guid").is_err());
    }

    #[test]
    fn find_tag_descends() {
        let dom = sample();
        assert_eq!("apu", dom.find_tag("apu").unwrap().name);
        assert!(dom.find_tag("nic").is_none());
    }

    #[test]
    fn fill_apu_reuses_existing_child() {
        let mut dom = sample();
        assert!(fill_apu(&mut dom, "0000:99:00.0").is_none());
        fill_apu(&mut dom, "0000:17:00.0").unwrap().set_attr("dev", 3);
        let pci = dom.sub("cpu").unwrap().sub("pci").unwrap();
        assert_eq!(1, pci.subs.len());
        assert_eq!(Some("3"), pci.sub("apu").unwrap().attr("dev"));
    }

    #[test]
    fn fill_nic_creates_pci_chain() {
        let mut dom = sample();
        fill_nic(&mut dom, "/0000:20:00.0/0000:21:00.0").unwrap();
        let cpu = dom.sub("cpu").unwrap();
        let outer = cpu
            .subs
            .iter()
            .find(|s| s.attr("busid") == Some("0000:20:00.0"))
            .unwrap();
        let inner = outer.sub("pci").unwrap();
        assert_eq!(Some("0000:21:00.0"), inner.attr("busid"));
        assert!(inner.sub("nic").is_some());

        // A second fill of the same path must not duplicate the chain.
        let mut again = dom.clone();
        fill_nic(&mut again, "/0000:20:00.0/0000:21:00.0").unwrap();
        assert_eq!(dom, again);
    }

    #[test]
    fn writes_indented_text() {
        let mut buf = Vec::new();
        sample().write_xml(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("<system version=\"1\">"));
        assert!(text.contains("<apu dev=\"0\"/>"));
        assert!(text.trim_end().ends_with("</system>"));
    }
}
