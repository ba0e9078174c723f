//! `<interface>` elements for domain definitions and hot-plug.

use super::XmlElement;
use crate::types::{NetworkRef, VirtualPort};

/// Build the `<interface>` element for one network reference.
///
/// `mac` is pinned only on the primary interface; every other interface
/// gets an address assigned by libvirt.
pub fn interface_element(net: &NetworkRef, mac: Option<&str>) -> XmlElement {
    let source = match net {
        NetworkRef::Named(name) | NetworkRef::Nat { name } | NetworkRef::Isolated { name } => {
            XmlElement::new("source").attr("network", name)
        }
        NetworkRef::Direct { device, mode, .. } => XmlElement::new("source")
            .attr("dev", device)
            .attr("mode", mode.as_str()),
        NetworkRef::Bridge { bridge, .. } => XmlElement::new("source").attr("bridge", bridge),
    };

    XmlElement::new("interface")
        .attr("type", net.interface_type())
        .child(source)
        .child(XmlElement::new("model").attr("type", "virtio"))
        .child_opt(mac.map(|m| XmlElement::new("mac").attr("address", m)))
        .child_opt(net.virtualport().map(virtualport_element))
}

fn virtualport_element(port: &VirtualPort) -> XmlElement {
    let vp = XmlElement::new("virtualport").attr("type", &port.kind);
    if port.parameters.is_empty() {
        return vp;
    }

    let params = port
        .parameters
        .iter()
        .fold(XmlElement::new("parameters"), |p, (k, v)| p.attr(k, v));
    vp.child(params)
}
