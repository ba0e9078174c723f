//! Virtual network XML synthesis.

use std::net::Ipv4Addr;

use super::XmlElement;
use crate::types::{NetworkKind, StaticIps};

/// Addressing derived from a network's CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddressing {
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
}

/// Builder for libvirt network XML.
pub struct NetworkXmlBuilder<'a> {
    name: &'a str,
    kind: NetworkKind,
    addressing: NetworkAddressing,
    static_ips: &'a StaticIps,
}

impl<'a> NetworkXmlBuilder<'a> {
    pub fn new(
        name: &'a str,
        kind: NetworkKind,
        addressing: NetworkAddressing,
        static_ips: &'a StaticIps,
    ) -> Self {
        Self {
            name,
            kind,
            addressing,
            static_ips,
        }
    }

    pub fn element(&self) -> XmlElement {
        let a = &self.addressing;

        let mut dhcp = XmlElement::new("dhcp").child(
            XmlElement::new("range")
                .attr("start", a.dhcp_start)
                .attr("end", a.dhcp_end),
        );
        for (machine, address) in self.static_ips {
            dhcp.push(dhcp_host_element(machine, address));
        }

        XmlElement::new("network")
            .child(XmlElement::new("name").text(self.name))
            .child_opt((self.kind == NetworkKind::Nat).then(forward_nat_element))
            .child(
                XmlElement::new("ip")
                    .attr("address", a.gateway)
                    .attr("netmask", a.netmask)
                    .child(dhcp),
            )
    }

    pub fn build(&self) -> crate::error::Result<String> {
        self.element().render()
    }
}

/// `<host name=".." ip=".."/>` entry of the DHCP section.
pub fn dhcp_host_element(machine: &str, address: &str) -> XmlElement {
    XmlElement::new("host").attr("name", machine).attr("ip", address)
}

/// `<forward mode="nat"/>`
pub fn forward_nat_element() -> XmlElement {
    XmlElement::new("forward").attr("mode", "nat")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addressing() -> NetworkAddressing {
        NetworkAddressing {
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dhcp_start: Ipv4Addr::new(10, 0, 0, 2),
            dhcp_end: Ipv4Addr::new(10, 0, 0, 254),
        }
    }

    #[test]
    fn test_nat_network() {
        let mut ips = StaticIps::new();
        ips.insert("web".into(), "10.0.0.10".into());
        ips.insert("db".into(), "10.0.0.11".into());

        let xml = NetworkXmlBuilder::new("lab", NetworkKind::Nat, addressing(), &ips)
            .build()
            .unwrap();

        assert_eq!(
            xml,
            concat!(
                r#"<network><name>lab</name><forward mode="nat"/>"#,
                r#"<ip address="10.0.0.1" netmask="255.255.255.0"><dhcp>"#,
                r#"<range start="10.0.0.2" end="10.0.0.254"/>"#,
                r#"<host name="db" ip="10.0.0.11"/><host name="web" ip="10.0.0.10"/>"#,
                r#"</dhcp></ip></network>"#
            )
        );
    }

    #[test]
    fn test_isolated_network_has_no_forward() {
        let ips = StaticIps::new();
        let doc = NetworkXmlBuilder::new("lab", NetworkKind::Isolated, addressing(), &ips).element();
        assert!(doc.find("forward").is_none());
        assert_eq!(doc.find("ip").unwrap().find("dhcp").unwrap().elements().count(), 1);
    }

    #[test]
    fn test_fragments() {
        assert_eq!(
            dhcp_host_element("web", "10.0.0.5").render().unwrap(),
            r#"<host name="web" ip="10.0.0.5"/>"#
        );
        assert_eq!(forward_nat_element().render().unwrap(), r#"<forward mode="nat"/>"#);
    }
}
