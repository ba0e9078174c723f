//! Libvirt domain XML synthesis.

use super::{interface_element, XmlElement};
use crate::error::{Result, VirtdError};
use crate::types::MachineSpec;

/// Target device of the machine's root disk.
const ROOT_DISK_TARGET: &str = "hda";

/// Builder for libvirt domain XML.
///
/// Pure: the same inputs always render to the same bytes.
pub struct DomainXmlBuilder<'a> {
    spec: &'a MachineSpec,
    machine_id: &'a str,
    emulator: &'a str,
    volume_path: &'a str,
    primary: Option<(&'a str, &'a str)>,
}

impl<'a> DomainXmlBuilder<'a> {
    /// Create a builder for `spec`, naming the domain `machine_id`.
    pub fn new(
        spec: &'a MachineSpec,
        machine_id: &'a str,
        emulator: &'a str,
        volume_path: &'a str,
    ) -> Self {
        Self {
            spec,
            machine_id,
            emulator,
            volume_path,
            primary: None,
        }
    }

    /// Pin `mac` on the interface bound to network `primary_net`.
    pub fn with_primary(mut self, primary_net: &'a str, mac: &'a str) -> Self {
        self.primary = Some((primary_net, mac));
        self
    }

    /// Build the domain element tree.
    pub fn element(&self) -> XmlElement {
        XmlElement::new("domain")
            .attr("type", &self.spec.domain_type)
            .child(XmlElement::new("name").text(self.machine_id))
            .child(XmlElement::new("memory").attr("unit", "MiB").text(self.spec.memory_size))
            .child(XmlElement::new("vcpu").text(self.spec.vcpu))
            .child(self.os())
            .child(self.devices())
            .raw(&self.spec.extra_domain_xml)
    }

    /// Build the domain XML string.
    pub fn build(&self) -> Result<String> {
        self.element().render()
    }

    fn os(&self) -> XmlElement {
        let os = XmlElement::new("os")
            .child(XmlElement::new("type").attr("arch", "x86_64").text("hvm"));

        if self.spec.kernel.is_empty() {
            return os.child(XmlElement::new("boot").attr("dev", "hd"));
        }

        os.child(XmlElement::new("kernel").text(&self.spec.kernel))
            .child(XmlElement::new("initrd").text(&self.spec.initrd))
            .child(XmlElement::new("cmdline").text(&self.spec.cmdline))
    }

    fn devices(&self) -> XmlElement {
        let mut devices = XmlElement::new("devices")
            .child(XmlElement::new("emulator").text(self.emulator))
            .child(
                XmlElement::new("disk")
                    .attr("type", "file")
                    .attr("device", "disk")
                    .child(XmlElement::new("driver").attr("name", "qemu").attr("type", "qcow2"))
                    .child(XmlElement::new("source").attr("file", self.volume_path))
                    .child(XmlElement::new("target").attr("dev", ROOT_DISK_TARGET)),
            );

        // Only the first interface on the primary network keeps the stable MAC.
        let mut mac_pending = self.primary;
        for net in &self.spec.networks {
            let mac = match mac_pending {
                Some((primary, mac)) if net.network_name() == primary => {
                    mac_pending = None;
                    Some(mac)
                }
                _ => None,
            };
            devices.push(interface_element(net, mac));
        }

        if !self.spec.headless {
            devices.push(
                XmlElement::new("graphics")
                    .attr("type", "vnc")
                    .attr("port", "-1")
                    .attr("autoport", "yes"),
            );
        }

        devices
            .child(XmlElement::new("input").attr("type", "keyboard").attr("bus", "usb"))
            .child(XmlElement::new("input").attr("type", "mouse").attr("bus", "usb"))
            .raw(&self.spec.extra_devices_xml)
    }
}

/// Extract the emulator binary path from a domain capabilities document.
pub fn emulator_from_capabilities(caps_xml: &str) -> Result<String> {
    let caps = XmlElement::parse(caps_xml)?;
    let path = caps
        .find("path")
        .map(|p| p.text_content().trim().to_string())
        .unwrap_or_default();

    if path.is_empty() {
        return Err(VirtdError::Xml(
            "domain capabilities do not name an emulator binary".to_string(),
        ));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetworkRef, VirtualPort};

    const EMULATOR: &str = "/run/current-system/sw/bin/qemu-system-x86_64";
    const VOLUME: &str = "/var/lib/libvirt/images/nixops-1-web.qcow2";
    const MAC: &str = "52:54:00:12:34:56";

    fn render(spec: &MachineSpec) -> String {
        DomainXmlBuilder::new(spec, "nixops-1-web", EMULATOR, VOLUME)
            .with_primary(spec.networks[0].network_name(), MAC)
            .build()
            .unwrap()
    }

    fn parsed(spec: &MachineSpec) -> XmlElement {
        XmlElement::parse(&render(spec)).unwrap()
    }

    #[test]
    fn test_basic_xml_generation() {
        let spec = MachineSpec::new("web")
            .with_vcpu(2)
            .with_memory(1024)
            .with_headless(true)
            .with_networks(vec![NetworkRef::Named("default".into())]);

        let xml = render(&spec);

        assert!(xml.starts_with(r#"<domain type="kvm">"#));
        assert!(xml.contains("<name>nixops-1-web</name>"));
        assert!(xml.contains(r#"<memory unit="MiB">1024</memory>"#));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(!xml.contains("<kernel>"));
        assert!(xml.contains(r#"<boot dev="hd"/>"#));
        assert!(!xml.contains("<graphics"));
        assert!(xml.contains(&format!("<emulator>{}</emulator>", EMULATOR)));
        assert!(xml.contains(&format!(r#"<source file="{}"/>"#, VOLUME)));
        assert!(xml.contains(r#"<target dev="hda"/>"#));
        assert!(xml.contains(
            r#"<interface type="network"><source network="default"/><model type="virtio"/><mac address="52:54:00:12:34:56"/></interface>"#
        ));
    }

    #[test]
    fn test_direct_kernel_boot() {
        let mut spec = MachineSpec::new("web");
        spec.kernel = "/nix/store/k/bzImage".into();
        spec.initrd = "/nix/store/k/initrd".into();
        spec.cmdline = "console=ttyS0 init=/nix/store/s/init".into();

        let doc = parsed(&spec);
        let os = doc.find("os").unwrap();

        assert_eq!(os.find("type").unwrap().attribute("arch"), Some("x86_64"));
        assert_eq!(os.find("kernel").unwrap().text_content(), "/nix/store/k/bzImage");
        assert_eq!(os.find("initrd").unwrap().text_content(), "/nix/store/k/initrd");
        assert_eq!(
            os.find("cmdline").unwrap().text_content(),
            "console=ttyS0 init=/nix/store/s/init"
        );
        assert!(os.find("boot").is_none());
    }

    #[test]
    fn test_graphics_only_when_not_headless() {
        let headed = MachineSpec::new("web").with_headless(false);
        let headless = MachineSpec::new("web").with_headless(true);

        let count = |spec: &MachineSpec| {
            parsed(spec).find("devices").unwrap().elements_named("graphics").count()
        };

        assert_eq!(count(&headed), 1);
        assert_eq!(count(&headless), 0);
    }

    #[test]
    fn test_one_interface_per_network_in_order() {
        let spec = MachineSpec::new("web").with_networks(vec![
            NetworkRef::Nat { name: "net1".into() },
            NetworkRef::Direct {
                device: "eth0".into(),
                mode: crate::types::DirectMode::Bridge,
                virtualport: None,
            },
            NetworkRef::Bridge {
                bridge: "br0".into(),
                virtualport: Some(VirtualPort::new("openvswitch")),
            },
            NetworkRef::Named("default".into()),
        ]);

        let doc = parsed(&spec);
        let ifaces: Vec<&XmlElement> = doc.find("devices").unwrap().elements_named("interface").collect();

        let types: Vec<&str> = ifaces.iter().map(|i| i.attribute("type").unwrap()).collect();
        assert_eq!(types, vec!["network", "direct", "bridge", "network"]);

        let with_mac: Vec<usize> = ifaces
            .iter()
            .enumerate()
            .filter(|(_, i)| i.find("mac").is_some())
            .map(|(n, _)| n)
            .collect();
        assert_eq!(with_mac, vec![0]);
        assert_eq!(ifaces[0].find("mac").unwrap().attribute("address"), Some(MAC));
    }

    #[test]
    fn test_duplicate_primary_gets_mac_once() {
        let spec = MachineSpec::new("web").with_networks(vec![
            NetworkRef::Named("default".into()),
            NetworkRef::Named("default".into()),
        ]);
        assert_eq!(render(&spec).matches("<mac ").count(), 1);
    }

    #[test]
    fn test_inputs_and_escape_hatches() {
        let mut spec = MachineSpec::new("web");
        spec.extra_devices_xml = "<rng model='virtio'><backend model='random'>/dev/urandom</backend></rng>".into();
        spec.extra_domain_xml = "<features><acpi/></features>".into();

        let xml = render(&spec);
        assert!(xml.contains(r#"<input type="keyboard" bus="usb"/><input type="mouse" bus="usb"/>"#));
        assert!(xml.contains("<backend model='random'>/dev/urandom</backend></rng></devices>"));
        assert!(xml.ends_with("</devices><features><acpi/></features></domain>"));

        let doc = XmlElement::parse(&xml).unwrap();
        assert!(doc.find("devices").unwrap().find("rng").is_some());
        assert!(doc.find("features").is_some());
    }

    #[test]
    fn test_output_is_deterministic() {
        let spec = MachineSpec::new("web").with_networks(vec![
            NetworkRef::Named("default".into()),
            NetworkRef::Bridge {
                bridge: "br0".into(),
                virtualport: Some(
                    VirtualPort::new("802.1Qbh")
                        .with_parameter("profileid", "a")
                        .with_parameter("instanceid", "b"),
                ),
            },
        ]);
        assert_eq!(render(&spec), render(&spec));
    }

    #[test]
    fn test_emulator_from_capabilities() {
        let caps = r#"<domainCapabilities>
  <path>
    /usr/bin/qemu-system-x86_64
  </path>
  <domain>kvm</domain>
  <machine>pc-i440fx-8.0</machine>
  <arch>x86_64</arch>
</domainCapabilities>"#;
        assert_eq!(emulator_from_capabilities(caps).unwrap(), "/usr/bin/qemu-system-x86_64");
        assert!(emulator_from_capabilities("<domainCapabilities/>").is_err());
    }
}
