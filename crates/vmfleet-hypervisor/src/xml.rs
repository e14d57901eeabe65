//! libvirt XML documents.
//!
//! Builds the domain and DHCP host documents vmfleet hands to libvirt, and
//! reads back the parts of `net-dumpxml` output the lease synchronizer needs.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use crate::types::{DomainSpec, Lease, NetworkInfo};
use crate::{HypervisorError, Result};

/// Escape a value for use inside a single-quoted XML attribute or text node.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Render the domain definition for a VM.
///
/// The main disk is attached as `vda` (qcow2), the boot payload as `vdb` (raw).
#[must_use]
pub fn domain_xml(spec: &DomainSpec) -> String {
    let mut xml = String::new();
    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&spec.name));
    let _ = writeln!(xml, "  <memory unit='MiB'>{}</memory>", spec.memory_mb);
    let _ = writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", spec.vcpus);
    xml.push_str("  <os>\n    <type arch='x86_64' machine='pc'>hvm</type>\n    <boot dev='hd'/>\n  </os>\n");
    xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");
    xml.push_str("  <cpu mode='host-passthrough'/>\n");
    xml.push_str("  <on_poweroff>destroy</on_poweroff>\n");
    xml.push_str("  <on_reboot>restart</on_reboot>\n");
    xml.push_str("  <on_crash>preserve</on_crash>\n");
    xml.push_str("  <devices>\n");
    let _ = writeln!(
        xml,
        "    <disk type='file' device='disk'>\n      <driver name='qemu' type='qcow2'/>\n      <source file='{}'/>\n      <target dev='vda' bus='virtio'/>\n    </disk>",
        escape(&spec.disk.path)
    );
    let _ = writeln!(
        xml,
        "    <disk type='file' device='disk'>\n      <driver name='qemu' type='raw'/>\n      <source file='{}'/>\n      <target dev='vdb' bus='virtio'/>\n      <readonly/>\n    </disk>",
        escape(&spec.payload.path)
    );
    let _ = writeln!(
        xml,
        "    <interface type='network'>\n      <mac address='{}'/>\n      <source network='{}'/>\n      <model type='virtio'/>\n    </interface>",
        escape(&spec.mac),
        escape(&spec.network)
    );
    xml.push_str("    <serial type='pty'>\n      <target port='0'/>\n    </serial>\n");
    xml.push_str("    <console type='pty'>\n      <target type='serial' port='0'/>\n    </console>\n");
    xml.push_str("  </devices>\n");
    xml.push_str("</domain>\n");
    xml
}

/// Render the `ip-dhcp-host` element used by `net-update`.
#[must_use]
pub fn host_xml(lease: &Lease) -> String {
    format!(
        "<host mac='{}' name='{}' ip='{}'/>",
        escape(&lease.mac),
        escape(&lease.name),
        lease.ip
    )
}

/// Find every start tag named `tag` in `xml`, returning the raw tag bodies.
fn tags<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}");
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        // Reject longer tag names sharing the prefix (`<hostdev` for `<host`).
        if !after.starts_with(|c: char| c.is_whitespace() || c == '/' || c == '>') {
            rest = after;
            continue;
        }
        let Some(end) = after.find('>') else {
            break;
        };
        found.push(&after[..end]);
        rest = &after[end..];
    }
    found
}

/// Read an attribute value from a raw tag body.
fn attr(body: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let needle = format!("{name}={quote}");
        let mut rest = body;
        while let Some(pos) = rest.find(&needle) {
            let preceded_ok = pos == 0 || rest[..pos].ends_with(char::is_whitespace);
            let value_start = &rest[pos + needle.len()..];
            if preceded_ok {
                let end = value_start.find(quote)?;
                return Some(unescape(&value_start[..end]));
            }
            rest = value_start;
        }
    }
    None
}

fn parse_ip(value: Option<String>, what: &str) -> Result<Ipv4Addr> {
    let value = value.ok_or_else(|| HypervisorError::Parse(format!("missing {what}")))?;
    value
        .parse()
        .map_err(|_| HypervisorError::Parse(format!("invalid {what} '{value}'")))
}

/// Parse the network name, DHCP range and static hosts out of `net-dumpxml`.
///
/// # Errors
///
/// Returns `HypervisorError::Parse` if the network has no IPv4 DHCP range or a
/// host entry carries an invalid address.
pub fn parse_network_xml(xml: &str) -> Result<NetworkInfo> {
    let name = xml
        .find("<name>")
        .and_then(|start| {
            let rest = &xml[start + "<name>".len()..];
            rest.find("</name>").map(|end| unescape(rest[..end].trim()))
        })
        .ok_or_else(|| HypervisorError::Parse("network has no name".to_string()))?;

    let range = tags(xml, "range")
        .into_iter()
        .find(|body| attr(body, "start").is_some_and(|s| s.parse::<Ipv4Addr>().is_ok()))
        .ok_or_else(|| HypervisorError::Parse(format!("network {name} has no IPv4 DHCP range")))?;
    let range_start = parse_ip(attr(range, "start"), "range start")?;
    let range_end = parse_ip(attr(range, "end"), "range end")?;

    let mut leases = Vec::new();
    for body in tags(xml, "host") {
        let (Some(mac), Some(host)) = (attr(body, "mac"), attr(body, "name")) else {
            // IPv6 or id-based hosts are not ours.
            continue;
        };
        leases.push(Lease {
            name: host,
            mac,
            ip: parse_ip(attr(body, "ip"), "host ip")?,
        });
    }

    Ok(NetworkInfo {
        name,
        range_start,
        range_end,
        leases,
    })
}
