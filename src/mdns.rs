/*! mDNS service-name convention: `_openlcb-can._tcp.local.`.

An LCC node advertises itself as a TCP mDNS service whose instance name
ends in its 12-hex-digit NodeID, per spec.md §4.6/§6, e.g.:

```text
my_gateway_02015700049C._openlcb-can._tcp.local.
```
*/
use crate::node_id::NodeID;

/// The mDNS service type LCC gateways advertise under.
pub const SERVICE_TYPE: &str = "_openlcb-can._tcp.local.";

/// Extract the 12-hex-digit NodeID suffix from a service instance name
/// of the form `[prefix_]..._<12hex>._openlcb-can._tcp.local.`.
///
/// Case-insensitive on the hex portion. Returns `None` if no 12-hex
/// suffix is present immediately before the service type.
pub fn id_from_tcp_service_name(name: &str) -> Option<NodeID> {
    let instance = name.strip_suffix(SERVICE_TYPE)?;
    let instance = instance.strip_suffix('.').unwrap_or(instance);
    let hex = match instance.rsplit_once('_') {
        Some((_, last)) => last,
        None => instance,
    };
    if hex.len() != 12 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut bytes = [0u8; 6];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        bytes[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(NodeID::from_bytes(bytes))
}

/// Build a service instance name for `id`, the inverse of
/// [`id_from_tcp_service_name`]. With `prefix`, the name is
/// `<prefix>_<12hex>.<SERVICE_TYPE>`; without one, just
/// `<12hex>.<SERVICE_TYPE>`.
pub fn tcp_service_name(prefix: Option<&str>, id: NodeID) -> String {
    let hex: String = id.to_bytes().iter().map(|b| format!("{b:02X}")).collect();
    match prefix {
        Some(p) => format!("{p}_{hex}.{SERVICE_TYPE}"),
        None => format!("{hex}.{SERVICE_TYPE}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_suffix_with_prefix() {
        let id = id_from_tcp_service_name("my_gateway_02015700049C._openlcb-can._tcp.local.").unwrap();
        assert_eq!(id.to_string(), "02.01.57.00.04.9C");
    }

    #[test]
    fn extracts_suffix_without_prefix() {
        let id = id_from_tcp_service_name("02015700049C._openlcb-can._tcp.local.").unwrap();
        assert_eq!(id.to_string(), "02.01.57.00.04.9C");
    }

    #[test]
    fn case_insensitive_hex() {
        let id = id_from_tcp_service_name("gw_02015700049c._openlcb-can._tcp.local.").unwrap();
        assert_eq!(id.to_string(), "02.01.57.00.04.9C");
    }

    #[test]
    fn rejects_wrong_service_type() {
        assert!(id_from_tcp_service_name("gw_02015700049C._other._tcp.local.").is_none());
    }

    #[test]
    fn rejects_non_hex_suffix() {
        assert!(id_from_tcp_service_name("gw_ZZ015700049C._openlcb-can._tcp.local.").is_none());
    }

    #[test]
    fn builds_and_round_trips() {
        let id = NodeID::from_dotted("02.01.57.00.04.9C").unwrap();
        let name = tcp_service_name(Some("my_gateway"), id);
        assert_eq!(name, "my_gateway_02015700049C._openlcb-can._tcp.local.");
        assert_eq!(id_from_tcp_service_name(&name), Some(id));

        let name2 = tcp_service_name(None, id);
        assert_eq!(id_from_tcp_service_name(&name2), Some(id));
    }
}
