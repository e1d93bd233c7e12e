use ipnetwork::Ipv6Network;
use macaddr::MacAddr6;
use std::net::Ipv6Addr;

/// Derive a stable IPv6 address for `mac` inside `prefix`.
///
/// For prefixes up to /64 this is classic EUI-64: the MAC is split around
/// an inserted `ff:fe` and the universal/local bit is flipped. Longer
/// prefixes up to /80 still leave 48 free bits, so the MAC is placed in the
/// trailing six bytes unchanged. Beyond /80 the MAC no longer fits and the
/// caller has to fall back to sequential allocation.
pub fn eui64_address(prefix: Ipv6Network, mac: MacAddr6) -> Option<Ipv6Addr> {
    if prefix.prefix() > 80 {
        return None;
    }
    let mut octets = prefix.network().octets();
    let mac = mac.into_array();
    if prefix.prefix() <= 64 {
        octets[8] = mac[0] ^ 0x02;
        octets[9] = mac[1];
        octets[10] = mac[2];
        octets[11] = 0xff;
        octets[12] = 0xfe;
        octets[13] = mac[3];
        octets[14] = mac[4];
        octets[15] = mac[5];
    } else {
        octets[10..16].copy_from_slice(&mac);
    }
    Some(Ipv6Addr::from(octets))
}
