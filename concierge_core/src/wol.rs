//! Wake-on-LAN magic packet construction and broadcast.

use tokio::net::UdpSocket;

use crate::error::ConciergeError;

const MAGIC_PREFIX: [u8; 6] = [0xFF; 6];
const MAC_REPEAT: usize = 16;
/// Total packet length: 6 prefix bytes + 16 * 6 MAC bytes.
pub const PACKET_LEN: usize = 6 + MAC_REPEAT * 6;

/// Parses a MAC address in any of the common `:` or `-` separated forms (or
/// bare hex) into its 6 raw bytes. Casing is irrelevant.
pub fn parse_mac(mac: &str) -> Result<[u8; 6], ConciergeError> {
    let stripped: String = mac.chars().filter(|c| *c != ':' && *c != '-').collect();
    if stripped.len() != 12 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConciergeError::InvalidCommandDefinition(format!(
            "'{mac}' is not a valid MAC address"
        )));
    }
    let bytes = hex::decode(&stripped).map_err(|e| ConciergeError::InvalidCommandDefinition(e.to_string()))?;
    let mut out = [0u8; 6];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Builds the 102-byte magic packet for the given MAC.
pub fn build_packet(mac: &str) -> Result<[u8; PACKET_LEN], ConciergeError> {
    let mac_bytes = parse_mac(mac)?;
    let mut packet = [0u8; PACKET_LEN];
    packet[..6].copy_from_slice(&MAGIC_PREFIX);
    for i in 0..MAC_REPEAT {
        let start = 6 + i * 6;
        packet[start..start + 6].copy_from_slice(&mac_bytes);
    }
    Ok(packet)
}

/// Sends a Wake-on-LAN magic packet via UDP broadcast to `255.255.255.255:9`.
///
/// Success here only means the datagram was handed to the kernel — WOL has
/// no delivery confirmation.
pub async fn send(mac: &str) -> Result<(), ConciergeError> {
    let packet = build_packet(mac)?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket.send_to(&packet, "255.255.255.255:9").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_has_correct_shape() {
        let packet = build_packet("11:22:33:44:55:66").unwrap();
        assert_eq!(packet.len(), PACKET_LEN);
        assert_eq!(&packet[0..6], &[0xFF; 6]);
        let mac = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        for i in 0..MAC_REPEAT {
            let start = 6 + i * 6;
            assert_eq!(&packet[start..start + 6], &mac);
        }
    }

    #[test]
    fn accepts_dash_separated_and_mixed_case() {
        let packet = build_packet("AA-bb-11-22-FF-00").unwrap();
        assert_eq!(&packet[6..12], &[0xAA, 0xBB, 0x11, 0x22, 0xFF, 0x00]);
    }

    #[test]
    fn rejects_malformed_mac() {
        assert!(build_packet("not-a-mac").is_err());
        assert!(build_packet("11:22:33:44:55").is_err());
    }
}
