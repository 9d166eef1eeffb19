use crate::hash_id::Id20;
use rand::RngCore;

/// Two-letter client code agents put in their peer ids.
pub const KRAKEN_CLIENT_CODE: [u8; 2] = *b"KR";

/// Returns `None` for numbers greater than 63
fn version_digit_to_id(d: u8) -> Option<u8> {
    let version_map = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz.-";
    version_map.get(d as usize).copied()
}

/// Generate a peer id in the Azureus format, where `b"-xx1234-"` corresponds to version `1.2.3.4`
/// of the client abbreviated by `xx`, followed by 12 random bytes.
pub fn generate_azureus_style(client: [u8; 2], version: (u8, u8, u8, u8)) -> Id20 {
    let mut fingerprint = [b'-'; 8];

    fingerprint[1..3].copy_from_slice(&client);
    for (slot, v) in fingerprint[3..7]
        .iter_mut()
        .zip([version.0, version.1, version.2, version.3])
    {
        *slot = version_digit_to_id(v).unwrap_or(b'-');
    }
    generate_peer_id(&fingerprint)
}

/// The first bytes of the id are `fingerprint` (at most 20), the rest are random.
pub fn generate_peer_id(fingerprint: &[u8]) -> Id20 {
    let mut peer_id = [0u8; 20];
    let fp_len = fingerprint.len().min(20);

    peer_id[..fp_len].copy_from_slice(&fingerprint[..fp_len]);
    rand::rng().fill_bytes(&mut peer_id[fp_len..]);

    Id20::new(peer_id)
}
