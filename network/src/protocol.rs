use room_core::{Envelope, Error};

/// Largest message accepted from a peer. Canvas images dominate the size.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Serialize an envelope to its JSON wire form
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(envelope)
        .map_err(|e| Error::Serialization(format!("Failed to encode {}: {}", envelope.kind(), e)))
}

/// Parse one complete message. Malformed or unknown messages are protocol errors.
pub fn decode(bytes: &[u8]) -> Result<Envelope, Error> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!(
            "Message of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    serde_json::from_slice(bytes)
        .map_err(|e| Error::Protocol(format!("Failed to decode envelope: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_core::{PeerId, PeerList, PlayerLeft};

    #[test]
    fn encode_then_decode_peer_list() {
        let original = Envelope::PeerList(PeerList {
            peers: vec![PeerId::new("a"), PeerId::new("b")],
        });

        let bytes = encode(&original).expect("Encoding failed");
        assert_eq!(decode(&bytes).expect("Decoding failed"), original);
    }

    #[test]
    fn decode_accepts_foreign_json() {
        let raw = br#"{"type":"PlayerLeft","data":{"id":"p-1"}}"#;
        assert_eq!(
            decode(raw).unwrap(),
            Envelope::PlayerLeft(PlayerLeft {
                id: PeerId::new("p-1")
            })
        );
    }

    #[test]
    fn malformed_input_is_a_protocol_error() {
        assert!(matches!(decode(b"{not json"), Err(Error::Protocol(_))));
        assert!(matches!(
            decode(br#"{"type":"PlayerMove","data":{"rotation":1}}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn oversized_input_is_rejected() {
        let bytes = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(decode(&bytes), Err(Error::Protocol(_))));
    }
}
