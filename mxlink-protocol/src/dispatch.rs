//! Inbound message decode and dispatch.
//!
//! Takes one validated frame from the [`crate::FrameAssembler`], extracts
//! the header fields, detects the protocol sub-version, and routes the
//! payload to a decoder keyed by message identifier. A handful of
//! identifiers are contextually overloaded and need a payload-derived
//! discriminator before the decoder lookup; those rules live in
//! [`discriminator_for`].

use crate::error::ProtocolError;
use crate::message::{self, id, Body};
use crate::{END_MARKER, LEGACY_SCHEMA, MIN_FRAME_LEN, START_MARKER, V2_MARKER};
use bytes::Bytes;
use std::collections::HashMap;

/// Protocol sub-version detected from the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoVersion {
    /// Legacy framing: payload begins immediately after the flags byte.
    V1,
    /// Newer framing: the `MXP2` marker follows the flags byte, then a
    /// one-byte schema number, then the payload.
    V2,
}

/// A decoded inbound message.
///
/// Immutable once produced; ownership passes to whichever pending request it
/// completes and to every subscribed observer.
#[derive(Debug, Clone)]
pub struct Reply {
    /// The complete frame as received, markers included.
    pub raw: Bytes,
    /// Total frame length in bytes.
    pub len: usize,
    /// Message identifier.
    pub message_id: u16,
    /// One-byte flag set following the message id.
    pub flags: u8,
    /// Detected protocol sub-version.
    pub version: ProtoVersion,
    /// Schema number (from the v2 header, or [`LEGACY_SCHEMA`] on v1).
    pub schema: u8,
    /// Payload bytes with header and trailer stripped.
    pub payload: Bytes,
    /// Decoded payload, when a decoder exists and the payload satisfies it.
    /// Unknown message identifiers are not an error; they simply carry no
    /// body.
    pub body: Option<Body>,
}

/// Decoder signature: payload bytes in, tagged body out. Returning `None`
/// means the payload was too short or malformed for the declared type; the
/// reply is still delivered, just without a body.
pub type DecodeFn = fn(&[u8]) -> Option<Body>;

/// Pluggable decoder table keyed by `(message id, optional discriminator)`.
///
/// Most identifiers map one-to-one to a layout and register with no
/// discriminator. Overloaded identifiers register one decoder per
/// discriminator value; [`discriminator_for`] derives the value from the
/// payload before lookup.
pub struct DecoderRegistry {
    map: HashMap<(u16, Option<u8>), DecodeFn>,
}

impl DecoderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Creates a registry preloaded with the built-in decoders.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(id::PONG, None, message::decode_pong);
        registry.register(id::DEVICE_INFO, None, message::decode_device_info);
        // Shared request/reply identifier: inbound is always the reply.
        registry.register(id::CROSSPOINT, None, message::decode_crosspoint);
        registry.register(
            id::PORT_LIST,
            Some(message::PORT_LABEL_ENTRY_LEN as u8),
            message::decode_port_labels,
        );
        registry.register(
            id::PORT_LIST,
            Some(message::PORT_GAIN_ENTRY_LEN as u8),
            message::decode_port_gains,
        );
        registry.register(id::SUBSYS_STATUS, None, message::decode_subsystem_status);
        registry.register(
            id::ALARM,
            Some(message::Alarm::KIND_SIGNAL_LOST),
            message::decode_alarm_signal_lost,
        );
        registry.register(
            id::ALARM,
            Some(message::Alarm::KIND_SYNC_LOST),
            message::decode_alarm_sync_lost,
        );
        registry.register(
            id::ALARM,
            Some(message::Alarm::KIND_OVERLOAD),
            message::decode_alarm_overload,
        );
        registry
    }

    /// Registers (or replaces) a decoder for an identifier.
    pub fn register(&mut self, message_id: u16, discriminator: Option<u8>, decode: DecodeFn) {
        self.map.insert((message_id, discriminator), decode);
    }

    /// Returns whether any decoder is registered for an identifier.
    pub fn knows(&self, message_id: u16) -> bool {
        self.map.keys().any(|(m, _)| *m == message_id)
    }

    /// Decodes a payload for the given identifier, applying the
    /// disambiguation rules for overloaded identifiers first.
    pub fn decode(&self, message_id: u16, payload: &[u8]) -> Option<Body> {
        let discriminator = discriminator_for(message_id, payload);
        if let Some(decode) = self.map.get(&(message_id, discriminator)) {
            return decode(payload);
        }
        if discriminator.is_some() {
            // Fall back to an undiscriminated decoder if one was registered.
            if let Some(decode) = self.map.get(&(message_id, None)) {
                return decode(payload);
            }
        }
        None
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Derives the discriminator for contextually overloaded identifiers.
///
/// Rules, in the order the protocol documents them:
/// - [`id::PORT_LIST`] is shared between two entry-list shapes; the entry
///   size implied by `(payload − header) / count` selects the decoder. An
///   empty list carries no shape evidence and resolves to the label (8-byte)
///   shape by rule; a size matching neither known layout yields no
///   discriminator and therefore no body.
/// - [`id::ALARM`] is reused for three distinct replies selected by the
///   literal value of the byte at payload offset 2.
///
/// The crosspoint request/reply overload needs no discriminator (direction
/// is unambiguous on the wire), and the subsystem sub-id sniffing happens
/// inside its decoder, so neither appears here.
pub fn discriminator_for(message_id: u16, payload: &[u8]) -> Option<u8> {
    match message_id {
        id::PORT_LIST => {
            let count =
                u16::from_be_bytes([*payload.first()?, *payload.get(1)?]) as usize;
            let body_len = payload.len().checked_sub(message::PORT_LIST_HEADER_LEN)?;
            if count == 0 {
                return (body_len == 0).then_some(message::PORT_LABEL_ENTRY_LEN as u8);
            }
            if body_len == count * message::PORT_LABEL_ENTRY_LEN {
                Some(message::PORT_LABEL_ENTRY_LEN as u8)
            } else if body_len == count * message::PORT_GAIN_ENTRY_LEN {
                Some(message::PORT_GAIN_ENTRY_LEN as u8)
            } else {
                None
            }
        }
        id::ALARM => payload.get(2).copied(),
        _ => None,
    }
}

/// Decodes one assembled frame into a [`Reply`].
///
/// The assembler guarantees marker placement and the length invariant, so
/// the error cases here only fire when a caller feeds hand-built bytes.
pub fn decode_reply(frame: &Bytes, registry: &DecoderRegistry) -> Result<Reply, ProtocolError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(ProtocolError::FrameTooShort {
            len: frame.len(),
            min: MIN_FRAME_LEN,
        });
    }
    if frame[..2] != START_MARKER {
        return Err(ProtocolError::MissingStartMarker);
    }
    if frame[frame.len() - 2..] != END_MARKER {
        return Err(ProtocolError::MissingEndMarker);
    }

    let message_id = u16::from_be_bytes([frame[4], frame[5]]);
    let flags = frame[6];

    let marker_end = 7 + V2_MARKER.len();
    let (version, schema, payload_start) =
        if frame.len() >= marker_end + 1 + 2 && frame[7..marker_end] == V2_MARKER {
            (ProtoVersion::V2, frame[marker_end], marker_end + 1)
        } else {
            (ProtoVersion::V1, LEGACY_SCHEMA, 7)
        };

    let payload = frame.slice(payload_start..frame.len() - 2);
    let body = registry.decode(message_id, &payload);
    if body.is_none() && registry.knows(message_id) {
        tracing::debug!(message_id, len = payload.len(), "payload did not decode");
    }

    Ok(Reply {
        raw: frame.clone(),
        len: frame.len(),
        message_id,
        flags,
        version,
        schema,
        payload,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, encode_frame_v2};
    use crate::message::{Alarm, Subsystem, SubsystemStatus};

    fn decode(frame: bytes::BytesMut) -> Reply {
        let registry = DecoderRegistry::with_defaults();
        decode_reply(&frame.freeze(), &registry).unwrap()
    }

    #[test]
    fn test_legacy_version_detected() {
        let reply = decode(encode_frame(id::PONG, 0x00, &[]).unwrap());
        assert_eq!(reply.version, ProtoVersion::V1);
        assert_eq!(reply.schema, LEGACY_SCHEMA);
        assert_eq!(reply.body, Some(Body::Pong));
        assert!(reply.payload.is_empty());
    }

    #[test]
    fn test_v2_version_detected() {
        let payload = {
            let mut p = 3u16.to_be_bytes().to_vec();
            p.extend_from_slice(&9u16.to_be_bytes());
            p.push(1);
            p
        };
        let reply = decode(encode_frame_v2(id::CROSSPOINT, 0x40, 2, &payload).unwrap());
        assert_eq!(reply.version, ProtoVersion::V2);
        assert_eq!(reply.schema, 2);
        assert_eq!(reply.flags, 0x40);
        assert_eq!(&reply.payload[..], &payload[..]);
        assert!(matches!(reply.body, Some(Body::Crosspoint(_))));
    }

    #[test]
    fn test_marker_bytes_at_offset_always_mean_v2() {
        // The marker bytes are reserved at that offset; a frame carrying
        // them is a v2 frame regardless of how it was built.
        let mut payload = V2_MARKER.to_vec();
        payload.push(0x05);
        let reply = decode(encode_frame(0x7777, 0x00, &payload).unwrap());
        assert_eq!(reply.version, ProtoVersion::V2);
        assert_eq!(reply.schema, 0x05);
    }

    #[test]
    fn test_unknown_message_id_has_no_body() {
        let reply = decode(encode_frame(0x6EEF, 0x00, &[1, 2, 3]).unwrap());
        assert_eq!(reply.message_id, 0x6EEF);
        assert!(reply.body.is_none());
        assert_eq!(&reply.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn test_known_id_short_payload_has_no_body() {
        let reply = decode(encode_frame(id::DEVICE_INFO, 0x00, &[0; 4]).unwrap());
        assert!(reply.body.is_none());
    }

    #[test]
    fn test_port_list_resolves_label_shape() {
        let mut payload = 2u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&[0; 16]); // 2 entries x 8 bytes
        let reply = decode(encode_frame(id::PORT_LIST, 0x00, &payload).unwrap());
        assert!(matches!(reply.body, Some(Body::PortLabels(ref v)) if v.len() == 2));
    }

    #[test]
    fn test_port_list_resolves_gain_shape() {
        let mut payload = 2u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&[0; 8]); // 2 entries x 4 bytes
        let reply = decode(encode_frame(id::PORT_LIST, 0x00, &payload).unwrap());
        assert!(matches!(reply.body, Some(Body::PortGains(ref v)) if v.len() == 2));
    }

    #[test]
    fn test_port_list_empty_resolves_labels() {
        let mut payload = 0u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0, 0]);
        let reply = decode(encode_frame(id::PORT_LIST, 0x00, &payload).unwrap());
        assert_eq!(reply.body, Some(Body::PortLabels(Vec::new())));
    }

    #[test]
    fn test_port_list_unresolvable_entry_size() {
        let mut payload = 2u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&[0; 10]); // 5 bytes per entry: neither shape
        let reply = decode(encode_frame(id::PORT_LIST, 0x00, &payload).unwrap());
        assert!(reply.body.is_none());
    }

    #[test]
    fn test_alarm_discriminator_routing() {
        for (kind, source) in [
            (Alarm::KIND_SIGNAL_LOST, 11u16),
            (Alarm::KIND_SYNC_LOST, 12),
            (Alarm::KIND_OVERLOAD, 13),
        ] {
            let mut payload = source.to_be_bytes().to_vec();
            payload.push(kind);
            payload.extend_from_slice(&[0, 0]);
            let reply = decode(encode_frame(id::ALARM, 0x00, &payload).unwrap());
            let Some(Body::Alarm(alarm)) = reply.body else {
                panic!("expected alarm body for kind {kind}");
            };
            let got = match alarm {
                Alarm::SignalLost { source, .. } => (Alarm::KIND_SIGNAL_LOST, source),
                Alarm::SyncLost { source, .. } => (Alarm::KIND_SYNC_LOST, source),
                Alarm::Overload { source, .. } => (Alarm::KIND_OVERLOAD, source),
            };
            assert_eq!(got, (kind, source));
        }
    }

    #[test]
    fn test_alarm_unknown_kind_has_no_body() {
        let mut payload = 1u16.to_be_bytes().to_vec();
        payload.push(0x44);
        let reply = decode(encode_frame(id::ALARM, 0x00, &payload).unwrap());
        assert!(reply.body.is_none());
    }

    #[test]
    fn test_subsystem_status_through_dispatch() {
        let reply = decode(encode_frame(id::SUBSYS_STATUS, 0x00, &[0x02, 0x01]).unwrap());
        assert_eq!(
            reply.body,
            Some(Body::SubsystemStatus(SubsystemStatus {
                subsystem: Subsystem::Fan,
                status: 1,
            }))
        );
    }

    #[test]
    fn test_custom_decoder_registration() {
        fn decode_blink(payload: &[u8]) -> Option<Body> {
            payload.first().map(|_| Body::Pong)
        }

        let mut registry = DecoderRegistry::with_defaults();
        registry.register(0x0099, None, decode_blink);

        let frame = encode_frame(0x0099, 0x00, &[1]).unwrap().freeze();
        let reply = decode_reply(&frame, &registry).unwrap();
        assert_eq!(reply.body, Some(Body::Pong));
    }

    #[test]
    fn test_frame_too_short_rejected() {
        let registry = DecoderRegistry::with_defaults();
        let frame = Bytes::from_static(&[0xA7, 0x55, 0x00, 0x04, 0x55, 0xA7]);
        let result = decode_reply(&frame, &registry);
        assert!(matches!(result, Err(ProtocolError::FrameTooShort { .. })));
    }

    #[test]
    fn test_missing_markers_rejected() {
        let registry = DecoderRegistry::with_defaults();

        let mut bad = encode_frame(id::PONG, 0, &[]).unwrap();
        bad[0] = 0x00;
        assert!(matches!(
            decode_reply(&bad.freeze(), &registry),
            Err(ProtocolError::MissingStartMarker)
        ));

        let mut bad = encode_frame(id::PONG, 0, &[]).unwrap();
        let last = bad.len() - 1;
        bad[last] = 0x00;
        assert!(matches!(
            decode_reply(&bad.freeze(), &registry),
            Err(ProtocolError::MissingEndMarker)
        ));
    }
}
