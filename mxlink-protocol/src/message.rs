//! Representative MXP payload layouts.
//!
//! The matrix firmware defines on the order of sixty message types; each is
//! a fixed-layout mapping with no algorithmic content, so only the subset
//! needed by the client facade (and by the dispatch disambiguation rules)
//! is decoded here. Everything else arrives as a [`crate::Reply`] with raw
//! payload bytes and no decoded body, and can be slotted into the
//! [`crate::DecoderRegistry`] by downstream code.

/// Well-known MXP message identifiers.
pub mod id {
    /// Keep-alive request; the matrix answers with [`PONG`].
    pub const PING: u16 = 0x0002;
    /// Keep-alive reply.
    pub const PONG: u16 = 0x0003;
    /// Device identity and capability reply.
    pub const DEVICE_INFO: u16 = 0x0010;
    /// Crosspoint set. The same identifier is used for the request and its
    /// reply; on the inbound path it is always the reply shape.
    pub const CROSSPOINT: u16 = 0x0024;
    /// Port list reply, overloaded between label entries (8 bytes each) and
    /// gain entries (4 bytes each).
    pub const PORT_LIST: u16 = 0x0030;
    /// Subsystem health report, addressed by a one-byte or two-byte sub-id.
    pub const SUBSYS_STATUS: u16 = 0x0041;
    /// Alarm report, reused for three distinct reply shapes selected by a
    /// discriminator byte at payload offset 2.
    pub const ALARM: u16 = 0x0050;
}

/// Fixed header length of a [`id::PORT_LIST`] payload (count + reserved).
pub const PORT_LIST_HEADER_LEN: usize = 4;

/// Entry size of the port-label shape of [`id::PORT_LIST`].
pub const PORT_LABEL_ENTRY_LEN: usize = 8;

/// Entry size of the port-gain shape of [`id::PORT_LIST`].
pub const PORT_GAIN_ENTRY_LEN: usize = 4;

/// Decoded payload of an inbound message, tagged by message identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Pong,
    DeviceInfo(DeviceInfo),
    Crosspoint(Crosspoint),
    PortLabels(Vec<PortLabel>),
    PortGains(Vec<PortGain>),
    SubsystemStatus(SubsystemStatus),
    Alarm(Alarm),
}

/// Identity block reported by the matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name, NUL-padded to 16 bytes on the wire.
    pub name: String,
    pub version_major: u8,
    pub version_minor: u8,
    pub port_count: u16,
}

/// A single crosspoint state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crosspoint {
    pub source: u16,
    pub destination: u16,
    pub connected: bool,
}

/// One entry of the label shape of [`id::PORT_LIST`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLabel {
    pub port: u16,
    /// Label text, NUL-padded to 6 bytes on the wire.
    pub label: String,
}

/// One entry of the gain shape of [`id::PORT_LIST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortGain {
    pub port: u16,
    /// Gain in tenths of a dB.
    pub gain_db10: i16,
}

/// Subsystem address inside a [`id::SUBSYS_STATUS`] payload.
///
/// The well-known subsystems are addressed by a single byte; anything else
/// carries a two-byte composite sub-identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Psu,
    Fan,
    Dsp,
    Composite(u16),
}

/// Health report for one subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsystemStatus {
    pub subsystem: Subsystem,
    /// 0 = nominal; non-zero values are firmware-defined fault codes.
    pub status: u8,
}

/// One of the three reply shapes sharing [`id::ALARM`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    /// Audio disappeared from a source port.
    SignalLost { source: u16, silence_ds: u16 },
    /// A sync reference dropped.
    SyncLost { source: u16, reference: u8 },
    /// Input level clipped.
    Overload { source: u16, level_db10: i16 },
}

impl Alarm {
    pub const KIND_SIGNAL_LOST: u8 = 0x01;
    pub const KIND_SYNC_LOST: u8 = 0x02;
    pub const KIND_OVERLOAD: u8 = 0x03;
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = buf.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

fn read_i16(buf: &[u8], offset: usize) -> Option<i16> {
    let bytes: [u8; 2] = buf.get(offset..offset + 2)?.try_into().ok()?;
    Some(i16::from_be_bytes(bytes))
}

/// Decodes a NUL-padded fixed-width text field. Non-UTF-8 labels fall back
/// to a lossy conversion; matrix firmware only emits ASCII in practice.
fn read_padded_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn decode_pong(_payload: &[u8]) -> Option<Body> {
    Some(Body::Pong)
}

pub fn decode_device_info(payload: &[u8]) -> Option<Body> {
    if payload.len() < 20 {
        return None;
    }
    Some(Body::DeviceInfo(DeviceInfo {
        name: read_padded_text(&payload[..16]),
        version_major: payload[16],
        version_minor: payload[17],
        port_count: read_u16(payload, 18)?,
    }))
}

pub fn decode_crosspoint(payload: &[u8]) -> Option<Body> {
    if payload.len() < 5 {
        return None;
    }
    Some(Body::Crosspoint(Crosspoint {
        source: read_u16(payload, 0)?,
        destination: read_u16(payload, 2)?,
        connected: payload[4] != 0,
    }))
}

pub fn decode_port_labels(payload: &[u8]) -> Option<Body> {
    let count = read_u16(payload, 0)? as usize;
    let body = payload.get(PORT_LIST_HEADER_LEN..)?;
    if body.len() != count * PORT_LABEL_ENTRY_LEN {
        return None;
    }
    let entries = body
        .chunks_exact(PORT_LABEL_ENTRY_LEN)
        .map(|entry| PortLabel {
            port: u16::from_be_bytes([entry[0], entry[1]]),
            label: read_padded_text(&entry[2..]),
        })
        .collect();
    Some(Body::PortLabels(entries))
}

pub fn decode_port_gains(payload: &[u8]) -> Option<Body> {
    let count = read_u16(payload, 0)? as usize;
    let body = payload.get(PORT_LIST_HEADER_LEN..)?;
    if body.len() != count * PORT_GAIN_ENTRY_LEN {
        return None;
    }
    let entries = body
        .chunks_exact(PORT_GAIN_ENTRY_LEN)
        .map(|entry| PortGain {
            port: u16::from_be_bytes([entry[0], entry[1]]),
            gain_db10: i16::from_be_bytes([entry[2], entry[3]]),
        })
        .collect();
    Some(Body::PortGains(entries))
}

/// Decodes a subsystem status payload, resolving the sub-identifier by
/// first checking the single-byte well-known set and only then reading the
/// next two bytes as a composite sub-id.
pub fn decode_subsystem_status(payload: &[u8]) -> Option<Body> {
    let (subsystem, status_offset) = match *payload.first()? {
        0x01 => (Subsystem::Psu, 1),
        0x02 => (Subsystem::Fan, 1),
        0x03 => (Subsystem::Dsp, 1),
        _ => (Subsystem::Composite(read_u16(payload, 0)?), 2),
    };
    Some(Body::SubsystemStatus(SubsystemStatus {
        subsystem,
        status: *payload.get(status_offset)?,
    }))
}

pub fn decode_alarm_signal_lost(payload: &[u8]) -> Option<Body> {
    Some(Body::Alarm(Alarm::SignalLost {
        source: read_u16(payload, 0)?,
        silence_ds: read_u16(payload, 3)?,
    }))
}

pub fn decode_alarm_sync_lost(payload: &[u8]) -> Option<Body> {
    Some(Body::Alarm(Alarm::SyncLost {
        source: read_u16(payload, 0)?,
        reference: *payload.get(3)?,
    }))
}

pub fn decode_alarm_overload(payload: &[u8]) -> Option<Body> {
    Some(Body::Alarm(Alarm::Overload {
        source: read_u16(payload, 0)?,
        level_db10: read_i16(payload, 3)?,
    }))
}
