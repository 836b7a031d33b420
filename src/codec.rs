//! Frame decode/encode for the GT-style binary tracker protocol (spec.md §4.2).
//!
//! `decode` takes one packet already delimited by the connection framer
//! (see `connection.rs`) — `START(2) LEN(1) PROTO(1) BODY(LEN-5) STOP(2)`.

use crate::crc::crc16_itu;
use crate::error::CodecError;
use crate::identity::DeviceIdentity;

pub const START: [u8; 2] = [0x78, 0x78];
pub const STOP: [u8; 2] = [0x0D, 0x0A];

pub const PROTO_LOGIN: u8 = 0x01;
pub const PROTO_LOCATION: u8 = 0x12;
pub const PROTO_HEARTBEAT: u8 = 0x13;
pub const PROTO_COMMAND_REPLY: u8 = 0x15;
pub const PROTO_ALARM: u8 = 0x16;
pub const PROTO_SERVER_COMMAND: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPacket {
    pub identity: DeviceIdentity,
    pub serial: u16,
}

/// Wall-clock timestamp read off the device. `valid` is false when the
/// device reported an out-of-range date and server time was substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub timestamp: DeviceTimestamp,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: u8,
    pub course_deg: u16,
    pub satellites: u8,
    pub gps_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationPacket {
    pub fix: GpsFix,
    pub serial: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAlarmKind {
    Normal,
    Shock,
    PowerCut,
    LowBattery,
    Sos,
    Reserved(u8),
}

impl HeartbeatAlarmKind {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0b000 => Self::Normal,
            0b001 => Self::Shock,
            0b010 => Self::PowerCut,
            0b011 => Self::LowBattery,
            0b100 => Self::Sos,
            other => Self::Reserved(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPacket {
    pub activation: bool,
    pub acc: bool,
    pub charging: bool,
    pub alarm_kind: HeartbeatAlarmKind,
    pub gps_tracking: bool,
    pub oil_electricity_cut: bool,
    pub voltage_level: u8,
    pub gsm_bars: u8,
    pub serial: u16,
}

/// Voltage-bucket → battery percent, per spec.md §3.
pub const BATTERY_PERCENT_BY_VOLTAGE: [u8; 7] = [0, 10, 25, 40, 60, 80, 100];

impl HeartbeatPacket {
    pub fn battery_percent(&self) -> u8 {
        BATTERY_PERCENT_BY_VOLTAGE
            .get(self.voltage_level as usize)
            .copied()
            .unwrap_or(50)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    Normal,
    Sos,
    PowerCut,
    Shock,
    GeofenceEnter,
    GeofenceExit,
    OverSpeed,
    IgnitionOn,
    IgnitionOff,
    AcOn,
    AcOff,
    Unknown(u8),
}

impl AlarmKind {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::Normal,
            1 => Self::Sos,
            2 => Self::PowerCut,
            3 => Self::Shock,
            4 => Self::GeofenceEnter,
            5 => Self::GeofenceExit,
            6 => Self::OverSpeed,
            7 => Self::IgnitionOn,
            8 => Self::IgnitionOff,
            9 => Self::AcOn,
            10 => Self::AcOff,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmPacket {
    pub fix: GpsFix,
    pub alarm_kind: AlarmKind,
    pub serial: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReplyPacket {
    pub server_flag: u32,
    pub content: String,
    pub serial: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Login(LoginPacket),
    Location(LocationPacket),
    Heartbeat(HeartbeatPacket),
    CommandReply(CommandReplyPacket),
    Alarm(AlarmPacket),
    Unknown { proto: u8, serial: Option<u16> },
}

impl Packet {
    pub fn proto(&self) -> u8 {
        match self {
            Packet::Login(_) => PROTO_LOGIN,
            Packet::Location(_) => PROTO_LOCATION,
            Packet::Heartbeat(_) => PROTO_HEARTBEAT,
            Packet::CommandReply(_) => PROTO_COMMAND_REPLY,
            Packet::Alarm(_) => PROTO_ALARM,
            Packet::Unknown { proto, .. } => *proto,
        }
    }

    pub fn serial(&self) -> Option<u16> {
        match self {
            Packet::Login(p) => Some(p.serial),
            Packet::Location(p) => Some(p.serial),
            Packet::Heartbeat(p) => Some(p.serial),
            Packet::CommandReply(p) => Some(p.serial),
            Packet::Alarm(p) => Some(p.serial),
            Packet::Unknown { serial, .. } => *serial,
        }
    }
}

/// Result of a successful structural decode: the parsed packet plus whether
/// the embedded CRC matched. A mismatch is never fatal (spec.md §4.2).
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub packet: Packet,
    pub crc_ok: bool,
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, CodecError> {
    buf.get(at..at + 2)
        .map(|s| u16::from_be_bytes([s[0], s[1]]))
        .ok_or(CodecError::Truncated {
            have: buf.len(),
            need: at + 2,
        })
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, CodecError> {
    buf.get(at..at + 4)
        .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or(CodecError::Truncated {
            have: buf.len(),
            need: at + 4,
        })
}

fn parse_device_timestamp(buf: &[u8], at: usize) -> Result<DeviceTimestamp, CodecError> {
    let b = buf.get(at..at + 6).ok_or(CodecError::Truncated {
        have: buf.len(),
        need: at + 6,
    })?;
    let (year, month, day, hour, minute, second) =
        (2000 + b[0] as u16, b[1], b[2], b[3], b[4], b[5]);
    let valid = (1..=12).contains(&month) && (1..=31).contains(&day) && hour < 24 && minute < 60 && second < 60;
    Ok(DeviceTimestamp {
        year,
        month,
        day,
        hour,
        minute,
        second,
        valid,
    })
}

/// Parses the 18-byte GPS block shared by Location and Alarm, starting at
/// `at` (which is `4` — right after START/LEN/PROTO).
fn parse_gps_fix(buf: &[u8], at: usize) -> Result<GpsFix, CodecError> {
    if buf.len() < at + 18 {
        return Err(CodecError::Truncated {
            have: buf.len(),
            need: at + 18,
        });
    }
    let timestamp = parse_device_timestamp(buf, at)?;
    let gps_info = buf[at + 6];
    let satellites = gps_info & 0x0F; // low nibble = count, per spec.md §9
    let lat_raw = read_u32(buf, at + 7)?;
    let lon_raw = read_u32(buf, at + 11)?;
    let speed_kmh = buf[at + 15];
    let course_status = read_u16(buf, at + 16)?;

    let course_deg = course_status & 0x03FF;
    let lat_is_north = (course_status >> 10) & 0x01 == 1;
    let lon_is_west = (course_status >> 11) & 0x01 == 1;
    let gps_valid = (course_status >> 12) & 0x01 == 1;

    let mut latitude = lat_raw as f64 / 1_800_000.0;
    let mut longitude = lon_raw as f64 / 1_800_000.0;
    if !lat_is_north {
        latitude = -latitude;
    }
    if lon_is_west {
        longitude = -longitude;
    }

    Ok(GpsFix {
        timestamp,
        latitude,
        longitude,
        speed_kmh,
        course_deg,
        satellites,
        gps_valid,
    })
}

fn trailing_serial_and_crc(frame: &[u8]) -> Result<(u16, u16), CodecError> {
    let len = frame.len();
    if len < 6 {
        return Err(CodecError::Truncated { have: len, need: 6 });
    }
    let serial = read_u16(frame, len - 6)?;
    let crc = read_u16(frame, len - 4)?;
    Ok((serial, crc))
}

fn parse_login(frame: &[u8]) -> Result<LoginPacket, CodecError> {
    if frame.len() < 18 {
        return Err(CodecError::BodyTooShort { proto: PROTO_LOGIN });
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&frame[4..12]);
    let serial = read_u16(frame, 12)?;
    Ok(LoginPacket {
        identity: DeviceIdentity::from_bytes(id),
        serial,
    })
}

fn parse_location(frame: &[u8]) -> Result<LocationPacket, CodecError> {
    if frame.len() < 30 {
        return Err(CodecError::BodyTooShort {
            proto: PROTO_LOCATION,
        });
    }
    let fix = parse_gps_fix(frame, 4)?;
    let (serial, _crc) = trailing_serial_and_crc(frame)?;
    Ok(LocationPacket { fix, serial })
}

fn parse_heartbeat(frame: &[u8]) -> Result<HeartbeatPacket, CodecError> {
    if frame.len() < 15 {
        return Err(CodecError::BodyTooShort {
            proto: PROTO_HEARTBEAT,
        });
    }
    let terminal_info = frame[4];
    let voltage_level = frame[5];
    let gsm_bars = frame[6].min(4);
    let (serial, _crc) = trailing_serial_and_crc(frame)?;

    Ok(HeartbeatPacket {
        activation: terminal_info & 0x01 != 0,
        acc: terminal_info & 0x02 != 0,
        charging: terminal_info & 0x04 != 0,
        alarm_kind: HeartbeatAlarmKind::from_bits((terminal_info >> 3) & 0x07),
        gps_tracking: terminal_info & 0x40 != 0,
        oil_electricity_cut: terminal_info & 0x80 != 0,
        voltage_level,
        gsm_bars,
        serial,
    })
}

fn parse_alarm(frame: &[u8]) -> Result<AlarmPacket, CodecError> {
    if frame.len() < 30 {
        return Err(CodecError::BodyTooShort { proto: PROTO_ALARM });
    }
    let fix = parse_gps_fix(frame, 4)?;
    let lbs_length = *frame.get(22).ok_or(CodecError::BodyTooShort { proto: PROTO_ALARM })? as usize;
    let alarm_offset = 22 + lbs_length + 3;
    let alarm_byte = *frame
        .get(alarm_offset)
        .ok_or(CodecError::BodyTooShort { proto: PROTO_ALARM })?;
    let (serial, _crc) = trailing_serial_and_crc(frame)?;

    Ok(AlarmPacket {
        fix,
        alarm_kind: AlarmKind::from_byte(alarm_byte),
        serial,
    })
}

fn parse_command_reply(frame: &[u8]) -> Result<CommandReplyPacket, CodecError> {
    if frame.len() < 9 {
        return Err(CodecError::BodyTooShort {
            proto: PROTO_COMMAND_REPLY,
        });
    }
    let cmd_len = frame[4] as usize;
    if cmd_len < 4 {
        return Err(CodecError::BodyTooShort {
            proto: PROTO_COMMAND_REPLY,
        });
    }
    let server_flag = read_u32(frame, 5)?;
    let content_len = cmd_len - 4;
    let content_start = 9;
    let content_end = content_start + content_len;
    let content = frame
        .get(content_start..content_end)
        .ok_or(CodecError::BodyTooShort {
            proto: PROTO_COMMAND_REPLY,
        })?;
    let content = String::from_utf8_lossy(content).into_owned();
    // language(2) follows content, then serial(2), crc(2) — read from the tail.
    let (serial, _crc) = trailing_serial_and_crc(frame)?;

    Ok(CommandReplyPacket {
        server_flag,
        content,
        serial,
    })
}

/// Decodes one fully-delimited frame (`START..STOP` inclusive).
pub fn decode(frame: &[u8]) -> Result<Decoded, CodecError> {
    if frame.len() < 3 {
        return Err(CodecError::Truncated { have: frame.len(), need: 3 });
    }
    if frame[0..2] != START {
        return Err(CodecError::NoStartMarker);
    }
    if frame[frame.len() - 2..] != STOP {
        return Err(CodecError::NoStopMarker);
    }
    let len = frame[2] as usize;
    let expected_total = len + 5;
    if frame.len() != expected_total {
        return Err(CodecError::LengthMismatch {
            declared: expected_total,
            actual: frame.len(),
        });
    }
    let proto = frame[3];

    // CRC covers LEN || PROTO || BODY-without-CRC, i.e. frame[2..len-4].
    let crc_input = &frame[2..frame.len() - 4];
    let computed = crc16_itu(crc_input);
    let (_, declared_crc) = trailing_serial_and_crc(frame).unwrap_or((0, 0));
    let crc_ok = computed == declared_crc;

    // An ACK's body is just PROTO + a 2-byte serial (LEN==5), regardless of
    // which proto byte it carries — a device never sends a frame this short
    // for Login/Location/etc, so the shape alone disambiguates it from a
    // real inbound packet sharing the same proto byte.
    let packet = if len == 5 {
        let (serial, _) = trailing_serial_and_crc(frame)?;
        Packet::Unknown {
            proto,
            serial: Some(serial),
        }
    } else {
        match proto {
            PROTO_LOGIN => Packet::Login(parse_login(frame)?),
            PROTO_LOCATION => Packet::Location(parse_location(frame)?),
            PROTO_HEARTBEAT => Packet::Heartbeat(parse_heartbeat(frame)?),
            PROTO_ALARM => Packet::Alarm(parse_alarm(frame)?),
            PROTO_COMMAND_REPLY => Packet::CommandReply(parse_command_reply(frame)?),
            other => Packet::Unknown {
                proto: other,
                serial: trailing_serial_and_crc(frame).ok().map(|(s, _)| s),
            },
        }
    };

    Ok(Decoded { packet, crc_ok })
}

/// Encodes an ACK frame for `proto`/`serial`. Never called for CommandReply.
pub fn encode_ack(proto: u8, serial: u16) -> Vec<u8> {
    let serial_bytes = serial.to_be_bytes();
    let body = [5u8, proto, serial_bytes[0], serial_bytes[1]];
    let crc = crc16_itu(&body);
    let mut out = Vec::with_capacity(10);
    out.extend_from_slice(&START);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&STOP);
    out
}

/// Encodes an outbound ServerCommand (0x80) frame. `server_flag` is the
/// caller-chosen correlation value, echoed verbatim by the device's reply.
pub fn encode_server_command(content: &str, serial: u16, server_flag: u32) -> Vec<u8> {
    let content_bytes = content.as_bytes();
    let cmd_len = 4 + content_bytes.len();
    let len = 10 + content_bytes.len();
    let serial_bytes = serial.to_be_bytes();

    let mut body = Vec::with_capacity(1 + 1 + 4 + content_bytes.len() + 2);
    body.push(len as u8);
    body.push(PROTO_SERVER_COMMAND);
    body.push(cmd_len as u8);
    body.extend_from_slice(&server_flag.to_be_bytes());
    body.extend_from_slice(content_bytes);
    body.extend_from_slice(&serial_bytes);

    let crc = crc16_itu(&body);
    let mut out = Vec::with_capacity(2 + body.len() + 2 + 2);
    out.extend_from_slice(&START);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&STOP);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_body(proto: u8, body_without_crc: &[u8]) -> Vec<u8> {
        let len = 1 + body_without_crc.len() + 2; // proto + body + crc
        let mut crc_input = Vec::with_capacity(1 + 1 + body_without_crc.len());
        crc_input.push(len as u8);
        crc_input.push(proto);
        crc_input.extend_from_slice(body_without_crc);
        let crc = crc16_itu(&crc_input);

        let mut out = Vec::with_capacity(2 + crc_input.len() + 2 + 2);
        out.extend_from_slice(&START);
        out.extend_from_slice(&crc_input);
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&STOP);
        out
    }

    #[test]
    fn decodes_login_packet() {
        let mut body = vec![0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45]; // identity
        body.extend_from_slice(&1u16.to_be_bytes()); // serial
        let frame = frame_with_body(PROTO_LOGIN, &body);

        let decoded = decode(&frame).unwrap();
        assert!(decoded.crc_ok);
        match decoded.packet {
            Packet::Login(p) => {
                assert_eq!(p.identity.as_hex(), "0123456789012345");
                assert_eq!(p.serial, 1);
            }
            other => panic!("expected Login, got {other:?}"),
        }
    }

    fn location_body(course_status: u16) -> Vec<u8> {
        let mut body = vec![0x14, 0x01, 0x16, 0x12, 0x00, 0x00]; // 2020-01-22 18:00:00
        body.push(0x05); // gps_info: count=5 in low nibble
        body.extend_from_slice(&1_800_000u32.to_be_bytes()); // lat raw = 1.0 deg
        body.extend_from_slice(&1_800_000u32.to_be_bytes()); // lon raw = 1.0 deg
        body.push(0); // speed
        body.extend_from_slice(&course_status.to_be_bytes());
        body.extend_from_slice(&[0u8; 8]); // LBS padding
        body.extend_from_slice(&1u16.to_be_bytes()); // serial
        body
    }

    #[test]
    fn hemisphere_south_east() {
        // bit12 (gps_valid) set only -> lat North-bit=0 (South), lon West-bit=0 (East).
        let frame = frame_with_body(PROTO_LOCATION, &location_body(0x1000));
        let decoded = decode(&frame).unwrap();
        match decoded.packet {
            Packet::Location(p) => {
                assert!((p.fix.latitude - -1.0).abs() < 1e-9);
                assert!((p.fix.longitude - 1.0).abs() < 1e-9);
                assert!(p.fix.gps_valid);
                assert_eq!(p.fix.course_deg, 0);
            }
            other => panic!("expected Location, got {other:?}"),
        }
    }

    #[test]
    fn hemisphere_north_west() {
        // bits 12,11,10 set -> North, West.
        let frame = frame_with_body(PROTO_LOCATION, &location_body(0x1C00));
        let decoded = decode(&frame).unwrap();
        match decoded.packet {
            Packet::Location(p) => {
                assert!((p.fix.latitude - 1.0).abs() < 1e-9);
                assert!((p.fix.longitude - -1.0).abs() < 1e-9);
            }
            other => panic!("expected Location, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_decodes_one_byte_voltage() {
        let body = vec![
            0b1000_0011, // activation=1, acc=1, charging=0, alarm=000, gps=0, cut=1
            0x05,        // voltage level 5 -> 80%
            0x03,        // gsm 3 bars
            0x00,        // alarm byte (unused in this layout)
            0x00,        // language
            0x00,
            0x01, // serial
        ];
        let frame = frame_with_body(PROTO_HEARTBEAT, &body);
        let decoded = decode(&frame).unwrap();
        match decoded.packet {
            Packet::Heartbeat(h) => {
                assert!(h.activation);
                assert!(h.acc);
                assert!(!h.charging);
                assert!(h.oil_electricity_cut);
                assert_eq!(h.voltage_level, 5);
                assert_eq!(h.battery_percent(), 80);
                assert_eq!(h.gsm_bars, 3);
            }
            other => panic!("expected Heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn command_reply_roundtrips_content_and_flag() {
        let content = "Battery=80%";
        let mut body = vec![(4 + content.len()) as u8];
        body.extend_from_slice(&0xA001u32.to_be_bytes());
        body.extend_from_slice(content.as_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // language
        body.extend_from_slice(&7u16.to_be_bytes()); // serial
        let frame = frame_with_body(PROTO_COMMAND_REPLY, &body);

        let decoded = decode(&frame).unwrap();
        match decoded.packet {
            Packet::CommandReply(r) => {
                assert_eq!(r.server_flag, 0xA001);
                assert_eq!(r.content, "Battery=80%");
                assert_eq!(r.serial, 7);
            }
            other => panic!("expected CommandReply, got {other:?}"),
        }
    }

    #[test]
    fn ack_roundtrips_proto_and_serial() {
        let ack = encode_ack(PROTO_LOGIN, 1);
        let decoded = decode(&ack).unwrap();
        assert!(decoded.crc_ok);
        assert_eq!(decoded.packet.proto(), PROTO_LOGIN);
        assert_eq!(decoded.packet.serial(), Some(1));
    }

    #[test]
    fn ack_roundtrips_for_every_known_proto() {
        for proto in [
            PROTO_LOGIN,
            PROTO_LOCATION,
            PROTO_HEARTBEAT,
            PROTO_ALARM,
            PROTO_COMMAND_REPLY,
        ] {
            let ack = encode_ack(proto, 42);
            let decoded = decode(&ack).unwrap();
            assert!(decoded.crc_ok);
            assert_eq!(decoded.packet.proto(), proto);
            assert_eq!(decoded.packet.serial(), Some(42));
        }
    }

    #[test]
    fn crc_mismatch_is_flagged_but_still_parses() {
        let mut body = vec![0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45];
        body.extend_from_slice(&1u16.to_be_bytes());
        let mut frame = frame_with_body(PROTO_LOGIN, &body);
        let crc_idx = frame.len() - 4;
        frame[crc_idx] ^= 0xFF; // corrupt CRC high byte

        let decoded = decode(&frame).unwrap();
        assert!(!decoded.crc_ok);
        assert!(matches!(decoded.packet, Packet::Login(_)));
    }

    #[test]
    fn unknown_protocol_decodes_without_error() {
        let frame = frame_with_body(0x99, &[0u8, 1u8]);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.packet.proto(), 0x99);
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let err = decode(&[0x78, 0x78]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
