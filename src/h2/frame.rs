//! HTTP/2 frame codec (RFC 7540 section 4).

/// Client connection preface.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const FRAME_HEADER_LEN: usize = 9;

// Frame flags.
pub(crate) const FLAG_ACK: u8 = 0x1;
pub(crate) const FLAG_END_STREAM: u8 = 0x1;
pub(crate) const FLAG_END_HEADERS: u8 = 0x4;
pub(crate) const FLAG_PADDED: u8 = 0x8;
pub(crate) const FLAG_PRIORITY: u8 = 0x20;

// Setting identifiers (section 6.5.2).
pub(crate) const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub(crate) const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub(crate) const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub(crate) const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub(crate) const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub(crate) const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    /// Unrecognized frame types must be ignored (section 4.1).
    Unknown(u8),
}

impl FrameType {
    pub(crate) fn from_u8(byte: u8) -> Self {
        match byte {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::Goaway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::Goaway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub(crate) enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

/// The fixed 9-octet frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHead {
    pub(crate) length: u32,
    pub(crate) kind: FrameType,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
}

impl FrameHead {
    pub(crate) fn parse(raw: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            length: u32::from_be_bytes([0, raw[0], raw[1], raw[2]]),
            kind: FrameType::from_u8(raw[3]),
            flags: raw[4],
            stream_id: u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) & 0x7FFF_FFFF,
        }
    }

    pub(crate) fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Append one complete frame (header + payload) to `out`.
pub(crate) fn write_frame(
    kind: FrameType,
    flags: u8,
    stream_id: u32,
    payload: &[u8],
    out: &mut Vec<u8>,
) {
    let length = payload.len() as u32;
    out.extend_from_slice(&length.to_be_bytes()[1..4]);
    out.push(kind.as_u8());
    out.push(flags);
    out.extend_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Strip the pad-length prefix and trailing padding from a PADDED
/// DATA/HEADERS payload.
pub(crate) fn strip_padding(payload: &[u8], flags: u8) -> Result<&[u8], ErrorCode> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    let (&pad_len, rest) = payload.split_first().ok_or(ErrorCode::ProtocolError)?;
    if usize::from(pad_len) > rest.len() {
        return Err(ErrorCode::ProtocolError);
    }
    Ok(&rest[..rest.len() - usize::from(pad_len)])
}

/// Drop the 5-octet priority block from a HEADERS payload carrying the
/// PRIORITY flag. Priority is recorded nowhere; it is only a hint.
pub(crate) fn strip_priority(payload: &[u8], flags: u8) -> Result<&[u8], ErrorCode> {
    if flags & FLAG_PRIORITY == 0 {
        return Ok(payload);
    }
    if payload.len() < 5 {
        return Err(ErrorCode::FrameSizeError);
    }
    Ok(&payload[5..])
}

/// Decode a SETTINGS payload into `(identifier, value)` pairs with the
/// per-setting validity checks of section 6.5.2.
pub(crate) fn parse_settings(payload: &[u8]) -> Result<Vec<(u16, u32)>, ErrorCode> {
    if payload.len() % 6 != 0 {
        return Err(ErrorCode::FrameSizeError);
    }

    let mut settings = Vec::with_capacity(payload.len() / 6);
    for chunk in payload.chunks_exact(6) {
        let id = u16::from_be_bytes([chunk[0], chunk[1]]);
        let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);

        match id {
            SETTINGS_ENABLE_PUSH if value > 1 => return Err(ErrorCode::ProtocolError),
            SETTINGS_INITIAL_WINDOW_SIZE if value > 0x7FFF_FFFF => {
                return Err(ErrorCode::FlowControlError)
            }
            SETTINGS_MAX_FRAME_SIZE if !(16_384..=16_777_215).contains(&value) => {
                return Err(ErrorCode::ProtocolError)
            }
            _ => {}
        }
        settings.push((id, value));
    }
    Ok(settings)
}

/// Encode `(identifier, value)` pairs as a SETTINGS payload.
pub(crate) fn encode_settings(settings: &[(u16, u32)], out: &mut Vec<u8>) {
    for (id, value) in settings {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_round_trip() {
        #[rustfmt::skip]
        let cases = [
            (FrameType::Data,         FLAG_END_STREAM, 1,          b"payload".to_vec()),
            (FrameType::Headers,      FLAG_END_HEADERS, 3,         vec![0x82]),
            (FrameType::Settings,     0,                0,          vec![]),
            (FrameType::Ping,         FLAG_ACK,         0,          vec![0; 8]),
            (FrameType::WindowUpdate, 0,                0x7FFF_FFFF, vec![0, 0, 1, 0]),
        ];

        for (kind, flags, stream_id, payload) in cases {
            let mut raw = Vec::new();
            write_frame(kind, flags, stream_id, &payload, &mut raw);
            assert_eq!(raw.len(), FRAME_HEADER_LEN + payload.len());

            let head = FrameHead::parse(raw[..9].try_into().unwrap());
            assert_eq!(head.length as usize, payload.len());
            assert_eq!(head.kind, kind);
            assert_eq!(head.flags, flags);
            assert_eq!(head.stream_id, stream_id);
            assert_eq!(&raw[9..], &payload[..]);
        }
    }

    #[test]
    fn reserved_bit_is_masked() {
        let raw = [0, 0, 0, 0x0, 0, 0xFF, 0xFF, 0xFF, 0xFF];
        let head = FrameHead::parse(&raw);
        assert_eq!(head.stream_id, 0x7FFF_FFFF);
    }

    #[test]
    fn unknown_frame_types_survive() {
        assert_eq!(FrameType::from_u8(0xEE), FrameType::Unknown(0xEE));
        assert_eq!(FrameType::Unknown(0xEE).as_u8(), 0xEE);
    }

    #[test]
    fn padding() {
        // pad-length prefix of 3, payload "data", 3 pad octets.
        let padded = [3u8, b'd', b'a', b't', b'a', 0, 0, 0];
        assert_eq!(strip_padding(&padded, FLAG_PADDED), Ok(&b"data"[..]));
        assert_eq!(strip_padding(&padded, 0), Ok(&padded[..]));

        // Padding longer than the frame.
        let broken = [9u8, b'x'];
        assert_eq!(
            strip_padding(&broken, FLAG_PADDED),
            Err(ErrorCode::ProtocolError)
        );
    }

    #[test]
    fn priority_block() {
        let payload = [0, 0, 0, 3, 16, 0x82];
        assert_eq!(strip_priority(&payload, FLAG_PRIORITY), Ok(&[0x82u8][..]));
        assert_eq!(strip_priority(&payload, 0), Ok(&payload[..]));
        assert_eq!(
            strip_priority(&[0, 0], FLAG_PRIORITY),
            Err(ErrorCode::FrameSizeError)
        );
    }

    #[test]
    fn settings_round_trip_and_validation() {
        let settings = [
            (SETTINGS_HEADER_TABLE_SIZE, 4096),
            (SETTINGS_MAX_CONCURRENT_STREAMS, 100),
            (SETTINGS_INITIAL_WINDOW_SIZE, 65_535),
        ];
        let mut payload = Vec::new();
        encode_settings(&settings, &mut payload);
        assert_eq!(parse_settings(&payload).unwrap(), settings);

        #[rustfmt::skip]
        let invalid: [(&[u8], ErrorCode); 2] = [
            (&[0, 0, 0, 0, 0],    ErrorCode::FrameSizeError),
            (&[0, 2, 0, 0, 0, 2], ErrorCode::ProtocolError),
        ];
        for (raw, code) in invalid {
            assert_eq!(parse_settings(raw), Err(code), "{raw:?}");
        }

        let mut big_window = Vec::new();
        encode_settings(&[(SETTINGS_INITIAL_WINDOW_SIZE, 0x8000_0000)], &mut big_window);
        assert_eq!(
            parse_settings(&big_window),
            Err(ErrorCode::FlowControlError)
        );
    }
}
