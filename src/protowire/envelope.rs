//! Connect / gRPC envelope framing.
//!
//! Each frame on the wire is `[1-byte flags][4-byte big-endian length][payload]`.
//! Flags bit 0 marks a compressed payload, bit 1 marks end-of-stream.

pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
pub const FLAG_END_STREAM: u8 = 0b0000_0010;

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeFrame {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl EnvelopeFrame {
    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

/// Split a buffer into envelope frames. Returns `None` unless repeated
/// (flags, length) parsing consumes the buffer exactly.
pub fn split_frames(buf: &[u8]) -> Option<Vec<EnvelopeFrame>> {
    let mut frames = Vec::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        let header = buf.get(pos..pos + HEADER_LEN)?;
        let flags = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        pos += HEADER_LEN;
        let payload = buf.get(pos..pos.checked_add(len)?)?.to_vec();
        pos += len;
        frames.push(EnvelopeFrame { flags, payload });
    }

    Some(frames)
}

pub fn build_frames(frames: &[EnvelopeFrame]) -> Vec<u8> {
    let total: usize = frames
        .iter()
        .map(|f| HEADER_LEN + f.payload.len())
        .sum();
    let mut out = Vec::with_capacity(total);
    for frame in frames {
        out.push(frame.flags);
        out.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&frame.payload);
    }
    out
}

/// Envelope heuristic: the buffer parses exactly into frames and every
/// flags byte has its upper six bits clear. An empty buffer is not an
/// envelope.
pub fn looks_like_envelope(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    match split_frames(buf) {
        Some(frames) => frames
            .iter()
            .all(|f| f.flags & !(FLAG_COMPRESSED | FLAG_END_STREAM) == 0),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(flags: u8, payload: &[u8]) -> EnvelopeFrame {
        EnvelopeFrame {
            flags,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_round_trip() {
        let frames = vec![
            frame(0, b"first"),
            frame(FLAG_COMPRESSED, b"second"),
            frame(FLAG_END_STREAM, b""),
        ];
        let wire = build_frames(&frames);
        assert_eq!(split_frames(&wire).unwrap(), frames);
        assert!(looks_like_envelope(&wire));
    }

    #[test]
    fn test_flag_accessors() {
        assert!(frame(FLAG_COMPRESSED, b"").compressed());
        assert!(!frame(FLAG_COMPRESSED, b"").end_stream());
        assert!(frame(FLAG_END_STREAM, b"").end_stream());
        assert!(frame(FLAG_COMPRESSED | FLAG_END_STREAM, b"x").compressed());
    }

    #[test]
    fn test_truncated_is_rejected() {
        let wire = build_frames(&[frame(0, b"payload")]);
        assert!(split_frames(&wire[..wire.len() - 1]).is_none());
        assert!(split_frames(&wire[..3]).is_none());
        assert!(!looks_like_envelope(&wire[..wire.len() - 1]));
    }

    #[test]
    fn test_high_flag_bits_fail_heuristic() {
        let mut wire = build_frames(&[frame(0, b"ok")]);
        wire[0] = 0x80;
        // Framing still parses, but the heuristic must reject it.
        assert!(split_frames(&wire).is_some());
        assert!(!looks_like_envelope(&wire));
    }

    #[test]
    fn test_empty_buffer_is_not_an_envelope() {
        assert!(!looks_like_envelope(b""));
        assert_eq!(split_frames(b"").unwrap(), Vec::<EnvelopeFrame>::new());
    }

    #[test]
    fn test_plain_json_is_not_an_envelope() {
        assert!(!looks_like_envelope(b"{\"a\":1}"));
    }
}
