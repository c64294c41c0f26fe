//! Byte-level encoding of protocol values.
//!
//! Numbers are IEEE-754 `f32` and two's-complement `i32` in big-endian order.
//! There is no framing: the number of values is fixed by the command.

use crate::error::{ScopeError, ScopeResult};

use super::command::Command;

/// Size of the fixed status frame.
pub const STATUS_FRAME_LEN: usize = 16;

/// Bytes of a status reply needed to recognise a sentinel.
pub const STATUS_PREFIX_LEN: usize = 7;

/// Reply to a cancellation request.
pub const ACK: &[u8] = b"ACK";

/// Prefix of a hardware-fault reply to any query.
pub const HWERR_SENTINEL: &[u8] = b"HWERR";

/// Prefix of a status reply for a failed job.
pub const FAILED_SENTINEL: &str = "FAILED:";

/// Prefix of a status reply for a completed job.
pub const SUCCESS_SENTINEL: &str = "SUCCESS:";

/// Token terminating the acquisition text message.
pub const END_MARKER: &str = "END_MARKER";

/// Encode the command identifier.
#[must_use]
pub fn encode_command(cmd: Command) -> [u8; 8] {
    *cmd.word().as_bytes()
}

/// Encode one value as big-endian `f32`.
#[must_use]
pub fn encode_f32(value: f32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Decode one big-endian `f32`.
#[must_use]
pub fn decode_f32(bytes: [u8; 4]) -> f32 {
    f32::from_be_bytes(bytes)
}

/// Encode a sequence of values back to back.
#[must_use]
pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| encode_f32(*v)).collect()
}

/// Decode exactly `count` big-endian `f32` values from a response to `cmd`.
pub fn decode_f32s(cmd: Command, bytes: &[u8], count: usize) -> ScopeResult<Vec<f32>> {
    check_len(cmd, bytes, count * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| decode_f32([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Decode exactly `count` big-endian `i32` values from a response to `cmd`.
pub fn decode_i32s(cmd: Command, bytes: &[u8], count: usize) -> ScopeResult<Vec<i32>> {
    check_len(cmd, bytes, count * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn check_len(cmd: Command, bytes: &[u8], expected: usize) -> ScopeResult<()> {
    if bytes.len() != expected {
        return Err(ScopeError::MalformedResponse {
            command: cmd.to_string(),
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Whether a response begins with the hardware-fault sentinel.
#[must_use]
pub fn is_hardware_fault(bytes: &[u8]) -> bool {
    bytes.starts_with(HWERR_SENTINEL)
}

/// Whether a fixed-size response could be the start of a hardware-fault reply.
///
/// Four-byte responses cannot hold the whole sentinel, so a matching prefix is
/// enough to warrant reading the rest of the text.
#[must_use]
pub fn is_fault_prefix(bytes: &[u8]) -> bool {
    if bytes.len() >= HWERR_SENTINEL.len() {
        is_hardware_fault(bytes)
    } else {
        !bytes.is_empty() && HWERR_SENTINEL.starts_with(bytes)
    }
}

/// Extract the human-readable part of a hardware-fault reply.
#[must_use]
pub fn hardware_fault_text(bytes: &[u8]) -> String {
    let rest = bytes.strip_prefix(HWERR_SENTINEL).unwrap_or(bytes);
    let text = clean_text(rest);
    let text = text.trim_start_matches(':').trim();
    if text.is_empty() {
        "instrument reported a fault".to_string()
    } else {
        text.to_string()
    }
}

/// Whether a status reply, or its first [`STATUS_PREFIX_LEN`] bytes, opens
/// with a sentinel followed by variable-length text.
#[must_use]
pub fn status_has_text(frame: &[u8]) -> bool {
    [FAILED_SENTINEL, SUCCESS_SENTINEL].iter().any(|sentinel| {
        let sentinel = sentinel.as_bytes();
        let n = sentinel.len().min(frame.len());
        n >= STATUS_PREFIX_LEN && frame[..n] == sentinel[..n]
    })
}

/// A decoded `status__` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReply {
    /// `FAILED:` sentinel with the server's diagnostic text.
    Failed(String),
    /// `SUCCESS:` sentinel with optional detail.
    Success(String),
    /// Plain enumerated state word, space padded.
    State(String),
}

/// Decode a full status reply (frame plus any trailing text).
#[must_use]
pub fn decode_status(bytes: &[u8]) -> StatusReply {
    let text = clean_text(bytes);
    if let Some(detail) = text.strip_prefix(FAILED_SENTINEL) {
        StatusReply::Failed(detail.trim().to_string())
    } else if let Some(detail) = text.strip_prefix(SUCCESS_SENTINEL) {
        StatusReply::Success(detail.trim().to_string())
    } else {
        StatusReply::State(text.trim().to_string())
    }
}

/// Encode a state word into a padded status frame. Longer words are sent whole.
#[must_use]
pub fn encode_status_frame(text: &str) -> Vec<u8> {
    let mut frame = text.as_bytes().to_vec();
    if frame.len() < STATUS_FRAME_LEN {
        frame.resize(STATUS_FRAME_LEN, b' ');
    }
    frame
}

fn clean_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_is_eight_bytes() {
        for cmd in Command::ALL {
            assert_eq!(encode_command(cmd).len(), 8);
        }
        assert_eq!(&encode_command(Command::GetStageXY), b"getxy___");
    }

    #[test]
    fn test_f32_roundtrip_micrometer_positions() {
        for v in [0.0f32, -21000.0, 33000.0, 1234.5, -0.25, 11000.125, f32::MIN_POSITIVE] {
            assert_eq!(decode_f32(encode_f32(v)), v);
        }
    }

    #[test]
    fn test_f32_is_big_endian() {
        assert_eq!(encode_f32(1.0), [0x3f, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_f32s_checks_length() {
        let bytes = encode_f32s(&[1.5, -2.5]);
        assert_eq!(
            decode_f32s(Command::GetStageXY, &bytes, 2).unwrap(),
            vec![1.5, -2.5]
        );
        let err = decode_f32s(Command::GetStageXY, &bytes[..5], 2).unwrap_err();
        assert!(matches!(
            err,
            ScopeError::MalformedResponse {
                expected: 8,
                actual: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_progress_pair() {
        let mut bytes = 7i32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&40i32.to_be_bytes());
        assert_eq!(decode_i32s(Command::Progress, &bytes, 2).unwrap(), vec![7, 40]);
    }

    #[test]
    fn test_status_failed_text_is_trimmed() {
        assert_eq!(
            decode_status(b"FAILED:stage jammed"),
            StatusReply::Failed("stage jammed".into())
        );
        assert_eq!(
            decode_status(b"FAILED:  stage jammed \n\0\0"),
            StatusReply::Failed("stage jammed".into())
        );
    }

    #[test]
    fn test_status_state_word() {
        let frame = encode_status_frame("RUNNING");
        assert_eq!(frame.len(), STATUS_FRAME_LEN);
        assert!(!status_has_text(&frame));
        assert_eq!(decode_status(&frame), StatusReply::State("RUNNING".into()));
        assert_eq!(
            decode_status(b"SUCCESS:"),
            StatusReply::Success(String::new())
        );
    }

    #[test]
    fn test_sentinel_recognised_from_prefix() {
        assert!(status_has_text(b"FAILED:"));
        assert!(status_has_text(b"SUCCESS"));
        assert!(status_has_text(b"SUCCESS:done"));
        assert!(!status_has_text(b"RUNNING"));
        assert!(!status_has_text(b"SUCCES"));
        assert!(!status_has_text(&encode_status_frame("CANCELLED")));
    }

    #[test]
    fn test_hardware_fault_detection() {
        assert!(is_hardware_fault(b"HWERR:stage not loaded"));
        assert!(!is_hardware_fault(&encode_f32s(&[1.0, 2.0])));
        assert!(is_fault_prefix(b"HWER"));
        assert!(!is_fault_prefix(&encode_f32(-1000.0)));
        assert_eq!(hardware_fault_text(b"HWERR:stage not loaded"), "stage not loaded");
        assert_eq!(hardware_fault_text(b"HWERR\0\0\0"), "instrument reported a fault");
    }
}
