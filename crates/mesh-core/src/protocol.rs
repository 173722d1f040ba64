//! Wire-level payloads exchanged by the discovery and liveness tasks.
//!
//! The mesh has no framing of its own: a frame is whatever bytes the radio
//! carries. Two literal payloads are reserved for control traffic; every
//! other payload belongs to the application.

/// Broadcast by nodes that have not yet joined a mesh.
pub const DISCOVERY_PAYLOAD: &[u8] = b"--hello--";

/// Unicast to every known peer on each liveness cycle.
pub const HEARTBEAT_PAYLOAD: &[u8] = b"Hi";

/// Largest payload a single radio frame can carry (ESP-NOW limit).
pub const MAX_PAYLOAD_LEN: usize = 250;

/// Classification of an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Discovery announcement
    Discovery,
    /// Liveness heartbeat
    Heartbeat,
    /// Anything else (application data)
    Data,
}

/// Classify a payload against the configured control payloads.
pub fn classify(payload: &[u8], discovery: &[u8], heartbeat: &[u8]) -> FrameKind {
    if payload == discovery {
        FrameKind::Discovery
    } else if payload == heartbeat {
        FrameKind::Heartbeat
    } else {
        FrameKind::Data
    }
}

/// Render a payload for log output (lossy UTF-8, truncated).
pub fn preview(payload: &[u8]) -> String {
    const MAX_PREVIEW: usize = 32;
    let text = String::from_utf8_lossy(&payload[..payload.len().min(MAX_PREVIEW)]);
    if payload.len() > MAX_PREVIEW {
        format!("{text}… ({} bytes)", payload.len())
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_payloads() {
        assert_eq!(DISCOVERY_PAYLOAD, b"--hello--");
        assert_eq!(HEARTBEAT_PAYLOAD, b"Hi");
    }

    #[test]
    fn test_classify() {
        let kind = |p: &[u8]| classify(p, DISCOVERY_PAYLOAD, HEARTBEAT_PAYLOAD);
        assert_eq!(kind(b"--hello--"), FrameKind::Discovery);
        assert_eq!(kind(b"Hi"), FrameKind::Heartbeat);
        assert_eq!(kind(b"Hi there"), FrameKind::Data);
        assert_eq!(kind(b""), FrameKind::Data);
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview(b"Hi"), "Hi");
        let long = vec![b'x'; 40];
        let shown = preview(&long);
        assert!(shown.starts_with(&"x".repeat(32)));
        assert!(shown.ends_with("(40 bytes)"));
    }
}
