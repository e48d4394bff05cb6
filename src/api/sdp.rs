//! Deterministic, line-oriented SDP rewriting.
//!
//! Normalizes line endings, forces `sendrecv` on negotiated media sections,
//! and caps the H.264 profile-level-id so mobile hardware encoders are never
//! asked for more than level 4.0.

use crate::api::error::RtcError;

const H264_LEVEL_UNCAPPED: &str = "profile-level-id=42e034";
const H264_LEVEL_CAPPED: &str = "profile-level-id=42e028";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaSection {
    None,
    Audio,
    Video,
    Other,
}

/// Validate basic SDP structure: a `v=0` first line and the mandatory
/// origin/session/timing lines.
pub fn validate(sdp: &str) -> Result<(), RtcError> {
    let trimmed = sdp.trim_start();
    if !trimmed.starts_with("v=0") {
        return Err(RtcError::InvalidSdpFormat);
    }
    let has_line = |prefix: &str| {
        trimmed
            .lines()
            .any(|l| l.trim_end_matches('\r').starts_with(prefix))
    };
    if !has_line("o=") || !has_line("s=") || !has_line("t=") {
        return Err(RtcError::InvalidSdpFormat);
    }
    Ok(())
}

/// Rewrite an SDP body. Idempotent: applying the transform twice yields the
/// same output as applying it once.
///
/// `has_video`: when false, video section directions are left unchanged.
pub fn transform(sdp: &str, has_video: bool) -> Result<String, RtcError> {
    validate(sdp)?;

    let mut section = MediaSection::None;
    let mut direction_replaced = false;
    let mut out: Vec<String> = Vec::new();

    for raw in sdp.split('\n') {
        let line = raw.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        if line.starts_with("v=")
            || line.starts_with("o=")
            || line.starts_with("s=")
            || line.starts_with("t=")
        {
            section = MediaSection::None;
            direction_replaced = false;
        } else if line.starts_with("m=audio") {
            section = MediaSection::Audio;
            direction_replaced = false;
        } else if line.starts_with("m=video") {
            section = MediaSection::Video;
            direction_replaced = false;
        } else if line.starts_with("m=") {
            section = MediaSection::Other;
            direction_replaced = false;
        }

        let mut rewritten = line.to_string();

        let force_direction = match section {
            MediaSection::Audio => true,
            MediaSection::Video => has_video,
            _ => false,
        };
        if force_direction
            && !direction_replaced
            && matches!(line, "a=recvonly" | "a=sendonly" | "a=inactive")
        {
            rewritten = "a=sendrecv".to_string();
            direction_replaced = true;
        }

        if rewritten.contains(H264_LEVEL_UNCAPPED) {
            rewritten = rewritten.replace(H264_LEVEL_UNCAPPED, H264_LEVEL_CAPPED);
        }

        out.push(rewritten);
    }

    let mut joined = out.join("\n");
    joined.push('\n');
    Ok(joined)
}
