//! Adaptive quality scoring and SFU encoder ceilings.
//!
//! The notification consumer applies the profile's starting ceilings when a
//! stream is added to an SFU call; afterwards the host can feed periodic
//! stats through [`recommended_framerate`] and
//! [`calculate_quality_score`] to step quality up or down.

use serde::{Deserialize, Serialize};

use crate::api::config::SfuVideoQualityProfile;
use crate::api::peer_connection::StatsReport;

/// Composite quality score result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    /// Overall score 0.0 (unusable) to 1.0 (excellent).
    pub score: f64,
    /// Human-readable label: "excellent", "good", "fair", "poor", "unusable".
    pub label: String,
    pub rtt_score: f64,
    pub jitter_score: f64,
    pub loss_score: f64,
    pub bitrate_score: f64,
}

/// Calculate a composite quality score from network metrics.
///
/// Weights: RTT 25%, jitter 20%, packet loss 35%, bitrate adequacy 20%.
/// Packet loss is weighted highest because it has the most audible impact.
pub fn calculate_quality_score(stats: &StatsReport, is_video: bool) -> QualityScore {
    let rtt_score = score_rtt(stats.round_trip_time_ms);
    let jitter_score = score_jitter(stats.jitter_ms);
    let loss_score = score_loss(stats.packet_loss_percent);
    let bitrate_score = score_bitrate(stats.available_outgoing_bitrate_bps / 1000.0, is_video);

    let score = rtt_score * 0.25 + jitter_score * 0.20 + loss_score * 0.35 + bitrate_score * 0.20;
    let score = score.clamp(0.0, 1.0);

    let label = if score >= 0.85 {
        "excellent"
    } else if score >= 0.65 {
        "good"
    } else if score >= 0.45 {
        "fair"
    } else if score >= 0.25 {
        "poor"
    } else {
        "unusable"
    }
    .to_string();

    QualityScore {
        score,
        label,
        rtt_score,
        jitter_score,
        loss_score,
        bitrate_score,
    }
}

/// Pick the send framerate for the available bitrate: the high rate once
/// usable bandwidth (after headroom) clears the threshold, the low rate
/// otherwise.
pub fn recommended_framerate(profile: &SfuVideoQualityProfile, available_bps: f64) -> u32 {
    let usable = available_bps * profile.headroom_factor;
    if usable >= profile.high_fps_threshold_bps as f64 {
        profile.high_fps
    } else {
        profile.low_fps
    }
}

/// Clamp a target bitrate into the profile's floor/ceiling.
pub fn clamp_bitrate(profile: &SfuVideoQualityProfile, target_bps: u32) -> u32 {
    target_bps.clamp(profile.min_bitrate_bps, profile.max_bitrate_bps)
}

fn score_rtt(rtt: f64) -> f64 {
    if rtt <= 50.0 { 1.0 }
    else if rtt <= 100.0 { 0.9 }
    else if rtt <= 200.0 { 0.7 }
    else if rtt <= 350.0 { 0.4 }
    else if rtt <= 500.0 { 0.2 }
    else { 0.05 }
}

fn score_jitter(jitter: f64) -> f64 {
    if jitter <= 10.0 { 1.0 }
    else if jitter <= 30.0 { 0.8 }
    else if jitter <= 50.0 { 0.6 }
    else if jitter <= 100.0 { 0.3 }
    else { 0.1 }
}

fn score_loss(loss: f64) -> f64 {
    if loss <= 0.5 { 1.0 }
    else if loss <= 2.0 { 0.8 }
    else if loss <= 5.0 { 0.5 }
    else if loss <= 10.0 { 0.25 }
    else { 0.05 }
}

fn score_bitrate(kbps: f64, is_video: bool) -> f64 {
    if is_video {
        // Video: need at least ~150kbps for usable quality
        if kbps >= 1200.0 { 1.0 }
        else if kbps >= 500.0 { 0.8 }
        else if kbps >= 250.0 { 0.6 }
        else if kbps >= 100.0 { 0.3 }
        else { 0.1 }
    } else {
        // Audio: need at least ~16kbps for usable Opus
        if kbps >= 48.0 { 1.0 }
        else if kbps >= 32.0 { 0.9 }
        else if kbps >= 20.0 { 0.6 }
        else if kbps >= 12.0 { 0.3 }
        else { 0.1 }
    }
}
