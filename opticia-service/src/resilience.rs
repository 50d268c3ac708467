//! Per-connection degradation trackers.
//!
//! The fallback tracker walks the media chain video → photo → text (plus
//! audio → text), and the network monitor grades connection quality from a
//! sliding latency window and frame loss. Both are keyed by connection id
//! and must be cleaned up when the connection goes away.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use strum::{Display, EnumString};
use tracing::info;

/// Media the client is currently using
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MediaMode {
    #[default]
    Video,
    Photo,
    Text,
}

/// Which fallback the client asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FallbackKind {
    Video,
    Photo,
    Audio,
}

#[derive(Debug, Clone)]
struct FallbackState {
    current_mode: MediaMode,
    audio_available: bool,
    fallback_count: u32,
}

impl Default for FallbackState {
    fn default() -> Self {
        Self {
            current_mode: MediaMode::Video,
            audio_available: true,
            fallback_count: 0,
        }
    }
}

/// Result of a fallback or recovery request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    Activated {
        from: MediaMode,
        to: MediaMode,
        reason: String,
        message: &'static str,
        can_recover: bool,
    },
    AudioDisabled {
        reason: String,
        message: &'static str,
    },
    Recovered {
        mode: MediaMode,
        message: &'static str,
    },
    NoChange {
        current_mode: MediaMode,
        audio_enabled: bool,
    },
}

#[derive(Debug, Default)]
pub struct FallbackTracker {
    connections: DashMap<String, FallbackState>,
}

impl FallbackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, conn_id: &str, kind: FallbackKind, reason: &str) -> FallbackOutcome {
        let mut state = self.connections.entry(conn_id.to_string()).or_default();
        let outcome = match kind {
            FallbackKind::Video if state.current_mode == MediaMode::Video => {
                state.current_mode = MediaMode::Photo;
                FallbackOutcome::Activated {
                    from: MediaMode::Video,
                    to: MediaMode::Photo,
                    reason: reason.to_string(),
                    message: "Switched to photo mode for better stability",
                    can_recover: true,
                }
            }
            FallbackKind::Photo if state.current_mode != MediaMode::Text => {
                state.current_mode = MediaMode::Text;
                FallbackOutcome::Activated {
                    from: MediaMode::Photo,
                    to: MediaMode::Text,
                    reason: reason.to_string(),
                    message: "Switched to text mode. You can describe what you see.",
                    can_recover: false,
                }
            }
            FallbackKind::Audio if state.audio_available => {
                state.audio_available = false;
                FallbackOutcome::AudioDisabled {
                    reason: reason.to_string(),
                    message: "Voice unavailable. Using text input/output.",
                }
            }
            _ => {
                return FallbackOutcome::NoChange {
                    current_mode: state.current_mode,
                    audio_enabled: state.audio_available,
                };
            }
        };

        state.fallback_count += 1;
        metrics::counter!("opticia_fallbacks_total", "kind" => kind.to_string()).increment(1);
        info!(
            conn_id = %conn_id,
            kind = %kind,
            reason = %reason,
            count = state.fallback_count,
            "Fallback activated"
        );
        outcome
    }

    pub fn recover(&self, conn_id: &str, mode: MediaMode) -> FallbackOutcome {
        let mut state = self.connections.entry(conn_id.to_string()).or_default();
        match mode {
            MediaMode::Video if state.current_mode != MediaMode::Video => {
                state.current_mode = MediaMode::Video;
                info!(conn_id = %conn_id, "Recovered to video mode");
                FallbackOutcome::Recovered {
                    mode,
                    message: "Video streaming restored",
                }
            }
            MediaMode::Photo if state.current_mode == MediaMode::Text => {
                state.current_mode = MediaMode::Photo;
                info!(conn_id = %conn_id, "Recovered to photo mode");
                FallbackOutcome::Recovered {
                    mode,
                    message: "Photo capture restored",
                }
            }
            _ => FallbackOutcome::NoChange {
                current_mode: state.current_mode,
                audio_enabled: state.audio_available,
            },
        }
    }

    #[cfg(test)]
    pub fn current_mode(&self, conn_id: &str) -> MediaMode {
        self.connections
            .get(conn_id)
            .map(|s| s.current_mode)
            .unwrap_or_default()
    }

    pub fn cleanup(&self, conn_id: &str) {
        self.connections.remove(conn_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetworkQuality {
    Excellent,
    #[default]
    Good,
    Degraded,
    Poor,
}

impl NetworkQuality {
    fn from_latency(avg_ms: f64) -> Self {
        if avg_ms <= 100.0 {
            NetworkQuality::Excellent
        } else if avg_ms <= 300.0 {
            NetworkQuality::Good
        } else if avg_ms <= 600.0 {
            NetworkQuality::Degraded
        } else {
            NetworkQuality::Poor
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub quality: NetworkQuality,
    pub avg_latency_ms: f64,
    pub packet_loss_percent: f64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub last_ping_ms: f64,
}

#[derive(Debug, Default)]
struct NetworkSamples {
    latencies: VecDeque<f64>,
    frames_sent: u64,
    frames_dropped: u64,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug)]
pub struct NetworkMonitor {
    window_size: usize,
    connections: DashMap<String, NetworkSamples>,
}

impl NetworkMonitor {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            connections: DashMap::new(),
        }
    }

    pub fn record_latency(&self, conn_id: &str, latency_ms: f64) {
        let mut samples = self.connections.entry(conn_id.to_string()).or_default();
        samples.latencies.push_back(latency_ms.max(0.0));
        while samples.latencies.len() > self.window_size {
            samples.latencies.pop_front();
        }
    }

    pub fn record_frame_sent(&self, conn_id: &str) {
        self.connections
            .entry(conn_id.to_string())
            .or_default()
            .frames_sent += 1;
    }

    pub fn record_frame_dropped(&self, conn_id: &str) {
        self.connections
            .entry(conn_id.to_string())
            .or_default()
            .frames_dropped += 1;
    }

    pub fn stats(&self, conn_id: &str) -> NetworkStats {
        let Some(samples) = self.connections.get(conn_id) else {
            return NetworkStats::default();
        };
        let Some(&last) = samples.latencies.back() else {
            return NetworkStats::default();
        };

        let avg = samples.latencies.iter().sum::<f64>() / samples.latencies.len() as f64;
        let total = samples.frames_sent + samples.frames_dropped;
        let loss = if total > 0 {
            samples.frames_dropped as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let mut quality = NetworkQuality::from_latency(avg);
        if loss > 10.0 {
            quality = NetworkQuality::Poor;
        } else if loss > 5.0 {
            quality = quality.max(NetworkQuality::Degraded);
        }

        NetworkStats {
            quality,
            avg_latency_ms: round1(avg),
            packet_loss_percent: round1(loss),
            frames_sent: samples.frames_sent,
            frames_dropped: samples.frames_dropped,
            last_ping_ms: round1(last),
        }
    }

    /// A suggestion to degrade media, when quality warrants one
    pub fn fallback_suggestion(&self, conn_id: &str) -> Option<(&'static str, NetworkStats)> {
        let stats = self.stats(conn_id);
        match stats.quality {
            NetworkQuality::Poor => Some((
                "Network quality is poor. Consider switching to photo mode.",
                stats,
            )),
            NetworkQuality::Degraded if stats.packet_loss_percent > 5.0 => Some((
                "Experiencing packet loss. Photo mode may be more stable.",
                stats,
            )),
            _ => None,
        }
    }

    pub fn cleanup(&self, conn_id: &str) {
        self.connections.remove(conn_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
