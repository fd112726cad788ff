//! Local media capability
//!
//! The core never captures frames itself. A [`MediaProvider`] hands out a
//! [`LocalMedia`] whose tracks get attached to the transport; whoever owns the
//! camera and microphone feeds samples into those tracks.

use super::types::MediaConstraints;
use crate::error::{Error, Result};
use crate::utils::random_id;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Camera/microphone acquisition
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<Arc<dyn LocalMedia>>;
}

/// Acquired local media; `stop` releases the devices
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>>;
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);
    fn audio_enabled(&self) -> bool;
    fn video_enabled(&self) -> bool;
    fn stop(&self);
}

/// Sample-fed tracks (Opus audio, VP8 video)
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackCapture;

#[async_trait]
impl MediaProvider for TrackCapture {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<Arc<dyn LocalMedia>> {
        if !constraints.audio && !constraints.video {
            return Err(Error::MediaAccess("neither audio nor video requested".into()));
        }

        let stream_id = format!("peercall-{}", random_id());
        let audio = constraints.audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_owned(),
                stream_id.clone(),
            ))
        });
        let video = constraints.video.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_owned(),
                stream_id.clone(),
            ))
        });

        info!(
            "Local media ready: stream={stream_id} audio={} video={} ({}x{}@{})",
            audio.is_some(),
            video.is_some(),
            constraints.width,
            constraints.height,
            constraints.frame_rate
        );

        Ok(Arc::new(CapturedMedia {
            constraints: constraints.clone(),
            audio,
            video,
            audio_on: AtomicBool::new(true),
            video_on: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }))
    }
}

pub struct CapturedMedia {
    constraints: MediaConstraints,
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio_on: AtomicBool,
    video_on: AtomicBool,
    stopped: AtomicBool,
}

impl CapturedMedia {
    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    /// Pushes one encoded audio frame; dropped while muted or stopped
    pub async fn write_audio(&self, sample: &Sample) -> Result<()> {
        match &self.audio {
            Some(track) if self.audio_enabled() && !self.is_stopped() => {
                Ok(track.write_sample(sample).await?)
            }
            _ => Ok(()),
        }
    }

    /// Pushes one encoded video frame; dropped while disabled or stopped
    pub async fn write_video(&self, sample: &Sample) -> Result<()> {
        match &self.video {
            Some(track) if self.video_enabled() && !self.is_stopped() => {
                Ok(track.write_sample(sample).await?)
            }
            _ => Ok(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalMedia for CapturedMedia {
    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();
        if let Some(audio) = &self.audio {
            tracks.push(audio.clone());
        }
        if let Some(video) = &self.video {
            tracks.push(video.clone());
        }
        tracks
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_on.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_on.store(enabled, Ordering::SeqCst);
    }

    fn audio_enabled(&self) -> bool {
        self.audio.is_some() && self.audio_on.load(Ordering::SeqCst)
    }

    fn video_enabled(&self) -> bool {
        self.video.is_some() && self.video_on.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Local media stopped");
        }
    }
}
