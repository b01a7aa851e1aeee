//! External encoder supervision
//!
//! Launches `ffmpeg` to turn the elementary video/audio streams into a
//! fragmented MP4: video on the primary input pipe, audio on an
//! auxiliary pipe at fd 3, combined fMP4 on the output pipe, diagnostics
//! on stderr.

use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as ParkingRwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::driver::VideoCodec;
use crate::error::{AppError, Result};

/// Encoder binary name; resolved through PATH
const ENCODER_BIN: &str = "ffmpeg";
/// Bounded wait between closing the inputs and force-killing
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
/// Diagnostic lines kept for post-mortem logging
const STDERR_TAIL_LINES: usize = 64;
/// Audio output bit rate (mono AAC)
const AUDIO_BITRATE: &str = "64k";

/// Encoder session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    Starting,
    Running,
    Draining,
    Terminated,
}

impl std::fmt::Display for EncoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderState::Idle => write!(f, "idle"),
            EncoderState::Starting => write!(f, "starting"),
            EncoderState::Running => write!(f, "running"),
            EncoderState::Draining => write!(f, "draining"),
            EncoderState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Tunables for one encoder invocation
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub input_codec: VideoCodec,
    /// Whether the livestream carries an AAC track on the auxiliary pipe
    pub audio: bool,
    pub preset: String,
    pub crf: u32,
    pub scale: Option<String>,
    pub threads: u32,
    pub short_keyframes: bool,
}

impl EncoderSettings {
    pub fn from_config(config: &AppConfig, input_codec: VideoCodec, audio: bool) -> Self {
        Self {
            input_codec,
            audio,
            preset: config.transcoding_preset.clone(),
            crf: config.transcoding_crf,
            scale: config.video_scale.clone(),
            threads: config.ffmpeg_threads,
            short_keyframes: config.short_keyframes,
        }
    }

    fn keyframe_interval(&self) -> u32 {
        if self.short_keyframes {
            15
        } else {
            30
        }
    }

    fn fragment_duration_us(&self) -> u32 {
        if self.short_keyframes {
            500_000
        } else {
            1_000_000
        }
    }

    /// Full argument vector for the streaming invocation
    pub fn build_args(&self) -> Vec<String> {
        let gop = self.keyframe_interval().to_string();
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-nostats".into(),
            "-fflags".into(),
            "+genpts+nobuffer".into(),
            "-use_wallclock_as_timestamps".into(),
            "1".into(),
            // Video elementary stream on the primary input pipe
            "-f".into(),
            self.input_codec.input_format().into(),
            "-i".into(),
            "pipe:0".into(),
        ];

        if self.audio {
            // Audio elementary stream on the auxiliary pipe
            args.extend([
                "-f".into(),
                "aac".into(),
                "-i".into(),
                "pipe:3".into(),
                "-map".into(),
                "0:v".into(),
                "-map".into(),
                "1:a".into(),
            ]);
        }

        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            self.preset.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-profile:v".into(),
            "main".into(),
            "-level:v".into(),
            "3.1".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-flags".into(),
            "+cgop".into(),
            "-g".into(),
            gop.clone(),
            "-keyint_min".into(),
            gop,
            "-sc_threshold".into(),
            "0".into(),
            "-x264-params".into(),
            "nal-hrd=cbr".into(),
        ]);

        if let Some(ref scale) = self.scale {
            args.push("-vf".into());
            args.push(format!("scale={}", scale));
        }

        if self.audio {
            args.extend([
                "-c:a".into(),
                "aac".into(),
                "-ac".into(),
                "1".into(),
                "-b:a".into(),
                AUDIO_BITRATE.into(),
            ]);
        }

        args.extend([
            "-threads".into(),
            self.threads.to_string(),
            "-f".into(),
            "mp4".into(),
            "-movflags".into(),
            "+frag_keyframe+empty_moov+default_base_moof+faststart".into(),
            "-frag_duration".into(),
            self.fragment_duration_us().to_string(),
            "-muxdelay".into(),
            "0".into(),
            "-muxpreload".into(),
            "0".into(),
            "-flush_packets".into(),
            "1".into(),
            "pipe:1".into(),
        ]);

        args
    }
}

/// One supervised encoder process
///
/// Exactly one session exists per active camera; a restart replaces the
/// session rather than mutating it.
pub struct EncoderSession {
    child: Mutex<Option<Child>>,
    video_in: Mutex<Option<ChildStdin>>,
    audio_in: Mutex<Option<pipe::Sender>>,
    output: Mutex<Option<ChildStdout>>,
    state: ParkingRwLock<EncoderState>,
    stderr_tail: Arc<ParkingRwLock<VecDeque<String>>>,
}

impl EncoderSession {
    /// Launch the encoder with the given settings
    pub fn spawn(settings: &EncoderSettings) -> Result<Arc<Self>> {
        let args = settings.build_args();
        tracing::info!(
            "Starting encoder: {} {} ({} in, GOP {})",
            ENCODER_BIN,
            args.join(" "),
            settings.input_codec,
            settings.keyframe_interval()
        );

        // Auxiliary audio pipe, handed to the child as fd 3
        let (audio_tx, audio_child_fd) = if settings.audio {
            let (tx, rx) =
                pipe::pipe().map_err(|e| AppError::Encoder(format!("audio pipe: {}", e)))?;
            let fd = rx
                .into_blocking_fd()
                .map_err(|e| AppError::Encoder(format!("audio pipe fd: {}", e)))?;
            (Some(tx), Some(fd))
        } else {
            (None, None)
        };

        let mut command = Command::new(ENCODER_BIN);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref fd) = audio_child_fd {
            let raw_audio_fd = fd.as_raw_fd();
            // dup2 clears CLOEXEC, so fd 3 survives the exec
            unsafe {
                command.pre_exec(move || {
                    if libc::dup2(raw_audio_fd, 3) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| AppError::Encoder(format!("failed to spawn {}: {}", ENCODER_BIN, e)))?;
        // Child owns its duplicate now
        drop(audio_child_fd);

        let video_in = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Encoder("encoder stdin unavailable".to_string()))?;
        let output = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Encoder("encoder stdout unavailable".to_string()))?;

        let stderr_tail = Arc::new(ParkingRwLock::new(VecDeque::with_capacity(
            STDERR_TAIL_LINES,
        )));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[encoder] {}", line);
                    let mut tail = tail.write();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        tracing::info!("Encoder started with PID {:?}", child.id());

        Ok(Arc::new(Self {
            child: Mutex::new(Some(child)),
            video_in: Mutex::new(Some(video_in)),
            audio_in: Mutex::new(audio_tx),
            output: Mutex::new(Some(output)),
            state: ParkingRwLock::new(EncoderState::Starting),
            stderr_tail,
        }))
    }

    pub fn state(&self) -> EncoderState {
        *self.state.read()
    }

    /// True while the session counts as transcoding (starting or running)
    pub fn is_transcoding(&self) -> bool {
        matches!(self.state(), EncoderState::Starting | EncoderState::Running)
    }

    /// Called by the output pump on the first byte read
    pub fn mark_running(&self) {
        let mut state = self.state.write();
        if *state == EncoderState::Starting {
            *state = EncoderState::Running;
            tracing::info!("Encoder produced first output, running");
        }
    }

    /// Take the output pipe; the single output pump owns it
    pub async fn take_output(&self) -> Option<ChildStdout> {
        self.output.lock().await.take()
    }

    /// Recent diagnostic lines, newest last
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.read().iter().cloned().collect()
    }

    /// Write one video frame to the primary input
    ///
    /// Write-after-close is reported as an error; the caller logs and
    /// drops, recovery is driven by the encoder exit itself.
    pub async fn write_video(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self.video_in.lock().await;
        match guard.as_mut() {
            Some(sink) => sink.write_all(data).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "video sink closed",
            )),
        }
    }

    /// Write one audio frame to the auxiliary input
    pub async fn write_audio(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self.audio_in.lock().await;
        match guard.as_mut() {
            Some(sink) => sink.write_all(data).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "audio sink closed",
            )),
        }
    }

    /// Graceful stop: close both inputs, wait bounded, then force-kill
    pub async fn drain(&self) {
        *self.state.write() = EncoderState::Draining;

        // Closing the sinks is the EOF signal the encoder flushes on
        self.video_in.lock().await.take();
        self.audio_in.lock().await.take();

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!("Encoder exited on drain: {}", status);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Encoder wait failed: {}", e);
                }
                Err(_) => {
                    tracing::warn!("Encoder did not drain in time, killing");
                    let _ = child.kill().await;
                }
            }
        }

        *self.state.write() = EncoderState::Terminated;
    }

    /// Reap an exited child after the output pump saw EOF
    pub async fn finish(&self) -> Option<std::process::ExitStatus> {
        let status = {
            let mut guard = self.child.lock().await;
            match guard.take() {
                Some(mut child) => match tokio::time::timeout(DRAIN_TIMEOUT, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(e)) => {
                        tracing::warn!("Encoder wait failed: {}", e);
                        None
                    }
                    Err(_) => {
                        let _ = child.kill().await;
                        None
                    }
                },
                None => None,
            }
        };
        *self.state.write() = EncoderState::Terminated;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(short: bool, scale: Option<&str>) -> EncoderSettings {
        EncoderSettings {
            input_codec: VideoCodec::H264,
            audio: true,
            preset: "veryfast".to_string(),
            crf: 23,
            scale: scale.map(|s| s.to_string()),
            threads: 2,
            short_keyframes: short,
        }
    }

    #[test]
    fn test_args_standard_mode() {
        let args = settings(false, None).build_args();
        let joined = args.join(" ");
        assert!(joined.contains("-f h264 -i pipe:0"));
        assert!(joined.contains("-f aac -i pipe:3"));
        assert!(joined.contains("-g 30 -keyint_min 30"));
        assert!(joined.contains("-frag_duration 1000000"));
        assert!(joined.contains("-sc_threshold 0"));
        assert!(joined.contains("-profile:v main -level:v 3.1"));
        assert!(joined.contains("-c:a aac -ac 1"));
        assert!(joined.ends_with("pipe:1"));
        assert!(!joined.contains("-vf"));
    }

    #[test]
    fn test_args_short_keyframes_and_scale() {
        let args = settings(true, Some("1280:-2")).build_args();
        let joined = args.join(" ");
        assert!(joined.contains("-g 15 -keyint_min 15"));
        assert!(joined.contains("-frag_duration 500000"));
        assert!(joined.contains("-vf scale=1280:-2"));
    }

    #[test]
    fn test_args_hevc_input() {
        let mut s = settings(false, None);
        s.input_codec = VideoCodec::H265;
        let joined = s.build_args().join(" ");
        assert!(joined.contains("-f hevc -i pipe:0"));
    }

    #[test]
    fn test_args_video_only() {
        let mut s = settings(false, None);
        s.audio = false;
        let joined = s.build_args().join(" ");
        assert!(!joined.contains("pipe:3"));
        assert!(!joined.contains("-c:a"));
        assert!(!joined.contains("-map"));
        assert!(joined.ends_with("pipe:1"));
    }
}
