//! External transcoder supervision.
//!
//! The relay does not encode H.264 itself: it drives an ffmpeg child that
//! reads the RTSP source (or a synthetic test pattern when none is
//! configured) and writes a raw Annex-B elementary stream to stdout. This
//! module spawns that child, classifies its stderr, extracts the observed
//! frame rate, and folds exit, stdout-EOF and fatal stderr into one event
//! stream owned by a single supervisor task.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, TranscoderErrorKind};

/// What the transcoder reads.
#[derive(Debug, Clone)]
pub enum SourceProfile {
    Rtsp { url: String },
    TestPattern { width: u32, height: u32, fps: u32 },
}

/// Events surfaced by the driver. The first fatal event wins; later ones are
/// silently dropped by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    ExitedClean,
    ExitedWithError(String),
    FatalStderr(String),
    FpsDetected(u32),
}

/// Handle to a running transcoder child. Dropping the handle kills the
/// child; `close` does so deterministically and lets the supervisor reap it.
#[derive(Debug)]
pub struct TranscoderDriver {
    events: mpsc::UnboundedReceiver<DriverEvent>,
    shutdown: CancellationToken,
}

impl TranscoderDriver {
    /// Spawns the transcoder and returns the driver together with the
    /// child's stdout byte stream.
    pub async fn start(
        profile: &SourceProfile,
        fps: u32,
    ) -> Result<(TranscoderDriver, ChildStdout), Error> {
        let encoder = detect_encoder().await;
        tracing::info!("using H.264 encoder: {}", encoder.name);

        let args = build_args(profile, &encoder, fps);
        tracing::debug!("ffmpeg arguments: {:?}", args);

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                let kind = if err.kind() == std::io::ErrorKind::NotFound {
                    TranscoderErrorKind::BinaryMissingError
                } else {
                    TranscoderErrorKind::SpawnFailedError
                };
                Error::new_transcoder(format!("failed to spawn ffmpeg: {}", err), kind)
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::new_transcoder(
                "ffmpeg stdout pipe missing".to_owned(),
                TranscoderErrorKind::SpawnFailedError,
            )
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            Error::new_transcoder(
                "ffmpeg stderr pipe missing".to_owned(),
                TranscoderErrorKind::SpawnFailedError,
            )
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        // Stderr runs on its own task so stdout never blocks on log volume.
        {
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut last_fps = 0u32;
                let mut fatal_reported = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    let lower = line.to_lowercase();
                    if is_suppressed_line(&lower) {
                        continue;
                    }
                    if let Some(fps) = parse_frame_rate(&line) {
                        if fps != last_fps {
                            last_fps = fps;
                            let _ = events_tx.send(DriverEvent::FpsDetected(fps));
                        }
                    }
                    if is_fatal_line(&lower) {
                        if !fatal_reported {
                            fatal_reported = true;
                            tracing::error!("ffmpeg fatal: {}", line);
                            let _ = events_tx.send(DriverEvent::FatalStderr(line));
                        }
                        continue;
                    }
                    tracing::debug!("ffmpeg: {}", line);
                }
            });
        }

        // The supervisor owns the child: it observes termination and handles
        // the kill on close, so nothing else ever touches the process.
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        let event = match status {
                            Ok(status) if status.success() => DriverEvent::ExitedClean,
                            Ok(status) => {
                                DriverEvent::ExitedWithError(format!("ffmpeg exited: {}", status))
                            }
                            Err(err) => {
                                DriverEvent::ExitedWithError(format!("ffmpeg wait failed: {}", err))
                            }
                        };
                        let _ = events_tx.send(event);
                    }
                    _ = shutdown.cancelled() => {
                        if let Err(err) = child.start_kill() {
                            tracing::debug!("ffmpeg already gone on close: {}", err);
                        }
                        let _ = child.wait().await;
                        tracing::debug!("ffmpeg reaped on close");
                    }
                }
            });
        }

        Ok((
            TranscoderDriver {
                events: events_rx,
                shutdown,
            },
            stdout,
        ))
    }

    /// Non-blocking event check.
    pub fn poll(&mut self) -> Option<DriverEvent> {
        self.events.try_recv().ok()
    }

    /// Waits for the next driver event; `None` after the supervisor is gone.
    pub async fn recv(&mut self) -> Option<DriverEvent> {
        self.events.recv().await
    }

    /// Terminates the child and lets the supervisor reap it. Safe to call
    /// more than once.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TranscoderDriver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone)]
struct Encoder {
    name: String,
    extra_args: Vec<String>,
}

impl Encoder {
    fn software() -> Self {
        Encoder {
            name: "libx264".to_owned(),
            extra_args: vec![
                "-preset".to_owned(),
                "ultrafast".to_owned(),
                "-tune".to_owned(),
                "zerolatency".to_owned(),
                "-x264-params".to_owned(),
                "keyint=10:scenecut=0:force-cfr=1:sync-lookahead=0:sliced-threads=1:threads=auto"
                    .to_owned(),
            ],
        }
    }

    fn vaapi() -> Self {
        Encoder {
            name: "h264_vaapi".to_owned(),
            extra_args: vec![
                "-vaapi_device".to_owned(),
                "/dev/dri/renderD128".to_owned(),
                "-b:v".to_owned(),
                "2M".to_owned(),
                "-maxrate".to_owned(),
                "2M".to_owned(),
                "-bufsize".to_owned(),
                "2M".to_owned(),
                "-rc_mode".to_owned(),
                "VBR".to_owned(),
                "-low_power".to_owned(),
                "1".to_owned(),
            ],
        }
    }

    fn nvenc() -> Self {
        Encoder {
            name: "h264_nvenc".to_owned(),
            extra_args: vec![
                "-preset".to_owned(),
                "p1".to_owned(),
                "-rc".to_owned(),
                "vbr".to_owned(),
                "-tune".to_owned(),
                "ll".to_owned(),
                "-zerolatency".to_owned(),
                "1".to_owned(),
                "-delay".to_owned(),
                "0".to_owned(),
                "-rc-lookahead".to_owned(),
                "0".to_owned(),
            ],
        }
    }

    fn videotoolbox() -> Self {
        Encoder {
            name: "h264_videotoolbox".to_owned(),
            extra_args: vec![
                "-allow_sw".to_owned(),
                "1".to_owned(),
                "-realtime".to_owned(),
                "1".to_owned(),
                "-b:v".to_owned(),
                "2M".to_owned(),
                "-prio_speed".to_owned(),
                "1".to_owned(),
            ],
        }
    }
}

/// Picks a hardware encoder when one is verifiably functional, otherwise
/// software. Hardware probes must pass a real one-frame test encode; a
/// device node alone is not proof the driver works.
async fn detect_encoder() -> Encoder {
    let listed = match Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .output()
        .await
    {
        Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
        Err(_) => return Encoder::software(),
    };

    if cfg!(target_os = "macos") && listed.contains("h264_videotoolbox") {
        return Encoder::videotoolbox();
    }

    if cfg!(target_os = "linux") {
        if listed.contains("h264_vaapi") && vaapi_device_works().await {
            return Encoder::vaapi();
        }
        if listed.contains("h264_nvenc") {
            return Encoder::nvenc();
        }
    }

    Encoder::software()
}

async fn vaapi_device_works() -> bool {
    let has_device = ["renderD128", "renderD129", "renderD130"]
        .iter()
        .any(|node| std::path::Path::new("/dev/dri").join(node).exists());
    if !has_device {
        return false;
    }
    // The device node can exist while the driver is broken; only a real
    // encode proves it.
    Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-f",
            "lavfi",
            "-i",
            "testsrc=duration=0.1:size=320x240:rate=1",
            "-c:v",
            "h264_vaapi",
            "-vaapi_device",
            "/dev/dri/renderD128",
            "-frames:v",
            "1",
            "-f",
            "null",
            "-",
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

fn build_args(profile: &SourceProfile, encoder: &Encoder, fps: u32) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    match profile {
        SourceProfile::Rtsp { url } => {
            args.extend(
                [
                    "-rtsp_transport",
                    "tcp",
                    "-fflags",
                    "nobuffer+flush_packets",
                    "-flags",
                    "low_delay",
                    "-strict",
                    "experimental",
                    "-analyzeduration",
                    "200000",
                    "-probesize",
                    "200000",
                    "-err_detect",
                    "ignore_err",
                    "-i",
                ]
                .map(str::to_owned),
            );
            args.push(url.clone());
        }
        SourceProfile::TestPattern { width, height, fps } => {
            args.extend(["-f", "lavfi", "-i"].map(str::to_owned));
            args.push(format!("testsrc=size={}x{}:rate={}", width, height, fps));
        }
    }

    args.extend(["-c:v".to_owned(), encoder.name.clone()]);
    args.extend(
        [
            "-profile:v",
            "baseline",
            "-level",
            "3.1",
            "-pix_fmt",
            "yuv420p",
            "-color_range",
            "pc",
            "-colorspace",
            "bt709",
            "-color_primaries",
            "bt709",
            "-color_trc",
            "bt709",
            "-bf",
            "0",
            "-g",
        ]
        .map(str::to_owned),
    );
    // One keyframe per second so a joining viewer decodes quickly.
    args.push(fps.max(1).to_string());
    args.extend(
        [
            "-bsf:v",
            "h264_mp4toannexb",
            "-f",
            "h264",
            "-flush_packets",
            "1",
        ]
        .map(str::to_owned),
    );
    args.extend(encoder.extra_args.iter().cloned());
    args.push("-".to_owned());
    args
}

/// Fatal patterns: source unreachable, input open failure, or a hardware
/// encoder that did not come up.
fn is_fatal_line(lower: &str) -> bool {
    lower.contains("404")
        || lower.contains("connection refused")
        || lower.contains("failed")
        || lower.contains("error opening input")
        || is_hardware_encoder_failure(lower)
}

fn is_hardware_encoder_failure(lower: &str) -> bool {
    lower.contains("vaapi")
        && (lower.contains("failed")
            || lower.contains("error")
            || lower.contains("device creation failed")
            || lower.contains("failed to initialise")
            || lower.contains("input/output error"))
}

/// Mid-stream decoder noise that is expected when joining a stream between
/// keyframes, plus the software-scaler performance notice. Neither is logged
/// nor treated as fatal.
fn is_suppressed_line(lower: &str) -> bool {
    let hevc_warning = lower.contains("[hevc @")
        && (lower.contains("could not find ref with poc")
            || lower.contains("error constructing the frame rps")
            || lower.contains("skipping invalid undecodable nalu")
            || lower.contains("pps id out of range"));
    let scaler_warning =
        lower.contains("[swscaler @") && lower.contains("no accelerated colorspace conversion");
    hevc_warning || scaler_warning
}

/// Extracts the frame rate from stderr lines carrying `fps` or `tbr`
/// tokens, e.g. `... 1280x720, 15 fps, 15 tbr, 90k tbn`.
fn parse_frame_rate(line: &str) -> Option<u32> {
    if !line.contains(" fps") && !line.contains(" tbr") {
        return None;
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        let bare = token.trim_end_matches(',');
        if (bare == "fps" || bare == "tbr") && i > 0 {
            if let Ok(fps) = tokens[i - 1].trim_end_matches(',').parse::<u32>() {
                if fps > 0 {
                    return Some(fps);
                }
            }
        }
    }
    None
}
