//! Ingest pipeline wiring.
//!
//! Connects the transcoder's stdout to the access-unit assembler and the
//! frame distributor, and carries driver events (fatal errors, detected
//! frame rate) to the consumer. The stdout reader, the stderr classifier and
//! the process waiter all run on independent tasks, so a burst of stderr
//! can never stall the byte stream.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::assembler::AccessUnitAssembler;
use crate::config::VideoConfig;
use crate::distributor::{frame_channel, FrameReceiver};
use crate::error::Error;
use crate::transcoder::{DriverEvent, SourceProfile, TranscoderDriver};

const READ_CHUNK: usize = 8 * 1024;
const FRAME_QUEUE_CAPACITY: usize = 4;

/// A running ingest pipeline. Frames come out of `frames`; fatal transcoder
/// conditions arrive on `events`; `fps` tracks the frame rate observed on
/// the stream (initially the configured one).
#[derive(Debug)]
pub struct IngestPipeline {
    pub frames: FrameReceiver,
    pub events: mpsc::UnboundedReceiver<DriverEvent>,
    pub fps: watch::Receiver<u32>,
    stop: CancellationToken,
}

impl IngestPipeline {
    /// Spawns the transcoder and the reader tasks. When `rtsp_url` is unset
    /// the synthetic test pattern drives the same pipeline.
    pub async fn start(video: &VideoConfig) -> Result<IngestPipeline, Error> {
        let profile = match &video.rtsp_url {
            Some(url) => {
                tracing::info!("starting RTSP ingest from {}", url);
                SourceProfile::Rtsp { url: url.clone() }
            }
            None => {
                tracing::info!("RTSP_URL not set, using test pattern source");
                SourceProfile::TestPattern {
                    width: video.width,
                    height: video.height,
                    fps: video.fps,
                }
            }
        };

        let (mut driver, mut stdout) = TranscoderDriver::start(&profile, video.fps).await?;

        let (frame_tx, frame_rx) = frame_channel(FRAME_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (fps_tx, fps_rx) = watch::channel(video.fps);
        let stop = CancellationToken::new();

        // Stdout reader: chunks into the assembler, completed units into the
        // distributor with its newest-wins policy.
        {
            let stop = stop.clone();
            let mut fps_rx = fps_rx.clone();
            let initial_fps = video.fps.max(1);
            tokio::spawn(async move {
                let mut assembler =
                    AccessUnitAssembler::new(Duration::from_secs(1) / initial_fps);
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        read = stdout.read(&mut chunk) => match read {
                            Ok(0) => {
                                tracing::warn!("transcoder stdout closed");
                                break;
                            }
                            Ok(n) => {
                                if fps_rx.has_changed().unwrap_or(false) {
                                    let fps = (*fps_rx.borrow_and_update()).max(1);
                                    assembler.set_frame_duration(Duration::from_secs(1) / fps);
                                }
                                for unit in assembler.push_chunk(&chunk[..n]) {
                                    frame_tx.send(unit);
                                }
                            }
                            Err(err) => {
                                tracing::error!("failed to read transcoder stdout: {}", err);
                                break;
                            }
                        }
                    }
                }
                frame_tx.close();
                tracing::debug!("ingest reader finished after {} units", assembler.emitted());
            });
        }

        // Event forwarder: fps updates go to the watch channel, everything
        // else (exit, fatal stderr) to the consumer.
        {
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => {
                            driver.close();
                            break;
                        }
                        event = driver.recv() => match event {
                            Some(DriverEvent::FpsDetected(fps)) => {
                                tracing::info!("detected stream frame rate: {} fps", fps);
                                let _ = fps_tx.send(fps);
                            }
                            Some(event) => {
                                let _ = event_tx.send(event);
                            }
                            None => break,
                        }
                    }
                }
                tracing::debug!("ingest event forwarder finished");
            });
        }

        Ok(IngestPipeline {
            frames: frame_rx,
            events: event_rx,
            fps: fps_rx,
            stop,
        })
    }

    /// Stops the reader tasks and terminates the transcoder child.
    pub fn close(&self) {
        self.stop.cancel();
    }
}

impl Drop for IngestPipeline {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
