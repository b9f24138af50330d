//! Fan-out engine.
//!
//! One shared H.264 sample track feeds every connected viewer; per-viewer
//! peer connections reference it, so writing an access unit once delivers
//! it to all of them. The publisher dials the signaling broker, reacts to
//! `viewer_connected` notifications, routes answers and candidates to the
//! addressed entry, and keeps reconnecting to the broker with bounded
//! backoff when the socket drops. Existing viewers survive transient
//! reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::Config;
use crate::error::{Error, SignalingErrorKind};
use crate::ice;
use crate::ingest::IngestPipeline;
use crate::nal::contains_idr;
use crate::protocol::SignalMessage;
use crate::transcoder::DriverEvent;
use crate::viewer::{Viewer, ViewerState, ViewerUpdate};

/// Broker pings roughly once a minute; a silent socket past this deadline is
/// dead.
const READ_DEADLINE: Duration = Duration::from_secs(90);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// How long the writer waits for a frame before treating the tick as a
/// transient gap.
const FRAME_READ_DEADLINE: Duration = Duration::from_millis(200);
/// Informational notice when the transcoder has produced nothing yet.
const FIRST_FRAME_WATCHDOG: Duration = Duration::from_secs(15);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Publisher {
    signaling_url: String,
    #[derivative(Debug = "ignore")]
    api: API,
    #[derivative(Debug = "ignore")]
    rtc_config: RTCConfiguration,
    #[derivative(Debug = "ignore")]
    track: Arc<TrackLocalStaticSample>,
    viewers: Arc<RwLock<HashMap<String, Arc<Viewer>>>>,
    updates_sender: mpsc::UnboundedSender<ViewerUpdate>,
    updates_receiver: Mutex<Option<mpsc::UnboundedReceiver<ViewerUpdate>>>,
    stop: CancellationToken,
}

impl Publisher {
    pub fn new(config: &Config) -> Result<Publisher, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        // The one encoded track every viewer references. The ingest path is
        // H.264 end to end, test pattern included.
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            "camrelay".to_owned(),
        ));

        let (updates_sender, updates_receiver) = mpsc::unbounded_channel();

        Ok(Publisher {
            signaling_url: config.signaling_url(),
            api,
            rtc_config: ice::rtc_configuration(&config.webrtc),
            track,
            viewers: Arc::new(RwLock::new(HashMap::new())),
            updates_sender,
            updates_receiver: Mutex::new(Some(updates_receiver)),
            stop: CancellationToken::new(),
        })
    }

    /// Runs the writer task and the signaling session until shutdown.
    pub async fn run(&self, pipeline: IngestPipeline) -> Result<(), Error> {
        let mut updates = self.updates_receiver.lock().await.take().ok_or_else(|| {
            Error::new_signaling(
                "publisher is already running".to_owned(),
                SignalingErrorKind::ConnectionError,
            )
        })?;

        {
            let track = self.track.clone();
            let stop = self.stop.clone();
            tokio::spawn(async move {
                write_frames(track, pipeline, stop).await;
            });
        }

        let mut backoff = Duration::from_secs(1);
        while !self.stop.is_cancelled() {
            match connect_async(&self.signaling_url).await {
                Ok((socket, _response)) => {
                    tracing::info!("connected to signaling broker at {}", self.signaling_url);
                    backoff = Duration::from_secs(1);
                    let (mut sink, mut stream) = socket.split();
                    match self.session(&mut sink, &mut stream, &mut updates).await {
                        Ok(()) => break,
                        Err(err) => tracing::warn!("signaling session ended: {}", err),
                    }
                }
                Err(err) => {
                    tracing::warn!("failed to reach signaling broker: {}", err);
                }
            }
            if self.stop.is_cancelled() {
                break;
            }
            tracing::info!("reconnecting to signaling broker in {:?}", backoff);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.stop.cancelled() => break,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        self.close_all_viewers().await;
        tracing::info!("publisher stopped");
        Ok(())
    }

    /// Signals shutdown: the writer stops, the transcoder child is closed,
    /// viewers are torn down and the socket is closed with a normal-closure
    /// frame.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    async fn session(
        &self,
        sink: &mut SplitSink<WsStream, Message>,
        stream: &mut SplitStream<WsStream>,
        updates: &mut mpsc::UnboundedReceiver<ViewerUpdate>,
    ) -> Result<(), Error> {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                update = updates.recv() => match update {
                    Some(ViewerUpdate::Signal(message)) => {
                        self.send_signal(sink, &message).await?;
                    }
                    Some(ViewerUpdate::Closed(client_id)) => {
                        self.remove_closed_viewer(&client_id).await;
                    }
                    None => {
                        return Err(Error::new_signaling(
                            "viewer update channel closed".to_owned(),
                            SignalingErrorKind::ConnectionError,
                        ));
                    }
                },
                read = tokio::time::timeout(READ_DEADLINE, stream.next()) => match read {
                    Err(_) => {
                        return Err(Error::new_signaling(
                            "read deadline elapsed".to_owned(),
                            SignalingErrorKind::ConnectionError,
                        ));
                    }
                    Ok(None) => {
                        return Err(Error::new_signaling(
                            "socket closed".to_owned(),
                            SignalingErrorKind::ConnectionError,
                        ));
                    }
                    Ok(Some(Err(err))) => {
                        return Err(Error::new_signaling(
                            format!("read failed: {}", err),
                            SignalingErrorKind::ConnectionError,
                        ));
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        self.handle_message(&text).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        return Err(Error::new_signaling(
                            "closed by broker".to_owned(),
                            SignalingErrorKind::ConnectionError,
                        ));
                    }
                    // Pings are answered by the protocol layer; any read
                    // refreshes the deadline simply by completing.
                    Ok(Some(Ok(_))) => {}
                },
            }
        }
    }

    async fn send_signal(
        &self,
        sink: &mut SplitSink<WsStream, Message>,
        message: &SignalMessage,
    ) -> Result<(), Error> {
        let text = serde_json::to_string(message).map_err(|err| {
            Error::new_signaling(
                format!("failed to serialize message: {}", err),
                SignalingErrorKind::SendError,
            )
        })?;
        match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::new_signaling(
                format!("write failed: {}", err),
                SignalingErrorKind::SendError,
            )),
            Err(_) => Err(Error::new_signaling(
                "write deadline elapsed".to_owned(),
                SignalingErrorKind::SendError,
            )),
        }
    }

    async fn handle_message(&self, text: &str) {
        let message: SignalMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!("failed to parse signaling message: {}\n{}", err, text);
                return;
            }
        };

        match message {
            SignalMessage::ViewerConnected { client_id } => {
                self.accept_viewer(client_id).await;
            }
            SignalMessage::Answer {
                client_id,
                from_client_id,
                answer,
            } => {
                let Some(target) = client_id.or(from_client_id) else {
                    tracing::warn!("answer without clientId or fromClientId, dropping");
                    return;
                };
                let Some(viewer) = self.find_viewer(&target).await else {
                    tracing::warn!("answer from unknown viewer {}, dropping", target);
                    return;
                };
                if let Err(err) = viewer.apply_answer(answer).await {
                    tracing::error!("viewer {} failed to apply answer: {}", target, err);
                    viewer.close();
                }
            }
            SignalMessage::Candidate {
                client_id,
                from_client_id,
                candidate,
            } => {
                let Some(target) = client_id.or(from_client_id) else {
                    tracing::warn!("candidate without clientId or fromClientId, dropping");
                    return;
                };
                let Some(viewer) = self.find_viewer(&target).await else {
                    tracing::warn!("candidate from unknown viewer {}, dropping", target);
                    return;
                };
                if let Err(err) = viewer.add_remote_candidate(candidate).await {
                    tracing::error!("viewer {} failed to add candidate: {}", target, err);
                    viewer.close();
                }
            }
            SignalMessage::Offer { .. } | SignalMessage::Unknown => {
                tracing::debug!("ignoring signaling message: {}", text);
            }
        }
    }

    async fn accept_viewer(&self, client_id: String) {
        let existing = { self.viewers.write().await.remove(&client_id) };
        if let Some(old) = existing {
            tracing::warn!("viewer {} already exists, closing old entry first", client_id);
            old.close();
        }

        let viewer = match Viewer::new(
            client_id.clone(),
            &self.api,
            self.rtc_config.clone(),
            self.track.clone(),
            self.updates_sender.clone(),
        )
        .await
        {
            Ok(viewer) => viewer,
            Err(err) => {
                tracing::error!("failed to create viewer {}: {}", client_id, err);
                return;
            }
        };

        let active = {
            let mut viewers = self.viewers.write().await;
            viewers.insert(client_id.clone(), viewer.clone());
            viewers.len()
        };
        tracing::info!("viewer {} joined ({} active)", client_id, active);

        if let Err(err) = viewer.send_offer().await {
            tracing::error!("failed to send offer to viewer {}: {}", client_id, err);
            viewer.close();
        }
    }

    async fn find_viewer(&self, client_id: &str) -> Option<Arc<Viewer>> {
        self.viewers.read().await.get(client_id).cloned()
    }

    /// Removes an entry retired by its supervisor. A replacement entry
    /// registered under the same id in the meantime is left alone.
    async fn remove_closed_viewer(&self, client_id: &str) {
        let mut viewers = self.viewers.write().await;
        let closed = viewers
            .get(client_id)
            .map(|viewer| viewer.state() == ViewerState::Closed)
            .unwrap_or(false);
        if closed {
            viewers.remove(client_id);
            tracing::info!("viewer {} removed ({} remaining)", client_id, viewers.len());
        }
    }

    async fn close_all_viewers(&self) {
        let drained: Vec<Arc<Viewer>> = {
            let mut viewers = self.viewers.write().await;
            viewers.drain().map(|(_, viewer)| viewer).collect()
        };
        for viewer in drained {
            viewer.close();
        }
    }
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}

/// The writer: paced by the detected frame rate, it pulls access units from
/// the distributor and writes each one once to the shared track. Write
/// failures never block the pipeline; fatal transcoder events end it.
async fn write_frames(
    track: Arc<TrackLocalStaticSample>,
    mut pipeline: IngestPipeline,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(frame_interval(*pipeline.fps.borrow()));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let started = tokio::time::Instant::now();
    let mut watchdog_fired = false;
    let mut frame_count: u64 = 0;
    let mut write_errors: u64 = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = pipeline.events.recv() => match event {
                Some(DriverEvent::FatalStderr(message)) => {
                    tracing::error!("transcoder fatal: {}", message);
                    break;
                }
                Some(DriverEvent::ExitedWithError(message)) => {
                    tracing::error!("transcoder exited: {}", message);
                    break;
                }
                Some(DriverEvent::ExitedClean) => {
                    tracing::warn!("transcoder exited cleanly, stream over");
                    break;
                }
                Some(DriverEvent::FpsDetected(_)) | None => {}
            },
            _ = interval.tick() => {
                if pipeline.fps.has_changed().unwrap_or(false) {
                    let fps = (*pipeline.fps.borrow_and_update()).max(1);
                    interval = tokio::time::interval(frame_interval(fps));
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    tracing::info!("frame pacing updated to {} fps", fps);
                }
                match tokio::time::timeout(FRAME_READ_DEADLINE, pipeline.frames.recv()).await {
                    Ok(Some(unit)) => {
                        if frame_count == 0 {
                            tracing::info!(
                                "first access unit: {} bytes, keyframe={}",
                                unit.data.len(),
                                contains_idr(&unit.data)
                            );
                        }
                        let sample = Sample {
                            data: unit.data,
                            duration: unit.duration,
                            ..Default::default()
                        };
                        match track.write_sample(&sample).await {
                            Ok(()) => {
                                frame_count += 1;
                                write_errors = 0;
                                if frame_count % 300 == 0 {
                                    tracing::debug!("streamed {} access units", frame_count);
                                }
                            }
                            Err(err) => {
                                write_errors += 1;
                                if write_errors <= 3 || write_errors % 100 == 0 {
                                    tracing::error!(
                                        "failed to write sample (count {}): {}",
                                        write_errors,
                                        err
                                    );
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("frame stream ended");
                        break;
                    }
                    Err(_) => {
                        // No frame within the deadline. Silent once streaming
                        // has started; a one-shot notice during warm-up.
                        if frame_count == 0
                            && !watchdog_fired
                            && started.elapsed() >= FIRST_FRAME_WATCHDOG
                        {
                            watchdog_fired = true;
                            tracing::info!(
                                "no access unit after {:?}; transcoding may still be warming up",
                                FIRST_FRAME_WATCHDOG
                            );
                        }
                    }
                }
            }
        }
    }

    pipeline.close();
    tracing::debug!("frame writer finished after {} access units", frame_count);
}
