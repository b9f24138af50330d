//! Per-viewer peer-connection lifecycle.
//!
//! Each connected browser gets one `Viewer`: a peer connection referencing
//! the shared encoded track, a buffer for candidates that arrive before the
//! remote description, and a supervisor task that owns the lifecycle state
//! and every recovery timer. Peer-connection callbacks only forward events
//! into the supervisor's queue, so all transitions happen in one place.

use std::sync::Arc;
use std::time::Duration;

use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::Error;
use crate::protocol::SignalMessage;

/// ICE stays in `disconnected` this long before the entry is considered
/// failed.
const DISCONNECTED_GRACE: Duration = Duration::from_secs(10);
/// A failed connection gets this long to recover organically before an ICE
/// restart is issued.
const FAILED_GRACE: Duration = Duration::from_secs(5);
/// ICE must reconnect this quickly after a restart offer, or the entry is
/// removed.
const RESTART_WINDOW: Duration = Duration::from_secs(3);

/// Lifecycle of one viewer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    New,
    Offering,
    AwaitingAnswer,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Restarting,
    Closed,
}

/// Messages from a viewer's supervisor to the fan-out engine.
#[derive(Debug)]
pub enum ViewerUpdate {
    /// Outbound signaling (offers, candidates) addressed to this viewer.
    Signal(SignalMessage),
    /// The entry is gone and must be dropped from the table.
    Closed(String),
}

#[derive(Debug)]
enum ViewerEvent {
    PeerState(RTCPeerConnectionState),
    IceState(RTCIceConnectionState),
    OfferSent,
    AnswerApplied,
    Close,
}

#[derive(Debug)]
pub struct Viewer {
    pub client_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    pending_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    event_sender: mpsc::UnboundedSender<ViewerEvent>,
    updates: mpsc::UnboundedSender<ViewerUpdate>,
    state: Arc<std::sync::Mutex<ViewerState>>,
}

impl Viewer {
    /// Creates the peer connection, attaches the shared track, installs the
    /// state hooks and spawns the supervisor.
    pub async fn new(
        client_id: String,
        api: &API,
        rtc_config: RTCConfiguration,
        track: Arc<TrackLocalStaticSample>,
        updates: mpsc::UnboundedSender<ViewerUpdate>,
    ) -> Result<Arc<Viewer>, Error> {
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        let rtp_sender = peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        {
            // Drain RTCP from the sender so interceptors keep working.
            let client_id = client_id.clone();
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
                tracing::debug!("viewer {} rtcp reader finished", client_id);
            });
        }

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let state = Arc::new(std::sync::Mutex::new(ViewerState::New));

        let viewer = Viewer {
            client_id: client_id.clone(),
            peer_connection: peer_connection.clone(),
            pending_candidates: Arc::new(Mutex::new(Vec::new())),
            event_sender: event_sender.clone(),
            updates: updates.clone(),
            state: state.clone(),
        };
        viewer.state_hooks();

        tokio::spawn(async move {
            supervise(
                client_id,
                peer_connection,
                event_receiver,
                updates,
                state,
            )
            .await;
        });

        tracing::debug!("viewer {} is created", viewer.client_id);
        Ok(Arc::new(viewer))
    }

    fn state_hooks(&self) {
        let peer = self.peer_connection.clone();

        let updates = self.updates.clone();
        let client_id = self.client_id.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            Box::pin(enc!((updates, client_id) async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = updates.send(ViewerUpdate::Signal(SignalMessage::Candidate {
                                client_id: Some(client_id),
                                from_client_id: None,
                                candidate: init,
                            }));
                        }
                        Err(err) => {
                            tracing::error!("viewer {} failed to serialize candidate: {}", client_id, err);
                        }
                    }
                }
            }))
        }));

        let event_sender = self.event_sender.clone();
        let client_id = self.client_id.clone();
        peer.on_peer_connection_state_change(Box::new(
            enc!((event_sender, client_id) move |state: RTCPeerConnectionState| {
                tracing::info!("viewer {} peer connection state: {}", client_id, state);
                let _ = event_sender.send(ViewerEvent::PeerState(state));
                Box::pin(async {})
            }),
        ));

        let event_sender = self.event_sender.clone();
        let client_id = self.client_id.clone();
        peer.on_ice_connection_state_change(Box::new(
            enc!((event_sender, client_id) move |state: RTCIceConnectionState| {
                tracing::info!("viewer {} ICE connection state: {}", client_id, state);
                let _ = event_sender.send(ViewerEvent::IceState(state));
                Box::pin(async {})
            }),
        ));
    }

    /// Creates the offer for this viewer and queues it for sending. The
    /// offer is queued before the local description is applied, so no
    /// candidate can overtake it on the wire.
    pub async fn send_offer(&self) -> Result<(), Error> {
        let offer = self.peer_connection.create_offer(None).await?;
        let _ = self.updates.send(ViewerUpdate::Signal(SignalMessage::Offer {
            client_id: self.client_id.clone(),
            offer: offer.clone(),
        }));
        self.peer_connection.set_local_description(offer).await?;
        let _ = self.event_sender.send(ViewerEvent::OfferSent);
        tracing::info!("viewer {} offer sent", self.client_id);
        Ok(())
    }

    /// Applies the viewer's answer, then flushes candidates that arrived
    /// before the remote description, in arrival order.
    pub async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection.set_remote_description(answer).await?;
        let pending: Vec<RTCIceCandidateInit> = {
            let mut guard = self.pending_candidates.lock().await;
            guard.drain(..).collect()
        };
        for candidate in pending {
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!(
                    "viewer {} failed to add buffered candidate: {}",
                    self.client_id,
                    err
                );
            }
        }
        let _ = self.event_sender.send(ViewerEvent::AnswerApplied);
        tracing::info!("viewer {} remote description applied", self.client_id);
        Ok(())
    }

    /// Adds a remote candidate, buffering it while the remote description is
    /// still unset.
    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.peer_connection.remote_description().await.is_some() {
            self.peer_connection.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!(
                "viewer {} buffering candidate until remote description",
                self.client_id
            );
            self.pending_candidates.lock().await.push(candidate);
        }
        Ok(())
    }

    pub fn state(&self) -> ViewerState {
        *self.state.lock().unwrap()
    }

    /// Asks the supervisor to close the peer connection and retire the
    /// entry.
    pub fn close(&self) {
        let _ = self.event_sender.send(ViewerEvent::Close);
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        tracing::debug!("viewer {} is dropped", self.client_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MachineInput {
    OfferSent,
    AnswerApplied,
    Ice(RTCIceConnectionState),
    Pc(RTCPeerConnectionState),
    DisconnectedTimeout,
    FailedTimeout,
    RestartTimeout,
    CloseRequested,
}

/// What the supervisor must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    ArmDisconnected,
    ArmFailed,
    Restart,
    Remove,
    ClearTimers,
}

/// Pure transition table. `Connected` requires both the ICE transport and
/// the peer connection to report connected; one ICE restart is allowed per
/// entry lifetime.
#[derive(Debug)]
struct ViewerStateMachine {
    state: ViewerState,
    ice_connected: bool,
    pc_connected: bool,
    restarts: u32,
}

impl ViewerStateMachine {
    fn new() -> Self {
        ViewerStateMachine {
            state: ViewerState::New,
            ice_connected: false,
            pc_connected: false,
            restarts: 0,
        }
    }

    fn state(&self) -> ViewerState {
        self.state
    }

    fn apply(&mut self, input: MachineInput) -> Action {
        if self.state == ViewerState::Closed {
            return Action::None;
        }
        match input {
            MachineInput::OfferSent => {
                if matches!(self.state, ViewerState::New | ViewerState::Offering) {
                    self.state = ViewerState::AwaitingAnswer;
                }
                Action::None
            }
            MachineInput::AnswerApplied => {
                if matches!(
                    self.state,
                    ViewerState::AwaitingAnswer | ViewerState::Restarting
                ) {
                    self.state = ViewerState::Negotiating;
                }
                Action::None
            }
            MachineInput::Ice(ice) => match ice {
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                    self.ice_connected = true;
                    self.maybe_connected()
                }
                RTCIceConnectionState::Disconnected => {
                    self.ice_connected = false;
                    if self.state == ViewerState::Connected {
                        self.state = ViewerState::Disconnected;
                        Action::ArmDisconnected
                    } else {
                        Action::None
                    }
                }
                RTCIceConnectionState::Failed => {
                    self.ice_connected = false;
                    self.fail()
                }
                RTCIceConnectionState::Closed => {
                    self.state = ViewerState::Closed;
                    Action::Remove
                }
                _ => Action::None,
            },
            MachineInput::Pc(pc) => match pc {
                RTCPeerConnectionState::Connected => {
                    self.pc_connected = true;
                    self.maybe_connected()
                }
                RTCPeerConnectionState::Failed => {
                    self.pc_connected = false;
                    self.fail()
                }
                RTCPeerConnectionState::Closed => {
                    self.state = ViewerState::Closed;
                    Action::Remove
                }
                _ => Action::None,
            },
            MachineInput::DisconnectedTimeout => {
                if self.state == ViewerState::Disconnected {
                    self.state = ViewerState::Failed;
                    Action::ArmFailed
                } else {
                    Action::None
                }
            }
            MachineInput::FailedTimeout => {
                if self.state == ViewerState::Failed {
                    if self.restarts == 0 {
                        self.restarts = 1;
                        self.state = ViewerState::Restarting;
                        Action::Restart
                    } else {
                        self.state = ViewerState::Closed;
                        Action::Remove
                    }
                } else {
                    Action::None
                }
            }
            MachineInput::RestartTimeout => {
                if self.state == ViewerState::Connected {
                    Action::None
                } else {
                    self.state = ViewerState::Closed;
                    Action::Remove
                }
            }
            MachineInput::CloseRequested => {
                self.state = ViewerState::Closed;
                Action::Remove
            }
        }
    }

    fn maybe_connected(&mut self) -> Action {
        if self.ice_connected && self.pc_connected {
            self.state = ViewerState::Connected;
            Action::ClearTimers
        } else {
            Action::None
        }
    }

    fn fail(&mut self) -> Action {
        if matches!(self.state, ViewerState::Restarting | ViewerState::Failed) {
            return Action::None;
        }
        self.state = ViewerState::Failed;
        Action::ArmFailed
    }
}

async fn supervise(
    client_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    mut events: mpsc::UnboundedReceiver<ViewerEvent>,
    updates: mpsc::UnboundedSender<ViewerUpdate>,
    state_cell: Arc<std::sync::Mutex<ViewerState>>,
) {
    let mut machine = ViewerStateMachine::new();
    let mut disconnected_deadline: Option<Instant> = None;
    let mut failed_deadline: Option<Instant> = None;
    let mut restart_deadline: Option<Instant> = None;

    tracing::debug!("viewer {} supervisor started", client_id);

    loop {
        let next = [
            disconnected_deadline.map(|at| (at, MachineInput::DisconnectedTimeout)),
            failed_deadline.map(|at| (at, MachineInput::FailedTimeout)),
            restart_deadline.map(|at| (at, MachineInput::RestartTimeout)),
        ]
        .into_iter()
        .flatten()
        .min_by_key(|(at, _)| *at);

        let input = tokio::select! {
            event = events.recv() => match event {
                Some(ViewerEvent::PeerState(state)) => MachineInput::Pc(state),
                Some(ViewerEvent::IceState(state)) => MachineInput::Ice(state),
                Some(ViewerEvent::OfferSent) => MachineInput::OfferSent,
                Some(ViewerEvent::AnswerApplied) => MachineInput::AnswerApplied,
                Some(ViewerEvent::Close) => MachineInput::CloseRequested,
                None => break,
            },
            _ = async { sleep_until(next.unwrap().0).await }, if next.is_some() => {
                let (_, input) = next.unwrap();
                match input {
                    MachineInput::DisconnectedTimeout => disconnected_deadline = None,
                    MachineInput::FailedTimeout => failed_deadline = None,
                    MachineInput::RestartTimeout => restart_deadline = None,
                    _ => {}
                }
                input
            }
        };

        let action = machine.apply(input);
        *state_cell.lock().unwrap() = machine.state();

        match action {
            Action::None => {}
            Action::ArmDisconnected => {
                tracing::warn!(
                    "viewer {} ICE disconnected, waiting {:?} for recovery",
                    client_id,
                    DISCONNECTED_GRACE
                );
                disconnected_deadline = Some(Instant::now() + DISCONNECTED_GRACE);
            }
            Action::ArmFailed => {
                tracing::warn!(
                    "viewer {} failed, grace of {:?} before ICE restart",
                    client_id,
                    FAILED_GRACE
                );
                failed_deadline = Some(Instant::now() + FAILED_GRACE);
            }
            Action::Restart => {
                disconnected_deadline = None;
                failed_deadline = None;
                tracing::info!("viewer {} issuing ICE restart", client_id);
                let options = RTCOfferOptions {
                    ice_restart: true,
                    ..Default::default()
                };
                let restarted = match peer_connection.create_offer(Some(options)).await {
                    Ok(offer) => {
                        let _ = updates.send(ViewerUpdate::Signal(SignalMessage::Offer {
                            client_id: client_id.clone(),
                            offer: offer.clone(),
                        }));
                        match peer_connection.set_local_description(offer).await {
                            Ok(()) => true,
                            Err(err) => {
                                tracing::error!(
                                    "viewer {} failed to set restart description: {}",
                                    client_id,
                                    err
                                );
                                false
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!("viewer {} failed to create restart offer: {}", client_id, err);
                        false
                    }
                };
                if restarted {
                    restart_deadline = Some(Instant::now() + RESTART_WINDOW);
                } else {
                    retire(&client_id, &peer_connection, &updates, &state_cell).await;
                    break;
                }
            }
            Action::ClearTimers => {
                tracing::info!("viewer {} connected", client_id);
                disconnected_deadline = None;
                failed_deadline = None;
                restart_deadline = None;
            }
            Action::Remove => {
                retire(&client_id, &peer_connection, &updates, &state_cell).await;
                break;
            }
        }
    }

    tracing::debug!("viewer {} supervisor finished", client_id);
}

async fn retire(
    client_id: &str,
    peer_connection: &Arc<RTCPeerConnection>,
    updates: &mpsc::UnboundedSender<ViewerUpdate>,
    state_cell: &Arc<std::sync::Mutex<ViewerState>>,
) {
    *state_cell.lock().unwrap() = ViewerState::Closed;
    if let Err(err) = peer_connection.close().await {
        tracing::error!("viewer {} failed to close peer connection: {}", client_id, err);
    }
    let _ = updates.send(ViewerUpdate::Closed(client_id.to_owned()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(machine: &mut ViewerStateMachine) {
        machine.apply(MachineInput::OfferSent);
        machine.apply(MachineInput::AnswerApplied);
        machine.apply(MachineInput::Ice(RTCIceConnectionState::Connected));
        machine.apply(MachineInput::Pc(RTCPeerConnectionState::Connected));
    }

    #[test]
    fn test_negotiation_reaches_connected() {
        let mut machine = ViewerStateMachine::new();
        assert_eq!(machine.state(), ViewerState::New);
        machine.apply(MachineInput::OfferSent);
        assert_eq!(machine.state(), ViewerState::AwaitingAnswer);
        machine.apply(MachineInput::AnswerApplied);
        assert_eq!(machine.state(), ViewerState::Negotiating);
        // ICE alone is not enough, the peer connection must confirm too.
        machine.apply(MachineInput::Ice(RTCIceConnectionState::Connected));
        assert_eq!(machine.state(), ViewerState::Negotiating);
        let action = machine.apply(MachineInput::Pc(RTCPeerConnectionState::Connected));
        assert_eq!(machine.state(), ViewerState::Connected);
        assert_eq!(action, Action::ClearTimers);
    }

    #[test]
    fn test_disconnect_recovers() {
        let mut machine = ViewerStateMachine::new();
        connect(&mut machine);
        let action = machine.apply(MachineInput::Ice(RTCIceConnectionState::Disconnected));
        assert_eq!(machine.state(), ViewerState::Disconnected);
        assert_eq!(action, Action::ArmDisconnected);
        let action = machine.apply(MachineInput::Ice(RTCIceConnectionState::Connected));
        assert_eq!(machine.state(), ViewerState::Connected);
        assert_eq!(action, Action::ClearTimers);
    }

    #[test]
    fn test_disconnect_timeout_escalates_to_failure_then_restart() {
        let mut machine = ViewerStateMachine::new();
        connect(&mut machine);
        machine.apply(MachineInput::Ice(RTCIceConnectionState::Disconnected));
        let action = machine.apply(MachineInput::DisconnectedTimeout);
        assert_eq!(machine.state(), ViewerState::Failed);
        assert_eq!(action, Action::ArmFailed);
        let action = machine.apply(MachineInput::FailedTimeout);
        assert_eq!(machine.state(), ViewerState::Restarting);
        assert_eq!(action, Action::Restart);
    }

    #[test]
    fn test_restart_succeeds_within_window() {
        let mut machine = ViewerStateMachine::new();
        connect(&mut machine);
        machine.apply(MachineInput::Pc(RTCPeerConnectionState::Failed));
        machine.apply(MachineInput::FailedTimeout);
        assert_eq!(machine.state(), ViewerState::Restarting);
        machine.apply(MachineInput::AnswerApplied);
        assert_eq!(machine.state(), ViewerState::Negotiating);
        machine.apply(MachineInput::Ice(RTCIceConnectionState::Connected));
        machine.apply(MachineInput::Pc(RTCPeerConnectionState::Connected));
        assert_eq!(machine.state(), ViewerState::Connected);
        // A restart window firing after recovery changes nothing.
        let action = machine.apply(MachineInput::RestartTimeout);
        assert_eq!(action, Action::None);
        assert_eq!(machine.state(), ViewerState::Connected);
    }

    #[test]
    fn test_restart_window_expiry_removes_entry() {
        let mut machine = ViewerStateMachine::new();
        connect(&mut machine);
        machine.apply(MachineInput::Ice(RTCIceConnectionState::Failed));
        machine.apply(MachineInput::FailedTimeout);
        assert_eq!(machine.state(), ViewerState::Restarting);
        let action = machine.apply(MachineInput::RestartTimeout);
        assert_eq!(action, Action::Remove);
        assert_eq!(machine.state(), ViewerState::Closed);
    }

    #[test]
    fn test_second_failure_closes() {
        let mut machine = ViewerStateMachine::new();
        connect(&mut machine);
        machine.apply(MachineInput::Ice(RTCIceConnectionState::Failed));
        machine.apply(MachineInput::FailedTimeout);
        // The restart works...
        machine.apply(MachineInput::AnswerApplied);
        machine.apply(MachineInput::Ice(RTCIceConnectionState::Connected));
        machine.apply(MachineInput::Pc(RTCPeerConnectionState::Connected));
        assert_eq!(machine.state(), ViewerState::Connected);
        // ...but a second failure is terminal.
        machine.apply(MachineInput::Pc(RTCPeerConnectionState::Failed));
        let action = machine.apply(MachineInput::FailedTimeout);
        assert_eq!(action, Action::Remove);
        assert_eq!(machine.state(), ViewerState::Closed);
    }

    #[test]
    fn test_close_request_is_terminal() {
        let mut machine = ViewerStateMachine::new();
        connect(&mut machine);
        let action = machine.apply(MachineInput::CloseRequested);
        assert_eq!(action, Action::Remove);
        // Later events are ignored once closed.
        let action = machine.apply(MachineInput::Ice(RTCIceConnectionState::Connected));
        assert_eq!(action, Action::None);
        assert_eq!(machine.state(), ViewerState::Closed);
    }

    #[test]
    fn test_stale_timeouts_are_ignored() {
        let mut machine = ViewerStateMachine::new();
        connect(&mut machine);
        machine.apply(MachineInput::Ice(RTCIceConnectionState::Disconnected));
        machine.apply(MachineInput::Ice(RTCIceConnectionState::Connected));
        // The disconnected timer fires after recovery: nothing happens.
        let action = machine.apply(MachineInput::DisconnectedTimeout);
        assert_eq!(action, Action::None);
        assert_eq!(machine.state(), ViewerState::Connected);
    }
}
