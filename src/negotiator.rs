//! Concurrent peer connection negotiation.
//!
//! One negotiator watches the signaling feed for two kinds of trigger:
//! an incoming offer (we answer) and a remote-client-connected notice
//! (we offer). Each trigger starts at most one negotiation per remote
//! client id, run on its own task so a failing peer never disturbs the
//! others. Exactly one terminal result per started negotiation lands on
//! the results stream.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chunking::ChunkConfig;
use crate::data_channel::DataChannelClient;
use crate::error::{
    FailedToCreatePeerConnectionError, NegotiationError, PortError,
};
use crate::peer_connection::PeerConnectionClient;
use crate::port::{IceConnectionState, PeerConnectionPortFactory, SessionDescription};
use crate::protocol::{RemoteClientId, RemoteClientState, RtcPrimitive, Sdp};
use crate::signaling::SignalingClient;

pub type NegotiationResult = Result<PeerConnectionClient, FailedToCreatePeerConnectionError>;

#[derive(Clone, Copy, Debug, Default)]
pub struct NegotiatorConfig {
    /// Upper bound on one negotiation's offer/answer and ICE exchange.
    /// `None` lets a stalled negotiation wait indefinitely.
    pub negotiation_timeout: Option<Duration>,
    pub chunk_config: ChunkConfig,
}

enum Role {
    /// We received an offer and answer it.
    Answerer { offer: Sdp },
    /// The remote just connected; we send the offer.
    Offerer,
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Answerer { .. } => "answerer",
            Role::Offerer => "offerer",
        }
    }
}

pub struct PeerConnectionNegotiator {
    signaling: Arc<SignalingClient>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<NegotiationResult>>>,
    trigger_task: Mutex<Option<JoinHandle<()>>>,
    negotiation_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PeerConnectionNegotiator {
    pub fn new(
        signaling: Arc<SignalingClient>,
        factory: Arc<dyn PeerConnectionPortFactory>,
        config: NegotiatorConfig,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let negotiation_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let trigger_task = tokio::spawn(trigger_loop(
            signaling.clone(),
            factory,
            config,
            results_tx,
            negotiation_tasks.clone(),
        ));

        Self {
            signaling,
            results_rx: Mutex::new(Some(results_rx)),
            trigger_task: Mutex::new(Some(trigger_task)),
            negotiation_tasks,
        }
    }

    /// The terminal results stream. Single consumer; `None` after the
    /// first call.
    pub fn negotiation_results(&self) -> Option<mpsc::UnboundedReceiver<NegotiationResult>> {
        lock(&self.results_rx).take()
    }

    /// Stops watching triggers, aborts in-flight negotiations and cancels
    /// the signaling client.
    pub async fn cancel(&self) {
        self.abort_tasks();
        self.signaling.cancel().await;
        tracing::debug!(target: "causeway::negotiator", "negotiator cancelled");
    }

    fn abort_tasks(&self) {
        if let Some(task) = lock(&self.trigger_task).take() {
            task.abort();
        }
        for task in lock(&self.negotiation_tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for PeerConnectionNegotiator {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// Finished handles would otherwise pile up for the negotiator's lifetime.
fn track(tasks: &Mutex<Vec<JoinHandle<()>>>, task: JoinHandle<()>) {
    let mut tasks = lock(tasks);
    tasks.retain(|task| !task.is_finished());
    tasks.push(task);
}

/// Single owner of the started-ids set: triggers from both sources funnel
/// through here, so a duplicate can never slip in between check and insert.
/// Ids are never removed; a finished negotiation, successful or not, is
/// terminal for this negotiator.
async fn trigger_loop(
    signaling: Arc<SignalingClient>,
    factory: Arc<dyn PeerConnectionPortFactory>,
    config: NegotiatorConfig,
    results_tx: mpsc::UnboundedSender<NegotiationResult>,
    negotiation_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let mut offers = signaling.on_offer();
    let mut remote_states = signaling.on_remote_client_state();
    let mut started: HashSet<RemoteClientId> = HashSet::new();

    loop {
        let (remote_client_id, role) = tokio::select! {
            offer = offers.recv() => match offer {
                Some(offer) => (offer.remote_client_id, Role::Answerer { offer: offer.sdp }),
                None => break,
            },
            state = remote_states.recv() => match state {
                Some(RemoteClientState::Connected(id)) => (id, Role::Offerer),
                Some(RemoteClientState::Disconnected(_)) => continue,
                None => break,
            },
        };

        if !started.insert(remote_client_id.clone()) {
            tracing::trace!(
                target: "causeway::negotiator",
                remote_client_id = %remote_client_id,
                "duplicate trigger ignored"
            );
            continue;
        }

        tracing::debug!(
            target: "causeway::negotiator",
            remote_client_id = %remote_client_id,
            role = role.name(),
            "negotiation triggered"
        );

        let task = tokio::spawn(run_negotiation(
            signaling.clone(),
            factory.clone(),
            config,
            remote_client_id,
            role,
            results_tx.clone(),
        ));
        track(&negotiation_tasks, task);
    }
    tracing::debug!(target: "causeway::negotiator", "trigger streams ended");
}

async fn run_negotiation(
    signaling: Arc<SignalingClient>,
    factory: Arc<dyn PeerConnectionPortFactory>,
    config: NegotiatorConfig,
    remote_client_id: RemoteClientId,
    role: Role,
    results_tx: mpsc::UnboundedSender<NegotiationResult>,
) {
    let outcome = negotiate(
        &signaling,
        factory.as_ref(),
        config,
        remote_client_id.clone(),
        role,
    )
    .await;

    let result = match outcome {
        Ok(client) => {
            tracing::info!(
                target: "causeway::negotiator",
                remote_client_id = %remote_client_id,
                "negotiation succeeded"
            );
            Ok(client)
        }
        Err(source) => {
            tracing::warn!(
                target: "causeway::negotiator",
                remote_client_id = %remote_client_id,
                error = %source,
                "negotiation failed"
            );
            Err(FailedToCreatePeerConnectionError {
                remote_client_id,
                source,
            })
        }
    };
    let _ = results_tx.send(result);
}

async fn negotiate(
    signaling: &Arc<SignalingClient>,
    factory: &dyn PeerConnectionPortFactory,
    config: NegotiatorConfig,
    remote_client_id: RemoteClientId,
    role: Role,
) -> Result<PeerConnectionClient, NegotiationError> {
    let port = factory.make_port(&remote_client_id).await?;

    // Subscriptions precede the operations that make their events fire.
    let mut negotiation_needed = port.negotiation_needed();
    let mut ice_states = port.ice_connection_states();
    let local_candidates = port.generated_ice_candidates();
    let remote_candidates = signaling.on_ice_candidate();
    let mut answers = signaling.on_answer();

    let data_channel_handle = match port.create_data_channel().await {
        Ok(handle) => handle,
        Err(err) => {
            port.close().await;
            return Err(err.into());
        }
    };

    // Trickle ICE flows both ways for the entire negotiation. A pump
    // failure is not terminal; the connection may complete on candidates
    // already exchanged.
    let local_pump = tokio::spawn(pump_local_candidates(
        local_candidates,
        signaling.clone(),
        remote_client_id.clone(),
    ));
    let remote_pump = tokio::spawn(pump_remote_candidates(
        remote_candidates,
        port.clone(),
        remote_client_id.clone(),
    ));

    let exchange = async {
        // The engine reports readiness to negotiate once the data channel
        // exists.
        loop {
            match negotiation_needed.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => break,
                Err(RecvError::Closed) => return Err(PortError::Closed.into()),
            }
        }

        match role {
            Role::Answerer { offer } => {
                port.set_remote_description(SessionDescription::offer(offer))
                    .await?;
                let answer = port.create_local_answer().await?;
                port.set_local_description(SessionDescription::answer(answer.clone()))
                    .await?;
                signaling
                    .send_to_remote(remote_client_id.clone(), RtcPrimitive::Answer(answer))
                    .await?;
            }
            Role::Offerer => {
                let offer = port.create_local_offer().await?;
                port.set_local_description(SessionDescription::offer(offer.clone()))
                    .await?;
                signaling
                    .send_to_remote(remote_client_id.clone(), RtcPrimitive::Offer(offer))
                    .await?;
                let answer = loop {
                    match answers.recv().await {
                        Some(answer) if answer.remote_client_id == remote_client_id => {
                            break answer.sdp;
                        }
                        Some(_) => continue,
                        None => return Err(NegotiationError::SignalingClosed),
                    }
                };
                port.set_remote_description(SessionDescription::answer(answer))
                    .await?;
            }
        }

        // Checking and disconnected may come and go; the first connected
        // observation completes the negotiation.
        loop {
            match ice_states.recv().await {
                Ok(IceConnectionState::Connected) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(PortError::Closed.into()),
            }
        }
        Ok(())
    };
    let exchanged: Result<(), NegotiationError> = match config.negotiation_timeout {
        Some(limit) => match tokio::time::timeout(limit, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(NegotiationError::Timeout),
        },
        None => exchange.await,
    };

    local_pump.abort();
    remote_pump.abort();

    // This negotiation owns the connection until handoff; a terminal
    // failure must release it.
    if let Err(err) = exchanged {
        data_channel_handle.close().await;
        port.close().await;
        return Err(err);
    }
    let data_channel = DataChannelClient::new(data_channel_handle, config.chunk_config);
    Ok(PeerConnectionClient::new(remote_client_id, port, data_channel))
}

async fn pump_local_candidates(
    mut candidates: tokio::sync::broadcast::Receiver<crate::protocol::IceCandidate>,
    signaling: Arc<SignalingClient>,
    remote_client_id: RemoteClientId,
) {
    loop {
        match candidates.recv().await {
            Ok(candidate) => {
                if let Err(err) = signaling
                    .send_to_remote(
                        remote_client_id.clone(),
                        RtcPrimitive::IceCandidate(candidate),
                    )
                    .await
                {
                    tracing::warn!(
                        target: "causeway::negotiator",
                        remote_client_id = %remote_client_id,
                        error = %err,
                        "failed to ship local ice candidate"
                    );
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    target: "causeway::negotiator",
                    remote_client_id = %remote_client_id,
                    skipped,
                    "local candidate stream lagged"
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn pump_remote_candidates(
    mut candidates: crate::signaling::EventStream<crate::protocol::IdentifiedIceCandidate>,
    port: Arc<dyn crate::port::PeerConnectionPort>,
    remote_client_id: RemoteClientId,
) {
    while let Some(identified) = candidates.recv().await {
        if identified.remote_client_id != remote_client_id {
            continue;
        }
        if let Err(err) = port.add_remote_ice_candidate(identified.candidate).await {
            tracing::warn!(
                target: "causeway::negotiator",
                remote_client_id = %remote_client_id,
                error = %err,
                "failed to apply remote ice candidate"
            );
            break;
        }
    }
}
