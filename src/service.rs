//! Single-writer consensus worker.
//!
//! [`ConsensusService`] owns the [`Poset`]. Once spawned it runs on its own
//! tokio task and is reached only through a [`ConsensusHandle`], which feeds
//! it commands over a bounded channel. Every decision is persisted through the
//! [`CheckpointStore`] before it is published on the event bus.

use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    checkpoint::CheckpointStore,
    config::PosetConfig,
    error::ConsensusError,
    events::{BroadcastEventBus, ConsensusEvent, ConsensusEventBus},
    poset::{Decision, Poset},
    reachability::StronglySee,
    source::EventSource,
    stake::Members,
    stats::ConsensusStats,
    types::{Event, Hash},
};

enum Command {
    Submit(Event),
    SetNextMembers(Members),
    SetBalances(Hash),
    Stats(oneshot::Sender<ConsensusStats>),
}

pub struct ConsensusService<R, S, E> {
    poset: Poset<R>,
    store: Arc<S>,
    event_bus: E,
    config: PosetConfig,
    /// Set when persisting a checkpoint failed.
    halted: Option<String>,
}

impl<R, S> ConsensusService<R, S, BroadcastEventBus>
where
    R: StronglySee + 'static,
    S: CheckpointStore,
{
    /// Bootstrap with a broadcast event bus sized from `config`.
    pub async fn new(store: Arc<S>, oracle: R, config: PosetConfig) -> Result<Self, ConsensusError> {
        let event_bus = BroadcastEventBus::new(config.event_bus_capacity);
        Self::bootstrap(store, oracle, config, event_bus).await
    }
}

impl<R, S, E> ConsensusService<R, S, E>
where
    R: StronglySee + 'static,
    S: CheckpointStore,
    E: ConsensusEventBus,
{
    /// Load the stored checkpoint and build the poset on top of it.
    ///
    /// Fails with [`ConsensusError::MissingCheckpoint`] when genesis was never
    /// applied to `store`.
    pub async fn bootstrap(
        store: Arc<S>,
        oracle: R,
        config: PosetConfig,
        event_bus: E,
    ) -> Result<Self, ConsensusError> {
        let checkpoint = store.load().await?;
        let poset = Poset::bootstrap(checkpoint, oracle, config.clone())?;
        Ok(Self {
            poset,
            store,
            event_bus,
            config,
            halted: None,
        })
    }

    pub fn poset(&self) -> &Poset<R> {
        &self.poset
    }

    /// Rebuild election state from the local DAG store. Decisions found on the
    /// way are persisted and published like live ones.
    pub async fn replay_from<Src>(&mut self, source: &Src) -> Result<usize, ConsensusError>
    where
        Src: EventSource + ?Sized,
    {
        let decisions = self.poset.replay_from(source);
        self.publish_dropped();
        let decisions = decisions?;
        let count = decisions.len();
        self.commit(decisions).await?;
        info!("Replay done, {count} frame(s) decided");
        Ok(count)
    }

    /// Move the service onto its own task.
    pub fn spawn(self) -> ConsensusHandle<E> {
        let (command_tx, command_rx) = mpsc::channel(self.config.command_buffer);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_bus = self.event_bus.clone();

        let worker = tokio::spawn(self.run(command_rx, shutdown_rx));

        ConsensusHandle {
            commands: command_tx,
            shutdown: shutdown_tx,
            event_bus,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    let discarded = self.poset.discard_buffered();
                    info!("Shutting down consensus worker, {discarded} buffered event(s) discarded");
                    break;
                }
                command = commands.recv() => match command {
                    Some(Command::Submit(event)) => self.handle_submit(event).await,
                    Some(Command::SetNextMembers(members)) => {
                        self.handle_next_members(members).await;
                    }
                    Some(Command::SetBalances(balances)) => self.poset.set_balances(balances),
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    None => {
                        debug!("All consensus handles dropped, stopping worker");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_submit(&mut self, event: Event) {
        if self.halted.is_some() {
            trace!("Ignoring event {:?}, consensus halted", event.hash());
            return;
        }
        let result = self.poset.submit(event);
        self.publish_dropped();
        match result {
            Ok(decisions) => {
                if let Err(err) = self.commit(decisions).await {
                    error!("Failed to persist checkpoint: {err}");
                    let reason = err.to_string();
                    self.halted = Some(reason.clone());
                    self.event_bus.publish(ConsensusEvent::Halted { reason });
                }
            }
            Err(ConsensusError::Halted(_)) => {
                trace!("Ignoring event, consensus halted");
            }
            Err(err) => {
                self.event_bus.publish(ConsensusEvent::Halted {
                    reason: err.to_string(),
                });
            }
        }
    }

    /// Stage and persist right away, so a restart before rollover keeps the set.
    async fn handle_next_members(&mut self, members: Members) {
        let count = members.len();
        if let Err(err) = self.poset.set_next_members(members) {
            warn!("Refused next member set: {err}");
            return;
        }
        if self.halted.is_some() {
            return;
        }
        if let Err(err) = self.store.save(self.poset.checkpoint()).await {
            error!("Failed to persist staged members: {err}");
            let reason = err.to_string();
            self.halted = Some(reason.clone());
            self.event_bus.publish(ConsensusEvent::Halted { reason });
            return;
        }
        debug!("Staged {count} members for the next super-frame");
    }

    /// Persist then publish each decision, in order.
    async fn commit(&self, decisions: Vec<Decision>) -> Result<(), ConsensusError> {
        for decision in decisions {
            self.store.save(&decision.checkpoint).await?;
            let sealed = decision
                .sealed_super_frame
                .then_some((decision.super_frame_n, decision.block.frame));

            self.event_bus
                .publish(ConsensusEvent::FrameDecided(Box::new(decision)));
            if let Some((sealed, last_frame)) = sealed {
                self.event_bus
                    .publish(ConsensusEvent::SuperFrameSealed { sealed, last_frame });
            }
        }
        Ok(())
    }

    fn publish_dropped(&mut self) {
        for (hash, reason) in self.poset.take_dropped() {
            self.event_bus
                .publish(ConsensusEvent::EventDropped { hash, reason });
        }
    }

    fn stats(&self) -> ConsensusStats {
        ConsensusStats::from_poset(
            self.poset.stats(),
            self.poset.checkpoint().last_block_n,
            self.poset.is_halted() || self.halted.is_some(),
        )
    }
}

/// Cloneable handle to a running [`ConsensusService`].
pub struct ConsensusHandle<E> {
    commands: mpsc::Sender<Command>,
    shutdown: mpsc::Sender<()>,
    event_bus: E,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<E> Clone for ConsensusHandle<E>
where
    E: ConsensusEventBus,
{
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            shutdown: self.shutdown.clone(),
            event_bus: self.event_bus.clone(),
            worker: Arc::clone(&self.worker),
        }
    }
}

impl<E> ConsensusHandle<E>
where
    E: ConsensusEventBus,
{
    /// Queue an event from gossip. Waits while the command buffer is full.
    pub async fn submit(&self, event: Event) -> Result<(), ConsensusError> {
        self.send(Command::Submit(event)).await
    }

    /// Stage the member set of the next super-frame.
    pub async fn set_next_members(&self, members: Members) -> Result<(), ConsensusError> {
        self.send(Command::SetNextMembers(members)).await
    }

    pub async fn set_balances(&self, balances: Hash) -> Result<(), ConsensusError> {
        self.send(Command::SetBalances(balances)).await
    }

    /// Worker statistics. Reflects every command queued before this call.
    pub async fn stats(&self) -> Result<ConsensusStats, ConsensusError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        response.await.map_err(|_| ConsensusError::ServiceStopped)
    }

    pub fn subscribe(&self) -> E::Receiver {
        self.event_bus.subscribe()
    }

    /// Stop the worker and wait for it to exit. Buffered events are discarded.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.try_send(());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && let Err(err) = worker.await
        {
            warn!("Consensus worker ended abnormally: {err}");
        }
    }

    async fn send(&self, command: Command) -> Result<(), ConsensusError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConsensusError::ServiceStopped)
    }
}

impl ConsensusHandle<BroadcastEventBus> {
    /// Decisions published from now on, in order.
    pub fn decisions(&self) -> impl Stream<Item = Decision> + Send + 'static {
        let mut receiver = self.event_bus.subscribe();
        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(ConsensusEvent::FrameDecided(decision)) => yield *decision,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Decision stream lagged, {skipped} event(s) skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
