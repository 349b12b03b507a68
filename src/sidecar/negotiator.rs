//! Automated sidecar ticket negotiation.
//!
//! Each negotiation runs two role-specialized state machines, one per party,
//! that exchange the evolving ticket over cipher-box streams until both sides
//! reach [`TicketState::ExpectingChannel`]. The transport delivers at least
//! once and unordered, so every transition must tolerate duplicates and
//! retransmission requests.
//!
//! The transition logic itself is pure: [`step_receiver`] and
//! [`step_provider`] map a packet to a decision without performing effects.
//! [`SidecarNegotiator`] owns two tasks per ticket, a reader blocking on the
//! mailbox and a driver executing decisions, and checkpoints through the
//! [`SidecarDriver`] before the negotiation advances.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::clients::KeyDescriptor;
use crate::error::{Error, Result};
use crate::mailbox::{ok_if_exists, CipherBox};
use crate::sidecar::{provider_stream_id, recipient_stream_id, Ticket, TicketState};

/// The current state of one negotiation step: the negotiator's own state
/// plus both parties' latest known tickets. State machine transitions are
/// triggered by the difference between the negotiator state and the ticket
/// states.
#[derive(Debug, Clone)]
pub struct SidecarPacket {
    /// The negotiator's current state, which may intentionally lag or lead
    /// the ticket states.
    pub current_state: TicketState,

    /// The provider's latest known ticket.
    pub provider_ticket: Ticket,

    /// The receiver's latest known ticket.
    pub receiver_ticket: Ticket,
}

/// Decision of one receiver-side transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverAction {
    /// Send our registered ticket to the provider and remain registered.
    /// Also the answer to a provider retransmitting its initial offer after
    /// a restart.
    ResendRegistered,

    /// The provider finalized the ticket: validate it, arm the channel
    /// expectation and finish.
    Finalize,

    /// Re-arm the channel expectation for a finalized ticket, typically
    /// after our own restart.
    ReExpect,

    /// A buffered or duplicate message; nothing to do.
    Ignore,
}

/// Maps an incoming provider ticket onto the receiver's next action. Pure;
/// the caller performs the effects.
pub fn step_receiver(pkt: &SidecarPacket) -> ReceiverAction {
    let incoming = pkt.provider_ticket.state;

    match (pkt.current_state, incoming) {
        // The provider restarted and lost our registration; re-send it.
        (_, TicketState::Offered) => ReceiverAction::ResendRegistered,

        // Their ticket caught up to ours; answer with our registered ticket
        // so they can proceed.
        (TicketState::Registered, TicketState::Registered) => ReceiverAction::ResendRegistered,

        // The finalized ticket arrived; validate and start expecting the
        // channel.
        (TicketState::Registered, TicketState::Ordered)
        | (TicketState::Registered, TicketState::ExpectingChannel) => ReceiverAction::Finalize,

        // Already finalized on our end; re-arm the subscription in case this
        // is a post-restart replay.
        (TicketState::ExpectingChannel, TicketState::Ordered)
        | (TicketState::ExpectingChannel, TicketState::ExpectingChannel) => {
            ReceiverAction::ReExpect
        }

        _ => ReceiverAction::Ignore,
    }
}

/// Decision of one provider-side transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderAction {
    /// We restarted before the registered ticket was durable; re-send our
    /// offered ticket to request retransmission.
    ResendOffer,

    /// The receiver's registered ticket arrived; checkpoint it.
    AdoptRegistered,

    /// Everything needed to submit the bid is durable; submit it.
    SubmitOrder,

    /// Send the finalized ticket to the receiver and settle into the
    /// channel expectation.
    SendFinal,

    /// No transition applies; the caller logs and waits for the next
    /// message.
    Unhandled,
}

/// Maps an incoming receiver ticket onto the provider's next action. Pure;
/// the caller performs the effects.
pub fn step_provider(pkt: &SidecarPacket) -> ProviderAction {
    match (pkt.current_state, pkt.provider_ticket.state, pkt.receiver_ticket.state) {
        (TicketState::Created, TicketState::Offered, _) => ProviderAction::ResendOffer,

        (TicketState::Offered, _, TicketState::Registered) => ProviderAction::AdoptRegistered,

        (TicketState::Registered, _, _) => ProviderAction::SubmitOrder,

        // Either the natural progression after ordering, or the receiver
        // asking for a re-transmission of the finalized ticket.
        (TicketState::Ordered, _, _)
        | (TicketState::ExpectingChannel, _, TicketState::Registered) => {
            ProviderAction::SendFinal
        }

        _ => ProviderAction::Unhandled,
    }
}

/// Effectful operations a negotiation needs from its surroundings. The
/// acceptor implements this against the store, signer and auctioneer.
#[async_trait]
pub trait SidecarDriver: Send + Sync {
    /// Full validation of a finalized ticket: offer signature, order
    /// signature and local existence.
    async fn validate_ordered_ticket(&self, ticket: &Ticket) -> Result<()>;

    /// Stamp the ticket as expecting its channel, persist it and arm the
    /// auctioneer subscription. Must be idempotent across restarts.
    async fn expect_channel(&self, ticket: &mut Ticket) -> Result<()>;

    /// Checkpoint the ticket in the store.
    async fn update_sidecar(&self, ticket: &Ticket) -> Result<()>;

    /// Submit the bid bound to this ticket and return the ticket carrying
    /// the order block. A bid that was already submitted is not an error.
    async fn submit_sidecar_order(&self, ticket: &Ticket) -> Result<Ticket>;
}

/// Transport seam of a negotiation: sends and receives whole tickets over
/// the party-addressed streams.
#[async_trait]
pub trait TicketMailbox: Send + Sync {
    /// Sends `pkt` to the provider's stream (`to_provider`) or the
    /// recipient's.
    async fn send_pkt(&self, pkt: &Ticket, to_provider: bool) -> Result<()>;

    /// Receives the next ticket addressed to us. `local` supplies the
    /// stream derivation inputs and never changes for the lifetime of a
    /// negotiation.
    async fn recv_pkt(&self, local: &Ticket, provider: bool) -> Result<Ticket>;

    /// Creates our receiving mailbox. Implementations surface
    /// [`Error::MailboxExists`]; callers treat it as success.
    async fn init_mailbox(&self, local: &Ticket, provider: bool) -> Result<()>;

    /// Tears our receiving mailbox down once the ticket completes.
    async fn delete_mailbox(&self, local: &Ticket, provider: bool) -> Result<()>;
}

/// [`TicketMailbox`] over a real cipher-box transport, deriving the stream
/// ids from the ticket.
pub struct CipherBoxMailbox {
    cipher_box: Arc<dyn CipherBox>,
    /// The provider's account key, required to authenticate its mailbox.
    account_key: Option<KeyDescriptor>,
}

impl CipherBoxMailbox {
    pub fn new(cipher_box: Arc<dyn CipherBox>, account_key: Option<KeyDescriptor>) -> Self {
        CipherBoxMailbox {
            cipher_box,
            account_key,
        }
    }

    fn stream_id(ticket: &Ticket, provider: bool) -> Result<[u8; 64]> {
        if provider {
            Ok(provider_stream_id(ticket))
        } else {
            recipient_stream_id(ticket)
        }
    }
}

#[async_trait]
impl TicketMailbox for CipherBoxMailbox {
    async fn send_pkt(&self, pkt: &Ticket, to_provider: bool) -> Result<()> {
        let stream_id = Self::stream_id(pkt, to_provider)?;
        log::info!(
            "sending ticket(state={}, id={}) to {} stream_id={}",
            pkt.state,
            hex::encode(pkt.id),
            if to_provider { "provider" } else { "receiver" },
            hex::encode(stream_id),
        );
        self.cipher_box.send(stream_id, &pkt.serialize()).await
    }

    async fn recv_pkt(&self, local: &Ticket, provider: bool) -> Result<Ticket> {
        let stream_id = Self::stream_id(local, provider)?;
        loop {
            let msg = self.cipher_box.recv(stream_id).await?;
            match Ticket::deserialize(&msg) {
                Ok(ticket) => return Ok(ticket),
                // The sender will retransmit anything that matters; drop
                // garbage instead of tearing the negotiation down.
                Err(e) => log::warn!(
                    "dropping undecodable message on stream {}: {e}",
                    hex::encode(stream_id),
                ),
            }
        }
    }

    async fn init_mailbox(&self, local: &Ticket, provider: bool) -> Result<()> {
        let stream_id = Self::stream_id(local, provider)?;
        if provider {
            let key = self
                .account_key
                .ok_or_else(|| Error::Mailbox("provider mailbox needs an account key".into()))?;
            self.cipher_box.init_account_mailbox(stream_id, &key).await
        } else {
            self.cipher_box.init_ticket_mailbox(stream_id, local).await
        }
    }

    async fn delete_mailbox(&self, local: &Ticket, provider: bool) -> Result<()> {
        let stream_id = Self::stream_id(local, provider)?;
        if provider {
            let key = self
                .account_key
                .ok_or_else(|| Error::Mailbox("provider mailbox needs an account key".into()))?;
            self.cipher_box
                .delete_account_mailbox(stream_id, &key)
                .await
        } else {
            self.cipher_box.delete_ticket_mailbox(stream_id, local).await
        }
    }
}

/// Configuration of one negotiation.
pub struct NegotiatorConfig {
    /// Whether we are the ticket's provider or its receiver.
    pub provider: bool,

    /// The packet the negotiation (re)starts from. On a provider restart
    /// with an undelivered registration the current state is reset to
    /// [`TicketState::Created`] by the caller to force one retransmission
    /// round.
    pub starting_pkt: SidecarPacket,

    pub driver: Arc<dyn SidecarDriver>,
    pub mailbox: Arc<dyn TicketMailbox>,
}

/// Drives one sidecar ticket to completion in the background.
pub struct SidecarNegotiator {
    cfg: NegotiatorConfig,
    current_state: Arc<AtomicU8>,
    executed_tx: mpsc::Sender<()>,
    executed_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SidecarNegotiator {
    pub fn new(cfg: NegotiatorConfig) -> Self {
        let current_state = Arc::new(AtomicU8::new(cfg.starting_pkt.current_state.as_u8()));
        let (executed_tx, executed_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        SidecarNegotiator {
            cfg,
            current_state,
            executed_tx,
            executed_rx: Mutex::new(Some(executed_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The negotiator's current state, for observers and tests.
    pub fn current_state(&self) -> TicketState {
        TicketState::from_u8(self.current_state.load(Ordering::SeqCst))
            .expect("state codes are closed under the atomic")
    }

    /// Signals that the channel bound to this ticket has been opened by a
    /// cleared batch; the ticket transitions to its terminal state and the
    /// mailboxes are torn down.
    pub async fn ticket_executed(&self) {
        let _ = self.executed_tx.send(()).await;
    }

    /// Signals both tasks to exit.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for both tasks to finish after [`Self::stop`].
    pub async fn join(&self) {
        let tasks: Vec<_> = self.tasks.lock().expect("task lock").drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Creates our mailbox and launches the reader and driver tasks.
    pub async fn start(&self) -> Result<()> {
        let provider = self.cfg.provider;
        let local_ticket = if provider {
            self.cfg.starting_pkt.provider_ticket
        } else {
            self.cfg.starting_pkt.receiver_ticket
        };

        ok_if_exists(self.cfg.mailbox.init_mailbox(&local_ticket, provider).await)?;

        // Seed the loop with a simulated first message from the other party
        // so a (re)start makes progress without waiting for the wire.
        let (pkt_tx, pkt_rx) = mpsc::channel(1);
        let seed = if provider {
            self.cfg.starting_pkt.receiver_ticket
        } else {
            self.cfg.starting_pkt.provider_ticket
        };
        pkt_tx
            .send(seed)
            .await
            .map_err(|_| Error::Shutdown)?;

        // Reader: blocks on the mailbox and forwards tickets to the driver
        // until shutdown. The other side retransmits until we're done, so
        // the reader always keeps reading.
        let reader = {
            let mailbox = self.cfg.mailbox.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = mailbox.recv_pkt(&local_ticket, provider) => match result {
                            Ok(ticket) => {
                                if pkt_tx.send(ticket).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                log::error!("mailbox reader exiting: {e}");
                                return;
                            }
                        },
                        _ = shutdown.changed() => return,
                    }
                }
            })
        };

        let driver_loop = DriverLoop {
            provider,
            driver: self.cfg.driver.clone(),
            mailbox: self.cfg.mailbox.clone(),
            current_state: self.current_state.clone(),
            local_ticket,
        };
        let executed_rx = self
            .executed_rx
            .lock()
            .expect("executed lock")
            .take()
            .ok_or(Error::Shutdown)?;
        let driver = tokio::spawn(driver_loop.run(
            pkt_rx,
            executed_rx,
            self.shutdown_tx.subscribe(),
        ));

        let mut tasks = self.tasks.lock().expect("task lock");
        tasks.push(reader);
        tasks.push(driver);
        Ok(())
    }
}

struct DriverLoop {
    provider: bool,
    driver: Arc<dyn SidecarDriver>,
    mailbox: Arc<dyn TicketMailbox>,
    current_state: Arc<AtomicU8>,
    local_ticket: Ticket,
}

impl DriverLoop {
    async fn run(
        mut self,
        mut pkt_rx: mpsc::Receiver<Ticket>,
        mut executed_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(incoming) = pkt_rx.recv() => {
                    if self.provider {
                        self.provider_round(incoming).await;
                    } else {
                        self.receiver_round(incoming).await;
                    }
                }

                Some(()) = executed_rx.recv() => {
                    self.finish_executed().await;
                    return;
                }

                _ = shutdown.changed() => return,

                else => return,
            }
        }
    }

    fn state(&self) -> TicketState {
        TicketState::from_u8(self.current_state.load(Ordering::SeqCst))
            .expect("state codes are closed under the atomic")
    }

    fn set_state(&self, state: TicketState) {
        self.current_state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Applies receiver transitions for one incoming ticket.
    async fn receiver_round(&mut self, incoming: Ticket) {
        let pkt = SidecarPacket {
            current_state: self.state(),
            provider_ticket: incoming,
            receiver_ticket: self.local_ticket,
        };

        match step_receiver(&pkt) {
            ReceiverAction::ResendRegistered => {
                log::info!(
                    "transmitting registered ticket={} to provider",
                    hex::encode(pkt.receiver_ticket.id),
                );
                if let Err(e) = self.mailbox.send_pkt(&pkt.receiver_ticket, true).await {
                    log::error!("unable to send registered ticket: {e}");
                }
            }

            ReceiverAction::Finalize => {
                if let Err(e) = self.finalize_receiver(pkt.provider_ticket).await {
                    log::error!("unable to finalize ticket: {e}");
                }
            }

            ReceiverAction::ReExpect => {
                let mut ticket = pkt.provider_ticket;
                if let Err(e) = self.driver.expect_channel(&mut ticket).await {
                    log::warn!(
                        "unable to re-arm channel expectation for ticket={}: {e}",
                        hex::encode(ticket.id),
                    );
                }
            }

            ReceiverAction::Ignore => {
                log::debug!(
                    "ignoring buffered ticket={} in state {}",
                    hex::encode(pkt.provider_ticket.id),
                    pkt.provider_ticket.state,
                );
            }
        }
    }

    async fn finalize_receiver(&mut self, incoming: Ticket) -> Result<()> {
        self.driver.validate_ordered_ticket(&incoming).await?;

        let mut ticket = incoming;
        self.driver.expect_channel(&mut ticket).await?;

        log::info!(
            "auto negotiation for ticket={} complete, expecting channel",
            hex::encode(ticket.id),
        );
        self.local_ticket = ticket;
        self.set_state(TicketState::ExpectingChannel);
        Ok(())
    }

    /// Applies provider transitions for one incoming ticket, looping until
    /// the state reaches a fixed point or the channel expectation.
    async fn provider_round(&mut self, incoming: Ticket) {
        let mut receiver_ticket = incoming;

        loop {
            let prior_state = self.state();
            let pkt = SidecarPacket {
                current_state: prior_state,
                provider_ticket: self.local_ticket,
                receiver_ticket,
            };

            let next = match self.provider_step(pkt).await {
                Ok(next) => next,
                Err(e) => {
                    log::error!("unable to transition state: {e}");
                    return;
                }
            };

            self.set_state(next.current_state);
            self.local_ticket = next.provider_ticket;
            receiver_ticket = next.receiver_ticket;

            if next.current_state == prior_state
                || next.current_state == TicketState::ExpectingChannel
            {
                return;
            }
        }
    }

    async fn provider_step(&self, pkt: SidecarPacket) -> Result<SidecarPacket> {
        match step_provider(&pkt) {
            ProviderAction::ResendOffer => {
                log::info!(
                    "resuming negotiation for ticket={}, requesting registered ticket",
                    hex::encode(pkt.provider_ticket.id),
                );
                self.mailbox.send_pkt(&pkt.provider_ticket, false).await?;

                Ok(SidecarPacket {
                    current_state: TicketState::Offered,
                    receiver_ticket: pkt.provider_ticket,
                    provider_ticket: pkt.receiver_ticket,
                })
            }

            ProviderAction::AdoptRegistered => {
                log::info!(
                    "received registered ticket={} from recipient",
                    hex::encode(pkt.receiver_ticket.id),
                );

                // Checkpoint before anything else builds on the
                // registration.
                self.driver.update_sidecar(&pkt.receiver_ticket).await?;

                Ok(SidecarPacket {
                    current_state: TicketState::Registered,
                    receiver_ticket: pkt.receiver_ticket,
                    provider_ticket: pkt.receiver_ticket,
                })
            }

            ProviderAction::SubmitOrder => {
                log::info!(
                    "submitting bid order for ticket={}",
                    hex::encode(pkt.provider_ticket.id),
                );
                let updated = self.driver.submit_sidecar_order(&pkt.provider_ticket).await?;

                Ok(SidecarPacket {
                    current_state: TicketState::Ordered,
                    receiver_ticket: updated,
                    provider_ticket: updated,
                })
            }

            ProviderAction::SendFinal => {
                log::info!(
                    "sending finalized ticket={} to receiver, entering final stage",
                    hex::encode(pkt.provider_ticket.id),
                );
                self.mailbox.send_pkt(&pkt.provider_ticket, false).await?;

                // Not strictly required to be durable before the send: on a
                // restart we re-send the latest ticket anyway.
                let mut updated = pkt.provider_ticket;
                updated.state = TicketState::ExpectingChannel;
                self.driver.update_sidecar(&updated).await?;

                Ok(SidecarPacket {
                    current_state: TicketState::ExpectingChannel,
                    receiver_ticket: updated,
                    provider_ticket: updated,
                })
            }

            ProviderAction::Unhandled => Err(Error::UnexpectedTicketState {
                actual: pkt.receiver_ticket.state,
                expected: TicketState::Registered,
            }),
        }
    }

    /// The batch carrying this ticket's channel executed: stamp the ticket
    /// complete, checkpoint and tear the mailbox down.
    async fn finish_executed(&mut self) {
        let mut ticket = self.local_ticket;
        ticket.state = TicketState::Completed;

        if let Err(e) = self.driver.update_sidecar(&ticket).await {
            log::error!("unable to record completed ticket: {e}");
        }
        if let Err(e) = self.mailbox.delete_mailbox(&ticket, self.provider).await {
            log::warn!("unable to delete mailbox: {e}");
        }

        self.local_ticket = ticket;
        self.set_state(TicketState::Completed);
        log::info!(
            "negotiation for ticket={} has been completed",
            hex::encode(ticket.id),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn packet(
        current: TicketState,
        provider_state: TicketState,
        receiver_state: TicketState,
    ) -> SidecarPacket {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let mut provider_ticket = testing::test_ticket(&secp, 1);
        provider_ticket.state = provider_state;
        let mut receiver_ticket = testing::test_ticket(&secp, 1);
        receiver_ticket.state = receiver_state;
        SidecarPacket {
            current_state: current,
            provider_ticket,
            receiver_ticket,
        }
    }

    #[test]
    fn receiver_answers_restarted_provider() {
        use TicketState::*;
        let pkt = packet(Registered, Offered, Registered);
        assert_eq!(step_receiver(&pkt), ReceiverAction::ResendRegistered);
    }

    #[test]
    fn receiver_finalizes_on_ordered_or_expecting() {
        use TicketState::*;
        for incoming in [Ordered, ExpectingChannel] {
            let pkt = packet(Registered, incoming, Registered);
            assert_eq!(step_receiver(&pkt), ReceiverAction::Finalize);
        }
    }

    #[test]
    fn receiver_rearms_after_restart() {
        use TicketState::*;
        let pkt = packet(ExpectingChannel, ExpectingChannel, ExpectingChannel);
        assert_eq!(step_receiver(&pkt), ReceiverAction::ReExpect);
    }

    #[test]
    fn receiver_ignores_duplicates_without_regressing() {
        use TicketState::*;

        // Whatever stale or duplicated packets arrive, a receiver that
        // reached the channel expectation never falls back to an earlier
        // action.
        for incoming in [Created, Registered] {
            let pkt = packet(ExpectingChannel, incoming, ExpectingChannel);
            assert_eq!(step_receiver(&pkt), ReceiverAction::Ignore);
        }
    }

    #[test]
    fn provider_resends_offer_only_from_created() {
        use TicketState::*;
        let pkt = packet(Created, Offered, Offered);
        assert_eq!(step_provider(&pkt), ProviderAction::ResendOffer);

        let pkt = packet(Offered, Offered, Offered);
        assert_eq!(step_provider(&pkt), ProviderAction::Unhandled);
    }

    #[test]
    fn provider_walks_happy_path() {
        use TicketState::*;

        let pkt = packet(Offered, Offered, Registered);
        assert_eq!(step_provider(&pkt), ProviderAction::AdoptRegistered);

        let pkt = packet(Registered, Registered, Registered);
        assert_eq!(step_provider(&pkt), ProviderAction::SubmitOrder);

        let pkt = packet(Ordered, Ordered, Registered);
        assert_eq!(step_provider(&pkt), ProviderAction::SendFinal);
    }

    #[test]
    fn provider_retransmits_final_ticket() {
        use TicketState::*;
        let pkt = packet(ExpectingChannel, ExpectingChannel, Registered);
        assert_eq!(step_provider(&pkt), ProviderAction::SendFinal);

        // But duplicates of the finalized ticket itself are a fixed point.
        let pkt = packet(ExpectingChannel, ExpectingChannel, ExpectingChannel);
        assert_eq!(step_provider(&pkt), ProviderAction::Unhandled);
    }

    #[test]
    fn steps_are_deterministic_under_duplication() {
        use TicketState::*;

        // Replaying the same packet any number of times yields the same
        // decision; idempotence of the machines reduces to idempotence of
        // the individual effects.
        let pkt = packet(Registered, Ordered, Registered);
        let first = step_receiver(&pkt);
        for _ in 0..10 {
            assert_eq!(step_receiver(&pkt), first);
        }

        let pkt = packet(Offered, Offered, Registered);
        let first = step_provider(&pkt);
        for _ in 0..10 {
            assert_eq!(step_provider(&pkt), first);
        }
    }
}
