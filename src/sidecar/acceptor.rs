//! Sidecar negotiation orchestration.
//!
//! The acceptor owns both ends of the sidecar protocol that live on this
//! node: offering tickets as a liquidity provider and accepting them as a
//! channel recipient. It persists every ticket, resumes interrupted
//! negotiations after a restart, and tracks which bid nonces still await
//! their channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::Amount;
use rand::RngCore;

use crate::account::{Account, AccountStore};
use crate::clients::{
    Auctioneer, FundingManager, KeyDescriptor, KeyLocator, Signer, Wallet, MULTISIG_KEY_FAMILY,
};
use crate::error::{Error, Result};
use crate::mailbox::CipherBox;
use crate::order::Bid;
use crate::script::FEE_RATE_FLOOR;
use crate::sidecar::negotiator::{
    CipherBoxMailbox, NegotiatorConfig, SidecarDriver, SidecarNegotiator, SidecarPacket,
};
use crate::sidecar::{self, Recipient, SidecarStore, Ticket, TicketOrder, TicketState};

/// External dependencies of the [`SidecarAcceptor`].
pub struct SidecarAcceptorConfig<S> {
    /// Durable ticket and account storage, shared with the account manager.
    pub store: Arc<Mutex<S>>,

    pub signer: Arc<dyn Signer>,
    pub wallet: Arc<dyn Wallet>,
    pub auctioneer: Arc<dyn Auctioneer>,
    pub funding: Arc<dyn FundingManager>,
    pub cipher_box: Arc<dyn CipherBox>,

    /// Identity key of the backing node; becomes the recipient node key of
    /// tickets registered here.
    pub node_pubkey: PublicKey,
}

/// Coordinates sidecar ticket negotiation for both roles.
pub struct SidecarAcceptor<S> {
    core: Arc<AcceptorCore<S>>,
    negotiators: Mutex<HashMap<[u8; 8], Arc<SidecarNegotiator>>>,
}

impl<S> SidecarAcceptor<S>
where
    S: SidecarStore + AccountStore + Send + 'static,
{
    pub fn new(cfg: SidecarAcceptorConfig<S>) -> Self {
        SidecarAcceptor {
            core: Arc::new(AcceptorCore {
                secp: Secp256k1::new(),
                cfg,
                pending_orders: Mutex::new(HashMap::new()),
            }),
            negotiators: Mutex::new(HashMap::new()),
        }
    }

    /// Resumes every stored ticket that still needs work: automated tickets
    /// restart their negotiators, finalized tickets destined for this node
    /// re-arm their channel expectation.
    pub async fn start(&self) -> Result<()> {
        let tickets = self.core.with_store(|store| SidecarStore::sidecars(store))?;

        for ticket in tickets {
            if ticket.offer.auto {
                self.resume_auto_ticket(ticket).await?;
                continue;
            }

            if ticket.state != TicketState::ExpectingChannel {
                continue;
            }
            let Some(recipient) = ticket.recipient else {
                continue;
            };
            if recipient.node_pubkey != self.core.cfg.node_pubkey {
                continue;
            }

            // A finalized ticket for our node: re-register with the
            // auctioneer so the channel can be executed despite restarts.
            let mut ticket = ticket;
            self.core.expect_channel(&mut ticket).await?;
        }

        Ok(())
    }

    /// Stops every running negotiator and waits for their tasks.
    pub async fn stop(&self) {
        let negotiators: Vec<_> = {
            let guard = self.negotiators.lock().expect("negotiator lock");
            guard.values().cloned().collect()
        };
        for negotiator in &negotiators {
            negotiator.stop();
        }
        for negotiator in &negotiators {
            negotiator.join().await;
        }
    }

    /// Creates, signs and persists a new automated sidecar offer backed by
    /// the given account, together with the bid template that will be
    /// submitted once the recipient registers.
    pub async fn offer_sidecar(
        &self,
        capacity: Amount,
        push_amt: Amount,
        lease_duration_blocks: u32,
        account: &Account,
    ) -> Result<Ticket> {
        if capacity == Amount::ZERO {
            return Err(Error::InvalidOffer("capacity must be non-zero".into()));
        }
        if push_amt > capacity {
            return Err(Error::InvalidOffer(format!(
                "push amount {push_amt} exceeds capacity {capacity}",
            )));
        }

        let (id, bid) = {
            let mut rng = rand::thread_rng();
            let mut id = [0u8; 8];
            rng.fill_bytes(&mut id);
            let bid = Bid::new(
                &mut rng,
                capacity,
                push_amt,
                lease_duration_blocks,
                FEE_RATE_FLOOR,
            );
            (id, bid)
        };

        let sign_pubkey = account.trader_key.pubkey;
        let digest =
            sidecar::offer_digest(id, capacity, push_amt, lease_duration_blocks, &sign_pubkey);
        let sig = self
            .core
            .cfg
            .signer
            .sign_digest(&account.trader_key.locator, digest)
            .await?;
        let sig_offer_digest = Signature::from_compact(&sig)
            .map_err(|e| Error::Signer(format!("invalid offer signature: {e}")))?;

        let ticket = Ticket {
            id,
            state: TicketState::Offered,
            offer: sidecar::Offer {
                capacity,
                push_amt,
                lease_duration_blocks,
                sign_pubkey,
                sig_offer_digest,
                auto: true,
            },
            recipient: None,
            order: None,
        };
        ticket.verify_offer(&self.core.secp)?;

        self.core
            .with_store(|store| store.add_sidecar_with_bid(&ticket, &bid))?;

        log::info!(
            "offered sidecar ticket={} for capacity {capacity}",
            hex::encode(id),
        );
        Ok(ticket)
    }

    /// Verifies an offered ticket, derives a fresh channel multisig key for
    /// it and persists it in the registered state. This is the recipient's
    /// half of the handshake.
    pub async fn register_sidecar(&self, ticket: Ticket) -> Result<Ticket> {
        ticket.verify_offer(&self.core.secp)?;

        // Reject duplicates up front; identity is (id, sign key).
        let existing = self
            .core
            .with_store(|store| store.sidecar(ticket.id, &ticket.offer.sign_pubkey));
        match existing {
            Ok(_) => return Err(Error::SidecarExists(ticket.id)),
            Err(Error::NoSidecarTicket) => {}
            Err(e) => return Err(e),
        }

        let key_desc = self
            .core
            .cfg
            .wallet
            .derive_next_key(MULTISIG_KEY_FAMILY)
            .await?;

        let mut ticket = ticket;
        ticket.state = TicketState::Registered;
        ticket.recipient = Some(Recipient {
            node_pubkey: self.core.cfg.node_pubkey,
            multisig_pubkey: key_desc.pubkey,
            multisig_key_index: key_desc.locator.index,
        });

        self.core.with_store(|store| store.add_sidecar(&ticket))?;
        Ok(ticket)
    }

    /// Kicks off automated negotiation as the ticket's recipient. The
    /// ticket must have been registered first.
    pub async fn auto_accept_sidecar(&self, ticket: Ticket) -> Result<()> {
        log::info!(
            "attempting negotiation to receive sidecar ticket={}",
            hex::encode(ticket.id),
        );
        self.spawn_negotiator(
            false,
            SidecarPacket {
                current_state: TicketState::Registered,
                provider_ticket: ticket,
                receiver_ticket: ticket,
            },
            None,
        )
        .await
    }

    /// Kicks off automated negotiation as the ticket's provider, using the
    /// given bid template and backing account.
    pub async fn coordinate_sidecar(
        &self,
        ticket: Ticket,
        bid: Bid,
        account: Account,
    ) -> Result<()> {
        log::info!(
            "attempting negotiation to offer sidecar ticket={}",
            hex::encode(ticket.id),
        );
        self.spawn_negotiator(
            true,
            SidecarPacket {
                current_state: TicketState::Offered,
                provider_ticket: ticket,
                receiver_ticket: ticket,
            },
            Some((bid, account)),
        )
        .await
    }

    /// Marks the ticket's channel as delivered: its negotiator stamps the
    /// terminal state and tears its mailbox down.
    pub async fn ticket_executed(&self, id: [u8; 8]) {
        let negotiator = {
            let guard = self.negotiators.lock().expect("negotiator lock");
            guard.get(&id).cloned()
        };
        if let Some(negotiator) = negotiator {
            negotiator.ticket_executed().await;
        }
    }

    /// The negotiator state for a ticket, if one is running.
    pub fn negotiator_state(&self, id: [u8; 8]) -> Option<TicketState> {
        let guard = self.negotiators.lock().expect("negotiator lock");
        guard.get(&id).map(|negotiator| negotiator.current_state())
    }

    async fn resume_auto_ticket(&self, ticket: Ticket) -> Result<()> {
        // Our role is determined by whether we hold the account the offer
        // was signed with.
        let account = self
            .core
            .with_store(|store| AccountStore::account(store, &ticket.offer.sign_pubkey));

        match account {
            Ok(account) => {
                let bid = self
                    .core
                    .with_store(|store| store.sidecar_bid_template(&ticket))?;

                // If the registered ticket never became durable, restart the
                // exchange from scratch so the recipient re-sends it.
                let current_state = if ticket.state == TicketState::Offered {
                    TicketState::Created
                } else {
                    ticket.state
                };

                self.spawn_negotiator(
                    true,
                    SidecarPacket {
                        current_state,
                        provider_ticket: ticket,
                        receiver_ticket: ticket,
                    },
                    Some((bid, account)),
                )
                .await
            }

            Err(Error::AccountNotFound) => {
                self.spawn_negotiator(
                    false,
                    SidecarPacket {
                        current_state: ticket.state,
                        provider_ticket: ticket,
                        receiver_ticket: ticket,
                    },
                    None,
                )
                .await
            }

            Err(e) => Err(e),
        }
    }

    async fn spawn_negotiator(
        &self,
        provider: bool,
        starting_pkt: SidecarPacket,
        provider_ctx: Option<(Bid, Account)>,
    ) -> Result<()> {
        let ticket_id = starting_pkt.provider_ticket.id;
        let account_key = provider_ctx
            .as_ref()
            .map(|(_, account)| account.trader_key);

        let driver = Arc::new(AcceptorDriver {
            core: self.core.clone(),
            provider_ctx,
        });
        let mailbox = Arc::new(CipherBoxMailbox::new(
            self.core.cfg.cipher_box.clone(),
            account_key,
        ));

        let negotiator = Arc::new(SidecarNegotiator::new(NegotiatorConfig {
            provider,
            starting_pkt,
            driver,
            mailbox,
        }));
        negotiator.start().await?;

        self.negotiators
            .lock()
            .expect("negotiator lock")
            .insert(ticket_id, negotiator);
        Ok(())
    }
}

struct AcceptorCore<S> {
    secp: Secp256k1<All>,
    cfg: SidecarAcceptorConfig<S>,
    /// Bid nonces whose channels we still await, to keep re-registration
    /// idempotent within one run.
    pending_orders: Mutex<HashMap<[u8; 32], Ticket>>,
}

impl<S> AcceptorCore<S>
where
    S: SidecarStore + AccountStore + Send,
{
    fn with_store<R>(&self, f: impl FnOnce(&mut S) -> Result<R>) -> Result<R> {
        let mut store = self
            .cfg
            .store
            .lock()
            .map_err(|_| Error::Store("store lock poisoned".into()))?;
        f(&mut store)
    }

    /// Full validation of a finalized ticket before the recipient commits
    /// to expecting the channel.
    fn validate_ordered_ticket(&self, ticket: &Ticket) -> Result<()> {
        if !matches!(
            ticket.state,
            TicketState::Ordered | TicketState::ExpectingChannel,
        ) {
            return Err(Error::UnexpectedTicketState {
                actual: ticket.state,
                expected: TicketState::Ordered,
            });
        }

        ticket.verify_offer(&self.secp)?;
        ticket.verify_order(&self.secp)?;

        // The registration must have gone through us earlier.
        self.with_store(|store| store.sidecar(ticket.id, &ticket.offer.sign_pubkey))?;
        Ok(())
    }

    /// Stamps the ticket as expecting its channel, persists it, registers
    /// the bid nonce and authenticates the recipient multisig key with the
    /// auctioneer.
    async fn expect_channel(&self, ticket: &mut Ticket) -> Result<()> {
        let order = ticket.order.ok_or(Error::MissingOrder)?;
        let recipient = ticket.recipient.ok_or(Error::MissingRecipient)?;

        // Serialize concurrent expectations; one channel per bid nonce.
        {
            let mut pending = self.pending_orders.lock().expect("pending order lock");
            if pending.contains_key(&order.bid_nonce) {
                return Err(Error::ChannelAlreadyExpected(order.bid_nonce));
            }

            ticket.state = TicketState::ExpectingChannel;
            self.with_store(|store| store.update_sidecar(ticket))?;
            pending.insert(order.bid_nonce, *ticket);
        }

        self.cfg.funding.expect_channel(ticket).await?;

        // Authenticate the bare multisig key with the server so we receive
        // the match-making messages for the bid.
        self.cfg
            .auctioneer
            .start_key_subscription(&KeyDescriptor {
                locator: KeyLocator {
                    family: MULTISIG_KEY_FAMILY,
                    index: recipient.multisig_key_index,
                },
                pubkey: recipient.multisig_pubkey,
            })
            .await
    }

    /// Binds the bid to the ticket, signs the order digest and submits the
    /// bid. A bid the auctioneer already knows is treated as success so
    /// restarts can safely re-submit.
    async fn submit_sidecar_order(
        &self,
        ticket: &Ticket,
        bid: &Bid,
        account: &Account,
    ) -> Result<Ticket> {
        let terms = self.cfg.auctioneer.terms().await?;
        if bid.lease_duration_blocks > terms.max_order_duration_blocks {
            return Err(Error::InvalidOffer(format!(
                "lease duration {} exceeds the auctioneer maximum {}",
                bid.lease_duration_blocks, terms.max_order_duration_blocks,
            )));
        }

        let digest = sidecar::order_digest(ticket.id, bid.nonce);
        let sig = self
            .cfg
            .signer
            .sign_digest(&account.trader_key.locator, digest)
            .await?;
        let sig_order_digest = Signature::from_compact(&sig)
            .map_err(|e| Error::Signer(format!("invalid order signature: {e}")))?;

        let mut updated = *ticket;
        updated.state = TicketState::Ordered;
        updated.order = Some(TicketOrder {
            bid_nonce: bid.nonce,
            sig_order_digest,
        });

        match self
            .cfg
            .auctioneer
            .submit_order(bid, &account.trader_key.pubkey)
            .await
        {
            Ok(()) => {}
            // Already submitted before a restart; the ticket state is
            // persisted separately, so no split brain to worry about.
            Err(Error::OrderExists(_)) => {}
            Err(e) => return Err(e),
        }

        Ok(updated)
    }
}

struct AcceptorDriver<S> {
    core: Arc<AcceptorCore<S>>,
    /// Bid template and backing account; present only on the provider side.
    provider_ctx: Option<(Bid, Account)>,
}

#[async_trait::async_trait]
impl<S> SidecarDriver for AcceptorDriver<S>
where
    S: SidecarStore + AccountStore + Send + 'static,
{
    async fn validate_ordered_ticket(&self, ticket: &Ticket) -> Result<()> {
        self.core.validate_ordered_ticket(ticket)
    }

    async fn expect_channel(&self, ticket: &mut Ticket) -> Result<()> {
        self.core.expect_channel(ticket).await
    }

    async fn update_sidecar(&self, ticket: &Ticket) -> Result<()> {
        self.core.with_store(|store| store.update_sidecar(ticket))
    }

    async fn submit_sidecar_order(&self, ticket: &Ticket) -> Result<Ticket> {
        let (bid, account) = self
            .provider_ctx
            .as_ref()
            .ok_or_else(|| Error::InvalidOffer("only the provider submits orders".into()))?;
        self.core.submit_sidecar_order(ticket, bid, account).await
    }
}
