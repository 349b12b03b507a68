//! Per-account chain event watcher.
//!
//! One dispatcher task owns every registration and serializes all handler
//! invocations, so account state transitions never race each other.
//! Registrations arrive over a command channel; chain notifier futures are
//! forwarded into a single event channel by small per-registration tasks.
//!
//! Delivery policy: queued confirmation events are drained before block
//! events, so a confirmation and the expiry triggered by the same height
//! reach the handlers in that order. The confirmation handler additionally
//! ignores confirmations at the expiry height, leaving that boundary to the
//! expiry handler.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::clients::{ChainNotifier, SpendDetail, TxConfirmation};
use crate::error::{Error, Result};

/// Account event callbacks, supplied at watcher construction.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A watched account funding transaction reached its confirmation
    /// target.
    async fn handle_account_conf(
        &self,
        trader_key: PublicKey,
        conf: TxConfirmation,
    ) -> Result<()>;

    /// A watched account output was spent.
    async fn handle_account_spend(&self, trader_key: PublicKey, spend: SpendDetail)
        -> Result<()>;

    /// The chain reached a watched account's expiry height.
    async fn handle_account_expiry(&self, trader_key: PublicKey) -> Result<()>;
}

enum WatchCmd {
    Conf {
        trader_key: PublicKey,
        txid: Txid,
        script: ScriptBuf,
        num_confs: u32,
        height_hint: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    Spend {
        trader_key: PublicKey,
        outpoint: OutPoint,
        script: ScriptBuf,
        height_hint: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    Expiry {
        trader_key: PublicKey,
        expiry_height: u32,
        reply: oneshot::Sender<Result<()>>,
    },
}

enum ChainEvent {
    Conf {
        trader_key: PublicKey,
        conf: TxConfirmation,
    },
    Spend {
        trader_key: PublicKey,
        spend: SpendDetail,
    },
}

/// Handle for registering watches with a running watcher.
#[derive(Clone)]
pub struct WatcherHandle {
    cmd_tx: mpsc::UnboundedSender<WatchCmd>,
}

impl WatcherHandle {
    /// Registers a one-shot confirmation watch for an account funding
    /// transaction.
    pub async fn watch_account_conf(
        &self,
        trader_key: PublicKey,
        txid: Txid,
        script: ScriptBuf,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<()> {
        self.request(|reply| WatchCmd::Conf {
            trader_key,
            txid,
            script,
            num_confs,
            height_hint,
            reply,
        })
        .await
    }

    /// Registers a one-shot spend watch on an account outpoint.
    pub async fn watch_account_spend(
        &self,
        trader_key: PublicKey,
        outpoint: OutPoint,
        script: ScriptBuf,
        height_hint: u32,
    ) -> Result<()> {
        self.request(|reply| WatchCmd::Spend {
            trader_key,
            outpoint,
            script,
            height_hint,
            reply,
        })
        .await
    }

    /// Arms the expiry notification for an account. Fires exactly once when
    /// the best known tip reaches `expiry_height`; immediately if it already
    /// has. Re-registering replaces any earlier height for the account.
    pub async fn watch_account_expiration(
        &self,
        trader_key: PublicKey,
        expiry_height: u32,
    ) -> Result<()> {
        self.request(|reply| WatchCmd::Expiry {
            trader_key,
            expiry_height,
            reply,
        })
        .await
    }

    async fn request<F>(&self, make_cmd: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> WatchCmd,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .map_err(|_| Error::WatcherShutdown)?;
        reply_rx.await.map_err(|_| Error::WatcherShutdown)?
    }
}

/// Starts the watcher. Subscribes to block epochs before returning so a
/// broken notifier surfaces here rather than inside the task.
pub async fn spawn(
    notifier: Arc<dyn ChainNotifier>,
    handler: Arc<dyn EventHandler>,
    shutdown: watch::Receiver<bool>,
) -> Result<(WatcherHandle, JoinHandle<()>)> {
    let blocks = notifier.register_block_epoch().await?;
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let dispatcher = Dispatcher {
        notifier,
        handler,
        shutdown,
        best_height: None,
        expiry_heights: BTreeMap::new(),
        expiry_by_key: HashMap::new(),
    };
    let task = tokio::spawn(dispatcher.run(cmd_rx, blocks));

    Ok((WatcherHandle { cmd_tx }, task))
}

struct Dispatcher {
    notifier: Arc<dyn ChainNotifier>,
    handler: Arc<dyn EventHandler>,
    shutdown: watch::Receiver<bool>,
    best_height: Option<u32>,
    expiry_heights: BTreeMap<u32, Vec<PublicKey>>,
    expiry_by_key: HashMap<PublicKey, u32>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<WatchCmd>,
        mut blocks: mpsc::Receiver<u32>,
    ) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    log::info!("watcher: shutting down");
                    return;
                }

                Some(cmd) = cmd_rx.recv() => {
                    self.handle_cmd(cmd, &event_tx).await;
                }

                Some(event) = event_rx.recv() => {
                    self.dispatch(event).await;
                }

                maybe_height = blocks.recv() => {
                    match maybe_height {
                        Some(height) => self.handle_block(height).await,
                        None => {
                            log::info!("watcher: block epoch stream closed");
                            return;
                        }
                    }
                }

                else => return,
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: WatchCmd, event_tx: &mpsc::UnboundedSender<ChainEvent>) {
        match cmd {
            WatchCmd::Conf {
                trader_key,
                txid,
                script,
                num_confs,
                height_hint,
                reply,
            } => {
                let result = self
                    .notifier
                    .register_conf(txid, script, num_confs, height_hint)
                    .await;
                match result {
                    Ok(conf_rx) => {
                        self.forward(event_tx.clone(), async move {
                            conf_rx
                                .await
                                .ok()
                                .map(|conf| ChainEvent::Conf { trader_key, conf })
                        });
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            WatchCmd::Spend {
                trader_key,
                outpoint,
                script,
                height_hint,
                reply,
            } => {
                let result = self
                    .notifier
                    .register_spend(outpoint, script, height_hint)
                    .await;
                match result {
                    Ok(spend_rx) => {
                        self.forward(event_tx.clone(), async move {
                            spend_rx
                                .await
                                .ok()
                                .map(|spend| ChainEvent::Spend { trader_key, spend })
                        });
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            WatchCmd::Expiry {
                trader_key,
                expiry_height,
                reply,
            } => {
                self.register_expiry(trader_key, expiry_height).await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Runs a notifier future on its own task, feeding its event (if any)
    /// into the dispatcher's event channel. The task dies with the shutdown
    /// signal, dropping the pending registration.
    fn forward<F>(&self, event_tx: mpsc::UnboundedSender<ChainEvent>, fut: F)
    where
        F: std::future::Future<Output = Option<ChainEvent>> + Send + 'static,
    {
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                maybe_event = fut => {
                    if let Some(event) = maybe_event {
                        let _ = event_tx.send(event);
                    }
                }
                _ = shutdown.changed() => {}
            }
        });
    }

    async fn register_expiry(&mut self, trader_key: PublicKey, expiry_height: u32) {
        // Replace any earlier registration for this account.
        if let Some(old_height) = self.expiry_by_key.remove(&trader_key) {
            if let Some(keys) = self.expiry_heights.get_mut(&old_height) {
                keys.retain(|key| key != &trader_key);
            }
        }

        if self.best_height.is_some_and(|best| best >= expiry_height) {
            self.fire_expiry(trader_key).await;
            return;
        }

        self.expiry_heights
            .entry(expiry_height)
            .or_default()
            .push(trader_key);
        self.expiry_by_key.insert(trader_key, expiry_height);
    }

    async fn handle_block(&mut self, height: u32) {
        if self.best_height.is_some_and(|best| best >= height) {
            return;
        }
        self.best_height = Some(height);

        let due: Vec<u32> = self
            .expiry_heights
            .range(..=height)
            .map(|(expiry, _)| *expiry)
            .collect();
        for expiry in due {
            for trader_key in self.expiry_heights.remove(&expiry).unwrap_or_default() {
                self.expiry_by_key.remove(&trader_key);
                self.fire_expiry(trader_key).await;
            }
        }
    }

    async fn fire_expiry(&self, trader_key: PublicKey) {
        if let Err(e) = self.handler.handle_account_expiry(trader_key).await {
            log::error!(
                "watcher: expiry handler failed for account {}: {e}",
                hex::encode(trader_key.serialize()),
            );
        }
    }

    async fn dispatch(&self, event: ChainEvent) {
        let result = match event {
            ChainEvent::Conf { trader_key, conf } => {
                self.handler.handle_account_conf(trader_key, conf).await
            }
            ChainEvent::Spend { trader_key, spend } => {
                self.handler.handle_account_spend(trader_key, spend).await
            }
        };
        if let Err(e) = result {
            log::error!("watcher: event handler failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MockChainNotifier};
    use bitcoin::hashes::Hash;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandler {
        confs: Mutex<Vec<(PublicKey, u32)>>,
        spends: Mutex<Vec<PublicKey>>,
        expiries: Mutex<Vec<PublicKey>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_account_conf(
            &self,
            trader_key: PublicKey,
            conf: TxConfirmation,
        ) -> Result<()> {
            self.confs
                .lock()
                .unwrap()
                .push((trader_key, conf.block_height));
            Ok(())
        }

        async fn handle_account_spend(
            &self,
            trader_key: PublicKey,
            _spend: SpendDetail,
        ) -> Result<()> {
            self.spends.lock().unwrap().push(trader_key);
            Ok(())
        }

        async fn handle_account_expiry(&self, trader_key: PublicKey) -> Result<()> {
            self.expiries.lock().unwrap().push(trader_key);
            Ok(())
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn expiry_fires_when_tip_reaches_height() {
        let notifier = Arc::new(MockChainNotifier::new());
        let handler = Arc::new(RecordingHandler::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) =
            spawn(notifier.clone(), handler.clone(), shutdown_rx).await.unwrap();

        let key = testing::test_key_descriptor(1).pubkey;
        handle.watch_account_expiration(key, 100).await.unwrap();
        assert!(handler.expiries.lock().unwrap().is_empty());

        notifier.push_block(99).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handler.expiries.lock().unwrap().is_empty());

        notifier.push_block(100).await;
        wait_until(|| !handler.expiries.lock().unwrap().is_empty()).await;
        assert_eq!(handler.expiries.lock().unwrap().as_slice(), &[key]);
    }

    #[tokio::test]
    async fn expiry_fires_immediately_for_past_height() {
        let notifier = Arc::new(MockChainNotifier::new());
        let handler = Arc::new(RecordingHandler::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) =
            spawn(notifier.clone(), handler.clone(), shutdown_rx).await.unwrap();

        notifier.push_block(500).await;
        // Let the dispatcher observe the tip first.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let key = testing::test_key_descriptor(2).pubkey;
        handle.watch_account_expiration(key, 400).await.unwrap();
        wait_until(|| !handler.expiries.lock().unwrap().is_empty()).await;
    }

    #[tokio::test]
    async fn conf_event_reaches_handler() {
        let notifier = Arc::new(MockChainNotifier::new());
        let handler = Arc::new(RecordingHandler::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) =
            spawn(notifier.clone(), handler.clone(), shutdown_rx).await.unwrap();

        let key = testing::test_key_descriptor(3).pubkey;
        let txid = Txid::all_zeros();
        handle
            .watch_account_conf(key, txid, ScriptBuf::new(), 3, 0)
            .await
            .unwrap();

        notifier.confirm(
            txid,
            TxConfirmation {
                block_height: 123,
                tx: testing::dummy_tx(),
            },
        );
        wait_until(|| !handler.confs.lock().unwrap().is_empty()).await;
        assert_eq!(handler.confs.lock().unwrap().as_slice(), &[(key, 123)]);
    }

    #[tokio::test]
    async fn shutdown_stops_dispatcher() {
        let notifier = Arc::new(MockChainNotifier::new());
        let handler = Arc::new(RecordingHandler::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) =
            spawn(notifier.clone(), handler.clone(), shutdown_rx).await.unwrap();

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let key = testing::test_key_descriptor(4).pubkey;
        let result = handle.watch_account_expiration(key, 100).await;
        assert!(matches!(result, Err(Error::WatcherShutdown)));
    }
}
