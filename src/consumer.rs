//! Consumer group client: poll on an interval, dispatch in order, commit per record.
//!
//! The client moves through `Created -> Subscribed -> Polling <-> Dispatching
//! -> Closed`. Each poll returns a batch that is dispatched one record at a
//! time to the registered [`RecordHandler`]; the record's offset is committed
//! once the handler returns successfully. Handler and decode failures are
//! logged, reported on the failure channel and never stop the loop.

use crate::broker::{Batch, ConsumedRecord, ConsumerTransport, PollRequest};
use crate::codec::{self, PriceUpdate};
use crate::config::ConsumerGroupConfig;
use crate::error::TransportError;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Subscribed,
    Polling,
    Dispatching,
    Closed,
}

/// A decoded record handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// Sequence number of the poll that returned this record.
    pub batch: u64,
    pub event: PriceUpdate,
}

/// Processes one record. Failures are the handler's own business; the
/// client reports them and moves on.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> RecordHandler for F
where
    F: Fn(&Delivery) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self(delivery)
    }
}

/// A record that could not be processed.
#[derive(Debug)]
pub struct DispatchFailure {
    pub group_id: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// [`Error::Decode`] or [`Error::Handler`].
    pub error: Error,
}

/// Stops a running poll loop from anywhere.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One member of a consumer group with an exclusively owned transport session.
pub struct ConsumerGroupClient<T: ConsumerTransport> {
    config: ConsumerGroupConfig,
    transport: T,
    topics: BTreeSet<String>,
    handler: Option<Arc<dyn RecordHandler>>,
    shutdown: CancellationToken,
    state: watch::Sender<ClientState>,
    failures_tx: mpsc::UnboundedSender<DispatchFailure>,
    failures_rx: Option<mpsc::UnboundedReceiver<DispatchFailure>>,
    polls: u64,
}

impl<T: ConsumerTransport + 'static> ConsumerGroupClient<T> {
    pub fn new(config: ConsumerGroupConfig, transport: T) -> Result<Self> {
        config.validate()?;

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ClientState::Created);

        info!(group_id = %config.group_id, servers = ?config.bootstrap_servers, "Consumer group client created");

        Ok(Self {
            config,
            transport,
            topics: BTreeSet::new(),
            handler: None,
            shutdown: CancellationToken::new(),
            state,
            failures_tx,
            failures_rx: Some(failures_rx),
            polls: 0,
        })
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// The failure channel. Can be taken once.
    pub fn take_failures(&mut self) -> Option<mpsc::UnboundedReceiver<DispatchFailure>> {
        self.failures_rx.take()
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    /// Joins the group for `topics` and registers the handler.
    #[instrument(skip_all, fields(group_id = %self.config.group_id))]
    pub async fn subscribe<H>(
        &mut self,
        topics: impl IntoIterator<Item = impl Into<String>>,
        handler: H,
    ) -> Result<()>
    where
        H: RecordHandler + 'static,
    {
        match self.state() {
            ClientState::Closed => return Err(Error::Closed),
            ClientState::Created => {}
            _ => return Err(Error::AlreadySubscribed(self.config.group_id.clone())),
        }

        let topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(Error::Config("subscription needs at least one topic".to_string()));
        }

        if let Err(e) = self.transport.subscribe(&self.config.group_id, &topics).await {
            error!(error = %e, "Failed to join consumer group");
            self.release().await;
            return Err(Error::Connection(e.to_string()));
        }

        info!(?topics, "Subscribed");
        self.topics = topics;
        self.handler = Some(Arc::new(handler));
        self.set_state(ClientState::Subscribed);
        Ok(())
    }

    /// Polls and dispatches until [`ShutdownHandle::close`] or a lost broker
    /// session. Any other poll failure is logged and retried on the next
    /// tick. The transport is released before returning.
    #[instrument(skip_all, fields(group_id = %self.config.group_id))]
    pub async fn run(&mut self) -> Result<()> {
        let handler = match (self.state(), &self.handler) {
            (ClientState::Closed, _) => return Err(Error::Closed),
            (_, Some(handler)) => handler.clone(),
            (_, None) => return Err(Error::NotSubscribed(self.config.group_id.clone())),
        };

        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.poll_interval(), "Starting poll loop");

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                _ = ticker.tick() => {}
            }

            self.set_state(ClientState::Polling);
            let request = PollRequest {
                group_id: self.config.group_id.clone(),
                topics: self.topics.clone(),
                timeout: self.config.poll_timeout(),
                max_records: self.config.max_batch_size,
            };

            let batch = match self.transport.poll(&request).await {
                Ok(response) => response.batch,
                Err(TransportError::Unreachable(message)) => {
                    error!(error = %message, "Broker session lost, closing consumer");
                    break Err(Error::Connection(message));
                }
                Err(e) => {
                    warn!(error = %e, transient = e.is_transient(), "Poll failed, retrying next cycle");
                    continue;
                }
            };

            self.polls += 1;
            if batch.is_empty() {
                continue;
            }

            self.set_state(ClientState::Dispatching);
            if let Err(e) = self.dispatch(batch, handler.as_ref()).await {
                break Err(e);
            }
            self.set_state(ClientState::Polling);
        };

        self.release().await;
        info!("Poll loop stopped");
        result
    }

    /// Runs the poll loop on its own task.
    pub fn spawn(mut self) -> RunningConsumer {
        let shutdown = self.shutdown_handle();
        let state = self.watch_state();
        let failures = self.take_failures();
        let task = tokio::spawn(async move { self.run().await });

        RunningConsumer {
            shutdown,
            state,
            failures,
            task: Some(task),
        }
    }

    /// Stops polling and releases the transport. Safe to call more than once.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        self.release().await;
    }

    async fn release(&mut self) {
        if self.state() == ClientState::Closed {
            return;
        }
        self.shutdown.cancel();
        self.transport.close().await;
        self.set_state(ClientState::Closed);
        info!(group_id = %self.config.group_id, "Consumer group client closed");
    }

    async fn dispatch(&mut self, batch: Batch, handler: &dyn RecordHandler) -> Result<()> {
        debug!(records = batch.len(), batch = self.polls, "Dispatching batch");

        for record in batch {
            let event = match codec::decode(&record.payload) {
                Ok(event) => event,
                Err(e) => {
                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Skipping undecodable record"
                    );
                    self.report(&record, Error::Decode(e));
                    self.commit(&record).await?;
                    continue;
                }
            };

            let delivery = Delivery {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                key: record.key.clone(),
                batch: self.polls,
                event,
            };

            match handler.handle(&delivery).await {
                Ok(()) => self.commit(&record).await?,
                Err(e) => {
                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Handler failed"
                    );
                    let error = Error::Handler {
                        topic: record.topic.clone(),
                        partition: record.partition,
                        offset: record.offset,
                        message: format!("{:#}", e),
                    };
                    self.report(&record, error);
                }
            }
        }

        Ok(())
    }

    /// Commits `offset + 1`. Only a lost session is fatal.
    async fn commit(&mut self, record: &ConsumedRecord) -> Result<()> {
        match self
            .transport
            .commit(&record.topic, record.partition, record.offset + 1)
            .await
        {
            Ok(()) => Ok(()),
            Err(TransportError::Unreachable(message)) => Err(Error::Connection(message)),
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Commit failed, record may be redelivered"
                );
                Ok(())
            }
        }
    }

    fn report(&self, record: &ConsumedRecord, error: Error) {
        let failure = DispatchFailure {
            group_id: self.config.group_id.clone(),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            error,
        };
        // Nobody listening is fine; the failure was already logged.
        let _ = self.failures_tx.send(failure);
    }
}

/// A consumer whose poll loop runs on its own task.
pub struct RunningConsumer {
    shutdown: ShutdownHandle,
    state: watch::Receiver<ClientState>,
    failures: Option<mpsc::UnboundedReceiver<DispatchFailure>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl RunningConsumer {
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn take_failures(&mut self) -> Option<mpsc::UnboundedReceiver<DispatchFailure>> {
        self.failures.take()
    }

    /// Whether the loop has exited on its own (fatal error).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals shutdown and waits for the loop to release its session.
    ///
    /// The first call returns the loop's outcome; later calls return `Ok(())`.
    pub async fn close(&mut self) -> Result<()> {
        self.shutdown.close();

        let Some(task) = self.task.take() else {
            return Ok(());
        };

        match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Connection(format!("consumer task failed: {}", e))),
        }
    }
}
