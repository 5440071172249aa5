//! Task that owns one [`SyncEngine`] and drives its timers.
//!
//! The UI never touches the engine directly: it sends commands through a
//! [`SessionHandle`] and watches [`ThreadSnapshot`]s. Push events, the reorder
//! timer, ack deadlines, outbox ticks and reconnects all run in one select loop,
//! so engine state is only ever mutated from this task.

use chrono::Utc;
use event_schema::PushEvent;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::model::ThreadSnapshot;
use crate::transport::{PushChannel, PushSubscription};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Send {
        body: String,
        reply: oneshot::Sender<SyncResult<Uuid>>,
    },
    Retry {
        client_msg_id: Uuid,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    LoadOlder {
        reply: oneshot::Sender<SyncResult<usize>>,
    },
    MarkRead {
        reply: oneshot::Sender<SyncResult<bool>>,
    },
    SetOnline(bool),
    Typing(bool),
    Close {
        reply: oneshot::Sender<SyncResult<()>>,
    },
}

/// Cloneable front for one open conversation
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<ThreadSnapshot>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> Command,
    ) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    pub async fn send(&self, body: impl Into<String>) -> SyncResult<Uuid> {
        let body = body.into();
        self.request(|reply| Command::Send { body, reply }).await
    }

    pub async fn retry(&self, client_msg_id: Uuid) -> SyncResult<()> {
        self.request(|reply| Command::Retry {
            client_msg_id,
            reply,
        })
        .await
    }

    pub async fn load_older(&self) -> SyncResult<usize> {
        self.request(|reply| Command::LoadOlder { reply }).await
    }

    pub async fn mark_read(&self) -> SyncResult<bool> {
        self.request(|reply| Command::MarkRead { reply }).await
    }

    pub async fn set_online(&self, online: bool) -> SyncResult<()> {
        self.commands
            .send(Command::SetOnline(online))
            .await
            .map_err(|_| SyncError::Closed)
    }

    pub async fn set_typing(&self, typing: bool) -> SyncResult<()> {
        self.commands
            .send(Command::Typing(typing))
            .await
            .map_err(|_| SyncError::Closed)
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait for the next snapshot change
    pub async fn changed(&mut self) -> SyncResult<ThreadSnapshot> {
        self.snapshot.changed().await.map_err(|_| SyncError::Closed)?;
        Ok(self.snapshot.borrow_and_update().clone())
    }

    /// Close the view. Unsent messages keep flushing in the background and the
    /// session task ends once the outbox is empty.
    pub async fn close(&self) -> SyncResult<()> {
        self.request(|reply| Command::Close { reply }).await
    }
}

/// Start the session task. Without a push channel the engine works over the
/// request/response transport alone.
pub fn spawn_session(
    engine: SyncEngine,
    push: Option<Arc<dyn PushChannel>>,
    config: &SyncConfig,
) -> (SessionHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot());
    let task = tokio::spawn(run(engine, push, config.clone(), commands_rx, snapshot_tx));
    (
        SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        },
        task,
    )
}

async fn next_event(subscription: &mut Option<PushSubscription>) -> Option<PushEvent> {
    match subscription {
        Some(sub) => sub.events.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

fn log_err<T>(what: &str, result: SyncResult<T>) {
    if let Err(e) = result {
        warn!(error = %e, "{what} failed");
    }
}

async fn run(
    mut engine: SyncEngine,
    push: Option<Arc<dyn PushChannel>>,
    config: SyncConfig,
    mut commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<ThreadSnapshot>,
) {
    let thread_id = engine.thread_id();
    log_err("bootstrap", engine.bootstrap().await);
    let _ = snapshot.send(engine.snapshot());

    let mut subscription: Option<PushSubscription> = None;
    let mut reconnect_failures = 0u32;
    let mut reconnect_at = push.as_ref().map(|_| Instant::now());
    let mut outbox_tick = interval(config.outbox_tick);
    outbox_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let reorder_deadline = engine.next_reorder_deadline();
        let ack_deadline = engine.next_ack_deadline();
        let may_connect = subscription.is_none() && engine.is_online();

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Close { reply }) => {
                    if let Some(sub) = subscription.take() {
                        sub.unsubscribe();
                    }
                    let _ = reply.send(engine.close().await);
                    break;
                }
                None => {
                    if let Some(sub) = subscription.take() {
                        sub.unsubscribe();
                    }
                    log_err("close", engine.close().await);
                    break;
                }
                Some(Command::Send { body, reply }) => {
                    let _ = reply.send(engine.send(body).await);
                }
                Some(Command::Retry { client_msg_id, reply }) => {
                    let _ = reply.send(engine.retry(client_msg_id).await);
                }
                Some(Command::LoadOlder { reply }) => {
                    let _ = reply.send(engine.load_older().await);
                }
                Some(Command::MarkRead { reply }) => {
                    let _ = reply.send(engine.mark_read().await);
                }
                Some(Command::Typing(typing)) => engine.set_typing(typing),
                Some(Command::SetOnline(online)) => {
                    if !online {
                        if let Some(sub) = subscription.take() {
                            sub.unsubscribe();
                            log_err("disconnect", engine.on_push_disconnected().await);
                        }
                    }
                    log_err("connectivity change", engine.set_online(online).await);
                    if online && push.is_some() {
                        reconnect_failures = 0;
                        reconnect_at = Some(Instant::now());
                    }
                }
            },

            event = next_event(&mut subscription) => match event {
                Some(event) => {
                    log_err("push event", engine.handle_push(event, Instant::now()).await);
                }
                None => {
                    subscription = None;
                    info!(%thread_id, "push channel lost");
                    log_err("disconnect", engine.on_push_disconnected().await);
                    reconnect_failures = reconnect_failures.saturating_add(1);
                    let delay = config.reconnect_backoff.delay_for(reconnect_failures);
                    reconnect_at = Some(Instant::now() + delay);
                }
            },

            _ = sleep_until_opt(reorder_deadline) => {
                log_err("reorder flush", engine.flush_reorder(Instant::now()).await);
            }

            _ = sleep_until_opt(ack_deadline) => {
                log_err("ack timeout check", engine.check_ack_timeouts(Instant::now()).await);
            }

            _ = sleep_until_opt(reconnect_at), if may_connect => {
                reconnect_at = None;
                if let Some(channel) = &push {
                    match channel.subscribe(thread_id).await {
                        Ok(sub) => {
                            reconnect_failures = 0;
                            let sender = sub.sender.clone();
                            subscription = Some(sub);
                            log_err("reconnect catch-up", engine.on_push_connected(sender).await);
                        }
                        Err(e) => {
                            reconnect_failures = reconnect_failures.saturating_add(1);
                            let delay = config.reconnect_backoff.delay_for(reconnect_failures);
                            warn!(%thread_id, error = %e, ?delay, "push connect failed");
                            reconnect_at = Some(Instant::now() + delay);
                        }
                    }
                }
            }

            _ = outbox_tick.tick() => {
                log_err("outbox flush", engine.flush_outbox(Utc::now()).await);
            }
        }

        let _ = snapshot.send(engine.snapshot());
    }

    let _ = snapshot.send(engine.snapshot());
    drain_outbox(engine, commands, outbox_tick, snapshot).await;
}

/// The view is gone but its unsent messages are not: keep flushing until the
/// outbox is empty. Going online retries everything at once; every other
/// command is answered with [`SyncError::Closed`].
async fn drain_outbox(
    mut engine: SyncEngine,
    mut commands: mpsc::Receiver<Command>,
    mut outbox_tick: Interval,
    snapshot: watch::Sender<ThreadSnapshot>,
) {
    let thread_id = engine.thread_id();
    let mut commands_open = true;
    if engine.outbox_len() == 0 {
        return;
    }
    info!(%thread_id, pending = engine.outbox_len(), "flushing outbox after close");

    while engine.outbox_len() > 0 {
        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(Command::SetOnline(true)) => {
                    log_err("outbox flush", engine.flush_closed(Utc::now(), true).await);
                }
                Some(command) => reject_closed(command),
                None => commands_open = false,
            },

            _ = outbox_tick.tick() => {
                log_err("outbox flush", engine.flush_closed(Utc::now(), false).await);
            }
        }

        let _ = snapshot.send(engine.snapshot());
    }

    info!(%thread_id, "outbox drained");
}

fn reject_closed(command: Command) {
    match command {
        Command::Send { reply, .. } => {
            let _ = reply.send(Err(SyncError::Closed));
        }
        Command::Retry { reply, .. } | Command::Close { reply } => {
            let _ = reply.send(Err(SyncError::Closed));
        }
        Command::LoadOlder { reply } => {
            let _ = reply.send(Err(SyncError::Closed));
        }
        Command::MarkRead { reply } => {
            let _ = reply.send(Err(SyncError::Closed));
        }
        Command::SetOnline(_) | Command::Typing(_) => {}
    }
}
