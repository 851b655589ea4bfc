// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The broadcast channel: one actor task per live stream, serializing
//! publish, connect, disconnect and stop through a single command queue so
//! no state inside a channel is ever touched from two tasks at once.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use webmcast_core::error::{EngineError, Result};

use crate::bitrate::BitrateEstimator;
use crate::queue::{PushOutcome, SubscriberQueue};
use crate::rewriter::{PublisherRewriter, SubscriberRewriter};

/// Command-queue depth. Small on purpose: publish and connect/disconnect
/// are rare relative to the video data they gate, so a deep queue would
/// only mask a stuck actor instead of surfacing backpressure quickly.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

enum ChannelCommand {
    Publish {
        chunk: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    PublisherEnded,
    PublisherReclaimed {
        reply: oneshot::Sender<()>,
    },
    Connect {
        queue: Arc<SubscriberQueue>,
        reply: oneshot::Sender<SlotId>,
    },
    Disconnect(SlotId),
    Stop,
}

struct Slot {
    queue: Arc<SubscriberQueue>,
    rewriter: SubscriberRewriter,
}

struct ChannelActor {
    name: Arc<str>,
    rx: mpsc::Receiver<ChannelCommand>,
    rewriter: PublisherRewriter,
    slots: HashMap<SlotId, Slot>,
    next_slot_id: u64,
    bitrate: BitrateEstimator,
}

impl ChannelActor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                ChannelCommand::Publish { chunk, reply } => {
                    let result = self.handle_publish(chunk);
                    let _ = reply.send(result);
                }
                ChannelCommand::PublisherEnded => self.handle_publisher_ended(),
                ChannelCommand::PublisherReclaimed { reply } => {
                    self.rewriter.reset_for_reclaim();
                    let _ = reply.send(());
                }
                ChannelCommand::Connect { queue, reply } => {
                    let id = self.handle_connect(queue);
                    let _ = reply.send(id);
                }
                ChannelCommand::Disconnect(id) => {
                    self.slots.remove(&id);
                }
                ChannelCommand::Stop => {
                    self.close_all();
                    return;
                }
            }
        }
        self.close_all();
    }

    fn handle_publish(&mut self, chunk: Bytes) -> Result<()> {
        self.bitrate.record(chunk.len());
        let clusters = self.rewriter.feed(&chunk)?;
        tracing::debug!(
            stream = %self.name,
            bytes_per_second = self.bitrate.bytes_per_second(),
            "publisher chunk accepted"
        );
        self.deliver_pending_headers();
        for record in &clusters {
            self.distribute(record);
        }
        Ok(())
    }

    /// Retries header delivery for any slot that joined before the header
    /// blob was frozen (a subscriber connecting ahead of its publisher).
    fn deliver_pending_headers(&mut self) {
        let Some(header) = self.rewriter.header_blob().cloned() else {
            return;
        };
        let mut dead = Vec::new();
        for (id, slot) in &mut self.slots {
            let Some(bytes) = slot.rewriter.on_attach(Some(&header)) else {
                continue;
            };
            if slot.queue.push(bytes, true) == PushOutcome::Closed {
                dead.push(*id);
            }
        }
        for id in dead {
            self.slots.remove(&id);
        }
    }

    fn handle_publisher_ended(&mut self) {
        match self.rewriter.finish() {
            Ok(clusters) => {
                for record in &clusters {
                    self.distribute(record);
                }
            }
            Err(err) => {
                tracing::warn!(stream = %self.name, error = %err, "error flushing trailing cluster");
            }
        }
    }

    fn handle_connect(&mut self, queue: Arc<SubscriberQueue>) -> SlotId {
        let id = SlotId(self.next_slot_id);
        self.next_slot_id += 1;

        let mut rewriter = SubscriberRewriter::new();
        if let Some(header) = rewriter.on_attach(self.rewriter.header_blob()) {
            if queue.push(header, true) == PushOutcome::Closed {
                return id;
            }
        }
        self.slots.insert(id, Slot { queue, rewriter });
        id
    }

    fn distribute(&mut self, record: &crate::rewriter::ClusterRecord) {
        let mut dead = Vec::new();
        for (id, slot) in &mut self.slots {
            let Some(bytes) = slot.rewriter.on_cluster(record) else {
                continue;
            };
            match slot.queue.push(bytes, record.is_keyframe) {
                PushOutcome::Dropped => slot.rewriter.reset_to_wait_keyframe(),
                PushOutcome::Closed => dead.push(*id),
                PushOutcome::Accepted => {}
            }
        }
        for id in dead {
            self.slots.remove(&id);
        }
    }

    fn close_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.queue.close();
        }
    }
}

/// A strong handle to a live channel. Holding one keeps the actor task
/// alive; the stream registry only ever holds the weak counterpart
/// ([`WeakChannelHandle`]), so a channel with no publisher, no
/// subscribers and no armed grace timer is dropped automatically.
#[derive(Clone)]
pub struct ChannelHandle {
    name: Arc<str>,
    tx: mpsc::Sender<ChannelCommand>,
}

#[derive(Clone)]
pub struct WeakChannelHandle {
    name: Arc<str>,
    tx: mpsc::WeakSender<ChannelCommand>,
}

impl ChannelHandle {
    /// Spawns a new channel actor and returns a strong handle to it.
    pub fn spawn(name: impl Into<Arc<str>>, max_element_size: u64) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = ChannelActor {
            name: name.clone(),
            rx,
            rewriter: PublisherRewriter::new(max_element_size),
            slots: HashMap::new(),
            next_slot_id: 0,
            bitrate: BitrateEstimator::new(),
        };
        tokio::spawn(actor.run());
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downgrade(&self) -> WeakChannelHandle {
        WeakChannelHandle {
            name: self.name.clone(),
            tx: self.tx.downgrade(),
        }
    }

    /// Feeds one chunk of publisher bytes into the channel. Resolves to
    /// `Err(EngineError::MalformedEbml(_))` the moment the publisher's
    /// stream can no longer be parsed; the caller should stop reading the
    /// request body and respond immediately.
    pub async fn publish(&self, chunk: Bytes) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ChannelCommand::Publish {
                chunk,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::NotLive(self.name.to_string()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::NotLive(self.name.to_string()))?
    }

    /// Resets the channel's publisher-side state for a new publisher that
    /// just reclaimed this name from the registry during the grace period.
    /// The frozen header blob and existing slots are preserved; the new
    /// publisher's own re-sent init segment is discarded in favor of it.
    pub async fn reclaim(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ChannelCommand::PublisherReclaimed { reply: reply_tx })
            .await
            .map_err(|_| EngineError::NotLive(self.name.to_string()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::NotLive(self.name.to_string()))
    }

    /// Registers a new subscriber queue with the channel, returning its
    /// slot id. The queue immediately receives the header blob if one is
    /// already frozen.
    pub async fn connect(&self, queue: Arc<SubscriberQueue>) -> Result<SlotId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ChannelCommand::Connect {
                queue,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::NotLive(self.name.to_string()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::NotLive(self.name.to_string()))
    }

    pub fn disconnect(&self, slot: SlotId) {
        let _ = self.tx.try_send(ChannelCommand::Disconnect(slot));
    }

    /// Tells the channel the publisher's request body ended, so its final
    /// (often still-open) Cluster gets flushed to subscribers.
    pub fn publisher_ended(&self) {
        let _ = self.tx.try_send(ChannelCommand::PublisherEnded);
    }

    /// Stops the actor and closes every subscriber queue. Called by the
    /// registry once a stream's grace period expires unclaimed.
    pub fn stop(&self) {
        let _ = self.tx.try_send(ChannelCommand::Stop);
    }
}

impl WeakChannelHandle {
    pub fn upgrade(&self) -> Option<ChannelHandle> {
        self.tx.upgrade().map(|tx| ChannelHandle {
            name: self.name.clone(),
            tx,
        })
    }
}
