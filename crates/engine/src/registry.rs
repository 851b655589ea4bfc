// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The stream registry: maps stream names to live channels, and arms a
//! grace-period timer when a publisher disconnects so a brief reconnect
//! (a dropped TCP connection, a client retry) doesn't force every
//! subscriber to re-join.
//!
//! A registry entry holds only a [`WeakChannelHandle`]; the channel itself
//! is kept alive by its publisher's and subscribers' strong handles, and
//! by the detached grace-period task while one is armed. A name is only
//! ever "taken" while a channel is live with no grace timer armed --
//! claiming during the grace period cancels the timer and hands back the
//! same channel instead of creating a new one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use webmcast_core::error::{EngineError, Result};

use crate::channel::{ChannelHandle, WeakChannelHandle};

pub struct RegistryConfig {
    pub max_downtime: Duration,
    pub max_enqueued_frames: usize,
    pub max_element_size: u64,
}

struct Entry {
    channel: WeakChannelHandle,
    /// `Some` while a grace-period timer is armed (the publisher has
    /// disconnected but the name hasn't timed out yet).
    grace: Option<CancellationToken>,
}

pub enum ClaimOutcome {
    /// No entry existed for this name; a fresh channel was created.
    Created(ChannelHandle),
    /// An entry existed with an armed grace timer; it was cancelled and
    /// its channel handed back.
    Reclaimed(ChannelHandle),
}

pub struct Registry {
    streams: Mutex<HashMap<String, Entry>>,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn max_enqueued_frames(&self) -> usize {
        self.config.max_enqueued_frames
    }

    pub fn max_element_size(&self) -> u64 {
        self.config.max_element_size
    }

    /// Claims `name` for a new publisher. Fails with
    /// [`EngineError::NameTaken`] if the name is live with no grace timer
    /// armed.
    pub fn claim(&self, name: &str) -> Result<ClaimOutcome> {
        let mut streams = self.streams.lock().expect("registry mutex poisoned");

        if let Some(entry) = streams.get_mut(name) {
            let Some(grace) = entry.grace.take() else {
                return Err(EngineError::NameTaken(name.to_string()));
            };
            grace.cancel();
            if let Some(handle) = entry.channel.upgrade() {
                return Ok(ClaimOutcome::Reclaimed(handle));
            }
            // The grace timer fired concurrently and the channel is already
            // gone; fall through and mint a fresh one under the same name.
        }

        let handle = ChannelHandle::spawn(name.to_string(), self.config.max_element_size);
        streams.insert(
            name.to_string(),
            Entry {
                channel: handle.downgrade(),
                grace: None,
            },
        );
        Ok(ClaimOutcome::Created(handle))
    }

    /// Looks up a live channel by name for a subscriber. Returns `None`
    /// for an unknown name or one whose channel has already gone away.
    pub fn lookup(&self, name: &str) -> Option<ChannelHandle> {
        let streams = self.streams.lock().expect("registry mutex poisoned");
        streams.get(name).and_then(|entry| entry.channel.upgrade())
    }

    /// Called once a publisher's request body ends, successfully or not.
    /// Arms a grace-period timer that stops the channel and drops the
    /// registry entry if nobody reclaims the name in time.
    pub fn release(self: &Arc<Self>, name: String, channel: ChannelHandle) {
        let token = CancellationToken::new();
        {
            let mut streams = self.streams.lock().expect("registry mutex poisoned");
            if let Some(entry) = streams.get_mut(&name) {
                entry.grace = Some(token.clone());
            }
        }

        let registry = Arc::clone(self);
        let max_downtime = self.config.max_downtime;
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(max_downtime) => {
                    channel.stop();
                    registry.remove_if_still_unclaimed(&name);
                }
            }
        });
    }

    fn remove_if_still_unclaimed(&self, name: &str) {
        let mut streams = self.streams.lock().expect("registry mutex poisoned");
        if streams.get(name).is_some_and(|entry| entry.grace.is_some()) {
            streams.remove(name);
        }
    }

    /// Stops every live channel. Called once at process shutdown so
    /// in-flight publishers and subscribers all observe a clean
    /// end-of-stream instead of a dropped connection.
    pub fn shutdown_all(&self) {
        let streams = self.streams.lock().expect("registry mutex poisoned");
        for entry in streams.values() {
            if let Some(channel) = entry.channel.upgrade() {
                channel.stop();
            }
        }
    }
}
