//! Gateway: the main event loop connecting channels to the scheduling engine.
//!
//! Runs startup recovery, the horizon sweeper and the HTTP API in the
//! background and routes every inbound message or button press.

mod callbacks;
mod pipeline;

use crate::engine::Engine;
use nudge_core::{
    auth::AuthKeys,
    config::{ApiConfig, SchedulerConfig},
    message::{Inbound, OutgoingMessage},
    traits::Channel,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The central gateway that routes channel traffic into the engine.
pub struct Gateway {
    pub(super) engine: Arc<Engine>,
    pub(super) channels: HashMap<String, Arc<dyn Channel>>,
    pub(super) scheduler_config: SchedulerConfig,
    pub(super) api_config: ApiConfig,
    pub(super) auth_keys: AuthKeys,
    pub(super) uptime: Instant,
}

impl Gateway {
    /// Create a new gateway.
    pub fn new(
        engine: Arc<Engine>,
        channels: HashMap<String, Arc<dyn Channel>>,
        scheduler_config: SchedulerConfig,
        api_config: ApiConfig,
        auth_keys: AuthKeys,
    ) -> Self {
        Self {
            engine,
            channels,
            scheduler_config,
            api_config,
            auth_keys,
            uptime: Instant::now(),
        }
    }

    /// Run the main event loop until Ctrl-C.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(
            "Nudge gateway running | channels: {} | scheduler: {} | api: {}",
            self.channels.keys().cloned().collect::<Vec<_>>().join(", "),
            if self.scheduler_config.enabled {
                "enabled"
            } else {
                "disabled"
            },
            if self.api_config.enabled {
                "enabled"
            } else {
                "disabled"
            },
        );

        let (tx, mut rx) = mpsc::channel::<Inbound>(256);

        for (name, channel) in &self.channels {
            let mut channel_rx = channel
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("failed to start channel {name}: {e}"))?;
            let tx = tx.clone();
            let channel_name = name.clone();

            tokio::spawn(async move {
                while let Some(inbound) = channel_rx.recv().await {
                    if tx.send(inbound).await.is_err() {
                        info!("gateway receiver dropped, stopping {channel_name} forwarder");
                        break;
                    }
                }
            });

            info!("Channel started: {name}");
        }

        drop(tx);

        // Re-arm timers from durable state, then start sweeping.
        let sched_handle = if self.scheduler_config.enabled {
            if let Err(e) = self.engine.recover().await {
                error!("recovery failed: {e}");
            }
            let engine = self.engine.clone();
            Some(tokio::spawn(async move {
                engine.run_sweeper().await;
            }))
        } else {
            None
        };

        let api_handle = if self.api_config.enabled {
            let api_cfg = self.api_config.clone();
            let state = crate::api::ApiState::new(
                self.engine.clone(),
                self.auth_keys.clone(),
                self.uptime,
            );
            Some(tokio::spawn(async move {
                crate::api::serve(api_cfg, state).await;
            }))
        } else {
            None
        };

        // Main event loop with graceful shutdown.
        loop {
            tokio::select! {
                Some(inbound) = rx.recv() => {
                    let gw = self.clone();
                    tokio::spawn(async move {
                        gw.dispatch(inbound).await;
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown(&[sched_handle, api_handle]).await;
        Ok(())
    }

    async fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Message(msg) => self.handle_message(msg).await,
            Inbound::Callback(query) => self.handle_callback(query).await,
        }
    }

    /// Graceful shutdown: stop background loops and channels.
    ///
    /// Armed timers die with the process; the next start re-arms them.
    async fn shutdown(&self, handles: &[Option<JoinHandle<()>>]) {
        info!("Shutting down...");

        for handle in handles.iter().flatten() {
            handle.abort();
        }

        for (name, channel) in &self.channels {
            if let Err(e) = channel.stop().await {
                warn!("failed to stop channel {name}: {e}");
            }
        }

        info!("Shutdown complete.");
    }

    /// Send a plain text message. Returns the platform message id.
    pub(super) async fn send_text(
        &self,
        channel_name: &str,
        reply_target: &str,
        text: &str,
    ) -> Option<String> {
        self.send(channel_name, OutgoingMessage::text(reply_target, text))
            .await
    }

    pub(super) async fn send(
        &self,
        channel_name: &str,
        message: OutgoingMessage,
    ) -> Option<String> {
        let channel = self.channels.get(channel_name)?;
        match channel.send(message).await {
            Ok(message_ref) => Some(message_ref),
            Err(e) => {
                error!("failed to send message: {e}");
                None
            }
        }
    }
}
