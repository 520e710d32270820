//! Agent bus: one logical duplex channel per connected agent
//!
//! The bus owns the per-agent outbound queues and the inbound dispatch table.
//! `send` is non-blocking: a disconnected agent or a full queue drops the
//! message, and recovery is the resync path at the agent's next reconnect.
//! Delivery is order-preserving per agent; nothing is ordered across agents.

mod message;

pub use message::{
    AgentMessage, HEALTHCHECK_STATUS, NEWT_AUTH_PROXY_CONFIG, NEWT_DNS_AUTHORITY_CONFIG,
    OLM_DNS_AUTHORITY_CONFIG, OLM_SYNC,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

/// The two kinds of edge agent the controller manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Newt,
    Olm,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Newt => f.write_str("newt"),
            Self::Olm => f.write_str("olm"),
        }
    }
}

/// Outcome of a `send`: the message was queued, or it was dropped.
///
/// A drop is advisory, never an error; the next full-snapshot resync makes
/// the agent whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

impl SendOutcome {
    pub fn is_sent(self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Handler for one inbound message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, agent_id: &str, kind: AgentKind, data: serde_json::Value);
}

/// Observer fired once per agent (re)connect, after the channel is attached.
#[async_trait]
pub trait ConnectListener: Send + Sync {
    async fn agent_connected(&self, kind: AgentKind, agent_id: &str);
}

struct AgentConnection {
    kind: AgentKind,
    outbound: mpsc::Sender<AgentMessage>,
}

/// Connection table plus dispatch registries.
///
/// Handlers and connect listeners are registered during startup, before any
/// agent can attach; the registries are read-mostly thereafter.
pub struct AgentBus {
    connections: RwLock<HashMap<String, AgentConnection>>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    connect_listeners: RwLock<Vec<Arc<dyn ConnectListener>>>,
    queue_capacity: usize,
}

impl AgentBus {
    /// Create a bus whose per-agent outbound queues hold `queue_capacity`
    /// messages before `send` starts dropping.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            connect_listeners: RwLock::new(Vec::new()),
            queue_capacity,
        }
    }

    /// Bind an inbound message type to a handler.
    pub async fn register_handler(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.handlers
            .write()
            .await
            .insert(message_type.into(), handler);
    }

    /// Register an observer for agent (re)connects.
    pub async fn register_connect_listener(&self, listener: Arc<dyn ConnectListener>) {
        self.connect_listeners.write().await.push(listener);
    }

    /// Attach an agent and return the receiving end of its outbound queue.
    ///
    /// The caller (the connection layer) drains the receiver into the socket.
    /// A reconnect replaces the previous channel; the stale receiver closes
    /// and its pump winds down. Connect listeners fire after the channel is
    /// in place, so bootstrap messages land in the fresh queue.
    pub async fn attach(
        &self,
        kind: AgentKind,
        agent_id: impl Into<String>,
    ) -> mpsc::Receiver<AgentMessage> {
        let agent_id = agent_id.into();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        {
            let mut connections = self.connections.write().await;
            if connections
                .insert(agent_id.clone(), AgentConnection { kind, outbound: tx })
                .is_some()
            {
                tracing::debug!(agent_id = %agent_id, "agent reconnected, replacing channel");
            }
        }
        tracing::info!(agent_id = %agent_id, kind = %kind, "agent connected");

        let listeners = self.connect_listeners.read().await.clone();
        for listener in listeners {
            listener.agent_connected(kind, &agent_id).await;
        }

        rx
    }

    /// Remove an agent's channel. Safe to call for an unknown agent.
    pub async fn detach(&self, agent_id: &str) {
        if self.connections.write().await.remove(agent_id).is_some() {
            tracing::info!(agent_id = %agent_id, "agent disconnected");
        }
    }

    /// Queue a message for an agent without blocking.
    ///
    /// Returns [`SendOutcome::Dropped`] when the agent is not connected or
    /// its queue is full; the drop is logged at warn and never retried.
    pub async fn send(&self, agent_id: &str, message: AgentMessage) -> SendOutcome {
        let connections = self.connections.read().await;
        let Some(connection) = connections.get(agent_id) else {
            tracing::warn!(
                agent_id = %agent_id,
                message_type = %message.message_type,
                "dropping message for disconnected agent"
            );
            return SendOutcome::Dropped;
        };

        match connection.outbound.try_send(message) {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                let message_type = match &e {
                    mpsc::error::TrySendError::Full(m)
                    | mpsc::error::TrySendError::Closed(m) => m.message_type.clone(),
                };
                tracing::warn!(
                    agent_id = %agent_id,
                    message_type = %message_type,
                    "dropping message, agent queue unavailable"
                );
                SendOutcome::Dropped
            }
        }
    }

    /// Route an inbound message to the handler registered for its type.
    ///
    /// Unknown types and messages from unknown agents are logged and dropped;
    /// the connection stays open either way.
    pub async fn dispatch(&self, agent_id: &str, message: AgentMessage) {
        let kind = {
            let connections = self.connections.read().await;
            match connections.get(agent_id) {
                Some(connection) => connection.kind,
                None => {
                    tracing::warn!(agent_id = %agent_id, "dropping message from unknown agent");
                    return;
                }
            }
        };

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&message.message_type).cloned()
        };

        match handler {
            Some(handler) => handler.handle(agent_id, kind, message.data).await,
            None => {
                tracing::debug!(
                    agent_id = %agent_id,
                    message_type = %message.message_type,
                    "no handler for inbound message type"
                );
            }
        }
    }

    /// Whether the agent currently has an attached channel.
    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.connections.read().await.contains_key(agent_id)
    }

    /// Number of attached agents.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
