//! Agent transport seam.
//!
//! The kernel never speaks the wire protocol itself: it opens a session on an
//! [`AgentTransport`], sends one of a closed set of requests, and reads the
//! identity the agent presented during the handshake.

pub mod mqtt;
#[cfg(any(test, feature = "stub-transport"))]
pub mod stub;

use crate::models::{Environment, Host, PostAction, ScriptResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Préférence de famille d'adresse, transmise telle quelle au transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Borne de connexion et des requêtes courtes (ping, exit)
    pub timeout: Duration,
    /// Borne d'une exécution de script
    pub exec_timeout: Duration,
    pub family: AddressFamily,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            exec_timeout: Duration::from_secs(300),
            family: AddressFamily::Any,
        }
    }
}

/// Ce que le transport doit savoir d'un hôte pour le joindre
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub address: String,
    pub port: u16,
    pub psk: String,
    /// Identité épinglée ; le transport refuse tout autre interlocuteur
    pub trusted_identity: Option<String>,
}

impl AgentEndpoint {
    pub fn for_host(host: &Host) -> Self {
        Self {
            address: host.address.clone(),
            port: host.port,
            psk: host.psk.clone(),
            trusted_identity: (!host.trust.trusted_identity.is_empty())
                .then(|| host.trust.trusted_identity.clone()),
        }
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPayload {
    pub script_name: String,
    pub content: String,
    pub environment: Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    Ping,
    RunScript(ScriptPayload),
    Exit,
    PostAction(PostAction),
}

impl AgentRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentRequest::Ping => "ping",
            AgentRequest::RunScript(_) => "run_script",
            AgentRequest::Exit => "exit",
            AgentRequest::PostAction(_) => "post_action",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    Pong,
    Script(ScriptResult),
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Fragment de sortie intermédiaire d'un script en cours
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

/// Canaux optionnels d'une exécution : sortie en flux et annulation
#[derive(Debug, Default)]
pub struct ExecControl {
    pub output: Option<mpsc::UnboundedSender<OutputChunk>>,
    /// Passe à `true` pour demander l'interruption côté agent
    pub cancel: Option<watch::Receiver<bool>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent presented untrusted identity {presented}")]
    IdentityRejected { presented: String },
    #[error("execution cancelled")]
    Cancelled,
    #[error("unexpected reply to {request}")]
    UnexpectedReply { request: &'static str },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Identité présentée pendant la poignée de main, si l'échec la révèle
    pub fn presented_identity(&self) -> Option<&str> {
        match self {
            TransportError::IdentityRejected { presented } => Some(presented),
            _ => None,
        }
    }
}

#[async_trait]
pub trait AgentSession: Send {
    /// Identité présentée par l'agent lors de la poignée de main
    fn peer_identity(&self) -> &str;

    async fn send(
        &mut self,
        request: AgentRequest,
        control: ExecControl,
    ) -> Result<AgentReply, TransportError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &AgentEndpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn AgentSession>, TransportError>;
}
