/**
 * MQTT TRANSPORT - Dialogue requête/réponse avec les agents via le broker
 *
 * RÔLE : implémente AgentTransport au-dessus de rumqttc, sans connexion
 * directe aux hôtes. Chaque agent écoute son propre topic de commande.
 *
 * FONCTIONNEMENT :
 * - commande publiée sur `symbion/fleet/command@v1/<address>` avec un request_id
 * - réponse attendue sur `symbion/fleet/reply@v1`, corrélée par request_id
 *   via une map de oneshot::Sender en attente (timeout = requête abandonnée)
 * - sorties intermédiaires sur `symbion/fleet/output@v1`, routées vers le
 *   canal de l'exécution en cours
 * - annulation : publication d'une commande `interrupt` pour le même request_id
 * - poignée de main `hello` : l'agent répond avec son identité
 *
 * L'event loop (crate::mqtt) appelle handle_reply / handle_output.
 */

use super::{
    AddressFamily, AgentEndpoint, AgentReply, AgentRequest, AgentSession, AgentTransport,
    ConnectOptions, ExecControl, OutputChunk, OutputStream, ScriptPayload, TransportError,
};
use crate::models::{PostAction, ScriptResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

pub const COMMAND_TOPIC_PREFIX: &str = "symbion/fleet/command@v1";
pub const REPLY_TOPIC: &str = "symbion/fleet/reply@v1";
pub const OUTPUT_TOPIC: &str = "symbion/fleet/output@v1";

pub fn command_topic(address: &str) -> String {
    format!("{COMMAND_TOPIC_PREFIX}/{address}")
}

/// Commandes publiées vers un agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandEnvelope {
    Hello {
        request_id: String,
        psk: String,
        port: u16,
        address_family: AddressFamily,
    },
    Ping {
        request_id: String,
    },
    RunScript {
        request_id: String,
        script: ScriptPayload,
    },
    Exit {
        request_id: String,
    },
    PostAction {
        request_id: String,
        post_action: PostAction,
    },
    Interrupt {
        request_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    Hello,
    Pong,
    Script { result: ScriptResult },
    Ack,
    Error { message: String },
}

/// Réponse d'un agent, toujours signée de l'identité qu'il présente
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub request_id: String,
    pub identity: String,
    #[serde(flatten)]
    pub body: ReplyBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputEnvelope {
    pub request_id: String,
    pub stream: OutputStream,
    pub data: String,
}

struct Inner {
    client: AsyncClient,
    pending: Mutex<HashMap<String, oneshot::Sender<ReplyEnvelope>>>,
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<OutputChunk>>>,
}

#[derive(Clone)]
pub struct MqttTransport {
    inner: Arc<Inner>,
}

impl MqttTransport {
    pub fn new(client: AsyncClient) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                pending: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Route une réponse vers la requête en attente
    pub fn handle_reply(&self, payload: &[u8]) {
        let reply: ReplyEnvelope = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "invalid agent reply payload");
                return;
            }
        };
        let sender = self.inner.pending.lock().remove(&reply.request_id);
        match sender {
            Some(tx) => {
                let request_id = reply.request_id.clone();
                if tx.send(reply).is_err() {
                    debug!(%request_id, "reply arrived after requester gave up");
                }
            }
            None => debug!(request_id = %reply.request_id, "reply for unknown request"),
        }
    }

    /// Route un fragment de sortie vers l'exécution en cours
    pub fn handle_output(&self, payload: &[u8]) {
        let out: OutputEnvelope = match serde_json::from_slice(payload) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "invalid agent output payload");
                return;
            }
        };
        let streams = self.inner.streams.lock();
        if let Some(tx) = streams.get(&out.request_id) {
            let _ = tx.send(OutputChunk {
                stream: out.stream,
                data: out.data,
            });
        }
    }

    async fn publish(&self, address: &str, command: &CommandEnvelope) -> Result<(), TransportError> {
        let payload =
            serde_json::to_vec(command).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.inner
            .client
            .publish(command_topic(address), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Connect {
                target: address.to_string(),
                reason: e.to_string(),
            })
    }

    /// Publication sans attente : échoue si la file du client est pleine
    fn try_publish(&self, address: &str, command: &CommandEnvelope) -> Result<(), TransportError> {
        let payload =
            serde_json::to_vec(command).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.inner
            .client
            .try_publish(command_topic(address), QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Connect {
                target: address.to_string(),
                reason: e.to_string(),
            })
    }

    fn forget(&self, request_id: &str) {
        self.inner.pending.lock().remove(request_id);
        self.inner.streams.lock().remove(request_id);
    }

    /// Publie une commande puis attend sa réponse ; la publication et
    /// l'attente partagent la même limite `limit`
    async fn request(
        &self,
        address: &str,
        request_id: String,
        command: CommandEnvelope,
        limit: Duration,
        control: ExecControl,
    ) -> Result<ReplyEnvelope, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.clone(), tx);
        if let Some(output) = control.output {
            self.inner.streams.lock().insert(request_id.clone(), output);
        }

        let exchange = async {
            self.publish(address, &command).await?;
            rx.await
                .map_err(|_| TransportError::Protocol("reply channel closed".into()))
        };
        let bounded = async {
            timeout(limit, exchange)
                .await
                .unwrap_or(Err(TransportError::Timeout(limit)))
        };

        let outcome = match control.cancel {
            Some(mut cancel) => {
                let cancelled = async move { cancel.wait_for(|c| *c).await.is_ok() };
                tokio::select! {
                    res = bounded => res,
                    true = cancelled => {
                        self.forget(&request_id);
                        let interrupt = CommandEnvelope::Interrupt { request_id: request_id.clone() };
                        if let Err(e) = self.try_publish(address, &interrupt) {
                            warn!(%address, error = %e, "failed to publish interrupt");
                        }
                        return Err(TransportError::Cancelled);
                    }
                }
            }
            None => bounded.await,
        };

        self.forget(&request_id);
        outcome
    }

    #[cfg(test)]
    fn pending_ids(&self) -> Vec<String> {
        self.inner.pending.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl AgentTransport for MqttTransport {
    async fn connect(
        &self,
        endpoint: &AgentEndpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn AgentSession>, TransportError> {
        let request_id = Uuid::new_v4().to_string();
        let hello = CommandEnvelope::Hello {
            request_id: request_id.clone(),
            psk: endpoint.psk.clone(),
            port: endpoint.port,
            address_family: options.family,
        };
        let reply = self
            .request(&endpoint.address, request_id, hello, options.timeout, ExecControl::default())
            .await
            .map_err(|e| match e {
                TransportError::Timeout(_) => TransportError::Connect {
                    target: endpoint.target(),
                    reason: "no hello reply".into(),
                },
                other => other,
            })?;

        match reply.body {
            ReplyBody::Hello => {}
            ReplyBody::Error { message } => {
                return Err(TransportError::Connect {
                    target: endpoint.target(),
                    reason: message,
                })
            }
            _ => return Err(TransportError::UnexpectedReply { request: "hello" }),
        }

        if let Some(trusted) = &endpoint.trusted_identity {
            if *trusted != reply.identity {
                return Err(TransportError::IdentityRejected {
                    presented: reply.identity,
                });
            }
        }

        Ok(Box::new(MqttSession {
            transport: self.clone(),
            address: endpoint.address.clone(),
            identity: reply.identity,
            options: options.clone(),
        }))
    }
}

struct MqttSession {
    transport: MqttTransport,
    address: String,
    identity: String,
    options: ConnectOptions,
}

#[async_trait]
impl AgentSession for MqttSession {
    fn peer_identity(&self) -> &str {
        &self.identity
    }

    async fn send(
        &mut self,
        request: AgentRequest,
        control: ExecControl,
    ) -> Result<AgentReply, TransportError> {
        let kind = request.kind();
        let request_id = Uuid::new_v4().to_string();
        let (command, limit) = match request {
            AgentRequest::Ping => (
                CommandEnvelope::Ping { request_id: request_id.clone() },
                self.options.timeout,
            ),
            AgentRequest::RunScript(script) => (
                CommandEnvelope::RunScript { request_id: request_id.clone(), script },
                self.options.exec_timeout,
            ),
            AgentRequest::Exit => (
                CommandEnvelope::Exit { request_id: request_id.clone() },
                self.options.timeout,
            ),
            AgentRequest::PostAction(post_action) => (
                CommandEnvelope::PostAction { request_id: request_id.clone(), post_action },
                self.options.timeout,
            ),
        };

        let reply = self
            .transport
            .request(&self.address, request_id, command, limit, control)
            .await?;

        if reply.identity != self.identity {
            return Err(TransportError::IdentityRejected {
                presented: reply.identity,
            });
        }

        match (kind, reply.body) {
            ("ping", ReplyBody::Pong) => Ok(AgentReply::Pong),
            ("run_script", ReplyBody::Script { result }) => Ok(AgentReply::Script(result)),
            ("exit" | "post_action", ReplyBody::Ack) => Ok(AgentReply::Ack),
            (_, ReplyBody::Error { message }) => Err(TransportError::Protocol(message)),
            (request, _) => Err(TransportError::UnexpectedReply { request }),
        }
    }

    async fn close(&mut self) {}
}
