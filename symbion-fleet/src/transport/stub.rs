/*!
Transport simulé pour développer et tester sans agent réel

Chaque adresse se voit attribuer un `StubAgent` scripté (identité présentée,
code de sortie, pannes à injecter). Toutes les requêtes envoyées sont
enregistrées pour les assertions de tests.
*/

use super::{
    AgentEndpoint, AgentReply, AgentRequest, AgentSession, AgentTransport, ConnectOptions,
    ExecControl, OutputChunk, TransportError,
};
use crate::models::ScriptResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Comportement scripté d'un agent simulé
#[derive(Debug, Clone)]
pub struct StubAgent {
    /// Identité présentée à chaque poignée de main
    pub identity: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Fragments émis avant le résultat final
    pub chunks: Vec<OutputChunk>,
    /// Échec injecté à la connexion
    pub connect_error: Option<TransportError>,
    /// Échec injecté sur chaque requête
    pub request_error: Option<TransportError>,
    /// Échec injecté sur l'action post-exécution uniquement
    pub post_action_error: Option<TransportError>,
    /// Durée simulée d'un script (annulable)
    pub run_duration: Option<Duration>,
}

impl StubAgent {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            chunks: Vec::new(),
            connect_error: None,
            request_error: None,
            post_action_error: None,
            run_duration: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<OutputChunk>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn failing_connect(mut self, err: TransportError) -> Self {
        self.connect_error = Some(err);
        self
    }

    pub fn failing_requests(mut self, err: TransportError) -> Self {
        self.request_error = Some(err);
        self
    }

    pub fn failing_post_action(mut self, err: TransportError) -> Self {
        self.post_action_error = Some(err);
        self
    }

    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = Some(duration);
        self
    }
}

/// Requête enregistrée par le stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubCall {
    pub address: String,
    pub request: AgentRequest,
}

#[derive(Clone, Default)]
pub struct StubTransport {
    agents: Arc<Mutex<HashMap<String, StubAgent>>>,
    calls: Arc<Mutex<Vec<StubCall>>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installe (ou remplace) l'agent qui répond sur `address`
    pub fn install(&self, address: &str, agent: StubAgent) {
        self.agents.lock().insert(address.to_string(), agent);
    }

    pub fn remove(&self, address: &str) {
        self.agents.lock().remove(address);
    }

    /// Toutes les requêtes envoyées, dans l'ordre
    pub fn calls(&self) -> Vec<StubCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, address: &str) -> Vec<AgentRequest> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.address == address)
            .map(|c| c.request.clone())
            .collect()
    }
}

#[async_trait]
impl AgentTransport for StubTransport {
    async fn connect(
        &self,
        endpoint: &AgentEndpoint,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn AgentSession>, TransportError> {
        let agent = self
            .agents
            .lock()
            .get(&endpoint.address)
            .cloned()
            .ok_or_else(|| TransportError::Connect {
                target: endpoint.target(),
                reason: "no route to host".to_string(),
            })?;

        if let Some(err) = agent.connect_error.clone() {
            return Err(err);
        }
        if let Some(trusted) = &endpoint.trusted_identity {
            if *trusted != agent.identity {
                return Err(TransportError::IdentityRejected {
                    presented: agent.identity.clone(),
                });
            }
        }

        Ok(Box::new(StubSession {
            address: endpoint.address.clone(),
            agent,
            calls: self.calls.clone(),
        }))
    }
}

struct StubSession {
    address: String,
    agent: StubAgent,
    calls: Arc<Mutex<Vec<StubCall>>>,
}

#[async_trait]
impl AgentSession for StubSession {
    fn peer_identity(&self) -> &str {
        &self.agent.identity
    }

    async fn send(
        &mut self,
        request: AgentRequest,
        control: ExecControl,
    ) -> Result<AgentReply, TransportError> {
        self.calls.lock().push(StubCall {
            address: self.address.clone(),
            request: request.clone(),
        });

        if let Some(err) = self.agent.request_error.clone() {
            return Err(err);
        }

        match request {
            AgentRequest::Ping => Ok(AgentReply::Pong),
            AgentRequest::Exit => Ok(AgentReply::Ack),
            AgentRequest::PostAction(_) => match self.agent.post_action_error.clone() {
                Some(err) => Err(err),
                None => Ok(AgentReply::Ack),
            },
            AgentRequest::RunScript(_) => {
                if let Some(output) = &control.output {
                    for chunk in &self.agent.chunks {
                        let _ = output.send(chunk.clone());
                    }
                }

                if let Some(duration) = self.agent.run_duration {
                    match control.cancel {
                        Some(mut cancel) => {
                            let cancelled = async move { cancel.wait_for(|c| *c).await.is_ok() };
                            tokio::select! {
                                _ = tokio::time::sleep(duration) => {}
                                true = cancelled => return Err(TransportError::Cancelled),
                            }
                        }
                        None => tokio::time::sleep(duration).await,
                    }
                }

                Ok(AgentReply::Script(ScriptResult {
                    exit_code: self.agent.exit_code,
                    stdout: self.agent.stdout.clone(),
                    stderr: self.agent.stderr.clone(),
                    success: self.agent.exit_code == 0,
                }))
            }
        }
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(address: &str, trusted: Option<&str>) -> AgentEndpoint {
        AgentEndpoint {
            address: address.to_string(),
            port: 7022,
            psk: "k".to_string(),
            trusted_identity: trusted.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_unknown_address_fails_to_connect() {
        let stub = StubTransport::new();
        let err = stub
            .connect(&endpoint("10.9.9.9", None), &ConnectOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_pinned_identity_is_enforced() {
        let stub = StubTransport::new();
        stub.install("10.0.0.1", StubAgent::new("key-b"));
        let err = stub
            .connect(&endpoint("10.0.0.1", Some("key-a")), &ConnectOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.presented_identity(), Some("key-b"));
    }

    #[tokio::test]
    async fn test_requests_are_recorded() {
        let stub = StubTransport::new();
        stub.install("10.0.0.1", StubAgent::new("key-a"));
        let mut session = stub
            .connect(&endpoint("10.0.0.1", None), &ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(session.peer_identity(), "key-a");
        let reply = session.send(AgentRequest::Ping, ExecControl::default()).await.unwrap();
        assert_eq!(reply, AgentReply::Pong);
        assert_eq!(stub.calls_to("10.0.0.1"), vec![AgentRequest::Ping]);
    }
}
