/**
 * DISPATCHER - Exécution d'une action sur un hôte via le transport
 *
 * RÔLE : ping, exécution de script, arrêt de l'agent. Seul composant qui
 * ouvre des sessions vers les agents.
 *
 * EFFETS DE BORD (appliqués que l'opération réussisse ou non) :
 * - identité présentée → TrustManager::record_contact
 * - succès → hôte joignable ; erreur transport → injoignable (sauf annulation)
 *
 * ENVIRONNEMENT D'EXÉCUTION (chaque couche écrase la précédente) :
 *   variables système SYMBION_* → globales opérateur → script → groupes
 *   (ordre d'appartenance) → hôte
 */

use crate::error::{FleetError, Result};
use crate::models::{Environment, Group, Host, HostId, Script, ScriptId, ScriptResult};
use crate::reachability::ReachabilityTracker;
use crate::store::EntityStore;
use crate::transport::{
    AgentEndpoint, AgentReply, AgentRequest, AgentSession, AgentTransport, ConnectOptions,
    ExecControl, ScriptPayload, TransportError,
};
use crate::trust::TrustManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct DispatchSettings {
    pub connect: ConnectOptions,
    /// Variables globales définies par l'opérateur
    pub environment: Environment,
}

/// Actions disponibles sur un hôte (ensemble fermé)
#[derive(Debug)]
pub enum DispatchAction {
    Ping,
    RunScript(Script, ExecControl),
    Exit,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Pong,
    Script(ScriptExecution),
    Exit(ExitOutcome),
}

/// Trace d'une exécution de script sur un hôte
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptExecution {
    pub host_id: HostId,
    pub script_id: ScriptId,
    pub started_at: OffsetDateTime,
    pub duration: Duration,
    pub environment: Environment,
    pub result: ScriptResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Confirmed,
    /// L'agent n'a pas confirmé ; il a pu s'arrêter quand même
    Unconfirmed(TransportError),
}

pub struct Dispatcher {
    transport: Arc<dyn AgentTransport>,
    trust: Arc<TrustManager>,
    reachability: Arc<ReachabilityTracker>,
    groups: Arc<dyn EntityStore<Group>>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        trust: Arc<TrustManager>,
        reachability: Arc<ReachabilityTracker>,
        groups: Arc<dyn EntityStore<Group>>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            transport,
            trust,
            reachability,
            groups,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub async fn perform(&self, host: &Host, action: DispatchAction) -> Result<DispatchOutcome> {
        match action {
            DispatchAction::Ping => self.ping(host).await.map(|_| DispatchOutcome::Pong),
            DispatchAction::RunScript(script, control) => self
                .run_script(host, &script, control)
                .await
                .map(DispatchOutcome::Script),
            DispatchAction::Exit => Ok(DispatchOutcome::Exit(self.exit(host).await)),
        }
    }

    fn note_identity(&self, host: &Host, presented: &str) {
        if let Err(e) = self.trust.record_contact(host.id, presented) {
            warn!(host_id = %host.id, error = %e, "failed to record agent identity");
        }
    }

    fn note_outcome<T>(&self, host: &Host, outcome: &std::result::Result<T, TransportError>) {
        match outcome {
            Ok(_) => self.reachability.mark_reachable(host),
            Err(TransportError::Cancelled) => {}
            Err(_) => self.reachability.mark_unreachable(host),
        }
    }

    /// Ouvre une session et applique le suivi d'identité
    async fn open(&self, host: &Host) -> std::result::Result<Box<dyn AgentSession>, TransportError> {
        let endpoint = AgentEndpoint::for_host(host);
        match self.transport.connect(&endpoint, &self.settings.connect).await {
            Ok(mut session) => {
                let presented = session.peer_identity().to_string();
                self.note_identity(host, &presented);
                if let Some(trusted) = &endpoint.trusted_identity {
                    if *trusted != presented {
                        session.close().await;
                        return Err(TransportError::IdentityRejected { presented });
                    }
                }
                Ok(session)
            }
            Err(e) => {
                if let Some(presented) = e.presented_identity() {
                    self.note_identity(host, presented);
                }
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        host: &Host,
        request: AgentRequest,
        control: ExecControl,
    ) -> std::result::Result<AgentReply, TransportError> {
        let mut session = self.open(host).await?;
        let reply = session.send(request, control).await;
        session.close().await;
        reply
    }

    pub async fn ping(&self, host: &Host) -> Result<()> {
        let outcome = match self.exchange(host, AgentRequest::Ping, ExecControl::default()).await {
            Ok(AgentReply::Pong) => Ok(()),
            Ok(_) => Err(TransportError::UnexpectedReply { request: "ping" }),
            Err(e) => Err(e),
        };
        self.note_outcome(host, &outcome);
        if let Err(e) = &outcome {
            debug!(host_id = %host.id, error = %e, "ping failed");
        }
        outcome.map_err(FleetError::from)
    }

    /// Exécute un script ; l'action post-exécution éventuelle n'est envoyée
    /// qu'après un succès, et son échec fait échouer toute l'opération
    pub async fn run_script(
        &self,
        host: &Host,
        script: &Script,
        control: ExecControl,
    ) -> Result<ScriptExecution> {
        let environment = self.build_environment(host, script);
        let payload = ScriptPayload {
            script_name: script.name.clone(),
            content: script.content.clone(),
            environment: environment.clone(),
        };
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();

        let mut session = match self.open(host).await {
            Ok(s) => s,
            Err(e) => {
                self.note_outcome::<()>(host, &Err(e.clone()));
                return Err(e.into());
            }
        };

        let outcome = match session.send(AgentRequest::RunScript(payload), control).await {
            Ok(AgentReply::Script(result)) => Ok(result),
            Ok(_) => Err(TransportError::UnexpectedReply { request: "run_script" }),
            Err(e) => Err(e),
        };
        let duration = clock.elapsed();
        self.note_outcome(host, &outcome);

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                session.close().await;
                warn!(host_id = %host.id, script = %script.name, error = %e, "script dispatch failed");
                return Err(e.into());
            }
        };

        if result.success {
            if let Some(action) = script.post_action {
                let follow_up = session
                    .send(AgentRequest::PostAction(action), ExecControl::default())
                    .await;
                if let Err(source) = follow_up {
                    session.close().await;
                    warn!(host_id = %host.id, ?action, error = %source, "post-execution action failed");
                    return Err(FleetError::PostAction { action, source });
                }
            }
        }
        session.close().await;

        info!(
            host_id = %host.id,
            script = %script.name,
            exit_code = result.exit_code,
            elapsed_ms = duration.as_millis() as u64,
            "script executed"
        );
        Ok(ScriptExecution {
            host_id: host.id,
            script_id: script.id,
            started_at,
            duration,
            environment,
            result,
        })
    }

    pub async fn exit(&self, host: &Host) -> ExitOutcome {
        let outcome = match self.exchange(host, AgentRequest::Exit, ExecControl::default()).await {
            Ok(AgentReply::Ack) => Ok(()),
            Ok(_) => Err(TransportError::UnexpectedReply { request: "exit" }),
            Err(e) => Err(e),
        };
        self.note_outcome(host, &outcome);
        match outcome {
            Ok(()) => {
                info!(host_id = %host.id, "agent exit confirmed");
                ExitOutcome::Confirmed
            }
            Err(e) => {
                warn!(host_id = %host.id, error = %e, "agent exit not confirmed");
                ExitOutcome::Unconfirmed(e)
            }
        }
    }

    pub fn build_environment(&self, host: &Host, script: &Script) -> Environment {
        let mut env = Environment::new();
        env.insert("SYMBION_HOST_ID".into(), host.id.to_string());
        env.insert("SYMBION_HOST_NAME".into(), host.name.clone());
        env.insert("SYMBION_HOST_ADDRESS".into(), host.address.clone());
        env.insert("SYMBION_SCRIPT_ID".into(), script.id.to_string());
        env.insert("SYMBION_SCRIPT_NAME".into(), script.name.clone());

        env.extend(self.settings.environment.clone());
        env.extend(script.environment.clone());
        for group_id in &host.group_ids {
            match self.groups.get(*group_id) {
                Ok(Some(group)) => env.extend(group.environment),
                Ok(None) => {}
                Err(e) => warn!(%group_id, error = %e, "group environment unavailable"),
            }
        }
        env.extend(host.environment.clone());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PostAction;
    use crate::store::JsonTable;
    use crate::transport::stub::{StubAgent, StubTransport};
    use crate::transport::{OutputChunk, OutputStream};
    use crate::trust::TrustState;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    struct Fixture {
        dispatcher: Dispatcher,
        stub: StubTransport,
        hosts: Arc<JsonTable<Host>>,
        groups: Arc<JsonTable<Group>>,
        reachability: Arc<ReachabilityTracker>,
        trust: Arc<TrustManager>,
    }

    fn fixture() -> Fixture {
        let stub = StubTransport::new();
        let hosts = Arc::new(JsonTable::<Host>::in_memory());
        let groups = Arc::new(JsonTable::<Group>::in_memory());
        let reachability = Arc::new(ReachabilityTracker::new());
        let trust = Arc::new(TrustManager::new(hosts.clone(), Arc::new(Mutex::new(()))));
        let settings = DispatchSettings {
            connect: ConnectOptions::default(),
            environment: BTreeMap::from([
                ("LEVEL".to_string(), "global".to_string()),
                ("REGION".to_string(), "eu".to_string()),
            ]),
        };
        let dispatcher = Dispatcher::new(
            Arc::new(stub.clone()),
            trust.clone(),
            reachability.clone(),
            groups.clone(),
            settings,
        );
        Fixture { dispatcher, stub, hosts, groups, reachability, trust }
    }

    fn add_host(f: &Fixture, address: &str, group_ids: Vec<Uuid>) -> Host {
        let host = Host {
            id: Uuid::new_v4(),
            name: format!("h-{address}"),
            address: address.into(),
            port: 7022,
            enabled: true,
            psk: "psk".into(),
            group_ids,
            trust: Default::default(),
            environment: BTreeMap::new(),
            created_at: OffsetDateTime::now_utc(),
        };
        f.hosts.add(host.clone()).unwrap();
        host
    }

    fn script(post_action: Option<PostAction>) -> Script {
        Script {
            id: Uuid::new_v4(),
            name: "upgrade".into(),
            content: "apt-get -y upgrade".into(),
            environment: BTreeMap::from([("LEVEL".to_string(), "script".to_string())]),
            post_action,
        }
    }

    #[tokio::test]
    async fn test_first_ping_records_identity_without_trusting() {
        let f = fixture();
        let host = add_host(&f, "10.0.0.1", vec![]);
        f.stub.install("10.0.0.1", StubAgent::new("K1"));

        f.dispatcher.ping(&host).await.unwrap();

        let stored = f.hosts.get(host.id).unwrap().unwrap();
        assert_eq!(stored.trust.trusted_identity, "");
        assert_eq!(stored.trust.untrusted_identity, "K1");
        assert!(f.reachability.last_heartbeat(&host).unwrap().is_reachable);
        assert_eq!(f.trust.state(host.id).unwrap(), TrustState::AwaitingTrust);
    }

    #[tokio::test]
    async fn test_identity_mismatch_marks_conflict_and_unreachable() {
        let f = fixture();
        let mut host = add_host(&f, "10.0.0.2", vec![]);
        host.trust.trusted_identity = "K1".into();
        f.hosts.update(host.clone()).unwrap();
        f.stub.install("10.0.0.2", StubAgent::new("K2"));

        let err = f.dispatcher.ping(&host).await.unwrap_err();
        assert!(matches!(err, FleetError::Transport(TransportError::IdentityRejected { .. })));
        assert_eq!(f.trust.state(host.id).unwrap(), TrustState::Conflict);
        assert!(!f.reachability.last_heartbeat(&host).unwrap().is_reachable);
    }

    #[tokio::test]
    async fn test_environment_layers_override_in_order() {
        let f = fixture();
        let g1 = Group {
            id: Uuid::new_v4(),
            name: "g1".into(),
            script_ids: vec![],
            environment: BTreeMap::from([("LEVEL".to_string(), "g1".to_string())]),
        };
        let g2 = Group {
            id: Uuid::new_v4(),
            name: "g2".into(),
            script_ids: vec![],
            environment: BTreeMap::from([
                ("LEVEL".to_string(), "g2".to_string()),
                ("TIER".to_string(), "back".to_string()),
            ]),
        };
        f.groups.add(g1.clone()).unwrap();
        f.groups.add(g2.clone()).unwrap();
        let mut host = add_host(&f, "10.0.0.3", vec![g1.id, g2.id]);
        let s = script(None);

        let env = f.dispatcher.build_environment(&host, &s);
        assert_eq!(env["LEVEL"], "g2");
        assert_eq!(env["REGION"], "eu");
        assert_eq!(env["TIER"], "back");
        assert_eq!(env["SYMBION_HOST_ADDRESS"], "10.0.0.3");

        host.environment.insert("LEVEL".into(), "host".into());
        host.environment.insert("SYMBION_HOST_NAME".into(), "alias".into());
        let env = f.dispatcher.build_environment(&host, &s);
        assert_eq!(env["LEVEL"], "host");
        assert_eq!(env["SYMBION_HOST_NAME"], "alias");
    }

    #[tokio::test]
    async fn test_run_script_streams_output_and_sends_post_action() {
        let f = fixture();
        let host = add_host(&f, "10.0.0.4", vec![]);
        f.stub.install(
            "10.0.0.4",
            StubAgent::new("K1").with_stdout("done").with_chunks(vec![OutputChunk {
                stream: OutputStream::Stdout,
                data: "step 1\n".into(),
            }]),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let control = ExecControl { output: Some(tx), cancel: None };

        let exec = f
            .dispatcher
            .run_script(&host, &script(Some(PostAction::Reboot)), control)
            .await
            .unwrap();

        assert!(exec.result.success);
        assert_eq!(exec.result.stdout, "done");
        assert_eq!(rx.recv().await.unwrap().data, "step 1\n");
        let calls = f.stub.calls_to("10.0.0.4");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], AgentRequest::PostAction(PostAction::Reboot));
    }

    #[tokio::test]
    async fn test_failed_script_skips_post_action() {
        let f = fixture();
        let host = add_host(&f, "10.0.0.5", vec![]);
        f.stub.install("10.0.0.5", StubAgent::new("K1").with_exit_code(2));
        let exec = f
            .dispatcher
            .run_script(&host, &script(Some(PostAction::ExitAgent)), ExecControl::default())
            .await
            .unwrap();
        assert!(!exec.result.success);
        assert_eq!(f.stub.calls_to("10.0.0.5").len(), 1);
    }

    #[tokio::test]
    async fn test_post_action_failure_fails_operation() {
        let f = fixture();
        let host = add_host(&f, "10.0.0.6", vec![]);
        f.stub.install(
            "10.0.0.6",
            StubAgent::new("K1").failing_post_action(TransportError::Protocol("denied".into())),
        );
        let err = f
            .dispatcher
            .run_script(&host, &script(Some(PostAction::Reboot)), ExecControl::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::PostAction { action: PostAction::Reboot, .. }));
    }

    #[tokio::test]
    async fn test_cancellation_does_not_mark_unreachable() {
        let f = fixture();
        let host = add_host(&f, "10.0.0.7", vec![]);
        f.stub.install(
            "10.0.0.7",
            StubAgent::new("K1").with_run_duration(Duration::from_secs(30)),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let control = ExecControl { output: None, cancel: Some(cancel_rx) };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = cancel_tx.send(true);
        });

        let err = f.dispatcher.run_script(&host, &script(None), control).await.unwrap_err();
        assert!(matches!(err, FleetError::Transport(TransportError::Cancelled)));
        assert!(f.reachability.last_heartbeat(&host).is_none());
    }

    #[tokio::test]
    async fn test_exit_failure_is_unconfirmed() {
        let f = fixture();
        let host = add_host(&f, "10.0.0.8", vec![]);
        let outcome = f.dispatcher.perform(&host, DispatchAction::Exit).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Exit(ExitOutcome::Unconfirmed(TransportError::Connect { .. }))
        ));
        assert!(!f.reachability.last_heartbeat(&host).unwrap().is_reachable);

        f.stub.install("10.0.0.8", StubAgent::new("K1"));
        assert!(matches!(
            f.dispatcher.perform(&host, DispatchAction::Exit).await.unwrap(),
            DispatchOutcome::Exit(ExitOutcome::Confirmed)
        ));
    }
}
