use crate::cron::CronError;
use crate::models::PostAction;
use crate::store::StoreError;
use crate::transport::TransportError;
use uuid::Uuid;

/// Raisons pour lesquelles un groupe ne peut pas être supprimé
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GroupInUse {
    #[error("it still has {0} member host(s)")]
    HasMembers(usize),
    #[error("it is the default registration group")]
    DefaultRegistrationGroup,
    #[error("it is referenced by a registration rule")]
    ReferencedByRule,
    #[error("it is referenced by a schedule scope")]
    ReferencedBySchedule,
    #[error("it is the last remaining group")]
    LastGroup,
}

/// Classe d'erreur, pour décider de la propagation côté appelant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Entrée invalide : état inchangé, message descriptif
    User,
    /// Réseau, timeout, identité refusée : jamais fatal
    Transport,
    /// Le stockage a échoué en lecture ou écriture
    Storage,
    /// L'état dérivé ne peut plus être garanti : le processus doit s'arrêter
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("{kind} with {field} '{value}' already exists")]
    Duplicate {
        kind: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("group '{name}' cannot be deleted: {reason}")]
    GroupInUse { name: String, reason: GroupInUse },
    #[error("invalid schedule scope: {0}")]
    InvalidScope(&'static str),
    #[error("invalid cron pattern: {0}")]
    InvalidCron(#[from] CronError),
    #[error("invalid registration rule: {0}")]
    InvalidRule(String),
    #[error("registration refused: {0}")]
    RegistrationRefused(String),
    #[error("host '{0}' is disabled")]
    HostDisabled(String),
    #[error("script '{script}' is not enabled for host '{host}'")]
    ScriptNotEnabled { script: String, host: String },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("post-execution action {action:?} failed: {source}")]
    PostAction {
        action: PostAction,
        source: TransportError,
    },
    #[error("storage error: {0}")]
    Storage(StoreError),
    #[error("membership cache rebuild failed: {0}")]
    CacheRebuild(StoreError),
}

impl FleetError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FleetError::Validation(_)
            | FleetError::NotFound { .. }
            | FleetError::Duplicate { .. }
            | FleetError::GroupInUse { .. }
            | FleetError::InvalidScope(_)
            | FleetError::InvalidCron(_)
            | FleetError::InvalidRule(_)
            | FleetError::RegistrationRefused(_)
            | FleetError::HostDisabled(_)
            | FleetError::ScriptNotEnabled { .. } => ErrorClass::User,
            FleetError::Transport(_) | FleetError::PostAction { .. } => ErrorClass::Transport,
            FleetError::Storage(StoreError::Corrupt { .. }) | FleetError::CacheRebuild(_) => {
                ErrorClass::Fatal
            }
            FleetError::Storage(_) => ErrorClass::Storage,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl From<StoreError> for FleetError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { kind, field, value } => {
                FleetError::Duplicate { kind, field, value }
            }
            StoreError::NotFound { kind, id } => FleetError::NotFound { kind, id },
            other => FleetError::Storage(other),
        }
    }
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;
