//! Administrative control-plane contract.
//!
//! The orchestrator only sees [`AdminGateway`]: submit a create request, get
//! back a long-running [`Operation`], then wait for it. [`rest`] talks to the
//! emulator over plaintext HTTP; [`memory`] is a stateful stand-in for tests.

pub mod memory;
pub mod rest;
pub mod retry;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::targets;

pub use memory::{AdminCall, InMemoryAdmin};
pub use rest::{RestAdminClient, RestTransport};
pub use retry::RetryPolicy;

/// Canonical status codes carried by control-plane errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    pub fn from_name(name: &str) -> Option<Self> {
        let code = match name {
            "CANCELLED" => Self::Cancelled,
            "UNKNOWN" => Self::Unknown,
            "INVALID_ARGUMENT" => Self::InvalidArgument,
            "DEADLINE_EXCEEDED" => Self::DeadlineExceeded,
            "NOT_FOUND" => Self::NotFound,
            "ALREADY_EXISTS" => Self::AlreadyExists,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            "RESOURCE_EXHAUSTED" => Self::ResourceExhausted,
            "FAILED_PRECONDITION" => Self::FailedPrecondition,
            "ABORTED" => Self::Aborted,
            "OUT_OF_RANGE" => Self::OutOfRange,
            "UNIMPLEMENTED" => Self::Unimplemented,
            "INTERNAL" => Self::Internal,
            "UNAVAILABLE" => Self::Unavailable,
            "DATA_LOSS" => Self::DataLoss,
            "UNAUTHENTICATED" => Self::Unauthenticated,
            _ => return None,
        };
        Some(code)
    }

    /// Maps a numeric gRPC code as found in `Operation.error.code`.
    pub fn from_grpc(code: i32) -> Self {
        match code {
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    pub fn from_http(status: u16) -> Self {
        match status {
            400 => Self::InvalidArgument,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            409 => Self::AlreadyExists,
            429 => Self::ResourceExhausted,
            499 => Self::Cancelled,
            501 => Self::Unimplemented,
            503 => Self::Unavailable,
            504 => Self::DeadlineExceeded,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AdminError {
    #[error("invalid admin endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{code:?}: {message}")]
    Status { code: StatusCode, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("operation {name} failed with {code:?}: {message}")]
    OperationFailed {
        name: String,
        code: StatusCode,
        message: String,
    },

    #[error("cancelled")]
    Cancelled,
}

impl AdminError {
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::Status {
                code: StatusCode::AlreadyExists,
                ..
            }
        )
    }
}

/// Handle to a long-running create operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    /// Set when the operation finished unsuccessfully.
    pub error: Option<(StatusCode, String)>,
}

impl Operation {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            done: false,
            error: None,
        }
    }

    pub fn into_result(self) -> Result<(), AdminError> {
        match self.error {
            Some((code, message)) => Err(AdminError::OperationFailed {
                name: self.name,
                code,
                message,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    pub project: String,
    pub instance_id: String,
    pub config: String,
    pub node_count: u32,
    pub display_name: String,
}

impl CreateInstanceRequest {
    pub fn parent(&self) -> String {
        format!("projects/{}", self.project)
    }

    pub fn path(&self) -> String {
        targets::instance_path(&self.project, &self.instance_id)
    }

    /// Instance configs are addressed relative to the owning project.
    pub fn config_path(&self) -> String {
        if self.config.starts_with("projects/") {
            self.config.clone()
        } else {
            format!("{}/instanceConfigs/{}", self.parent(), self.config)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateDatabaseRequest {
    pub project: String,
    pub instance: String,
    pub database_id: String,
}

impl CreateDatabaseRequest {
    pub fn parent(&self) -> String {
        targets::instance_path(&self.project, &self.instance)
    }

    pub fn path(&self) -> String {
        targets::database_path(&self.project, &self.instance, &self.database_id)
    }

    pub fn create_statement(&self) -> String {
        format!("CREATE DATABASE `{}`", self.database_id)
    }
}

/// Remote create operations needed to provision instances and databases.
///
/// Implementations are shared across concurrently running tasks. Calls made
/// before the control plane is reachable wait for it rather than failing, and
/// give up with [`AdminError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait AdminGateway: Send + Sync {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
        cancel: &CancellationToken,
    ) -> Result<Operation, AdminError>;

    async fn create_database(
        &self,
        request: &CreateDatabaseRequest,
        cancel: &CancellationToken,
    ) -> Result<Operation, AdminError>;

    /// Resolves once the operation is done, surfacing its error if any.
    async fn wait_operation(
        &self,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<(), AdminError>;
}
