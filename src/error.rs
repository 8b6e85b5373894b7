use std::path::PathBuf;
use std::time::Duration;

use handlebars::{RenderError, TemplateError};
use kube::error::ErrorResponse;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SvnOperatorError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },
    #[error(transparent)]
    TemplateRenderError(#[from] RenderError),
    #[error(transparent)]
    TemplateError(#[from] TemplateError),
    #[error("Unable to (de)serialize the repository manifest: {source}")]
    ManifestError {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("Unable to compare resources: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },
    #[error("Object is missing key: {key}")]
    MissingObjectKey { key: &'static str },
    #[error("The index of {kind} objects has not received its initial listing yet")]
    IndexNotReady { kind: &'static str },
    #[error("Command [{command}] exited with {status}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stdout: String,
        stderr: String,
    },
    #[error("Command [{command}] did not finish within {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("Refusing to provision repository with invalid name [{name}]")]
    InvalidRepositoryName { name: String },
    #[error("Unable to provision the following repositories: {failed:?}")]
    RepositoryProvisioningFailed { failed: Vec<String> },
    #[error("User [{name}] does not exist")]
    UnknownUser { name: String },
    #[error("Unable to watch [{path}]: {source}")]
    WatchError {
        path: PathBuf,
        source: notify::Error,
    },
}

impl SvnOperatorError {
    /// Returns the error response if the API server rejected a request.
    fn api_response(&self) -> Option<&ErrorResponse> {
        match self {
            SvnOperatorError::KubeError {
                source: kube::Error::Api(response),
            } => Some(response),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.api_response()
            .map(|response| response.code == 404 || response.reason == "NotFound")
            .unwrap_or(false)
    }

    pub fn is_already_exists(&self) -> bool {
        self.api_response()
            .map(|response| response.reason == "AlreadyExists")
            .unwrap_or(false)
    }

    pub fn is_conflict(&self) -> bool {
        self.api_response()
            .map(|response| response.code == 409 && response.reason == "Conflict")
            .unwrap_or(false)
    }

    /// Errors that are expected while objects are being created or deleted
    /// concurrently and that resolve themselves on the next pass.
    pub fn is_benign(&self) -> bool {
        self.is_not_found() || self.is_already_exists()
    }
}

pub type Result<T, E = SvnOperatorError> = std::result::Result<T, E>;
