use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShepherdError {
    #[error("control plane unreachable: {0}")]
    Unavailable(#[source] reqwest::Error),

    #[error("control plane returned status {status}")]
    ControlPlane { status: reqwest::StatusCode },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed payload: {0}")]
    ProtocolDecode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("consensus engine exited with {0}")]
    EngineExited(std::process::ExitStatus),

    #[error("cluster has no members yet and this node is not the designated bootstrapper")]
    AwaitingBootstrap,
}

impl ShepherdError {
    /// Whether a failed members-API call may succeed if repeated.
    ///
    /// Transport failures are always retryable. A 500 from the control plane
    /// means the cluster may still be converging after a topology change and
    /// is retryable as well; every other status is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            ShepherdError::Unavailable(_) => true,
            ShepherdError::ControlPlane { status } => {
                *status == reqwest::StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShepherdError>;
