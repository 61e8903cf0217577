use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster unavailable: the execution substrate has not been started")]
    Unavailable,

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("dispatch to {node} failed: {reason}")]
    Dispatch { node: String, reason: String },
}
