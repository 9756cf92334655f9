use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not running")]
    Stopped,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}
