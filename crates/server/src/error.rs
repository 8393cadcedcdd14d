//! Asset layer error types
//!
//! Every public asset, manager and handler operation returns
//! [`AssetResult`]. The control plane turns the `Display` text of an error
//! into the `message` of a failure reply, so messages are written for the
//! remote controller.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error("asset {0} not found")]
    NotFound(String),

    #[error("asset {0} is already registered")]
    DuplicateAsset(String),

    #[error("unknown config type")]
    UnknownConfigType,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("asset {0} is already streaming")]
    AlreadyStreaming(String),

    #[error("asset {0} is not streaming")]
    NotStreaming(String),

    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no controller subscribed")]
    NotSubscribed,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AssetResult<T> = std::result::Result<T, AssetError>;

impl From<common::Error> for AssetError {
    fn from(err: common::Error) -> Self {
        AssetError::Transport(err.to_string())
    }
}

impl From<protocol::ProtocolError> for AssetError {
    fn from(err: protocol::ProtocolError) -> Self {
        AssetError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_asset() {
        assert_eq!(
            AssetError::AlreadyStreaming("imu-in72e".into()).to_string(),
            "asset imu-in72e is already streaming"
        );
        assert_eq!(AssetError::UnknownConfigType.to_string(), "unknown config type");
    }

    #[test]
    fn test_transport_errors_convert() {
        let err: AssetError = common::Error::Closed.into();
        assert!(matches!(err, AssetError::Transport(_)));
    }
}
