//! Error codes returned by brokers in topic and partition metadata.
//!
//! # References
//! - <https://kafka.apache.org/protocol#protocol_error_codes>

use thiserror::Error;

/// Kafka error code as found in a metadata response.
///
/// Only the subset that can show up in topic or partition metadata has a named
/// variant, every other code is preserved as [`ErrorCode::Unknown`].
#[derive(Debug, Error, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ErrorCode {
    #[error("The server experienced an unexpected error when processing the request")]
    UnknownServerError,

    #[error("This server does not host this topic-partition")]
    UnknownTopicOrPartition,

    #[error("There is no leader for this topic-partition as we are in the middle of a leadership election")]
    LeaderNotAvailable,

    #[error("This server is not the leader for that topic-partition")]
    NotLeaderOrFollower,

    #[error("The request timed out")]
    RequestTimedOut,

    #[error("The broker is not available")]
    BrokerNotAvailable,

    #[error("The replica is not available for the requested topic-partition")]
    ReplicaNotAvailable,

    #[error("The server disconnected before a response was received")]
    NetworkException,

    #[error("The request attempted to perform an operation on an invalid topic")]
    InvalidTopicException,

    #[error("Topic authorization failed")]
    TopicAuthorizationFailed,

    #[error("The leader epoch in the request is older than the epoch on the broker")]
    FencedLeaderEpoch,

    #[error("The leader epoch in the request is newer than the epoch on the broker")]
    UnknownLeaderEpoch,

    #[error("Unknown error code {0}")]
    Unknown(i16),
}

impl ErrorCode {
    /// Returns `true` if the broker states that the topic does not exist (or
    /// may never be seen by this client), as opposed to a transient condition
    /// that a later refresh is expected to clear.
    pub fn is_definitive_absence(&self) -> bool {
        matches!(
            self,
            Self::UnknownTopicOrPartition
                | Self::InvalidTopicException
                | Self::TopicAuthorizationFailed
        )
    }

    /// Returns `true` if Kafka marks this error as retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::UnknownTopicOrPartition
                | Self::LeaderNotAvailable
                | Self::NotLeaderOrFollower
                | Self::RequestTimedOut
                | Self::ReplicaNotAvailable
                | Self::NetworkException
                | Self::FencedLeaderEpoch
                | Self::UnknownLeaderEpoch
        )
    }

    /// Maps a raw code to an error, `0` meaning "no error".
    pub fn new(code: i16) -> Option<Self> {
        match code {
            0 => None,
            code => Some(Self::from(code)),
        }
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        match code {
            -1 => Self::UnknownServerError,
            3 => Self::UnknownTopicOrPartition,
            5 => Self::LeaderNotAvailable,
            6 => Self::NotLeaderOrFollower,
            7 => Self::RequestTimedOut,
            8 => Self::BrokerNotAvailable,
            9 => Self::ReplicaNotAvailable,
            13 => Self::NetworkException,
            17 => Self::InvalidTopicException,
            29 => Self::TopicAuthorizationFailed,
            74 => Self::FencedLeaderEpoch,
            75 => Self::UnknownLeaderEpoch,
            _ => Self::Unknown(code),
        }
    }
}

impl From<ErrorCode> for i16 {
    fn from(error: ErrorCode) -> Self {
        match error {
            ErrorCode::UnknownServerError => -1,
            ErrorCode::UnknownTopicOrPartition => 3,
            ErrorCode::LeaderNotAvailable => 5,
            ErrorCode::NotLeaderOrFollower => 6,
            ErrorCode::RequestTimedOut => 7,
            ErrorCode::BrokerNotAvailable => 8,
            ErrorCode::ReplicaNotAvailable => 9,
            ErrorCode::NetworkException => 13,
            ErrorCode::InvalidTopicException => 17,
            ErrorCode::TopicAuthorizationFailed => 29,
            ErrorCode::FencedLeaderEpoch => 74,
            ErrorCode::UnknownLeaderEpoch => 75,
            ErrorCode::Unknown(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_no_error() {
        assert_eq!(ErrorCode::new(0), None);
        assert_eq!(ErrorCode::new(3), Some(ErrorCode::UnknownTopicOrPartition));
    }

    #[test]
    fn test_classification() {
        assert!(ErrorCode::UnknownTopicOrPartition.is_definitive_absence());
        assert!(ErrorCode::TopicAuthorizationFailed.is_definitive_absence());
        assert!(!ErrorCode::LeaderNotAvailable.is_definitive_absence());
        assert!(!ErrorCode::Unknown(1000).is_definitive_absence());

        assert!(ErrorCode::LeaderNotAvailable.is_retriable());
        assert!(!ErrorCode::TopicAuthorizationFailed.is_retriable());
    }

    proptest! {
        #[test]
        fn test_roundrip_i16(code: i16) {
            let error = ErrorCode::from(code);
            let code2 = i16::from(error);
            assert_eq!(code, code2);
        }

        #[test]
        fn test_roundrip_error_code(error: ErrorCode) {
            let error = match error {
                // Ensure code is actually unknown
                ErrorCode::Unknown(x) => ErrorCode::from(x),
                _ => error,
            };

            let code = i16::from(error);
            let error2 = ErrorCode::from(code);
            assert_eq!(error, error2);
        }
    }
}
