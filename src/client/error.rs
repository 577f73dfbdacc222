use thiserror::Error;

use crate::client::refresh::RefreshFailure;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("refresh scope must name at least one topic")]
    EmptyScope,

    #[error("subscription must name at least one topic")]
    EmptySubscription,

    #[error("Invalid topic name: {0:?}")]
    InvalidTopicName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Metadata unavailable: {0}")]
    MetadataUnavailable(#[source] RefreshFailure),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Rejects topic names no broker would accept.
pub(crate) fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 249 || name == "." || name == ".." {
        return Err(Error::InvalidTopicName(name.to_owned()));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::InvalidTopicName(name.to_owned()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_validate_topic_name() {
        validate_topic_name("bananas").unwrap();
        validate_topic_name("__consumer_offsets").unwrap();
        validate_topic_name("a.b-c_d").unwrap();

        assert_matches!(validate_topic_name(""), Err(Error::InvalidTopicName(_)));
        assert_matches!(validate_topic_name(".."), Err(Error::InvalidTopicName(_)));
        assert_matches!(
            validate_topic_name("no spaces"),
            Err(Error::InvalidTopicName(_))
        );
        assert_matches!(
            validate_topic_name(&"x".repeat(250)),
            Err(Error::InvalidTopicName(_))
        );
    }
}
