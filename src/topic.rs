use std::collections::BTreeSet;

/// A topic as listed by [`Client::list_topics`](crate::client::Client::list_topics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub partitions: BTreeSet<i32>,
}
