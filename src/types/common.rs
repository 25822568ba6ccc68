use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-generated correlation id for a subscribe, update or unsubscribe request.
///
/// Ids are issued by a [`SubscriptionRegistry`](crate::live_query::SubscriptionRegistry),
/// start at `1` and never repeat for the lifetime of the issuing client. On the wire
/// they are plain JSON integers.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(transparent)]
pub struct RequestId(pub u32);

impl RequestId {
    pub fn new(value: u32) -> Self {
        RequestId(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for RequestId {
    fn from(value: u32) -> Self {
        RequestId(value)
    }
}
