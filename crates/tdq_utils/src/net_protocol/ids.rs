//! Identifiers exchanged on the wire. All are opaque strings.

use derive_more::{Display, From};
use serde_derive::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }
    };
}

string_id!(
    /// A worker machine, as named in the static fleet configuration.
    WorkerId
);
string_id!(BucketId);
string_id!(
    /// Identifies one client request. Workers generate a fresh one for every bucket fetch.
    RequestId
);
string_id!(JobId);
string_id!(JobGroupId);
