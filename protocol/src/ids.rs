use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(value)?))
            }
        }
    };
}

uuid_id!(
    /// Identity of one outbox message row.
    MessageId
);
uuid_id!(
    /// Identity of one one-shot timer row.
    TimerId
);
uuid_id!(
    /// Identity of one recurring job definition.
    JobId
);
uuid_id!(
    /// Identity of one materialized run of a job.
    JobRunId
);
uuid_id!(
    /// Identity of one fan-in barrier.
    JoinId
);

/// Identity of a dispatcher instance.
///
/// Generated once per process and stamped into every lease field the
/// dispatcher writes; rows whose token no longer matches are invisible to
/// that dispatcher. Rendered as `host-uuid` so operators can tell instances
/// apart in row dumps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    pub fn generate() -> Self {
        let host = gethostname::gethostname();
        Self(format!("{}-{}", host.to_string_lossy(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}
