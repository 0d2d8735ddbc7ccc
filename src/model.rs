// Cached game records. Only the identity fields are typed; everything else
// the official API returns is carried through untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::query::Identified;
use crate::store::{Cacheable, StoreKey};

/// Official API collections that are mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Towns,
    Nations,
    Players,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [Endpoint::Towns, Endpoint::Nations, Endpoint::Players];

    /// Path segment under `/{map}/`.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Towns => "towns",
            Endpoint::Nations => "nations",
            Endpoint::Players => "players",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// Entry of a listing endpoint: enough to query the full record later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub uuid: String,
    pub name: String,
}

impl Identified for EntityRef {
    fn id(&self) -> &str {
        &self.uuid
    }
}

/// A record type mirrored from one endpoint into one store.
pub trait Record: Cacheable + Identified {
    const ENDPOINT: Endpoint;
    const STORE: StoreKey<Self>;

    /// Mark the record with the time it was fetched.
    fn stamp(&mut self, at: DateTime<Utc>);
}

macro_rules! record {
    ($(#[$doc:meta])* $name:ident, $endpoint:expr, $store:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            pub uuid: String,
            pub name: String,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub fetched_at: Option<DateTime<Utc>>,
            #[serde(flatten)]
            pub extra: Map<String, Value>,
        }

        impl Identified for $name {
            fn id(&self) -> &str {
                &self.uuid
            }
        }

        impl Record for $name {
            const ENDPOINT: Endpoint = $endpoint;
            const STORE: StoreKey<Self> = StoreKey::new($store);

            fn stamp(&mut self, at: DateTime<Utc>) {
                self.fetched_at = Some(at);
            }
        }
    };
}

record!(
    /// A town on one map.
    Town,
    Endpoint::Towns,
    "towns"
);
record!(
    /// A nation (group of towns).
    Nation,
    Endpoint::Nations,
    "nations"
);
record!(
    /// A player known to the server.
    Player,
    Endpoint::Players,
    "players"
);
