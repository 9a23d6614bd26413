use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// Typed uuid v7 wrapper; ids of different entities never mix.
macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                Uuid::parse_str(raw)
                    .map(Self)
                    .context(InvalidIdSnafu {
                        stage: "parse-storage-id",
                        id_type: $id_type,
                        raw: raw.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_id!(ConversationId, "conversation-id");
define_storage_id!(NodeId, "node-id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_display_form() {
        let id = NodeId::new_v7();
        let parsed: NodeId = id.to_string().parse().expect("display form parses");
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_garbage_with_typed_context() {
        let error = ConversationId::parse("not-a-uuid").expect_err("garbage must fail");
        match error {
            StorageError::InvalidId { id_type, raw, .. } => {
                assert_eq!(id_type, "conversation-id");
                assert_eq!(raw, "not-a-uuid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
