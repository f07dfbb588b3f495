//! Destination model: warehouse kinds, provider casing, well-known tables

use serde::{Deserialize, Serialize};

/// Table that records discarded rows; it is marked exported even when no
/// load files were produced for it.
pub const DISCARDS_TABLE: &str = "rudder_discards";

/// User-identity tables loaded ahead of the general table fan-out.
pub const IDENTIFIES_TABLE: &str = "identifies";
pub const USERS_TABLE: &str = "users";

/// Identity-resolution tables, loaded by the dedicated identity stage.
pub const IDENTITY_MERGE_RULES_TABLE: &str = "rudder_identity_merge_rules";
pub const IDENTITY_MAPPINGS_TABLE: &str = "rudder_identity_mappings";

/// Kind of analytical warehouse an upload targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    BigQuery,
    Redshift,
    Postgres,
    Snowflake,
    Clickhouse,
}

impl DestinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationType::BigQuery => "bigquery",
            DestinationType::Redshift => "redshift",
            DestinationType::Postgres => "postgres",
            DestinationType::Snowflake => "snowflake",
            DestinationType::Clickhouse => "clickhouse",
        }
    }

    /// Case convention for identifiers on this provider. Snowflake folds
    /// unquoted identifiers to upper case; every other supported provider
    /// stores them as written.
    pub fn provider_case(&self, identifier: &str) -> String {
        match self {
            DestinationType::Snowflake => identifier.to_uppercase(),
            _ => identifier.to_string(),
        }
    }
}

impl std::fmt::Display for DestinationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::convert::TryFrom<&str> for DestinationType {
    type Error = crate::Error;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "bigquery" => Ok(DestinationType::BigQuery),
            "redshift" => Ok(DestinationType::Redshift),
            "postgres" => Ok(DestinationType::Postgres),
            "snowflake" => Ok(DestinationType::Snowflake),
            "clickhouse" => Ok(DestinationType::Clickhouse),
            _ => Err(crate::Error::UnknownDestination(s.to_string())),
        }
    }
}

/// Event source an upload originates from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
}

/// Warehouse destination an upload loads into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub name: String,
    /// Destination-specific connection settings, forwarded opaquely to the
    /// load-file workers.
    pub config: serde_json::Value,
}

/// One (source, destination, namespace) routing target.
///
/// The namespace is the warehouse-side schema/dataset the destination
/// driver operates in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub source: Source,
    pub destination: Destination,
    pub namespace: String,
    pub destination_type: DestinationType,
}

impl Warehouse {
    /// Stable identifier used in logs and metric labels.
    pub fn identifier(&self) -> String {
        format!(
            "{}:{}:{}",
            self.destination_type, self.destination.id, self.namespace
        )
    }

    /// Provider-cased name of the identifies table.
    pub fn identifies_table(&self) -> String {
        self.destination_type.provider_case(IDENTIFIES_TABLE)
    }

    /// Provider-cased name of the users table.
    pub fn users_table(&self) -> String {
        self.destination_type.provider_case(USERS_TABLE)
    }

    /// Provider-cased name of the identity merge-rules table.
    pub fn identity_merge_rules_table(&self) -> String {
        self.destination_type.provider_case(IDENTITY_MERGE_RULES_TABLE)
    }

    /// Provider-cased name of the identity mappings table.
    pub fn identity_mappings_table(&self) -> String {
        self.destination_type.provider_case(IDENTITY_MAPPINGS_TABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_type_round_trip() {
        let kinds = [
            (DestinationType::BigQuery, "bigquery"),
            (DestinationType::Redshift, "redshift"),
            (DestinationType::Postgres, "postgres"),
            (DestinationType::Snowflake, "snowflake"),
            (DestinationType::Clickhouse, "clickhouse"),
        ];
        for (kind, s) in kinds {
            assert_eq!(kind.as_str(), s);
            let parsed: DestinationType = s.try_into().expect("known destination");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_unknown_destination_is_an_error() {
        let result: Result<DestinationType, _> = "teradata".try_into();
        assert!(matches!(result, Err(crate::Error::UnknownDestination(_))));
    }

    #[test]
    fn test_snowflake_upper_cases_identifiers() {
        assert_eq!(
            DestinationType::Snowflake.provider_case("identifies"),
            "IDENTIFIES"
        );
        assert_eq!(
            DestinationType::Postgres.provider_case("identifies"),
            "identifies"
        );
    }
}
