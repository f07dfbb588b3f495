//! Pre-built test data

use granary_core::schema::{Schema, TableSchema};
use granary_core::warehouse::{Destination, DestinationType, Source, Warehouse};

/// A warehouse routing target matching the builders' default ids.
pub fn warehouse(destination_type: DestinationType) -> Warehouse {
    Warehouse {
        source: Source {
            id: "src-1".to_string(),
            name: "Tracking".to_string(),
        },
        destination: Destination {
            id: "dst-1".to_string(),
            name: "Main Warehouse".to_string(),
            config: serde_json::json!({"host": "warehouse.internal"}),
        },
        namespace: "analytics".to_string(),
        destination_type,
    }
}

/// Construct a schema from a literal table/column listing.
pub fn schema(tables: &[(&str, &[(&str, &str)])]) -> Schema {
    tables
        .iter()
        .map(|(name, columns)| {
            let columns: TableSchema = columns
                .iter()
                .map(|(c, t)| (c.to_string(), t.to_string()))
                .collect();
            (name.to_string(), columns)
        })
        .collect()
}

/// The canonical single-table schema used by the happy-path scenarios.
pub fn events_schema() -> Schema {
    schema(&[("events", &[("id", "string"), ("ts", "timestamp")])])
}
