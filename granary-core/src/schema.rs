//! Warehouse schema model: consolidation, comparison, and per-table diffs
//!
//! Schemas are plain maps (`table → column → type`) so they serialise
//! directly to the JSON `schema` columns carried by uploads and staging
//! files. Comparison is semantic: identifiers are matched case-insensitively
//! because providers disagree on identifier folding.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Column name → column type for one table
pub type TableSchema = BTreeMap<String, String>;

/// Table name → table schema
pub type Schema = BTreeMap<String, TableSchema>;

/// Changes required to reconcile the intended upload schema of one table
/// with the live warehouse schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchemaDiff {
    /// True when any of the other fields is non-empty.
    pub exists: bool,
    /// The table is absent from the warehouse and must be created.
    pub table_to_be_created: bool,
    /// Columns to add (for a new table: the full column set).
    pub column_map: TableSchema,
    /// Existing `string` columns the upload promotes to `text`.
    pub string_columns_to_be_altered_to_text: Vec<String>,
    /// The table schema as it will look once the diff is applied.
    pub updated_schema: TableSchema,
}

/// Widening precedence for conflicting staging-file column types.
fn type_rank(column_type: &str) -> Option<u8> {
    match column_type {
        "int" => Some(1),
        "float" => Some(2),
        "numeric" => Some(3),
        "string" => Some(4),
        _ => None,
    }
}

/// Resolve two observed types for the same column into one.
///
/// Commutative: the result does not depend on which staging file was seen
/// first. `text` is sticky; unrankable conflicts fall back to `string`.
fn widen(a: &str, b: &str) -> String {
    if a == b {
        return a.to_string();
    }
    if a == "text" || b == "text" {
        return "text".to_string();
    }
    match (type_rank(a), type_rank(b)) {
        (Some(ra), Some(rb)) => {
            if ra >= rb {
                a.to_string()
            } else {
                b.to_string()
            }
        }
        _ => "string".to_string(),
    }
}

/// Semantic schema equality: set equality of `(table, column, type)` triples
/// with case-insensitive identifiers.
pub fn schemas_equivalent(a: &Schema, b: &Schema) -> bool {
    fn triples(schema: &Schema) -> HashSet<(String, String, String)> {
        schema
            .iter()
            .flat_map(|(table, columns)| {
                columns.iter().map(move |(column, column_type)| {
                    (
                        table.to_lowercase(),
                        column.to_lowercase(),
                        column_type.to_lowercase(),
                    )
                })
            })
            .collect()
    }
    triples(a) == triples(b)
}

/// Case-insensitive lookup index over a schema.
fn lowered_index(schema: &Schema) -> HashMap<String, HashMap<String, (String, String)>> {
    schema
        .iter()
        .map(|(table, columns)| {
            let cols = columns
                .iter()
                .map(|(column, column_type)| {
                    (
                        column.to_lowercase(),
                        (column.clone(), column_type.clone()),
                    )
                })
                .collect();
            (table.to_lowercase(), cols)
        })
        .collect()
}

/// Consolidate the schemas sampled from a batch of staging files with the
/// schema already known for the warehouse.
///
/// Column sets are unioned per table. A type already present in the
/// warehouse dominates the staging-file observation, with one exception: a
/// column promoted to `text` by the batch stays `text` even where the
/// warehouse still holds `string` (the table loader widens the warehouse
/// column to match). Conflicts between staging files resolve by [`widen`],
/// so the result is independent of staging-file order.
pub fn consolidate_staging_schemas(staging: &[Schema], warehouse: &Schema) -> Schema {
    let warehouse_idx = lowered_index(warehouse);

    let mut consolidated = Schema::new();
    for schema in staging {
        for (table, columns) in schema {
            let merged = consolidated.entry(table.clone()).or_default();
            for (column, column_type) in columns {
                match merged.get(column) {
                    Some(existing) => {
                        let widened = widen(existing, column_type);
                        merged.insert(column.clone(), widened);
                    }
                    None => {
                        merged.insert(column.clone(), column_type.clone());
                    }
                }
            }
        }
    }

    // Warehouse precedence pass, applied after the union so the outcome is
    // insensitive to the order columns were first observed in.
    for (table, columns) in consolidated.iter_mut() {
        let Some(warehouse_cols) = warehouse_idx.get(&table.to_lowercase()) else {
            continue;
        };
        for (column, column_type) in columns.iter_mut() {
            if let Some((_, warehouse_type)) = warehouse_cols.get(&column.to_lowercase()) {
                if !(column_type == "text" && warehouse_type == "string") {
                    *column_type = warehouse_type.clone();
                }
            }
        }
    }

    consolidated
}

/// Compute the diff between the upload schema of `table` and the live
/// warehouse schema.
pub fn table_schema_diff(table: &str, upload: &Schema, warehouse: &Schema) -> TableSchemaDiff {
    let upload_columns = upload.get(table).cloned().unwrap_or_default();

    let warehouse_idx = lowered_index(warehouse);
    let Some(current_cols) = warehouse_idx.get(&table.to_lowercase()) else {
        return TableSchemaDiff {
            exists: !upload_columns.is_empty(),
            table_to_be_created: true,
            updated_schema: upload_columns.clone(),
            column_map: upload_columns,
            string_columns_to_be_altered_to_text: Vec::new(),
        };
    };

    let mut current: TableSchema = current_cols
        .values()
        .map(|(column, column_type)| (column.clone(), column_type.clone()))
        .collect();

    let mut column_map = TableSchema::new();
    let mut to_text = Vec::new();
    for (column, column_type) in &upload_columns {
        match current_cols.get(&column.to_lowercase()) {
            None => {
                column_map.insert(column.clone(), column_type.clone());
            }
            Some((warehouse_name, warehouse_type)) => {
                if warehouse_type == "string" && column_type == "text" {
                    to_text.push(warehouse_name.clone());
                }
            }
        }
    }
    to_text.sort();

    for (column, column_type) in &column_map {
        current.insert(column.clone(), column_type.clone());
    }
    for column in &to_text {
        current.insert(column.clone(), "text".to_string());
    }

    TableSchemaDiff {
        exists: !column_map.is_empty() || !to_text.is_empty(),
        table_to_be_created: false,
        column_map,
        string_columns_to_be_altered_to_text: to_text,
        updated_schema: current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[(&str, &str)]) -> TableSchema {
        columns
            .iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect()
    }

    fn schema(tables: &[(&str, &[(&str, &str)])]) -> Schema {
        tables
            .iter()
            .map(|(name, columns)| (name.to_string(), table(columns)))
            .collect()
    }

    #[test]
    fn test_widening_precedence() {
        assert_eq!(widen("int", "float"), "float");
        assert_eq!(widen("float", "numeric"), "numeric");
        assert_eq!(widen("numeric", "string"), "string");
        assert_eq!(widen("int", "string"), "string");
        assert_eq!(widen("boolean", "boolean"), "boolean");
        // text is sticky
        assert_eq!(widen("string", "text"), "text");
        assert_eq!(widen("text", "int"), "text");
        // unrankable conflicts fall back to string
        assert_eq!(widen("boolean", "datetime"), "string");
    }

    #[test]
    fn test_consolidation_unions_tables_and_columns() {
        let a = schema(&[("events", &[("id", "string")])]);
        let b = schema(&[
            ("events", &[("ts", "datetime")]),
            ("pages", &[("url", "string")]),
        ]);

        let out = consolidate_staging_schemas(&[a, b], &Schema::new());
        assert_eq!(out["events"], table(&[("id", "string"), ("ts", "datetime")]));
        assert_eq!(out["pages"], table(&[("url", "string")]));
    }

    #[test]
    fn test_consolidation_is_order_independent() {
        let a = schema(&[("events", &[("amount", "int")])]);
        let b = schema(&[("events", &[("amount", "float")])]);
        let c = schema(&[("events", &[("amount", "string")])]);

        let forward = consolidate_staging_schemas(&[a.clone(), b.clone(), c.clone()], &Schema::new());
        let backward = consolidate_staging_schemas(&[c, b, a], &Schema::new());
        assert_eq!(forward, backward);
        assert_eq!(forward["events"]["amount"], "string");
    }

    #[test]
    fn test_warehouse_type_dominates() {
        let staging = schema(&[("events", &[("amount", "int")])]);
        let warehouse = schema(&[("events", &[("amount", "float")])]);

        let out = consolidate_staging_schemas(&[staging], &warehouse);
        assert_eq!(out["events"]["amount"], "float");
    }

    #[test]
    fn test_text_promotion_survives_warehouse_string() {
        let staging = schema(&[("events", &[("body", "text")])]);
        let warehouse = schema(&[("events", &[("body", "string")])]);

        let out = consolidate_staging_schemas(&[staging], &warehouse);
        assert_eq!(out["events"]["body"], "text");
    }

    #[test]
    fn test_schemas_equivalent_is_case_insensitive() {
        let a = schema(&[("Events", &[("ID", "string")])]);
        let b = schema(&[("events", &[("id", "string")])]);
        let c = schema(&[("events", &[("id", "int")])]);

        assert!(schemas_equivalent(&a, &b));
        assert!(!schemas_equivalent(&a, &c));
    }

    #[test]
    fn test_diff_creates_missing_table() {
        let upload = schema(&[("events", &[("id", "string"), ("ts", "datetime")])]);

        let diff = table_schema_diff("events", &upload, &Schema::new());
        assert!(diff.exists);
        assert!(diff.table_to_be_created);
        assert_eq!(diff.column_map, upload["events"]);
        assert_eq!(diff.updated_schema, upload["events"]);
    }

    #[test]
    fn test_diff_adds_and_widens_columns() {
        let upload = schema(&[("events", &[("id", "string"), ("body", "text"), ("ts", "datetime")])]);
        let warehouse = schema(&[("events", &[("id", "string"), ("body", "string")])]);

        let diff = table_schema_diff("events", &upload, &warehouse);
        assert!(diff.exists);
        assert!(!diff.table_to_be_created);
        assert_eq!(diff.column_map, table(&[("ts", "datetime")]));
        assert_eq!(diff.string_columns_to_be_altered_to_text, vec!["body"]);
        assert_eq!(diff.updated_schema["body"], "text");
        assert_eq!(diff.updated_schema["ts"], "datetime");
    }

    #[test]
    fn test_diff_empty_when_schemas_agree() {
        let upload = schema(&[("events", &[("id", "string")])]);
        let warehouse = schema(&[("EVENTS", &[("ID", "string")])]);

        let diff = table_schema_diff("events", &upload, &warehouse);
        assert!(!diff.exists);
        assert!(!diff.table_to_be_created);
        assert!(diff.column_map.is_empty());
        assert!(diff.string_columns_to_be_altered_to_text.is_empty());
    }
}
