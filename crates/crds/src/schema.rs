//! Schema helpers for free-form configuration fields.

use schemars::{Schema, SchemaGenerator, json_schema};

/// Schema for a JSON object whose contents are owned by an external driver.
///
/// Kubernetes structural schemas reject an untyped `true` schema, so the
/// field is declared as an object that keeps unknown fields.
pub fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

/// Same as [`preserve_unknown_fields`] but for a field that may also be null.
pub fn optional_preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    })
}
