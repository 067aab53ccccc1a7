//! Bidirectional field-name mapping between the local (camelCase) and the
//! remote (snake_case) record shapes.
//!
//! Nothing outside this module ever sees both conventions. Conversion is
//! recursive through nested objects and arrays, so sale line items are
//! normalized along with the sale itself. Fields the mapping does not know
//! about pass through with only their key spelling adjusted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use shopsync_common::Fields;

/// Explicit field rename that is not a pure case conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAlias {
    pub canonical: String,
    pub remote: String,
}

/// Pure converter between canonical and remote field naming.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldNormalizer {
    #[serde(default)]
    aliases: Vec<FieldAlias>,
}

impl FieldNormalizer {
    /// Normalizer using case conversion only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an explicit rename, applied before case conversion.
    pub fn with_alias(mut self, canonical: impl Into<String>, remote: impl Into<String>) -> Self {
        self.aliases.push(FieldAlias {
            canonical: canonical.into(),
            remote: remote.into(),
        });
        self
    }

    /// Convert a remote-shaped (or already canonical) record to canonical shape.
    pub fn to_canonical(&self, raw: &Fields) -> Fields {
        raw.iter()
            .map(|(key, value)| (self.canonical_key(key), self.canonical_value(value)))
            .collect()
    }

    /// Convert a canonical (or already remote-shaped) record to remote shape.
    pub fn to_remote(&self, canonical: &Fields) -> Fields {
        canonical
            .iter()
            .map(|(key, value)| (self.remote_key(key), self.remote_value(value)))
            .collect()
    }

    /// Canonical spelling of a single field name.
    pub fn canonical_key(&self, key: &str) -> String {
        for alias in &self.aliases {
            if alias.remote == key || alias.canonical == key {
                return alias.canonical.clone();
            }
        }
        snake_to_camel(key)
    }

    /// Remote spelling of a single field name.
    pub fn remote_key(&self, key: &str) -> String {
        for alias in &self.aliases {
            if alias.canonical == key || alias.remote == key {
                return alias.remote.clone();
            }
        }
        camel_to_snake(key)
    }

    fn canonical_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.to_canonical(map)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.canonical_value(v)).collect())
            }
            other => other.clone(),
        }
    }

    fn remote_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.to_remote(map)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.remote_value(v)).collect())
            }
            other => other.clone(),
        }
    }
}

/// `productId` -> `product_id`. A leading capital is lowered without an
/// underscore; non-ASCII characters are left alone.
pub fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `product_id` -> `productId`. Only an underscore followed by a lowercase
/// ASCII letter, and not in leading position, is folded.
pub fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars().peekable();
    let mut first = true;

    while let Some(c) = chars.next() {
        if c == '_' && !first {
            if let Some(next) = chars.peek().copied() {
                if next.is_ascii_lowercase() {
                    chars.next();
                    out.push(next.to_ascii_uppercase());
                    first = false;
                    continue;
                }
            }
        }
        out.push(c);
        first = false;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_key_conversion() {
        assert_eq!(camel_to_snake("productId"), "product_id");
        assert_eq!(camel_to_snake("createdAt"), "created_at");
        assert_eq!(camel_to_snake("total"), "total");
        assert_eq!(snake_to_camel("product_id"), "productId");
        assert_eq!(snake_to_camel("_meta"), "_meta");
        assert_eq!(snake_to_camel("line_2"), "line_2");
    }

    #[test]
    fn test_sale_round_trip_with_nested_items() {
        let normalizer = FieldNormalizer::new();
        let sale = fields(json!({
            "customerId": "c1",
            "total": 500,
            "items": [{"productId": "p1", "unitPrice": 250, "qty": 2}]
        }));

        let remote = normalizer.to_remote(&sale);
        assert_eq!(remote["customer_id"], "c1");
        assert_eq!(remote["items"][0]["unit_price"], 250);

        assert_eq!(normalizer.to_canonical(&remote), sale);
    }

    #[test]
    fn test_idempotence() {
        let normalizer = FieldNormalizer::new();
        let raw = fields(json!({"customer_id": "c1", "createdAt": "x"}));

        let once = normalizer.to_canonical(&raw);
        assert_eq!(normalizer.to_canonical(&once), once);

        let remote = normalizer.to_remote(&once);
        assert_eq!(normalizer.to_remote(&remote), remote);
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let normalizer = FieldNormalizer::new();
        let raw = fields(json!({"légende": 1, "x": null}));
        let canonical = normalizer.to_canonical(&raw);
        assert_eq!(canonical, raw);
    }

    #[test]
    fn test_alias_takes_precedence() {
        let normalizer = FieldNormalizer::new().with_alias("phone", "phone_number");
        let remote = normalizer.to_remote(&fields(json!({"phone": "555"})));
        assert_eq!(remote, fields(json!({"phone_number": "555"})));

        let canonical = normalizer.to_canonical(&remote);
        assert_eq!(canonical, fields(json!({"phone": "555"})));
    }

    fn arb_fields() -> impl Strategy<Value = Fields> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[a-z ]{0,8}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ];
        let value = leaf.prop_recursive(2, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..3).prop_map(Value::Array),
                prop::collection::btree_map("[a-zA-Z_][a-zA-Z0-9_]{0,10}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        });
        prop::collection::btree_map("[a-zA-Z_][a-zA-Z0-9_]{0,10}", value, 0..6)
            .prop_map(|m| m.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_remote_round_trip(x in arb_fields()) {
            let normalizer = FieldNormalizer::new();
            let remote = normalizer.to_remote(&x);
            let again = normalizer.to_remote(&normalizer.to_canonical(&remote));
            prop_assert_eq!(again, remote);
        }

        #[test]
        fn prop_to_canonical_idempotent(x in arb_fields()) {
            let normalizer = FieldNormalizer::new();
            let once = normalizer.to_canonical(&x);
            prop_assert_eq!(normalizer.to_canonical(&once), once);
        }
    }
}
