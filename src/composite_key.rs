//! Deterministic dedup keys for queued mutations.
//!
//! A key is the table name followed by the normalised values of that
//! table's identity fields, joined with `|`. Tables without an entry in
//! [`IDENTITY_FIELDS`] fall back to the first three keys of the payload.

use serde_json::Value;

use crate::model::Payload;

pub const SEPARATOR: char = '|';
const FALLBACK_FIELD_COUNT: usize = 3;

/// Identity fields per entity type, in key order.
pub const IDENTITY_FIELDS: &[(&str, &[&str])] = &[
    ("customers", &["name", "phone"]),
    ("invoices", &["customer_id", "total_amount", "created_at"]),
    ("invoice_items", &["invoice_id", "product_id"]),
    ("products", &["name", "sku"]),
    ("inventory", &["product_id", "location"]),
    ("price_lists", &["product_id", "tier"]),
];

pub fn identity_fields(table_name: &str) -> Option<&'static [&'static str]> {
    IDENTITY_FIELDS
        .iter()
        .find(|(table, _)| *table == table_name)
        .map(|(_, fields)| *fields)
}

/// Build the composite key for `(table_name, data)`.
///
/// For unlisted tables the fallback uses the payload's own key order.
/// `serde_json::Map` keeps keys sorted unless `preserve_order` is enabled,
/// so that order is stable here, but the fields it picks are arbitrary and
/// may not identify the entity.
pub fn derive_key(table_name: &str, data: &Payload) -> String {
    let mut key = String::from(table_name);
    match identity_fields(table_name) {
        Some(fields) => {
            for field in fields {
                push_part(&mut key, data.get(*field));
            }
        }
        None => {
            for field in data.keys().take(FALLBACK_FIELD_COUNT) {
                push_part(&mut key, data.get(field));
            }
        }
    }
    key
}

fn push_part(key: &mut String, value: Option<&Value>) {
    key.push(SEPARATOR);
    key.push_str(&normalise(value));
}

fn normalise(value: Option<&Value>) -> String {
    let raw = match value {
        None | Some(Value::Null) => return String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    raw.to_lowercase().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().expect("object payload")
    }

    #[test]
    fn customers_use_name_and_phone() {
        let data = payload(json!({"name": "  Ali ", "phone": "0100", "email": "a@x.com"}));
        assert_eq!(derive_key("customers", &data), "customers|ali|0100");
    }

    #[test]
    fn missing_and_null_fields_become_empty() {
        let data = payload(json!({"customer_id": 7, "total_amount": null}));
        assert_eq!(derive_key("invoices", &data), "invoices|7||");
    }

    #[test]
    fn non_string_values_use_their_json_text() {
        let data = payload(json!({"customer_id": 12, "total_amount": 99.5, "created_at": true}));
        assert_eq!(derive_key("invoices", &data), "invoices|12|99.5|true");
    }

    #[test]
    fn unlisted_table_falls_back_to_first_three_keys() {
        let data = payload(json!({"a": "One", "b": "Two", "c": 3, "d": "ignored"}));
        assert_eq!(derive_key("sessions", &data), "sessions|one|two|3");
    }

    #[test]
    fn empty_payload_on_unlisted_table_is_just_the_table() {
        assert_eq!(derive_key("sessions", &Payload::new()), "sessions");
    }

    proptest! {
        #[test]
        fn extra_fields_do_not_change_the_key(
            name in "[A-Za-z ]{0,12}",
            phone in "[0-9]{0,8}",
            extra in proptest::collection::btree_map("[a-z_]{1,8}", "[a-z0-9]{0,6}", 0..5),
        ) {
            let base = payload(json!({"name": name.clone(), "phone": phone.clone()}));
            let mut noisy = Payload::new();
            for (k, v) in extra {
                if k != "name" && k != "phone" {
                    noisy.insert(k, Value::String(v));
                }
            }
            noisy.insert("phone".into(), Value::String(phone));
            noisy.insert("name".into(), Value::String(name.to_uppercase()));
            prop_assert_eq!(derive_key("customers", &base), derive_key("customers", &noisy));
        }
    }
}
