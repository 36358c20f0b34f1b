use bson::{Bson, Document};

use crate::error::{BridgeError, ErrorCode, Result};
use crate::value::get_number_as_integer;

/// The fields a find projection extracts. `_id` is implied and goes first
/// unless explicitly excluded.
pub fn extractions_from_projection(projection: &Document) -> Vec<String> {
    let mut extractions = Vec::new();

    if projection.is_empty() {
        return extractions;
    }

    let mut id_seen = false;

    for (key, value) in projection {
        if key.is_empty() {
            continue;
        }

        if key == "_id" {
            id_seen = true;

            let include_id = match value {
                Bson::Int32(i) => *i != 0,
                Bson::Int64(i) => *i != 0,
                Bson::Boolean(b) => *b,
                Bson::Double(d) => *d != 0.0,
                _ => false,
            };

            if !include_id {
                continue;
            }
        }

        extractions.push(key.clone());
    }

    if !id_seen {
        extractions.insert(0, "_id".to_string());
    }

    extractions
}

/// The select list matching a set of extractions; everything when empty.
pub fn columns_from_extractions(extractions: &[String]) -> String {
    if extractions.is_empty() {
        return "doc".to_string();
    }

    extractions
        .iter()
        .map(|e| format!("JSON_EXTRACT(doc, '$.{}')", e))
        .collect::<Vec<String>>()
        .join(", ")
}

/// The ORDER BY value of a sort document; keys must map to 1 or -1.
pub fn order_by_value_from_sort(sort: &Document) -> Result<String> {
    let mut order_by = String::new();

    for (key, value) in sort {
        if key.is_empty() {
            return Err(BridgeError::soft(
                "FieldPath cannot be constructed with empty string",
                ErrorCode::Location40352,
            ));
        }

        let value = get_number_as_integer(value).ok_or_else(|| {
            BridgeError::soft(
                format!("Illegal key in $sort specification: {}", key),
                ErrorCode::Location15974,
            )
        })?;

        if value != 1 && value != -1 {
            return Err(BridgeError::soft(
                "$sort key ordering must be 1 (for ascending) or -1 (for descending)",
                ErrorCode::Location15975,
            ));
        }

        if !order_by.is_empty() {
            order_by.push_str(", ");
        }

        order_by.push_str(&format!("JSON_EXTRACT(doc, '$.{}')", key));

        if value == -1 {
            order_by.push_str(" DESC");
        }
    }

    Ok(order_by)
}

/// The backing table of a collection: a JSON document column and a computed
/// unique `id` over `$._id`.
pub fn table_create_statement(table_name: &str, id_length: i64, if_not_exists: bool) -> String {
    format!(
        "CREATE TABLE {}{} (id VARCHAR({}) AS (JSON_COMPACT(JSON_EXTRACT(doc, \"$._id\"))) \
         UNIQUE KEY, doc JSON, CONSTRAINT id_not_null CHECK(id IS NOT NULL))",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        table_name,
        id_length
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    #[test]
    fn empty_projection_extracts_nothing() {
        assert!(extractions_from_projection(&doc! {}).is_empty());
        assert_eq!(columns_from_extractions(&[]), "doc");
    }

    #[test]
    fn id_is_implied_and_first() {
        let extractions = extractions_from_projection(&doc! {"a": 1, "b": 1});
        assert_eq!(extractions, vec!["_id", "a", "b"]);
    }

    #[test]
    fn id_can_be_excluded() {
        let extractions = extractions_from_projection(&doc! {"a": 1, "_id": 0});
        assert_eq!(extractions, vec!["a"]);

        let extractions = extractions_from_projection(&doc! {"_id": false, "a": 1});
        assert_eq!(extractions, vec!["a"]);
    }

    #[test]
    fn explicit_id_keeps_its_position() {
        let extractions = extractions_from_projection(&doc! {"a": 1, "_id": 1});
        assert_eq!(extractions, vec!["a", "_id"]);
    }

    #[test]
    fn columns_use_json_extract() {
        let columns = columns_from_extractions(&["_id".to_string(), "a.b".to_string()]);
        assert_eq!(
            columns,
            "JSON_EXTRACT(doc, '$._id'), JSON_EXTRACT(doc, '$.a.b')"
        );
    }

    #[test]
    fn sort_ascending_and_descending() {
        let order = order_by_value_from_sort(&doc! {"a": 1, "b": -1}).unwrap();
        assert_eq!(
            order,
            "JSON_EXTRACT(doc, '$.a'), JSON_EXTRACT(doc, '$.b') DESC"
        );
    }

    #[test]
    fn sort_validation() {
        assert!(order_by_value_from_sort(&doc! {"a": 2}).is_err());
        assert!(order_by_value_from_sort(&doc! {"a": "x"}).is_err());
        assert!(order_by_value_from_sort(&doc! {"": 1}).is_err());
    }

    #[test]
    fn create_table_statement() {
        let sql = table_create_statement("d.t", 35, true);
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS d.t (id VARCHAR(35) AS \
             (JSON_COMPACT(JSON_EXTRACT(doc, \"$._id\"))) UNIQUE KEY, doc JSON, CONSTRAINT \
             id_not_null CHECK(id IS NOT NULL))"
        );

        assert!(!table_create_statement("d.t", 35, false).contains("IF NOT EXISTS"));
    }
}
