use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use bson::{Bson, Document};

use crate::error::{BridgeError, ErrorCode, Result};
use crate::protocol::MAX_BSON_OBJECT_SIZE;
use crate::value::{
    double_to_string, element_to_value, escape_essential_chars, get_number_as_double, ValueFor,
};

/// With update operators the correct behavior is not obtained with
/// MAX_BSON_OBJECT_SIZE but with slightly less.
pub const MAX_OPERATOR_SPEC_SIZE: usize = MAX_BSON_OBJECT_SIZE - 6;

const SUPPORTED_OPERATORS: &[&str] = &[
    "$bit",
    "$currentDate",
    "$inc",
    "$max",
    "$min",
    "$mul",
    "$pop",
    "$push",
    "$rename",
    "$set",
    "$unset",
];

pub fn is_supported_operator(name: &str) -> bool {
    SUPPORTED_OPERATORS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// The update specification is an array.
    AggregationPipeline,

    /// Only non-`$` keys; the document replaces the stored one.
    ReplacementDocument,

    /// Only `$`-operator keys.
    UpdateOperators,
}

pub fn update_kind(spec: &Bson) -> Result<UpdateKind> {
    match spec {
        Bson::Array(_) => Ok(UpdateKind::AggregationPipeline),
        Bson::Document(doc) => update_kind_of_document(doc),
        _ => Err(BridgeError::soft(
            "Update argument must be either an object or an array",
            ErrorCode::FailedToParse,
        )),
    }
}

pub fn update_kind_of_document(spec: &Document) -> Result<UpdateKind> {
    if spec.is_empty() {
        return Ok(UpdateKind::ReplacementDocument);
    }

    let mut kind: Option<UpdateKind> = None;

    for (name, _) in spec {
        if name.starts_with('$') {
            match kind {
                None | Some(UpdateKind::UpdateOperators) => {
                    if !is_supported_operator(name) {
                        return Err(BridgeError::soft(
                            format!(
                                "Unknown modifier: {}. Expected a valid update modifier or \
                                 pipeline-style update specified as an array. Currently the only \
                                 supported update operators are: {}",
                                name,
                                SUPPORTED_OPERATORS.join(", ")
                            ),
                            ErrorCode::CommandFailed,
                        ));
                    }

                    kind = Some(UpdateKind::UpdateOperators);
                }
                _ => {
                    return Err(BridgeError::soft(
                        format!(
                            "The dollar ($) prefixed field '{}' in '{}' is not valid for storage.",
                            name, name
                        ),
                        ErrorCode::DollarPrefixedFieldName,
                    ));
                }
            }
        } else {
            match kind {
                None => kind = Some(UpdateKind::ReplacementDocument),
                Some(UpdateKind::ReplacementDocument) => {}
                _ => {
                    return Err(BridgeError::soft(
                        format!(
                            "Unknown modifier: {}. Expected a valid update modifier or \
                             pipeline-style update specified as an array",
                            name
                        ),
                        ErrorCode::FailedToParse,
                    ));
                }
            }
        }
    }

    Ok(kind.unwrap_or(UpdateKind::ReplacementDocument))
}

fn document_byte_size(doc: &Document) -> usize {
    bson::to_vec(doc).map(|v| v.len()).unwrap_or(0)
}

/// The value the `doc` column is set to by an update statement.
pub fn set_value_from_update(update: &Bson) -> Result<String> {
    match update_kind(update)? {
        UpdateKind::AggregationPipeline => Err(BridgeError::hard(
            "Aggregation pipeline not supported",
            ErrorCode::CommandFailed,
        )),
        kind => {
            let Bson::Document(spec) = update else {
                return Err(BridgeError::soft(
                    "Update argument must be either an object or an array",
                    ErrorCode::FailedToParse,
                ));
            };

            set_value_of_kind(kind, spec)
        }
    }
}

pub fn set_value_from_update_specification(spec: &Document) -> Result<String> {
    set_value_of_kind(update_kind_of_document(spec)?, spec)
}

fn set_value_of_kind(kind: UpdateKind, spec: &Document) -> Result<String> {
    match kind {
        UpdateKind::ReplacementDocument => {
            if document_byte_size(spec) > MAX_BSON_OBJECT_SIZE {
                return Err(BridgeError::soft(
                    format!("Document to upsert is larger than {}", MAX_BSON_OBJECT_SIZE),
                    ErrorCode::Location17420,
                ));
            }

            let json = crate::value::bson_to_json_text(&Bson::Document(spec.clone()));
            let json = escape_essential_chars(&json);

            Ok(format!(
                "JSON_SET('{}', '$._id', JSON_EXTRACT(id, '$'))",
                json
            ))
        }
        UpdateKind::UpdateOperators => {
            if document_byte_size(spec) > MAX_OPERATOR_SPEC_SIZE {
                return Err(BridgeError::soft(
                    format!("Document to upsert is larger than {}", MAX_BSON_OBJECT_SIZE),
                    ErrorCode::Location17419,
                ));
            }

            UpdateOperator::default().convert(spec)
        }
        UpdateKind::AggregationPipeline => Err(BridgeError::hard(
            "Aggregation pipeline not supported",
            ErrorCode::CommandFailed,
        )),
    }
}

/// Compiles one update specification, tracking updated paths so that
/// conflicting operators are rejected.
#[derive(Default)]
struct UpdateOperator {
    paths: HashSet<String>,
}

impl UpdateOperator {
    fn convert(mut self, spec: &Document) -> Result<String> {
        let mut rv = "doc".to_string();

        for (name, value) in spec {
            let fields = match value {
                Bson::Document(fields) => fields,
                _ => {
                    return Err(BridgeError::soft(
                        format!(
                            "Modifiers operate on fields but we found type {} instead.",
                            value_type_name(value)
                        ),
                        ErrorCode::FailedToParse,
                    ));
                }
            };

            rv = match name.as_str() {
                "$bit" => self.convert_bit(fields, rv)?,
                "$currentDate" => self.convert_current_date(fields, rv)?,
                "$inc" => self.convert_math_op(fields, rv, "increment", " + ")?,
                "$max" => self.convert_min_max(fields, rv, "$max", " > ")?,
                "$min" => self.convert_min_max(fields, rv, "$min", " < ")?,
                "$mul" => self.convert_math_op(fields, rv, "multiply", " * ")?,
                "$pop" => self.convert_pop(fields, rv)?,
                "$push" => self.convert_push(fields, rv)?,
                "$rename" => self.convert_rename(fields, rv)?,
                "$set" => self.convert_set(fields, rv)?,
                "$unset" => self.convert_unset(fields, rv)?,
                other => {
                    return Err(BridgeError::soft(
                        format!("Unknown modifier: {}", other),
                        ErrorCode::CommandFailed,
                    ));
                }
            };
        }

        rv.push(' ');
        Ok(rv)
    }

    fn convert_set(&mut self, fields: &Document, doc: String) -> Result<String> {
        let mut rv = doc;
        let mut touched = Vec::new();

        for (field, value) in fields {
            let path = self.check_update_path(field)?;
            touched.push(field.clone());

            // JSON_MERGE_PATCH drops fields that are null, so null values
            // need the preserving merge.
            let merge = if matches!(value, Bson::Null) {
                "JSON_MERGE_PRESERVE"
            } else {
                "JSON_MERGE_PATCH"
            };

            let value = element_to_value(value, ValueFor::JsonNested, "$set")?;

            rv = format!("{}({}, {})", merge, rv, set_value(&rv, "", &path, &value));
        }

        self.record(touched);
        Ok(rv)
    }

    fn convert_unset(&mut self, fields: &Document, doc: String) -> Result<String> {
        // JSON_REMOVE(doc, path) returns NULL when the path is absent
        // (MDEV-22141), so every removal is wrapped in an existence check.
        let mut rv = doc;
        let mut touched = Vec::new();

        for (field, _) in fields {
            let key = escape_essential_chars(field);
            touched.push(field.clone());

            rv = format!(
                "IF(JSON_EXTRACT({rv}, '$.{key}') IS NOT NULL, JSON_REMOVE({rv}, '$.{key}'), {rv})",
                rv = rv,
                key = key
            );
        }

        self.record(touched);
        Ok(rv)
    }

    fn convert_math_op(
        &mut self,
        fields: &Document,
        doc: String,
        operation: &str,
        op: &str,
    ) -> Result<String> {
        let mut rv = doc;
        let mut touched = Vec::new();

        for (field, value) in fields {
            let key = get_key(field);
            touched.push(field.clone());

            let Some(d) = get_number_as_double(value) else {
                return Err(BridgeError::soft(
                    format!(
                        "Cannot {} with non-numeric argument: {{{}: {}}}",
                        operation,
                        field,
                        crate::value::bson_to_json_text(value)
                    ),
                    ErrorCode::TypeMismatch,
                ));
            };

            let value = double_to_string(d);
            let modified = format!("JSON_VALUE({}, '$.{}'){}{}", rv, key, op, value);

            rv = format!(
                "IF(JSON_EXTRACT({rv}, '$.{key}') IS NOT NULL, JSON_SET({rv}, '$.{key}', \
                 {modified}), JSON_MERGE_PATCH({rv}, {hierarchy}))",
                rv = rv,
                key = key,
                modified = modified,
                hierarchy = build_document_hierarchy(&key, &value)
            );
        }

        self.record(touched);
        Ok(rv)
    }

    fn convert_min_max(
        &mut self,
        fields: &Document,
        doc: String,
        op_name: &str,
        op: &str,
    ) -> Result<String> {
        let mut rv = doc;
        let mut touched = Vec::new();

        for (field, value) in fields {
            let key = self.check_update_path(field)?;
            touched.push(field.clone());

            if !matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
                return Err(BridgeError::soft(
                    format!(
                        "The {} modifier is currently not compatible with a {}, only NumberInt, \
                         NumberLong and double are supported.",
                        op_name,
                        value_type_name(value)
                    ),
                    ErrorCode::TypeMismatch,
                ));
            }

            let value = element_to_value(value, ValueFor::Sql, op_name)?;

            rv = format!(
                "IF(JSON_VALUE({rv}, '$.{key}') IS NOT NULL AND JSON_VALUE({rv}, '$.{key}'){op}\
                 {value}, {rv}, JSON_SET({rv}, '$.{key}', {value}))",
                rv = rv,
                key = key,
                op = op,
                value = value
            );
        }

        self.record(touched);
        Ok(rv)
    }

    fn convert_bit(&mut self, fields: &Document, doc: String) -> Result<String> {
        let mut rv = doc;
        let mut touched = Vec::new();

        for (field, value) in fields {
            let Bson::Document(ops) = value else {
                return Err(BridgeError::soft(
                    format!(
                        "The $bit modifier is not compatible with a {}. You must pass in an \
                         embedded document: {{$bit: {{field: {{and/or/xor: #}}}}",
                        value_type_name(value)
                    ),
                    ErrorCode::BadValue,
                ));
            };

            if ops.is_empty() {
                return Err(BridgeError::soft(
                    "You must pass in at least one bitwise operation. The format is: {$bit: \
                     {field: {and/or/xor: #}}",
                    ErrorCode::BadValue,
                ));
            }

            for (name, bits) in ops {
                let op = match name.as_str() {
                    "and" => " & ",
                    "or" => " | ",
                    "xor" => " ^ ",
                    other => {
                        return Err(BridgeError::soft(
                            format!(
                                "The $bit modifier only supports 'and', 'or', and 'xor', not \
                                 '{}' which is an unknown operator",
                                other
                            ),
                            ErrorCode::BadValue,
                        ));
                    }
                };

                let bits = match bits {
                    Bson::Int32(i) => *i as i64,
                    Bson::Int64(i) => *i,
                    other => {
                        return Err(BridgeError::soft(
                            format!(
                                "The $bit modifier field must be an Integer(32/64 bit); a '{}' \
                                 is not supported here",
                                value_type_name(other)
                            ),
                            ErrorCode::BadValue,
                        ));
                    }
                };

                let key = self.check_update_path(field)?;
                touched.push(field.clone());

                rv = format!(
                    "IF(JSON_TYPE(JSON_VALUE({rv}, '$.{key}')) = 'INTEGER', JSON_SET({rv}, \
                     '$.{key}', JSON_VALUE({rv}, '$.{key}'){op}{bits}), {rv})",
                    rv = rv,
                    key = key,
                    op = op,
                    bits = bits
                );
            }
        }

        self.record(touched);
        Ok(rv)
    }

    fn convert_current_date(&mut self, fields: &Document, doc: String) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seconds = now.as_secs();
        let milliseconds = now.as_millis() as u64;

        let mut ss = format!("JSON_SET({}", doc);
        let mut touched = Vec::new();

        for (field, value) in fields {
            let key = self.check_update_path(field)?;
            touched.push(field.clone());

            ss.push_str(&format!(", '$.{}', ", key));

            match value {
                Bson::Boolean(_) => {
                    ss.push_str(&format!("JSON_OBJECT(\"$date\", {})", milliseconds));
                }
                Bson::Document(spec) => match spec.get("$type") {
                    Some(Bson::String(what)) if what == "date" => {
                        ss.push_str(&format!("JSON_OBJECT(\"$date\", {})", milliseconds));
                    }
                    Some(Bson::String(what)) if what == "timestamp" => {
                        ss.push_str(&format!(
                            "JSON_OBJECT(\"$timestamp\", JSON_OBJECT(\"t\", {}, \"i\", 0))",
                            seconds
                        ));
                    }
                    _ => {
                        return Err(BridgeError::soft(
                            "The '$type' string field is required to be 'date' or 'timestamp': \
                             {$currentDate: {field : {$type: 'date'}}}",
                            ErrorCode::BadValue,
                        ));
                    }
                },
                other => {
                    return Err(BridgeError::soft(
                        format!(
                            "{} is not valid type for $currentDate. Please use a boolean \
                             ('true') or a $type expression ({{$type: 'timestamp/date'}}).",
                            value_type_name(other)
                        ),
                        ErrorCode::BadValue,
                    ));
                }
            }
        }

        ss.push(')');
        self.record(touched);
        Ok(ss)
    }

    fn convert_pop(&mut self, fields: &Document, doc: String) -> Result<String> {
        let mut rv = doc;
        let mut touched = Vec::new();

        for (field, value) in fields {
            let key = self.check_update_path(field)?;
            touched.push(field.clone());

            let Some(d) = get_number_as_double(value) else {
                return Err(BridgeError::soft(
                    format!("Expected a number: {}: {}", field, value_type_name(value)),
                    ErrorCode::FailedToParse,
                ));
            };

            rv = match d as i64 {
                -1 => format!(
                    "IF(JSON_QUERY({rv}, '$.{key}') IS NOT NULL, JSON_REMOVE({rv}, \
                     '$.{key}[0]'), {rv})",
                    rv = rv,
                    key = key
                ),
                1 => {
                    let length = format!("JSON_LENGTH(JSON_QUERY({}, '$.{}'))", rv, key);
                    let remove = format!("CONCAT('$.{}[', {} - 1, ']')", key, length);

                    format!(
                        "IF(JSON_TYPE(JSON_QUERY({rv}, '$.{key}')) = 'ARRAY' AND {length} > 0, \
                         JSON_REMOVE({rv}, {remove}), {rv})",
                        rv = rv,
                        key = key,
                        length = length,
                        remove = remove
                    )
                }
                _ => {
                    return Err(BridgeError::soft(
                        format!("Expected an integer: {}: {}", field, d),
                        ErrorCode::FailedToParse,
                    ));
                }
            };
        }

        self.record(touched);
        Ok(rv)
    }

    fn convert_push(&mut self, fields: &Document, doc: String) -> Result<String> {
        let mut rv = doc;
        let mut touched = Vec::new();

        for (field, value) in fields {
            let key = self.check_update_path(field)?;
            touched.push(field.clone());

            let (append_values, set_values) = push_values(&key, value)?;

            rv = format!(
                "IF(JSON_QUERY({rv}, '$.{key}') IS NOT NULL, JSON_ARRAY_APPEND({rv}, {append}), \
                 JSON_SET({rv}, {set}))",
                rv = rv,
                key = key,
                append = append_values,
                set = set_values
            );
        }

        self.record(touched);
        Ok(rv)
    }

    fn convert_rename(&mut self, fields: &Document, doc: String) -> Result<String> {
        let mut rv = doc;
        let mut touched = Vec::new();

        for (from, value) in fields {
            let Bson::String(to) = value else {
                return Err(BridgeError::soft(
                    format!("The 'to' field for $rename must be a string: {}", from),
                    ErrorCode::BadValue,
                ));
            };

            if from == to {
                return Err(BridgeError::soft(
                    format!(
                        "The source and target field for $rename must differ: {}: \"{}\"",
                        from, to
                    ),
                    ErrorCode::BadValue,
                ));
            }

            if from.is_empty() || to.is_empty() {
                return Err(BridgeError::soft(
                    "An empty update path is not valid.",
                    ErrorCode::ConflictingUpdateOperators,
                ));
            }

            for path in [from.as_str(), to.as_str()] {
                if path.starts_with('.') || path.ends_with('.') {
                    return Err(BridgeError::soft(
                        format!(
                            "The update path '{}' contains an empty field name, which is not \
                             allowed.",
                            path
                        ),
                        ErrorCode::BadValue,
                    ));
                }
            }

            let from_parts: Vec<&str> = from.split('.').collect();
            let to_parts: Vec<&str> = to.split('.').collect();

            let common = from_parts
                .iter()
                .zip(to_parts.iter())
                .take_while(|(a, b)| a == b)
                .count();

            if common == to_parts.len() || common == from_parts.len() {
                return Err(BridgeError::soft(
                    format!(
                        "The source and target field for $rename must not be on the same path: \
                         {}: \"{}\"",
                        from, to
                    ),
                    ErrorCode::BadValue,
                ));
            }

            if from.contains('$') {
                return Err(BridgeError::soft(
                    format!("The source field for $rename may not be dynamic: {}", from),
                    ErrorCode::BadValue,
                ));
            }

            if to.contains('$') {
                return Err(BridgeError::soft(
                    format!("The destination field for $rename may not be dynamic: {}", to),
                    ErrorCode::BadValue,
                ));
            }

            let t = self.check_update_path(to)?;
            let f = self.check_update_path(from)?;

            let json_set = if to_parts.len() == 1 {
                format!(
                    "JSON_SET({rv}, '$.{t}', JSON_EXTRACT({rv}, '$.{f}'))",
                    rv = rv,
                    t = t,
                    f = f
                )
            } else {
                // When the destination's parent exists, a plain set keeps
                // its sibling fields; otherwise the whole hierarchy must be
                // built up.
                let parent_of_t = t.rsplit_once('.').map(|(p, _)| p).unwrap_or(&t).to_string();
                let parts: Vec<&str> = t.split('.').collect();

                format!(
                    "IF(JSON_QUERY({rv}, '$.{parent}') IS NOT NULL, JSON_SET({rv}, '$.{t}', \
                     JSON_EXTRACT({rv}, '$.{f}')), JSON_SET({rv}, '$.{head}', JSON_OBJECT({nested})))",
                    rv = rv,
                    parent = parent_of_t,
                    t = t,
                    f = f,
                    head = parts[0],
                    nested = rename_hierarchy(&rv, &f, &parts[1..])
                )
            };

            rv = format!(
                "IF(JSON_EXTRACT({rv}, '$.{f}') IS NOT NULL, JSON_REMOVE({set}, '$.{f}'), {rv})",
                rv = rv,
                f = f,
                set = json_set
            );

            touched.push(from.clone());
            touched.push(to.clone());
        }

        self.record(touched);
        Ok(rv)
    }

    fn record(&mut self, touched: Vec<String>) {
        for field in touched {
            self.add_update_path(field);
        }
    }

    fn add_update_path(&mut self, field: String) {
        if let Some(i) = field.find('.') {
            self.paths.insert(field[..i].to_string());
        }

        self.paths.insert(field);
    }

    /// Reject a path that a previous operator already updated, directly or
    /// through its first segment.
    fn check_update_path(&self, field: &str) -> Result<String> {
        if field == "_id" {
            return Err(BridgeError::soft(
                "Performing an update on the path '_id' would modify the immutable field '_id'",
                ErrorCode::ImmutableField,
            ));
        }

        let mut conflict = self.paths.contains(field);

        if !conflict {
            if let Some(i) = field.find('.') {
                let tail = &field[i + 1..];
                let first_tail = tail.split('.').next().unwrap_or(tail);

                if !is_number(first_tail) {
                    conflict = self.paths.contains(&field[..i]);
                }
            }
        }

        if conflict {
            return Err(BridgeError::soft(
                format!(
                    "Updating the path '{}' would create a conflict at '{}'",
                    field, field
                ),
                ErrorCode::ConflictingUpdateOperators,
            ));
        }

        Ok(escape_essential_chars(&get_key(field)))
    }
}

fn value_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Boolean(_) => "bool",
        Bson::Null => "null",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::DateTime(_) => "date",
        Bson::Timestamp(_) => "timestamp",
        Bson::ObjectId(_) => "objectId",
        Bson::RegularExpression(_) => "regex",
        Bson::Binary(_) => "binData",
        _ => "unknown",
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Rewrite numeric path segments into array subscripts: `a.1.b` becomes
/// `a[1].b`.
fn get_key(field: &str) -> String {
    let mut segments = field.split('.');

    let Some(first) = segments.next() else {
        return String::new();
    };

    let mut key = first.to_string();

    for segment in segments {
        if is_number(segment) {
            key.push('[');
            key.push_str(segment);
            key.push(']');
        } else {
            key.push('.');
            key.push_str(segment);
        }
    }

    key
}

/// JSON_OBJECT("a", JSON_OBJECT("b", value)) for the path `a.b`.
fn build_document_hierarchy(key: &str, value: &str) -> String {
    match key.split_once('.') {
        Some((head, tail)) => format!(
            "JSON_OBJECT(\"{}\", {})",
            head,
            build_document_hierarchy(tail, value)
        ),
        None => format!("JSON_OBJECT(\"{}\", {})", key, value),
    }
}

/// The value argument of a $set: nested JSON_OBJECTs down to the leaf, or a
/// JSON_SET when the path is an array subscript.
fn set_value(doc: &str, consumed_path: &str, remaining_path: &str, value: &str) -> String {
    match remaining_path.split_once('.') {
        None => {
            if remaining_path.contains('[') {
                // An array element.
                let path = if consumed_path.is_empty() {
                    remaining_path.to_string()
                } else {
                    format!("{}.{}", consumed_path, remaining_path)
                };

                format!("JSON_SET({}, '$.{}', {})", doc, path, value)
            } else {
                format!("JSON_OBJECT('{}', {})", remaining_path, value)
            }
        }
        Some((name, tail)) => {
            let consumed = if consumed_path.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", consumed_path, name)
            };

            format!(
                "JSON_OBJECT('{}', {})",
                name,
                set_value(doc, &consumed, tail, value)
            )
        }
    }
}

/// The JSON_ARRAY_APPEND and JSON_SET argument lists of a $push.
fn push_values(key: &str, value: &Bson) -> Result<(String, String)> {
    if let Bson::Document(doc) = value {
        if let Some(each) = doc.get("$each") {
            let Bson::Array(elements) = each else {
                return Err(BridgeError::soft(
                    format!(
                        "The argument to $each in $push must be an array but it was of type: {}",
                        value_type_name(each)
                    ),
                    ErrorCode::BadValue,
                ));
            };

            let path = format!("'$.{}'", key);
            let mut append = Vec::new();
            let mut set = Vec::new();

            for element in elements {
                let v = element_to_value(element, ValueFor::JsonNested, "$push")?;
                append.push(format!("{}, {}", path, v));
                set.push(v);
            }

            return Ok((
                append.join(", "),
                format!("{}, JSON_ARRAY({})", path, set.join(", ")),
            ));
        }
    }

    let v = element_to_value(value, ValueFor::JsonNested, "$push")?;

    Ok((
        format!("'$.{}', {}", key, v),
        format!("'$.{}', JSON_ARRAY({})", key, v),
    ))
}

fn rename_hierarchy(rv: &str, f: &str, parts: &[&str]) -> String {
    match parts {
        [last] => format!("\"{}\", JSON_EXTRACT({}, '$.{}')", last, rv, f),
        [head, rest @ ..] => format!(
            "\"{}\", JSON_OBJECT({})",
            head,
            rename_hierarchy(rv, f, rest)
        ),
        [] => String::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn convert(spec: Document) -> String {
        set_value_from_update_specification(&spec).unwrap()
    }

    #[test]
    fn set_produces_merge_patch() {
        let sql = convert(doc! {"$set": {"a": 1}});
        assert!(sql.starts_with("JSON_MERGE_PATCH(doc, JSON_OBJECT('a', 1))"), "{}", sql);
    }

    #[test]
    fn set_null_uses_preserving_merge() {
        let sql = convert(doc! {"$set": {"a": Bson::Null}});
        assert!(sql.contains("JSON_MERGE_PRESERVE"), "{}", sql);
        assert!(!sql.contains("JSON_MERGE_PATCH"), "{}", sql);
    }

    #[test]
    fn set_dotted_path_builds_hierarchy() {
        let sql = convert(doc! {"$set": {"a.b": 2}});
        assert!(
            sql.contains("JSON_OBJECT('a', JSON_OBJECT('b', 2))"),
            "{}",
            sql
        );
    }

    #[test]
    fn set_numeric_segment_uses_subscript() {
        let sql = convert(doc! {"$set": {"a.1": 2}});
        assert!(sql.contains("'$.a[1]'"), "{}", sql);
    }

    #[test]
    fn unset_is_guarded_against_absent_paths() {
        let sql = convert(doc! {"$unset": {"a": 1, "b": 1}});
        assert!(
            sql.contains("IF(JSON_EXTRACT(doc, '$.a') IS NOT NULL, JSON_REMOVE(doc, '$.a'), doc)"),
            "{}",
            sql
        );
        // The second removal operates on the first expression.
        assert!(sql.matches("JSON_REMOVE").count() >= 2, "{}", sql);
    }

    #[test]
    fn inc_on_missing_field_inserts_the_value() {
        // Applying this to {"x": 1} must produce {"x": 1, "y": 5}.
        let sql = convert(doc! {"$inc": {"y": 5}});
        assert!(
            sql.contains("IF(JSON_EXTRACT(doc, '$.y') IS NOT NULL"),
            "{}",
            sql
        );
        assert!(
            sql.contains("JSON_SET(doc, '$.y', JSON_VALUE(doc, '$.y') + 5.0)"),
            "{}",
            sql
        );
        assert!(
            sql.contains("JSON_MERGE_PATCH(doc, JSON_OBJECT(\"y\", 5.0))"),
            "{}",
            sql
        );
    }

    #[test]
    fn mul_missing_field_behaves_like_inc() {
        let sql = convert(doc! {"$mul": {"y": 3}});
        assert!(sql.contains("JSON_VALUE(doc, '$.y') * 3.0"), "{}", sql);
    }

    #[test]
    fn math_op_rejects_non_numeric() {
        let err = set_value_from_update_specification(&doc! {"$inc": {"y": "x"}}).unwrap_err();
        assert!(err.to_string().contains("increment"));
    }

    #[test]
    fn min_max_comparison_guard() {
        let sql = convert(doc! {"$max": {"a": 5}});
        assert!(sql.contains("JSON_VALUE(doc, '$.a') > 5"), "{}", sql);
        assert!(sql.contains("JSON_SET(doc, '$.a', 5)"), "{}", sql);

        assert!(set_value_from_update_specification(&doc! {"$max": {"a": "x"}}).is_err());
    }

    #[test]
    fn bit_requires_integer_ops() {
        let sql = convert(doc! {"$bit": {"a": {"and": 12}}});
        assert!(
            sql.contains("JSON_TYPE(JSON_VALUE(doc, '$.a')) = 'INTEGER'"),
            "{}",
            sql
        );
        assert!(sql.contains("JSON_VALUE(doc, '$.a') & 12"), "{}", sql);

        assert!(set_value_from_update_specification(&doc! {"$bit": {"a": {"nand": 1}}}).is_err());
        assert!(set_value_from_update_specification(&doc! {"$bit": {"a": 1}}).is_err());
        assert!(set_value_from_update_specification(&doc! {"$bit": {"a": {"and": 1.5}}}).is_err());
    }

    #[test]
    fn current_date_forms() {
        let sql = convert(doc! {"$currentDate": {"a": true}});
        assert!(sql.contains("JSON_OBJECT(\"$date\", "), "{}", sql);

        let sql = convert(doc! {"$currentDate": {"a": {"$type": "timestamp"}}});
        assert!(sql.contains("JSON_OBJECT(\"$timestamp\", JSON_OBJECT(\"t\", "), "{}", sql);

        assert!(
            set_value_from_update_specification(&doc! {"$currentDate": {"a": {"$type": "x"}}})
                .is_err()
        );
        assert!(set_value_from_update_specification(&doc! {"$currentDate": {"a": 5}}).is_err());
    }

    #[test]
    fn pop_first_and_last() {
        let sql = convert(doc! {"$pop": {"a": -1}});
        assert!(sql.contains("JSON_REMOVE(doc, '$.a[0]')"), "{}", sql);

        let sql = convert(doc! {"$pop": {"a": 1}});
        assert!(sql.contains("JSON_TYPE(JSON_QUERY(doc, '$.a')) = 'ARRAY'"), "{}", sql);
        assert!(sql.contains("CONCAT('$.a['"), "{}", sql);

        assert!(set_value_from_update_specification(&doc! {"$pop": {"a": 2}}).is_err());
    }

    #[test]
    fn push_appends_or_creates() {
        let sql = convert(doc! {"$push": {"a": 1}});
        assert!(sql.contains("JSON_ARRAY_APPEND(doc, '$.a', 1)"), "{}", sql);
        assert!(sql.contains("JSON_SET(doc, '$.a', JSON_ARRAY(1))"), "{}", sql);
    }

    #[test]
    fn push_each() {
        let sql = convert(doc! {"$push": {"a": {"$each": [1, 2]}}});
        assert!(sql.contains("'$.a', 1, '$.a', 2"), "{}", sql);
        assert!(sql.contains("JSON_ARRAY(1, 2)"), "{}", sql);

        assert!(
            set_value_from_update_specification(&doc! {"$push": {"a": {"$each": 1}}}).is_err()
        );
    }

    #[test]
    fn rename_copies_then_removes() {
        let sql = convert(doc! {"$rename": {"a": "b"}});
        assert!(
            sql.contains("JSON_SET(doc, '$.b', JSON_EXTRACT(doc, '$.a'))"),
            "{}",
            sql
        );
        assert!(sql.contains("JSON_REMOVE("), "{}", sql);
    }

    #[test]
    fn rename_to_nested_path_preserves_siblings() {
        let sql = convert(doc! {"$rename": {"a": "x.y"}});
        assert!(sql.contains("JSON_QUERY(doc, '$.x') IS NOT NULL"), "{}", sql);
        assert!(
            sql.contains("JSON_OBJECT(\"y\", JSON_EXTRACT(doc, '$.a'))"),
            "{}",
            sql
        );
    }

    #[test]
    fn rename_validation() {
        let cases = [
            doc! {"$rename": {"a": "a"}},
            doc! {"$rename": {"a": 1}},
            doc! {"$rename": {"a": ".b"}},
            doc! {"$rename": {"a.b": "a.b.c"}},
            doc! {"$rename": {"a": "$b"}},
            doc! {"$rename": {"a$": "b"}},
        ];

        for case in cases {
            assert!(set_value_from_update_specification(&case).is_err(), "{:?}", case);
        }
    }

    #[test]
    fn id_is_immutable() {
        let err = set_value_from_update_specification(&doc! {"$set": {"_id": 1}}).unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn conflicting_paths_are_rejected() {
        let err =
            set_value_from_update_specification(&doc! {"$set": {"a": 1}, "$min": {"a.b": 2}})
                .unwrap_err();
        assert!(err.to_string().contains("conflict"), "{}", err);

        // Within one operator the same field twice cannot happen (document
        // keys are unique); across operators the exact same path conflicts.
        let err =
            set_value_from_update_specification(&doc! {"$set": {"a": 1}, "$max": {"a": 2}})
                .unwrap_err();
        assert!(err.to_string().contains("conflict"), "{}", err);
    }

    #[test]
    fn numeric_subpath_does_not_conflict_with_parent() {
        // Updating a.1 after a.2 is fine, the paths are distinct elements.
        let sql = convert(doc! {"$set": {"a.1": 1}, "$min": {"a.2": 2}});
        assert!(sql.contains("'$.a[2]'"), "{}", sql);
    }

    #[test]
    fn replacement_document() {
        let sql = convert(doc! {"x": 1});
        assert_eq!(
            sql,
            "JSON_SET('{\"x\":1}', '$._id', JSON_EXTRACT(id, '$'))"
        );
    }

    #[test]
    fn empty_spec_is_a_replacement() {
        let sql = convert(doc! {});
        assert!(sql.starts_with("JSON_SET('{}'"), "{}", sql);
    }

    #[test]
    fn mixed_keys_are_invalid() {
        assert!(set_value_from_update_specification(&doc! {"$set": {"a": 1}, "b": 2}).is_err());
        assert!(set_value_from_update_specification(&doc! {"b": 2, "$set": {"a": 1}}).is_err());
    }

    #[test]
    fn unknown_operator_is_command_failed() {
        let err = set_value_from_update_specification(&doc! {"$frob": {"a": 1}}).unwrap_err();
        assert!(err.to_string().contains("Unknown modifier"));
    }

    #[test]
    fn aggregation_pipeline_is_rejected() {
        let err = set_value_from_update(&Bson::Array(vec![])).unwrap_err();
        assert!(err.to_string().contains("Aggregation pipeline"));
    }

    #[test]
    fn operators_chain_left_to_right() {
        let sql = convert(doc! {"$set": {"a": 1}, "$unset": {"b": 1}});
        // The unset wraps the set expression.
        assert!(sql.trim_end().starts_with("IF(JSON_EXTRACT(JSON_MERGE_PATCH(doc"), "{}", sql);
    }
}
