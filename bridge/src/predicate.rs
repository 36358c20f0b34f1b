use bson::{Bson, Document};

use crate::error::{BridgeError, ErrorCode, Result};
use crate::path::{get_incarnations, Incarnation};
use crate::protocol::{alias_to_type_code, type_code, type_code_to_alias};
use crate::value::{
    element_to_value, escape_essential_chars, get_number_as_double, get_number_as_integer,
    ValueFor,
};

/// SQL comparison operators the document operators map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Ne,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Gt => ">",
            Op::Gte => ">=",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Ne => "!=",
        }
    }

    fn from_operator(op: &str) -> Option<Op> {
        match op {
            "$eq" => Some(Op::Eq),
            "$gt" => Some(Op::Gt),
            "$gte" => Some(Op::Gte),
            "$lt" => Some(Op::Lt),
            "$lte" => Some(Op::Lte),
            "$ne" => Some(Op::Ne),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayOp {
    And,
    Or,
}

impl ArrayOp {
    fn description(&self) -> &'static str {
        match self {
            ArrayOp::And => "$all",
            ArrayOp::Or => "$in",
        }
    }
}

/// The WHERE condition matching a filter document; an empty filter matches
/// everything.
pub fn where_condition_from_query(query: &Document) -> Result<String> {
    let condition = get_condition(query)?;

    if condition.is_empty() {
        Ok("true".to_string())
    } else {
        Ok(condition)
    }
}

pub fn where_clause_from_query(query: &Document) -> Result<String> {
    Ok(format!("WHERE {}", where_condition_from_query(query)?))
}

/// A document is an implicit AND of its elements.
fn get_condition(doc: &Document) -> Result<String> {
    let mut wher = String::new();

    for (key, value) in doc {
        let condition = get_element_condition(key, value)?;

        if condition.is_empty() {
            wher.clear();
            break;
        }

        if !wher.is_empty() {
            wher.push_str(" AND ");
        }

        wher.push_str(&condition);
    }

    Ok(wher)
}

fn get_element_condition(key: &str, value: &Bson) -> Result<String> {
    if key.is_empty() {
        return Ok(String::new());
    }

    if key.starts_with('$') {
        get_logical_condition(key, value)
    } else {
        get_comparison_condition(key, value)
    }
}

fn get_array_of_documents<'a>(op: &str, value: &'a Bson) -> Result<&'a bson::Array> {
    let Bson::Array(array) = value else {
        return Err(BridgeError::soft(
            format!("{} must be an array", op),
            ErrorCode::BadValue,
        ));
    };

    if array.is_empty() {
        return Err(BridgeError::soft(
            "$and/$or/$nor must be a nonempty array",
            ErrorCode::BadValue,
        ));
    }

    Ok(array)
}

fn get_logical_condition(key: &str, value: &Bson) -> Result<String> {
    match key {
        "$and" => join_subdocuments(get_array_of_documents(key, value)?, " AND ", ""),
        "$or" => join_subdocuments(get_array_of_documents(key, value)?, " OR ", ""),
        "$nor" => join_subdocuments(get_array_of_documents(key, value)?, " AND ", "NOT "),
        "$alwaysFalse" => {
            check_always_argument(key, value)?;
            Ok("(false)".to_string())
        }
        "$alwaysTrue" => {
            check_always_argument(key, value)?;
            Ok("(true)".to_string())
        }
        _ => Err(BridgeError::soft(
            format!("unknown top level operator: {}", key),
            ErrorCode::BadValue,
        )),
    }
}

fn check_always_argument(key: &str, value: &Bson) -> Result<()> {
    match get_number_as_double(value) {
        Some(d) if d == 1.0 => Ok(()),
        _ => Err(BridgeError::soft(
            format!("Expected a number in: {}: {:?}", key, value),
            ErrorCode::FailedToParse,
        )),
    }
}

fn join_subdocuments(array: &bson::Array, connective: &str, prefix: &str) -> Result<String> {
    let mut condition = String::new();

    for item in array {
        let Bson::Document(doc) = item else {
            return Err(BridgeError::soft(
                "$or/$and/$nor entries need to be full objects",
                ErrorCode::BadValue,
            ));
        };

        let sub_condition = get_condition(doc)?;

        if sub_condition.is_empty() {
            return Ok(String::new());
        }

        if !condition.is_empty() {
            condition.push_str(connective);
        }

        condition.push_str(prefix);
        condition.push_str(&sub_condition);
    }

    Ok(format!("({})", condition))
}

fn is_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit())
}

fn get_comparison_condition(key: &str, value: &Bson) -> Result<String> {
    // `_id` has a computed column of its own.
    if key == "_id" && !matches!(value, Bson::Document(_)) {
        let mut condition = "( id = '".to_string();

        match value {
            Bson::String(s) => {
                let escaped = escape_essential_chars(s);
                condition.push('"');
                condition.push_str(&escaped);
                condition.push('"');
                condition.push('\'');

                if s.len() == 24 && is_hex(s) {
                    // This sure looks like an object id, which is also how a
                    // DBPointer search arrives, so that spelling is covered
                    // as well.
                    condition.push_str(&format!(" OR id = '{{\"$oid\":\"{}\"}}'", escaped));
                }
            }
            other => {
                let json = crate::value::bson_to_json_text(other);
                condition.push_str(&escape_essential_chars(&json));
                condition.push('\'');
            }
        }

        condition.push(')');
        return Ok(condition);
    }

    let paths = get_incarnations(key)?;

    match value {
        Bson::Document(doc) => get_document_condition(&paths, doc),
        value => get_paths_condition(&paths, value),
    }
}

/// OR the single-value condition over every incarnation of the path.
fn get_paths_condition(paths: &[Incarnation], value: &Bson) -> Result<String> {
    let mut condition = String::new();

    if paths.len() > 1 {
        condition.push('(');
    }

    for (i, p) in paths.iter().enumerate() {
        if i > 0 {
            condition.push_str(" OR ");
        }

        condition.push('(');
        condition.push_str(&incarnation_value_condition(p, value)?);
        condition.push(')');
    }

    if paths.len() > 1 {
        condition.push(')');
    }

    Ok(condition)
}

fn get_document_condition(paths: &[Incarnation], doc: &Document) -> Result<String> {
    if doc.is_empty() {
        // Looking for a literal empty object, directly or inside an array.
        let mut condition = String::new();

        for (i, p) in paths.iter().enumerate() {
            if i > 0 {
                condition.push_str(" OR ");
            }

            condition.push_str(&format!(
                "(JSON_EXTRACT(doc, '$.{p}') = JSON_OBJECT() OR \
                 (JSON_TYPE(JSON_EXTRACT(doc, '$.{p}')) = 'ARRAY' AND \
                 JSON_CONTAINS(JSON_EXTRACT(doc, '$.{p}'), JSON_OBJECT())))",
                p = p.path()
            ));
        }

        return Ok(format!("({})", condition));
    }

    let mut condition = String::new();

    if paths.len() > 1 {
        condition.push('(');
    }

    for (i, p) in paths.iter().enumerate() {
        if i > 0 {
            condition.push_str(" OR ");
        }

        condition.push('(');
        condition.push_str(&incarnation_document_condition(p, doc)?);
        condition.push(')');
    }

    if paths.len() > 1 {
        condition.push(')');
    }

    Ok(condition)
}

/// The condition of `{field: value}` for one incarnation.
fn incarnation_value_condition(p: &Incarnation, value: &Bson) -> Result<String> {
    let field = p.path();

    let condition = match value {
        Bson::RegularExpression(regex) => regex_to_condition(p, &regex.pattern, &regex.options),

        Bson::Null => {
            let mut condition = String::new();

            if p.has_array_demand() {
                condition.push_str(&format!(
                    "(JSON_TYPE(JSON_QUERY(doc, '$.{}')) = 'ARRAY' AND ",
                    p.array_path()
                ));
            }

            condition.push_str(&null_condition(field, true));

            if p.has_array_demand() {
                condition.push(')');
            }

            condition
        }

        Bson::DateTime(_) => format!(
            "(JSON_VALUE(doc, '$.{}.$date') = {})",
            field,
            element_to_value(value, ValueFor::Sql, "$eq")?
        ),

        Bson::Timestamp(ts) => timestamp_to_condition(p, Op::Eq, ts),

        _ => {
            // The explicit NULL check keeps the condition correct when a
            // $nor stashes a NOT in front of the whole thing.
            format!(
                "((JSON_QUERY(doc, '$.{f}') IS NOT NULL AND JSON_CONTAINS(JSON_QUERY(doc, \
                 '$.{f}'), {json}) = 1) OR (JSON_VALUE(doc, '$.{f}') = {sql}))",
                f = field,
                json = element_to_value(value, ValueFor::Json, "$eq")?,
                sql = element_to_value(value, ValueFor::Sql, "$eq")?
            )
        }
    };

    Ok(condition)
}

fn null_condition(field: &str, with_equality: bool) -> String {
    let mut condition = format!(
        "(JSON_EXTRACT(doc, '$.{f}') IS NULL OR (JSON_CONTAINS(JSON_QUERY(doc, '$.{f}'), null) \
         = 1)",
        f = field
    );

    if with_equality {
        condition.push_str(&format!(
            " OR (JSON_VALUE(doc, '$.{}') = 'null')",
            field
        ));
    }

    condition.push(')');
    condition
}

/// The condition of `{field: {op: value, ...}}` for one incarnation.
fn incarnation_document_condition(p: &Incarnation, doc: &Document) -> Result<String> {
    let mut rv = String::new();

    // $regex and $options are not independent; the pair compiles once.
    let mut ignore_options = false;
    let mut ignore_regex = false;

    let keys: Vec<&String> = doc.keys().collect();

    for (i, (nosql_op, value)) in doc.iter().enumerate() {
        let condition = if let Some(op) = Op::from_operator(nosql_op) {
            comparison_to_condition(p, op, nosql_op, value)?
        } else {
            match nosql_op.as_str() {
                "$nin" => nin_to_condition(p, value)?,
                "$not" => not_to_condition(p, value)?,
                "$elemMatch" => elem_match_to_condition(p, value)?,
                "$exists" => exists_to_condition(p, value),
                "$size" => format!(
                    "(JSON_LENGTH(doc, '$.{}') = {})",
                    p.path(),
                    element_to_value(value, ValueFor::Sql, "$size")?
                ),
                "$all" => array_op_to_condition(p, value, ArrayOp::And)?,
                "$in" => array_op_to_condition(p, value, ArrayOp::Or)?,
                "$type" => type_to_condition(p, value)?,
                "$mod" => mod_to_condition(p, value)?,
                "$regex" => {
                    if ignore_regex {
                        String::new()
                    } else {
                        let options = keys[i + 1..]
                            .iter()
                            .position(|k| k.as_str() == "$options")
                            .map(|j| {
                                ignore_options = true;
                                doc.get(keys[i + 1 + j].as_str()).unwrap_or(&Bson::Null)
                            });

                        regex_pair_to_condition(p, Some(value), options)?
                    }
                }
                "$options" => {
                    if ignore_options {
                        String::new()
                    } else {
                        let regex = keys[i + 1..]
                            .iter()
                            .position(|k| k.as_str() == "$regex")
                            .map(|j| {
                                ignore_regex = true;
                                doc.get(keys[i + 1 + j].as_str()).unwrap_or(&Bson::Null)
                            });

                        regex_pair_to_condition(p, regex, Some(value))?
                    }
                }
                op if op.starts_with('$') => {
                    return Err(BridgeError::soft(
                        format!("unknown operator: {}", op),
                        ErrorCode::BadValue,
                    ));
                }
                _ => {
                    // Not an operator document after all; the rest of the
                    // document is an object to look for.
                    return object_equality_condition(p, doc.iter().skip(i));
                }
            }
        };

        if !condition.is_empty() {
            if !rv.is_empty() {
                rv.push_str(" AND ");
            }
            rv.push_str(&condition);
        }
    }

    Ok(format!("({})", rv))
}

/// A query like `{"a": {"x": 1}}` looks for the object itself.
fn object_equality_condition<'a>(
    p: &Incarnation,
    entries: impl Iterator<Item = (&'a String, &'a Bson)>,
) -> Result<String> {
    let mut members = String::new();

    for (i, (key, value)) in entries.enumerate() {
        if i > 0 {
            members.push_str(", ");
        }

        members.push_str(&format!(
            "\"{}\", {}",
            key,
            element_to_value(value, ValueFor::JsonNested, "$eq")?
        ));
    }

    Ok(format!(
        "JSON_CONTAINS(JSON_QUERY(doc, '$.{}'), JSON_OBJECT({}))",
        p.path(),
        members
    ))
}

fn comparison_to_condition(p: &Incarnation, op: Op, nosql_op: &str, value: &Bson) -> Result<String> {
    if matches!(value, Bson::Null) && matches!(op, Op::Eq | Op::Ne) {
        let field = p.path();

        let rv = if op == Op::Eq {
            null_condition(field, true)
        } else {
            format!(
                "(JSON_EXTRACT(doc, '$.{f}') IS NOT NULL AND (JSON_CONTAINS(JSON_QUERY(doc, \
                 '$.{f}'), 'null') = 0) OR (JSON_VALUE(doc, '$.{f}') != 'null'))",
                f = field
            )
        };

        return Ok(rv);
    }

    let path = match value {
        Bson::Binary(_) => format!("{}.$binary", p.path()),
        Bson::DateTime(_) => format!("{}.$date", p.path()),
        Bson::JavaScriptCode(_) => format!("{}.$code", p.path()),
        Bson::Timestamp(ts) => {
            return Ok(timestamp_to_condition(p, op, ts));
        }
        Bson::RegularExpression(regex) => {
            if nosql_op != "$eq" {
                return Err(BridgeError::soft(
                    format!("Can't have regex as arg to {}", nosql_op),
                    ErrorCode::BadValue,
                ));
            }

            return Ok(regex_to_condition(p, &regex.pattern, &regex.options));
        }
        _ => p.path().to_string(),
    };

    let value_str = element_to_value(value, ValueFor::Sql, nosql_op)?;

    let rv = if op == Op::Ne {
        format!(
            "(JSON_EXTRACT(doc, '$.{p}') IS NULL OR (JSON_EXTRACT(doc, '$.{p}') {op} {v}))",
            p = path,
            op = op.as_str(),
            v = value_str
        )
    } else {
        format!(
            "(JSON_EXTRACT(doc, '$.{p}') IS NOT NULL AND (JSON_EXTRACT(doc, '$.{p}') {op} {v}))",
            p = path,
            op = op.as_str(),
            v = value_str
        )
    };

    Ok(rv)
}

/// Ordering over the `(t, i)` pair of a timestamp value.
fn timestamp_to_condition(p: &Incarnation, op: Op, ts: &bson::Timestamp) -> String {
    let f = format!("$.{}.$timestamp", p.path());
    let mut rv = format!("(JSON_QUERY(doc, '{}') IS NOT NULL AND ", f);

    match op {
        Op::Eq | Op::Ne => {
            rv.push_str(&format!(
                "JSON_VALUE(doc, '{f}.t') {op} {t} AND JSON_VALUE(doc, '{f}.i') {op} {i}",
                f = f,
                op = op.as_str(),
                t = ts.time,
                i = ts.increment
            ));
        }
        Op::Lt | Op::Gt => {
            rv.push_str(&format!(
                "JSON_VALUE(doc, '{}.t') {} {}",
                f,
                op.as_str(),
                ts.time
            ));
        }
        Op::Lte => {
            rv.push_str(&format!(
                "(JSON_VALUE(doc, '{f}.t') < {t} OR (JSON_VALUE(doc, '{f}.t') = {t} AND \
                 JSON_VALUE(doc, '{f}.i') = {i}))",
                f = f,
                t = ts.time,
                i = ts.increment
            ));
        }
        Op::Gte => {
            rv.push_str(&format!(
                "(JSON_VALUE(doc, '{f}.t') > {t} OR (JSON_VALUE(doc, '{f}.t') = {t} AND \
                 JSON_VALUE(doc, '{f}.i') = {i}))",
                f = f,
                t = ts.time,
                i = ts.increment
            ));
        }
    }

    rv.push(')');
    rv
}

fn regex_pair_to_condition(
    p: &Incarnation,
    regex: Option<&Bson>,
    options: Option<&Bson>,
) -> Result<String> {
    let Some(regex) = regex else {
        return Err(BridgeError::soft(
            "$options needs a $regex",
            ErrorCode::BadValue,
        ));
    };

    let Bson::String(pattern) = regex else {
        return Err(BridgeError::soft(
            "$regex has to be a string",
            ErrorCode::BadValue,
        ));
    };

    let options = match options {
        Some(Bson::String(o)) => o.clone(),
        Some(_) => {
            return Err(BridgeError::soft(
                "$options has to be a string",
                ErrorCode::BadValue,
            ));
        }
        None => String::new(),
    };

    Ok(regex_to_condition(p, pattern, &options))
}

fn regex_to_condition(p: &Incarnation, pattern: &str, options: &str) -> String {
    let mut compiled = String::new();

    if !options.is_empty() {
        compiled.push_str(&format!("(?{})", options));
    }

    compiled.push_str(pattern);

    // A stored regex value matches its own spelling, a string value matches
    // the pattern.
    format!(
        "(JSON_VALUE(doc, '$.{f}') REGEXP '{re}' OR (JSON_QUERY(doc, '$.{f}') IS NOT NULL AND \
         JSON_COMPACT(JSON_QUERY(doc, '$.{f}')) = JSON_COMPACT(JSON_OBJECT(\"$regex\", \
         \"{pattern}\", \"$options\", \"{options}\"))))",
        f = p.path(),
        re = escape_essential_chars(&compiled),
        pattern = pattern,
        options = options
    )
}

fn nin_to_condition(p: &Incarnation, value: &Bson) -> Result<String> {
    let Bson::Array(array) = value else {
        return Err(BridgeError::soft("$nin needs an array", ErrorCode::BadValue));
    };

    let mut values = Vec::new();

    for element in array {
        values.push(element_to_value(element, ValueFor::Sql, "$nin")?);
    }

    if values.is_empty() {
        return Ok("(true)".to_string());
    }

    Ok(format!(
        "(JSON_EXTRACT(doc, '$.{f}') IS NULL OR JSON_EXTRACT(doc, '$.{f}') NOT IN ({values}))",
        f = p.path(),
        values = values.join(", ")
    ))
}

fn not_to_condition(p: &Incarnation, value: &Bson) -> Result<String> {
    match value {
        Bson::Document(doc) => {
            if doc.is_empty() {
                return Err(BridgeError::soft("$not cannot be empty", ErrorCode::BadValue));
            }

            Ok(format!("(NOT {})", incarnation_document_condition(p, doc)?))
        }
        Bson::RegularExpression(regex) => Ok(format!(
            "(NOT {})",
            regex_to_condition(p, &regex.pattern, &regex.options)
        )),
        _ => Err(BridgeError::soft(
            "$not needs a document or a regex",
            ErrorCode::BadValue,
        )),
    }
}

fn elem_match_to_condition(p: &Incarnation, value: &Bson) -> Result<String> {
    let Bson::Document(doc) = value else {
        return Err(BridgeError::soft(
            "$elemMatch needs an Object",
            ErrorCode::BadValue,
        ));
    };

    if doc.is_empty() {
        return Ok("true".to_string());
    }

    let mut condition = String::new();

    for (key, element) in doc {
        if !condition.is_empty() {
            condition.push_str(" AND ");
        }

        condition.push_str(&elem_match_member(p, key, element)?);
    }

    Ok(format!("({})", condition))
}

fn elem_match_member(p: &Incarnation, key: &str, element: &Bson) -> Result<String> {
    if key.starts_with('$') {
        let value = match key {
            "$eq" => "1",
            "$ne" => "0",
            _ => {
                return Err(BridgeError::soft(
                    "$elemMatch supports only operators $eq and $ne",
                    ErrorCode::BadValue,
                ));
            }
        };

        return Ok(format!(
            "(JSON_CONTAINS(doc, {}, '$.{}') = {})",
            element_to_value(element, ValueFor::Json, "$elemMatch")?,
            p.path(),
            value
        ));
    }

    match element {
        Bson::Document(inner) => {
            // {field: {$eq/$ne: value}} nested inside the match.
            let mut rv = String::new();

            if inner.is_empty() {
                return Ok("false".to_string());
            }

            for (op, value) in inner {
                let expected = match op.as_str() {
                    "$eq" => "1",
                    "$ne" => "0",
                    _ => {
                        return Err(BridgeError::soft(
                            "$elemMatch supports only operators $eq and $ne",
                            ErrorCode::BadValue,
                        ));
                    }
                };

                rv = format!(
                    "(JSON_CONTAINS(doc, JSON_OBJECT(\"{}\", {}), '$.{}') = {})",
                    key,
                    element_to_value(value, ValueFor::JsonNested, "$elemMatch")?,
                    p.path(),
                    expected
                );
            }

            Ok(rv)
        }
        _ => {
            let mut rv = format!(
                "(JSON_CONTAINS(doc, JSON_OBJECT(\"{}\", {}), '$.{}') = 1)",
                key,
                element_to_value(element, ValueFor::JsonNested, "$elemMatch")?,
                p.path()
            );

            if matches!(element, Bson::Null) {
                rv.push_str(&format!(
                    " OR (JSON_EXTRACT(doc, '$.{}.{}') IS NULL)",
                    p.path(),
                    key
                ));
            }

            Ok(rv)
        }
    }
}

fn relaxed_bool(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(i) => *i != 0,
        Bson::Int64(i) => *i != 0,
        Bson::Double(d) => *d != 0.0,
        Bson::Null => false,
        _ => true,
    }
}

fn exists_to_condition(p: &Incarnation, value: &Bson) -> String {
    let mut rv = "(".to_string();

    if relaxed_bool(value) {
        rv.push_str(&format!("JSON_EXTRACT(doc, '$.{}') IS NOT NULL", p.path()));
    } else {
        let mut close = false;

        if !p.has_array_demand() {
            if p.has_parent() {
                // The parent must be an object for the absence to count.
                rv.push_str(&format!(
                    "JSON_QUERY(doc, '$.{pp}') IS NULL OR (JSON_TYPE(JSON_EXTRACT(doc, \
                     '$.{pp}')) = 'OBJECT' AND ",
                    pp = p.parent_path()
                ));
                close = true;
            }
        } else {
            rv.push_str(&format!(
                "JSON_TYPE(JSON_QUERY(doc, '$.{}')) = 'ARRAY' AND ",
                p.array_path()
            ));
        }

        rv.push_str(&format!("JSON_EXTRACT(doc, '$.{}') IS NULL", p.path()));

        if close {
            rv.push(')');
        }
    }

    rv.push(')');
    rv
}

fn mod_to_condition(p: &Incarnation, value: &Bson) -> Result<String> {
    let Bson::Array(arguments) = value else {
        return Err(BridgeError::soft(
            "malformed mod, needs to be an array",
            ErrorCode::BadValue,
        ));
    };

    match arguments.len() {
        0 | 1 => {
            return Err(BridgeError::soft(
                "malformed mod, not enough elements",
                ErrorCode::BadValue,
            ));
        }
        2 => {}
        _ => {
            return Err(BridgeError::soft(
                "malformed mod, too many elements",
                ErrorCode::BadValue,
            ));
        }
    }

    let divisor = get_number_as_integer(&arguments[0]).ok_or_else(|| {
        BridgeError::soft("malformed mod, divisor is not a number", ErrorCode::BadValue)
    })?;

    if divisor == 0 {
        return Err(BridgeError::soft("divisor cannot be 0", ErrorCode::BadValue));
    }

    let remainder = get_number_as_integer(&arguments[1]).ok_or_else(|| {
        BridgeError::soft(
            "malformed mod, remainder is not a number",
            ErrorCode::BadValue,
        )
    })?;

    Ok(format!(
        "((JSON_TYPE(JSON_VALUE(doc, '$.{f}')) = 'INTEGER' || JSON_TYPE(JSON_VALUE(doc, \
         '$.{f}')) = 'DOUBLE') AND (MOD(JSON_VALUE(doc, '$.{f}'), {divisor}) = {remainder}))",
        f = p.path(),
        divisor = divisor,
        remainder = remainder
    ))
}

fn type_to_condition(p: &Incarnation, value: &Bson) -> Result<String> {
    if let Bson::Array(elements) = value {
        if elements.is_empty() {
            // Yes, this is the message the protocol mandates.
            return Err(BridgeError::soft(
                "a must match at least one type",
                ErrorCode::FailedToParse,
            ));
        }

        let mut rv = "(".to_string();

        for (i, element) in elements.iter().enumerate() {
            if i > 0 {
                rv.push_str(" OR ");
            }

            rv.push_str(&single_type_to_condition(p, element)?);
        }

        rv.push(')');
        return Ok(rv);
    }

    single_type_to_condition(p, value)
}

fn single_type_to_condition(p: &Incarnation, value: &Bson) -> Result<String> {
    let code = match value {
        Bson::String(alias) => {
            if alias == "number" {
                return Ok(format!(
                    "(JSON_TYPE(JSON_EXTRACT(doc, '$.{f}')) = 'DOUBLE' OR \
                     JSON_TYPE(JSON_EXTRACT(doc, '$.{f}')) = 'INTEGER')",
                    f = p.path()
                ));
            }

            alias_to_type_code(alias).ok_or_else(|| {
                BridgeError::soft(
                    format!("Unknown type name alias: {}", alias),
                    ErrorCode::BadValue,
                )
            })?
        }
        Bson::Double(d) => {
            let code = *d as i32;
            if *d != code as f64 {
                return Err(BridgeError::soft(
                    format!("Invalid numerical type code: {}", d),
                    ErrorCode::BadValue,
                ));
            }
            code
        }
        Bson::Int32(i) => *i,
        Bson::Int64(i) => *i as i32,
        _ => {
            return Err(BridgeError::soft(
                "type must be represented as a number or a string",
                ErrorCode::TypeMismatch,
            ));
        }
    };

    type_code_to_condition(p, code)
}

fn type_code_to_condition(p: &Incarnation, code: i32) -> Result<String> {
    let f = p.path();

    let rv = match code {
        type_code::BIN_DATA => format!(
            "(JSON_TYPE(JSON_EXTRACT(doc, '$.{f}.$binary')) = 'STRING' AND \
             JSON_TYPE(JSON_EXTRACT(doc, '$.{f}.$type')) = 'STRING')",
            f = f
        ),
        type_code::DATE => format!(
            "(JSON_TYPE(JSON_EXTRACT(doc, '$.{}.$date')) = 'INTEGER')",
            f
        ),
        type_code::JAVASCRIPT | type_code::JAVASCRIPT_SCOPE => format!(
            "(JSON_TYPE(JSON_EXTRACT(doc, '$.{}.$code')) = 'STRING')",
            f
        ),
        type_code::REGEX => format!(
            "(JSON_TYPE(JSON_EXTRACT(doc, '$.{f}.$regex')) = 'STRING' AND \
             JSON_TYPE(JSON_EXTRACT(doc, '$.{f}.$options')) = 'STRING')",
            f = f
        ),
        type_code::TIMESTAMP => format!(
            "(JSON_TYPE(JSON_EXTRACT(doc, '$.{f}.$timestamp.t')) = 'INTEGER' AND \
             JSON_TYPE(JSON_EXTRACT(doc, '$.{f}.$timestamp.i')) = 'INTEGER')",
            f = f
        ),
        type_code::UNDEFINED => format!(
            "(JSON_TYPE(JSON_EXTRACT(doc, '$.{}.$undefined')) = 'BOOLEAN')",
            f
        ),
        _ => format!(
            "(JSON_TYPE(JSON_EXTRACT(doc, '$.{}')) = {})",
            f,
            simple_type_name(code)?
        ),
    };

    Ok(rv)
}

fn simple_type_name(code: i32) -> Result<&'static str> {
    let name = match code {
        type_code::DOUBLE => "'DOUBLE'",
        type_code::STRING => "'STRING'",
        type_code::OBJECT => "'OBJECT'",
        type_code::ARRAY => "'ARRAY'",
        type_code::BOOL => "'BOOLEAN'",
        type_code::NULL => "'NULL'",
        type_code::INT32 | type_code::INT64 => "'INTEGER'",
        type_code::OBJECT_ID
        | type_code::DB_POINTER
        | type_code::SYMBOL
        | type_code::DECIMAL128
        | type_code::MIN_KEY
        | type_code::MAX_KEY => {
            return Err(BridgeError::soft(
                format!(
                    "Unsupported type code: {} (\"{}\")",
                    code,
                    type_code_to_alias(code)
                ),
                ErrorCode::BadValue,
            ));
        }
        _ => {
            return Err(BridgeError::soft(
                format!("Invalid numerical type code: {}", code),
                ErrorCode::BadValue,
            ));
        }
    };

    Ok(name)
}

/// Insert `[*]` in front of the last path segment: `a.x` becomes `a[*].x`.
fn scoped_array_path(field: &str) -> Option<String> {
    field
        .rfind('.')
        .map(|i| format!("{}[*].{}", &field[..i], &field[i + 1..]))
}

fn array_op_to_condition(p: &Incarnation, value: &Bson, array_op: ArrayOp) -> Result<String> {
    let description = array_op.description();

    let Bson::Array(all_elements) = value else {
        return Err(BridgeError::soft(
            format!("{} needs an array", description),
            ErrorCode::BadValue,
        ));
    };

    if all_elements.is_empty() {
        return Ok("(true = false)".to_string());
    }

    let field = p.path();
    let scoped = scoped_array_path(field);

    let rv = match array_op {
        ArrayOp::And => {
            let mut ss = "(".to_string();

            match &scoped {
                Some(alternative) => {
                    ss.push('(');
                    ss.push_str(&element_array_condition(field, true, description, all_elements)?);
                    ss.push_str(" OR ");
                    ss.push_str(&element_array_condition(
                        alternative,
                        true,
                        description,
                        all_elements,
                    )?);
                    ss.push(')');
                }
                None => {
                    ss.push_str(&element_array_condition(field, false, description, all_elements)?);
                }
            }

            ss.push(')');
            ss
        }
        ArrayOp::Or => {
            let mut ss = "((".to_string();

            for (i, one_element) in all_elements.iter().enumerate() {
                if i > 0 {
                    ss.push_str(" OR ");
                }

                match one_element {
                    Bson::Null => {
                        ss.push_str(&format!("(JSON_EXTRACT(doc, '$.{}') IS NULL)", field));
                    }
                    Bson::RegularExpression(_) => {
                        ss.push_str("(false)");
                    }
                    _ => match &scoped {
                        Some(alternative) => {
                            ss.push('(');

                            for (j, path) in [field, alternative.as_str()].iter().enumerate() {
                                if j > 0 {
                                    ss.push_str(" OR ");
                                }

                                ss.push_str(&format!(
                                    "(JSON_CONTAINS(JSON_EXTRACT(doc, '$.{}'), JSON_ARRAY({})) \
                                     = 1)",
                                    path,
                                    element_to_value(one_element, ValueFor::JsonNested, description)?
                                ));

                                if !matches!(one_element, Bson::Document(_)) {
                                    ss.push_str(&format!(
                                        " OR (JSON_VALUE(doc, '$.{}') = {})",
                                        path,
                                        element_to_value(one_element, ValueFor::Sql, description)?
                                    ));
                                }
                            }

                            ss.push(')');
                        }
                        None => {
                            ss.push_str(&format!(
                                "(JSON_CONTAINS(doc, JSON_ARRAY({}), '$.{}') = 1)",
                                element_to_value(one_element, ValueFor::JsonNested, description)?,
                                field
                            ));

                            if !matches!(one_element, Bson::Document(_)) {
                                ss.push_str(&format!(
                                    " OR (JSON_VALUE(doc, '$.{}') = {})",
                                    field,
                                    element_to_value(one_element, ValueFor::Sql, description)?
                                ));
                            }
                        }
                    },
                }
            }

            ss.push_str("))");
            ss
        }
    };

    Ok(rv)
}

/// The containment check of `$all`: the stored array must contain every
/// listed value.
fn element_array_condition(
    field: &str,
    is_scoped: bool,
    description: &str,
    all_elements: &bson::Array,
) -> Result<String> {
    let mut elem_matches: Vec<&Document> = Vec::new();
    let mut values = Vec::new();
    let mut is_null = false;

    let is_single = all_elements.len() == 1;

    for one_element in all_elements {
        match one_element {
            Bson::Null => is_null = true,
            // Regexes are not values to be compared.
            Bson::RegularExpression(_) => {}
            Bson::Document(doc) => match doc.get("$elemMatch") {
                Some(Bson::Document(inner)) => elem_matches.push(inner),
                Some(_) => {
                    return Err(BridgeError::soft(
                        "$elemMatch needs an Object",
                        ErrorCode::BadValue,
                    ));
                }
                None => {
                    values.push(element_to_value(one_element, ValueFor::JsonNested, description)?)
                }
            },
            _ => values.push(element_to_value(one_element, ValueFor::JsonNested, description)?),
        }
    }

    let mut ss = "(JSON_CONTAINS(".to_string();

    if is_scoped {
        // JSON_EXTRACT with a wildcard path collects the scoped values into
        // one array, which is what the containment must run against.
        ss.push_str(&format!(
            "JSON_EXTRACT(doc, '$.{}'), JSON_ARRAY({})) = 1",
            field,
            values.join(", ")
        ));
    } else {
        ss.push_str(&format!(
            "doc, JSON_ARRAY({}), '$.{}') = 1",
            values.join(", "),
            field
        ));
    }

    // With [*][*] e.g. [[2]] is excluded when looking for [2].
    ss.push_str(&format!(
        " AND JSON_EXTRACT(doc, '$.{}[*][*]') IS NULL",
        field
    ));

    for elem_match in &elem_matches {
        for (key, value) in elem_match.iter() {
            ss.push_str(&format!(
                " AND (JSON_TYPE(JSON_EXTRACT(doc, '$.{f}')) = 'ARRAY' AND \
                 ((JSON_CONTAINS(JSON_EXTRACT(doc, '$.{f}[*]'), JSON_OBJECT(\"{k}\", {v})) = 1) \
                 OR (JSON_QUERY(doc, '$.{f}[*]') IS NOT NULL AND JSON_EXTRACT(doc, \
                 '$.{f}[*].{k}') IS NULL)))",
                f = field,
                k = key,
                v = element_to_value(value, ValueFor::JsonNested, description)?
            ));
        }
    }

    ss.push(')');

    if is_single {
        if let Some(element) = all_elements.first() {
            if !matches!(element, Bson::Document(_)) && !matches!(element, Bson::Null) {
                ss.push_str(&format!(
                    " OR (JSON_VALUE(doc, '$.{}') = {})",
                    field,
                    element_to_value(element, ValueFor::Sql, description)?
                ));
            }
        }
    }

    if is_null {
        ss.push_str(&format!(" OR (JSON_EXTRACT(doc, '$.{}') IS NULL)", field));
    }

    Ok(ss)
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::{bson, doc};

    fn condition(filter: Document) -> String {
        where_condition_from_query(&filter).unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert_eq!(condition(doc! {}), "true");
    }

    #[test]
    fn dotted_path_equality_enumerates_incarnations() {
        // Scenario: {"a.b": 1} matches both the object member and the
        // member of objects inside an array.
        let sql = condition(doc! {"a.b": 1});

        assert!(sql.contains("JSON_VALUE(doc, '$.a.b') = 1"), "{}", sql);
        assert!(sql.contains("JSON_VALUE(doc, '$.a[*].b') = 1"), "{}", sql);
        assert!(sql.contains(" OR "), "{}", sql);
    }

    #[test]
    fn implicit_and_of_elements() {
        let sql = condition(doc! {"a": 1, "b": 2});
        assert!(sql.contains(" AND "), "{}", sql);
    }

    #[test]
    fn logical_operators() {
        let sql = condition(doc! {"$or": [{"a": 1}, {"b": 2}]});
        assert!(sql.contains(" OR "), "{}", sql);

        let sql = condition(doc! {"$nor": [{"a": 1}]});
        assert!(sql.contains("NOT "), "{}", sql);

        assert_eq!(condition(doc! {"$alwaysTrue": 1}), "(true)");
        assert_eq!(condition(doc! {"$alwaysFalse": 1}), "(false)");
    }

    #[test]
    fn logical_operator_validation() {
        assert!(where_condition_from_query(&doc! {"$and": 1}).is_err());
        assert!(where_condition_from_query(&doc! {"$and": []}).is_err());
        assert!(where_condition_from_query(&doc! {"$and": [1]}).is_err());
        assert!(where_condition_from_query(&doc! {"$alwaysTrue": 2}).is_err());
        assert!(where_condition_from_query(&doc! {"$frob": 1}).is_err());
    }

    #[test]
    fn id_fast_path() {
        let sql = condition(doc! {"_id": "abc"});
        assert_eq!(sql, "( id = '\"abc\"')");

        let sql = condition(doc! {"_id": 7});
        assert_eq!(sql, "( id = '7')");
    }

    #[test]
    fn id_hex_string_also_matches_object_id() {
        let hex = "0123456789abcdef01234567";
        let sql = condition(doc! {"_id": hex});
        assert!(sql.contains(&format!("OR id = '{{\"$oid\":\"{}\"}}'", hex)), "{}", sql);
    }

    #[test]
    fn comparison_operators() {
        let sql = condition(doc! {"a": {"$gt": 5}});
        assert!(
            sql.contains("JSON_EXTRACT(doc, '$.a') IS NOT NULL AND (JSON_EXTRACT(doc, '$.a') > 5)"),
            "{}",
            sql
        );

        let sql = condition(doc! {"a": {"$ne": 5}});
        assert!(
            sql.contains("JSON_EXTRACT(doc, '$.a') IS NULL OR (JSON_EXTRACT(doc, '$.a') != 5)"),
            "{}",
            sql
        );
    }

    #[test]
    fn eq_null_checks_three_spellings() {
        let sql = condition(doc! {"a": {"$eq": Bson::Null}});
        assert!(sql.contains("JSON_EXTRACT(doc, '$.a') IS NULL"), "{}", sql);
        assert!(sql.contains("JSON_CONTAINS(JSON_QUERY(doc, '$.a'), null) = 1"), "{}", sql);
        assert!(sql.contains("JSON_VALUE(doc, '$.a') = 'null'"), "{}", sql);
    }

    #[test]
    fn regex_only_under_eq() {
        let regex = Bson::RegularExpression(bson::Regex {
            pattern: "^x".into(),
            options: "i".into(),
        });

        let sql = condition(doc! {"a": {"$eq": regex.clone()}});
        assert!(sql.contains("REGEXP '(?i)^x'"), "{}", sql);

        assert!(where_condition_from_query(&doc! {"a": {"$gt": regex}}).is_err());
    }

    #[test]
    fn regex_and_options_pair_once() {
        let sql = condition(doc! {"a": {"$regex": "^x", "$options": "i"}});
        assert_eq!(sql.matches("REGEXP").count(), 1, "{}", sql);
        assert!(sql.contains("(?i)^x"), "{}", sql);
    }

    #[test]
    fn lone_options_is_an_error() {
        assert!(where_condition_from_query(&doc! {"a": {"$options": "i"}}).is_err());
    }

    #[test]
    fn in_with_values_null_and_regex() {
        let regex = Bson::RegularExpression(bson::Regex {
            pattern: "x".into(),
            options: "".into(),
        });

        let sql = condition(doc! {"a": {"$in": [1, Bson::Null, regex]}});
        assert!(sql.contains("JSON_CONTAINS(doc, JSON_ARRAY(1), '$.a') = 1"), "{}", sql);
        assert!(sql.contains("JSON_EXTRACT(doc, '$.a') IS NULL"), "{}", sql);
        assert!(sql.contains("(false)"), "{}", sql);
    }

    #[test]
    fn empty_in_never_matches() {
        let sql = condition(doc! {"a": {"$in": []}});
        assert!(sql.contains("(true = false)"), "{}", sql);
    }

    #[test]
    fn scoped_in_also_checks_array_members() {
        let sql = condition(doc! {"a.x": {"$in": [1]}});
        assert!(sql.contains("'$.a.x'"), "{}", sql);
        assert!(sql.contains("'$.a[*].x'"), "{}", sql);
    }

    #[test]
    fn all_uses_containment() {
        let sql = condition(doc! {"a": {"$all": [1, 2]}});
        assert!(
            sql.contains("JSON_CONTAINS(doc, JSON_ARRAY(1, 2), '$.a') = 1"),
            "{}",
            sql
        );
        assert!(sql.contains("JSON_EXTRACT(doc, '$.a[*][*]') IS NULL"), "{}", sql);
    }

    #[test]
    fn nin_is_negated_with_null_safety() {
        let sql = condition(doc! {"a": {"$nin": [1, 2]}});
        assert!(
            sql.contains("JSON_EXTRACT(doc, '$.a') IS NULL OR JSON_EXTRACT(doc, '$.a') NOT IN (1, 2)"),
            "{}",
            sql
        );

        assert!(condition(doc! {"a": {"$nin": []}}).contains("(true)"));
    }

    #[test]
    fn not_requires_document_or_regex() {
        let sql = condition(doc! {"a": {"$not": {"$gt": 5}}});
        assert!(sql.contains("(NOT "), "{}", sql);

        assert!(where_condition_from_query(&doc! {"a": {"$not": 5}}).is_err());
        assert!(where_condition_from_query(&doc! {"a": {"$not": {}}}).is_err());
    }

    #[test]
    fn exists_true_and_false() {
        let sql = condition(doc! {"a": {"$exists": true}});
        assert!(sql.contains("JSON_EXTRACT(doc, '$.a') IS NOT NULL"), "{}", sql);

        let sql = condition(doc! {"a.b": {"$exists": false}});
        assert!(sql.contains("JSON_TYPE(JSON_EXTRACT(doc, '$.a')) = 'OBJECT'"), "{}", sql);
        assert!(sql.contains("JSON_EXTRACT(doc, '$.a.b') IS NULL"), "{}", sql);
    }

    #[test]
    fn size_uses_json_length() {
        let sql = condition(doc! {"a": {"$size": 3}});
        assert!(sql.contains("JSON_LENGTH(doc, '$.a') = 3"), "{}", sql);
    }

    #[test]
    fn type_by_number_alias_and_array() {
        let sql = condition(doc! {"a": {"$type": 2}});
        assert!(sql.contains("JSON_TYPE(JSON_EXTRACT(doc, '$.a')) = 'STRING'"), "{}", sql);

        let sql = condition(doc! {"a": {"$type": "timestamp"}});
        assert!(sql.contains("$timestamp.t"), "{}", sql);

        let sql = condition(doc! {"a": {"$type": ["string", 1]}});
        assert!(sql.contains("'STRING'"), "{}", sql);
        assert!(sql.contains("'DOUBLE'"), "{}", sql);

        let sql = condition(doc! {"a": {"$type": "number"}});
        assert!(sql.contains("'INTEGER'"), "{}", sql);

        assert!(where_condition_from_query(&doc! {"a": {"$type": []}}).is_err());
        assert!(where_condition_from_query(&doc! {"a": {"$type": 2.5}}).is_err());
        assert!(where_condition_from_query(&doc! {"a": {"$type": true}}).is_err());
    }

    #[test]
    fn mod_validation() {
        let sql = condition(doc! {"a": {"$mod": [4, 1]}});
        assert!(sql.contains("MOD(JSON_VALUE(doc, '$.a'), 4) = 1"), "{}", sql);

        assert!(where_condition_from_query(&doc! {"a": {"$mod": [0, 1]}}).is_err());
        assert!(where_condition_from_query(&doc! {"a": {"$mod": [4]}}).is_err());
        assert!(where_condition_from_query(&doc! {"a": {"$mod": [4, 1, 2]}}).is_err());
        assert!(where_condition_from_query(&doc! {"a": {"$mod": ["x", 1]}}).is_err());
    }

    #[test]
    fn timestamp_ordering_is_lexicographic() {
        let ts = Bson::Timestamp(bson::Timestamp {
            time: 10,
            increment: 2,
        });

        let sql = condition(doc! {"a": {"$lte": ts.clone()}});
        assert!(sql.contains("JSON_VALUE(doc, '$.a.$timestamp.t') < 10"), "{}", sql);
        assert!(sql.contains("JSON_VALUE(doc, '$.a.$timestamp.i') = 2"), "{}", sql);

        let sql = condition(doc! {"a": ts});
        assert!(sql.contains("'$.a.$timestamp') IS NOT NULL"), "{}", sql);
    }

    #[test]
    fn elem_match_compiles_to_containment() {
        let sql = condition(doc! {"a": {"$elemMatch": {"x": 1}}});
        assert!(
            sql.contains("JSON_CONTAINS(doc, JSON_OBJECT(\"x\", 1), '$.a') = 1"),
            "{}",
            sql
        );

        assert!(where_condition_from_query(&doc! {"a": {"$elemMatch": 1}}).is_err());
    }

    #[test]
    fn unknown_dollar_operator_is_rejected() {
        let err = where_condition_from_query(&doc! {"a": {"$frob": 1}}).unwrap_err();
        assert!(err.to_string().contains("unknown operator"));
    }

    #[test]
    fn bare_object_equality() {
        let sql = condition(doc! {"a": {"x": 1, "y": 2}});
        assert!(
            sql.contains("JSON_CONTAINS(JSON_QUERY(doc, '$.a'), JSON_OBJECT(\"x\", 1, \"y\", 2))"),
            "{}",
            sql
        );
    }

    #[test]
    fn empty_object_equality() {
        let sql = condition(doc! {"a": {}});
        assert!(sql.contains("JSON_EXTRACT(doc, '$.a') = JSON_OBJECT()"), "{}", sql);
    }

    #[test]
    fn string_values_are_escaped() {
        let sql = condition(doc! {"a": "it's"});
        assert!(sql.contains("it\\'s"), "{}", sql);
        assert!(!sql.contains("'it's'"), "{}", sql);
    }

    #[test]
    fn null_value_with_array_demand() {
        let sql = condition(doc! {"a.b": bson!(null)});
        assert!(
            sql.contains("JSON_TYPE(JSON_QUERY(doc, '$.a')) = 'ARRAY'"),
            "{}",
            sql
        );
    }
}
