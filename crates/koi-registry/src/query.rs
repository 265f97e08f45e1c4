// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

/// Match a stored document against a query document.
///
/// Every field of the query must be satisfied for the document to match.
/// Leaf values are either literals (deep equality) or operator records whose
/// keys all start with `$`:
///
/// `$eq, $ne, $gt, $gte, $lt, $lte, $in, $regex`
///
/// Field access supports dot notation (`"profile.age"`).  Unknown operators
/// fail the match; `$in` requires an array operand.
pub fn matches_document(doc: &Value, query: &Value) -> bool {
    let fields = match query {
        Value::Object(m) => m,
        // A non-object query only matches by deep equality.
        other => return doc == other,
    };
    fields.iter().all(|(path, predicate)| {
        let field = resolve_path(doc, path);
        match predicate {
            Value::Object(ops) if is_operator_record(ops) => ops
                .iter()
                .all(|(op, operand)| apply_operator(field, op, operand)),
            literal => field == Some(literal),
        }
    })
}

/// Walk a dot-separated path through nested objects.
fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn is_operator_record(map: &serde_json::Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn apply_operator(field: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => field == Some(operand),
        "$ne" => field != Some(operand),
        "$gt" => compare(field, operand).map(|o| o.is_gt()).unwrap_or(false),
        "$gte" => compare(field, operand).map(|o| o.is_ge()).unwrap_or(false),
        "$lt" => compare(field, operand).map(|o| o.is_lt()).unwrap_or(false),
        "$lte" => compare(field, operand).map(|o| o.is_le()).unwrap_or(false),
        "$in" => match (field, operand) {
            (Some(f), Value::Array(candidates)) => candidates.contains(f),
            _ => false,
        },
        "$regex" => match (field, operand) {
            (Some(Value::String(s)), Value::String(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(s))
                .unwrap_or(false),
            _ => false,
        },
        // Unknown operators fail the match rather than being ignored.
        _ => false,
    }
}

/// Ordering between a field and an operand.  Numbers compare numerically,
/// strings lexicographically; mixed or missing values do not compare.
fn compare(field: Option<&Value>, operand: &Value) -> Option<std::cmp::Ordering> {
    match (field?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc() -> Value {
        json!({
            "name": "ada",
            "age": 36,
            "tags": ["math", "engines"],
            "profile": { "city": "london", "score": 9.5 }
        })
    }

    // ── Literals ──────────────────────────────────────────────────────────────

    #[test]
    fn literal_equality_matches() {
        assert!(matches_document(&doc(), &json!({"name": "ada"})));
    }

    #[test]
    fn literal_mismatch_fails() {
        assert!(!matches_document(&doc(), &json!({"name": "grace"})));
    }

    #[test]
    fn all_fields_must_match() {
        assert!(!matches_document(&doc(), &json!({"name": "ada", "age": 35})));
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(matches_document(&doc(), &json!({})));
    }

    #[test]
    fn dot_path_reaches_nested_fields() {
        assert!(matches_document(&doc(), &json!({"profile.city": "london"})));
        assert!(!matches_document(&doc(), &json!({"profile.city": "paris"})));
    }

    #[test]
    fn missing_field_fails_literal_match() {
        assert!(!matches_document(&doc(), &json!({"nonexistent": 1})));
    }

    // ── Operators ─────────────────────────────────────────────────────────────

    #[test]
    fn eq_and_ne() {
        assert!(matches_document(&doc(), &json!({"age": {"$eq": 36}})));
        assert!(matches_document(&doc(), &json!({"age": {"$ne": 35}})));
        assert!(!matches_document(&doc(), &json!({"age": {"$ne": 36}})));
    }

    #[test]
    fn numeric_ordering_operators() {
        assert!(matches_document(&doc(), &json!({"age": {"$gt": 35}})));
        assert!(matches_document(&doc(), &json!({"age": {"$gte": 36}})));
        assert!(matches_document(&doc(), &json!({"age": {"$lt": 40}})));
        assert!(matches_document(&doc(), &json!({"age": {"$lte": 36}})));
        assert!(!matches_document(&doc(), &json!({"age": {"$gt": 36}})));
    }

    #[test]
    fn ordering_on_nested_float() {
        assert!(matches_document(&doc(), &json!({"profile.score": {"$gt": 9}})));
    }

    #[test]
    fn string_ordering_is_lexicographic() {
        assert!(matches_document(&doc(), &json!({"name": {"$lt": "bob"}})));
        assert!(!matches_document(&doc(), &json!({"name": {"$gt": "zoe"}})));
    }

    #[test]
    fn mixed_type_ordering_fails() {
        assert!(!matches_document(&doc(), &json!({"name": {"$gt": 3}})));
    }

    #[test]
    fn in_operator_requires_array() {
        assert!(matches_document(&doc(), &json!({"name": {"$in": ["ada", "grace"]}})));
        assert!(!matches_document(&doc(), &json!({"name": {"$in": ["grace"]}})));
        assert!(!matches_document(&doc(), &json!({"name": {"$in": "ada"}})));
    }

    #[test]
    fn regex_operator() {
        assert!(matches_document(&doc(), &json!({"name": {"$regex": "^a"}})));
        assert!(!matches_document(&doc(), &json!({"name": {"$regex": "^z"}})));
    }

    #[test]
    fn regex_on_non_string_fails() {
        assert!(!matches_document(&doc(), &json!({"age": {"$regex": "3"}})));
    }

    #[test]
    fn invalid_regex_pattern_fails_match() {
        assert!(!matches_document(&doc(), &json!({"name": {"$regex": "["}})));
    }

    #[test]
    fn unknown_operator_fails_match() {
        assert!(!matches_document(&doc(), &json!({"age": {"$near": 36}})));
    }

    #[test]
    fn multiple_operators_on_one_field_all_apply() {
        assert!(matches_document(&doc(), &json!({"age": {"$gt": 30, "$lt": 40}})));
        assert!(!matches_document(&doc(), &json!({"age": {"$gt": 30, "$lt": 36}})));
    }

    #[test]
    fn object_literal_without_dollar_keys_is_deep_equality() {
        let d = json!({"cfg": {"a": 1}});
        assert!(matches_document(&d, &json!({"cfg": {"a": 1}})));
        assert!(!matches_document(&d, &json!({"cfg": {"a": 2}})));
    }
}
