use serde_json::{Number, Value};

/// Deep structural equality between a fresh raw result and the cached one.
///
/// Objects compare by key set and recursive value equality regardless of
/// key order, arrays element-wise in order, scalars by value. A missing
/// cached value is never equivalent.
pub fn is_equivalent(new_raw: &Value, cached_raw: Option<&Value>) -> bool {
    match cached_raw {
        Some(cached) => values_equal(new_raw, cached),
        None => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => false,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    match (as_integer(a), as_integer(b)) {
        (Some(x), Some(y)) => x == y,
        (Some(x), None) => integer_equals_float(x, b.as_f64()),
        (None, Some(y)) => integer_equals_float(y, a.as_f64()),
        (None, None) => a.as_f64() == b.as_f64(),
    }
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// Exact: a float equals an integer only if it has no fraction and
/// converts back to the same value, so rounding never hides a change.
fn integer_equals_float(integer: i128, float: Option<f64>) -> bool {
    // i128 covers [-2^127, 2^127)
    const BOUND: f64 = 170141183460469231731687303715884105728.0;
    match float {
        Some(f) if f.fract() == 0.0 && (-BOUND..BOUND).contains(&f) => f as i128 == integer,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_cache_is_never_equivalent() {
        assert!(!is_equivalent(&json!({"temp": 72}), None));
        assert!(!is_equivalent(&Value::Null, None));
    }

    #[test]
    fn test_object_key_order_is_ignored() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":{"x":[1,2],"y":null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":{"y":null,"x":[1,2]},"a":1}"#).unwrap();
        assert!(is_equivalent(&a, Some(&b)));
    }

    #[test]
    fn test_object_key_sets_must_match() {
        assert!(!is_equivalent(&json!({"a": 1}), Some(&json!({"a": 1, "b": 2}))));
        assert!(!is_equivalent(&json!({"a": 1, "b": 2}), Some(&json!({"a": 1}))));
        assert!(!is_equivalent(&json!({"a": 1}), Some(&json!({"b": 1}))));
    }

    #[test]
    fn test_array_order_matters() {
        assert!(is_equivalent(&json!([1, 2, 3]), Some(&json!([1, 2, 3]))));
        assert!(!is_equivalent(&json!([1, 2, 3]), Some(&json!([3, 2, 1]))));
        assert!(!is_equivalent(&json!([1, 2]), Some(&json!([1, 2, 3]))));
    }

    #[test]
    fn test_numbers_compare_by_value() {
        assert!(is_equivalent(&json!(72), Some(&json!(72.0))));
        assert!(is_equivalent(&json!(-3), Some(&json!(-3))));
        assert!(!is_equivalent(&json!(72), Some(&json!(72.5))));
        assert!(is_equivalent(&json!(u64::MAX), Some(&json!(u64::MAX))));
        assert!(!is_equivalent(&json!(-1), Some(&json!(u64::MAX))));
    }

    #[test]
    fn test_large_integers_are_not_rounded() {
        // 2^53 + 1 has no exact f64 form
        assert!(!is_equivalent(&json!(9007199254740993_u64), Some(&json!(9007199254740992.0))));
        assert!(!is_equivalent(&json!(9007199254740992.0), Some(&json!(9007199254740993_i64))));
        assert!(is_equivalent(&json!(9007199254740992_u64), Some(&json!(9007199254740992.0))));
        assert!(!is_equivalent(&json!(u64::MAX), Some(&json!(18446744073709551615.0))));
        assert!(is_equivalent(&json!(-5), Some(&json!(-5.0))));
    }

    #[test]
    fn test_mismatched_kinds() {
        assert!(!is_equivalent(&json!("72"), Some(&json!(72))));
        assert!(!is_equivalent(&json!(null), Some(&json!(false))));
        assert!(!is_equivalent(&json!([]), Some(&json!({}))));
    }
}
