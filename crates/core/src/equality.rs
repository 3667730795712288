//! Derivative equality: "desired is a subset of observed".
//!
//! Fields the store added on its own (defaults, generated values) never make
//! two documents unequal; only fields the desired side declares are compared.

#![forbid(unsafe_code)]

use serde_json::Value as Json;

/// Returns true when every field present in `desired` is present and equal in
/// `observed`.
///
/// - `null` in desired means "unset" and always matches
/// - objects recurse key by key; extra observed keys are ignored
/// - arrays must have the same length and match element-wise
/// - integers compare exactly; a float on either side compares by value
///   (`1` equals `1.0`)
pub fn derivative_equal(desired: &Json, observed: &Json) -> bool {
    match (desired, observed) {
        (Json::Null, _) => true,
        (Json::Object(d), Json::Object(o)) => d.iter().all(|(k, dv)| match o.get(k) {
            Some(ov) => derivative_equal(dv, ov),
            None => dv.is_null(),
        }),
        (Json::Array(d), Json::Array(o)) => {
            d.len() == o.len() && d.iter().zip(o.iter()).all(|(dv, ov)| derivative_equal(dv, ov))
        }
        (Json::Number(d), Json::Number(o)) => numbers_equal(d, o),
        (d, o) => d == o,
    }
}

fn numbers_equal(d: &serde_json::Number, o: &serde_json::Number) -> bool {
    if let (Some(a), Some(b)) = (d.as_i64(), o.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (d.as_u64(), o.as_u64()) {
        return a == b;
    }
    if d.is_f64() || o.is_f64() {
        return matches!((d.as_f64(), o.as_f64()), (Some(a), Some(b)) if a == b);
    }
    // one side negative, the other above i64::MAX
    false
}
