use serde_json::Value;

/// Record lists printed as `<name> <value>` lines: (list, name field, value field).
const RECORD_LISTS: [(&str, &str, &str); 3] = [
    ("weights", "ticker", "weight"),
    ("hits", "ticker", "rsi"),
    ("allocation", "ticker", "shares"),
];

/// Scalar fields tried in order when the result has no record list.
const PRIORITY_KEYS: [&str; 3] = ["out", "leftover", "sharpe_ratio"];

/// Print just the key answer from the output.
///
/// Weights, RSI hits and share lots print one line per ticker (zero weights
/// are left out); otherwise the first well-known scalar field, then the
/// first field of the result.
pub fn print_minimal(value: &Value) {
    let result_obj = value
        .as_object()
        .and_then(|m| m.get("result"))
        .unwrap_or(value);

    if let Value::Object(map) = result_obj {
        for (list, name_key, value_key) in RECORD_LISTS {
            if let Some(Value::Array(items)) = map.get(list) {
                for item in items {
                    if let (Some(name), Some(val)) = (item.get(name_key), item.get(value_key)) {
                        let val = format_minimal(val);
                        if val != "0" {
                            println!("{} {}", format_minimal(name), val);
                        }
                    }
                }
                return;
            }
        }

        for key in PRIORITY_KEYS {
            if let Some(val) = map.get(key) {
                if !val.is_null() {
                    println!("{}", format_minimal(val));
                    return;
                }
            }
        }

        if let Some((key, val)) = map.iter().next() {
            println!("{}: {}", key, format_minimal(val));
            return;
        }
    }

    println!("{}", format_minimal(result_obj));
}

fn format_minimal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
