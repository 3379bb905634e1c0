//! Key-naming strategies applied when decoding response JSON.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::endpoint::KeyNaming;

/// Decode `body` into `T`, rewriting object keys per `naming` first.
///
/// An empty body decodes as JSON `null`, so unit-like targets accept
/// `204 No Content`.
pub fn decode_json<T: DeserializeOwned>(body: &[u8], naming: KeyNaming) -> Result<T, serde_json::Error> {
    let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(body)?
    };
    let value = match naming {
        KeyNaming::AsDeclared => value,
        KeyNaming::SnakeCase => convert_keys(value),
    };
    serde_json::from_value(value)
}

fn convert_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (snake_to_camel(&key), convert_keys(value)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(convert_keys).collect()),
        other => other,
    }
}

/// `user_id` -> `userId`, `_private_key_` -> `_privateKey_`.
///
/// Leading and trailing underscores survive. A key without interior
/// underscores is returned unchanged.
pub fn snake_to_camel(key: &str) -> String {
    let core = key.trim_matches('_');
    if core.is_empty() {
        return key.to_string();
    }
    let leading = &key[..key.len() - key.trim_start_matches('_').len()];
    let trailing = &key[key.trim_end_matches('_').len()..];

    if !core.contains('_') {
        return key.to_string();
    }
    let mut parts = core.split('_').filter(|part| !part.is_empty());

    let mut out = String::with_capacity(key.len());
    out.push_str(leading);
    if let Some(first) = parts.next() {
        out.push_str(&first.to_lowercase());
    }
    for part in parts {
        let mut chars = part.chars();
        if let Some(head) = chars.next() {
            out.extend(head.to_uppercase());
            out.push_str(&chars.as_str().to_lowercase());
        }
    }
    out.push_str(trailing);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Account {
        user_id: u32,
        display_name: String,
    }

    #[test]
    fn converts_snake_case_keys() {
        assert_eq!(snake_to_camel("user_id"), "userId");
        assert_eq!(snake_to_camel("created_at_utc"), "createdAtUtc");
        assert_eq!(snake_to_camel("URL_PATH"), "urlPath");
        assert_eq!(snake_to_camel("_private_key_"), "_privateKey_");
        assert_eq!(snake_to_camel("a__b"), "aB");
    }

    #[test]
    fn leaves_keys_without_interior_underscores() {
        assert_eq!(snake_to_camel("name"), "name");
        assert_eq!(snake_to_camel("Name"), "Name");
        assert_eq!(snake_to_camel("_id"), "_id");
        assert_eq!(snake_to_camel("__"), "__");
        assert_eq!(snake_to_camel(""), "");
    }

    #[test]
    fn snake_case_strategy_decodes_camel_case_type() {
        let body = br#"{"user_id":7,"display_name":"Ada"}"#;
        let account: Account = decode_json(body, KeyNaming::SnakeCase).unwrap();
        assert_eq!(account, Account { user_id: 7, display_name: "Ada".into() });
    }

    #[test]
    fn as_declared_strategy_keeps_wire_keys() {
        let body = br#"{"user_id":7,"display_name":"Ada"}"#;
        let result: Result<Account, _> = decode_json(body, KeyNaming::AsDeclared);
        assert!(result.is_err());

        let camel = br#"{"userId":7,"displayName":"Ada"}"#;
        let account: Account = decode_json(camel, KeyNaming::AsDeclared).unwrap();
        assert_eq!(account.user_id, 7);
    }

    #[test]
    fn conversion_recurses_into_arrays() {
        let body = br#"{"items":[{"user_id":1,"display_name":"a"},{"user_id":2,"display_name":"b"}]}"#;
        #[derive(Deserialize)]
        struct Page {
            items: Vec<Account>,
        }
        let page: Page = decode_json(body, KeyNaming::SnakeCase).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].display_name, "b");
    }

    #[test]
    fn empty_body_decodes_as_null() {
        decode_json::<()>(b"", KeyNaming::AsDeclared).unwrap();
        let missing: Option<Account> = decode_json(b"  ", KeyNaming::AsDeclared).unwrap();
        assert!(missing.is_none());
        assert!(decode_json::<Account>(b"", KeyNaming::AsDeclared).is_err());
    }
}
