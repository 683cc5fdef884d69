use super::*;
use serde_json::json;

#[test]
fn test_json_serializer_encodes_compactly() {
    let body = JsonMessageSerializer
        .serialize(&json!({"order_id": 1}))
        .unwrap();

    assert_eq!(body, r#"{"order_id":1}"#);
}

#[test]
fn test_json_serializer_rejects_invalid_body() {
    let result = JsonMessageSerializer.deserialize("{not json");

    assert!(matches!(result, Err(SerializationError::JsonError(_))));
}

#[test]
fn test_json_serializer_decodes_nested_values() {
    let value = JsonMessageSerializer
        .deserialize(r#"{"Message":"{}","MessageAttributes":{}}"#)
        .unwrap();

    assert_eq!(value["Message"], "{}");
}
