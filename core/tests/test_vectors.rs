//! Verify parameter encoding and request building against JSON test vectors
//! stored in `test-vectors/`.
//!
//! Each vector file lists inputs and the expected wire form. JSON bodies are
//! compared parsed rather than as raw strings, so field order cannot cause
//! false negatives.

use courier_core::{HttpMethod, Parameters, RequestEncoding, RequestSerializer};
use serde_json::Value;
use url::Url;

fn parse_method(s: &str) -> HttpMethod {
    match s {
        "GET" => HttpMethod::Get,
        "HEAD" => HttpMethod::Head,
        "DELETE" => HttpMethod::Delete,
        "POST" => HttpMethod::Post,
        "PUT" => HttpMethod::Put,
        other => panic!("unknown method: {other}"),
    }
}

fn parameters(value: &Value) -> Option<Parameters> {
    match value {
        Value::Null => None,
        other => Some(Parameters::from_json(other.clone()).expect("parameters must be an object")),
    }
}

// ---------------------------------------------------------------------------
// Query strings
// ---------------------------------------------------------------------------

#[test]
fn query_test_vectors() {
    let raw = include_str!("../../test-vectors/query.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let params = parameters(&case["parameters"]).unwrap();
        let expected = case["expected"].as_str().unwrap();

        assert_eq!(params.to_query_string().as_deref(), Some(expected), "{name}");
    }
}

// ---------------------------------------------------------------------------
// Built requests
// ---------------------------------------------------------------------------

#[test]
fn request_test_vectors() {
    let raw = include_str!("../../test-vectors/request.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let method = parse_method(case["method"].as_str().unwrap());
        let encoding: RequestEncoding = serde_json::from_value(case["encoding"].clone()).unwrap();
        let url = Url::parse(case["url"].as_str().unwrap()).unwrap();
        let params = parameters(&case["parameters"]);
        let expected = &case["expected"];

        let req = RequestSerializer::new(encoding)
            .build_request(&url, method, params.as_ref(), None)
            .unwrap();

        assert_eq!(req.method, method, "{name}: method");
        assert_eq!(req.url, expected["url"].as_str().unwrap(), "{name}: url");
        assert_eq!(req.header("Content-Type"), expected["content_type"].as_str(), "{name}: content type");

        if let Some(body_json) = expected.get("body_json") {
            let body: Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
            assert_eq!(&body, body_json, "{name}: body");
        } else {
            let body = req.body.as_deref().map(|b| std::str::from_utf8(b).unwrap());
            assert_eq!(body, expected["body"].as_str(), "{name}: body");
        }
    }
}
