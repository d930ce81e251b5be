use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CorrelationId, Result, RpcError};

/// A request body ready for encoding.
///
/// `payload` is the caller's business data, opaque to the core. The two
/// injected fields tell the worker which feature to run and where to write its
/// output; they override same-named payload keys on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub payload: Map<String, Value>,
    pub target_feature: String,
    pub expect_output_path: String,
}

impl RequestEnvelope {
    /// The payload's `file` field, used as the input reference when deriving
    /// the output location. Empty when absent or not a string.
    pub fn input_ref(payload: &Map<String, Value>) -> &str {
        // ---
        payload.get("file").and_then(Value::as_str).unwrap_or("")
    }

    /// Flatten into the JSON object sent on the wire.
    pub fn into_body(self) -> Map<String, Value> {
        // ---
        let mut body = self.payload;
        body.insert("targetFeature".into(), Value::String(self.target_feature));
        body.insert(
            "expectOutputPath".into(),
            Value::String(self.expect_output_path),
        );
        body
    }
}

/// A decoded worker reply.
///
/// The correlation id is not part of the body; it travels in the message
/// properties. Fields other than these two are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file: Option<Vec<String>>,
}

impl ResponseEnvelope {
    pub fn success(files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            error_message: None,
            result_file: Some(files.into_iter().map(Into::into).collect()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            result_file: None,
        }
    }

    /// The terminal outcome this reply carries, if any.
    ///
    /// - non-empty `errorMessage` → `Err(Remote)`, checked first
    /// - `resultFile` present → `Ok(first entry)`, or `""` when the list is empty
    /// - neither → `None`: a progress report, the call keeps waiting
    pub fn outcome(&self) -> Option<Result<String>> {
        // ---
        if let Some(msg) = self.error_message.as_deref().filter(|m| !m.is_empty()) {
            return Some(Err(RpcError::Remote(msg.to_string())));
        }

        self.result_file
            .as_ref()
            .map(|files| Ok(files.first().cloned().unwrap_or_default()))
    }
}

/// Where a worker should write the output of one call.
///
/// Layout: `{service}/{feature}/{correlation_id}/{input file name}`. The
/// trailing segment is omitted when the input reference has no file name.
/// Any query string on the input reference is ignored.
pub fn expected_output_path(
    input_ref: &str,
    target_service: &str,
    target_feature: &str,
    correlation_id: &CorrelationId,
) -> String {
    // ---
    let without_query = input_ref.split(['?', '#']).next().unwrap_or("");
    let file_name = without_query
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();

    let base = format!("{target_service}/{target_feature}/{correlation_id}");
    if file_name.is_empty() {
        base
    } else {
        format!("{base}/{file_name}")
    }
}
