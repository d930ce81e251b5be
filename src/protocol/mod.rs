/// Protocol types for the request/reply payloads exchanged with workers.
///
/// The transport never looks inside these; only the codec and the correlation
/// registry do, and the registry only checks for a terminal field.
mod message;

pub use message::{expected_output_path, RequestEnvelope, ResponseEnvelope};
