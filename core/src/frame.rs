//! Docker JSON stream framing.
//!
//! Build, push and pull progress is sent as a sequence of independently
//! flushed JSON objects concatenated on the response body. Frames only carry
//! plain strings, so encoding goes through [`serde_json::Value`], whose
//! `Display` is infallible.

use bytes::Bytes;
use serde_json::json;

/// One message of the Docker progress stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `{"stream":"<text>"}`
    Stream(String),
    /// `{"errorDetail":{"code":1,"message":"<text>"},"error":"<text>"}`
    Error(String),
    /// `{"aux":{"ID":"<image id>"}}`
    Aux { id: String },
}

impl Frame {
    /// A progress frame.
    pub fn stream(text: impl Into<String>) -> Self {
        Frame::Stream(text.into())
    }

    /// A terminal error frame.
    pub fn error(text: impl Into<String>) -> Self {
        Frame::Error(text.into())
    }

    /// A build result frame carrying the image ID.
    pub fn aux_id(id: impl Into<String>) -> Self {
        Frame::Aux { id: id.into() }
    }

    /// Encode the frame for the wire.
    pub fn encode(&self) -> Bytes {
        let value = match self {
            Frame::Stream(text) => json!({ "stream": text }),
            Frame::Error(text) => json!({
                "errorDetail": { "code": 1, "message": text },
                "error": text,
            }),
            Frame::Aux { id } => json!({ "aux": { "ID": id } }),
        };
        Bytes::from(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &Bytes) -> serde_json::Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_stream_frame() {
        let encoded = Frame::stream("Step 1/2\n").encode();
        assert_eq!(encoded, Bytes::from(r#"{"stream":"Step 1/2\n"}"#));
    }

    #[test]
    fn test_stream_frame_escapes_control_characters() {
        let encoded = Frame::stream("quote \" tab \t").encode();
        assert_eq!(decode(&encoded)["stream"], "quote \" tab \t");
        assert!(!encoded.contains(&b'\n'));
    }

    #[test]
    fn test_error_frame() {
        let encoded = Frame::error("execute push: pod failed").encode();
        let value = decode(&encoded);
        assert_eq!(value["error"], "execute push: pod failed");
        assert_eq!(value["errorDetail"]["code"], 1);
        assert_eq!(value["errorDetail"]["message"], "execute push: pod failed");
    }

    #[test]
    fn test_aux_frame() {
        let id = format!("sha256:{}", "a".repeat(64));
        let encoded = Frame::aux_id(id.clone()).encode();
        assert_eq!(encoded, Bytes::from(format!(r#"{{"aux":{{"ID":"{}"}}}}"#, id)));
    }

    #[test]
    fn test_non_utf8_lossy_text_still_encodes() {
        let text = String::from_utf8_lossy(&[0x66, 0xff, 0x6f]).into_owned();
        let encoded = Frame::stream(text).encode();
        assert!(decode(&encoded)["stream"].as_str().unwrap().starts_with('f'));
    }
}
