use crate::{ErrorResponse, ErrorType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

const MISSING_TEXT: &str = "Body must include key \"text\".";
const INVALID_TEXT: &str = "Key \"text\" must be a string or list of strings.";
const INVALID_RERANK: &str =
    "Invalid input format. Expected a dictionary with 'query' and 'documents'.";

#[derive(Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub(crate) enum Input {
    Single(String),
    Batch(Vec<String>),
}

impl Input {
    pub(crate) fn len(&self) -> usize {
        match self {
            Input::Single(_) => 1,
            Input::Batch(texts) => texts.len(),
        }
    }

    pub(crate) fn into_texts(self) -> Vec<String> {
        match self {
            Input::Single(text) => vec![text],
            Input::Batch(texts) => texts,
        }
    }
}

#[derive(ToSchema, Debug, PartialEq)]
pub(crate) struct VectorsRequest {
    #[schema(example = "What is Deep Learning?")]
    pub text: Input,
}

impl VectorsRequest {
    /// Parse a `/vectors` body. The content type is ignored.
    pub(crate) fn from_body(body: &[u8]) -> Result<Self, ErrorResponse> {
        let value: Value = serde_json::from_slice(body)?;

        let text = match value {
            Value::Object(mut map) => map.remove("text").unwrap_or(Value::Null),
            _ => return Err(ErrorResponse::bad_request(MISSING_TEXT)),
        };

        if text.is_null() {
            return Err(ErrorResponse::bad_request(MISSING_TEXT));
        }
        let text =
            Input::deserialize(text).map_err(|_| ErrorResponse::bad_request(INVALID_TEXT))?;

        Ok(Self { text })
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub(crate) struct VectorsResponse {
    #[schema(example = json!([[0.0, 1.0, 2.0]]))]
    pub vectors: Vec<Vec<f64>>,
}

#[derive(ToSchema, Debug, PartialEq)]
pub(crate) struct RerankRequest {
    #[schema(example = "What is Deep Learning?")]
    pub query: String,
    #[schema(example = json!(["Deep Learning is ..."]))]
    pub documents: Vec<String>,
}

impl RerankRequest {
    /// Parse a `/rerank` body.
    ///
    /// Some clients send the request object JSON encoded a second time, as a JSON string.
    /// Such a string is decoded once more before validation.
    pub(crate) fn from_body(body: &[u8]) -> Result<Self, ErrorResponse> {
        let value = match decode(body)? {
            Value::String(inner) => decode(inner.as_bytes())?,
            value => value,
        };

        let mut map = match value {
            Value::Object(map) if map.contains_key("query") && map.contains_key("documents") => {
                map
            }
            _ => return Err(ErrorResponse::bad_request(INVALID_RERANK)),
        };

        let documents: Vec<String> = match map.remove("documents") {
            Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(document) => Ok(document),
                    _ => Err(ErrorResponse::bad_request(
                        "Key \"documents\" must be a list of strings.",
                    )),
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(ErrorResponse::bad_request(
                    "Key \"documents\" must be a list of strings.",
                ))
            }
        };

        let query = match map.remove("query") {
            Some(Value::String(query)) => query,
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            // Never sent to the reranker
            Some(other) if documents.is_empty() => other.to_string(),
            _ => return Err(ErrorResponse::bad_request("Key \"query\" must be a string.")),
        };

        Ok(Self { query, documents })
    }
}

fn decode(bytes: &[u8]) -> Result<Value, ErrorResponse> {
    serde_json::from_slice(bytes).map_err(ErrorResponse::from)
}

#[derive(Serialize, ToSchema, Debug)]
pub(crate) struct Scored {
    #[schema(example = "Deep Learning is ...")]
    pub document: String,
    #[schema(example = "0.97")]
    pub score: f64,
}

#[derive(Serialize, ToSchema, Debug)]
pub(crate) struct RerankResponse {
    pub scores: Vec<Scored>,
}

#[derive(Serialize, ToSchema, Debug)]
pub(crate) struct MetaResponse {
    #[schema(example = "Ready")]
    pub status: &'static str,
}

impl From<serde_json::Error> for ErrorResponse {
    fn from(err: serde_json::Error) -> Self {
        ErrorResponse {
            error: format!("Could not parse request body: {err}"),
            error_type: ErrorType::BadRequest,
        }
    }
}
