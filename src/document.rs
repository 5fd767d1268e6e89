use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExtractionError {
    #[error("required field `{0}` is missing")]
    Missing(&'static str),
    #[error("field `{field}` should be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
    #[error("timestamp {0} cannot be represented as a date")]
    Timestamp(i64),
}

pub type Extract<T> = Result<T, ExtractionError>;

/// Read-only view over one JSON object of an upstream document.
///
/// Absent keys and explicit `null`s read the same way, so every accessor
/// either yields the caller's default or `None`. A value that is present but
/// has the wrong shape is an error instead of being silently coerced.
#[derive(Debug, Clone, Copy, Default)]
pub struct Doc<'a> {
    fields: Option<&'a Map<String, Value>>,
}

impl<'a> Doc<'a> {
    pub fn new(value: &'a Value) -> Extract<Self> {
        Self::optional(value, "document")?.ok_or(ExtractionError::Missing("document"))
    }

    /// `null` becomes `None`; anything other than an object is an error.
    pub fn optional(value: &'a Value, field: &str) -> Extract<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::Object(fields) => Ok(Some(Self {
                fields: Some(fields),
            })),
            _ => Err(wrong_type(field, "an object")),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.fields
            .and_then(|fields| fields.get(key))
            .filter(|value| !value.is_null())
    }

    pub fn object(&self, key: &str) -> Extract<Option<Doc<'a>>> {
        match self.get(key) {
            Some(value) => Self::optional(value, key),
            None => Ok(None),
        }
    }

    pub fn object_or_empty(&self, key: &str) -> Extract<Doc<'a>> {
        Ok(self.object(key)?.unwrap_or_default())
    }

    pub fn array(&self, key: &str) -> Extract<&'a [Value]> {
        match self.get(key) {
            Some(Value::Array(items)) => Ok(items.as_slice()),
            Some(_) => Err(wrong_type(key, "an array")),
            None => Ok(&[]),
        }
    }

    pub fn str_or(&self, key: &str, default: &str) -> Extract<String> {
        match self.get(key) {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(_) => Err(wrong_type(key, "a string")),
            None => Ok(default.to_string()),
        }
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Extract<u64> {
        match self.get(key) {
            Some(value) => value
                .as_u64()
                .ok_or_else(|| wrong_type(key, "a non-negative integer")),
            None => Ok(default),
        }
    }

    pub fn i64_or(&self, key: &str, default: i64) -> Extract<i64> {
        match self.get(key) {
            Some(value) => value
                .as_i64()
                .or_else(|| value.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))
                .ok_or_else(|| wrong_type(key, "a number")),
            None => Ok(default),
        }
    }

    /// Identifiers arrive either as text or as large integers; both are kept
    /// as text so no precision is lost downstream.
    pub fn identifier(&self, key: &str) -> Extract<Option<String>> {
        match self.get(key) {
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(Value::Number(number)) => Ok(Some(number.to_string())),
            Some(_) => Err(wrong_type(key, "a string or number")),
            None => Ok(None),
        }
    }

    pub fn url_list(&self) -> Extract<Vec<&'a str>> {
        self.array("url_list")?
            .iter()
            .map(|entry| {
                entry
                    .as_str()
                    .ok_or_else(|| wrong_type("url_list[]", "a string"))
            })
            .collect()
    }

    pub fn first_url(&self) -> Extract<Option<&'a str>> {
        Ok(self.url_list()?.first().copied())
    }
}

fn wrong_type(field: &str, expected: &'static str) -> ExtractionError {
    ExtractionError::WrongType {
        field: field.to_string(),
        expected,
    }
}
