// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed values crossing the HTTP boundary.
//!
//! A [`Datum`] is the unit of data flowing between stages and the
//! function runtime. Datums are carried on the wire as header-tagged
//! parts (see [`crate::codec`]) and inside journal events as serialized
//! payloads, so everything here derives serde.

use serde::{Deserialize, Serialize};

/// Closed set of error kinds a stage can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Waiting on a stage result exceeded its deadline.
    StageTimeout,
    /// The executor exhausted its retry budget for a stage dispatch.
    StageInvokeFailed,
    /// The HTTP transport to the function runtime failed.
    FunctionInvokeFailed,
    /// The stage disappeared across a failover.
    StageLost,
    /// The runtime returned a reply the core could not interpret.
    InvalidStageResponse,
    /// Anything that does not fit the kinds above.
    UnknownError,
}

impl ErrorKind {
    /// Wire token used in the `Fnproject-Errortype` header.
    pub fn as_token(&self) -> &'static str {
        match self {
            Self::StageTimeout => "stage-timeout",
            Self::StageInvokeFailed => "stage-invoke-failed",
            Self::FunctionInvokeFailed => "function-invoke-failed",
            Self::StageLost => "stage-lost",
            Self::InvalidStageResponse => "invalid-stage-response",
            Self::UnknownError => "unknown-error",
        }
    }

    /// Parse a wire token. Unrecognised tokens collapse to
    /// [`ErrorKind::UnknownError`] rather than failing the decode: the
    /// runtime may be newer than the core.
    pub fn from_token(token: &str) -> Self {
        match token {
            "stage-timeout" => Self::StageTimeout,
            "stage-invoke-failed" => Self::StageInvokeFailed,
            "function-invoke-failed" => Self::FunctionInvokeFailed,
            "stage-lost" => Self::StageLost,
            "invalid-stage-response" => Self::InvalidStageResponse,
            _ => Self::UnknownError,
        }
    }
}

/// HTTP method of an `httpreq` datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
        }
    }

    /// Parse a method token, case-insensitively.
    pub fn from_str_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            "OPTIONS" => Some(Self::Options),
            "PATCH" => Some(Self::Patch),
            _ => None,
        }
    }
}

/// A user-level header relayed through `httpreq`/`httpresp` datums.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub key: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A typed value exchanged with the function runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Datum {
    /// No value (void results, `AllOf` completions).
    Empty,
    /// Raw payload bytes with their media type.
    Blob { content_type: String, data: Vec<u8> },
    /// A failure value.
    Error { kind: ErrorKind, message: String },
    /// A reference to another stage in the same graph.
    StageRef { stage_id: String },
    /// An HTTP request relayed to or from the runtime.
    HttpReq {
        method: HttpMethod,
        headers: Vec<HttpHeader>,
        content_type: Option<String>,
        body: Vec<u8>,
    },
    /// An HTTP response relayed from an invoked function.
    HttpResp {
        status_code: u16,
        headers: Vec<HttpHeader>,
        content_type: Option<String>,
        body: Vec<u8>,
    },
    /// A graph or stage state token.
    State { state: String },
}

impl Datum {
    /// Wire token used in the `Fnproject-Datumtype` header.
    pub fn type_token(&self) -> &'static str {
        match self {
            Self::Empty => crate::DATUM_TYPE_EMPTY,
            Self::Blob { .. } => crate::DATUM_TYPE_BLOB,
            Self::Error { .. } => crate::DATUM_TYPE_ERROR,
            Self::StageRef { .. } => crate::DATUM_TYPE_STAGE_REF,
            Self::HttpReq { .. } => crate::DATUM_TYPE_HTTP_REQ,
            Self::HttpResp { .. } => crate::DATUM_TYPE_HTTP_RESP,
            Self::State { .. } => crate::DATUM_TYPE_STATE,
        }
    }

    /// Shorthand for a text/plain blob, used widely in tests.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Blob {
            content_type: "text/plain".to_string(),
            data: content.into().into_bytes(),
        }
    }

    /// Shorthand for an error datum.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of a stage: success or failure, each carrying a datum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub successful: bool,
    pub datum: Datum,
}

impl CompletionResult {
    pub fn success(datum: Datum) -> Self {
        Self {
            successful: true,
            datum,
        }
    }

    pub fn failure(datum: Datum) -> Self {
        Self {
            successful: false,
            datum,
        }
    }

    /// A failure carrying an error datum of the given kind.
    pub fn from_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::failure(Datum::error(kind, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_token_round_trip() {
        for kind in [
            ErrorKind::StageTimeout,
            ErrorKind::StageInvokeFailed,
            ErrorKind::FunctionInvokeFailed,
            ErrorKind::StageLost,
            ErrorKind::InvalidStageResponse,
            ErrorKind::UnknownError,
        ] {
            assert_eq!(ErrorKind::from_token(kind.as_token()), kind);
        }
    }

    #[test]
    fn test_error_kind_unknown_token() {
        assert_eq!(
            ErrorKind::from_token("some-future-kind"),
            ErrorKind::UnknownError
        );
    }

    #[test]
    fn test_http_method_parse_case_insensitive() {
        assert_eq!(HttpMethod::from_str_token("post"), Some(HttpMethod::Post));
        assert_eq!(HttpMethod::from_str_token("GET"), Some(HttpMethod::Get));
        assert_eq!(HttpMethod::from_str_token("brew"), None);
    }

    #[test]
    fn test_datum_type_tokens() {
        assert_eq!(Datum::Empty.type_token(), "empty");
        assert_eq!(Datum::text("x").type_token(), "blob");
        assert_eq!(
            Datum::error(ErrorKind::UnknownError, "boom").type_token(),
            "error"
        );
        assert_eq!(
            Datum::StageRef {
                stage_id: "2".to_string()
            }
            .type_token(),
            "stageref"
        );
    }

    #[test]
    fn test_datum_serde_round_trip() {
        let datum = Datum::HttpReq {
            method: HttpMethod::Put,
            headers: vec![HttpHeader::new("X-Custom", "1")],
            content_type: Some("application/json".to_string()),
            body: b"{}".to_vec(),
        };
        let bytes = serde_json::to_vec(&datum).expect("serialize");
        let back: Datum = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(back, datum);
    }
}
