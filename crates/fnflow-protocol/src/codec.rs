// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP encoding of datums.
//!
//! One datum travels as one *part*: a header block naming the shape
//! plus the payload bytes. Stage invocations concatenate the closure
//! part and one part per argument into a multipart envelope with a
//! caller-chosen boundary; the runtime's reply is a single part read
//! off the response headers and body.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::datum::{CompletionResult, Datum, ErrorKind, HttpHeader, HttpMethod};

/// Errors that can occur while encoding or decoding datum parts.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid value for header {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("unknown datum type: {0}")]
    UnknownDatumType(String),

    #[error("malformed multipart envelope: {0}")]
    MalformedEnvelope(String),
}

/// A datum rendered for the wire: header entries plus body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePart {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WirePart {
    /// View of this part's headers for decoding.
    pub fn header_view(&self) -> HeaderView<'_> {
        HeaderView::new(&self.headers)
    }
}

/// Case-insensitive lookup over a header list.
///
/// The executor feeds this from a `reqwest` header map and the codec
/// feeds it from parsed multipart header blocks, so it stays agnostic
/// of any particular HTTP type.
pub struct HeaderView<'a> {
    entries: &'a [(String, String)],
}

impl<'a> HeaderView<'a> {
    pub fn new(entries: &'a [(String, String)]) -> Self {
        Self { entries }
    }

    /// First value of the named header, if present.
    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, name: &'static str) -> Result<&'a str, CodecError> {
        self.get(name).ok_or(CodecError::MissingHeader(name))
    }

    /// User-level headers carried under the `Fnproject-Header-` prefix,
    /// with the prefix stripped.
    pub fn user_headers(&self) -> Vec<HttpHeader> {
        let prefix = crate::HEADER_HEADER_PREFIX;
        self.entries
            .iter()
            .filter(|(k, _)| k.len() > prefix.len() && k[..prefix.len()].eq_ignore_ascii_case(prefix))
            .map(|(k, v)| HttpHeader::new(&k[prefix.len()..], v))
            .collect()
    }
}

/// Render a datum as a wire part.
pub fn encode_datum(datum: &Datum) -> WirePart {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut push = |k: &str, v: &str| headers.push((k.to_string(), v.to_string()));
    push(crate::HEADER_DATUM_TYPE, datum.type_token());

    let body = match datum {
        Datum::Empty => Vec::new(),
        Datum::Blob { content_type, data } => {
            push(crate::HEADER_CONTENT_TYPE, content_type);
            data.clone()
        }
        Datum::Error { kind, message } => {
            push(crate::HEADER_ERROR_TYPE, kind.as_token());
            push(crate::HEADER_CONTENT_TYPE, "text/plain");
            message.clone().into_bytes()
        }
        Datum::StageRef { stage_id } => {
            push(crate::HEADER_STAGE_REF, stage_id);
            Vec::new()
        }
        Datum::HttpReq {
            method,
            headers: user,
            content_type,
            body,
        } => {
            push(crate::HEADER_METHOD, method.as_str());
            for h in user {
                push(&format!("{}{}", crate::HEADER_HEADER_PREFIX, h.key), &h.value);
            }
            if let Some(ct) = content_type {
                push(crate::HEADER_CONTENT_TYPE, ct);
            }
            body.clone()
        }
        Datum::HttpResp {
            status_code,
            headers: user,
            content_type,
            body,
        } => {
            push(crate::HEADER_RESULT_CODE, &status_code.to_string());
            for h in user {
                push(&format!("{}{}", crate::HEADER_HEADER_PREFIX, h.key), &h.value);
            }
            if let Some(ct) = content_type {
                push(crate::HEADER_CONTENT_TYPE, ct);
            }
            body.clone()
        }
        Datum::State { state } => {
            push(crate::HEADER_STATE_TYPE, state);
            Vec::new()
        }
    };

    WirePart { headers, body }
}

/// Decode a datum from a header view and body bytes.
pub fn decode_datum(headers: &HeaderView<'_>, body: &[u8]) -> Result<Datum, CodecError> {
    let datum_type = headers.require(crate::HEADER_DATUM_TYPE)?;

    match datum_type {
        crate::DATUM_TYPE_EMPTY => Ok(Datum::Empty),
        crate::DATUM_TYPE_BLOB => {
            let content_type = headers.require(crate::HEADER_CONTENT_TYPE)?;
            Ok(Datum::Blob {
                content_type: content_type.to_string(),
                data: body.to_vec(),
            })
        }
        crate::DATUM_TYPE_ERROR => {
            let kind = ErrorKind::from_token(headers.require(crate::HEADER_ERROR_TYPE)?);
            let message = String::from_utf8_lossy(body).into_owned();
            Ok(Datum::Error { kind, message })
        }
        crate::DATUM_TYPE_STAGE_REF => Ok(Datum::StageRef {
            stage_id: headers.require(crate::HEADER_STAGE_REF)?.to_string(),
        }),
        crate::DATUM_TYPE_HTTP_REQ => {
            let method_token = headers.require(crate::HEADER_METHOD)?;
            let method = HttpMethod::from_str_token(method_token).ok_or_else(|| {
                CodecError::InvalidHeader {
                    name: crate::HEADER_METHOD,
                    value: method_token.to_string(),
                }
            })?;
            Ok(Datum::HttpReq {
                method,
                headers: headers.user_headers(),
                content_type: headers.get(crate::HEADER_CONTENT_TYPE).map(str::to_string),
                body: body.to_vec(),
            })
        }
        crate::DATUM_TYPE_HTTP_RESP => {
            let code = headers.require(crate::HEADER_RESULT_CODE)?;
            let status_code: u16 = code.parse().map_err(|_| CodecError::InvalidHeader {
                name: crate::HEADER_RESULT_CODE,
                value: code.to_string(),
            })?;
            Ok(Datum::HttpResp {
                status_code,
                headers: headers.user_headers(),
                content_type: headers.get(crate::HEADER_CONTENT_TYPE).map(str::to_string),
                body: body.to_vec(),
            })
        }
        crate::DATUM_TYPE_STATE => Ok(Datum::State {
            state: headers.require(crate::HEADER_STATE_TYPE)?.to_string(),
        }),
        other => Err(CodecError::UnknownDatumType(other.to_string())),
    }
}

/// Decode the runtime's reply to a stage invocation.
///
/// The result status header decides success or failure; the datum is
/// read from the same header set plus the body. Transport-level
/// failures never reach this function - the executor maps those to
/// error datums before decoding.
pub fn decode_invocation_response(
    headers: &HeaderView<'_>,
    body: &[u8],
) -> Result<CompletionResult, CodecError> {
    let status = headers.require(crate::HEADER_RESULT_STATUS)?;
    let successful = match status {
        crate::RESULT_STATUS_SUCCESS => true,
        crate::RESULT_STATUS_FAILURE => false,
        other => {
            return Err(CodecError::InvalidHeader {
                name: crate::HEADER_RESULT_STATUS,
                value: other.to_string(),
            });
        }
    };

    let datum = decode_datum(headers, body)?;
    Ok(CompletionResult { successful, datum })
}

const CRLF: &[u8] = b"\r\n";

/// Assemble a stage invocation body: the closure part (when the stage
/// carries one) followed by one part per argument.
///
/// Parts are named `closure`, `arg_0`, `arg_1`, ... in their
/// `Content-Disposition` headers so runtimes can address them
/// positionally.
pub fn encode_invocation(boundary: &str, closure: Option<&WirePart>, args: &[WirePart]) -> Vec<u8> {
    let mut buf = BytesMut::new();

    let mut write_part = |name: &str, part: &WirePart| {
        buf.put_slice(b"--");
        buf.put_slice(boundary.as_bytes());
        buf.put_slice(CRLF);
        buf.put_slice(format!("Content-Disposition: form-data; name=\"{name}\"").as_bytes());
        buf.put_slice(CRLF);
        for (k, v) in &part.headers {
            buf.put_slice(format!("{k}: {v}").as_bytes());
            buf.put_slice(CRLF);
        }
        buf.put_slice(CRLF);
        buf.put_slice(&part.body);
        buf.put_slice(CRLF);
    };

    if let Some(closure) = closure {
        write_part("closure", closure);
    }
    for (i, arg) in args.iter().enumerate() {
        write_part(&format!("arg_{i}"), arg);
    }

    buf.put_slice(b"--");
    buf.put_slice(boundary.as_bytes());
    buf.put_slice(b"--");
    buf.put_slice(CRLF);
    buf.to_vec()
}

/// Split a multipart invocation body back into its parts.
///
/// Used by tests and by runtimes that unpack argument lists; the core
/// itself only writes this envelope.
pub fn decode_multipart(boundary: &str, body: &[u8]) -> Result<Vec<WirePart>, CodecError> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut pos = find_subsequence(body, delimiter)
        .ok_or_else(|| CodecError::MalformedEnvelope("missing opening boundary".to_string()))?
        + delimiter.len();

    loop {
        if body[pos..].starts_with(b"--") {
            break; // closing delimiter
        }
        if !body[pos..].starts_with(CRLF) {
            return Err(CodecError::MalformedEnvelope(
                "boundary not followed by CRLF".to_string(),
            ));
        }
        pos += CRLF.len();

        // Header block ends at the first blank line.
        let header_end = find_subsequence(&body[pos..], b"\r\n\r\n").ok_or_else(|| {
            CodecError::MalformedEnvelope("part headers not terminated".to_string())
        })?;
        let header_block = &body[pos..pos + header_end];
        let mut headers = Vec::new();
        for line in header_block.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let text = std::str::from_utf8(line).map_err(|_| {
                CodecError::MalformedEnvelope("non-UTF-8 part header".to_string())
            })?;
            let (name, value) = text.split_once(':').ok_or_else(|| {
                CodecError::MalformedEnvelope(format!("header without colon: {text}"))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        pos += header_end + 4;

        // Body runs until the CRLF preceding the next delimiter.
        let next = format!("\r\n--{boundary}").into_bytes();
        let body_end = find_subsequence(&body[pos..], &next).ok_or_else(|| {
            CodecError::MalformedEnvelope("part body not terminated".to_string())
        })?;
        let part_body = body[pos..pos + body_end].to_vec();
        pos += body_end + next.len();

        parts.push(WirePart {
            headers,
            body: part_body,
        });
    }

    Ok(parts)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(datum: Datum) -> Datum {
        let part = encode_datum(&datum);
        decode_datum(&part.header_view(), &part.body).expect("decode")
    }

    #[test]
    fn test_blob_part_round_trip() {
        let datum = Datum::Blob {
            content_type: "application/json".to_string(),
            data: b"{\"n\":1}".to_vec(),
        };
        assert_eq!(round_trip(datum.clone()), datum);
    }

    #[test]
    fn test_error_part_round_trip() {
        let datum = Datum::error(ErrorKind::FunctionInvokeFailed, "connection refused");
        assert_eq!(round_trip(datum.clone()), datum);
    }

    #[test]
    fn test_httpreq_part_carries_user_headers() {
        let datum = Datum::HttpReq {
            method: HttpMethod::Post,
            headers: vec![HttpHeader::new("X-Trace", "abc")],
            content_type: Some("text/plain".to_string()),
            body: b"payload".to_vec(),
        };
        let part = encode_datum(&datum);
        assert!(
            part.headers
                .iter()
                .any(|(k, v)| k == "Fnproject-Header-X-Trace" && v == "abc")
        );
        assert_eq!(round_trip(datum.clone()), datum);
    }

    #[test]
    fn test_stageref_requires_stage_id() {
        let headers = vec![("Fnproject-Datumtype".to_string(), "stageref".to_string())];
        let err = decode_datum(&HeaderView::new(&headers), b"").unwrap_err();
        assert!(matches!(err, CodecError::MissingHeader(_)));
    }

    #[test]
    fn test_unknown_datum_type_rejected() {
        let headers = vec![("Fnproject-Datumtype".to_string(), "hologram".to_string())];
        let err = decode_datum(&HeaderView::new(&headers), b"").unwrap_err();
        assert!(matches!(err, CodecError::UnknownDatumType(_)));
    }

    #[test]
    fn test_response_success() {
        let headers = vec![
            ("Fnproject-Resultstatus".to_string(), "success".to_string()),
            ("Fnproject-Datumtype".to_string(), "blob".to_string()),
            ("Content-Type".to_string(), "text/plain".to_string()),
        ];
        let result =
            decode_invocation_response(&HeaderView::new(&headers), b"hi").expect("decode");
        assert!(result.successful);
        assert_eq!(result.datum, Datum::text("hi"));
    }

    #[test]
    fn test_response_failure_selects_error_kind() {
        let headers = vec![
            ("Fnproject-Resultstatus".to_string(), "failure".to_string()),
            ("Fnproject-Datumtype".to_string(), "error".to_string()),
            ("Fnproject-Errortype".to_string(), "stage-lost".to_string()),
        ];
        let result =
            decode_invocation_response(&HeaderView::new(&headers), b"gone").expect("decode");
        assert!(!result.successful);
        assert_eq!(
            result.datum,
            Datum::error(ErrorKind::StageLost, "gone")
        );
    }

    #[test]
    fn test_response_without_status_is_garbage() {
        let headers = vec![("Fnproject-Datumtype".to_string(), "empty".to_string())];
        let err = decode_invocation_response(&HeaderView::new(&headers), b"").unwrap_err();
        assert!(matches!(err, CodecError::MissingHeader(_)));
    }

    #[test]
    fn test_multipart_envelope_round_trip() {
        let closure = encode_datum(&Datum::Blob {
            content_type: "application/octet-stream".to_string(),
            data: vec![1, 2, 3],
        });
        let args = vec![
            encode_datum(&Datum::text("first")),
            encode_datum(&Datum::Empty),
        ];
        let body = encode_invocation("fnflowB0undary", Some(&closure), &args);

        let parts = decode_multipart("fnflowB0undary", &body).expect("parse");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].body, vec![1, 2, 3]);
        assert_eq!(
            decode_datum(&parts[1].header_view(), &parts[1].body).expect("arg 0"),
            Datum::text("first")
        );
        assert_eq!(
            decode_datum(&parts[2].header_view(), &parts[2].body).expect("arg 1"),
            Datum::Empty
        );
    }

    #[test]
    fn test_multipart_without_closure() {
        let body = encode_invocation("b", None, &[encode_datum(&Datum::text("x"))]);
        let parts = decode_multipart("b", &body).expect("parse");
        assert_eq!(parts.len(), 1);
        assert!(
            parts[0]
                .headers
                .iter()
                .any(|(k, v)| k == "Content-Disposition" && v.contains("arg_0"))
        );
    }

    #[test]
    fn test_multipart_truncated_body_rejected() {
        let body = encode_invocation("b", None, &[encode_datum(&Datum::text("x"))]);
        let truncated = &body[..body.len() - 8];
        assert!(decode_multipart("b", truncated).is_err());
    }
}
