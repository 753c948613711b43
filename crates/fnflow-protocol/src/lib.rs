// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fnflow Protocol - Datum wire format over HTTP
//!
//! This crate defines the typed values ("datums") exchanged between the
//! fnflow execution core and the function runtime, and the HTTP encoding
//! used to carry them:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    fnflow-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Values: Datum (blob, error, stageref, httpreq, ...)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Encoding: Fnproject-* headers + body bytes per part        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelope: multipart body for closure + argument lists      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every datum travels as one *part*: a set of `Fnproject-*` headers
//! describing the shape plus an optional body carrying the payload
//! bytes. A stage invocation concatenates the closure part and one part
//! per argument into a multipart envelope; the runtime's reply is a
//! single part read straight off the response headers and body.

pub mod codec;
pub mod datum;

pub use codec::{
    CodecError, HeaderView, WirePart, decode_datum, decode_invocation_response, decode_multipart,
    encode_datum, encode_invocation,
};
pub use datum::{CompletionResult, Datum, ErrorKind, HttpHeader, HttpMethod};

/// Header naming the datum shape of a part or response.
pub const HEADER_DATUM_TYPE: &str = "Fnproject-Datumtype";
/// Header carrying the overall success/failure of a stage invocation.
pub const HEADER_RESULT_STATUS: &str = "Fnproject-Resultstatus";
/// Header carrying the HTTP-like status code of an `httpresp` datum.
pub const HEADER_RESULT_CODE: &str = "Fnproject-Resultcode";
/// Header carrying the referenced stage id of a `stageref` datum.
pub const HEADER_STAGE_REF: &str = "Fnproject-Stageid";
/// Header carrying the method of an `httpreq` datum.
pub const HEADER_METHOD: &str = "Fnproject-Method";
/// Prefix for user-level headers relayed through `httpreq`/`httpresp` datums.
pub const HEADER_HEADER_PREFIX: &str = "Fnproject-Header-";
/// Header selecting the error kind of an `error` datum.
pub const HEADER_ERROR_TYPE: &str = "Fnproject-Errortype";
/// Header carrying the state token of a `state` datum.
pub const HEADER_STATE_TYPE: &str = "Fnproject-Statetype";
/// Header naming the enclosing graph on invocation requests.
pub const HEADER_THREAD_ID: &str = "Fnproject-Threadid";

/// Standard content-type header.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";

/// `Fnproject-Resultstatus` token for a successful invocation.
pub const RESULT_STATUS_SUCCESS: &str = "success";
/// `Fnproject-Resultstatus` token for a failed invocation.
pub const RESULT_STATUS_FAILURE: &str = "failure";

/// `Fnproject-Datumtype` token for blob datums.
pub const DATUM_TYPE_BLOB: &str = "blob";
/// `Fnproject-Datumtype` token for empty datums.
pub const DATUM_TYPE_EMPTY: &str = "empty";
/// `Fnproject-Datumtype` token for error datums.
pub const DATUM_TYPE_ERROR: &str = "error";
/// `Fnproject-Datumtype` token for stage-reference datums.
pub const DATUM_TYPE_STAGE_REF: &str = "stageref";
/// `Fnproject-Datumtype` token for HTTP request datums.
pub const DATUM_TYPE_HTTP_REQ: &str = "httpreq";
/// `Fnproject-Datumtype` token for HTTP response datums.
pub const DATUM_TYPE_HTTP_RESP: &str = "httpresp";
/// `Fnproject-Datumtype` token for graph/stage state datums.
pub const DATUM_TYPE_STATE: &str = "state";
