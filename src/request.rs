//! Incoming HTTP request type.

use std::collections::HashMap;

use bytes::BytesMut;
use http::{Method, Uri};
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;

use crate::error::Error;

/// One request's method, URI, query parameters and body.
///
/// Built when the request head arrives; body chunks are appended in arrival
/// order until the request ends, after which it is read-only.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    query: HashMap<String, String>,
    body: Option<BytesMut>,
    sealed: bool,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        let query = uri.query().map(parse_query).unwrap_or_default();
        Self { method, uri, query, body: None, sealed: false }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }

    /// A query parameter. Repeated keys come back joined with `,`.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn query_params(&self) -> &HashMap<String, String> { &self.query }

    /// The accumulated body, or `None` if no body chunk ever arrived.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Decodes the body as JSON. `None` if there is no body or it does not
    /// decode into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_slice(self.body()?).ok()
    }

    /// Appends a body chunk, refusing to grow past `limit` bytes.
    pub fn append_body(&mut self, chunk: &[u8], limit: usize) -> Result<(), Error> {
        if self.sealed {
            return Err(Error::ContractViolation("body chunk after end of request"));
        }
        let buffered = self.body.as_ref().map_or(0, BytesMut::len);
        if buffered + chunk.len() > limit {
            return Err(Error::PayloadTooLarge { limit });
        }
        self.body.get_or_insert_with(BytesMut::new).extend_from_slice(chunk);
        Ok(())
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }
}

/// `a=1&a=2&b=x` → `{a: "1,2", b: "x"}`. Names and values are
/// percent-decoded; `+` is left as is. A bare key with no `=` still
/// registers the key, with no value.
fn parse_query(query: &str) -> HashMap<String, String> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (pair, None),
        };
        let values = grouped.entry(decode(name)).or_default();
        if let Some(value) = value {
            values.push(decode(value));
        }
    }
    grouped.into_iter().map(|(k, v)| (k, v.join(","))).collect()
}

fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
