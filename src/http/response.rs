//! Response state carried by every request context.

use std::collections::HashMap;

use crate::http::codec;
use crate::pool::Reset;

/// Status, headers and body of the response being built.
///
/// `out` is the serialisation scratch buffer; it keeps its allocation across
/// requests and is cleared before every encode.
#[derive(Debug)]
pub struct ResponseContext {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    out: Vec<u8>,
}

impl Default for ResponseContext {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: Vec::new(),
            out: Vec::new(),
        }
    }
}

impl ResponseContext {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Set a header, replacing any existing value under the same name
    /// regardless of case.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(&name));
        self.headers.insert(name, value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Serialise into the reusable output buffer and return the bytes.
    pub fn encode(&mut self, version: &str) -> &[u8] {
        self.out.clear();
        codec::write_response(&mut self.out, version, self.status, &self.headers, &self.body);
        &self.out
    }
}

impl Reset for ResponseContext {
    fn reset(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.body.clear();
        self.out.clear();
    }
}
