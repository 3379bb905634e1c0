//! `multipart/form-data` body encoding.
//!
//! # Wire layout
//! Text fields come first, in caller order, then exactly one binary field,
//! then the `--{boundary}--` terminator. Servers rely on this order.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// One text part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartTextField {
    pub name: String,
    pub value: String,
}

impl MultipartTextField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The binary part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartDataField {
    pub name: String,
    pub bytes: Bytes,
    pub mime_type: String,
}

impl MultipartDataField {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Serializes fields into a multipart body delimited by one boundary.
#[derive(Debug, Clone)]
pub struct MultipartEncoder {
    boundary: String,
}

impl MultipartEncoder {
    /// Encoder with a freshly generated boundary.
    pub fn new() -> Self {
        Self {
            boundary: Uuid::new_v4().to_string().to_uppercase(),
        }
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn encode(&self, text_fields: &[MultipartTextField], data_field: &MultipartDataField) -> Bytes {
        let text_len: usize = text_fields
            .iter()
            .map(|field| field.name.len() + field.value.len() + 160)
            .sum();
        let mut buf = BytesMut::with_capacity(text_len + data_field.bytes.len() + 128);

        for field in text_fields {
            self.put_text_field(&mut buf, field);
        }
        self.put_data_field(&mut buf, data_field);
        buf.put_slice(format!("--{}--", self.boundary).as_bytes());
        buf.freeze()
    }

    fn put_text_field(&self, buf: &mut BytesMut, field: &MultipartTextField) {
        buf.put_slice(format!("--{}\r\n", self.boundary).as_bytes());
        put_disposition(buf, &field.name);
        buf.put_slice(b"Content-Type: text/plain; charset=ISO-8859-1\r\n");
        buf.put_slice(b"Content-Transfer-Encoding: 8bit\r\n");
        buf.put_slice(b"\r\n");
        buf.put_slice(field.value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    fn put_data_field(&self, buf: &mut BytesMut, field: &MultipartDataField) {
        buf.put_slice(format!("--{}\r\n", self.boundary).as_bytes());
        put_disposition(buf, &field.name);
        buf.put_slice(format!("Content-Type: {}\r\n", field.mime_type).as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(&field.bytes);
        buf.put_slice(b"\r\n");
    }
}

/// Writes the `Content-Disposition` line. Quotes and line breaks in `name`
/// are percent-encoded so they cannot end the header early.
fn put_disposition(buf: &mut BytesMut, name: &str) {
    buf.put_slice(b"Content-Disposition: form-data; name=\"");
    for ch in name.chars() {
        match ch {
            '"' => buf.put_slice(b"%22"),
            '\r' => buf.put_slice(b"%0D"),
            '\n' => buf.put_slice(b"%0A"),
            _ => buf.put_slice(ch.encode_utf8(&mut [0; 4]).as_bytes()),
        }
    }
    buf.put_slice(b"\"\r\n");
}

impl Default for MultipartEncoder {
    fn default() -> Self {
        Self::new()
    }
}
