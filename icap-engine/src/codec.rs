//! HTTP content codings and character-set sniffing for encapsulated bodies.

use crate::error::{Error, IcapResult};
use crate::exchange::{ExchangeState, RequestType};
use flate2::Compression;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io::{Read, Write};
use tracing::trace;

/// Number of body bytes inspected when sniffing a character set.
pub const CHARSET_SAMPLE: usize = 5000;

/// Default HTTP/1.1 charset.
pub const DEFAULT_CHARSET: &str = "ISO-8859-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentCoding {
    /// Coding named by a `Content-Encoding` or `Accept-Encoding` value.
    /// gzip wins when both are listed.
    pub fn from_header(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return ContentCoding::Identity;
        };
        let value = value.to_ascii_lowercase();
        if value.contains("gzip") {
            ContentCoding::Gzip
        } else if value.contains("deflate") {
            ContentCoding::Deflate
        } else {
            ContentCoding::Identity
        }
    }

    pub fn header_value(self) -> Option<&'static str> {
        match self {
            ContentCoding::Identity => None,
            ContentCoding::Gzip => Some("gzip"),
            ContentCoding::Deflate => Some("deflate"),
        }
    }
}

fn read_all(mut reader: impl Read, hint: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(hint);
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Decodes `data`. `deflate` accepts both zlib-wrapped and raw streams.
pub fn decode(coding: ContentCoding, data: &[u8]) -> IcapResult<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let hint = data.len() * 3;
    match coding {
        ContentCoding::Identity => Ok(data.to_vec()),
        ContentCoding::Gzip => read_all(GzDecoder::new(data), hint)
            .map_err(|e| Error::Compression(format!("gunzip failed: {e}"))),
        ContentCoding::Deflate => read_all(ZlibDecoder::new(data), hint)
            .or_else(|_| read_all(DeflateDecoder::new(data), hint))
            .map_err(|e| Error::Compression(format!("inflate failed: {e}"))),
    }
}

pub fn encode(coding: ContentCoding, data: &[u8]) -> IcapResult<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let out = Vec::with_capacity(data.len() / 2);
    let encoded = match coding {
        ContentCoding::Identity => return Ok(data.to_vec()),
        ContentCoding::Gzip => {
            let mut enc = GzEncoder::new(out, Compression::default());
            enc.write_all(data).and_then(|()| enc.finish())
        }
        ContentCoding::Deflate => {
            let mut enc = ZlibEncoder::new(out, Compression::default());
            enc.write_all(data).and_then(|()| enc.finish())
        }
    };
    encoded.map_err(|e| Error::Compression(format!("{coding:?} encoding failed: {e}")))
}

fn normalize_charset(raw: &str) -> Option<String> {
    let name = raw.trim().trim_matches(['"', '\'']);
    let valid = !name.is_empty()
        && name.len() <= 40
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'));
    valid.then(|| name.to_ascii_uppercase())
}

/// `text/html; charset=utf-8` -> `UTF-8`.
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    let start = lower.find("charset=")? + "charset=".len();
    let value = lower[start..].split(';').next()?;
    normalize_charset(value)
}

fn xml_encoding(content: &str) -> Option<String> {
    let decl = &content[..content.find("?>")?];
    let at = decl.find("encoding=")? + "encoding=".len();
    let rest = &decl[at..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &rest[1..];
    normalize_charset(&rest[..rest.find(quote)?])
}

fn html_meta_charset(content: &str) -> Option<String> {
    let head = &content[..content.find("</head>")?];
    let mut from = 0;
    while let Some(pos) = head[from..].find("<meta") {
        let tag_start = from + pos;
        let tag_end = head[tag_start..].find('>').map_or(head.len(), |e| tag_start + e);
        let tag = &head[tag_start..tag_end];
        if let Some(at) = tag.find("charset=") {
            let value = &tag[at + "charset=".len()..];
            let value = value.trim_start_matches(['"', '\'']);
            let end = value
                .find(|c: char| c == '"' || c == '\'' || c == ';' || c.is_whitespace() || c == '/')
                .unwrap_or(value.len());
            if let Some(found) = normalize_charset(&value[..end]) {
                return Some(found);
            }
        }
        from = tag_end;
    }
    None
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Doctype {
    None,
    LegacyHtml,
    Html4,
    Xhtml,
    Xml,
}

fn bom_charset(body: &[u8]) -> Option<&'static str> {
    if body.starts_with(&[0xEF, 0xBB, 0xBF]) {
        Some("UTF-8")
    } else if body.starts_with(&[0xFE, 0xFF]) {
        Some("UTF-16BE")
    } else if body.starts_with(&[0xFF, 0xFE]) {
        Some("UTF-16LE")
    } else {
        None
    }
}

/// Guesses the character set of a body.
///
/// A byte order mark is authoritative. Otherwise declarations inside the
/// document (XML prolog, HTML `<meta>`) win over the `Content-Type` charset;
/// HTML doctypes and XML imply their own defaults.
pub fn detect_charset(content_type: &str, body: &[u8]) -> String {
    if let Some(charset) = bom_charset(body) {
        return charset.to_string();
    }
    let sample = &body[..body.len().min(CHARSET_SAMPLE)];
    // ISO-8859-1 maps every byte to one char, so offsets stay meaningful.
    let content: String = sample
        .iter()
        .map(|&b| char::from(b.to_ascii_lowercase()))
        .collect();
    let content = content.trim_start();
    let content_type = content_type.to_ascii_lowercase();
    let declared = charset_from_content_type(&content_type);

    let doctype = if content.starts_with("<!doctype") {
        match content.find('>') {
            Some(end) if content[..end].contains("xhtml 1") => Doctype::Xhtml,
            Some(end) if content[..end].contains("html 4") => Doctype::Html4,
            Some(end) if content[..end].contains("html") => Doctype::LegacyHtml,
            _ => Doctype::None,
        }
    } else if content.starts_with("<?xml") {
        Doctype::Xml
    } else {
        Doctype::None
    };

    let mut found = None;
    if doctype == Doctype::Xhtml || doctype == Doctype::Xml || content_type.contains("xml") {
        found = xml_encoding(content);
    }
    if found.is_none() && (content_type.contains("htm") || doctype >= Doctype::Xhtml) {
        found = html_meta_charset(content);
        if found.is_none() && declared.is_none() {
            match doctype {
                Doctype::LegacyHtml => return "US-ASCII".to_string(),
                Doctype::Html4 => return DEFAULT_CHARSET.to_string(),
                _ => {}
            }
        }
    }

    found
        .or(declared)
        .unwrap_or_else(|| match doctype {
            Doctype::Xml => "UTF-8".to_string(),
            _ => DEFAULT_CHARSET.to_string(),
        })
}

impl ExchangeState {
    fn content_coding(&self) -> ContentCoding {
        let headers = match self.request_type {
            RequestType::RespMod => &self.res_headers,
            _ => &self.req_headers,
        };
        ContentCoding::from_header(headers.get("content-encoding"))
    }

    /// The body under adaptation carries an HTTP content coding.
    pub fn is_compressed(&self) -> bool {
        self.content_coding() != ContentCoding::Identity
    }

    /// Replaces the body under adaptation with its decoded form.
    ///
    /// Headers are left untouched: the body is expected to be re-encoded
    /// with [`compress_body`](Self::compress_body) before it is returned.
    pub fn uncompress_body(&mut self) -> IcapResult<bool> {
        let coding = self.content_coding();
        if coding == ContentCoding::Identity || self.body().is_empty() {
            return Ok(false);
        }
        let decoded = decode(coding, self.body())?;
        trace!(from = self.body().len(), to = decoded.len(), ?coding, "body decoded");
        *self.body_mut() = decoded;
        Ok(true)
    }

    /// Encodes the body under adaptation.
    ///
    /// An already declared coding is re-applied. Otherwise the coding
    /// accepted by the HTTP client is used and announced with a new
    /// `Content-Encoding` header. Returns the coding applied.
    pub fn compress_body(&mut self) -> IcapResult<ContentCoding> {
        if self.body().is_empty() {
            return Ok(ContentCoding::Identity);
        }
        let declared = self.content_coding();
        if declared != ContentCoding::Identity {
            let encoded = encode(declared, self.body())?;
            *self.body_mut() = encoded;
            return Ok(declared);
        }

        if self.request_type == RequestType::RespMod && self.res_headers.contains("content-encoding")
        {
            return Ok(ContentCoding::Identity);
        }
        let accepted = ContentCoding::from_header(self.req_headers.get("accept-encoding"));
        let Some(name) = accepted.header_value() else {
            return Ok(ContentCoding::Identity);
        };
        let encoded = encode(accepted, self.body())?;
        *self.body_mut() = encoded;
        self.set_http_header("Content-Encoding", name);
        Ok(accepted)
    }

    /// Character set of the body under adaptation.
    pub fn character_encoding(&self) -> String {
        let content_type = self.http_headers().get("content-type").unwrap_or_default();
        detect_charset(content_type, self.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ContentCoding::Gzip)]
    #[case(ContentCoding::Deflate)]
    fn decoding_reverses_encoding(#[case] coding: ContentCoding) {
        let text = b"<html><body>".repeat(50);
        let packed = encode(coding, &text).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(decode(coding, &packed).unwrap(), text);
    }

    #[test]
    fn raw_deflate_streams_are_accepted() {
        let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(b"raw deflate body").unwrap();
        let raw = enc.finish().unwrap();
        assert_eq!(
            decode(ContentCoding::Deflate, &raw).unwrap(),
            b"raw deflate body"
        );
    }

    #[test]
    fn corrupt_gzip_is_a_compression_error() {
        let err = decode(ContentCoding::Gzip, b"not gzip at all").unwrap_err();
        assert!(matches!(err, Error::Compression(_)));
    }

    #[rstest]
    #[case("text/html; charset=UTF-8", "<html><head></head></html>", "UTF-8")]
    #[case("text/html", "<html><head><meta charset=\"windows-1251\"></head>", "WINDOWS-1251")]
    #[case(
        "text/html",
        "<head><meta http-equiv=\"Content-Type\" content=\"text/html; charset=koi8-r\"></head>",
        "KOI8-R"
    )]
    #[case("application/xml", "<?xml version=\"1.0\" encoding=\"Shift_JIS\"?><a/>", "SHIFT_JIS")]
    #[case("text/plain", "<?xml version=\"1.0\"?><a/>", "UTF-8")]
    #[case("text/html", "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 4.01//EN\"><p>", "ISO-8859-1")]
    #[case("text/html", "<!DOCTYPE html><p>", "US-ASCII")]
    #[case("application/octet-stream", "\u{1}\u{2}", "ISO-8859-1")]
    #[case("text/html; charset=iso-8859-1", "\u{feff}<html>", "UTF-8")]
    fn charset_detection(#[case] content_type: &str, #[case] body: &str, #[case] expected: &str) {
        assert_eq!(detect_charset(content_type, body.as_bytes()), expected);
    }

    #[test]
    fn compress_body_follows_accept_encoding() {
        let mut state = ExchangeState::new();
        state.request_type = RequestType::RespMod;
        state.req_headers.insert("accept-encoding", "gzip, deflate");
        state.res_header = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n".to_vec();
        state.res_headers.insert("content-type", "text/plain");
        state.res_body = b"hello hello hello hello".to_vec();

        assert_eq!(state.compress_body().unwrap(), ContentCoding::Gzip);
        assert!(state.is_compressed());
        assert!(
            String::from_utf8_lossy(state.response_header()).contains("Content-Encoding: gzip\r\n")
        );
        assert!(state.uncompress_body().unwrap());
        assert_eq!(state.response_body(), b"hello hello hello hello");
    }
}
