//! ICAP OPTIONS response.
//!
//! The response is rendered once per listener from its [`ListenerConfig`]
//! and the modes of its adaptation service, then written verbatim for every
//! OPTIONS request.

use crate::config::ListenerConfig;
use crate::parser::wire::{CRLF, OK_200};
use crate::service::{IcapMethod, VectoringPoint};
use smallvec::SmallVec;
use std::fmt::Write;

/// Contents of the `OPTIONS` response of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub(crate) methods: SmallVec<[IcapMethod; 2]>,
    /// ISTag value, unquoted.
    pub istag: String,
    pub service: String,
    pub service_id: String,
    pub options_ttl: u32,
    pub max_connections: usize,
    /// `Allow` capabilities, e.g. `204`.
    pub allow: String,
    pub preview: Option<u32>,
    pub transfer_preview: Option<String>,
    pub transfer_complete: Option<String>,
    pub transfer_ignore: Option<String>,
    pub x_include: String,
    /// Raw `Name: value` lines.
    pub custom: Vec<String>,
}

impl ServiceOptions {
    pub fn from_config(config: &ListenerConfig, modes: VectoringPoint) -> Self {
        Self {
            methods: modes.methods(),
            istag: config.istag(),
            service: config.service_description(),
            service_id: config.service_id().to_string(),
            options_ttl: config.options_ttl,
            max_connections: config.advertised_max_connections(),
            allow: config.allow.clone(),
            preview: config.preview,
            transfer_preview: config.transfer_preview.clone(),
            transfer_complete: config.transfer_complete.clone(),
            transfer_ignore: config.transfer_ignore.clone(),
            x_include: config.x_include.clone(),
            custom: config.options_custom.clone(),
        }
    }

    /// `ISTag: "<istag>"` without line terminator.
    pub fn istag_header(&self) -> String {
        format!("ISTag: \"{}\"", self.istag)
    }

    /// Serializes the complete response, including the empty line.
    pub fn render(&self) -> Vec<u8> {
        let methods = self
            .methods
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let mut out = String::with_capacity(512);
        out.push_str(OK_200);
        // Writing into a String cannot fail.
        let _ = write!(out, "{}\r\n", self.istag_header());
        let _ = write!(out, "Service: {}\r\n", self.service);
        let _ = write!(out, "Service-ID: {}\r\n", self.service_id);
        let _ = write!(out, "Methods: {methods}\r\n");
        let _ = write!(out, "Options-TTL: {}\r\n", self.options_ttl);
        let _ = write!(out, "Max-Connections: {}\r\n", self.max_connections);
        if !self.allow.trim().is_empty() {
            let _ = write!(out, "Allow: {}\r\n", self.allow.trim());
        }
        if let Some(preview) = self.preview {
            let _ = write!(out, "Preview: {preview}\r\n");
            if let Some(exts) = &self.transfer_preview {
                let _ = write!(out, "Transfer-Preview: {exts}\r\n");
            }
            if let Some(exts) = &self.transfer_complete {
                let _ = write!(out, "Transfer-Complete: {exts}\r\n");
            }
        }
        if let Some(exts) = &self.transfer_ignore {
            let _ = write!(out, "Transfer-Ignore: {exts}\r\n");
        }
        if !self.x_include.trim().is_empty() {
            let _ = write!(out, "X-Include: {}\r\n", self.x_include.trim());
        }
        for line in &self.custom {
            let _ = write!(out, "{}\r\n", line.trim());
        }
        out.push_str("Encapsulated: null-body=0\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(CRLF);
        bytes
    }
}
