//! Presentation-module boundary.
//!
//! Typed-message modules convert between binary payload bytes and
//! line-oriented presentation text for one (vendor, message type) pair. The
//! modules themselves are plugins supplied by the embedder; this crate only
//! defines the seam and a registry, plus one trivial module used by tests
//! and examples.

use std::sync::Arc;

use crate::container::NmsgPayload;
use crate::error::{Error, Result};

pub const BASE_VENDOR_ID: u32 = 1;
pub const BASE_VENDOR_NAME: &str = "base";

/// Conversion between payload bytes and presentation text for one
/// (vid, msgtype).
pub trait MsgModule: Send + Sync {
    fn vid(&self) -> u32;
    fn msgtype(&self) -> u32;
    fn vendor_name(&self) -> &str;
    fn msgtype_name(&self) -> &str;

    /// Render one payload as presentation text. Multi-line renderings join
    /// their lines with `endline`.
    fn payload_to_pres(&self, payload: &NmsgPayload, endline: &str) -> Result<String>;

    /// A fresh line parser. Parsers are per-input so they may keep state
    /// across lines.
    fn parser(&self) -> Box<dyn PresParser>;
}

/// Stateful presentation-text parser: feed lines, collect finished records.
pub trait PresParser: Send {
    /// Consume one line; `Some(bytes)` when a full payload record is ready.
    fn line(&mut self, line: &str) -> Result<Option<Vec<u8>>>;
}

/// Registry of presentation modules with id and name lookups.
#[derive(Default)]
pub struct ModuleSet {
    mods: Vec<Arc<dyn MsgModule>>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn MsgModule>) {
        self.mods.push(module);
    }

    pub fn lookup(&self, vid: u32, msgtype: u32) -> Option<&Arc<dyn MsgModule>> {
        self.mods
            .iter()
            .find(|m| m.vid() == vid && m.msgtype() == msgtype)
    }

    /// Resolve a (vendor name, message type name) pair to ids.
    pub fn lookup_byname(&self, vname: &str, mname: &str) -> Result<(u32, u32)> {
        self.mods
            .iter()
            .find(|m| m.vendor_name() == vname && m.msgtype_name() == mname)
            .map(|m| (m.vid(), m.msgtype()))
            .ok_or_else(|| Error::Failure(format!("unknown message type {vname}/{mname}")))
    }

    pub fn vendor_name(&self, vid: u32) -> Option<&str> {
        self.mods.iter().find(|m| m.vid() == vid).map(|m| m.vendor_name())
    }

    pub fn msgtype_name(&self, vid: u32, msgtype: u32) -> Option<&str> {
        self.lookup(vid, msgtype).map(|m| m.msgtype_name())
    }
}

/// The simplest possible module: payload bytes are UTF-8 text, one record
/// per line.
pub struct TextModule;

pub const TEXT_MSGTYPE_ID: u32 = 1;

impl MsgModule for TextModule {
    fn vid(&self) -> u32 {
        BASE_VENDOR_ID
    }

    fn msgtype(&self) -> u32 {
        TEXT_MSGTYPE_ID
    }

    fn vendor_name(&self) -> &str {
        BASE_VENDOR_NAME
    }

    fn msgtype_name(&self) -> &str {
        "text"
    }

    fn payload_to_pres(&self, payload: &NmsgPayload, _endline: &str) -> Result<String> {
        match &payload.payload {
            Some(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            None => Ok(String::new()),
        }
    }

    fn parser(&self) -> Box<dyn PresParser> {
        Box::new(TextParser)
    }
}

struct TextParser;

impl PresParser for TextParser {
    fn line(&mut self, line: &str) -> Result<Option<Vec<u8>>> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(trimmed.as_bytes().to_vec()))
    }
}
