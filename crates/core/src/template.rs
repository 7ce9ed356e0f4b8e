//! Probe source-code templates.
//!
//! A template set holds one parameterized program per probe query. Template
//! bodies contain `{placeholder}` tokens; `{prefix}` substitutes a JSON
//! string literal of the prefix bytes (each byte rendered as the code point
//! of equal value), the remaining placeholders substitute integers.

use serde::{Deserialize, Serialize};

/// The four probe program bodies of a template set.
///
/// `get_number` doubles as the calibration program: it encodes a known
/// integer so the measurement model can be fitted against its memory
/// readings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCode {
    pub get_next_char: String,
    pub get_prefix_length_length: String,
    pub get_prefix_length: String,
    pub get_number: String,
}

/// A named probe template set bound to one submission language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSet {
    pub name: String,
    pub language: String,
    pub code: ProbeCode,
}

impl TemplateSet {
    pub fn render_next_char(&self, prefix: &[u8], limit: u32) -> String {
        self.code
            .get_next_char
            .replace("{prefix}", &json_string_literal(prefix))
            .replace("{limit}", &limit.to_string())
    }

    pub fn render_prefix_length_length(&self, prefix: &[u8]) -> String {
        self.code
            .get_prefix_length_length
            .replace("{prefix}", &json_string_literal(prefix))
    }

    pub fn render_prefix_length(&self, prefix: &[u8], length_prefix: u64, position: u32) -> String {
        self.code
            .get_prefix_length
            .replace("{prefix}", &json_string_literal(prefix))
            .replace("{length_prefix}", &length_prefix.to_string())
            .replace("{position}", &position.to_string())
    }

    pub fn render_number(&self, number: i64) -> String {
        self.code.get_number.replace("{number}", &number.to_string())
    }
}

/// Render a byte string as a JSON string literal, byte `b` becoming code
/// point `b`. This is how a prefix is embedded into probe source code.
pub fn json_string_literal(bytes: &[u8]) -> String {
    let text: String = bytes.iter().map(|&b| char::from(b)).collect();
    serde_json::to_string(&text).expect("a string always serializes")
}
