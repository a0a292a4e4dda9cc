// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Service messages emitted on step stdout
//!
//! `##buildgraph[setParameter name='env.GIT_TAG_HASH' value='v1.2-abc']`
//! sets a parameter on the running node. Values use `|` escapes:
//! `|'` `||` `|n` `|r` `|[` `|]`.

use regex::Regex;
use std::sync::OnceLock;

/// Recognized service message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMessage {
    SetParameter { name: String, value: String },
}

fn message_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*##buildgraph\[setParameter\s+name='((?:[^'|]|\|.)*)'\s+value='((?:[^'|]|\|.)*)'\s*\]\s*$")
            .expect("service message regex is valid")
    })
}

/// Parse one stdout line
pub fn parse_service_message(line: &str) -> Option<ServiceMessage> {
    let caps = message_regex().captures(line)?;
    let name = unescape(caps.get(1)?.as_str());
    if name.is_empty() {
        return None;
    }

    Some(ServiceMessage::SetParameter {
        name,
        value: unescape(caps.get(2)?.as_str()),
    })
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '|' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('|'),
        }
    }
    out
}
