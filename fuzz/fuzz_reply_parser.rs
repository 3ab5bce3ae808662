//! Fuzz target for the reply/event parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_reply_parser
//!
//! Splits arbitrary bytes on `\n` and pushes each line through one
//! `ReplyParser`, the way the socket does. The parser must never panic and
//! must be reusable after rejecting a line.

#![no_main]

use libfuzzer_sys::fuzz_target;
use onionctl_core::{ControlMessage, ReplyParser};

fuzz_target!(|data: &[u8]| {
    let mut parser = ReplyParser::new();
    for line in data.split_inclusive(|b| *b == b'\n') {
        if let Ok(Some(message)) = parser.push_line(line) {
            assert!(!message.lines().is_empty());
            let _ = message.status_code();
            let _ = message.to_string();
        }
    }

    let _ = ControlMessage::from_bytes(data);
});
