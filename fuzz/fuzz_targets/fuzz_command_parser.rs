//! Fuzz target: `parse_command`
//!
//! Feeds arbitrary broker payloads to the command parser and checks that
//! it never panics, that oversized payloads are refused,
//! and that every failure it can attribute is answerable with an ack.
//!
//! cargo fuzz run fuzz_command_parser

#![no_main]

use libfuzzer_sys::fuzz_target;
use smartpanel::error::ErrorReason;
use smartpanel::transport::commands::{AckMessage, MAX_COMMAND_BYTES, ParseError, parse_command};

fuzz_target!(|data: &[u8]| {
    match parse_command(data) {
        Ok(env) => {
            assert!(!env.id.as_str().is_empty(), "accepted command without an id");
            let _ = env.command.kind();
        }
        Err(e) => {
            if data.len() > MAX_COMMAND_BYTES {
                assert_eq!(e.error, ParseError::TooLarge);
            }
            // Whatever id survived must serialize into an ack object.
            if let Some(id) = e.id {
                let ack = AckMessage::failed(id, ErrorReason::InvalidCommand).to_json();
                assert!(ack.starts_with(b"{") && ack.ends_with(b"}"));
            }
        }
    }
});

