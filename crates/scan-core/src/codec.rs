//! Exchange codec for command trees.
//!
//! The persisted form of a scan is a hierarchical tree of tagged blocks:
//! every command serializes as an object carrying its `command` tag and its
//! typed fields, a loop carrying its children in a nested `body` list.
//!
//! ```json
//! {
//!   "scan": [
//!     {
//!       "command": "loop",
//!       "device": "xpos",
//!       "start": 0.0,
//!       "end": 5.0,
//!       "step": 1.0,
//!       "body": [
//!         { "command": "delay", "seconds": 0.5 }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Decoding reads each block, dispatches on its tag to the matching command
//! constructor, and aborts the whole decode on the first problem: an
//! unrecognized tag is `UnknownCommand`, a zero-step loop is `MalformedLoop`,
//! and no partial tree is ever returned. Opaque `script` payloads are known
//! commands and round-trip lossless.

use serde_json::Value;
use tracing::debug;

use crate::command::ScanCommand;
use crate::error::{ScanError, ScanResult};
use crate::tree::ScanTree;

/// Tags the decoder accepts, in dispatch order.
const KNOWN_TAGS: &[&str] = &["set", "wait", "delay", "log", "loop", "script"];

/// Serialize a tree to the exchange format.
pub fn encode(tree: &ScanTree) -> ScanResult<String> {
    #[derive(serde::Serialize)]
    struct ScanFile<'a> {
        scan: &'a [ScanCommand],
    }
    let text = serde_json::to_string_pretty(&ScanFile {
        scan: tree.commands(),
    })?;
    Ok(text)
}

/// Parse the exchange format back into a tree.
pub fn decode(text: &str) -> ScanResult<ScanTree> {
    let root: Value = serde_json::from_str(text)?;
    let blocks = root
        .get("scan")
        .and_then(Value::as_array)
        .ok_or_else(|| ScanError::MalformedBlock("missing top-level 'scan' list".into()))?;

    let mut commands = Vec::with_capacity(blocks.len());
    for block in blocks {
        commands.push(decode_command(block)?);
    }
    debug!(commands = commands.len(), "Decoded scan");
    ScanTree::from_commands(commands)
}

/// Write a tree to a file in the exchange format.
pub fn save(tree: &ScanTree, path: impl AsRef<std::path::Path>) -> ScanResult<()> {
    let text = encode(tree)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Read a tree from a file in the exchange format.
pub fn load(path: impl AsRef<std::path::Path>) -> ScanResult<ScanTree> {
    let text = std::fs::read_to_string(path)?;
    decode(&text)
}

/// Decode one tagged block, recursing into loop bodies.
fn decode_command(block: &Value) -> ScanResult<ScanCommand> {
    let object = block
        .as_object()
        .ok_or_else(|| ScanError::MalformedBlock("command block is not an object".into()))?;
    let tag = object
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| ScanError::MalformedBlock("command block has no 'command' tag".into()))?;

    match tag {
        "loop" => {
            let device = require_str(object, "loop", "device")?;
            let start = require_f64(object, "loop", "start")?;
            let end = require_f64(object, "loop", "end")?;
            let step = require_f64(object, "loop", "step")?;
            let body = match object.get("body") {
                None => Vec::new(),
                Some(Value::Array(blocks)) => blocks
                    .iter()
                    .map(decode_command)
                    .collect::<ScanResult<Vec<_>>>()?,
                Some(_) => {
                    return Err(ScanError::MalformedBlock(
                        "loop 'body' is not a list".into(),
                    ))
                }
            };
            let command = ScanCommand::Loop {
                device,
                start,
                end,
                step,
                body,
            };
            command.validate()?;
            Ok(command)
        }
        tag if KNOWN_TAGS.contains(&tag) => {
            // Leaf commands have no nesting; serde parses their fields.
            Ok(serde_json::from_value(block.clone())?)
        }
        other => Err(ScanError::UnknownCommand { tag: other.into() }),
    }
}

fn require_str(
    object: &serde_json::Map<String, Value>,
    tag: &str,
    field: &str,
) -> ScanResult<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ScanError::MalformedBlock(format!("'{tag}' block needs string '{field}'")))
}

fn require_f64(
    object: &serde_json::Map<String, Value>,
    tag: &str,
    field: &str,
) -> ScanResult<f64> {
    object
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| ScanError::MalformedBlock(format!("'{tag}' block needs number '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ScanTree {
        ScanTree::from_commands(vec![
            ScanCommand::Set {
                device: "setpoint".into(),
                value: 2.5,
            },
            ScanCommand::Loop {
                device: "xpos".into(),
                start: 0.0,
                end: 5.0,
                step: 1.0,
                body: vec![
                    ScanCommand::Wait {
                        device: "readback".into(),
                        value: 2.5,
                        tolerance: 0.1,
                        timeout_secs: 5.0,
                    },
                    ScanCommand::Loop {
                        device: "ypos".into(),
                        start: 5.0,
                        end: 1.0,
                        step: -1.0,
                        body: vec![ScanCommand::Log {
                            devices: vec!["readback".into()],
                        }],
                    },
                ],
            },
            ScanCommand::Script {
                name: "normalize".into(),
                source: "values /= monitor\n".into(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let tree = sample_tree();
        let text = encode(&tree).unwrap();
        let parsed = decode(&text).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn test_encode_shape() {
        let text = encode(&sample_tree()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        let outer = &value["scan"][1];
        assert_eq!(outer["command"], "loop");
        assert_eq!(outer["device"], "xpos");
        assert_eq!(outer["body"][0]["command"], "wait");
        assert_eq!(outer["body"][1]["body"][0]["command"], "log");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let text = r#"{"scan": [{"command": "teleport", "device": "xpos"}]}"#;
        let err = decode(text).unwrap_err();
        match err {
            ScanError::UnknownCommand { tag } => assert_eq!(tag, "teleport"),
            other => panic!("expected UnknownCommand, got {other}"),
        }
    }

    #[test]
    fn test_unknown_tag_nested_in_body_rejected() {
        let text = r#"{"scan": [{
            "command": "loop", "device": "xpos",
            "start": 0.0, "end": 1.0, "step": 1.0,
            "body": [{"command": "teleport"}]
        }]}"#;
        assert!(matches!(
            decode(text).unwrap_err(),
            ScanError::UnknownCommand { .. }
        ));
    }

    #[test]
    fn test_zero_step_rejected_at_decode() {
        let text = r#"{"scan": [{
            "command": "loop", "device": "xpos",
            "start": 0.0, "end": 1.0, "step": 0.0, "body": []
        }]}"#;
        assert!(matches!(
            decode(text).unwrap_err(),
            ScanError::MalformedLoop { .. }
        ));
    }

    #[test]
    fn test_missing_tag_rejected() {
        let text = r#"{"scan": [{"device": "xpos", "value": 1.0}]}"#;
        assert!(matches!(
            decode(text).unwrap_err(),
            ScanError::MalformedBlock(_)
        ));
    }

    #[test]
    fn test_wait_defaults() {
        let text = r#"{"scan": [{"command": "wait", "device": "readback", "value": 3.0}]}"#;
        let tree = decode(text).unwrap();
        match &tree.commands()[0] {
            ScanCommand::Wait {
                tolerance,
                timeout_secs,
                ..
            } => {
                assert_eq!(*tolerance, 0.1);
                assert_eq!(*timeout_secs, 30.0);
            }
            other => panic!("expected wait, got {other}"),
        }
    }

    #[test]
    fn test_empty_loop_body_omitted_and_accepted() {
        let text = r#"{"scan": [{
            "command": "loop", "device": "xpos",
            "start": 0.0, "end": 1.0, "step": 1.0
        }]}"#;
        let tree = decode(text).unwrap();
        assert_eq!(tree.commands()[0].body(), Some(&[][..]));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.json");
        let tree = sample_tree();
        save(&tree, &path).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, tree);
    }
}
