//! Vision-fallback reply parsing.
//!
//! Clients without structured computer-use support answer a strict
//! single-action prompt in plain text. The primary grammar is one action
//! per line, verb first:
//!
//! ```text
//! CLICK 412 300
//! DOUBLE_CLICK 100 80
//! RIGHT_CLICK 200 40
//! MOVE 640 360
//! TYPE hello world
//! KEY ctrl+s
//! SCROLL 640 360 0 120
//! SCREENSHOT
//! WAIT 500
//! TASK_COMPLETE
//! ```
//!
//! When no line parses, the reply falls back to the generic tool-invocation
//! parser so a model that insists on emitting a JSON tool block still gets
//! through. Anything else is "no action" and counts against the text-retry
//! budget.

use deskclaw_core::{ControlAction, ControlActionKind};

/// One parsed vision-protocol reply.
#[derive(Debug, Clone)]
pub enum VisionCommand {
    /// The model declared the task finished.
    Complete,
    /// One action to execute.
    Act(ControlAction),
}

/// Parse a vision-protocol reply. Returns `None` when no action (and no
/// completion marker) could be extracted.
pub fn parse_reply(text: &str) -> Option<VisionCommand> {
    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*', ' ']);
        if line.is_empty() {
            continue;
        }
        if let Some(command) = parse_line(line) {
            return Some(command);
        }
    }

    // fallback: a JSON tool block naming the action
    parse_embedded_block(text)
}

fn parse_line(line: &str) -> Option<VisionCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?.to_ascii_uppercase();
    let rest: Vec<&str> = parts.collect();

    let action = |kind| action_at(kind, &rest);
    match verb.trim_end_matches([':', '.']) {
        "TASK_COMPLETE" => Some(VisionCommand::Complete),
        "CLICK" => action(ControlActionKind::Click),
        "DOUBLE_CLICK" | "DOUBLECLICK" => action(ControlActionKind::DoubleClick),
        "RIGHT_CLICK" | "RIGHTCLICK" => action(ControlActionKind::RightClick),
        "MOVE" | "MOVE_MOUSE" => action(ControlActionKind::MoveMouse),
        "TYPE" => {
            let text = line[4..].trim_start_matches(':').trim();
            (!text.is_empty()).then(|| {
                VisionCommand::Act(ControlAction {
                    kind: ControlActionKind::Type,
                    coordinate: None,
                    text: Some(text.to_string()),
                    duration_ms: None,
                    scroll: None,
                })
            })
        }
        "KEY" => {
            let combo = rest.first()?;
            Some(VisionCommand::Act(ControlAction {
                kind: ControlActionKind::Key,
                coordinate: None,
                text: Some(combo.to_string()),
                duration_ms: None,
                scroll: None,
            }))
        }
        "SCROLL" => {
            let nums = parse_numbers(&rest, 4)?;
            Some(VisionCommand::Act(ControlAction {
                kind: ControlActionKind::Scroll,
                coordinate: Some((nums[0], nums[1])),
                text: None,
                duration_ms: None,
                scroll: Some((nums[2] as i32, nums[3] as i32)),
            }))
        }
        "SCREENSHOT" => Some(VisionCommand::Act(ControlAction {
            kind: ControlActionKind::Screenshot,
            coordinate: None,
            text: None,
            duration_ms: None,
            scroll: None,
        })),
        "WAIT" => {
            let ms = rest.first()?.parse::<u64>().ok()?;
            Some(VisionCommand::Act(ControlAction {
                kind: ControlActionKind::Wait,
                coordinate: None,
                text: None,
                duration_ms: Some(ms),
                scroll: None,
            }))
        }
        _ => None,
    }
}

fn action_at(kind: ControlActionKind, rest: &[&str]) -> Option<VisionCommand> {
    let nums = parse_numbers(rest, 2)?;
    Some(VisionCommand::Act(ControlAction {
        kind,
        coordinate: Some((nums[0], nums[1])),
        text: None,
        duration_ms: None,
        scroll: None,
    }))
}

fn parse_numbers(parts: &[&str], n: usize) -> Option<Vec<f64>> {
    if parts.len() < n {
        return None;
    }
    parts[..n]
        .iter()
        .map(|p| p.trim_matches([',', '(', ')']).parse::<f64>().ok())
        .collect()
}

/// Map a generic embedded tool block onto an action.
fn parse_embedded_block(text: &str) -> Option<VisionCommand> {
    let call = deskclaw_agent::parse_tool_call(text)?;

    // both {"tool": "click", ...} and {"tool": "computer", "args": {"action": "click"}}
    let name = if call.name.eq_ignore_ascii_case("computer") {
        call.arguments.get("action")?.as_str()?.to_ascii_lowercase()
    } else {
        call.name.to_ascii_lowercase()
    };

    if name == "task_complete" || name == "done" {
        return Some(VisionCommand::Complete);
    }

    let kind = match name.as_str() {
        "click" => ControlActionKind::Click,
        "double_click" => ControlActionKind::DoubleClick,
        "right_click" => ControlActionKind::RightClick,
        "move" | "move_mouse" => ControlActionKind::MoveMouse,
        "type" => ControlActionKind::Type,
        "key" => ControlActionKind::Key,
        "scroll" => ControlActionKind::Scroll,
        "screenshot" => ControlActionKind::Screenshot,
        "wait" => ControlActionKind::Wait,
        _ => return None,
    };

    let args = &call.arguments;
    let coordinate = match (args.get("x").and_then(|v| v.as_f64()), args.get("y").and_then(|v| v.as_f64())) {
        (Some(x), Some(y)) => Some((x, y)),
        _ => None,
    };

    Some(VisionCommand::Act(ControlAction {
        kind,
        coordinate,
        text: args
            .get("text")
            .or_else(|| args.get("key"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        duration_ms: args.get("duration_ms").and_then(|v| v.as_u64()),
        scroll: match (
            args.get("dx").and_then(|v| v.as_i64()),
            args.get("dy").and_then(|v| v.as_i64()),
        ) {
            (Some(dx), Some(dy)) => Some((dx as i32, dy as i32)),
            _ => None,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(text: &str) -> ControlAction {
        match parse_reply(text) {
            Some(VisionCommand::Act(a)) => a,
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn parses_click_line() {
        let action = act("CLICK 412 300");
        assert_eq!(action.kind, ControlActionKind::Click);
        assert_eq!(action.coordinate, Some((412.0, 300.0)));
    }

    #[test]
    fn parses_click_with_surrounding_prose_lines() {
        let action = act("I can see a dialog.\nCLICK 100, 200\nThen we wait.");
        assert_eq!(action.kind, ControlActionKind::Click);
        assert_eq!(action.coordinate, Some((100.0, 200.0)));
    }

    #[test]
    fn parses_type_with_spaces() {
        let action = act("TYPE hello world");
        assert_eq!(action.kind, ControlActionKind::Type);
        assert_eq!(action.text.as_deref(), Some("hello world"));
    }

    #[test]
    fn parses_key_scroll_wait_screenshot() {
        assert_eq!(act("KEY ctrl+s").kind, ControlActionKind::Key);
        let scroll = act("SCROLL 640 360 0 120");
        assert_eq!(scroll.kind, ControlActionKind::Scroll);
        assert_eq!(scroll.scroll, Some((0, 120)));
        assert_eq!(act("WAIT 500").duration_ms, Some(500));
        assert_eq!(act("SCREENSHOT").kind, ControlActionKind::Screenshot);
    }

    #[test]
    fn parses_task_complete() {
        assert!(matches!(
            parse_reply("TASK_COMPLETE"),
            Some(VisionCommand::Complete)
        ));
        assert!(matches!(
            parse_reply("All done here.\nTASK_COMPLETE."),
            Some(VisionCommand::Complete)
        ));
    }

    #[test]
    fn falls_back_to_embedded_block() {
        let text = "```json\n{\"tool\": \"computer\", \"args\": {\"action\": \"click\", \"x\": 10, \"y\": 20}}\n```";
        let action = act(text);
        assert_eq!(action.kind, ControlActionKind::Click);
        assert_eq!(action.coordinate, Some((10.0, 20.0)));
    }

    #[test]
    fn prose_is_none() {
        assert!(parse_reply("Let me think about what to do next.").is_none());
        assert!(parse_reply("").is_none());
        assert!(parse_reply("CLICK somewhere nice").is_none());
    }

    #[test]
    fn unknown_block_tool_is_none() {
        let text = "{\"tool\": \"shell\", \"args\": {\"command\": \"ls\"}}";
        assert!(parse_reply(text).is_none());
    }
}
