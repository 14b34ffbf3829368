//! Line commands typed on stdin.

use anyhow::{anyhow, bail, Result};
use room_core::{CanvasId, SessionEvent, Vec3};

pub const HELP: &str = "\
commands:
  move <x> <y> <z> [heading]   move the local avatar
  draw <canvas> <text>         replace a canvas with the given text
  show                         print avatars, canvases and connections
  link                         print the join address for this session
  reconnect                    drop every connection and rejoin with a new id
  quit                         leave the room";

#[derive(Debug, Clone, PartialEq)]
pub enum LineCommand {
    Move { position: Vec3, heading: f32 },
    Draw { canvas_id: CanvasId, text: String },
    Show,
    Link,
    Reconnect,
    Help,
    Quit,
}

fn number(word: Option<&str>, what: &str) -> Result<f32> {
    let word = word.ok_or_else(|| anyhow!("missing {}", what))?;
    let value: f32 = word
        .parse()
        .map_err(|_| anyhow!("{} is not a number: {:?}", what, word))?;
    if !value.is_finite() {
        bail!("{} must be a finite number, got {:?}", what, word);
    }
    Ok(value)
}

/// Parse one line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<LineCommand>> {
    let line = line.trim();
    let Some((word, rest)) = line
        .split_once(char::is_whitespace)
        .or(if line.is_empty() { None } else { Some((line, "")) })
    else {
        return Ok(None);
    };
    let rest = rest.trim();

    let command = match word {
        "move" | "m" => {
            let mut parts = rest.split_whitespace();
            let x = number(parts.next(), "x")?;
            let y = number(parts.next(), "y")?;
            let z = number(parts.next(), "z")?;
            let heading = match parts.next() {
                Some(word) => number(Some(word), "heading")?,
                None => 0.0,
            };
            LineCommand::Move {
                position: Vec3::new(x, y, z),
                heading,
            }
        }
        "draw" | "d" => {
            let Some((canvas, text)) = rest.split_once(char::is_whitespace) else {
                bail!("usage: draw <canvas> <text>");
            };
            LineCommand::Draw {
                canvas_id: CanvasId::new(canvas),
                text: text.trim().to_string(),
            }
        }
        "show" | "s" => LineCommand::Show,
        "link" => LineCommand::Link,
        "reconnect" => LineCommand::Reconnect,
        "help" | "?" => LineCommand::Help,
        "quit" | "q" | "exit" => LineCommand::Quit,
        other => bail!("unknown command {:?}, try 'help'", other),
    };
    Ok(Some(command))
}

/// One line of output per session event
pub fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::SelfReady(id) => format!("* you are {}", id),
        SessionEvent::PeerJoined(avatar) => {
            format!("+ {} joined as {}", avatar.peer_id, avatar.display_name)
        }
        SessionEvent::PeerMoved(avatar) => format!(
            "~ {} at ({:.1}, {:.1}, {:.1}) facing {:.2}",
            avatar.display_name,
            avatar.position.x,
            avatar.position.y,
            avatar.position.z,
            avatar.heading
        ),
        SessionEvent::PeerLeft(id) => format!("- {} left", id),
        SessionEvent::CanvasChanged { canvas_id, image } => {
            format!("# {} now holds {} bytes", canvas_id, image.len())
        }
        SessionEvent::Status(status) => format!("! {}", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_core::{AvatarState, PeerId};

    #[test]
    fn parses_moves_with_and_without_heading() {
        assert_eq!(
            parse_line("move 1 0 1 0.5").unwrap(),
            Some(LineCommand::Move {
                position: Vec3::new(1.0, 0.0, 1.0),
                heading: 0.5
            })
        );
        assert_eq!(
            parse_line("  m -2 0 3.5 ").unwrap(),
            Some(LineCommand::Move {
                position: Vec3::new(-2.0, 0.0, 3.5),
                heading: 0.0
            })
        );
        assert!(parse_line("move 1 two 3").is_err());
        assert!(parse_line("move 1").is_err());
    }

    #[test]
    fn rejects_non_finite_coordinates() {
        assert!(parse_line("move NaN 0 0").is_err());
        assert!(parse_line("move 0 inf 0").is_err());
        assert!(parse_line("move 0 0 0 -infinity").is_err());
    }

    #[test]
    fn parses_draw_with_spaces_in_text() {
        assert_eq!(
            parse_line("draw north-0 a small house").unwrap(),
            Some(LineCommand::Draw {
                canvas_id: CanvasId::new("north-0"),
                text: "a small house".to_string()
            })
        );
        assert!(parse_line("draw north-0").is_err());
    }

    #[test]
    fn parses_single_word_commands() {
        assert_eq!(parse_line("show").unwrap(), Some(LineCommand::Show));
        assert_eq!(parse_line("link").unwrap(), Some(LineCommand::Link));
        assert_eq!(parse_line("reconnect").unwrap(), Some(LineCommand::Reconnect));
        assert_eq!(parse_line("q").unwrap(), Some(LineCommand::Quit));
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("   ").unwrap(), None);
        assert!(parse_line("dance").is_err());
    }

    #[test]
    fn describes_events() {
        let mut avatar = AvatarState::new(PeerId::new("p1"), "Ada", 0);
        avatar.position = Vec3::new(1.0, 0.0, 1.0);
        assert_eq!(
            describe(&SessionEvent::PeerJoined(avatar.clone())),
            "+ p1 joined as Ada"
        );
        assert_eq!(
            describe(&SessionEvent::PeerMoved(avatar)),
            "~ Ada at (1.0, 0.0, 1.0) facing 0.00"
        );
        assert_eq!(
            describe(&SessionEvent::PeerLeft(PeerId::new("p1"))),
            "- p1 left"
        );
    }
}
