//! Line-oriented operator console.
//!
//! ```text
//! ADD <id> <threat>      deploy a target at the launch point
//! KILL <id>              intercept a target
//! REVIVE <id> <threat>   re-detect a destroyed target at the launch point
//! FIND <id>              show one target
//! SCAN <threshold>       list Active targets at or above a threat level
//! TREE                   dump the index, one line per level
//! COMPACT                purge announced tombstones
//! EXIT                   save and shut down
//! ```
//!
//! Keywords are case-insensitive.

use std::fmt::Write as _;
use std::str::FromStr;

use thiserror::Error;
use tmap_core::{EngineError, Position, TrackEngine};
use tracing::info;

/// Parsed operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add { id: i32, threat: i32 },
    Kill { id: i32 },
    Revive { id: i32, threat: i32 },
    Find { id: i32 },
    Scan { threshold: i32 },
    Tree,
    Compact,
    Exit,
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("'{value}' is not a valid {field}")]
    BadNumber { field: &'static str, value: String },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Lines to show the operator
    Reply(Vec<String>),
    Exit,
}

fn number(field: &'static str, token: &str) -> Result<i32, ConsoleError> {
    token.parse().map_err(|_| ConsoleError::BadNumber {
        field,
        value: token.to_string(),
    })
}

impl FromStr for Command {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((keyword, args)) = tokens.split_first() else {
            return Err(ConsoleError::Empty);
        };

        match (keyword.to_ascii_uppercase().as_str(), args) {
            ("ADD", [id, threat]) => Ok(Command::Add {
                id: number("id", id)?,
                threat: number("threat level", threat)?,
            }),
            ("ADD", _) => Err(ConsoleError::Usage("ADD <id> <threat>")),
            ("KILL", [id]) => Ok(Command::Kill {
                id: number("id", id)?,
            }),
            ("KILL", _) => Err(ConsoleError::Usage("KILL <id>")),
            ("REVIVE", [id, threat]) => Ok(Command::Revive {
                id: number("id", id)?,
                threat: number("threat level", threat)?,
            }),
            ("REVIVE", _) => Err(ConsoleError::Usage("REVIVE <id> <threat>")),
            ("FIND", [id]) => Ok(Command::Find {
                id: number("id", id)?,
            }),
            ("FIND", _) => Err(ConsoleError::Usage("FIND <id>")),
            ("SCAN", [threshold]) => Ok(Command::Scan {
                threshold: number("threshold", threshold)?,
            }),
            ("SCAN", _) => Err(ConsoleError::Usage("SCAN <threshold>")),
            ("TREE", []) => Ok(Command::Tree),
            ("COMPACT", []) => Ok(Command::Compact),
            ("EXIT", []) => Ok(Command::Exit),
            ("TREE" | "COMPACT" | "EXIT", _) => Err(ConsoleError::Usage("command takes no arguments")),
            _ => Err(ConsoleError::Unknown((*keyword).to_string())),
        }
    }
}

impl Command {
    /// Runs the command against `engine`. New and revived targets appear at
    /// `launch`.
    pub fn execute(self, engine: &mut TrackEngine, launch: Position) -> Result<Outcome, ConsoleError> {
        let lines = match self {
            Command::Add { id, threat } => {
                engine.add_target(id, threat, launch)?;
                vec![format!("Target #{id:04} deployed (threat {threat})")]
            }
            Command::Kill { id } => {
                if engine.intercept(id) {
                    vec![format!("Target #{id:04} destroyed")]
                } else if engine.find(id).is_some() {
                    vec![format!("Target #{id:04} already destroyed")]
                } else {
                    vec![format!("Target #{id:04} not found")]
                }
            }
            Command::Revive { id, threat } => {
                if engine.reactivate(id, threat, launch)? {
                    vec![format!("Target #{id:04} re-detected (threat {threat})")]
                } else {
                    vec![format!("Target #{id:04} is already active")]
                }
            }
            Command::Find { id } => vec![describe(engine, id)],
            Command::Scan { threshold } => {
                let hits = engine.threat_scan(threshold);
                let mut lines = vec![format!("{} target(s) at threat >= {threshold}", hits.len())];
                lines.extend(hits.iter().map(|r| describe(engine, r.id())));
                lines
            }
            Command::Tree => {
                let levels = engine.index().levels();
                if levels.is_empty() {
                    vec!["(empty)".to_string()]
                } else {
                    levels
                        .iter()
                        .enumerate()
                        .map(|(depth, nodes)| {
                            let mut line = format!("L{depth}:");
                            for keys in nodes {
                                let _ = write!(line, " {keys:?}");
                            }
                            line
                        })
                        .collect()
                }
            }
            Command::Compact => {
                let dropped = engine.compact();
                vec![format!("{dropped} tombstone(s) purged")]
            }
            Command::Exit => {
                info!("CONSOLE    | shutdown requested");
                return Ok(Outcome::Exit);
            }
        };
        Ok(Outcome::Reply(lines))
    }
}

fn describe(engine: &TrackEngine, id: i32) -> String {
    let Some(record) = engine.find(id) else {
        return format!("Target #{id:04} not found");
    };
    let state = if record.is_active() { "ACTIVE" } else { "DESTROYED" };
    match record.position() {
        Some(p) => format!(
            "Target #{id:04} {state} threat {} at ({:.6}, {:.6}), {} sample(s)",
            record.threat_level(),
            p.lat,
            p.lon,
            record.sample_count()
        ),
        None => format!(
            "Target #{id:04} {state} threat {}",
            record.threat_level()
        ),
    }
}

/// Parses and runs one operator line.
pub fn run_line(
    engine: &mut TrackEngine,
    line: &str,
    launch: Position,
) -> Result<Outcome, ConsoleError> {
    line.parse::<Command>()?.execute(engine, launch)
}
