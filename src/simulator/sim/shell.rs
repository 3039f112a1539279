use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  Step(u32), // Step N instructions
  Quit,
  Continue,
  /// Print `count` elements of `bank` starting at row `addr`.
  Examine { bank: u32, addr: usize, count: usize },
}

const HELP: &str = "Use Enter to step, 'si N' to step N times, 'c' to continue, 'x BANK ADDR N' to examine a bank, 'q' to quit";

fn parse_num<T: std::str::FromStr>(s: Option<&str>, what: &str) -> std::result::Result<T, String>
where
  T::Err: std::fmt::Display,
{
  let s = s.ok_or_else(|| format!("missing {}", what))?;
  s.parse::<T>().map_err(|e| format!("invalid {} '{}': {}", what, s, e))
}

/// Parse one shell line. `Err` carries the message shown to the user.
pub fn parse_command(line: &str) -> std::result::Result<Command, String> {
  let trimmed = line.trim();

  // Empty input: step once
  if trimmed.is_empty() {
    return Ok(Command::Step(1));
  }

  let mut words = trimmed.split_whitespace();
  match words.next() {
    Some("si") => match parse_num::<u32>(words.next(), "step count")? {
      0 => Err("step count must be greater than 0".to_string()),
      n => Ok(Command::Step(n)),
    },
    Some("q") => Ok(Command::Quit),
    Some("c") => Ok(Command::Continue),
    Some("x") => Ok(Command::Examine {
      bank: parse_num(words.next(), "bank id")?,
      addr: parse_num(words.next(), "address")?,
      count: parse_num(words.next(), "element count")?,
    }),
    _ => Err(format!("Unknown command: '{}'. {}", trimmed, HELP)),
  }
}

pub struct Shell {
  editor: DefaultEditor,
}

impl Shell {
  pub fn new() -> Result<Self> {
    let editor = DefaultEditor::new().map_err(io::Error::other)?;
    Ok(Self { editor })
  }

  pub fn read_command(&mut self) -> Result<Command> {
    loop {
      match self.editor.readline("(dpusim) ") {
        Ok(line) => {
          let trimmed = line.trim();
          // Add to history if not empty
          if !trimmed.is_empty() {
            let _ = self.editor.add_history_entry(trimmed);
          }
          match parse_command(trimmed) {
            Ok(cmd) => return Ok(cmd),
            Err(msg) => eprintln!("Error: {}", msg),
          }
        },
        // Ctrl-C / Ctrl-D: quit
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(Command::Quit),
        Err(err) => return Err(io::Error::other(err)),
      }
    }
  }
}
