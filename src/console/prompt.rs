//! Line-oriented prompts on an explicit input/output pair.

use std::fmt;
use std::io::{self, BufRead, Stdout, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("invalid entry")]
    InvalidEntry,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Asks questions on `output` and reads the answers from `input`.
pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl Prompter<io::StdinLock<'static>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Read one line, trimmed. `None` at end of input.
    pub fn read_input(&mut self, prompt: Option<&dyn fmt::Display>) -> io::Result<Option<String>> {
        if let Some(prompt) = prompt {
            write!(self.output, "{prompt}")?;
            self.output.flush()?;
        }
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    /// Yes/no question. Anything but the non-default answer picks the
    /// default.
    pub fn confirm(&mut self, instruction: impl fmt::Display, default_yes: bool) -> io::Result<bool> {
        let hint = if default_yes { "(Y/n)" } else { "(y/N)" };
        write!(self.output, "{instruction} {hint}? ")?;
        self.output.flush()?;

        let answer = self.read_input(None)?.map(|s| s.to_lowercase());
        Ok(match answer.as_deref() {
            Some("n") if default_yes => false,
            Some("y") if !default_yes => true,
            _ => default_yes,
        })
    }

    /// Numbered selection from `items`. An empty answer (or end of input)
    /// selects nothing.
    pub fn select(
        &mut self,
        instruction: impl fmt::Display,
        items: &[String],
    ) -> Result<Option<String>, InputError> {
        writeln!(self.output, "\n{instruction} (^D when finished):")?;
        for (i, item) in items.iter().enumerate() {
            writeln!(self.output, "{}. {item}", i + 1)?;
        }
        write!(self.output, "> ")?;
        self.output.flush()?;

        let Some(answer) = self.read_input(None)? else {
            return Ok(None);
        };
        if answer.is_empty() {
            return Ok(None);
        }

        let index: usize = answer.parse().map_err(|_| InputError::InvalidEntry)?;
        index
            .checked_sub(1)
            .and_then(|i| items.get(i))
            .cloned()
            .map(Some)
            .ok_or(InputError::InvalidEntry)
    }

    pub fn into_output(self) -> W {
        self.output
    }
}
