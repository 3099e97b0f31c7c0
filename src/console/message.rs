//! ANSI-tinted console messages.

use std::fmt;
use std::io::{self, Write};

use crossterm::style::{Attribute, Color, ContentStyle, Stylize};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tint {
    Plain,
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    Grey,
    Bold,
    Underline,
}

impl Tint {
    fn style(self) -> Option<ContentStyle> {
        let style = ContentStyle::new();
        let style = match self {
            Tint::Plain => return None,
            Tint::Black => style.with(Color::Black),
            Tint::Red => style.with(Color::DarkRed),
            Tint::Green => style.with(Color::DarkGreen),
            Tint::Yellow => style.with(Color::DarkYellow),
            Tint::Blue => style.with(Color::DarkBlue),
            Tint::Magenta => style.with(Color::DarkMagenta),
            Tint::Cyan => style.with(Color::DarkCyan),
            Tint::White => style.with(Color::Grey),
            Tint::Grey => style.with(Color::DarkGrey),
            Tint::Bold => style.attribute(Attribute::Bold),
            Tint::Underline => style.attribute(Attribute::Underlined),
        };
        Some(style)
    }
}

/// A piece of console text with a single tint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    tint: Tint,
    text: String,
}

impl Message {
    pub fn new(tint: Tint, value: impl fmt::Display) -> Self {
        Self {
            tint,
            text: value.to_string(),
        }
    }

    pub fn plain(value: impl fmt::Display) -> Self {
        Self::new(Tint::Plain, value)
    }

    pub fn black(value: impl fmt::Display) -> Self {
        Self::new(Tint::Black, value)
    }

    pub fn red(value: impl fmt::Display) -> Self {
        Self::new(Tint::Red, value)
    }

    pub fn green(value: impl fmt::Display) -> Self {
        Self::new(Tint::Green, value)
    }

    pub fn yellow(value: impl fmt::Display) -> Self {
        Self::new(Tint::Yellow, value)
    }

    pub fn blue(value: impl fmt::Display) -> Self {
        Self::new(Tint::Blue, value)
    }

    pub fn magenta(value: impl fmt::Display) -> Self {
        Self::new(Tint::Magenta, value)
    }

    pub fn cyan(value: impl fmt::Display) -> Self {
        Self::new(Tint::Cyan, value)
    }

    pub fn white(value: impl fmt::Display) -> Self {
        Self::new(Tint::White, value)
    }

    pub fn grey(value: impl fmt::Display) -> Self {
        Self::new(Tint::Grey, value)
    }

    pub fn bold(value: impl fmt::Display) -> Self {
        Self::new(Tint::Bold, value)
    }

    pub fn underline(value: impl fmt::Display) -> Self {
        Self::new(Tint::Underline, value)
    }

    pub fn tint(&self) -> Tint {
        self.tint
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::plain(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self {
            tint: Tint::Plain,
            text,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tint.style() {
            Some(style) => write!(f, "{}", style.apply(&self.text)),
            None => f.write_str(&self.text),
        }
    }
}

/// Join messages with single spaces, each carrying its own tint.
pub fn render(messages: &[Message]) -> String {
    messages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn write_messages<W: Write>(out: &mut W, messages: &[Message], newline: bool) -> io::Result<()> {
    out.write_all(render(messages).as_bytes())?;
    if newline {
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// Print messages to stdout followed by a newline.
pub fn log(messages: &[Message]) {
    emit(&mut io::stdout().lock(), messages, true);
}

/// Print messages to stdout without a trailing newline (for prompts).
pub fn logf(messages: &[Message]) {
    emit(&mut io::stdout().lock(), messages, false);
}

/// Print messages to stderr followed by a newline.
pub fn elog(messages: &[Message]) {
    emit(&mut io::stderr().lock(), messages, true);
}

fn emit<W: Write>(out: &mut W, messages: &[Message], newline: bool) {
    if let Err(err) = write_messages(out, messages, newline) {
        trace!(error = %err, "console write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_message_has_no_escape_codes() {
        assert_eq!(Message::plain("hello").to_string(), "hello");
        assert_eq!(Message::from("hi").tint(), Tint::Plain);
    }

    #[test]
    fn test_tinted_message_wraps_text() {
        let bold = Message::bold("loud").to_string();
        assert!(bold.contains("loud"));

        let grey = Message::grey("quiet");
        assert_eq!(grey.text(), "quiet");
        assert!(grey.to_string().contains("quiet"));
    }

    #[test]
    fn test_messages_are_space_joined() {
        let out = render(&[Message::plain("a"), Message::plain("b"), Message::plain(3)]);
        assert_eq!(out, "a b 3");
    }

    #[test]
    fn test_write_messages_appends_newline_on_request() {
        let mut buf = Vec::new();
        write_messages(&mut buf, &[Message::plain("line")], true).unwrap();
        write_messages(&mut buf, &[Message::plain("prompt> ")], false).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "line\nprompt> ");
    }
}
