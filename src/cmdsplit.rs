//! Shell-like splitting of command-line style arguments.
//!
//! A four-state machine: space separates tokens only outside quotes, a
//! backslash emits the next character literally, and single or double quotes
//! open a quoted span that must be closed by the same character. End of
//! input inside an escape or quote is a hard error.

use thiserror::Error;

/// Errors from [`split`] and [`unescape`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    /// Input ended directly after a backslash.
    #[error("dangling escape at end of input")]
    DanglingEscape,
    /// Input ended inside a quoted span.
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    NormalEscaped,
    Quoted(char),
    QuotedEscaped(char),
}

/// Split `input` into tokens under the quoting and escape rules.
///
/// A trailing empty token (e.g. from a trailing separator) is suppressed.
///
/// # Errors
///
/// Returns [`SplitError`] when the input ends inside an escape or an open
/// quote.
pub fn split(input: &str) -> Result<Vec<String>, SplitError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    // Distinguishes the empty token produced by `""` from no token at all.
    let mut current_started = false;
    let mut state = State::Normal;

    for c in input.chars() {
        match state {
            State::Normal => match c {
                ' ' => {
                    if current_started {
                        tokens.push(std::mem::take(&mut current));
                        current_started = false;
                    }
                }
                '\\' => {
                    state = State::NormalEscaped;
                    current_started = true;
                }
                '\'' | '"' => {
                    state = State::Quoted(c);
                    current_started = true;
                }
                other => {
                    current.push(other);
                    current_started = true;
                }
            },
            State::NormalEscaped => {
                current.push(c);
                state = State::Normal;
            }
            State::Quoted(open) => match c {
                '\\' => state = State::QuotedEscaped(open),
                c if c == open => state = State::Normal,
                other => current.push(other),
            },
            State::QuotedEscaped(open) => {
                current.push(c);
                state = State::Quoted(open);
            }
        }
    }

    match state {
        State::Normal => {
            if current_started {
                tokens.push(current);
            }
            Ok(tokens)
        }
        State::NormalEscaped | State::QuotedEscaped(_) => Err(SplitError::DanglingEscape),
        State::Quoted(open) => Err(SplitError::UnterminatedQuote(open)),
    }
}

/// Process escapes only: no word splitting, no quoting.
///
/// Used when an escaped string was embedded as a single positional argument
/// of a scheduled command and has to be unwrapped before re-injection.
///
/// # Errors
///
/// Returns [`SplitError::DanglingEscape`] when the input ends after a
/// backslash.
pub fn unescape(input: &str) -> Result<String, SplitError> {
    let mut out = String::with_capacity(input.len());
    let mut escaped = false;

    for c in input.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }

    if escaped {
        return Err(SplitError::DanglingEscape);
    }
    Ok(out)
}
