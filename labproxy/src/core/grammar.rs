//! Per-command argument grammars.
//!
//! A [`Grammar`] is a closed rule set that classifies every token of a command
//! line as plain, input-file or output-file. Classification is total: each
//! token receives exactly one [`ArgKind`], or the whole line is rejected.
//!
//! Matching follows the tools' own conventions:
//! - options are matched by exact name (`-s`, `--uuid`) and may appear anywhere
//!   before a remainder positional;
//! - prefix rules accept attached values (`-Dkey=value`);
//! - a grammar with subcommands requires one, and parsing continues with the
//!   subcommand's grammar;
//! - a `Remainder` positional (or a `Rest` option) swallows every following
//!   token as plain.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::types::ArgKind;

static SERIAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\S+$").unwrap());
static UDID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[0-9a-f]{40}|[0-9A-Fa-f]{8}-[0-9A-Fa-f]{16})$").unwrap()
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrammarError {
    #[error("unrecognized option {0:?}")]
    UnknownOption(String),
    #[error("option {0} expects a value")]
    MissingValue(String),
    #[error("invalid {what}: {value:?}")]
    InvalidValue { what: &'static str, value: String },
    #[error("unexpected argument {0:?}")]
    UnexpectedArgument(String),
    #[error("missing required argument <{0}>")]
    MissingArgument(&'static str),
    #[error("unknown subcommand {0:?}")]
    UnknownSubcommand(String),
    #[error("missing subcommand (expected one of: {0})")]
    MissingSubcommand(String),
}

/// What an option or positional accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// Boolean switch, consumes no value. Only meaningful for options.
    Flag,
    Text,
    Int,
    Choice(&'static [&'static str]),
    /// Android device serial (`adb -s`).
    AndroidSerial,
    /// iOS device UDID (`-u`).
    IosUdid,
    InputFile,
    OutputFile,
    /// Option whose value is every remaining token (`--args a b c`).
    Rest,
}

impl Value {
    fn kind(self) -> ArgKind {
        match self {
            Value::InputFile => ArgKind::InputFile,
            Value::OutputFile => ArgKind::OutputFile,
            _ => ArgKind::Plain,
        }
    }

    fn check(self, token: &str) -> Result<(), GrammarError> {
        let invalid = |what| {
            Err(GrammarError::InvalidValue {
                what,
                value: token.to_string(),
            })
        };
        match self {
            Value::Flag | Value::Text | Value::Rest | Value::InputFile | Value::OutputFile => {
                Ok(())
            }
            Value::Int if token.parse::<i64>().is_ok() => Ok(()),
            Value::Int => invalid("integer"),
            Value::Choice(choices) if choices.contains(&token) => Ok(()),
            Value::Choice(_) => invalid("choice"),
            Value::AndroidSerial if SERIAL_RE.is_match(token) => Ok(()),
            Value::AndroidSerial => invalid("Android device id"),
            Value::IosUdid if UDID_RE.is_match(token) => Ok(()),
            Value::IosUdid => invalid("iOS device id"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionRule {
    pub names: &'static [&'static str],
    pub value: Value,
}

impl OptionRule {
    pub const fn flag(names: &'static [&'static str]) -> Self {
        Self {
            names,
            value: Value::Flag,
        }
    }

    pub const fn with_value(names: &'static [&'static str], value: Value) -> Self {
        Self { names, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Required,
    Optional,
    /// Consumes every remaining token, including option-like ones, as plain.
    Remainder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Positional {
    pub name: &'static str,
    pub value: Value,
    pub arity: Arity,
}

impl Positional {
    pub const fn required(name: &'static str, value: Value) -> Self {
        Self {
            name,
            value,
            arity: Arity::Required,
        }
    }

    pub const fn optional(name: &'static str, value: Value) -> Self {
        Self {
            name,
            value,
            arity: Arity::Optional,
        }
    }

    pub const fn remainder(name: &'static str) -> Self {
        Self {
            name,
            value: Value::Text,
            arity: Arity::Remainder,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Subcommand {
    pub name: &'static str,
    pub grammar: Grammar,
}

#[derive(Debug, Clone, Copy)]
pub struct Grammar {
    pub options: &'static [OptionRule],
    /// Attached-value options such as `-Dkey=value`; always plain.
    pub prefixes: &'static [&'static str],
    pub positionals: &'static [Positional],
    pub subcommands: &'static [Subcommand],
}

impl Grammar {
    pub const EMPTY: Grammar = Grammar {
        options: &[],
        prefixes: &[],
        positionals: &[],
        subcommands: &[],
    };

    /// Classify `args` (the tokens after the command name).
    ///
    /// The returned vector has the same length and order as `args`.
    pub fn classify<S: AsRef<str>>(&self, args: &[S]) -> Result<Vec<ArgKind>, GrammarError> {
        let mut kinds = Vec::with_capacity(args.len());
        let mut grammar = self;
        let mut next_positional = 0usize;
        let mut pos = 0usize;

        while pos < args.len() {
            let token = args[pos].as_ref();

            if let Some(positional) = grammar.positionals.get(next_positional)
                && positional.arity == Arity::Remainder
                && grammar.find_option(token).is_none()
            {
                kinds.extend(std::iter::repeat_n(ArgKind::Plain, args.len() - pos));
                break;
            }

            if let Some(rule) = grammar.find_option(token) {
                kinds.push(ArgKind::Plain);
                pos += 1;
                match rule.value {
                    Value::Flag => continue,
                    Value::Rest => {
                        kinds.extend(std::iter::repeat_n(ArgKind::Plain, args.len() - pos));
                        break;
                    }
                    _ => {}
                }
                let value = args
                    .get(pos)
                    .ok_or_else(|| GrammarError::MissingValue(token.to_string()))?
                    .as_ref();
                rule.value.check(value)?;
                kinds.push(rule.value.kind());
                pos += 1;
                continue;
            }

            if grammar.matches_prefix(token) {
                kinds.push(ArgKind::Plain);
                pos += 1;
                continue;
            }

            if token.len() > 1 && token.starts_with('-') {
                return Err(GrammarError::UnknownOption(token.to_string()));
            }

            if !grammar.subcommands.is_empty() && next_positional == 0 {
                let sub = grammar
                    .subcommands
                    .iter()
                    .find(|sub| sub.name == token)
                    .ok_or_else(|| GrammarError::UnknownSubcommand(token.to_string()))?;
                kinds.push(ArgKind::Plain);
                grammar = &sub.grammar;
                next_positional = 0;
                pos += 1;
                continue;
            }

            let positional = grammar
                .positionals
                .get(next_positional)
                .ok_or_else(|| GrammarError::UnexpectedArgument(token.to_string()))?;
            positional.value.check(token)?;
            kinds.push(positional.value.kind());
            next_positional += 1;
            pos += 1;
        }

        if !grammar.subcommands.is_empty() {
            let names: Vec<&str> = grammar.subcommands.iter().map(|sub| sub.name).collect();
            return Err(GrammarError::MissingSubcommand(names.join(", ")));
        }
        if let Some(missing) = grammar.positionals[next_positional.min(grammar.positionals.len())..]
            .iter()
            .find(|positional| positional.arity == Arity::Required)
        {
            return Err(GrammarError::MissingArgument(missing.name));
        }
        Ok(kinds)
    }

    fn find_option(&self, token: &str) -> Option<&OptionRule> {
        self.options
            .iter()
            .find(|rule| rule.names.contains(&token))
    }

    fn matches_prefix(&self, token: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| token.len() > prefix.len() && token.starts_with(prefix))
    }
}
