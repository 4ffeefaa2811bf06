//! # ember-filter
//!
//! The expression language behind event delivery.
//!
//! Every event carries a `target_filter`: a boolean expression evaluated
//! once per recipient to decide delivery. The same language gates which
//! events a plugin observes and powers typed tag updates. The grammar is
//! fixed across releases because compiled filters travel inside persisted
//! events — history replay must still compile them.
//!
//! ## Example
//!
//! ```rust
//! use ember_filter::{compile, Env};
//! use ember_core::Tags;
//!
//! let program = compile(r#"AsInt(Tags["count"]) >= 3"#).unwrap();
//! let mut tags = Tags::new();
//! tags.insert("count".into(), "5".into());
//! assert!(program.eval_bool(&Env::tag_update(&tags)));
//! ```

mod ast;
mod env;
mod eval;
mod parser;
mod tags;
mod token;
mod value;

pub use env::{Env, Recipient};
pub use eval::EvalError;
pub use tags::update_tags;
pub use value::Value;

use ast::Expr;
use ember_core::{Event, Room, Source};
use thiserror::Error;
use tracing::warn;

/// A filter that failed to compile.
#[derive(Debug, Error)]
#[error("filter parse error at offset {offset}: {message}")]
pub struct ParseError {
    message: String,
    offset: usize,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }

    pub(crate) fn unexpected_char(c: char, offset: usize) -> Self {
        Self::new(format!("unexpected character `{c}`"), offset)
    }
}

/// A compiled filter expression.
///
/// Compile once per distinct filter string; evaluation is cheap and
/// side-effect free.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    ast: Expr,
}

impl Program {
    /// The original expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluate to a raw [`Value`].
    pub fn eval(&self, env: &Env) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, env)
    }

    /// Evaluate as a predicate: anything but a clean boolean `true` —
    /// including a runtime fault — is `false`.
    #[must_use]
    pub fn eval_bool(&self, env: &Env) -> bool {
        match self.eval(env) {
            Ok(Value::Bool(result)) => result,
            Ok(_) => false,
            Err(err) => {
                warn!(filter = %self.source, error = %err, "filter evaluation failed, denying");
                false
            }
        }
    }
}

/// Compile an expression into a [`Program`].
///
/// # Errors
///
/// Returns a [`ParseError`] when the expression does not lex or parse.
pub fn compile(source: &str) -> Result<Program, ParseError> {
    let ast = parser::parse(source)?;
    Ok(Program {
        source: source.to_string(),
        ast,
    })
}

/// Decide whether `event` is delivered to a recipient.
///
/// Never faults: a runtime error denies. A `None` program (empty filter)
/// always passes.
#[must_use]
pub fn evaluate_target(
    program: Option<&Program>,
    room: &Room,
    source: &Source,
    recipient: Recipient<'_>,
    event: &Event,
) -> bool {
    match program {
        None => true,
        Some(program) => program.eval_bool(&Env::target(room, source, recipient, event)),
    }
}

/// Decide whether a plugin observes `event`: identical shape with an empty
/// Target.
#[must_use]
pub fn evaluate_plugin_gate(
    program: Option<&Program>,
    room: &Room,
    source: &Source,
    event: &Event,
) -> bool {
    match program {
        None => true,
        Some(program) => program.eval_bool(&Env::plugin_gate(room, source, event)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{Tags, User};

    fn fixture() -> (Room, Source, Event) {
        let room = Room::new("default", User::new("admin", "admin"));
        let mut alice = User::new("alice", "Alice");
        alice.tags.insert("Test".into(), "42".into());
        let source = Source::client(alice);
        let event = Event::new(
            room.clone(),
            source.clone(),
            "",
            "en",
            "chat",
            Tags::new(),
        );
        (room, source, event)
    }

    #[test]
    fn target_filter_selects_by_nick() {
        let (room, source, event) = fixture();
        let program = compile(r#"Target.User.Nick == "Bob""#).unwrap();
        let bob = User::new("bob", "Bob");
        let carol = User::new("carol", "Carol");

        assert!(evaluate_target(
            Some(&program),
            &room,
            &source,
            Recipient { user: &bob, client_language: "en" },
            &event,
        ));
        assert!(!evaluate_target(
            Some(&program),
            &room,
            &source,
            Recipient { user: &carol, client_language: "en" },
            &event,
        ));
    }

    #[test]
    fn source_tags_reachable_typed_and_raw() {
        let (room, source, event) = fixture();
        let target = User::new("bob", "Bob");
        let recipient = Recipient { user: &target, client_language: "en" };

        for filter in [
            r#"AsInt(Source.User.Tags["Test"]) == 42"#,
            r#"Source.User.Tags["Test"] == "42""#,
            // promoted access
            r#"Source.Tags["Test"] == "42""#,
        ] {
            let program = compile(filter).unwrap();
            assert!(
                evaluate_target(Some(&program), &room, &source, recipient, &event),
                "filter should pass: {filter}"
            );
        }

        let program = compile(r#"Source.User.Tags["Test"] == "41""#).unwrap();
        assert!(!evaluate_target(
            Some(&program),
            &room,
            &source,
            recipient,
            &event
        ));
    }

    #[test]
    fn client_language_filter() {
        let (room, source, event) = fixture();
        let program = compile(r#"Target.Client.ClientLanguage startsWith "de""#).unwrap();
        let bob = User::new("bob", "Bob");

        assert!(evaluate_target(
            Some(&program),
            &room,
            &source,
            Recipient { user: &bob, client_language: "de" },
            &event,
        ));
        assert!(!evaluate_target(
            Some(&program),
            &room,
            &source,
            Recipient { user: &bob, client_language: "en" },
            &event,
        ));
    }

    #[test]
    fn empty_program_always_passes() {
        let (room, source, event) = fixture();
        let bob = User::new("bob", "Bob");
        assert!(evaluate_target(
            None,
            &room,
            &source,
            Recipient { user: &bob, client_language: "en" },
            &event,
        ));
        assert!(evaluate_plugin_gate(None, &room, &source, &event));
    }

    #[test]
    fn plugin_gate_sees_event_fields() {
        let (room, source, mut event) = fixture();
        event.name = "chat".into();
        let program = compile(r#"Name == "chat""#).unwrap();
        assert!(evaluate_plugin_gate(Some(&program), &room, &source, &event));

        let program = compile(r#"Name == "command""#).unwrap();
        assert!(!evaluate_plugin_gate(Some(&program), &room, &source, &event));
    }

    #[test]
    fn runtime_fault_denies() {
        let (room, source, event) = fixture();
        let program = compile("1 / 0 == 0").unwrap();
        let bob = User::new("bob", "Bob");
        assert!(!evaluate_target(
            Some(&program),
            &room,
            &source,
            Recipient { user: &bob, client_language: "en" },
            &event,
        ));
    }

    #[test]
    fn non_boolean_result_denies() {
        let (room, source, event) = fixture();
        let program = compile("1 + 1").unwrap();
        let bob = User::new("bob", "Bob");
        assert!(!evaluate_target(
            Some(&program),
            &room,
            &source,
            Recipient { user: &bob, client_language: "en" },
            &event,
        ));
    }
}
