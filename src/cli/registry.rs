//! Handler registry: registration, compilation, help, suggestions, history.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::cli::pattern::{tokenize, Pattern, PatternItem};
use crate::cli::response::Responses;
use crate::cli::{Command, HandlerCall, ResponseSink};
use crate::daemon::Daemon;
use crate::error::{Error, Result};

/// Registration record for one command family.
///
/// Installed at startup and never removed. `record` is false only for
/// handlers whose invocations must not enter history (`read`).
pub struct Handler {
    /// One-line summary shown by bare `help`.
    pub help_short: &'static str,
    /// Long-form help shown by `help <command>`.
    pub help_long: &'static str,
    /// Pattern templates this handler answers.
    pub patterns: Vec<&'static str>,
    /// Whether compiled commands of this handler enter history.
    pub record: bool,
    /// Whether the dispatcher holds the command lock for the handler's
    /// whole run. Long-running handlers (`read`, `mesh send`) opt out and
    /// reacquire the lock per subcommand instead.
    pub lock: bool,
    /// The handler body.
    pub call: HandlerCall,
}

impl Handler {
    /// A handler that streams batches into the sink itself.
    pub fn streaming<F, Fut>(
        help_short: &'static str,
        help_long: &'static str,
        patterns: Vec<&'static str>,
        f: F,
    ) -> Self
    where
        F: Fn(Arc<Daemon>, Command, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            help_short,
            help_long,
            patterns,
            record: true,
            lock: true,
            call: Arc::new(move |daemon, cmd, sink| Box::pin(f(daemon, cmd, sink))),
        }
    }

    /// A handler that produces a single batch of responses; the wrapper
    /// sends it and closes the sink.
    pub fn simple<F, Fut>(
        help_short: &'static str,
        help_long: &'static str,
        patterns: Vec<&'static str>,
        f: F,
    ) -> Self
    where
        F: Fn(Arc<Daemon>, Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Responses> + Send + 'static,
    {
        Self::streaming(help_short, help_long, patterns, move |daemon, cmd, sink| {
            let fut = f(daemon, cmd);
            async move {
                let responses = fut.await;
                let _ = sink.send(responses).await;
            }
        })
    }

    /// Mark this handler's commands as excluded from history.
    pub fn no_record(mut self) -> Self {
        self.record = false;
        self
    }

    /// Run without holding the command lock; the handler reacquires it per
    /// subcommand.
    pub fn unlocked(mut self) -> Self {
        self.lock = false;
        self
    }
}

struct Registered {
    pattern: Pattern,
    handler: usize,
}

/// The set of installed handlers and their compiled pattern index.
#[derive(Default)]
pub struct Registry {
    handlers: Vec<Arc<Handler>>,
    patterns: Vec<Registered>,
}

/// Alias kept for handler-table signatures.
pub type HandlerFn = HandlerCall;

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install one handler, parsing and indexing its patterns.
    ///
    /// Fails if a pattern is malformed or ambiguous with an already
    /// registered one (equal signatures).
    pub fn register(&mut self, handler: Handler) -> Result<()> {
        let handler = Arc::new(handler);
        let idx = self.handlers.len();

        for template in &handler.patterns {
            let pattern = Pattern::parse(template)?;
            let signature = pattern.signature();
            if let Some(existing) = self
                .patterns
                .iter()
                .find(|r| r.pattern.signature() == signature)
            {
                return Err(Error::Compile(format!(
                    "pattern {:?} is ambiguous with registered pattern {:?}",
                    template, existing.pattern.template
                )));
            }
            self.patterns.push(Registered {
                pattern,
                handler: idx,
            });
        }

        self.handlers.push(handler);
        Ok(())
    }

    /// Install a batch of handlers (one compilation unit's contribution).
    pub fn register_all(&mut self, handlers: Vec<Handler>) -> Result<()> {
        for handler in handlers {
            self.register(handler)?;
        }
        Ok(())
    }

    /// Compile one input line into a [`Command`].
    ///
    /// Blank and comment-only lines compile to `Ok(None)`. The unique
    /// most-specific matching pattern wins; no match is `"unknown command"`
    /// or, when the first word is known, `"invalid command"` with the
    /// closest template as a hint.
    pub fn compile(&self, line: &str) -> Result<Option<Command>> {
        let tokens = tokenize(line)?;
        if tokens.is_empty() {
            return Ok(None);
        }
        self.compile_tokens(line, &tokens).map(Some)
    }

    fn compile_tokens(&self, original: &str, tokens: &[String]) -> Result<Command> {
        let mut best: Option<(usize, usize, usize)> = None; // (literals, items, index)
        let mut tie = false;

        for (index, registered) in self.patterns.iter().enumerate() {
            let Some(matched) = registered.pattern.matches(tokens) else {
                continue;
            };
            let key = (matched.literals, registered.pattern.items.len(), index);
            match best {
                None => best = Some(key),
                Some((lits, items, _)) => {
                    if (matched.literals, registered.pattern.items.len()) > (lits, items) {
                        best = Some(key);
                        tie = false;
                    } else if (matched.literals, registered.pattern.items.len()) == (lits, items) {
                        tie = true;
                    }
                }
            }
        }

        let Some((_, _, index)) = best else {
            return Err(self.no_match_error(tokens));
        };
        if tie {
            return Err(Error::Compile(format!(
                "ambiguous command: {:?}",
                original.trim()
            )));
        }

        let registered = &self.patterns[index];
        let matched = registered
            .pattern
            .matches(tokens)
            .expect("winning pattern must re-match");
        let handler = &self.handlers[registered.handler];

        let mut command = Command {
            original: original.trim().to_string(),
            pattern: registered.pattern.template.clone(),
            string_args: matched.string_args,
            list_args: matched.list_args,
            bool_args: matched.bool_args,
            subcommand: None,
            source: Default::default(),
            record: handler.record,
        };

        if let Some(sub_tokens) = matched.subcommand {
            if contains_mesh_send(&sub_tokens) {
                return Err(Error::Compile(
                    "compound mesh commands are not allowed".into(),
                ));
            }
            let sub_line = sub_tokens.join(" ");
            let sub = self.compile_tokens(&sub_line, &sub_tokens)?;
            command.subcommand = Some(Box::new(sub));
        }

        debug!(pattern = %command.pattern, "compiled command");
        Ok(command)
    }

    fn no_match_error(&self, tokens: &[String]) -> Error {
        let first = &tokens[0];
        let closest = self
            .patterns
            .iter()
            .filter(|r| r.pattern.first_literal() == Some(first.as_str()))
            .max_by_key(|r| shared_literal_prefix(&r.pattern, tokens));
        match closest {
            Some(registered) => Error::Compile(format!(
                "invalid command: closest match: {}",
                registered.pattern.template
            )),
            None => Error::Compile("unknown command".into()),
        }
    }

    /// The handler registered for a compiled command's pattern.
    pub fn handler_for(&self, pattern: &str) -> Option<Arc<Handler>> {
        self.patterns
            .iter()
            .find(|r| r.pattern.template == pattern)
            .map(|r| self.handlers[r.handler].clone())
    }

    /// Bare `help`: one line per handler, sorted by first literal.
    pub fn help_all(&self) -> String {
        let mut lines: BTreeMap<String, &'static str> = BTreeMap::new();
        for registered in &self.patterns {
            if let Some(literal) = registered.pattern.first_literal() {
                lines
                    .entry(literal.to_string())
                    .or_insert(self.handlers[registered.handler].help_short);
            }
        }
        let width = lines.keys().map(String::len).max().unwrap_or(0);
        lines
            .iter()
            .map(|(name, short)| format!("{:width$} - {}\n", name, short, width = width))
            .collect()
    }

    /// `help <command>`: long help plus every pattern under that literal.
    pub fn help_for(&self, name: &str) -> Option<String> {
        let registered: Vec<&Registered> = self
            .patterns
            .iter()
            .filter(|r| r.pattern.first_literal() == Some(name))
            .collect();
        let first = registered.first()?;

        let handler = &self.handlers[first.handler];
        let mut out = String::new();
        for r in &registered {
            out.push_str(&format!("{}\n", r.pattern.template));
        }
        out.push('\n');
        out.push_str(if handler.help_long.is_empty() {
            handler.help_short
        } else {
            handler.help_long
        });
        if !out.ends_with('\n') {
            out.push('\n');
        }
        Some(out)
    }

    /// Completion candidates for a partial input line.
    pub fn suggest(&self, partial: &str) -> Vec<String> {
        let Ok(mut tokens) = tokenize(partial) else {
            return Vec::new();
        };
        let completing_new = partial.is_empty() || partial.ends_with(char::is_whitespace);
        let prefix = if completing_new {
            String::new()
        } else {
            match tokens.pop() {
                Some(t) => t,
                None => String::new(),
            }
        };

        let mut candidates = Vec::new();
        for registered in &self.patterns {
            candidates.extend(suggest_from_pattern(&registered.pattern, &tokens, &prefix));
        }
        candidates.sort();
        candidates.dedup();
        candidates
    }
}

/// Candidates for the item following `consumed` tokens in one pattern.
fn suggest_from_pattern(pattern: &Pattern, consumed: &[String], prefix: &str) -> Vec<String> {
    let mut idx = 0;
    for item in &pattern.items {
        if idx == consumed.len() {
            return match item {
                PatternItem::Literal(word) if word.starts_with(prefix) => vec![word.clone()],
                PatternItem::Choice { options, .. } => options
                    .iter()
                    .filter(|o| o.starts_with(prefix))
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            };
        }
        match item {
            PatternItem::Literal(word) => {
                if consumed[idx] != *word {
                    return Vec::new();
                }
                idx += 1;
            }
            PatternItem::Str { .. } => idx += 1,
            PatternItem::Choice { options, .. } => {
                if !options.contains(&consumed[idx]) {
                    return Vec::new();
                }
                idx += 1;
            }
            // Freeform tails; nothing to suggest past them.
            PatternItem::List { .. } | PatternItem::Subcommand => return Vec::new(),
        }
    }
    Vec::new()
}

fn shared_literal_prefix(pattern: &Pattern, tokens: &[String]) -> usize {
    let mut count = 0;
    for (item, token) in pattern.items.iter().zip(tokens) {
        match item {
            PatternItem::Literal(word) if word == token => count += 1,
            PatternItem::Literal(_) => break,
            _ => break,
        }
    }
    count
}

fn contains_mesh_send(tokens: &[String]) -> bool {
    tokens
        .windows(2)
        .any(|pair| pair[0] == "mesh" && pair[1] == "send")
}

/// In-memory command history ring.
///
/// Every successfully compiled non-nil command with `record=true` is
/// appended; `read` itself is excluded while the commands read from the
/// file record individually.
#[derive(Debug)]
pub struct History {
    ring: VecDeque<String>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl History {
    /// A history ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append one command line, evicting the oldest entry when full.
    pub fn record(&mut self, line: &str) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(line.to_string());
    }

    /// All entries, oldest first, one per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for line in &self.ring {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Empty the ring.
    pub fn clear(&mut self) {
        self.ring.clear();
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_handler() -> Handler {
        Handler::simple("echo a message", "", vec!["echo [args]..."], |_, cmd| async move {
            vec![crate::cli::Response::new("test", cmd.list("args").join(" "))]
        })
    }

    fn registry() -> Registry {
        let mut reg = Registry::new();
        reg.register(echo_handler()).unwrap();
        reg.register(Handler::simple(
            "read commands from a file",
            "",
            vec!["read <file> [check]"],
            |_, _| async move { Vec::new() },
        ).no_record())
        .unwrap();
        reg.register(Handler::simple(
            "send a command to mesh peers",
            "",
            vec!["mesh send <clients> (command)"],
            |_, _| async move { Vec::new() },
        ))
        .unwrap();
        reg
    }

    #[test]
    fn compile_captures_args_and_pattern() {
        let reg = registry();
        let cmd = reg.compile("echo hello world").unwrap().unwrap();
        assert_eq!(cmd.pattern, "echo [args]...");
        assert_eq!(cmd.original, "echo hello world");
        assert_eq!(cmd.list("args"), ["hello", "world"]);
        assert!(cmd.record);
    }

    #[test]
    fn compile_is_idempotent_on_original() {
        let reg = registry();
        let cmd = reg.compile("read boot.mm check").unwrap().unwrap();
        let again = reg.compile(&cmd.original).unwrap().unwrap();
        assert_eq!(again.pattern, cmd.pattern);
        assert_eq!(again.original, cmd.original);
    }

    #[test]
    fn blank_and_comment_compile_to_none() {
        let reg = registry();
        assert!(reg.compile("").unwrap().is_none());
        assert!(reg.compile("   ").unwrap().is_none());
        assert!(reg.compile("# just a comment").unwrap().is_none());
    }

    #[test]
    fn unknown_and_invalid_commands() {
        let reg = registry();
        let err = reg.compile("frobnicate").unwrap_err();
        assert_eq!(err.to_string(), "unknown command");

        let err = reg.compile("read").unwrap_err();
        assert!(err.to_string().starts_with("invalid command"));
        assert!(err.to_string().contains("read <file> [check]"));
    }

    #[test]
    fn read_handler_does_not_record() {
        let reg = registry();
        let cmd = reg.compile("read boot.mm").unwrap().unwrap();
        assert!(!cmd.record);
    }

    #[test]
    fn nested_compile_and_compound_guard() {
        let reg = registry();
        let cmd = reg.compile("mesh send n[0-3] echo hi").unwrap().unwrap();
        let sub = cmd.subcommand.as_deref().unwrap();
        assert_eq!(sub.pattern, "echo [args]...");
        assert_eq!(sub.list("args"), ["hi"]);

        let err = reg
            .compile("mesh send a mesh send b echo hi")
            .unwrap_err();
        assert_eq!(err.to_string(), "compound mesh commands are not allowed");
    }

    #[test]
    fn ambiguous_registration_rejected() {
        let mut reg = registry();
        let err = reg.register(Handler::simple(
            "echo again",
            "",
            vec!["echo [words]..."],
            |_, _| async move { Vec::new() },
        ));
        assert!(err.is_err());
    }

    #[test]
    fn help_contains_registered_commands() {
        let reg = registry();
        let all = reg.help_all();
        assert!(all.lines().any(|l| l.starts_with("echo")));
        let echo = reg.help_for("echo").unwrap();
        assert!(echo.contains("echo [args]..."));
        assert_eq!(reg.help_for("echo"), reg.help_for("echo"));
        assert!(reg.help_for("nope").is_none());
    }

    #[test]
    fn suggest_completes_literals_and_choices() {
        let reg = registry();
        assert_eq!(reg.suggest("ec"), vec!["echo"]);
        assert_eq!(reg.suggest("mesh "), vec!["send"]);
        assert!(reg.suggest("echo ").is_empty());
    }

    #[test]
    fn history_ring_evicts_and_clears() {
        let mut history = History::new(2);
        history.record("a");
        history.record("b");
        history.record("c");
        assert_eq!(history.dump(), "b\nc\n");
        history.clear();
        assert!(history.is_empty());
    }
}
