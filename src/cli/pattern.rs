//! Pattern templates for the command compiler.
//!
//! A pattern is a fixed template string whose tokens take five kinds:
//! literal words, required strings `<name>`, optional strings `[name]`,
//! variadic lists `<name>...` / `[name]...`, single-choice alternations
//! `<a,b,c>` (also optional as `[a,b,c]`), and the nested-command sentinel
//! `(command)`. Optional items may only appear at the tail of a pattern,
//! and a list or the sentinel consumes the rest of the line.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// One parsed token of a pattern template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternItem {
    /// A word that must appear verbatim.
    Literal(String),
    /// A named string capture.
    Str {
        /// Field name the captured token is stored under.
        name: String,
        /// Whether the token may be absent.
        optional: bool,
    },
    /// A named variadic capture; consumes every remaining token.
    List {
        /// Field name the captured tokens are stored under.
        name: String,
        /// Whether zero tokens are acceptable.
        optional: bool,
    },
    /// A single-choice alternation; the matched word becomes a bool arg.
    Choice {
        /// Words the token may take.
        options: Vec<String>,
        /// Whether the token may be absent.
        optional: bool,
    },
    /// Nested-command sentinel; the rest of the line is compiled recursively.
    Subcommand,
}

impl PatternItem {
    fn is_optional(&self) -> bool {
        matches!(
            self,
            PatternItem::Str { optional: true, .. }
                | PatternItem::List { optional: true, .. }
                | PatternItem::Choice { optional: true, .. }
        )
    }
}

/// A pattern template parsed into items, retaining the template text.
#[derive(Debug, Clone)]
pub struct Pattern {
    /// The template exactly as registered.
    pub template: String,
    /// Parsed items, in template order.
    pub items: Vec<PatternItem>,
}

/// What a successful match captured from the input tokens.
#[derive(Debug, Default, Clone)]
pub struct MatchedArgs {
    /// Field-name → single captured token.
    pub string_args: HashMap<String, String>,
    /// Field-name → ordered captured tokens.
    pub list_args: HashMap<String, Vec<String>>,
    /// Alternation words that matched.
    pub bool_args: HashSet<String>,
    /// Tokens belonging to a nested `(command)`, if the pattern has one.
    pub subcommand: Option<Vec<String>>,
    /// Count of literal items matched; the specificity tiebreaker.
    pub literals: usize,
}

impl Pattern {
    /// Parse a template string into a [`Pattern`].
    ///
    /// Fails on malformed tokens, optional items before required ones, and
    /// items following a list or `(command)` sentinel.
    pub fn parse(template: &str) -> Result<Self> {
        let mut items = Vec::new();
        let mut seen_optional = false;
        let mut terminal = false;

        for token in template.split_whitespace() {
            if terminal {
                return Err(Error::Compile(format!(
                    "pattern {:?}: no items may follow a list or (command)",
                    template
                )));
            }
            let item = Self::parse_item(template, token)?;
            match &item {
                PatternItem::List { .. } | PatternItem::Subcommand => terminal = true,
                PatternItem::Literal(_) if seen_optional => {
                    return Err(Error::Compile(format!(
                        "pattern {:?}: required item after optional item",
                        template
                    )));
                }
                _ => {}
            }
            if item.is_optional() {
                seen_optional = true;
            } else if seen_optional && !matches!(item, PatternItem::Subcommand) {
                return Err(Error::Compile(format!(
                    "pattern {:?}: required item after optional item",
                    template
                )));
            }
            items.push(item);
        }

        if items.is_empty() {
            return Err(Error::Compile("empty pattern".into()));
        }

        Ok(Self {
            template: template.to_string(),
            items,
        })
    }

    fn parse_item(template: &str, token: &str) -> Result<PatternItem> {
        if token == "(command)" {
            return Ok(PatternItem::Subcommand);
        }

        let (body, variadic) = match token.strip_suffix("...") {
            Some(stripped) => (stripped, true),
            None => (token, false),
        };

        let (inner, optional) = if body.starts_with('<') && body.ends_with('>') {
            (&body[1..body.len() - 1], false)
        } else if body.starts_with('[') && body.ends_with(']') {
            (&body[1..body.len() - 1], true)
        } else {
            if variadic || token.contains(['<', '>', '[', ']', '(', ')']) {
                return Err(Error::Compile(format!(
                    "pattern {:?}: malformed item {:?}",
                    template, token
                )));
            }
            return Ok(PatternItem::Literal(token.to_string()));
        };

        if inner.is_empty() {
            return Err(Error::Compile(format!(
                "pattern {:?}: empty item {:?}",
                template, token
            )));
        }

        if variadic {
            return Ok(PatternItem::List {
                name: inner.to_string(),
                optional,
            });
        }

        if inner.contains(',') {
            let options: Vec<String> = inner.split(',').map(str::to_string).collect();
            if options.iter().any(String::is_empty) {
                return Err(Error::Compile(format!(
                    "pattern {:?}: empty alternation option in {:?}",
                    template, token
                )));
            }
            return Ok(PatternItem::Choice { options, optional });
        }

        Ok(PatternItem::Str {
            name: inner.to_string(),
            optional,
        })
    }

    /// Try to match `tokens` against this pattern, capturing arguments.
    ///
    /// Returns `None` when the tokens do not fit the template.
    pub fn matches(&self, tokens: &[String]) -> Option<MatchedArgs> {
        let mut args = MatchedArgs::default();
        let mut idx = 0;

        for item in &self.items {
            match item {
                PatternItem::Literal(word) => {
                    if tokens.get(idx)? != word {
                        return None;
                    }
                    idx += 1;
                    args.literals += 1;
                }
                PatternItem::Str { name, optional } => match tokens.get(idx) {
                    Some(tok) => {
                        args.string_args.insert(name.clone(), tok.clone());
                        idx += 1;
                    }
                    None if *optional => {}
                    None => return None,
                },
                PatternItem::Choice { options, optional } => match tokens.get(idx) {
                    Some(tok) if options.contains(tok) => {
                        args.bool_args.insert(tok.clone());
                        idx += 1;
                    }
                    _ if *optional => {}
                    _ => return None,
                },
                PatternItem::List { name, optional } => {
                    let rest: Vec<String> = tokens[idx..].to_vec();
                    if rest.is_empty() && !optional {
                        return None;
                    }
                    idx = tokens.len();
                    args.list_args.insert(name.clone(), rest);
                }
                PatternItem::Subcommand => {
                    let rest: Vec<String> = tokens[idx..].to_vec();
                    if rest.is_empty() {
                        return None;
                    }
                    idx = tokens.len();
                    args.subcommand = Some(rest);
                }
            }
        }

        if idx != tokens.len() {
            return None;
        }
        Some(args)
    }

    /// The names (and kind signature) this pattern would collide with.
    ///
    /// Two patterns with equal signatures are ambiguous: no input could
    /// distinguish them. The registry rejects such registrations.
    pub fn signature(&self) -> String {
        let parts: Vec<String> = self
            .items
            .iter()
            .map(|item| match item {
                PatternItem::Literal(word) => word.clone(),
                PatternItem::Str { optional: false, .. } => "<>".into(),
                PatternItem::Str { optional: true, .. } => "[]".into(),
                PatternItem::List { optional: false, .. } => "<...>".into(),
                PatternItem::List { optional: true, .. } => "[...]".into(),
                PatternItem::Choice { options, optional } => {
                    let mut sorted = options.clone();
                    sorted.sort();
                    if *optional {
                        format!("[{}]", sorted.join(","))
                    } else {
                        format!("<{}>", sorted.join(","))
                    }
                }
                PatternItem::Subcommand => "(command)".into(),
            })
            .collect();
        parts.join(" ")
    }

    /// First literal word of the pattern, used to index help text.
    pub fn first_literal(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match item {
            PatternItem::Literal(word) => Some(word.as_str()),
            _ => None,
        })
    }
}

/// Split an input line into tokens, honoring double quotes and `#` comments.
///
/// A quoted token may contain spaces and `#`; a backslash escapes the next
/// character. Everything from an unquoted `#` to end of line is dropped.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| Error::Compile("trailing backslash".into()))?;
                current.push(escaped);
                in_token = true;
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            '#' if !quoted => break,
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err(Error::Compile("unterminated quote".into()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn parse_all_item_kinds() {
        let p = Pattern::parse("vm config <memory,vcpus> [value]...").unwrap();
        assert_eq!(p.items.len(), 4);
        assert!(matches!(p.items[0], PatternItem::Literal(_)));
        assert!(matches!(p.items[2], PatternItem::Choice { .. }));
        assert!(matches!(p.items[3], PatternItem::List { optional: true, .. }));
    }

    #[test]
    fn parse_rejects_trailing_items_after_list() {
        assert!(Pattern::parse("read <file>... check").is_err());
    }

    #[test]
    fn parse_rejects_required_after_optional() {
        assert!(Pattern::parse("vm info [mask] <filter>").is_err());
    }

    #[test]
    fn literal_match() {
        let p = Pattern::parse("mesh status").unwrap();
        let m = p.matches(&toks("mesh status")).unwrap();
        assert_eq!(m.literals, 2);
        assert!(p.matches(&toks("mesh status extra")).is_none());
        assert!(p.matches(&toks("mesh")).is_none());
    }

    #[test]
    fn string_and_optional_capture() {
        let p = Pattern::parse("read <file> [check]").unwrap();

        let m = p.matches(&toks("read script.mm")).unwrap();
        assert_eq!(m.string_args["file"], "script.mm");
        assert!(!m.string_args.contains_key("check"));

        let m = p.matches(&toks("read script.mm check")).unwrap();
        assert_eq!(m.string_args["check"], "check");
    }

    #[test]
    fn choice_capture() {
        let p = Pattern::parse("vm <start,stop,kill> <target>").unwrap();
        let m = p.matches(&toks("vm start a")).unwrap();
        assert!(m.bool_args.contains("start"));
        assert_eq!(m.string_args["target"], "a");
        assert!(p.matches(&toks("vm restart a")).is_none());
    }

    #[test]
    fn list_capture() {
        let p = Pattern::parse("echo [args]...").unwrap();
        let m = p.matches(&toks("echo hello world")).unwrap();
        assert_eq!(m.list_args["args"], vec!["hello", "world"]);
        let m = p.matches(&toks("echo")).unwrap();
        assert!(m.list_args["args"].is_empty());
    }

    #[test]
    fn subcommand_capture() {
        let p = Pattern::parse("mesh send <clients> (command)").unwrap();
        let m = p.matches(&toks("mesh send n[0-4] vm info")).unwrap();
        assert_eq!(m.string_args["clients"], "n[0-4]");
        assert_eq!(m.subcommand.unwrap(), toks("vm info"));
        assert!(p.matches(&toks("mesh send n[0-4]")).is_none());
    }

    #[test]
    fn tokenize_quotes_and_comments() {
        assert_eq!(
            tokenize("echo \"hello world\" # a comment").unwrap(),
            vec!["echo".to_string(), "hello world".to_string()]
        );
        assert!(tokenize("# only a comment").unwrap().is_empty());
        assert!(tokenize("   ").unwrap().is_empty());
        assert!(tokenize("echo \"unterminated").is_err());
    }

    #[test]
    fn tokenize_escapes() {
        assert_eq!(
            tokenize(r#"echo a\ b"#).unwrap(),
            vec!["echo".to_string(), "a b".to_string()]
        );
    }

    #[test]
    fn signatures_collide_only_for_equivalent_patterns() {
        let a = Pattern::parse("vm start <target>").unwrap();
        let b = Pattern::parse("vm start <name>").unwrap();
        let c = Pattern::parse("vm stop <target>").unwrap();
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }
}
