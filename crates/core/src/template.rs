// Minimal {{param}} templates for tool commands
//
// Only variable substitution is supported. There are no filters, expressions
// or conditionals, so a template can never do more than splice values in.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),

    #[error("invalid placeholder name '{0}'")]
    InvalidName(String),

    #[error("placeholder '{name}' is inside {context}; values are quoted automatically, so it must stand unquoted")]
    QuotedPlaceholder { name: String, context: &'static str },
}

/// Lexical context of a position in a `sh` script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShellContext {
    SingleQuote,
    AnsiQuote,
    DoubleQuote,
    Backtick,
    CommandSubst,
    ParamExpansion,
    Subshell,
    Comment,
}

impl ShellContext {
    fn describe(self) -> &'static str {
        match self {
            ShellContext::SingleQuote => "single quotes",
            ShellContext::AnsiQuote => "$'...' quotes",
            ShellContext::DoubleQuote => "double quotes",
            ShellContext::Backtick => "backticks",
            ShellContext::CommandSubst => "a $(...) substitution",
            ShellContext::ParamExpansion => "a ${...} expansion",
            ShellContext::Subshell => "a subshell",
            ShellContext::Comment => "a comment",
        }
    }
}

/// Tracks quoting and nesting while a shell script is scanned left to right
#[derive(Debug)]
struct ShellScanner {
    stack: Vec<ShellContext>,
    /// Set once a `<<` operator is seen. Here-document bodies expand `$`
    /// and backticks, so nothing after it can hold a value safely.
    heredoc: bool,
    word_start: bool,
}

impl Default for ShellScanner {
    fn default() -> Self {
        Self {
            stack: Vec::new(),
            heredoc: false,
            word_start: true,
        }
    }
}

impl ShellScanner {
    fn feed(&mut self, text: &str) {
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            let mut word_start = false;
            match self.stack.last().copied() {
                Some(ShellContext::Comment) => {
                    if c == '\n' {
                        self.stack.pop();
                        word_start = true;
                    }
                }
                Some(ShellContext::SingleQuote) => {
                    if c == '\'' {
                        self.stack.pop();
                    }
                }
                Some(ShellContext::AnsiQuote) => match c {
                    '\\' => {
                        chars.next();
                    }
                    '\'' => {
                        self.stack.pop();
                    }
                    _ => {}
                },
                Some(ShellContext::DoubleQuote) => match c {
                    '\\' => {
                        chars.next();
                    }
                    '"' => {
                        self.stack.pop();
                    }
                    '`' => self.stack.push(ShellContext::Backtick),
                    '$' => self.dollar(&mut chars),
                    _ => {}
                },
                top => match c {
                    '\\' => {
                        chars.next();
                    }
                    '#' if self.word_start => self.stack.push(ShellContext::Comment),
                    '\'' => self.stack.push(ShellContext::SingleQuote),
                    '"' => self.stack.push(ShellContext::DoubleQuote),
                    '`' if top == Some(ShellContext::Backtick) => {
                        self.stack.pop();
                    }
                    '`' => self.stack.push(ShellContext::Backtick),
                    '$' if chars.peek() == Some(&'\'') => {
                        chars.next();
                        self.stack.push(ShellContext::AnsiQuote);
                    }
                    '$' => self.dollar(&mut chars),
                    '<' if chars.peek() == Some(&'<') => {
                        chars.next();
                        if chars.peek() == Some(&'<') {
                            chars.next();
                        } else {
                            self.heredoc = true;
                        }
                    }
                    '(' => {
                        self.stack.push(ShellContext::Subshell);
                        word_start = true;
                    }
                    ')' if matches!(top, Some(ShellContext::Subshell | ShellContext::CommandSubst)) => {
                        self.stack.pop();
                        word_start = true;
                    }
                    '}' if top == Some(ShellContext::ParamExpansion) => {
                        self.stack.pop();
                    }
                    c if c.is_whitespace() || matches!(c, ';' | '&' | '|') => word_start = true,
                    _ => {}
                },
            }
            self.word_start = word_start;
        }
    }

    fn dollar(&mut self, chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
        match chars.peek() {
            Some('(') => {
                chars.next();
                self.stack.push(ShellContext::CommandSubst);
            }
            Some('{') => {
                chars.next();
                self.stack.push(ShellContext::ParamExpansion);
            }
            _ => {}
        }
    }

    /// Called when a placeholder is reached
    fn placeholder(&mut self) {
        self.word_start = false;
    }

    /// The innermost context that would reinterpret a quoted value, if any.
    /// Plain subshells parse words exactly like the top level.
    fn unsafe_context(&self) -> Option<&'static str> {
        let context = self
            .stack
            .iter()
            .rev()
            .copied()
            .find(|context| *context != ShellContext::Subshell);
        match context {
            Some(context) => Some(context.describe()),
            None if self.heredoc => Some("a here-document"),
            None => None,
        }
    }
}

/// A piece of a parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template. Placeholders are in the form {{param_name}}
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            literal.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let end = after_open
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + start))?;

            let name = after_open[..end].trim();
            if !is_valid_name(name) {
                return Err(TemplateError::InvalidName(name.to_string()));
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(name.to_string()));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Placeholder names, sorted and deduplicated
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// The placeholder name when the whole template is exactly one placeholder
    pub fn sole_placeholder(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [Segment::Placeholder(name)] => Some(name),
            _ => None,
        }
    }

    /// Check that every placeholder of a `sh` script sits where a
    /// single-quoted word is taken literally. Inside double quotes, backticks
    /// or a substitution the quotes added at render time would not protect
    /// the value.
    pub fn check_shell_context(&self) -> Result<(), TemplateError> {
        let mut scanner = ShellScanner::default();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => scanner.feed(text),
                Segment::Placeholder(name) => {
                    if let Some(context) = scanner.unsafe_context() {
                        return Err(TemplateError::QuotedPlaceholder {
                            name: name.clone(),
                            context,
                        });
                    }
                    scanner.placeholder();
                }
            }
        }
        Ok(())
    }

    /// Render by asking `value_for` for each placeholder's replacement text
    pub fn render<F>(&self, mut value_for: F) -> String
    where
        F: FnMut(&str) -> String,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => out.push_str(&value_for(name)),
            }
        }
        out
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
