//! Template source parsing.
//!
//! Source text is split into literal text and `{{ ... }}` actions, then the
//! actions are parsed into a small tree of nodes.

use super::{TemplateError, TemplateResult};

/// Helper functions callable from templates, with their argument count.
const FUNCTIONS: &[(&str, usize)] = &[
    ("upper", 1),
    ("lower", 1),
    ("trim", 1),
    ("replace", 3),
    ("contains", 2),
];

fn function_arity(name: &str) -> Option<usize> {
    FUNCTIONS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, arity)| *arity)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    /// `.a.b`; an empty path is the dot itself
    Field(Vec<String>),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    Operand(Operand),
    Call { name: String, args: Vec<Operand> },
}

/// Commands joined by `|`; each result is passed as the last argument of
/// the next command.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pipeline {
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    Action(Pipeline),
    If {
        cond: Pipeline,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Range {
        over: Pipeline,
        body: Vec<Node>,
        empty: Vec<Node>,
    },
    Include(String),
}

/// A parsed template.
#[derive(Debug)]
pub struct Template {
    name: String,
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(name: &str, source: &str) -> TemplateResult<Self> {
        let segments = split(name, source)?;
        let mut parser = Parser {
            name,
            segments: segments.into_iter(),
        };

        let (nodes, stop) = parser.parse_list()?;
        match stop {
            Stop::Eof => Ok(Self {
                name: name.to_string(),
                nodes,
            }),
            Stop::End(line) => Err(parser.error(line, "unexpected {{end}}")),
            Stop::Else(line) => Err(parser.error(line, "unexpected {{else}}")),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Names referenced by `{{include}}` anywhere in this template.
    pub fn includes(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_includes(&self.nodes, &mut names);
        names.dedup();
        names
    }
}

fn collect_includes(nodes: &[Node], names: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::Include(name) => names.push(name.clone()),
            Node::If {
                then, otherwise, ..
            } => {
                collect_includes(then, names);
                collect_includes(otherwise, names);
            }
            Node::Range { body, empty, .. } => {
                collect_includes(body, names);
                collect_includes(empty, names);
            }
            Node::Text(_) | Node::Action(_) => {}
        }
    }
}

// ============================================================================
// Splitting text and actions
// ============================================================================

#[derive(Debug)]
enum Segment {
    Text(String),
    Action { body: String, line: usize },
}

fn split(name: &str, source: &str) -> TemplateResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut line = 1;
    let mut trim_next = false;

    while let Some(open) = rest.find("{{") {
        let mut text = &rest[..open];
        line += text.matches('\n').count();
        if trim_next {
            text = text.trim_start();
        }

        let mut inner = &rest[open + 2..];
        if let Some(stripped) = strip_trim_marker(inner) {
            text = text.trim_end();
            inner = stripped;
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text.to_string()));
        }

        let action_line = line;
        let (body, consumed, trim_right) = if inner.trim_start().starts_with("/*") {
            let (consumed, trim_right) = comment_end(inner).ok_or_else(|| {
                TemplateError::Parse(format!("{}:{}: unclosed comment", name, action_line))
            })?;
            (None, consumed, trim_right)
        } else {
            let close = find_close(inner).ok_or_else(|| {
                TemplateError::Parse(format!("{}:{}: unclosed action", name, action_line))
            })?;
            let raw = &inner[..close];
            match raw
                .strip_suffix('-')
                .filter(|s| s.ends_with(char::is_whitespace))
            {
                Some(body) => (Some(body), close + 2, true),
                None => (Some(raw), close + 2, false),
            }
        };

        line += inner[..consumed].matches('\n').count();
        if let Some(body) = body {
            segments.push(Segment::Action {
                body: body.to_string(),
                line: action_line,
            });
        }
        rest = &inner[consumed..];
        trim_next = trim_right;
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
    Ok(segments)
}

/// `{{- ` trims whitespace before the action; the space is required so that
/// `{{-3}}` stays a number.
fn strip_trim_marker(inner: &str) -> Option<&str> {
    inner
        .strip_prefix('-')
        .filter(|s| s.starts_with(char::is_whitespace))
}

/// Offset just past the closing `}}` of a comment, and whether it trims.
fn comment_end(inner: &str) -> Option<(usize, bool)> {
    let end = inner.find("*/")? + 2;
    let close = inner[end..].find("}}")?;
    let between = inner[end..end + close].trim();
    match between {
        "" => Some((end + close + 2, false)),
        "-" => Some((end + close + 2, true)),
        _ => None,
    }
}

/// Position of the closing `}}`, skipping over quoted strings.
fn find_close(inner: &str) -> Option<usize> {
    let bytes = inner.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(b'"') if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'`' => quote = Some(b),
            None if b == b'}' && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

// ============================================================================
// Tokens inside an action
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Pipe,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn tokenize(body: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = body.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        match c {
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, 't')) => value.push('\t'),
                            Some((_, 'r')) => value.push('\r'),
                            Some((_, '"')) => value.push('"'),
                            Some((_, '\\')) => value.push('\\'),
                            Some((_, other)) => return Err(format!("unknown escape sequence \\{}", other)),
                            None => break,
                        },
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err("unterminated quoted string".to_string());
                }
                tokens.push(Token::Str(value));
            }
            '`' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '`' {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err("unterminated raw string".to_string());
                }
                tokens.push(Token::Str(value));
            }
            '.' => {
                chars.next();
                let mut path = Vec::new();
                loop {
                    let mut segment = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if !is_ident_char(c) {
                            break;
                        }
                        segment.push(c);
                        chars.next();
                    }
                    if segment.is_empty() {
                        if !path.is_empty() {
                            return Err("field name missing after '.'".to_string());
                        }
                        break;
                    }
                    path.push(segment);
                    match chars.peek() {
                        Some(&(_, '.')) => {
                            chars.next();
                        }
                        _ => break,
                    }
                }
                if let Some(&(_, c)) = chars.peek() {
                    if !c.is_whitespace() && c != '|' {
                        return Err(format!("unexpected '{}' in field", c));
                    }
                }
                tokens.push(Token::Field(path));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut end = start;
                chars.next();
                end += c.len_utf8();
                while let Some(&(i, c)) = chars.peek() {
                    if !(c.is_ascii_digit() || c == '.') {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                let text = &body[start..end];
                if let Ok(n) = text.parse::<i64>() {
                    tokens.push(Token::Int(n));
                } else if let Ok(n) = text.parse::<f64>() {
                    tokens.push(Token::Float(n));
                } else {
                    return Err(format!("bad number syntax: {:?}", text));
                }
            }
            c if is_ident_char(c) => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if !is_ident_char(c) {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                tokens.push(match ident.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    _ => Token::Ident(ident),
                });
            }
            other => return Err(format!("unexpected {:?} in action", other)),
        }
    }

    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

enum Stop {
    Eof,
    Else(usize),
    End(usize),
}

struct Parser<'a> {
    name: &'a str,
    segments: std::vec::IntoIter<Segment>,
}

impl Parser<'_> {
    fn error(&self, line: usize, message: impl std::fmt::Display) -> TemplateError {
        TemplateError::Parse(format!("{}:{}: {}", self.name, line, message))
    }

    fn parse_list(&mut self) -> TemplateResult<(Vec<Node>, Stop)> {
        let mut nodes = Vec::new();

        while let Some(segment) = self.segments.next() {
            let (body, line) = match segment {
                Segment::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Segment::Action { body, line } => (body, line),
            };

            let tokens = tokenize(&body).map_err(|e| self.error(line, e))?;
            let keyword = match tokens.first() {
                None => return Err(self.error(line, "missing value for command")),
                Some(Token::Ident(k)) => k.as_str(),
                Some(_) => "",
            };

            match keyword {
                "end" | "else" => {
                    if tokens.len() != 1 {
                        return Err(self.error(line, format!("unexpected arguments after {}", keyword)));
                    }
                    let stop = if keyword == "end" {
                        Stop::End(line)
                    } else {
                        Stop::Else(line)
                    };
                    return Ok((nodes, stop));
                }
                "if" | "range" => {
                    let pipeline = self.pipeline(&tokens[1..], line)?;
                    let (body, stop) = self.parse_list()?;
                    let alternative = match stop {
                        Stop::End(_) => Vec::new(),
                        Stop::Else(_) => match self.parse_list()? {
                            (alternative, Stop::End(_)) => alternative,
                            (_, Stop::Else(l)) => return Err(self.error(l, "unexpected {{else}}")),
                            (_, Stop::Eof) => {
                                return Err(self.error(line, format!("unexpected EOF in {}", keyword)))
                            }
                        },
                        Stop::Eof => {
                            return Err(self.error(line, format!("unexpected EOF in {}", keyword)))
                        }
                    };
                    nodes.push(if keyword == "if" {
                        Node::If {
                            cond: pipeline,
                            then: body,
                            otherwise: alternative,
                        }
                    } else {
                        Node::Range {
                            over: pipeline,
                            body,
                            empty: alternative,
                        }
                    });
                }
                "include" => match &tokens[1..] {
                    [Token::Str(name)] => nodes.push(Node::Include(name.clone())),
                    _ => {
                        return Err(self.error(line, "include expects a single quoted template name"))
                    }
                },
                _ => nodes.push(Node::Action(self.pipeline(&tokens, line)?)),
            }
        }

        Ok((nodes, Stop::Eof))
    }

    fn pipeline(&self, tokens: &[Token], line: usize) -> TemplateResult<Pipeline> {
        if tokens.is_empty() {
            return Err(self.error(line, "missing value for command"));
        }

        let mut commands = Vec::new();
        for (stage, command) in tokens.split(|t| *t == Token::Pipe).enumerate() {
            let piped = stage > 0;
            match command {
                [] => return Err(self.error(line, "missing command in pipeline")),
                [Token::Ident(name), args @ ..] => {
                    let arity = function_arity(name)
                        .ok_or_else(|| self.error(line, format!("function \"{}\" not defined", name)))?;
                    let args = args
                        .iter()
                        .map(|t| self.operand(t, line))
                        .collect::<TemplateResult<Vec<_>>>()?;
                    let given = args.len() + usize::from(piped);
                    if given != arity {
                        return Err(self.error(
                            line,
                            format!("wrong number of args for {}: want {} got {}", name, arity, given),
                        ));
                    }
                    commands.push(Command::Call {
                        name: name.clone(),
                        args,
                    });
                }
                [single] => {
                    if piped {
                        return Err(self.error(
                            line,
                            format!("non executable command in pipeline stage {}", stage + 1),
                        ));
                    }
                    commands.push(Command::Operand(self.operand(single, line)?));
                }
                [_, ..] => return Err(self.error(line, "can't give argument to non-function")),
            }
        }

        Ok(Pipeline { commands })
    }

    fn operand(&self, token: &Token, line: usize) -> TemplateResult<Operand> {
        match token {
            Token::Field(path) => Ok(Operand::Field(path.clone())),
            Token::Str(s) => Ok(Operand::Str(s.clone())),
            Token::Int(n) => Ok(Operand::Int(*n)),
            Token::Float(n) => Ok(Operand::Float(*n)),
            Token::Bool(b) => Ok(Operand::Bool(*b)),
            Token::Ident(name) => Err(self.error(line, format!("unexpected \"{}\" in operand", name))),
            Token::Pipe => Err(self.error(line, "unexpected \"|\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(path: &[&str]) -> Operand {
        Operand::Field(path.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_text_and_field() {
        let t = Template::parse("t", "Hello, {{.name}}!").unwrap();
        assert_eq!(
            t.nodes(),
            &[
                Node::Text("Hello, ".to_string()),
                Node::Action(Pipeline {
                    commands: vec![Command::Operand(field(&["name"]))]
                }),
                Node::Text("!".to_string()),
            ]
        );
    }

    #[test]
    fn test_pipeline_and_call() {
        let t = Template::parse("t", r#"{{.user.name | trim | upper}}{{replace .s "a" "b"}}"#).unwrap();
        match &t.nodes()[0] {
            Node::Action(p) => {
                assert_eq!(p.commands.len(), 3);
                assert_eq!(p.commands[0], Command::Operand(field(&["user", "name"])));
            }
            other => panic!("unexpected node {other:?}"),
        }
        assert!(matches!(&t.nodes()[1], Node::Action(p) if p.commands.len() == 1));
    }

    #[test]
    fn test_if_else_range() {
        let t = Template::parse(
            "t",
            "{{if .ok}}yes{{else}}no{{end}}{{range .items}}[{{.}}]{{else}}none{{end}}",
        )
        .unwrap();
        assert!(matches!(&t.nodes()[0], Node::If { then, otherwise, .. } if then.len() == 1 && otherwise.len() == 1));
        assert!(matches!(&t.nodes()[1], Node::Range { body, empty, .. } if body.len() == 3 && empty.len() == 1));
    }

    #[test]
    fn test_trim_markers_and_comments() {
        let t = Template::parse("t", "a  {{- .x -}}  b {{/* note */}}c").unwrap();
        assert_eq!(t.nodes()[0], Node::Text("a".to_string()));
        assert_eq!(t.nodes()[2], Node::Text("b ".to_string()));
        assert_eq!(t.nodes()[3], Node::Text("c".to_string()));
    }

    #[test]
    fn test_negative_number_is_not_trim_marker() {
        let t = Template::parse("t", "x {{-3}}").unwrap();
        assert_eq!(t.nodes()[0], Node::Text("x ".to_string()));
    }

    #[test]
    fn test_includes_are_collected() {
        let t = Template::parse(
            "t",
            r#"{{include "header.html"}}{{if .x}}{{include "body.html"}}{{end}}"#,
        )
        .unwrap();
        assert_eq!(t.includes(), vec!["header.html", "body.html"]);
    }

    #[test]
    fn test_capability_functions_are_not_defined() {
        for source in [
            r#"{{exec "id"}}"#,
            r#"{{readFile "/etc/passwd"}}"#,
            r#"{{env "HOME"}}"#,
            r#"{{shell "ls"}}"#,
            r#"{{fetch "http://x"}}"#,
            r#"{{writeFile "a" "b"}}"#,
        ] {
            let err = Template::parse("t", source).unwrap_err();
            assert!(
                matches!(&err, TemplateError::Parse(m) if m.contains("not defined")),
                "{source}: {err}"
            );
        }
    }

    #[test]
    fn test_parse_errors_carry_location() {
        let err = Template::parse("mail.html", "line1\n{{if .x}}open").unwrap_err();
        assert!(err.to_string().contains("mail.html:2: unexpected EOF in if"));

        assert!(Template::parse("t", "{{.x").is_err());
        assert!(Template::parse("t", "{{end}}").is_err());
        assert!(Template::parse("t", "{{upper}}").is_err());
        assert!(Template::parse("t", "{{.a .b}}").is_err());
        assert!(Template::parse("t", "{{.a | .b}}").is_err());
        assert!(Template::parse("t", r#"{{"unterminated}}"#).is_err());
        assert!(Template::parse("t", "{{include .name}}").is_err());
    }

    #[test]
    fn test_braces_inside_string_literal() {
        let t = Template::parse("t", r#"{{"}}" | upper}}"#).unwrap();
        assert_eq!(t.nodes().len(), 1);
    }
}
