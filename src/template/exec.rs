//! Template execution against JSON data.

use std::sync::Arc;

use serde_json::Value;

use super::parse::{Command, Node, Operand, Pipeline, Template};
use super::{TemplateError, TemplateResult, MAX_INCLUDE_DEPTH};

/// Resolves an included template name to an already loaded template.
pub(crate) type IncludeLookup<'a> = &'a (dyn Fn(&str) -> Option<Arc<Template>> + Send + Sync);

pub(crate) struct Executor<'a> {
    /// HTML-escape every interpolated value
    pub escape: bool,
    /// Missing map keys are errors instead of empty values
    pub strict: bool,
    pub includes: IncludeLookup<'a>,
}

impl Executor<'_> {
    pub fn run(&self, template: &Template, data: &Value) -> TemplateResult<String> {
        let mut out = String::new();
        self.walk(template, template.nodes(), data, &mut out, 0)?;
        Ok(out)
    }

    fn walk(
        &self,
        template: &Template,
        nodes: &[Node],
        dot: &Value,
        out: &mut String,
        depth: usize,
    ) -> TemplateResult<()> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Action(pipeline) => {
                    let value = self.pipeline(template, pipeline, dot)?;
                    self.write(out, &value);
                }
                Node::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    let branch = if truthy(&self.pipeline(template, cond, dot)?) {
                        then
                    } else {
                        otherwise
                    };
                    self.walk(template, branch, dot, out, depth)?;
                }
                Node::Range { over, body, empty } => match self.pipeline(template, over, dot)? {
                    Value::Array(items) if !items.is_empty() => {
                        for item in &items {
                            self.walk(template, body, item, out, depth)?;
                        }
                    }
                    Value::Object(map) if !map.is_empty() => {
                        for item in map.values() {
                            self.walk(template, body, item, out, depth)?;
                        }
                    }
                    Value::Null | Value::Array(_) | Value::Object(_) => {
                        self.walk(template, empty, dot, out, depth)?;
                    }
                    other => {
                        return Err(execution(
                            template,
                            format!("range can't iterate over {}", type_name(&other)),
                        ))
                    }
                },
                Node::Include(name) => {
                    if depth >= MAX_INCLUDE_DEPTH {
                        return Err(execution(
                            template,
                            format!("include of \"{}\" exceeds maximum depth {}", name, MAX_INCLUDE_DEPTH),
                        ));
                    }
                    let included =
                        (self.includes)(name).ok_or_else(|| TemplateError::NotFound(name.clone()))?;
                    self.walk(&included, included.nodes(), dot, out, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn pipeline(&self, template: &Template, pipeline: &Pipeline, dot: &Value) -> TemplateResult<Value> {
        let mut last: Option<Value> = None;
        for command in &pipeline.commands {
            let value = match command {
                Command::Operand(operand) => self.operand(template, operand, dot)?,
                Command::Call { name, args } => {
                    let mut values = args
                        .iter()
                        .map(|a| self.operand(template, a, dot))
                        .collect::<TemplateResult<Vec<_>>>()?;
                    values.extend(last.take());
                    call(name, &values).map_err(|e| execution(template, e))?
                }
            };
            last = Some(value);
        }
        Ok(last.unwrap_or(Value::Null))
    }

    fn operand(&self, template: &Template, operand: &Operand, dot: &Value) -> TemplateResult<Value> {
        Ok(match operand {
            Operand::Field(path) => return self.field(template, path, dot),
            Operand::Str(s) => Value::String(s.clone()),
            Operand::Int(n) => Value::from(*n),
            Operand::Float(n) => Value::from(*n),
            Operand::Bool(b) => Value::Bool(*b),
        })
    }

    fn field(&self, template: &Template, path: &[String], dot: &Value) -> TemplateResult<Value> {
        let mut current = dot;
        for key in path {
            match current {
                Value::Object(map) => match map.get(key) {
                    Some(value) => current = value,
                    None if self.strict => {
                        return Err(execution(template, format!("map has no entry for key \"{}\"", key)))
                    }
                    None => return Ok(Value::Null),
                },
                Value::Null if !self.strict => return Ok(Value::Null),
                other => {
                    return Err(execution(
                        template,
                        format!("can't evaluate field {} in type {}", key, type_name(other)),
                    ))
                }
            }
        }
        Ok(current.clone())
    }

    fn write(&self, out: &mut String, value: &Value) {
        let text = to_text(value);
        if self.escape {
            escape_html(&text, out);
        } else {
            out.push_str(&text);
        }
    }
}

fn execution(template: &Template, message: impl std::fmt::Display) -> TemplateError {
    TemplateError::Execution(format!("{}: {}", template.name(), message))
}

fn call(name: &str, args: &[Value]) -> Result<Value, String> {
    let text = |i: usize| args.get(i).map(to_text).unwrap_or_default();
    match name {
        "upper" => Ok(Value::String(text(0).to_uppercase())),
        "lower" => Ok(Value::String(text(0).to_lowercase())),
        "trim" => Ok(Value::String(text(0).trim().to_string())),
        "replace" => Ok(Value::String(text(0).replace(&text(1), &text(2)))),
        "contains" => Ok(Value::Bool(text(0).contains(&text(1)))),
        other => Err(format!("function \"{}\" not defined", other)),
    }
}

/// Printed form of a value; null prints as nothing.
fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

pub(crate) fn escape_html(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            '\0' => out.push('\u{FFFD}'),
            c => out.push(c),
        }
    }
}
