//! WGSL variant preprocessor
//!
//! WGSL has no preprocessor of its own, so shader variants are produced by
//! a line-based pass over the source before compilation:
//!
//! - `#ifdef NAME` / `#ifndef NAME` / `#else` / `#endif` keep or drop lines
//!   depending on whether `NAME` is defined (blocks may nest)
//! - `${NAME}` is replaced with the value of `NAME`
//!
//! Directive lines are replaced by empty lines so line numbers in compiler
//! diagnostics still match the original source.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShaderError {
    #[error("line {line}: `#else` without matching `#ifdef`")]
    UnmatchedElse { line: usize },
    #[error("line {line}: `#endif` without matching `#ifdef`")]
    UnmatchedEndif { line: usize },
    #[error("`#ifdef` opened on line {line} is never closed")]
    UnterminatedConditional { line: usize },
    #[error("line {line}: directive `{directive}` is missing a name")]
    MissingName { line: usize, directive: String },
    #[error("line {line}: `${{{name}}}` is not defined")]
    UndefinedSubstitution { line: usize, name: String },
    #[error("line {line}: unterminated `${{` substitution")]
    UnterminatedSubstitution { line: usize },
}

/// Ordered set of preprocessor definitions baked into a shader variant
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ShaderDefines {
    values: BTreeMap<String, String>,
}

impl ShaderDefines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a flag with an empty value
    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.values.insert(name.into(), String::new());
        self
    }

    /// Define `name` as `value`
    pub fn value(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(name.into(), value.to_string());
        self
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Parse the value of `name`, if it is defined and well formed
    pub fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for ShaderDefines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if value.is_empty() {
                f.write_str(name)?;
            } else {
                write!(f, "{}={}", name, value)?;
            }
        }
        Ok(())
    }
}

struct Conditional {
    opened_at: usize,
    parent_active: bool,
    condition: bool,
    in_else: bool,
}

impl Conditional {
    fn active(&self) -> bool {
        self.parent_active && (self.condition != self.in_else)
    }
}

/// Bake `defines` into `source`
pub fn preprocess(source: &str, defines: &ShaderDefines) -> Result<String, ShaderError> {
    let mut output = String::with_capacity(source.len());
    let mut stack: Vec<Conditional> = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let line_number = index + 1;
        let active = stack.last().map_or(true, Conditional::active);
        let trimmed = line.trim_start();

        if let Some(rest) = directive(trimmed, "#ifdef").or_else(|| directive(trimmed, "#ifndef")) {
            let negate = trimmed.starts_with("#ifndef");
            let name = rest.split_whitespace().next().ok_or_else(|| ShaderError::MissingName {
                line: line_number,
                directive: if negate { "#ifndef" } else { "#ifdef" }.to_string(),
            })?;
            stack.push(Conditional {
                opened_at: line_number,
                parent_active: active,
                condition: defines.is_defined(name) != negate,
                in_else: false,
            });
            output.push('\n');
            continue;
        }

        if directive(trimmed, "#else").is_some() {
            let top = stack
                .last_mut()
                .filter(|c| !c.in_else)
                .ok_or(ShaderError::UnmatchedElse { line: line_number })?;
            top.in_else = true;
            output.push('\n');
            continue;
        }

        if directive(trimmed, "#endif").is_some() {
            stack
                .pop()
                .ok_or(ShaderError::UnmatchedEndif { line: line_number })?;
            output.push('\n');
            continue;
        }

        if active {
            substitute_into(&mut output, line, defines, line_number)?;
        }
        output.push('\n');
    }

    if let Some(open) = stack.last() {
        return Err(ShaderError::UnterminatedConditional {
            line: open.opened_at,
        });
    }

    Ok(output)
}

fn directive<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() => Some(rest.trim()),
        Some(_) => None,
    }
}

fn substitute_into(
    output: &mut String,
    line: &str,
    defines: &ShaderDefines,
    line_number: usize,
) -> Result<(), ShaderError> {
    let mut rest = line;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or(ShaderError::UnterminatedSubstitution { line: line_number })?;
        let name = &after[..end];
        let value = defines
            .get(name)
            .ok_or_else(|| ShaderError::UndefinedSubstitution {
                line: line_number,
                name: name.to_string(),
            })?;
        output.push_str(value);
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    Ok(())
}
