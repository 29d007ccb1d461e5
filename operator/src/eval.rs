// SPDX-License-Identifier: MIT

//! Path evaluation against unstructured content.
//!
//! The production interpolation engine is an external collaborator; the core
//! only depends on the [`Evaluator`] seam. [`PathEvaluator`] implements the
//! subset of JSONPath the template output fields use: optional leading `$`,
//! dotted map keys, `[n]` array indexing and `['key']` for keys containing
//! dots.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("evaluate [{expression}]: {problem}")]
pub struct EvalError {
    pub expression: String,
    pub problem: String,
}

impl EvalError {
    fn new(expression: &str, problem: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            problem: problem.into(),
        }
    }
}

pub trait Evaluator: Send + Sync {
    /// Resolve `path` against `content`, failing if any step is absent.
    fn evaluate(&self, path: &str, content: &Value) -> Result<Value, EvalError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PathEvaluator;

impl Evaluator for PathEvaluator {
    fn evaluate(&self, path: &str, content: &Value) -> Result<Value, EvalError> {
        let mut current = content;
        for step in parse_path(path).map_err(|p| EvalError::new(path, p))? {
            current = match (&step, current) {
                (Step::Key(k), Value::Object(map)) => map
                    .get(k.as_str())
                    .ok_or_else(|| EvalError::new(path, format!("key [{k}] not found")))?,
                (Step::Key(k), _) => {
                    return Err(EvalError::new(path, format!("key [{k}] on non-object value")))
                }
                (Step::Index(i), Value::Array(items)) => items
                    .get(*i)
                    .ok_or_else(|| EvalError::new(path, format!("index [{i}] out of bounds")))?,
                (Step::Index(i), _) => {
                    return Err(EvalError::new(path, format!("index [{i}] on non-array value")))
                }
            };
        }
        Ok(current.clone())
    }
}

#[derive(Debug, PartialEq)]
enum Step {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Step>, String> {
    let trimmed = path.strip_prefix('$').unwrap_or(path);
    let mut steps = Vec::new();
    let mut chars = trimmed.chars();
    let mut key = String::new();
    let mut flush = |key: &mut String, steps: &mut Vec<Step>| {
        if !key.is_empty() {
            steps.push(Step::Key(std::mem::take(key)));
        }
    };
    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut key, &mut steps),
            '[' => {
                flush(&mut key, &mut steps);
                let mut inner = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    inner.push(c);
                }
                if let Some(quoted) = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                {
                    steps.push(Step::Key(quoted.to_string()));
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| format!("bad index [{inner}]"))?;
                    steps.push(Step::Index(index));
                }
            }
            _ => key.push(c),
        }
    }
    flush(&mut key, &mut steps);
    if steps.is_empty() {
        return Err("empty path".to_string());
    }
    Ok(steps)
}
