// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Directives: the closed set of actions an agent's reply can request.
//!
//! A [`DirectiveInterpreter`] turns raw model output into [`Directive`]s. The
//! default [`LineInterpreter`] understands a small line-oriented language:
//!
//! ```text
//! CREATE src/            directory (trailing slash) or empty file
//! DELETE src/old.rs
//! READ src/lib.rs
//! DELEGATE src/parser.rs: implement the tokenizer
//! DELEGATE src/cli AFTER src/parser.rs: wire the parser into the CLI
//! DELEGATE src/net <<<
//! multi-line task
//! >>>
//! WAIT
//! RUN src
//! CHANGE src/lib.rs <<<
//! new file content
//! >>>
//! UPDATE_README <<<
//! # src
//! >>>
//! FINISH SUCCESS: parser done
//! ```
//!
//! Lines that do not start with a keyword are prose and are ignored.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ParseError;
use crate::message::Outcome;

/// One DELEGATE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    /// Child path, either relative to the manager's scope or project-relative.
    pub target: PathBuf,
    pub task: String,
    /// Sibling whose RESULT must arrive before this task is issued.
    pub after: Option<PathBuf>,
}

impl DelegationRequest {
    pub fn new(target: impl Into<PathBuf>, task: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            task: task.into(),
            after: None,
        }
    }

    pub fn after(mut self, sibling: impl Into<PathBuf>) -> Self {
        self.after = Some(sibling.into());
        self
    }
}

/// An action requested by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Create { path: PathBuf, is_dir: bool },
    Delete { path: PathBuf },
    Read { path: PathBuf },
    Delegate(DelegationRequest),
    Wait,
    Finish { outcome: Outcome, summary: String },
    Run { scope_hint: String },
    Change { path: PathBuf, content: String },
    UpdateReadme { content: String },
}

impl Directive {
    /// Keyword used for this directive in the line language and in logs.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Create { .. } => "CREATE",
            Self::Delete { .. } => "DELETE",
            Self::Read { .. } => "READ",
            Self::Delegate(_) => "DELEGATE",
            Self::Wait => "WAIT",
            Self::Finish { .. } => "FINISH",
            Self::Run { .. } => "RUN",
            Self::Change { .. } => "CHANGE",
            Self::UpdateReadme { .. } => "UPDATE_README",
        }
    }

    /// Short human-readable form, used when rejecting a directive.
    pub fn describe(&self) -> String {
        match self {
            Self::Create { path, .. } | Self::Delete { path } | Self::Read { path } => {
                format!("{} {}", self.keyword(), path.display())
            }
            Self::Change { path, .. } => format!("CHANGE {}", path.display()),
            Self::Delegate(req) => format!("DELEGATE {}", req.target.display()),
            Self::Run { scope_hint } => format!("RUN {scope_hint}"),
            Self::Wait | Self::Finish { .. } | Self::UpdateReadme { .. } => {
                self.keyword().to_string()
            }
        }
    }
}

/// Parses model output into directives.
pub trait DirectiveInterpreter: Send + Sync {
    fn parse(&self, text: &str) -> Result<Vec<Directive>, ParseError>;
}

static KEYWORD_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(CREATE|DELETE|READ|DELEGATE|WAIT|FINISH|RUN|CHANGE|UPDATE_README)\b\s*(.*)$")
        .expect("keyword pattern is valid")
});

static DELEGATE_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+)(?:\s+AFTER\s+(\S+))?$").expect("delegate pattern is valid")
});

const BLOCK_OPEN: &str = "<<<";
const BLOCK_CLOSE: &str = ">>>";

/// Default line-oriented interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineInterpreter;

impl LineInterpreter {
    pub fn new() -> Self {
        Self
    }
}

impl DirectiveInterpreter for LineInterpreter {
    fn parse(&self, text: &str) -> Result<Vec<Directive>, ParseError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut directives = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line_no = i + 1;
            let line = lines[i].trim();
            i += 1;

            let Some(caps) = KEYWORD_LINE.captures(line) else {
                continue;
            };
            let keyword = &caps[1];
            let mut rest = caps[2].trim().to_string();

            let block = if rest.ends_with(BLOCK_OPEN) {
                rest.truncate(rest.len() - BLOCK_OPEN.len());
                rest = rest.trim().to_string();
                let (body, next) = read_block(&lines, i, line_no)?;
                i = next;
                Some(body)
            } else {
                None
            };

            let directive = match keyword {
                "CREATE" => {
                    let raw = require(&rest, line_no, "CREATE requires a path")?;
                    let is_dir = raw.ends_with('/');
                    Directive::Create {
                        path: normalize_path(raw, line_no)?,
                        is_dir,
                    }
                }
                "DELETE" => Directive::Delete {
                    path: normalize_path(require(&rest, line_no, "DELETE requires a path")?, line_no)?,
                },
                "READ" => Directive::Read {
                    path: normalize_path(require(&rest, line_no, "READ requires a path")?, line_no)?,
                },
                "DELEGATE" => parse_delegate(&rest, block, line_no)?,
                "WAIT" => Directive::Wait,
                "FINISH" => parse_finish(&rest, block, line_no)?,
                "RUN" => Directive::Run {
                    scope_hint: rest.clone(),
                },
                "CHANGE" => {
                    let path = normalize_path(require(&rest, line_no, "CHANGE requires a path")?, line_no)?;
                    let content = block.ok_or_else(|| {
                        ParseError::new(line_no, "CHANGE requires a <<< content block")
                    })?;
                    Directive::Change { path, content }
                }
                "UPDATE_README" => {
                    let content = block.ok_or_else(|| {
                        ParseError::new(line_no, "UPDATE_README requires a <<< content block")
                    })?;
                    Directive::UpdateReadme { content }
                }
                other => {
                    return Err(ParseError::new(line_no, format!("unknown directive {other}")));
                }
            };
            directives.push(directive);
        }

        Ok(directives)
    }
}

fn require<'a>(rest: &'a str, line: usize, message: &str) -> Result<&'a str, ParseError> {
    if rest.is_empty() {
        Err(ParseError::new(line, message))
    } else {
        Ok(rest)
    }
}

/// Collect lines until `>>>`. Returns the body and the index after the closer.
fn read_block(lines: &[&str], start: usize, opened_at: usize) -> Result<(String, usize), ParseError> {
    let mut body = Vec::new();
    for (offset, line) in lines[start..].iter().enumerate() {
        if line.trim() == BLOCK_CLOSE {
            return Ok((body.join("\n"), start + offset + 1));
        }
        body.push(*line);
    }
    Err(ParseError::new(opened_at, "unterminated <<< block"))
}

fn parse_delegate(rest: &str, block: Option<String>, line: usize) -> Result<Directive, ParseError> {
    if rest.is_empty() {
        return Err(ParseError::new(line, "DELEGATE requires a path and a task"));
    }

    let (head, inline_task) = match rest.split_once(':') {
        Some((head, task)) => (head.trim(), Some(task.trim().to_string())),
        None => (rest, None),
    };

    let task = match (inline_task, block) {
        (Some(task), _) if !task.is_empty() => task,
        (_, Some(block)) if !block.trim().is_empty() => block,
        _ => return Err(ParseError::new(line, "DELEGATE requires a task")),
    };

    let caps = DELEGATE_HEAD
        .captures(head)
        .ok_or_else(|| ParseError::new(line, format!("malformed DELEGATE target: {head}")))?;

    let mut request = DelegationRequest::new(normalize_path(&caps[1], line)?, task);
    if let Some(after) = caps.get(2) {
        request = request.after(normalize_path(after.as_str(), line)?);
    }
    Ok(Directive::Delegate(request))
}

fn parse_finish(rest: &str, block: Option<String>, line: usize) -> Result<Directive, ParseError> {
    let (status, inline_summary) = match rest.split_once(':') {
        Some((status, summary)) => (status.trim(), summary.trim().to_string()),
        None => (rest.trim(), String::new()),
    };

    let outcome = match status {
        "" | "SUCCESS" => Outcome::Success,
        "FAILURE" => Outcome::Failure,
        other => {
            return Err(ParseError::new(line, format!("unknown FINISH status: {other}")));
        }
    };

    let summary = match block {
        Some(block) if inline_summary.is_empty() => block,
        Some(block) => format!("{inline_summary}\n{block}"),
        None => inline_summary,
    };

    Ok(Directive::Finish { outcome, summary })
}

/// Normalize a directive path to a clean project-relative form.
///
/// Strips `./` and trailing slashes; rejects absolute paths and `..`.
pub fn normalize_path(raw: &str, line: usize) -> Result<PathBuf, ParseError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let path = Path::new(trimmed);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ParseError::new(
                    line,
                    format!("path must stay inside the project: {raw}"),
                ));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ParseError::new(line, format!("empty path: {raw}")));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Vec<Directive>, ParseError> {
        LineInterpreter::new().parse(text)
    }

    #[test]
    fn test_prose_is_ignored() {
        let directives = parse("I will now split the work.\nCreate nothing yet.\n").unwrap();
        assert!(directives.is_empty());
    }

    #[test]
    fn test_structural_directives() {
        let directives = parse("CREATE src/\nCREATE src/lib.rs\nDELETE ./old.rs\nREAD src/lib.rs").unwrap();
        assert_eq!(
            directives,
            vec![
                Directive::Create { path: PathBuf::from("src"), is_dir: true },
                Directive::Create { path: PathBuf::from("src/lib.rs"), is_dir: false },
                Directive::Delete { path: PathBuf::from("old.rs") },
                Directive::Read { path: PathBuf::from("src/lib.rs") },
            ]
        );
    }

    #[test]
    fn test_delegate_inline_and_after() {
        let directives = parse(
            "DELEGATE parser.rs: write the tokenizer\nDELEGATE cli.rs AFTER parser.rs: use it\nWAIT",
        )
        .unwrap();
        assert_eq!(
            directives,
            vec![
                Directive::Delegate(DelegationRequest::new("parser.rs", "write the tokenizer")),
                Directive::Delegate(DelegationRequest::new("cli.rs", "use it").after("parser.rs")),
                Directive::Wait,
            ]
        );
    }

    #[test]
    fn test_delegate_block_task() {
        let directives = parse("DELEGATE src <<<\nline one\nline two\n>>>\nFINISH").unwrap();
        assert_eq!(
            directives[0],
            Directive::Delegate(DelegationRequest::new("src", "line one\nline two"))
        );
        assert_eq!(
            directives[1],
            Directive::Finish { outcome: Outcome::Success, summary: String::new() }
        );
    }

    #[test]
    fn test_bare_delegate_is_parse_error() {
        let err = parse("Let me hand this off.\nDELEGATE").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("DELEGATE"));
    }

    #[test]
    fn test_delegate_without_task_is_parse_error() {
        assert!(parse("DELEGATE src/lib.rs").is_err());
        assert!(parse("DELEGATE src/lib.rs:").is_err());
    }

    #[test]
    fn test_change_requires_block() {
        assert!(parse("CHANGE src/lib.rs").is_err());
        let directives = parse("CHANGE src/lib.rs <<<\nfn main() {}\n>>>").unwrap();
        assert_eq!(
            directives,
            vec![Directive::Change {
                path: PathBuf::from("src/lib.rs"),
                content: "fn main() {}".to_string(),
            }]
        );
    }

    #[test]
    fn test_unterminated_block() {
        let err = parse("UPDATE_README <<<\n# title").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_finish_variants() {
        assert_eq!(
            parse("FINISH FAILURE: tests do not compile").unwrap(),
            vec![Directive::Finish {
                outcome: Outcome::Failure,
                summary: "tests do not compile".to_string(),
            }]
        );
        assert!(parse("FINISH MAYBE").is_err());
    }

    #[test]
    fn test_paths_must_stay_inside_project() {
        assert!(parse("READ ../secrets").is_err());
        assert!(parse("DELETE /etc/passwd").is_err());
    }

    #[test]
    fn test_run_and_keyword_boundary() {
        let directives = parse("RUN src\nRUNNING is prose\nWAITING too").unwrap();
        assert_eq!(directives, vec![Directive::Run { scope_hint: "src".to_string() }]);
    }
}
