//! Class declaration scanning for command definition files.
//!
//! Command files are never executed. Hydration only needs to know which classes a
//! module exposes (and how they nest, e.g. `Signature.Input`), so the scanner walks
//! the source line by line tracking indentation scopes.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static CLASS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^class\s+(?P<name>[A-Za-z_]\w*)\s*[(:]").expect("class pattern compiles")
});
static DEF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(async\s+)?def\s+\w+").expect("def pattern compiles"));
static ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>[A-Z]\w*)\s*=\s*(?P<target>[A-Za-z_][\w.]*)\s*(#.*)?$")
        .expect("alias pattern compiles")
});

const TAB_WIDTH: usize = 4;

/// One class (or class alias) reachable as a module attribute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDecl {
    /// Dotted path from the module, e.g. `Signature.Input`.
    pub qualname: String,
    /// 1-based line of the declaration.
    pub line: usize,
    /// Right-hand side when the name is an assignment alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_of: Option<String>,
}

/// Every class path a module exposes, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDeclarations {
    classes: IndexMap<String, ClassDecl>,
}

#[derive(Debug)]
struct Scope {
    indent: usize,
    name: String,
    is_class: bool,
}

impl ModuleDeclarations {
    /// Scans module source text.
    #[must_use]
    pub fn parse(source: &str) -> Self {
        let mut classes = IndexMap::new();
        let mut scopes: Vec<Scope> = Vec::new();
        let mut in_docstring: Option<&'static str> = None;

        for (idx, raw) in source.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw.trim_start();
            if let Some(delim) = in_docstring {
                if trimmed.contains(delim) {
                    in_docstring = None;
                }
                continue;
            }
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(delim) = opens_docstring(trimmed) {
                in_docstring = Some(delim);
                continue;
            }

            let indent = indent_width(raw);
            while scopes.last().is_some_and(|scope| scope.indent >= indent) {
                scopes.pop();
            }
            let reachable = scopes.iter().all(|scope| scope.is_class);

            if let Some(caps) = CLASS_RE.captures(trimmed) {
                let name = caps["name"].to_string();
                if reachable {
                    let qualname = dotted(&scopes, &name);
                    classes.insert(
                        qualname.clone(),
                        ClassDecl {
                            qualname,
                            line: line_no,
                            alias_of: None,
                        },
                    );
                }
                scopes.push(Scope {
                    indent,
                    name,
                    is_class: true,
                });
            } else if DEF_RE.is_match(trimmed) {
                scopes.push(Scope {
                    indent,
                    name: String::new(),
                    is_class: false,
                });
            } else if let Some(caps) = ALIAS_RE.captures(trimmed) {
                if reachable {
                    let qualname = dotted(&scopes, &caps["name"]);
                    classes.insert(
                        qualname.clone(),
                        ClassDecl {
                            qualname,
                            line: line_no,
                            alias_of: Some(caps["target"].to_string()),
                        },
                    );
                }
            }
        }
        Self { classes }
    }

    /// Looks up a dotted class path such as `Signature.Input`.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<&ClassDecl> {
        self.classes.get(path)
    }

    /// True when the module exposes `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.classes.contains_key(path)
    }

    /// All declarations in source order.
    pub fn iter(&self) -> impl Iterator<Item = &ClassDecl> {
        self.classes.values()
    }

    /// Number of reachable class paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// True when the module declares no reachable class.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

fn dotted(scopes: &[Scope], name: &str) -> String {
    let mut parts: Vec<&str> = scopes.iter().map(|scope| scope.name.as_str()).collect();
    parts.push(name);
    parts.join(".")
}

fn indent_width(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { TAB_WIDTH } else { 1 })
        .sum()
}

/// Returns the delimiter when the line opens a docstring that stays open.
fn opens_docstring(trimmed: &str) -> Option<&'static str> {
    for delim in ["\"\"\"", "'''"] {
        let body = trimmed
            .trim_start_matches(|c: char| matches!(c, 'r' | 'b' | 'u' | 'f' | 'R' | 'B' | 'U' | 'F'));
        if let Some(rest) = body.strip_prefix(delim) {
            return if rest.contains(delim) { None } else { Some(delim) };
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANCEL: &str = r#"
"""Cancel an order.

class NotReal:
"""
import dspy

class Signature(dspy.Signature):
    """Extract the order id."""

    class Input(BaseModel):
        text: str

    class Output(BaseModel):
        order_id: str


def helper():
    class Hidden:
        pass


class ResponseGenerator:
    def __call__(self, ctx, text, params=None):
        return None

Generator = ResponseGenerator
"#;

    #[test]
    fn finds_nested_classes() {
        let decls = ModuleDeclarations::parse(CANCEL);
        assert!(decls.contains("Signature"));
        assert!(decls.contains("Signature.Input"));
        assert!(decls.contains("Signature.Output"));
        assert!(decls.contains("ResponseGenerator"));
        assert_eq!(decls.find("ResponseGenerator").unwrap().line, 23);
    }

    #[test]
    fn skips_docstrings_and_function_locals() {
        let decls = ModuleDeclarations::parse(CANCEL);
        assert!(!decls.contains("NotReal"));
        assert!(!decls.contains("Hidden"));
        assert!(!decls.contains("helper.Hidden"));
    }

    #[test]
    fn records_aliases() {
        let decls = ModuleDeclarations::parse(CANCEL);
        let alias = decls.find("Generator").unwrap();
        assert_eq!(alias.alias_of.as_deref(), Some("ResponseGenerator"));
    }

    #[test]
    fn dedent_closes_class_scope() {
        let source = "class A:\n    x = 1\nclass B:\n\tclass C:\n\t\tpass\n";
        let decls = ModuleDeclarations::parse(source);
        let paths: Vec<_> = decls.iter().map(|d| d.qualname.as_str()).collect();
        assert_eq!(paths, vec!["A", "B", "B.C"]);
    }
}
