//! Qualified command names and the declared core command set.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Name of the global context that owns bare-name commands.
pub const WILDCARD_CONTEXT: &str = "*";

/// Pseudo-command naming the classifier's "none of these" class.
pub const WILDCARD_COMMAND: &str = "wildcard";

/// Separator between context and command in a qualified name.
pub const QUALIFIER: char = '/';

/// Builds a qualified name; the wildcard context yields a bare name.
#[must_use]
pub fn qualify(context: &str, command: &str) -> String {
    if context == WILDCARD_CONTEXT {
        command.to_string()
    } else {
        format!("{context}{QUALIFIER}{command}")
    }
}

/// Command part of a qualified name (`Order/cancel` -> `cancel`).
#[must_use]
pub fn simple_name(qualified: &str) -> &str {
    qualified
        .rsplit_once(QUALIFIER)
        .map_or(qualified, |(_, name)| name)
}

/// Context part of a qualified name, `None` for bare (global) names.
#[must_use]
pub fn context_of(qualified: &str) -> Option<&str> {
    qualified.rsplit_once(QUALIFIER).map(|(context, _)| context)
}

/// Commands injected into every context regardless of inheritance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreCommands {
    names: BTreeSet<String>,
}

impl Default for CoreCommands {
    fn default() -> Self {
        Self::new(["abort", WILDCARD_COMMAND])
    }
}

impl CoreCommands {
    /// Declares the core set explicitly.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Core names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Number of core commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when no core command is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_qualified_names() {
        assert_eq!(simple_name("Order/cancel"), "cancel");
        assert_eq!(context_of("Order/cancel"), Some("Order"));
        assert_eq!(simple_name("abort"), "abort");
        assert_eq!(context_of("abort"), None);
    }

    #[test]
    fn wildcard_context_qualifies_to_bare_name() {
        assert_eq!(qualify(WILDCARD_CONTEXT, "help"), "help");
        assert_eq!(qualify("Order", "cancel"), "Order/cancel");
    }

    #[test]
    fn default_core_contains_wildcard() {
        let core = CoreCommands::default();
        assert!(core.contains("abort"));
        assert!(core.contains(WILDCARD_COMMAND));
        assert_eq!(core.iter().collect::<Vec<_>>(), vec!["abort", "wildcard"]);
    }
}
