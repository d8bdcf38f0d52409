//! State labels.
//!
//! The poll engine is generic over the label type so each resource family
//! can use a closed enum of its states. Plain strings work too.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

/// A remote object's lifecycle state, compared by value.
pub trait Label: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync {
    /// The synthetic label a NotFound refresh is translated to.
    fn deleted() -> Self;
}

impl Label for &'static str {
    fn deleted() -> Self {
        "deleted"
    }
}

impl Label for String {
    fn deleted() -> Self {
        "deleted".to_string()
    }
}

/// Render a label set for error messages, sorted so output is stable.
pub(crate) fn describe<L: Label>(labels: &HashSet<L>) -> String {
    let mut names: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
    names.sort();
    format!("[{}]", names.join(", "))
}
