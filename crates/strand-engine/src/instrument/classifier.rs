//! Suspendability classifiers
//!
//! A classifier looks at one method (or a callee known only by name) and
//! says whether it suspends. Classifiers are consulted in order through a
//! [`ClassifierChain`] owned by the instrumentor; the first definite answer
//! wins and `Unknown` defers to the call-graph analysis.

use super::InstrumentOptions;
use crate::ir::{matches_pattern, Method};
use std::fs;
use std::io;
use std::path::Path;

/// A classifier verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The method suspends
    Suspendable,
    /// The method never suspends, whatever it calls
    NonSuspendable,
    /// No opinion
    Unknown,
}

/// What a classifier gets to look at
#[derive(Debug, Clone, Copy)]
pub struct MethodRef<'a> {
    /// `Owner.name`
    pub qualified: &'a str,
    /// The method, when it is part of the program being instrumented
    pub method: Option<&'a Method>,
}

/// Marks methods suspendable without changing their source.
///
/// Implement this to teach the instrumentor about libraries it cannot see.
pub trait SuspendableClassifier: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Classify one method
    fn classify(&self, target: &MethodRef<'_>) -> Classification;
}

/// Honors the `suspendable` annotation and the suspension marker in a
/// method's signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnnotationClassifier;

impl SuspendableClassifier for AnnotationClassifier {
    fn name(&self) -> &str {
        "annotation"
    }

    fn classify(&self, target: &MethodRef<'_>) -> Classification {
        match target.method {
            Some(m) if m.flags.suspendable || m.flags.throws_suspend => Classification::Suspendable,
            _ => Classification::Unknown,
        }
    }
}

/// Name lists of suspendable and non-suspendable methods.
///
/// Entries are qualified names, `Owner.*`, or `prefix*`. The suspendable
/// list is checked first.
#[derive(Debug, Default, Clone)]
pub struct ListClassifier {
    suspendables: Vec<String>,
    non_suspendables: Vec<String>,
}

impl ListClassifier {
    /// Create from in-memory lists
    pub fn new(suspendables: Vec<String>, non_suspendables: Vec<String>) -> Self {
        Self {
            suspendables,
            non_suspendables,
        }
    }

    /// Load list files; either may be absent
    pub fn from_files(suspendables: Option<&Path>, non_suspendables: Option<&Path>) -> io::Result<Self> {
        let load = |path: Option<&Path>| -> io::Result<Vec<String>> {
            match path {
                Some(path) => Ok(parse_list(&fs::read_to_string(path)?)),
                None => Ok(Vec::new()),
            }
        };
        Ok(Self::new(load(suspendables)?, load(non_suspendables)?))
    }

    /// Add entries to the suspendable list
    pub fn extend_suspendables(&mut self, entries: impl IntoIterator<Item = String>) {
        self.suspendables.extend(entries);
    }

    /// Add entries to the non-suspendable list
    pub fn extend_non_suspendables(&mut self, entries: impl IntoIterator<Item = String>) {
        self.non_suspendables.extend(entries);
    }

    /// Whether both lists are empty
    pub fn is_empty(&self) -> bool {
        self.suspendables.is_empty() && self.non_suspendables.is_empty()
    }
}

impl SuspendableClassifier for ListClassifier {
    fn name(&self) -> &str {
        "list"
    }

    fn classify(&self, target: &MethodRef<'_>) -> Classification {
        if self.suspendables.iter().any(|p| matches_pattern(p, target.qualified)) {
            Classification::Suspendable
        } else if self.non_suspendables.iter().any(|p| matches_pattern(p, target.qualified)) {
            Classification::NonSuspendable
        } else {
            Classification::Unknown
        }
    }
}

/// Parse a list file: one entry per line, `#` starts a comment.
pub fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Ordered set of classifiers
#[derive(Default)]
pub struct ClassifierChain {
    classifiers: Vec<Box<dyn SuspendableClassifier>>,
}

impl ClassifierChain {
    /// Empty chain; every method is `Unknown`
    pub fn new() -> Self {
        Self::default()
    }

    /// Annotation classifier followed by the option lists
    pub fn from_options(options: &InstrumentOptions) -> Self {
        let mut chain = Self::new();
        chain.push(AnnotationClassifier);
        let list = ListClassifier::new(options.suspendables.clone(), options.non_suspendables.clone());
        if !list.is_empty() {
            chain.push(list);
        }
        chain
    }

    /// Append a classifier
    pub fn push(&mut self, classifier: impl SuspendableClassifier + 'static) {
        self.classifiers.push(Box::new(classifier));
    }

    /// First definite answer in chain order
    pub fn classify(&self, target: &MethodRef<'_>) -> Classification {
        for classifier in &self.classifiers {
            let verdict = classifier.classify(target);
            if verdict != Classification::Unknown {
                tracing::trace!(method = target.qualified, classifier = classifier.name(), ?verdict, "classified");
                return verdict;
            }
        }
        Classification::Unknown
    }

    /// Number of classifiers
    pub fn len(&self) -> usize {
        self.classifiers.len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }
}

impl std::fmt::Debug for ClassifierChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.classifiers.iter().map(|c| c.name()).collect();
        f.debug_struct("ClassifierChain").field("classifiers", &names).finish()
    }
}
