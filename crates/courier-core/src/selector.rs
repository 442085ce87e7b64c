//! Per-class inclusion rules.
//!
//! Each class has a default [`FilterMode`] and an ordered list of include /
//! exclude rules. For every candidate the rules are evaluated in order and
//! the last matching rule decides; when none matches the mode decides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::change::ChangeKind;
use crate::object::{FieldValue, Object};
use crate::types::NodeId;

/// Class-level default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterMode {
    /// Allow unless excluded.
    #[default]
    Blacklist,
    /// Deny unless included.
    Whitelist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Include,
    Exclude,
}

/// Condition over a [`SelectorContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    Always,
    /// Scalar text or reference id of a property equals `value`.
    PropertyEquals { property: String, value: String },
    PropertyIsNull(String),
    RecipientIs(NodeId),
    RecipientIn(Vec<NodeId>),
    KindIs(ChangeKind),
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn matches(&self, ctx: &SelectorContext<'_>) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::PropertyEquals { property, value } => match ctx.object {
                Some(object) => match object.get(property) {
                    FieldValue::Scalar(s) => s.to_text() == *value,
                    FieldValue::Ref(key) => key.id == *value,
                    _ => false,
                },
                None => false,
            },
            Predicate::PropertyIsNull(property) => {
                ctx.object.map_or(true, |o| o.get(property).is_null())
            }
            Predicate::RecipientIs(node) => ctx.recipient == Some(node),
            Predicate::RecipientIn(nodes) => ctx.recipient.is_some_and(|r| nodes.contains(r)),
            Predicate::KindIs(kind) => ctx.kind == Some(*kind),
            Predicate::Not(inner) => !inner.matches(ctx),
            Predicate::All(preds) => preds.iter().all(|p| p.matches(ctx)),
            Predicate::Any(preds) => preds.iter().any(|p| p.matches(ctx)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRule {
    pub action: RuleAction,
    pub predicate: Predicate,
}

impl SelectorRule {
    pub fn include(predicate: Predicate) -> Self {
        Self {
            action: RuleAction::Include,
            predicate,
        }
    }

    pub fn exclude(predicate: Predicate) -> Self {
        Self {
            action: RuleAction::Exclude,
            predicate,
        }
    }
}

/// Rules for one class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSelector {
    pub mode: FilterMode,
    pub rules: Vec<SelectorRule>,
}

impl ClassSelector {
    pub fn allows(&self, ctx: &SelectorContext<'_>) -> bool {
        let mut allowed = self.mode == FilterMode::Blacklist;
        for rule in &self.rules {
            if rule.predicate.matches(ctx) {
                allowed = rule.action == RuleAction::Include;
            }
        }
        allowed
    }
}

/// Evaluation context for one candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorContext<'a> {
    /// The object being routed or cloned, when it still exists.
    pub object: Option<&'a Object>,
    /// The mutation being routed.
    pub kind: Option<ChangeKind>,
    /// The candidate recipient.
    pub recipient: Option<&'a NodeId>,
}

/// The selector collaborator: given a candidate set, return the allowed subset.
pub trait Selector: Send + Sync {
    /// Whether a single candidate of `class` is allowed.
    fn allows(&self, class: &str, ctx: &SelectorContext<'_>) -> bool;

    /// Filter candidate recipients for a mutation of `object`.
    fn filter_nodes(
        &self,
        class: &str,
        object: Option<&Object>,
        kind: ChangeKind,
        candidates: &[NodeId],
    ) -> Vec<NodeId> {
        candidates
            .iter()
            .filter(|node| {
                let ctx = SelectorContext {
                    object,
                    kind: Some(kind),
                    recipient: Some(*node),
                };
                self.allows(class, &ctx)
            })
            .cloned()
            .collect()
    }

    /// Filter candidate objects of `class` for a snapshot addressed to `recipient`.
    fn filter_objects<'o>(
        &self,
        class: &str,
        recipient: &NodeId,
        candidates: Vec<&'o Object>,
    ) -> Vec<&'o Object> {
        candidates
            .into_iter()
            .filter(|object| {
                let ctx = SelectorContext {
                    object: Some(*object),
                    kind: None,
                    recipient: Some(recipient),
                };
                self.allows(class, &ctx)
            })
            .collect()
    }
}

/// Declarative selector configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Mode for classes without their own entry.
    pub default_mode: FilterMode,
    pub classes: BTreeMap<String, ClassSelector>,
}

impl SelectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, class: &str, selector: ClassSelector) -> Self {
        self.classes.insert(class.to_string(), selector);
        self
    }

    /// Shorthand: exclude every instance of `class`.
    pub fn exclude_class(self, class: &str) -> Self {
        let mode = self.default_mode;
        self.with_class(
            class,
            ClassSelector {
                mode,
                rules: vec![SelectorRule::exclude(Predicate::Always)],
            },
        )
    }
}

impl Selector for SelectorConfig {
    fn allows(&self, class: &str, ctx: &SelectorContext<'_>) -> bool {
        match self.classes.get(class) {
            Some(selector) => selector.allows(ctx),
            None => self.default_mode == FilterMode::Blacklist,
        }
    }
}
