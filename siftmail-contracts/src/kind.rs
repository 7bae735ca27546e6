use serde::{Deserialize, Serialize};

/// Discriminates how a rule's implementation is dispatched and scheduled.
///
/// Maps directly onto spec §3's "Rule (cache item)" kind enumeration. Kept as
/// a tagged enum rather than flag bits (per the REDESIGN FLAGS in spec §9):
/// orthogonal toggles live on [`RuleFlags`] instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Normal,
    Virtual,
    Callback,
    Composite,
    PreFilter,
    PostFilter,
}

impl SymbolKind {
    pub fn is_filter(self) -> bool {
        matches!(self, SymbolKind::PreFilter | SymbolKind::PostFilter)
    }

    pub fn is_scheduled_directly(self) -> bool {
        // Virtual symbols never appear in the scheduler's runnable queues;
        // they surface only via their parent Callback (spec §4.2, queue 3).
        !matches!(self, SymbolKind::Virtual)
    }
}

/// Per-rule toggles, shared across every [`SymbolKind`] (spec §3, §9).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RuleFlags {
    /// Runs even when the task is in a hurry (never skipped for budget).
    pub fine: bool,
    /// Lower scheduling urgency; may be skipped under load.
    pub nice: bool,
    /// A hit with an empty `options` list is not treated as a no-op.
    pub empty_allowed: bool,
    /// Forced into the `Skipped` terminal state administratively.
    pub skipped: bool,
    /// At most one option may ever be attached to a hit on this rule.
    pub one_param: bool,
    /// `max_shots` is clamped to 1 regardless of the metric's configured default.
    pub one_shot: bool,
    /// The rule is registered but never scheduled (kept for compatibility).
    pub ignore: bool,
}

impl RuleFlags {
    pub fn runnable(self) -> bool {
        !self.skipped && !self.ignore
    }
}
