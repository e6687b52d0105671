//! Release comparison
//!
//! Decides what a fetched release means relative to what was last recorded
//! for the repository. Identity is the exact tag string; no version-ordering
//! or timestamp heuristics. A re-published tag looks identical and stays
//! silent; a rollback to an older tag counts as new. Both are accepted
//! consequences of keeping the comparison trivial to reason about.

use crate::github::Release;
use crate::state::ReleaseState;

/// Outcome of comparing a fetched release against recorded state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// The recorded tag matches the fetched tag
    Unchanged,

    /// A recorded tag exists and the fetched tag differs
    NewRelease { tag: String },

    /// Nothing recorded for this repository yet
    FirstObservation { tag: String },
}

/// Compare a fetched release against the recorded state, if any
pub fn evaluate(fetched: &Release, recorded: Option<&ReleaseState>) -> Evaluation {
    match recorded {
        None => Evaluation::FirstObservation {
            tag: fetched.tag_name.clone(),
        },
        Some(state) if state.last_seen_tag == fetched.tag_name => Evaluation::Unchanged,
        Some(_) => Evaluation::NewRelease {
            tag: fetched.tag_name.clone(),
        },
    }
}
