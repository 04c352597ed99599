//! Route matching for incoming HTTP requests.
//!
//! A registered pattern is either a literal path (`/api/users/auth`) or a
//! path whose final segment is the wildcard `*` (`/api/users/*`). A literal
//! match beats any wildcard; among wildcards the longest pattern wins, and
//! ties go to the earliest-registered group.

use std::sync::Arc;

use crate::proxy::upstream::UpstreamGroup;
use crate::store::RouteTable;

/// Finds the group whose pattern matches `path`, or `None` when no route
/// qualifies.
pub fn match_group(table: &RouteTable, path: &str) -> Option<Arc<UpstreamGroup>> {
    // An exact registered pattern always wins.
    if let Some(group) = table.get(path) {
        return Some(group);
    }

    // Otherwise scan wildcard patterns: longest wins, ties go to the
    // earliest registration.
    let mut best: Option<Arc<UpstreamGroup>> = None;
    table.range(|pattern, group| {
        if let Some(prefix) = wildcard_prefix(pattern) {
            if path.starts_with(prefix) && is_better(group, best.as_deref()) {
                best = Some(group.clone());
            }
        }
        true
    });
    best
}

/// For a `/…/*` pattern, the prefix up to and including the slash before
/// `*`. Literal patterns return `None`.
fn wildcard_prefix(pattern: &str) -> Option<&str> {
    pattern.strip_suffix('*').filter(|prefix| prefix.ends_with('/'))
}

fn is_better(candidate: &UpstreamGroup, current: Option<&UpstreamGroup>) -> bool {
    match current {
        None => true,
        Some(current) => {
            let (cand, curr) = (candidate.pattern().len(), current.pattern().len());
            cand > curr || (cand == curr && candidate.seq() < current.seq())
        }
    }
}
