//! Ticket identity: display-ID assignment and query resolution
//!
//! Full IDs are 26-character sortable identifiers assigned at ticket
//! creation, so lexicographic order equals creation order. Short IDs (the
//! first 8 characters, lowercased) are what humans actually type, and they
//! are allowed to collide; display IDs disambiguate collisions with a
//! deterministic numeric suffix.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::models::TicketSnapshot;

/// Length of the short identifier taken from the front of a full ID.
pub const SHORT_ID_LEN: usize = 8;

/// Prefix for human-facing display IDs.
pub const DISPLAY_PREFIX: &str = "TK-";

/// Lowercase-normalize a full ID. All identity comparisons are
/// case-insensitive, so normalized IDs are the map keys everywhere.
pub fn normalize(full_id: &str) -> String {
    full_id.to_lowercase()
}

/// Short ID of a full ID: first 8 characters, lowercased.
pub fn short_id(full_id: &str) -> String {
    normalize(full_id).chars().take(SHORT_ID_LEN).collect()
}

/// Assign display IDs for a repository snapshot.
///
/// Tickets are grouped by short ID; within a group, members sorted by
/// ascending full ID (creation order) get `TK-<short>`, `TK-<short>-2`,
/// `TK-<short>-3`, ... The result is keyed by normalized full ID.
///
/// The assignment is a pure function of the input set: re-running it on
/// the same snapshot yields the same mapping, and adding a ticket never
/// renumbers tickets whose group rank is unchanged.
pub fn assign_display_ids<'a, I>(full_ids: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for id in full_ids {
        let normalized = normalize(id);
        groups.entry(short_id(&normalized)).or_default().push(normalized);
    }

    let mut assigned = HashMap::new();
    for (short, mut members) in groups {
        members.sort();
        members.dedup();
        for (rank, full) in members.into_iter().enumerate() {
            let display = if rank == 0 {
                format!("{DISPLAY_PREFIX}{short}")
            } else {
                format!("{DISPLAY_PREFIX}{short}-{}", rank + 1)
            };
            assigned.insert(full, display);
        }
    }
    assigned
}

/// Resolution failures carry enough structure for callers to branch on.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no ticket matches '{query}'")]
    NotFound { query: String },

    #[error("'{query}' is ambiguous ({} candidates)", candidates.len())]
    Ambiguous {
        query: String,
        /// Full IDs of every candidate, sorted ascending.
        candidates: Vec<String>,
    },
}

/// How strictly to interpret a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    /// Try exact matches first, then progressively looser ones.
    #[default]
    Interactive,
    /// Exact full-ID or short-ID matches only; for scripts and CI.
    Ci,
}

/// Resolve a user-supplied query string to exactly one ticket.
///
/// Interactive mode walks tiers in strict precedence order, stopping at
/// the first tier with any match: exact full ID, exact display ID, exact
/// short ID, full-ID prefix, title substring. A tier with more than one
/// match is ambiguous; later (looser) tiers must never mask it.
pub fn resolve<'a>(
    query: &str,
    tickets: &'a [TicketSnapshot],
    mode: ResolveMode,
) -> Result<&'a TicketSnapshot, ResolveError> {
    let q = query.trim().to_lowercase();
    let display_ids = assign_display_ids(tickets.iter().map(|t| t.full_id.as_str()));

    let tiers: Vec<Box<dyn Fn(&TicketSnapshot) -> bool + '_>> = match mode {
        ResolveMode::Ci => vec![Box::new(|t: &TicketSnapshot| {
            normalize(&t.full_id) == q || short_id(&t.full_id) == q
        })],
        ResolveMode::Interactive => vec![
            Box::new(|t: &TicketSnapshot| normalize(&t.full_id) == q),
            Box::new(|t: &TicketSnapshot| {
                display_ids
                    .get(&normalize(&t.full_id))
                    .is_some_and(|d| d.to_lowercase() == q)
            }),
            Box::new(|t: &TicketSnapshot| short_id(&t.full_id) == q),
            Box::new(|t: &TicketSnapshot| !q.is_empty() && normalize(&t.full_id).starts_with(&q)),
            Box::new(|t: &TicketSnapshot| {
                !q.is_empty() && t.title.to_lowercase().contains(&q)
            }),
        ],
    };

    for tier in tiers {
        let mut matches: Vec<&TicketSnapshot> = tickets.iter().filter(|&t| tier(t)).collect();
        match matches.len() {
            0 => continue,
            1 => return Ok(matches.remove(0)),
            _ => {
                let mut candidates: Vec<String> =
                    matches.iter().map(|t| normalize(&t.full_id)).collect();
                candidates.sort();
                return Err(ResolveError::Ambiguous {
                    query: query.to_string(),
                    candidates,
                });
            }
        }
    }

    Err(ResolveError::NotFound {
        query: query.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(full_id: &str, title: &str) -> TicketSnapshot {
        TicketSnapshot {
            full_id: full_id.to_string(),
            title: title.to_string(),
            workflow_state: Default::default(),
            priority: crate::models::PriorityTier::Unknown,
            created_at: None,
            refreshed_at: None,
        }
    }

    // Three IDs sharing one short-ID group, in creation order.
    const COLLIDE_A: &str = "01hv4k8aaaaaaaaaaaaaaaaaa1";
    const COLLIDE_B: &str = "01hv4k8abbbbbbbbbbbbbbbbb2";
    const COLLIDE_C: &str = "01hv4k8accccccccccccccccc3";

    #[test]
    fn unique_short_ids_get_unsuffixed_display_ids() {
        let ids = vec!["01hv4k8e9qzrmw3ytpnx2c6b7d", "01hw2n5f7rtkcx4zupqy3d8e9a"];
        let assigned = assign_display_ids(ids.iter().copied());
        assert_eq!(assigned["01hv4k8e9qzrmw3ytpnx2c6b7d"], "TK-01hv4k8e");
        assert_eq!(assigned["01hw2n5f7rtkcx4zupqy3d8e9a"], "TK-01hw2n5f");
    }

    #[test]
    fn collision_suffixes_follow_full_id_order_regardless_of_input_order() {
        let assigned = assign_display_ids([COLLIDE_C, COLLIDE_A, COLLIDE_B]);
        assert_eq!(assigned[COLLIDE_A], "TK-01hv4k8a");
        assert_eq!(assigned[COLLIDE_B], "TK-01hv4k8a-2");
        assert_eq!(assigned[COLLIDE_C], "TK-01hv4k8a-3");
    }

    #[test]
    fn assignment_is_deterministic_and_stable_under_additions() {
        let first = assign_display_ids([COLLIDE_A, COLLIDE_B]);
        let second = assign_display_ids([COLLIDE_A, COLLIDE_B]);
        assert_eq!(first, second);

        // C sorts after A and B, so their display IDs must not change.
        let grown = assign_display_ids([COLLIDE_B, COLLIDE_C, COLLIDE_A]);
        assert_eq!(grown[COLLIDE_A], first[COLLIDE_A]);
        assert_eq!(grown[COLLIDE_B], first[COLLIDE_B]);
        assert_eq!(grown[COLLIDE_C], "TK-01hv4k8a-3");
    }

    #[test]
    fn assignment_normalizes_case() {
        let assigned = assign_display_ids(["01HV4K8E9QZRMW3YTPNX2C6B7D"]);
        assert_eq!(assigned["01hv4k8e9qzrmw3ytpnx2c6b7d"], "TK-01hv4k8e");
    }

    #[test]
    fn exact_full_id_beats_title_substring() {
        // The full ID of `target` appears in two other ticket titles.
        let target = "01hv4k8e9qzrmw3ytpnx2c6b7d";
        let tickets = vec![
            ticket(target, "fix login"),
            ticket(COLLIDE_A, &format!("see {target} for context")),
            ticket(COLLIDE_B, &format!("duplicate of {target}")),
        ];
        let resolved = resolve(target, &tickets, ResolveMode::Interactive).unwrap();
        assert_eq!(resolved.full_id, target);
    }

    #[test]
    fn ambiguous_tier_never_falls_through_to_looser_tier() {
        // Both collide on short ID; a third ticket would match by title.
        let tickets = vec![
            ticket(COLLIDE_A, "unrelated"),
            ticket(COLLIDE_B, "unrelated"),
            ticket("01hw2n5f7rtkcx4zupqy3d8e9a", "mentions 01hv4k8a in title"),
        ];
        let err = resolve("01hv4k8a", &tickets, ResolveMode::Interactive).unwrap_err();
        match err {
            ResolveError::Ambiguous { candidates, .. } => {
                assert_eq!(candidates, vec![COLLIDE_A.to_string(), COLLIDE_B.to_string()]);
            }
            other => panic!("expected Ambiguous, got: {other:?}"),
        }
    }

    #[test]
    fn interactive_falls_back_to_display_id_and_title() {
        let tickets = vec![
            ticket(COLLIDE_A, "fix login flow"),
            ticket(COLLIDE_B, "update dependencies"),
        ];
        let by_display = resolve("TK-01hv4k8a-2", &tickets, ResolveMode::Interactive).unwrap();
        assert_eq!(by_display.full_id, COLLIDE_B);

        let by_title = resolve("login", &tickets, ResolveMode::Interactive).unwrap();
        assert_eq!(by_title.full_id, COLLIDE_A);
    }

    #[test]
    fn ci_mode_only_accepts_exact_matches() {
        let tickets = vec![ticket(COLLIDE_A, "fix login flow")];

        // Title substring resolves interactively but not in CI mode.
        let err = resolve("login", &tickets, ResolveMode::Ci).unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));

        let by_short = resolve("01HV4K8A", &tickets, ResolveMode::Ci).unwrap();
        assert_eq!(by_short.full_id, COLLIDE_A);

        let by_full = resolve(COLLIDE_A, &tickets, ResolveMode::Ci).unwrap();
        assert_eq!(by_full.full_id, COLLIDE_A);
    }

    #[test]
    fn ci_mode_reports_short_id_collisions_as_ambiguous() {
        let tickets = vec![ticket(COLLIDE_A, "a"), ticket(COLLIDE_B, "b")];
        let err = resolve("01hv4k8a", &tickets, ResolveMode::Ci).unwrap_err();
        match err {
            ResolveError::Ambiguous { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("expected Ambiguous, got: {other:?}"),
        }
    }

    #[test]
    fn unmatched_query_is_not_found() {
        let tickets = vec![ticket(COLLIDE_A, "a")];
        let err = resolve("zzzzzz", &tickets, ResolveMode::Interactive).unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }
}
