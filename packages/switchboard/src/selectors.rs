//! Read-side queries over the store.
//!
//! Everything here is pure: selectors borrow the store, never mutate it,
//! and every policy decision (who serves a chat, which chat goes next)
//! lives here so the interceptors stay thin.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::chat::{Chat, ChatStatus, Locale};
use crate::group::GroupId;
use crate::operator::{Operator, OperatorId, OperatorStatus};
use crate::store::Store;

/// A reserve operator keeps soaking up chats until they carry this many;
/// only then does the next idle reserve operator wake up.
pub const RESERVE_MAX_CHATS: u32 = 2;

/// Resolve a chat's group tags to the groups that actually gate candidate
/// matching. An exclusive tag narrows the scope to that single group;
/// otherwise unknown tags are dropped and an empty result falls back to
/// the default group.
pub fn effective_groups(store: &Store, tags: &[GroupId]) -> Vec<GroupId> {
    let known: Vec<&GroupId> = tags
        .iter()
        .filter(|id| store.groups.contains_key(*id))
        .collect();

    if let Some(exclusive) = known
        .iter()
        .find(|id| store.group(id).map(|g| g.exclusive).unwrap_or(false))
    {
        return vec![(*exclusive).clone()];
    }
    if known.is_empty() {
        return vec![GroupId::default_group()];
    }
    known.into_iter().cloned().collect()
}

fn in_scope_groups(store: &Store, operator_id: &OperatorId, groups: &[GroupId]) -> bool {
    groups.iter().any(|id| {
        store
            .group(id)
            .map(|g| g.members.contains(operator_id))
            .unwrap_or(false)
    })
}

/// True when the operator could take one more chat in this locale, either
/// through spare capacity or an explicit pull request.
fn wants_work(op: &Operator, locale: &Locale) -> bool {
    match op.membership(locale) {
        Some(m) if m.active => op.requesting_chat || m.total_available() > 0,
        _ => false,
    }
}

/// The full candidate set for a chat scope: online, assignable status,
/// active locale membership, group match, and room for one more chat.
pub fn candidates<'a>(store: &'a Store, locale: &Locale, groups: &[GroupId]) -> Vec<&'a Operator> {
    let groups = effective_groups(store, groups);
    let mut out: Vec<&Operator> = store
        .operators
        .values()
        .filter(|op| {
            op.online
                && op.status.is_assignable()
                && in_scope_groups(store, &op.id, &groups)
                && wants_work(op, locale)
        })
        .collect();
    rank(&mut out, locale);
    out
}

/// The sweep's cheaper test: is there *any* operator in scope with spare
/// capacity or a pull request? Deliberately ignores online and status so
/// a scope whose only capacity is offline still produces an attempt (and
/// a visible miss) rather than waiting silently.
pub fn scope_has_capacity(store: &Store, locale: &Locale, groups: &[GroupId]) -> bool {
    let groups = effective_groups(store, groups);
    store
        .operators
        .values()
        .any(|op| in_scope_groups(store, &op.id, &groups) && wants_work(op, locale))
}

/// Order candidates best-first. Registration order is the last
/// tie-break, so the result is deterministic however the operator map
/// iterates.
pub fn rank(candidates: &mut [&Operator], locale: &Locale) {
    candidates.sort_unstable_by(|a, b| {
        // Pull requests pre-empt balancing.
        b.requesting_chat
            .cmp(&a.requesting_chat)
            // Available before reserve.
            .then_with(|| status_rank(a.status).cmp(&status_rank(b.status)))
            // Between two reserves, one mid-fill stays first against an
            // idle peer so dormant reserves are not woken early. Against
            // a peer already carrying chats the rule is out and percent
            // availability decides.
            .then_with(|| {
                if a.status == OperatorStatus::Reserve && b.status == OperatorStatus::Reserve {
                    reserve_stickiness(a, b, locale)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| {
                percent_available(b, locale).total_cmp(&percent_available(a, locale))
            })
            .then_with(|| total_available(b, locale).cmp(&total_available(a, locale)))
            .then_with(|| a.seq.cmp(&b.seq))
    });
}

fn status_rank(status: OperatorStatus) -> u8 {
    match status {
        OperatorStatus::Available => 0,
        OperatorStatus::Reserve => 1,
        OperatorStatus::Unavailable => 2,
    }
}

/// The sticky tier for two reserves: a mid-fill one (load in
/// `1..RESERVE_MAX_CHATS`) sorts before a peer carrying nothing, and
/// only then. Two loaded reserves fall through to the percent tier.
fn reserve_stickiness(a: &Operator, b: &Operator, locale: &Locale) -> Ordering {
    let (load_a, load_b) = (a.load(locale), b.load(locale));
    if reserve_busy(load_a) && load_b == 0 {
        Ordering::Less
    } else if reserve_busy(load_b) && load_a == 0 {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

fn reserve_busy(load: u32) -> bool {
    load >= 1 && load < RESERVE_MAX_CHATS
}

fn percent_available(op: &Operator, locale: &Locale) -> f64 {
    op.membership(locale).map(|m| m.percent_available()).unwrap_or(0.0)
}

fn total_available(op: &Operator, locale: &Locale) -> u32 {
    op.membership(locale).map(|m| m.total_available()).unwrap_or(0)
}

/// Assignable chats oldest-first. `assignedAt` is stamped once per chat,
/// so a reopened chat keeps its place in line.
pub fn assignable_chats(store: &Store) -> Vec<&Chat> {
    let mut chats: Vec<&Chat> = store
        .chats
        .values()
        .filter(|c| c.status.is_assignable())
        .collect();
    chats.sort_unstable_by(|a, b| {
        a.assigned_at
            .cmp(&b.assigned_at)
            .then_with(|| a.seq.cmp(&b.seq))
    });
    chats
}

/// The chat the next sweep should attempt, if any.
pub fn next_assignable(store: &Store) -> Option<&Chat> {
    assignable_chats(store)
        .into_iter()
        .find(|chat| scope_has_capacity(store, &chat.session.locale, &chat.session.groups))
}

/// True while an assignment attempt is in flight anywhere.
pub fn assignment_in_flight(store: &Store) -> bool {
    store
        .chats
        .values()
        .any(|c| c.status == ChatStatus::Assigning)
}

/// Recompute per-locale loads from scratch: for each open chat, every
/// room member carries it against the chat's locale.
pub fn derived_loads(store: &Store) -> BTreeMap<Locale, BTreeMap<OperatorId, u32>> {
    let mut loads: BTreeMap<Locale, BTreeMap<OperatorId, u32>> = BTreeMap::new();
    for chat in store.chats.values() {
        if !chat.is_open() {
            continue;
        }
        let per_locale = loads.entry(chat.session.locale.clone()).or_default();
        for member in &chat.members {
            *per_locale.entry(member.clone()).or_insert(0) += 1;
        }
    }
    loads
}

/// The loads currently recorded on operator memberships, in the same
/// shape as [`derived_loads`], for change detection.
pub fn stored_loads(store: &Store) -> BTreeMap<Locale, BTreeMap<OperatorId, u32>> {
    let mut loads: BTreeMap<Locale, BTreeMap<OperatorId, u32>> = BTreeMap::new();
    for op in store.operators.values() {
        for (locale, membership) in &op.memberships {
            if membership.load > 0 {
                loads
                    .entry(locale.clone())
                    .or_default()
                    .insert(op.id.clone(), membership.load);
            }
        }
    }
    loads
}
