//! The single process-wide state store.
//!
//! One `Store` holds every chat, operator, group, and the locale
//! configuration. It is owned exclusively by the pipeline task; nothing
//! mutates it except the transition function the pipeline invokes, and
//! interceptors only ever see it by reference.

use std::collections::HashMap;

use crate::chat::{Chat, ChatId, Locale};
use crate::config::EngineConfig;
use crate::group::{Group, GroupId};
use crate::operator::{Operator, OperatorId};

/// Locale configuration: which locales are served and which one catches
/// unsupported requests.
#[derive(Debug, Clone, PartialEq)]
pub struct LocaleSettings {
    pub default_locale: Locale,
    pub supported: Vec<Locale>,
}

impl LocaleSettings {
    pub fn new(default_locale: Locale, mut supported: Vec<Locale>) -> Self {
        if !supported.contains(&default_locale) {
            supported.insert(0, default_locale.clone());
        }
        Self {
            default_locale,
            supported,
        }
    }

    pub fn is_supported(&self, locale: &Locale) -> bool {
        self.supported.contains(locale)
    }

    /// The given locale if supported, the default otherwise.
    pub fn resolve(&self, locale: &Locale) -> Locale {
        if self.is_supported(locale) {
            locale.clone()
        } else {
            self.default_locale.clone()
        }
    }
}

/// Process-wide engine state.
#[derive(Debug, Clone)]
pub struct Store {
    pub chats: HashMap<ChatId, Chat>,
    pub operators: HashMap<OperatorId, Operator>,
    pub groups: HashMap<GroupId, Group>,
    pub locales: LocaleSettings,
    /// Gates the assignment sweep: while false, chats still queue but
    /// nothing is assigned.
    pub accepts_customers: bool,
    next_chat_seq: u64,
    next_operator_seq: u64,
}

impl Store {
    pub fn new(config: &EngineConfig) -> Self {
        let mut groups = HashMap::new();
        let default = Group::default_group();
        groups.insert(default.id.clone(), default);
        for seed in &config.groups {
            if seed.id.is_default() {
                // The reserved group keeps its fixed shape.
                continue;
            }
            groups.insert(
                seed.id.clone(),
                Group::new(seed.id.clone(), seed.name.clone(), seed.exclusive),
            );
        }

        Self {
            chats: HashMap::new(),
            operators: HashMap::new(),
            groups,
            locales: LocaleSettings::new(
                config.default_locale.clone(),
                config.supported_locales.clone(),
            ),
            accepts_customers: config.accept_customers,
            next_chat_seq: 0,
            next_operator_seq: 0,
        }
    }

    pub fn chat(&self, id: &ChatId) -> Option<&Chat> {
        self.chats.get(id)
    }

    pub fn chat_mut(&mut self, id: &ChatId) -> Option<&mut Chat> {
        self.chats.get_mut(id)
    }

    pub fn operator(&self, id: &OperatorId) -> Option<&Operator> {
        self.operators.get(id)
    }

    pub fn operator_mut(&mut self, id: &OperatorId) -> Option<&mut Operator> {
        self.operators.get_mut(id)
    }

    pub fn group(&self, id: &GroupId) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Monotonic insertion counter for chats.
    pub fn next_chat_seq(&mut self) -> u64 {
        let seq = self.next_chat_seq;
        self.next_chat_seq += 1;
        seq
    }

    /// Monotonic registration counter for operators.
    pub fn next_operator_seq(&mut self) -> u64 {
        let seq = self.next_operator_seq;
        self.next_operator_seq += 1;
        seq
    }

    /// Record the operator as a member of each listed group, plus the
    /// default group. Unknown group ids are dropped.
    pub fn join_groups(&mut self, operator_id: &OperatorId, group_ids: &[GroupId]) {
        for group_id in group_ids {
            match self.groups.get_mut(group_id) {
                Some(group) => {
                    group.members.insert(operator_id.clone());
                }
                None => {
                    tracing::warn!(
                        operator_id = %operator_id,
                        group_id = %group_id,
                        "dropping membership in unknown group"
                    );
                }
            }
        }
        if let Some(default) = self.groups.get_mut(&GroupId::default_group()) {
            default.members.insert(operator_id.clone());
        }
    }
}
