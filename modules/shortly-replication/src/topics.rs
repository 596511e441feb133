//! Topic names and per-service routing.

use std::fmt;
use std::str::FromStr;

use crate::outbox::OutboxTable;

pub const USERS_AUTH: &str = "shortly-users-auth";
pub const USERS_LINKS: &str = "shortly-users-links";
pub const USERS_ANALYTICS: &str = "shortly-users-analytics";

pub const LINKS_ANALYTICS: &str = "shortly-links-analytics";
pub const LINKS_LOOKUPS: &str = "shortly-links-lookups";
pub const LINKS_USERS: &str = "shortly-links-users";

pub const LOOKUPS_ANALYTICS: &str = "shortly-lookups-analytics";

pub const USERS_DLQ: &str = "shortly-users-dlq";
pub const LINKS_DLQ: &str = "shortly-links-dlq";

/// Every user change is written once per topic here.
pub const USER_UPDATE_TOPICS: &[&str] = &[USERS_AUTH, USERS_LINKS, USERS_ANALYTICS];

/// Every link change is written once per topic here.
pub const LINK_UPDATE_TOPICS: &[&str] = &[LINKS_ANALYTICS, LINKS_LOOKUPS, LINKS_USERS];

/// A deployed service that runs the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Users,
    Links,
    Analytics,
}

/// What a consumed queue is handled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// User replica. `cascade_links` soft-deletes the user's links on delete.
    UserReplica { cascade_links: bool },
    LinkReplica,
    Lookups,
    DeadLetter(OutboxTable),
}

impl Service {
    /// Outbox tables this service originates changes from.
    pub fn outboxes(&self) -> &'static [OutboxTable] {
        match self {
            Service::Users => &[OutboxTable::USERS],
            Service::Links => &[OutboxTable::LINKS],
            Service::Analytics => &[],
        }
    }

    pub fn consumed_queues(&self) -> &'static [&'static str] {
        match self {
            Service::Users => &[LINKS_USERS, USERS_DLQ],
            Service::Links => &[USERS_LINKS, LINKS_DLQ],
            Service::Analytics => &[USERS_ANALYTICS, LINKS_ANALYTICS, LOOKUPS_ANALYTICS],
        }
    }

    pub fn route(&self, queue: &str) -> Option<Route> {
        match (self, queue) {
            (Service::Users, LINKS_USERS) => Some(Route::LinkReplica),
            (Service::Users, USERS_DLQ) => Some(Route::DeadLetter(OutboxTable::USERS)),
            (Service::Links, USERS_LINKS) => Some(Route::UserReplica {
                cascade_links: true,
            }),
            (Service::Links, LINKS_DLQ) => Some(Route::DeadLetter(OutboxTable::LINKS)),
            (Service::Analytics, USERS_ANALYTICS) => Some(Route::UserReplica {
                cascade_links: false,
            }),
            (Service::Analytics, LINKS_ANALYTICS) => Some(Route::LinkReplica),
            (Service::Analytics, LOOKUPS_ANALYTICS) => Some(Route::Lookups),
            _ => None,
        }
    }
}

impl FromStr for Service {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "users" => Ok(Service::Users),
            "links" => Ok(Service::Links),
            "analytics" => Ok(Service::Analytics),
            other => Err(anyhow::anyhow!(
                "unknown service '{other}' (expected users, links or analytics)"
            )),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Users => write!(f, "users"),
            Service::Links => write!(f, "links"),
            Service::Analytics => write!(f, "analytics"),
        }
    }
}
