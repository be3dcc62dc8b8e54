//! Operation envelopes handed from the dispatcher to a proxy.

use std::fmt;
use std::str::FromStr;

use bson::Document;

use crate::error::{Error, Result};
use crate::proxy::ProxyTransport;

/// A fully-qualified `db.collection` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// The `admin.$cmd` namespace used for server commands and probes.
    #[must_use]
    pub fn admin_command() -> Self {
        Self::new("admin", "$cmd")
    }

    /// The `$cmd` namespace of this namespace's database.
    #[must_use]
    pub fn command_namespace(&self) -> Self {
        Self::new(self.db.clone(), "$cmd")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::InvalidNamespace(s.to_string())),
        }
    }
}

/// Where a command may be routed. Mongos proxies are interchangeable peers,
/// so the preference is forwarded to the proxy unchanged and never affects
/// which proxy the selector picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Options for write operations.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Stop at the first error instead of continuing with later documents.
    pub ordered: Option<bool>,
    /// Write concern document forwarded to the proxy.
    pub write_concern: Option<Document>,
}

/// Options for command dispatch.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Routing preference forwarded verbatim to the proxy.
    pub read_preference: ReadPreference,
    /// Marks internal monitoring traffic (ismaster probes).
    pub monitoring: bool,
}

impl CommandOptions {
    /// Options used by the health monitor's ismaster probes.
    #[must_use]
    pub(crate) fn monitoring() -> Self {
        Self {
            read_preference: ReadPreference::Primary,
            monitoring: true,
        }
    }
}

/// Credential for an authentication fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Mechanism name, e.g. `"scram-sha-1"`, or `"default"`.
    pub mechanism: String,
    /// Database the credential is defined on.
    pub source: String,
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(
        mechanism: impl Into<String>,
        source: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            mechanism: mechanism.into(),
            source: source.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

/// One dispatchable operation.
///
/// The dispatcher gates and routes the envelope; the selected proxy executes
/// it verbatim.
#[derive(Debug, Clone)]
pub enum Operation {
    Insert {
        ns: Namespace,
        docs: Vec<Document>,
        options: WriteOptions,
    },
    Update {
        ns: Namespace,
        updates: Vec<Document>,
        options: WriteOptions,
    },
    Remove {
        ns: Namespace,
        deletes: Vec<Document>,
        options: WriteOptions,
    },
    Command {
        ns: Namespace,
        command: Document,
        options: CommandOptions,
    },
}

impl Operation {
    /// The namespace this operation targets.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        match self {
            Self::Insert { ns, .. }
            | Self::Update { ns, .. }
            | Self::Remove { ns, .. }
            | Self::Command { ns, .. } => ns,
        }
    }

    /// Run the operation against a proxy transport.
    pub(crate) async fn execute(self, transport: &dyn ProxyTransport) -> Result<Document> {
        match self {
            Self::Insert { ns, docs, options } => transport.insert(&ns, docs, &options).await,
            Self::Update {
                ns,
                updates,
                options,
            } => transport.update(&ns, updates, &options).await,
            Self::Remove {
                ns,
                deletes,
                options,
            } => transport.remove(&ns, deletes, &options).await,
            Self::Command {
                ns,
                command,
                options,
            } => transport.command(&ns, command, &options).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_parses_db_and_collection() {
        let ns: Namespace = "test.users".parse().unwrap();
        assert_eq!(ns.db, "test");
        assert_eq!(ns.coll, "users");
        assert_eq!(ns.to_string(), "test.users");
    }

    #[test]
    fn namespace_keeps_dotted_collection_names() {
        let ns: Namespace = "db.system.profile".parse().unwrap();
        assert_eq!(ns.db, "db");
        assert_eq!(ns.coll, "system.profile");
    }

    #[test]
    fn bare_names_are_rejected() {
        assert!("nodot".parse::<Namespace>().is_err());
        assert!(".coll".parse::<Namespace>().is_err());
        assert!("db.".parse::<Namespace>().is_err());
    }

    #[test]
    fn command_namespace_targets_cmd_collection() {
        let ns = Namespace::new("reports", "daily");
        assert_eq!(ns.command_namespace().to_string(), "reports.$cmd");
        assert_eq!(Namespace::admin_command().to_string(), "admin.$cmd");
    }

    #[test]
    fn read_preference_defaults_to_primary() {
        assert_eq!(CommandOptions::default().read_preference, ReadPreference::Primary);
        assert!(!CommandOptions::default().monitoring);
        assert!(CommandOptions::monitoring().monitoring);
    }
}
