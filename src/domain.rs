//! Logical database domains.
//!
//! A domain is the triple (database, schema, table prefix) and is the unit
//! of logical data-space isolation. Domains are immutable values; the
//! resolver normalises the various ways callers name a domain (an already
//! resolved instance, the "local" sentinel, an alias, or a canonical id
//! string) into canonical instances.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The (database, schema, prefix) triple identifying a logical data space.
///
/// Equality is triple equality. The canonical string form is
/// `database[-schema]-prefix` with absent parts omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseDomain {
    database: Option<String>,
    schema: Option<String>,
    prefix: String,
}

impl DatabaseDomain {
    pub fn new(database: Option<&str>, schema: Option<&str>, prefix: &str) -> Self {
        Self {
            database: database.map(str::to_string),
            schema: schema.map(str::to_string),
            prefix: prefix.to_string(),
        }
    }

    /// Parse a canonical id of the form `database[-schema]-prefix`.
    ///
    /// One segment is a bare database, two are database and prefix, three
    /// are the full triple. Extra dashes are folded into the prefix.
    pub fn from_id(id: &str) -> Self {
        if id.is_empty() {
            return Self::default();
        }
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        match parts.as_slice() {
            [db] => Self::new(Some(db), None, ""),
            [db, prefix] => Self::new(Some(db), None, prefix),
            [db, schema, prefix] => Self::new(Some(db), Some(schema), prefix),
            _ => unreachable!("splitn(3) yields 1..=3 parts"),
        }
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// A copy of this domain with a different table prefix.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            database: self.database.clone(),
            schema: self.schema.clone(),
            prefix: prefix.to_string(),
        }
    }

    /// Canonical id string. The empty domain renders as "".
    pub fn canonical_id(&self) -> String {
        let mut segments: Vec<&str> = Vec::with_capacity(3);
        if let Some(db) = &self.database {
            segments.push(db);
        }
        if let Some(schema) = &self.schema {
            segments.push(schema);
        }
        if !self.prefix.is_empty() {
            segments.push(&self.prefix);
        }
        segments.join("-")
    }
}

impl std::fmt::Display for DatabaseDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_id())
    }
}

impl From<&str> for DatabaseDomain {
    fn from(id: &str) -> Self {
        Self::from_id(id)
    }
}

/// How a caller names a domain when asking for a connection.
#[derive(Debug, Clone)]
pub enum DomainSpec {
    /// The balancer's own local domain.
    Local,
    /// An already resolved instance.
    Domain(DatabaseDomain),
    /// An alias or canonical id string.
    Id(String),
}

impl From<DatabaseDomain> for DomainSpec {
    fn from(domain: DatabaseDomain) -> Self {
        DomainSpec::Domain(domain)
    }
}

impl From<&str> for DomainSpec {
    fn from(id: &str) -> Self {
        DomainSpec::Id(id.to_string())
    }
}

/// Normalises [`DomainSpec`] inputs into canonical [`DatabaseDomain`]s.
///
/// Resolution is pure and idempotent. The alias table maps alias strings
/// to canonical ids and is materialised into domain instances on first
/// hit. A single-slot cache holds the most recently seen non-local
/// domain, since callers overwhelmingly ask for the same foreign domain
/// repeatedly within one request.
pub struct DomainResolver {
    local: DatabaseDomain,
    alias_ids: HashMap<String, String>,
    aliases: Option<HashMap<String, DatabaseDomain>>,
    last_foreign: Option<(String, DatabaseDomain)>,
}

impl DomainResolver {
    pub fn new(local: DatabaseDomain, alias_ids: HashMap<String, String>) -> Self {
        Self {
            local,
            alias_ids,
            aliases: None,
            last_foreign: None,
        }
    }

    pub fn local(&self) -> &DatabaseDomain {
        &self.local
    }

    /// Replace the local domain's table prefix.
    pub fn set_local_prefix(&mut self, prefix: &str) {
        self.local = self.local.with_prefix(prefix);
        self.last_foreign = None;
    }

    pub fn resolve(&mut self, spec: DomainSpec) -> DatabaseDomain {
        match spec {
            DomainSpec::Local => self.local.clone(),
            DomainSpec::Domain(domain) => domain,
            DomainSpec::Id(id) => self.resolve_id(&id),
        }
    }

    fn resolve_id(&mut self, id: &str) -> DatabaseDomain {
        if id == self.local.canonical_id() {
            return self.local.clone();
        }
        if let Some((cached_id, domain)) = &self.last_foreign {
            if cached_id == id {
                return domain.clone();
            }
        }

        let aliases = self.aliases.get_or_insert_with(|| {
            self.alias_ids
                .iter()
                .map(|(alias, canonical)| (alias.clone(), DatabaseDomain::from_id(canonical)))
                .collect()
        });
        let domain = aliases
            .get(id)
            .cloned()
            .unwrap_or_else(|| DatabaseDomain::from_id(id));

        self.last_foreign = Some((id.to_string(), domain.clone()));
        domain
    }
}
