//! Role-based policy engine.
//!
//! The engine authorizes `(role, resource, action)` requests against a set
//! of [`PolicyRule`]s and a directed graph of role edges. An edge
//! `subject → role` means "subject has every permission of role"; it
//! models both user-to-role assignment and role-to-role inheritance.
//!
//! # Evaluation
//!
//! 1. If the subject, or any role reachable from it, is the configured
//!    super role, the check passes.
//! 2. Otherwise the check passes if any reachable role (the subject
//!    included) holds a rule whose resource and action each equal the
//!    request or are the wildcard `*`.
//!
//! # Consistency
//!
//! The graph lives in memory behind a `RwLock` shared by every clone of
//! the engine. Writers are serialized by an async gate, persist to the
//! `policy_rules` table first, and only then apply the change in memory,
//! so a `check` never sees an edit that did not reach the store. Cycles
//! are rejected at write time; traversal still tracks visited roles so a
//! hand-edited table cannot hang a check.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rusqlite::{Connection, params};
use sealkeep_store::Database;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{CoreError, CoreResult};

/// Matches any resource or action.
pub const WILDCARD: &str = "*";

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// The caller of a core operation, as supplied by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: String,
    pub role: String,
}

impl Requester {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

/// A `(role, resource, action)` permission fact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyRule {
    pub role: String,
    pub resource: String,
    pub action: String,
}

impl PolicyRule {
    pub fn new(
        role: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            resource: resource.into(),
            action: action.into(),
        }
    }

    fn matches(&self, resource: &str, action: &str) -> bool {
        (self.resource == WILDCARD || self.resource == resource)
            && (self.action == WILDCARD || self.action == action)
    }
}

/// A `subject → role` edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleEdge {
    pub subject: String,
    pub role: String,
}

/// One effective permission of a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
    /// Role holding the underlying rule; equals the queried role for
    /// direct rules.
    pub granted_by: String,
    pub inherited: bool,
}

/// A navigation entry gated by a single permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuItem {
    pub path: &'static str,
    pub title: &'static str,
    pub icon: &'static str,
    pub order: u32,
}

struct MenuEntry {
    item: MenuItem,
    resource: &'static str,
    action: &'static str,
}

const fn menu(
    path: &'static str,
    title: &'static str,
    icon: &'static str,
    order: u32,
    resource: &'static str,
    action: &'static str,
) -> MenuEntry {
    MenuEntry {
        item: MenuItem {
            path,
            title,
            icon,
            order,
        },
        resource,
        action,
    }
}

static MENU: &[MenuEntry] = &[
    menu("/dashboard", "Dashboard", "LayoutDashboard", 1, "dashboard", "read"),
    menu("/users", "Users", "Users", 2, "users", "read"),
    menu("/policy", "Roles & Permissions", "Shield", 3, "permissions", "read"),
    menu("/audit", "Audit Log", "FileText", 4, "audit", "read"),
    menu("/access_requests", "Access Requests", "FileText", 5, "access_request", "read"),
    menu("/api_key", "API Keys", "Key", 6, "secret", "read"),
    menu("/access_key", "Access Keys", "KeyRound", 7, "secret", "read"),
    menu("/ssh_key", "SSH Keys", "Terminal", 8, "secret", "read"),
    menu("/password", "Passwords", "Lock", 9, "secret", "read"),
    menu("/token", "Tokens", "Coins", 10, "secret", "read"),
    menu("/certificate", "Certificates", "BadgeCheck", 11, "secret", "read"),
    menu("/custom", "Custom", "Braces", 12, "secret", "read"),
    menu("/notifications", "Notifications", "Bell", 13, "notification", "read"),
];

/// Every `(resource, action)` pair reported by
/// [`PolicyEngine::permission_matrix`].
pub static PERMISSION_CATALOGUE: &[(&str, &str)] = &[
    ("dashboard", "read"),
    ("users", "read"),
    ("users", "create"),
    ("users", "update"),
    ("users", "delete"),
    ("permissions", "read"),
    ("permissions", "create"),
    ("permissions", "update"),
    ("permissions", "delete"),
    ("audit", "read"),
    ("secret", "read"),
    ("secret", "create"),
    ("secret", "update"),
    ("secret", "delete"),
    ("secret", "request"),
    ("secret", "temp"),
    ("access_request", "read"),
    ("access_request", "approve"),
    ("access_request", "reject"),
    ("access_request", "cancel"),
    ("notification", "read"),
    ("notification", "create"),
    ("notification", "bulk_send"),
    ("notification", "view_templates"),
];

/// Rules written on first start, before any check is served. The super
/// role's `(*, *)` rule is added separately under its configured name.
static DEFAULT_RULES: &[(&str, &str, &str)] = &[
    ("sec_mgr", "dashboard", "read"),
    ("sec_mgr", "users", "read"),
    ("sec_mgr", "users", "create"),
    ("sec_mgr", "users", "update"),
    ("sec_mgr", "users", "delete"),
    ("sec_mgr", "permissions", "read"),
    ("sec_mgr", "permissions", "create"),
    ("sec_mgr", "permissions", "update"),
    ("sec_mgr", "permissions", "delete"),
    ("sec_mgr", "audit", "read"),
    ("sec_mgr", "secret", "read"),
    ("sec_mgr", "secret", "create"),
    ("sec_mgr", "secret", "update"),
    ("sec_mgr", "secret", "delete"),
    ("sec_mgr", "access_request", "read"),
    ("sec_mgr", "access_request", "approve"),
    ("sec_mgr", "access_request", "reject"),
    ("sec_mgr", "access_request", "cancel"),
    ("sec_mgr", "notification", "create"),
    ("sec_mgr", "notification", "bulk_send"),
    ("sec_mgr", "notification", "view_templates"),
    ("dev", "dashboard", "read"),
    ("dev", "secret", "read"),
    ("dev", "secret", "request"),
    ("dev", "access_request", "read"),
    ("dev", "access_request", "cancel"),
    ("auditor", "dashboard", "read"),
    ("auditor", "audit", "read"),
    ("auditor", "notification", "view_templates"),
    ("bot", "secret", "temp"),
];

static DEFAULT_EDGES: &[(&str, &str)] = &[("sec_mgr", "dev"), ("auditor", "dev")];

// ═══════════════════════════════════════════════════════════════════════
//  Graph
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
struct PolicyGraph {
    rules: BTreeSet<PolicyRule>,
    /// subject → roles it holds directly.
    parents: BTreeMap<String, BTreeSet<String>>,
}

impl PolicyGraph {
    /// `subject` followed by every role reachable from it, breadth-first.
    fn reachable(&self, subject: &str) -> Vec<String> {
        let mut seen = BTreeSet::from([subject.to_string()]);
        let mut order = vec![subject.to_string()];
        let mut queue = VecDeque::from([subject.to_string()]);

        while let Some(current) = queue.pop_front() {
            for parent in self.parents.get(&current).into_iter().flatten() {
                if seen.insert(parent.clone()) {
                    order.push(parent.clone());
                    queue.push_back(parent.clone());
                }
            }
        }
        order
    }

    fn reaches(&self, from: &str, to: &str) -> bool {
        self.reachable(from).iter().any(|r| r == to)
    }

    fn check(&self, super_role: &str, subject: &str, resource: &str, action: &str) -> bool {
        let roles = self.reachable(subject);
        if roles.iter().any(|r| r == super_role) {
            return true;
        }
        roles.iter().any(|role| {
            self.rules_of(role)
                .any(|rule| rule.matches(resource, action))
        })
    }

    fn rules_of<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a PolicyRule> + 'a {
        self.rules.iter().filter(move |r| r.role == role)
    }

    fn permissions_of(&self, role: &str) -> Vec<Permission> {
        let mut effective: BTreeMap<(String, String), Permission> = BTreeMap::new();
        // `reachable` yields the role itself first, so direct rules claim
        // their (resource, action) slot before any inherited duplicate.
        for holder in self.reachable(role) {
            for rule in self.rules_of(&holder) {
                effective
                    .entry((rule.resource.clone(), rule.action.clone()))
                    .or_insert_with(|| Permission {
                        resource: rule.resource.clone(),
                        action: rule.action.clone(),
                        granted_by: holder.clone(),
                        inherited: holder != role,
                    });
            }
        }
        effective.into_values().collect()
    }

    /// Whether `name` is a role rather than a user: it owns rules or some
    /// other subject inherits from it.
    fn is_role(&self, name: &str) -> bool {
        self.rules_of(name).next().is_some()
            || self.parents.values().any(|roles| roles.contains(name))
    }

    /// Users (non-role subjects) whose roles allow `action` on `resource`.
    fn users_permitted(&self, super_role: &str, resource: &str, action: &str) -> Vec<String> {
        self.parents
            .keys()
            .filter(|subject| !self.is_role(subject))
            .filter(|subject| self.check(super_role, subject, resource, action))
            .cloned()
            .collect()
    }

    fn subjects_of(&self, role: &str) -> Vec<String> {
        self.parents
            .iter()
            .filter(|(_, roles)| roles.contains(role))
            .map(|(subject, _)| subject.clone())
            .collect()
    }

    fn has_edge(&self, subject: &str, role: &str) -> bool {
        self.parents
            .get(subject)
            .is_some_and(|roles| roles.contains(role))
    }

    fn add_edge(&mut self, subject: &str, role: &str) {
        self.parents
            .entry(subject.to_string())
            .or_default()
            .insert(role.to_string());
    }

    fn remove_edge(&mut self, subject: &str, role: &str) {
        if let Some(roles) = self.parents.get_mut(subject) {
            roles.remove(role);
            if roles.is_empty() {
                self.parents.remove(subject);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Persistence
// ═══════════════════════════════════════════════════════════════════════

fn load_graph(conn: &Connection) -> CoreResult<PolicyGraph> {
    let mut stmt = conn.prepare("SELECT ptype, subject, object, action FROM policy_rules")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut graph = PolicyGraph::default();
    for (ptype, subject, object, action) in rows {
        match ptype.as_str() {
            "p" => {
                graph.rules.insert(PolicyRule::new(subject, object, action));
            }
            "g" => graph.add_edge(&subject, &object),
            other => {
                return Err(CoreError::Store(sealkeep_store::StoreError::Corrupt {
                    column: "policy_rules.ptype",
                    value: other.to_string(),
                }));
            }
        }
    }
    Ok(graph)
}

fn insert_rule(conn: &Connection, rule: &PolicyRule, now: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO policy_rules (ptype, subject, object, action, created_at)
         VALUES ('p', ?1, ?2, ?3, ?4)",
        params![rule.role, rule.resource, rule.action, now],
    )
}

fn insert_edge(conn: &Connection, subject: &str, role: &str, now: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO policy_rules (ptype, subject, object, action, created_at)
         VALUES ('g', ?1, ?2, '', ?3)",
        params![subject, role, now],
    )
}

/// Write the default rule set if the table is empty. Returns whether
/// anything was written.
fn seed_if_empty(conn: &Connection, super_role: &str) -> CoreResult<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM policy_rules", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(false);
    }

    let now = crate::now_ms();
    insert_rule(conn, &PolicyRule::new(super_role, WILDCARD, WILDCARD), now)?;
    for (role, resource, action) in DEFAULT_RULES {
        insert_rule(conn, &PolicyRule::new(*role, *resource, *action), now)?;
    }
    for (child, parent) in DEFAULT_EDGES {
        insert_edge(conn, child, parent, now)?;
    }
    Ok(true)
}

fn non_empty(field: &str, value: &str) -> CoreResult<()> {
    if value.trim().is_empty() {
        return Err(CoreError::InvalidArgument(format!("{field} must not be empty")));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  PolicyEngine
// ═══════════════════════════════════════════════════════════════════════

struct Inner {
    db: Database,
    super_role: String,
    graph: RwLock<PolicyGraph>,
    writes: tokio::sync::Mutex<()>,
}

/// Shared, persistent RBAC engine. Clones share one graph.
#[derive(Clone)]
pub struct PolicyEngine {
    inner: Arc<Inner>,
}

impl PolicyEngine {
    /// Load the rule graph from `db`, seeding defaults on an empty table.
    pub async fn load(db: Database, super_role: impl Into<String>) -> CoreResult<Self> {
        let super_role = super_role.into();
        non_empty("super role", &super_role)?;

        let seed_role = super_role.clone();
        let (seeded, graph) = db
            .transaction(move |tx| {
                let seeded = seed_if_empty(tx, &seed_role)?;
                Ok::<_, CoreError>((seeded, load_graph(tx)?))
            })
            .await?;

        if seeded {
            info!(
                rules = graph.rules.len(),
                edges = DEFAULT_EDGES.len(),
                "seeded default policy"
            );
        }
        debug!(rules = graph.rules.len(), super_role = %super_role, "policy loaded");

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                super_role,
                graph: RwLock::new(graph),
                writes: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Re-read the rule table, replacing the in-memory graph.
    pub async fn reload(&self) -> CoreResult<()> {
        let _gate = self.inner.writes.lock().await;
        let graph = self.inner.db.execute(|conn| Ok(load_graph(conn))).await??;
        *self.graph_mut() = graph;
        info!("policy reloaded");
        Ok(())
    }

    pub fn super_role(&self) -> &str {
        &self.inner.super_role
    }

    // -- Evaluation -----------------------------------------------------

    /// Whether `role` may perform `action` on `resource`.
    pub fn check(&self, role: &str, resource: &str, action: &str) -> bool {
        let allowed = self
            .graph()
            .check(&self.inner.super_role, role, resource, action);
        debug!(role, resource, action, allowed, "policy check");
        allowed
    }

    /// [`check`](Self::check) as a `Result`, for use with `?`.
    pub fn authorize(&self, requester: &Requester, resource: &str, action: &str) -> CoreResult<()> {
        if self.check(&requester.role, resource, action) {
            Ok(())
        } else {
            Err(CoreError::forbidden(format!(
                "role {} may not {action} {resource}",
                requester.role
            )))
        }
    }

    // -- Rules ----------------------------------------------------------

    /// Add a rule. Fails with `Conflict` if it already exists.
    #[instrument(skip(self))]
    pub async fn add_rule(&self, role: &str, resource: &str, action: &str) -> CoreResult<PolicyRule> {
        non_empty("role", role)?;
        non_empty("resource", resource)?;
        non_empty("action", action)?;
        let rule = PolicyRule::new(role, resource, action);

        let _gate = self.inner.writes.lock().await;
        if self.graph().rules.contains(&rule) {
            return Err(CoreError::conflict(format!(
                "rule ({role}, {resource}, {action}) already exists"
            )));
        }

        let stored = rule.clone();
        self.inner
            .db
            .execute(move |conn| Ok(insert_rule(conn, &stored, crate::now_ms())?))
            .await?;
        self.graph_mut().rules.insert(rule.clone());

        info!(role, resource, action, "policy rule added");
        Ok(rule)
    }

    /// Remove a rule. Fails with `NotFound` if it does not exist.
    #[instrument(skip(self))]
    pub async fn remove_rule(&self, role: &str, resource: &str, action: &str) -> CoreResult<()> {
        let rule = PolicyRule::new(role, resource, action);

        let _gate = self.inner.writes.lock().await;
        if !self.graph().rules.contains(&rule) {
            return Err(CoreError::not_found(
                "policy rule",
                format!("({role}, {resource}, {action})"),
            ));
        }

        let stored = rule.clone();
        self.inner
            .db
            .execute(move |conn| {
                conn.execute(
                    "DELETE FROM policy_rules
                     WHERE ptype = 'p' AND subject = ?1 AND object = ?2 AND action = ?3",
                    params![stored.role, stored.resource, stored.action],
                )?;
                Ok(())
            })
            .await?;
        self.graph_mut().rules.remove(&rule);

        info!(role, resource, action, "policy rule removed");
        Ok(())
    }

    /// All rules, or only those held directly by `role`, sorted.
    pub fn list_rules(&self, role: Option<&str>) -> Vec<PolicyRule> {
        self.graph()
            .rules
            .iter()
            .filter(|r| role.is_none_or(|role| r.role == role))
            .cloned()
            .collect()
    }

    /// Replace every direct rule of `role` with `permissions` in one
    /// transaction. Inheritance edges are untouched.
    #[instrument(skip(self, permissions), fields(count = permissions.len()))]
    pub async fn replace_role_permissions(
        &self,
        role: &str,
        permissions: &[(String, String)],
    ) -> CoreResult<Vec<PolicyRule>> {
        non_empty("role", role)?;
        let mut rules = BTreeSet::new();
        for (resource, action) in permissions {
            non_empty("resource", resource)?;
            non_empty("action", action)?;
            rules.insert(PolicyRule::new(role, resource.as_str(), action.as_str()));
        }

        let _gate = self.inner.writes.lock().await;
        let role_owned = role.to_string();
        let stored = rules.clone();
        self.inner
            .db
            .transaction(move |tx| {
                tx.execute(
                    "DELETE FROM policy_rules WHERE ptype = 'p' AND subject = ?1",
                    [&role_owned],
                )?;
                let now = crate::now_ms();
                for rule in &stored {
                    insert_rule(tx, rule, now)?;
                }
                Ok::<_, CoreError>(())
            })
            .await?;

        {
            let mut graph = self.graph_mut();
            graph.rules.retain(|r| r.role != role);
            graph.rules.extend(rules.iter().cloned());
        }

        info!(role, rules = rules.len(), "role permissions replaced");
        Ok(rules.into_iter().collect())
    }

    // -- Role edges -----------------------------------------------------

    /// Give `subject` every permission of `role`.
    ///
    /// Fails with `Conflict` on a duplicate edge and `InvalidArgument` if
    /// the edge would close an inheritance cycle.
    #[instrument(skip(self))]
    pub async fn assign_role(&self, subject: &str, role: &str) -> CoreResult<()> {
        non_empty("subject", subject)?;
        non_empty("role", role)?;

        let _gate = self.inner.writes.lock().await;
        {
            let graph = self.graph();
            if graph.has_edge(subject, role) {
                return Err(CoreError::conflict(format!("{subject} already holds {role}")));
            }
            if subject == role || graph.reaches(role, subject) {
                return Err(CoreError::InvalidArgument(format!(
                    "{subject} -> {role} would create an inheritance cycle"
                )));
            }
        }

        let (s, r) = (subject.to_string(), role.to_string());
        self.inner
            .db
            .execute(move |conn| Ok(insert_edge(conn, &s, &r, crate::now_ms())?))
            .await?;
        self.graph_mut().add_edge(subject, role);

        info!(subject, role, "role assigned");
        Ok(())
    }

    /// Remove a `subject → role` edge. Fails with `NotFound` if absent.
    #[instrument(skip(self))]
    pub async fn unassign_role(&self, subject: &str, role: &str) -> CoreResult<()> {
        let _gate = self.inner.writes.lock().await;
        if !self.graph().has_edge(subject, role) {
            return Err(CoreError::not_found("role edge", format!("{subject} -> {role}")));
        }

        let (s, r) = (subject.to_string(), role.to_string());
        self.inner
            .db
            .execute(move |conn| {
                conn.execute(
                    "DELETE FROM policy_rules WHERE ptype = 'g' AND subject = ?1 AND object = ?2",
                    params![s, r],
                )?;
                Ok(())
            })
            .await?;
        self.graph_mut().remove_edge(subject, role);

        info!(subject, role, "role unassigned");
        Ok(())
    }

    /// Make `child` inherit every permission of `parent`.
    pub async fn inherit(&self, child: &str, parent: &str) -> CoreResult<()> {
        self.assign_role(child, parent).await
    }

    /// Remove an inheritance edge.
    pub async fn disinherit(&self, child: &str, parent: &str) -> CoreResult<()> {
        self.unassign_role(child, parent).await
    }

    /// Roles `subject` holds directly.
    pub fn roles_of(&self, subject: &str) -> Vec<String> {
        self.graph()
            .parents
            .get(subject)
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every role reachable from `subject`, excluding `subject` itself.
    pub fn implicit_roles_of(&self, subject: &str) -> Vec<String> {
        self.graph().reachable(subject).into_iter().skip(1).collect()
    }

    /// Subjects holding `role` directly.
    pub fn subjects_of(&self, role: &str) -> Vec<String> {
        self.graph().subjects_of(role)
    }

    /// Users holding a role, directly or through inheritance, that allows
    /// `action` on `resource`. Subjects that are themselves roles are left
    /// out.
    pub fn users_permitted(&self, resource: &str, action: &str) -> Vec<String> {
        self.graph()
            .users_permitted(&self.inner.super_role, resource, action)
    }

    /// Every edge, sorted.
    pub fn list_edges(&self) -> Vec<RoleEdge> {
        let graph = self.graph();
        graph
            .parents
            .iter()
            .flat_map(|(subject, roles)| {
                roles.iter().map(move |role| RoleEdge {
                    subject: subject.clone(),
                    role: role.clone(),
                })
            })
            .collect()
    }

    /// Every role that appears in a rule or an edge, sorted.
    pub fn known_roles(&self) -> Vec<String> {
        let graph = self.graph();
        let mut roles: BTreeSet<String> = graph.rules.iter().map(|r| r.role.clone()).collect();
        for (subject, parents) in &graph.parents {
            roles.insert(subject.clone());
            roles.extend(parents.iter().cloned());
        }
        roles.into_iter().collect()
    }

    // -- Projections ----------------------------------------------------

    /// Direct plus inherited permissions of `role`, de-duplicated by
    /// `(resource, action)` with direct rules winning, sorted.
    pub fn permissions_of(&self, role: &str) -> Vec<Permission> {
        self.graph().permissions_of(role)
    }

    /// `"resource:action" → allowed` for every catalogue entry.
    pub fn permission_matrix(&self, role: &str) -> BTreeMap<String, bool> {
        let graph = self.graph();
        PERMISSION_CATALOGUE
            .iter()
            .map(|(resource, action)| {
                (
                    format!("{resource}:{action}"),
                    graph.check(&self.inner.super_role, role, resource, action),
                )
            })
            .collect()
    }

    /// Menu entries `role` may open, in display order.
    pub fn menus_for(&self, role: &str) -> Vec<MenuItem> {
        let graph = self.graph();
        MENU.iter()
            .filter(|entry| graph.check(&self.inner.super_role, role, entry.resource, entry.action))
            .map(|entry| entry.item.clone())
            .collect()
    }

    // -- Lock helpers ---------------------------------------------------

    fn graph(&self) -> RwLockReadGuard<'_, PolicyGraph> {
        self.inner
            .graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn graph_mut(&self) -> RwLockWriteGuard<'_, PolicyGraph> {
        self.inner
            .graph
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> PolicyEngine {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        PolicyEngine::load(db, "super_admin").await.unwrap()
    }

    #[tokio::test]
    async fn seeds_defaults_once() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let first = PolicyEngine::load(db.clone(), "super_admin").await.unwrap();
        let count = first.list_rules(None).len();
        assert_eq!(count, DEFAULT_RULES.len() + 1);

        first.remove_rule("bot", "secret", "temp").await.unwrap();
        let second = PolicyEngine::load(db, "super_admin").await.unwrap();
        assert_eq!(second.list_rules(None).len(), count - 1);
    }

    #[tokio::test]
    async fn super_role_bypasses_rules() {
        let engine = engine().await;
        assert!(engine.check("super_admin", "anything", "at_all"));
        engine.remove_rule("super_admin", "*", "*").await.unwrap();
        assert!(engine.check("super_admin", "anything", "at_all"));
    }

    #[tokio::test]
    async fn wildcards_match_per_component() {
        let engine = engine().await;
        engine.add_rule("ops", "secret", "*").await.unwrap();
        engine.add_rule("ops", "*", "read").await.unwrap();

        assert!(engine.check("ops", "secret", "delete"));
        assert!(engine.check("ops", "audit", "read"));
        assert!(!engine.check("ops", "audit", "delete"));
    }

    #[tokio::test]
    async fn inheritance_grants_and_revokes() {
        let engine = engine().await;
        engine.add_rule("b", "x", "read").await.unwrap();
        assert!(!engine.check("a", "x", "read"));

        engine.inherit("a", "b").await.unwrap();
        assert!(engine.check("a", "x", "read"));

        engine.disinherit("a", "b").await.unwrap();
        assert!(!engine.check("a", "x", "read"));
    }

    #[tokio::test]
    async fn seeded_inheritance_reaches_dev_rules() {
        let engine = engine().await;
        assert!(engine.check("sec_mgr", "secret", "request"));
        assert!(engine.check("auditor", "secret", "read"));
        assert!(!engine.check("dev", "access_request", "approve"));
        assert!(!engine.check("bot", "secret", "read"));
    }

    #[tokio::test]
    async fn cycles_are_rejected() {
        let engine = engine().await;
        engine.inherit("a", "b").await.unwrap();
        engine.inherit("b", "c").await.unwrap();

        assert!(matches!(
            engine.inherit("c", "a").await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.inherit("a", "a").await,
            Err(CoreError::InvalidArgument(_))
        ));
        // The rejected edge was not persisted.
        engine.reload().await.unwrap();
        assert!(engine.roles_of("c").is_empty());
    }

    #[tokio::test]
    async fn duplicate_and_missing_edits() {
        let engine = engine().await;
        assert!(matches!(
            engine.add_rule("dev", "secret", "read").await,
            Err(CoreError::Conflict { .. })
        ));
        assert!(matches!(
            engine.remove_rule("dev", "secret", "shred").await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            engine.assign_role("sec_mgr", "dev").await,
            Err(CoreError::Conflict { .. })
        ));
        assert!(matches!(
            engine.unassign_role("bot", "dev").await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            engine.add_rule("", "secret", "read").await,
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn permissions_prefer_direct_rules() {
        let engine = engine().await;
        engine.add_rule("sec_mgr", "secret", "request").await.unwrap();

        let perms = engine.permissions_of("sec_mgr");
        let request: Vec<_> = perms
            .iter()
            .filter(|p| p.resource == "secret" && p.action == "request")
            .collect();
        assert_eq!(request.len(), 1);
        assert_eq!(request[0].granted_by, "sec_mgr");
        assert!(!request[0].inherited);

        let cancel = perms
            .iter()
            .find(|p| p.resource == "access_request" && p.action == "cancel")
            .unwrap();
        assert!(!cancel.inherited);

        let dev_perms = engine.permissions_of("auditor");
        let read = dev_perms
            .iter()
            .find(|p| p.resource == "secret" && p.action == "read")
            .unwrap();
        assert_eq!(read.granted_by, "dev");
        assert!(read.inherited);
    }

    #[tokio::test]
    async fn role_queries() {
        let engine = engine().await;
        engine.assign_role("alice", "sec_mgr").await.unwrap();

        assert_eq!(engine.roles_of("alice"), vec!["sec_mgr".to_string()]);
        assert_eq!(
            engine.implicit_roles_of("alice"),
            vec!["sec_mgr".to_string(), "dev".to_string()]
        );
        assert_eq!(
            engine.subjects_of("dev"),
            vec!["auditor".to_string(), "sec_mgr".to_string()]
        );
        assert!(engine.check("alice", "access_request", "approve"));
        assert!(engine.known_roles().contains(&"alice".to_string()));
    }

    #[tokio::test]
    async fn users_permitted_resolves_through_roles() {
        let engine = engine().await;
        engine.assign_role("mia", "sec_mgr").await.unwrap();
        engine.assign_role("root", "super_admin").await.unwrap();
        engine.assign_role("dan", "dev").await.unwrap();
        engine.add_rule("lead", "access_request", "approve").await.unwrap();
        engine.assign_role("lena", "lead").await.unwrap();

        let approvers = engine.users_permitted("access_request", "approve");
        assert_eq!(approvers, vec!["lena", "mia", "root"]);

        engine.unassign_role("mia", "sec_mgr").await.unwrap();
        assert!(!engine.users_permitted("access_request", "approve").contains(&"mia".to_string()));
    }

    #[tokio::test]
    async fn replace_role_permissions_is_bulk() {
        let engine = engine().await;
        let rules = engine
            .replace_role_permissions(
                "auditor",
                &[
                    ("audit".into(), "read".into()),
                    ("audit".into(), "export".into()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert!(engine.check("auditor", "audit", "export"));
        assert!(!engine.check("auditor", "notification", "view_templates"));
        // Inherited dev rules survive the replace.
        assert!(engine.check("auditor", "secret", "read"));

        engine.reload().await.unwrap();
        assert!(engine.check("auditor", "audit", "export"));
    }

    #[tokio::test]
    async fn menus_and_matrix_follow_policy() {
        let engine = engine().await;

        let dev_menus: Vec<_> = engine.menus_for("dev").iter().map(|m| m.path).collect();
        assert!(dev_menus.contains(&"/dashboard"));
        assert!(dev_menus.contains(&"/password"));
        assert!(!dev_menus.contains(&"/users"));

        assert_eq!(engine.menus_for("super_admin").len(), MENU.len());

        let matrix = engine.permission_matrix("auditor");
        assert_eq!(matrix.len(), PERMISSION_CATALOGUE.len());
        assert_eq!(matrix.get("audit:read"), Some(&true));
        assert_eq!(matrix.get("secret:delete"), Some(&false));
    }

    #[tokio::test]
    async fn authorize_reports_forbidden() {
        let engine = engine().await;
        let bob = Requester::new("bob", "dev");
        assert!(engine.authorize(&bob, "secret", "read").is_ok());
        assert!(matches!(
            engine.authorize(&bob, "secret", "delete"),
            Err(CoreError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn edits_visible_to_concurrent_readers() {
        let engine = engine().await;
        let mut readers = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    engine.check("dev", "secret", "read");
                    tokio::task::yield_now().await;
                }
            }));
        }
        for i in 0..10 {
            engine.add_rule("ops", "res", &format!("a{i}")).await.unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(engine.list_rules(Some("ops")).len(), 10);
        assert!(engine.check("ops", "res", "a9"));
    }
}
