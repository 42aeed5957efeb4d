//! End-to-end reconciler scenarios against in-process fakes: a scriptable
//! backend per connector and a map-backed directory.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};

use super::*;
use crate::config::{backend_key, BackendConfig, PatternPair};
use crate::connectors::{Conflict, Connector, ConnectorRegistry, Team, User};
use crate::directory::{DirectoryClient, NotFound};
use crate::offboarding::{PeriodicTask, UserOffboardingJob};
use crate::resources::{Backend, GroupEvent, GroupMembers, GroupSpec, InMemoryResources};
use crate::store::test_helpers::memory_store;
use crate::store::Store;
use crate::transform::NameTransformer;

// ---------- fakes ----------

#[derive(Default, Debug)]
struct FakeState {
    users: Vec<User>,
    // users that exist on the backend but only show up in listings after
    // a create conflict (models an invite-pending record)
    hidden_users: Vec<User>,
    revealed: bool,
    teams: Vec<Team>,
    members: HashMap<String, BTreeSet<String>>,
    calls: Vec<String>,
    next_id: u64,
    conflict_on_create: bool,
    fail_create_team: bool,
    fail_delete_team: bool,
    ldap_synced: bool,
    sso_synced: bool,
}

impl FakeState {
    fn mutating_calls(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter(|c| {
                c.starts_with("create_")
                    || c.starts_with("add:")
                    || c.starts_with("remove:")
                    || c.starts_with("delete_")
            })
            .cloned()
            .collect()
    }
}

type FakeHandle = Arc<Mutex<FakeState>>;

#[derive(Debug)]
struct FakeBackend {
    state: FakeHandle,
}

#[async_trait]
impl Connector for FakeBackend {
    async fn fetch_all_users(&self) -> Result<(HashMap<String, User>, HashMap<String, User>)> {
        let state = self.state.lock();
        let mut all: Vec<&User> = state.users.iter().collect();
        if state.revealed {
            all.extend(state.hidden_users.iter());
        }
        let by_email = all
            .iter()
            .map(|u| (u.email.to_owned(), (*u).to_owned()))
            .collect();
        let by_id = all
            .iter()
            .map(|u| (u.id.to_owned(), (*u).to_owned()))
            .collect();
        Ok((by_email, by_id))
    }

    async fn fetch_user_details(&self, user_id: &str) -> Result<User> {
        self.state
            .lock()
            .users
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
            .ok_or_else(|| anyhow!("user not found: {user_id}"))
    }

    async fn create_user(&self, user: &User) -> Result<User> {
        let mut state = self.state.lock();
        state.calls.push(format!("create_user:{}", user.email));
        if state.conflict_on_create {
            state.revealed = true;
            return Err(anyhow!(Conflict));
        }
        state.next_id += 1;
        let created = User {
            id: format!("u-{}", state.next_id),
            ..user.to_owned()
        };
        state.users.push(created.to_owned());
        Ok(created)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete_user:{user_id}"));
        state.users.retain(|u| u.id != user_id);
        Ok(())
    }

    async fn fetch_all_teams(&self) -> Result<HashMap<String, Team>> {
        Ok(self
            .state
            .lock()
            .teams
            .iter()
            .map(|t| (t.name.to_owned(), t.to_owned()))
            .collect())
    }

    async fn fetch_team_details(&self, team_id: &str) -> Result<Team> {
        self.state
            .lock()
            .teams
            .iter()
            .find(|t| t.id == team_id)
            .cloned()
            .ok_or_else(|| anyhow!("team not found: {team_id}"))
    }

    async fn create_team(&self, team: &Team) -> Result<Team> {
        let mut state = self.state.lock();
        state.calls.push(format!("create_team:{}", team.name));
        if state.fail_create_team {
            bail!("backend refused team creation");
        }
        state.next_id += 1;
        let created = Team {
            id: format!("t-{}", state.next_id),
            ..team.to_owned()
        };
        state.teams.push(created.to_owned());
        state.members.insert(created.id.to_owned(), BTreeSet::new());
        Ok(created)
    }

    async fn delete_team_by_id(&self, team_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete_team:{team_id}"));
        if state.fail_delete_team {
            bail!("backend refused team deletion");
        }
        state.teams.retain(|t| t.id != team_id);
        state.members.remove(team_id);
        Ok(())
    }

    async fn fetch_team_members(&self, team_id: &str) -> Result<HashMap<String, User>> {
        let state = self.state.lock();
        let ids = state.members.get(team_id).cloned().unwrap_or_default();
        Ok(ids
            .into_iter()
            .map(|id| {
                let user = state
                    .users
                    .iter()
                    .find(|u| u.id == id)
                    .cloned()
                    .unwrap_or(User {
                        id: id.to_owned(),
                        ..Default::default()
                    });
                (id, user)
            })
            .collect())
    }

    async fn add_users_to_team(&self, team_id: &str, user_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("add:{team_id}:{}", user_ids.join(",")));
        state
            .members
            .entry(team_id.to_owned())
            .or_default()
            .extend(user_ids.iter().cloned());
        Ok(())
    }

    async fn remove_users_from_team(&self, team_id: &str, user_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("remove:{team_id}:{}", user_ids.join(",")));
        if let Some(members) = state.members.get_mut(team_id) {
            for id in user_ids {
                members.remove(id);
            }
        }
        Ok(())
    }

    fn set_ldap_sync(&mut self, enabled: bool, _group_cn: Option<String>) {
        self.state.lock().ldap_synced = enabled;
    }

    fn set_sso_sync(&mut self, enabled: bool) {
        self.state.lock().sso_synced = enabled;
    }

    fn ldap_synced(&self) -> bool {
        self.state.lock().ldap_synced
    }

    fn sso_synced(&self) -> bool {
        self.state.lock().sso_synced
    }
}

#[derive(Default)]
struct FakeDirectory {
    users: Mutex<HashMap<String, User>>,
    queries: Mutex<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
    async fn get_user_data(&self, identifier: &str) -> Result<User> {
        self.users
            .lock()
            .get(identifier)
            .cloned()
            .ok_or_else(|| anyhow!(NotFound))
    }

    async fn get_query_members(&self, filter: &str) -> Result<Vec<String>> {
        Ok(self
            .queries
            .lock()
            .get(filter)
            .cloned()
            .unwrap_or_default())
    }
}

fn dir_user(uid: &str, email: &str) -> User {
    User {
        id: uid.to_owned(),
        email: email.to_owned(),
        username: uid.to_owned(),
        first_name: uid.to_owned(),
        last_name: "Test".to_owned(),
        display_name: format!("{uid} Test"),
        role: String::new(),
    }
}

// ---------- test bed ----------

struct TestBed {
    resources: Arc<InMemoryResources>,
    reconciler: GroupReconciler,
    store: Store,
    directory: Arc<FakeDirectory>,
    registry: Arc<ConnectorRegistry>,
    cache_lock: Arc<RwLock<()>>,
    handles: HashMap<String, FakeHandle>,
    // keeps the resource event channel open; the reconciler is driven
    // directly in these tests rather than through the worker pool
    _events: mpsc::Receiver<GroupEvent>,
}

fn testbed(backends: &[(&str, &str)]) -> TestBed {
    let patterns: HashMap<String, Vec<PatternPair>> = [(
        "default".to_owned(),
        vec![PatternPair {
            input: "(.*)".to_owned(),
            output: "$1".to_owned(),
        }],
    )]
    .into();
    testbed_with_patterns(backends, patterns)
}

fn testbed_with_patterns(
    backends: &[(&str, &str)],
    patterns: HashMap<String, Vec<PatternPair>>,
) -> TestBed {
    let mut handles: HashMap<String, FakeHandle> = HashMap::new();
    let mut configs = Vec::new();
    let mut by_type: HashMap<String, HashMap<String, FakeHandle>> = HashMap::new();
    for (name, backend_type) in backends {
        let handle = FakeHandle::default();
        handles.insert(backend_key(name, backend_type), Arc::clone(&handle));
        by_type
            .entry((*backend_type).to_owned())
            .or_default()
            .insert((*name).to_owned(), handle);
        configs.push(BackendConfig {
            name: (*name).to_owned(),
            backend_type: (*backend_type).to_owned(),
            enabled: true,
            connection: [("token".to_owned(), "t".to_owned())].into(),
            depends_on: None,
        });
    }

    let mut registry = ConnectorRegistry::new(&configs);
    for (backend_type, fakes) in by_type {
        registry.register(&backend_type, move |config| {
            let state = fakes
                .get(&config.name)
                .ok_or_else(|| anyhow!("no fake backend for {}", config.name))?;
            Ok(Box::new(FakeBackend {
                state: Arc::clone(state),
            }))
        });
    }
    let registry = Arc::new(registry);

    let store = memory_store();
    let directory = Arc::new(FakeDirectory::default());
    let cache_lock = Arc::new(RwLock::new(()));
    let (resources, events) = InMemoryResources::new(32);
    let transformer = Arc::new(NameTransformer::from_config(&patterns).unwrap());

    let reconciler = GroupReconciler::new(
        Arc::clone(&resources) as Arc<dyn crate::resources::ResourceClient>,
        Arc::clone(&directory) as Arc<dyn DirectoryClient>,
        Arc::clone(&registry),
        transformer,
        store.clone(),
        Arc::clone(&cache_lock),
    );

    TestBed {
        resources,
        reconciler,
        store,
        directory,
        registry,
        cache_lock,
        handles,
        _events: events,
    }
}

impl TestBed {
    fn add_directory_user(&self, uid: &str, email: &str) {
        self.directory
            .users
            .lock()
            .insert(uid.to_owned(), dir_user(uid, email));
    }

    fn handle(&self, key: &str) -> &FakeHandle {
        &self.handles[key]
    }

    fn clear_calls(&self) {
        for handle in self.handles.values() {
            handle.lock().calls.clear();
        }
    }
}

fn spec(group_name: &str, users: &[&str], backends: &[(&str, &str)]) -> GroupSpec {
    GroupSpec {
        group_name: group_name.to_owned(),
        members: GroupMembers {
            users: users.iter().map(|u| (*u).to_owned()).collect(),
            groups: vec![],
        },
        backends: backends
            .iter()
            .map(|(name, backend_type)| Backend {
                name: (*name).to_owned(),
                backend_type: (*backend_type).to_owned(),
            })
            .collect(),
        ldap_query: None,
        dependencies: vec![],
    }
}

// ---------- scenarios ----------

#[tokio::test]
async fn create_from_scratch() -> Result<()> {
    let bed = testbed(&[("fivetran-clone", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.resources
        .apply("data-team", spec("data-team", &["alice"], &[("fivetran-clone", "type-a")]))
        .await?;

    let outcome = bed.reconciler.reconcile("data-team").await?;
    assert_eq!(outcome.requeue_after, None);

    // status reports the one backend as successful
    let record = bed.resources.get("data-team").await?.unwrap();
    assert_eq!(record.status.backends_status.len(), 1);
    let entry = &record.status.backends_status[0];
    assert!(entry.status);
    assert_eq!(entry.message, "Successful");
    assert_eq!(entry.name, "fivetran-clone");

    // the backend has the team with alice in it
    let key = backend_key("fivetran-clone", "type-a");
    {
        let state = bed.handle(&key).lock();
        assert_eq!(state.teams.len(), 1);
        assert_eq!(state.teams[0].name, "data-team");
        let members = &state.members[&state.teams[0].id];
        assert_eq!(members.len(), 1);
    }

    // store reflects the converged state
    let group = bed.store.group.get("data-team").await?;
    assert_eq!(group.members, vec!["alice@x.com".to_owned()]);
    let user_backends = bed.store.user.get_backends("alice@x.com").await?;
    assert_eq!(user_backends[&key], "u-1");
    assert_eq!(bed.store.meta.get_user_list().await?, vec!["alice".to_owned()]);
    assert_eq!(
        bed.store.user_groups.get_groups("alice@x.com").await?,
        vec!["data-team".to_owned()]
    );
    Ok(())
}

#[tokio::test]
async fn unknown_directory_user_is_skipped() -> Result<()> {
    let bed = testbed(&[("fivetran-clone", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.resources
        .apply(
            "data-team",
            spec("data-team", &["alice", "ghost"], &[("fivetran-clone", "type-a")]),
        )
        .await?;

    bed.reconciler.reconcile("data-team").await?;

    let group = bed.store.group.get("data-team").await?;
    assert_eq!(group.members, vec!["alice@x.com".to_owned()]);
    let record = bed.resources.get("data-team").await?.unwrap();
    assert!(record.status.backends_status[0].status);
    Ok(())
}

#[tokio::test]
async fn removed_backend_is_offboarded() -> Result<()> {
    let bed = testbed(&[("a", "type-a"), ("b", "type-b")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.resources
        .apply(
            "data-team",
            spec("data-team", &["alice"], &[("a", "type-a"), ("b", "type-b")]),
        )
        .await?;
    bed.reconciler.reconcile("data-team").await?;
    assert_eq!(
        bed.resources
            .get("data-team")
            .await?
            .unwrap()
            .status
            .backends_status
            .len(),
        2
    );

    // drop backend b from the spec
    bed.resources
        .apply("data-team", spec("data-team", &["alice"], &[("a", "type-a")]))
        .await?;
    bed.clear_calls();
    let outcome = bed.reconciler.reconcile("data-team").await?;
    assert_eq!(outcome.requeue_after, None);

    // the sole-referent team was deleted on b, a untouched by removal
    let b_key = backend_key("b", "type-b");
    {
        let state = bed.handle(&b_key).lock();
        assert!(state.teams.is_empty());
        assert!(state
            .calls
            .iter()
            .any(|c| c.starts_with("delete_team:")));
    }

    // b is gone from status and from the store record
    let record = bed.resources.get("data-team").await?.unwrap();
    assert_eq!(record.status.backends_status.len(), 1);
    assert_eq!(record.status.backends_status[0].name, "a");
    let group = bed.store.group.get("data-team").await?;
    assert!(!group.backends.contains_key(&b_key));
    Ok(())
}

#[tokio::test]
async fn failed_removal_stays_in_status() -> Result<()> {
    let bed = testbed(&[("a", "type-a"), ("b", "type-b")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.resources
        .apply(
            "data-team",
            spec("data-team", &["alice"], &[("a", "type-a"), ("b", "type-b")]),
        )
        .await?;
    bed.reconciler.reconcile("data-team").await?;

    let b_key = backend_key("b", "type-b");
    bed.handle(&b_key).lock().fail_delete_team = true;

    bed.resources
        .apply("data-team", spec("data-team", &["alice"], &[("a", "type-a")]))
        .await?;
    let outcome = bed.reconciler.reconcile("data-team").await?;
    assert!(outcome.requeue_after.is_some());

    let record = bed.resources.get("data-team").await?.unwrap();
    let b_entry = record
        .status
        .backends_status
        .iter()
        .find(|e| e.name == "b")
        .expect("failed removal must stay visible");
    assert!(!b_entry.status);
    assert!(b_entry.message.contains("offboarding failed"));

    // the store still remembers b so the next pass can retry
    let group = bed.store.group.get("data-team").await?;
    assert!(group.backends.contains_key(&b_key));
    Ok(())
}

#[tokio::test]
async fn member_churn_issues_exactly_one_add_and_one_remove() -> Result<()> {
    let bed = testbed(&[("a", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.add_directory_user("bob", "bob@x.com");
    bed.add_directory_user("carol", "carol@x.com");

    bed.resources
        .apply("data-team", spec("data-team", &["alice", "bob"], &[("a", "type-a")]))
        .await?;
    bed.reconciler.reconcile("data-team").await?;

    let key = backend_key("a", "type-a");
    let bob_id = bed.store.user.get_backends("bob@x.com").await?[&key].to_owned();

    bed.resources
        .apply(
            "data-team",
            spec("data-team", &["alice", "carol"], &[("a", "type-a")]),
        )
        .await?;
    bed.clear_calls();
    bed.reconciler.reconcile("data-team").await?;

    let state = bed.handle(&key).lock();
    let adds: Vec<&String> = state.calls.iter().filter(|c| c.starts_with("add:")).collect();
    let removes: Vec<&String> = state
        .calls
        .iter()
        .filter(|c| c.starts_with("remove:"))
        .collect();
    assert_eq!(adds.len(), 1, "calls: {:?}", state.calls);
    assert_eq!(removes.len(), 1, "calls: {:?}", state.calls);
    assert!(removes[0].ends_with(&bob_id));
    // carol was created, bob was not deleted from the backend
    assert!(state.calls.iter().any(|c| c == "create_user:carol@x.com"));
    assert!(!state.calls.iter().any(|c| c.starts_with("delete_user:")));
    Ok(())
}

#[tokio::test]
async fn second_reconcile_of_unchanged_spec_is_quiet() -> Result<()> {
    let bed = testbed(&[("a", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.resources
        .apply("data-team", spec("data-team", &["alice"], &[("a", "type-a")]))
        .await?;
    bed.reconciler.reconcile("data-team").await?;
    let first_status = bed.resources.get("data-team").await?.unwrap().status;

    bed.clear_calls();
    bed.reconciler.reconcile("data-team").await?;

    let key = backend_key("a", "type-a");
    let state = bed.handle(&key).lock();
    assert!(
        state.mutating_calls().is_empty(),
        "idempotent pass must not mutate: {:?}",
        state.calls
    );
    let second_status = bed.resources.get("data-team").await?.unwrap().status;
    assert_eq!(first_status, second_status);
    Ok(())
}

#[tokio::test]
async fn create_conflict_accepts_existing_user() -> Result<()> {
    let bed = testbed(&[("a", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");
    {
        let key = backend_key("a", "type-a");
        let mut state = bed.handle(&key).lock();
        state.conflict_on_create = true;
        // exists on the backend under a differently-cased email, listed
        // only after the conflict
        state.hidden_users.push(User {
            id: "77".to_owned(),
            email: "Alice@X.COM".to_owned(),
            username: "alice".to_owned(),
            ..Default::default()
        });
    }
    bed.resources
        .apply("data-team", spec("data-team", &["alice"], &[("a", "type-a")]))
        .await?;

    let outcome = bed.reconciler.reconcile("data-team").await?;
    assert_eq!(outcome.requeue_after, None);

    let record = bed.resources.get("data-team").await?.unwrap();
    assert!(record.status.backends_status[0].status);

    let key = backend_key("a", "type-a");
    assert_eq!(bed.store.user.get_backends("alice@x.com").await?[&key], "77");
    // the existing id ended up in the team
    let state = bed.handle(&key).lock();
    assert!(state.calls.iter().any(|c| c.starts_with("add:") && c.ends_with("77")));
    Ok(())
}

#[tokio::test]
async fn one_backend_failure_never_aborts_peers() -> Result<()> {
    let bed = testbed(&[("a", "type-a"), ("b", "type-b")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.handle(&backend_key("b", "type-b")).lock().fail_create_team = true;

    bed.resources
        .apply(
            "data-team",
            spec("data-team", &["alice"], &[("a", "type-a"), ("b", "type-b")]),
        )
        .await?;
    let outcome = bed.reconciler.reconcile("data-team").await?;
    assert!(outcome.requeue_after.is_some());

    let record = bed.resources.get("data-team").await?.unwrap();
    let by_name: HashMap<&str, &crate::resources::BackendStatus> = record
        .status
        .backends_status
        .iter()
        .map(|e| (e.name.as_str(), e))
        .collect();
    assert!(by_name["a"].status);
    assert!(!by_name["b"].status);
    assert!(by_name["b"].message.contains("backend refused team creation"));
    Ok(())
}

#[tokio::test]
async fn dependant_waits_for_failed_dependency() -> Result<()> {
    let bed = testbed(&[("a", "type-a"), ("b", "type-b")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.handle(&backend_key("a", "type-a")).lock().fail_create_team = true;

    let mut group_spec = spec(
        "data-team",
        &["alice"],
        &[("a", "type-a"), ("b", "type-b")],
    );
    group_spec.dependencies = vec![Backend {
        name: "a".to_owned(),
        backend_type: "type-a".to_owned(),
    }];
    bed.resources.apply("data-team", group_spec).await?;

    // every backend failed, so the pass reports a top-level error
    assert!(bed.reconciler.reconcile("data-team").await.is_err());

    let record = bed.resources.get("data-team").await?.unwrap();
    let b_entry = record
        .status
        .backends_status
        .iter()
        .find(|e| e.name == "b")
        .unwrap();
    assert!(!b_entry.status);
    assert!(b_entry.message.contains("dependency"));
    // b was never attempted
    assert!(bed
        .handle(&backend_key("b", "type-b"))
        .lock()
        .calls
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn deleting_group_keeps_shared_team() -> Result<()> {
    // both groups collapse onto the same backend team name
    let patterns: HashMap<String, Vec<PatternPair>> = [(
        "default".to_owned(),
        vec![PatternPair {
            input: "(.*)".to_owned(),
            output: "shared-team".to_owned(),
        }],
    )]
    .into();
    let bed = testbed_with_patterns(&[("a", "type-a")], patterns);
    bed.add_directory_user("alice", "alice@x.com");
    bed.add_directory_user("bob", "bob@x.com");

    bed.resources
        .apply("g1", spec("g1", &["alice"], &[("a", "type-a")]))
        .await?;
    bed.reconciler.reconcile("g1").await?;
    bed.resources
        .apply("g2", spec("g2", &["bob"], &[("a", "type-a")]))
        .await?;
    bed.reconciler.reconcile("g2").await?;

    let key = backend_key("a", "type-a");
    let team_id = bed.store.group.get_backend_id("g1", "a", "type-a").await?.unwrap();
    assert_eq!(
        bed.store.group.get_backend_id("g2", "a", "type-a").await?,
        Some(team_id.to_owned())
    );

    bed.resources.mark_deleted("g1").await?;
    bed.clear_calls();
    bed.reconciler.reconcile("g1").await?;

    // g2 still references the team, so only g1's members were removed
    {
        let state = bed.handle(&key).lock();
        assert_eq!(state.teams.len(), 1, "shared team must survive");
        assert!(!state.calls.iter().any(|c| c.starts_with("delete_team:")));
        let alice_removed = state
            .calls
            .iter()
            .any(|c| c.starts_with(&format!("remove:{team_id}:")));
        assert!(alice_removed, "calls: {:?}", state.calls);
    }

    // g1 is fully cleaned up, g2 untouched
    assert!(bed.resources.get("g1").await?.is_none());
    assert!(!bed.store.group.exists("g1").await?);
    assert!(bed.store.group.exists("g2").await?);
    assert_eq!(
        bed.store.user_groups.get_groups("alice@x.com").await?,
        Vec::<String>::new()
    );
    Ok(())
}

#[tokio::test]
async fn deleting_sole_group_deletes_team() -> Result<()> {
    let bed = testbed(&[("a", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.resources
        .apply("g1", spec("g1", &["alice"], &[("a", "type-a")]))
        .await?;
    bed.reconciler.reconcile("g1").await?;

    bed.resources.mark_deleted("g1").await?;
    bed.reconciler.reconcile("g1").await?;

    let state = bed.handle(&backend_key("a", "type-a")).lock();
    assert!(state.teams.is_empty());
    assert!(state.calls.iter().any(|c| c.starts_with("delete_team:")));
    Ok(())
}

#[tokio::test]
async fn ldap_query_members_are_resolved() -> Result<()> {
    let bed = testbed(&[("a", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.add_directory_user("dave", "dave@x.com");
    bed.directory.queries.lock().insert(
        "(memberOf=cn=data)".to_owned(),
        vec!["dave".to_owned()],
    );

    let mut group_spec = spec("data-team", &["alice"], &[("a", "type-a")]);
    group_spec.ldap_query = Some("(memberOf=cn=data)".to_owned());
    bed.resources.apply("data-team", group_spec).await?;
    bed.reconciler.reconcile("data-team").await?;

    let group = bed.store.group.get("data-team").await?;
    assert_eq!(
        group.members,
        vec!["alice@x.com".to_owned(), "dave@x.com".to_owned()]
    );
    Ok(())
}

#[tokio::test]
async fn periodic_offboard_respects_skip_set() -> Result<()> {
    let bed = testbed(&[("fivetran", "type-a"), ("gitlab", "type-c")]);
    // directory does NOT know alice anymore

    bed.store
        .user
        .set_backend("alice@x.com", "fivetran_type-a", "1")
        .await?;
    bed.store
        .user
        .set_backend("alice@x.com", "gitlab_type-c", "9")
        .await?;
    bed.store
        .user_groups
        .add_group("alice@x.com", "data-team")
        .await?;
    bed.store.meta.set_user_list(&["alice".to_owned()]).await?;

    let job = UserOffboardingJob::new(
        bed.store.clone(),
        Arc::clone(&bed.directory) as Arc<dyn DirectoryClient>,
        Arc::clone(&bed.registry),
        Arc::clone(&bed.cache_lock),
        &["type-c".to_owned()],
    );
    job.run().await?;

    // deleted from the data-pipeline backend, untouched on the excluded one
    let fivetran = bed.handle(&backend_key("fivetran", "type-a")).lock();
    assert!(fivetran.calls.iter().any(|c| c == "delete_user:1"));
    drop(fivetran);
    let gitlab = bed.handle(&backend_key("gitlab", "type-c")).lock();
    assert!(gitlab.calls.is_empty());
    drop(gitlab);

    assert!(!bed.store.user.exists("alice@x.com").await?);
    assert!(!bed.store.user_groups.exists("alice@x.com").await?);
    assert!(bed.store.meta.get_user_list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn periodic_offboard_keeps_active_users() -> Result<()> {
    let bed = testbed(&[("fivetran", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");

    bed.store
        .user
        .set_backend("alice@x.com", "fivetran_type-a", "1")
        .await?;
    bed.store.meta.set_user_list(&["alice".to_owned()]).await?;

    let job = UserOffboardingJob::new(
        bed.store.clone(),
        Arc::clone(&bed.directory) as Arc<dyn DirectoryClient>,
        Arc::clone(&bed.registry),
        Arc::clone(&bed.cache_lock),
        &[],
    );
    job.run().await?;

    assert!(bed.store.user.exists("alice@x.com").await?);
    assert_eq!(bed.store.meta.get_user_list().await?, vec!["alice".to_owned()]);
    assert!(bed
        .handle(&backend_key("fivetran", "type-a"))
        .lock()
        .calls
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn nested_groups_expand_transitively() -> Result<()> {
    let bed = testbed(&[("a", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.add_directory_user("bob", "bob@x.com");

    let mut child = spec("child", &["bob"], &[]);
    child.members.groups = vec!["parent".to_owned()]; // cycle back, must not loop
    bed.resources.apply("child", child).await?;

    let mut parent = spec("parent", &["alice"], &[("a", "type-a")]);
    parent.members.groups = vec!["child".to_owned()];
    bed.resources.apply("parent", parent).await?;

    bed.reconciler.reconcile("parent").await?;

    let group = bed.store.group.get("parent").await?;
    assert_eq!(
        group.members,
        vec!["alice@x.com".to_owned(), "bob@x.com".to_owned()]
    );
    Ok(())
}

#[tokio::test]
async fn ldap_synced_backend_uses_usernames_and_skips_creation() -> Result<()> {
    let bed = testbed(&[("a", "type-a")]);
    bed.add_directory_user("alice", "alice@x.com");
    bed.handle(&backend_key("a", "type-a")).lock().ldap_synced = true;

    bed.resources
        .apply("data-team", spec("data-team", &["alice"], &[("a", "type-a")]))
        .await?;
    bed.reconciler.reconcile("data-team").await?;

    let key = backend_key("a", "type-a");
    let state = bed.handle(&key).lock();
    assert!(!state.calls.iter().any(|c| c.starts_with("create_user:")));
    // the directory username is the membership identifier
    assert!(state
        .calls
        .iter()
        .any(|c| c.starts_with("add:") && c.ends_with("alice")));
    drop(state);
    assert_eq!(
        bed.store.user.get_backends("alice@x.com").await?[&key],
        "alice"
    );
    Ok(())
}
