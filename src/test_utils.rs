//! Shared test utilities: scripted mocks for the external capabilities and
//! item construction helpers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::executor::{Execution, ExecutionStatus, ExecutorError, WorkflowExecutor, WorkflowRequest};
use crate::store::{RunRow, Store, StoreError};
use crate::ticket::{AdapterError, AdapterErrorKind, Board, TicketAdapter};
use crate::types::{
    Comment, CommentId, Item, ItemNodeId, ItemState, LinkedPullRequest, Reaction, RepoId, Status,
    TicketId,
};

// ─── Item helpers ─────────────────────────────────────────────────────────────

/// A minimal open item in the given status, on the default test repo.
pub fn item_in(status: Status) -> Item {
    Item {
        node_id: ItemNodeId::new("PVTI_test42"),
        board_url: "https://github.com/orgs/acme/projects/1".to_string(),
        repo: RepoId::parse("github.com/acme/widgets").unwrap(),
        ticket: TicketId(42),
        title: "Test issue".to_string(),
        status,
        labels: BTreeSet::new(),
        state: ItemState::Open,
        has_merged_changes: false,
        comment_count: 0,
    }
}

/// Returns the item with the given label names added.
pub fn with_labels(mut item: Item, labels: &[&str]) -> Item {
    for label in labels {
        item.labels.insert(label.to_string());
    }
    item
}

// ─── Mock ticket adapter ──────────────────────────────────────────────────────

type TicketKey = (RepoId, TicketId);

/// An explicit authorship override for `last_label_actor`.
#[derive(Debug, Clone)]
enum ActorOverride {
    Actor(String),
    Unknown,
}

#[derive(Default)]
struct MockAdapterState {
    boards: HashMap<String, Vec<Item>>,
    labels: HashMap<TicketKey, BTreeSet<String>>,
    bodies: HashMap<TicketKey, String>,
    comments: HashMap<TicketKey, Vec<Comment>>,
    repo_labels: HashMap<RepoId, BTreeSet<String>>,
    linked_prs: HashMap<TicketKey, Vec<LinkedPullRequest>>,
    /// Authors recorded for label adds performed through the trait.
    recorded_label_authors: HashMap<(TicketKey, String), String>,
    /// Explicit authorship overrides; these win over recorded authors.
    label_actor_overrides: HashMap<(TicketKey, String), ActorOverride>,
    status_actors: HashMap<TicketKey, Option<String>>,
    default_status_actor: Option<String>,
    /// Errors to return from upcoming `list_items` calls, oldest first.
    list_errors: Vec<AdapterErrorKind>,
    /// When set, every `set_status` call fails with this kind.
    fail_set_status: Option<AdapterErrorKind>,
    // Call logs.
    label_adds: Vec<String>,
    label_removes: Vec<String>,
    status_updates: Vec<(ItemNodeId, String)>,
    body_updates: Vec<(TicketKey, String)>,
    created_labels: Vec<(RepoId, String)>,
    closed_prs: Vec<(RepoId, u64, bool)>,
    archived: Vec<ItemNodeId>,
    reactions_set: HashMap<CommentId, Vec<Reaction>>,
    reactions_removed: HashMap<CommentId, Vec<Reaction>>,
    list_items_calls: usize,
}

/// A scripted in-memory ticket platform.
///
/// Writes performed through the trait are attributed to the configured
/// authenticated actor unless an explicit override is installed, mirroring
/// the audit behaviour the race guard depends on.
pub struct MockAdapter {
    actor: String,
    state: Mutex<MockAdapterState>,
}

impl MockAdapter {
    pub fn new(actor: impl Into<String>) -> Self {
        let actor = actor.into();
        MockAdapter {
            actor: actor.clone(),
            state: Mutex::new(MockAdapterState {
                default_status_actor: Some(actor),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockAdapterState> {
        self.state.lock().expect("mock state poisoned")
    }

    fn error(kind: AdapterErrorKind) -> AdapterError {
        match kind {
            AdapterErrorKind::Authorization => AdapterError::authorization("mock: bad credentials"),
            AdapterErrorKind::Unreachable => AdapterError::unreachable("mock: connection refused"),
            AdapterErrorKind::Transient => AdapterError::transient("mock: 502"),
            AdapterErrorKind::Schema => AdapterError::schema("mock: unexpected shape"),
            AdapterErrorKind::NotFound => AdapterError::not_found("mock: missing"),
        }
    }

    // ── Scripting ──

    pub fn seed_board(&self, board_url: &str, items: Vec<Item>) {
        for item in &items {
            self.lock()
                .labels
                .entry((item.repo.clone(), item.ticket))
                .or_insert_with(|| item.labels.clone());
        }
        self.lock().boards.insert(board_url.to_string(), items);
    }

    pub fn seed_labels(&self, repo: &RepoId, ticket: TicketId, labels: &[&str]) {
        self.lock().labels.insert(
            (repo.clone(), ticket),
            labels.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn seed_body(&self, repo: &RepoId, ticket: TicketId, body: &str) {
        self.lock()
            .bodies
            .insert((repo.clone(), ticket), body.to_string());
    }

    pub fn seed_comments(&self, repo: &RepoId, ticket: TicketId, comments: Vec<Comment>) {
        self.lock().comments.insert((repo.clone(), ticket), comments);
    }

    pub fn seed_repo_labels(&self, repo: &RepoId, labels: &[&str]) {
        self.lock()
            .repo_labels
            .insert(repo.clone(), labels.iter().map(|s| s.to_string()).collect());
    }

    pub fn seed_linked_prs(&self, repo: &RepoId, ticket: TicketId, prs: Vec<LinkedPullRequest>) {
        self.lock().linked_prs.insert((repo.clone(), ticket), prs);
    }

    pub fn set_label_actor(&self, repo: &RepoId, ticket: TicketId, label: &str, actor: &str) {
        self.lock().label_actor_overrides.insert(
            ((repo.clone(), ticket), label.to_string()),
            ActorOverride::Actor(actor.to_string()),
        );
    }

    pub fn clear_label_actor(&self, repo: &RepoId, ticket: TicketId, label: &str) {
        self.lock().label_actor_overrides.insert(
            ((repo.clone(), ticket), label.to_string()),
            ActorOverride::Unknown,
        );
    }

    pub fn set_status_actor(&self, repo: &RepoId, ticket: TicketId, actor: Option<&str>) {
        self.lock()
            .status_actors
            .insert((repo.clone(), ticket), actor.map(str::to_string));
    }

    pub fn set_default_status_actor(&self, actor: Option<&str>) {
        self.lock().default_status_actor = actor.map(str::to_string);
    }

    /// Queues an error for an upcoming `list_items` call.
    pub fn push_list_error(&self, kind: AdapterErrorKind) {
        self.lock().list_errors.push(kind);
    }

    /// Makes every `set_status` call fail with the given kind.
    pub fn fail_set_status(&self, kind: AdapterErrorKind) {
        self.lock().fail_set_status = Some(kind);
    }

    // ── Inspection ──

    pub fn ticket_labels(&self, repo: &RepoId, ticket: TicketId) -> BTreeSet<String> {
        self.lock()
            .labels
            .get(&(repo.clone(), ticket))
            .cloned()
            .unwrap_or_default()
    }

    pub fn label_adds(&self) -> Vec<String> {
        self.lock().label_adds.clone()
    }

    pub fn label_removes(&self) -> Vec<String> {
        self.lock().label_removes.clone()
    }

    pub fn status_updates(&self) -> Vec<(ItemNodeId, String)> {
        self.lock().status_updates.clone()
    }

    pub fn body_of(&self, repo: &RepoId, ticket: TicketId) -> Option<String> {
        self.lock().bodies.get(&(repo.clone(), ticket)).cloned()
    }

    pub fn created_labels(&self) -> Vec<(RepoId, String)> {
        self.lock().created_labels.clone()
    }

    pub fn closed_prs(&self) -> Vec<(RepoId, u64, bool)> {
        self.lock().closed_prs.clone()
    }

    pub fn reactions_set(&self, comment: CommentId) -> Vec<Reaction> {
        self.lock()
            .reactions_set
            .get(&comment)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reactions_removed(&self, comment: CommentId) -> Vec<Reaction> {
        self.lock()
            .reactions_removed
            .get(&comment)
            .cloned()
            .unwrap_or_default()
    }

    pub fn list_items_calls(&self) -> usize {
        self.lock().list_items_calls
    }
}

#[async_trait]
impl TicketAdapter for MockAdapter {
    async fn authenticated_actor(&self) -> Result<String, AdapterError> {
        Ok(self.actor.clone())
    }

    async fn list_items(&self, board: &Board) -> Result<Vec<Item>, AdapterError> {
        let mut state = self.lock();
        state.list_items_calls += 1;
        if !state.list_errors.is_empty() {
            let kind = state.list_errors.remove(0);
            return Err(Self::error(kind));
        }
        let items = state.boards.get(&board.url).cloned().unwrap_or_default();
        // Reflect label and status mutations made since seeding.
        let items = items
            .into_iter()
            .map(|mut item| {
                if let Some(labels) = state.labels.get(&(item.repo.clone(), item.ticket)) {
                    item.labels = labels.clone();
                }
                item
            })
            .collect();
        Ok(items)
    }

    async fn get_body(&self, repo: &RepoId, id: TicketId) -> Result<String, AdapterError> {
        Ok(self
            .lock()
            .bodies
            .get(&(repo.clone(), id))
            .cloned()
            .unwrap_or_default())
    }

    async fn update_body(
        &self,
        repo: &RepoId,
        id: TicketId,
        body: &str,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        let key = (repo.clone(), id);
        state.bodies.insert(key.clone(), body.to_string());
        state.body_updates.push((key, body.to_string()));
        Ok(())
    }

    async fn get_ticket_labels(
        &self,
        repo: &RepoId,
        id: TicketId,
    ) -> Result<BTreeSet<String>, AdapterError> {
        Ok(self.ticket_labels(repo, id))
    }

    async fn add_label(
        &self,
        repo: &RepoId,
        id: TicketId,
        label: &str,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        let key = (repo.clone(), id);
        state
            .labels
            .entry(key.clone())
            .or_default()
            .insert(label.to_string());
        state
            .recorded_label_authors
            .insert((key, label.to_string()), self.actor.clone());
        state.label_adds.push(label.to_string());
        Ok(())
    }

    async fn remove_label(
        &self,
        repo: &RepoId,
        id: TicketId,
        label: &str,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state
            .labels
            .entry((repo.clone(), id))
            .or_default()
            .remove(label);
        state.label_removes.push(label.to_string());
        Ok(())
    }

    async fn list_labels(&self, repo: &RepoId) -> Result<Vec<String>, AdapterError> {
        Ok(self
            .lock()
            .repo_labels
            .get(repo)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_label(
        &self,
        repo: &RepoId,
        name: &str,
        _description: &str,
        _color: &str,
    ) -> Result<bool, AdapterError> {
        let mut state = self.lock();
        let created = state
            .repo_labels
            .entry(repo.clone())
            .or_default()
            .insert(name.to_string());
        if created {
            state.created_labels.push((repo.clone(), name.to_string()));
        }
        Ok(created)
    }

    async fn set_status(
        &self,
        _board: &Board,
        item: &ItemNodeId,
        status: &str,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        if let Some(kind) = state.fail_set_status {
            return Err(Self::error(kind));
        }
        state.status_updates.push((item.clone(), status.to_string()));
        // Keep seeded boards coherent for multi-cycle tests.
        for items in state.boards.values_mut() {
            for seeded in items.iter_mut() {
                if seeded.node_id == *item {
                    seeded.status = Status::parse(status);
                }
            }
        }
        Ok(())
    }

    async fn archive(&self, _board: &Board, item: &ItemNodeId) -> Result<bool, AdapterError> {
        self.lock().archived.push(item.clone());
        Ok(true)
    }

    async fn list_comments_since(
        &self,
        repo: &RepoId,
        id: TicketId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, AdapterError> {
        let mut comments = self
            .lock()
            .comments
            .get(&(repo.clone(), id))
            .cloned()
            .unwrap_or_default();
        comments.retain(|c| since.is_none_or(|s| c.created_at > s));
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn add_comment(
        &self,
        repo: &RepoId,
        id: TicketId,
        body: &str,
    ) -> Result<Comment, AdapterError> {
        let comment = Comment {
            id: CommentId(rand_id(&self.lock().comments)),
            author: self.actor.clone(),
            body: body.to_string(),
            created_at: Utc::now(),
            reactions: BTreeSet::new(),
        };
        self.lock()
            .comments
            .entry((repo.clone(), id))
            .or_default()
            .push(comment.clone());
        Ok(comment)
    }

    async fn set_reaction(
        &self,
        _repo: &RepoId,
        comment: CommentId,
        kind: Reaction,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state.reactions_set.entry(comment).or_default().push(kind);
        for comments in state.comments.values_mut() {
            for c in comments.iter_mut() {
                if c.id == comment {
                    c.reactions.insert(kind);
                }
            }
        }
        Ok(())
    }

    async fn remove_reaction(
        &self,
        _repo: &RepoId,
        comment: CommentId,
        kind: Reaction,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state
            .reactions_removed
            .entry(comment)
            .or_default()
            .push(kind);
        for comments in state.comments.values_mut() {
            for c in comments.iter_mut() {
                if c.id == comment {
                    c.reactions.remove(&kind);
                }
            }
        }
        Ok(())
    }

    async fn last_status_actor(
        &self,
        repo: &RepoId,
        id: TicketId,
    ) -> Result<Option<String>, AdapterError> {
        let state = self.lock();
        Ok(state
            .status_actors
            .get(&(repo.clone(), id))
            .cloned()
            .unwrap_or_else(|| state.default_status_actor.clone()))
    }

    async fn last_label_actor(
        &self,
        repo: &RepoId,
        id: TicketId,
        label: &str,
    ) -> Result<Option<String>, AdapterError> {
        let state = self.lock();
        let key = ((repo.clone(), id), label.to_string());
        if let Some(over) = state.label_actor_overrides.get(&key) {
            return Ok(match over {
                ActorOverride::Actor(a) => Some(a.clone()),
                ActorOverride::Unknown => None,
            });
        }
        Ok(state.recorded_label_authors.get(&key).cloned())
    }

    async fn list_linked_prs(
        &self,
        repo: &RepoId,
        id: TicketId,
    ) -> Result<Vec<LinkedPullRequest>, AdapterError> {
        Ok(self
            .lock()
            .linked_prs
            .get(&(repo.clone(), id))
            .cloned()
            .unwrap_or_default())
    }

    async fn close_pull_request(
        &self,
        repo: &RepoId,
        number: u64,
        delete_branch: bool,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state.closed_prs.push((repo.clone(), number, delete_branch));
        if let Some(prs) = state
            .linked_prs
            .values_mut()
            .find(|prs| prs.iter().any(|pr| pr.number == number))
        {
            for pr in prs.iter_mut() {
                if pr.number == number {
                    pr.state = "CLOSED".to_string();
                }
            }
        }
        Ok(())
    }
}

/// A deterministic "fresh" comment ID for `add_comment`.
fn rand_id(comments: &HashMap<TicketKey, Vec<Comment>>) -> u64 {
    90_000 + comments.values().map(|v| v.len() as u64).sum::<u64>()
}

// ─── Mock store ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockStoreState {
    cursors: HashMap<TicketKey, DateTime<Utc>>,
    runs: Vec<RunRow>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MockStore {
    state: Mutex<MockStoreState>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<RunRow> {
        self.state.lock().expect("store poisoned").runs.clone()
    }

    pub fn cursor(&self, repo: &RepoId, ticket: TicketId) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .expect("store poisoned")
            .cursors
            .get(&(repo.clone(), ticket))
            .copied()
    }

    pub fn set_cursor(&self, repo: &RepoId, ticket: TicketId, at: DateTime<Utc>) {
        self.state
            .lock()
            .expect("store poisoned")
            .cursors
            .insert((repo.clone(), ticket), at);
    }
}

impl Store for MockStore {
    fn last_comment_at(
        &self,
        repo: &RepoId,
        ticket: TicketId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.cursor(repo, ticket))
    }

    fn advance_comment_cursor(
        &self,
        repo: &RepoId,
        ticket: TicketId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store poisoned");
        let entry = state.cursors.entry((repo.clone(), ticket)).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(())
    }

    fn record_run(&self, run: &RunRow) -> Result<(), StoreError> {
        self.state
            .lock()
            .expect("store poisoned")
            .runs
            .push(run.clone());
        Ok(())
    }

    fn recent_runs(
        &self,
        repo: &RepoId,
        ticket: TicketId,
        limit: usize,
    ) -> Result<Vec<RunRow>, StoreError> {
        let mut runs: Vec<_> = self
            .state
            .lock()
            .expect("store poisoned")
            .runs
            .iter()
            .filter(|r| &r.repo == repo && r.ticket == ticket)
            .cloned()
            .collect();
        runs.reverse();
        runs.truncate(limit);
        Ok(runs)
    }
}

// ─── Mock executor ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutorMode {
    Succeed,
    Fail,
    /// Block until released or cancelled.
    Block,
}

/// Scripted workflow executor.
pub struct MockExecutor {
    mode: ExecutorMode,
    release: tokio::sync::watch::Sender<bool>,
    requests: Mutex<Vec<WorkflowRequest>>,
}

impl MockExecutor {
    fn new(mode: ExecutorMode) -> Self {
        let (release, _) = tokio::sync::watch::channel(false);
        MockExecutor {
            mode,
            release,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every execution succeeds immediately.
    pub fn succeeding() -> Self {
        Self::new(ExecutorMode::Succeed)
    }

    /// Every execution fails immediately.
    pub fn failing() -> Self {
        Self::new(ExecutorMode::Fail)
    }

    /// Executions block until [`MockExecutor::release_all`] or cancellation.
    pub fn blocking() -> Self {
        Self::new(ExecutorMode::Block)
    }

    /// Unblocks all blocking executions with a success outcome.
    pub fn release_all(&self) {
        self.release.send_replace(true);
    }

    /// Requests observed so far, in dispatch order.
    pub fn requests(&self) -> Vec<WorkflowRequest> {
        self.requests.lock().expect("requests poisoned").clone()
    }
}

#[async_trait]
impl WorkflowExecutor for MockExecutor {
    async fn execute(
        &self,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> Result<Execution, ExecutorError> {
        self.requests
            .lock()
            .expect("requests poisoned")
            .push(request);

        let status = match self.mode {
            ExecutorMode::Succeed => ExecutionStatus::Success,
            ExecutorMode::Fail => ExecutionStatus::Failure,
            ExecutorMode::Block => {
                let mut released = self.release.subscribe();
                loop {
                    if *released.borrow() {
                        break ExecutionStatus::Success;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break ExecutionStatus::Cancelled,
                        changed = released.changed() => {
                            if changed.is_err() {
                                break ExecutionStatus::Cancelled;
                            }
                        }
                    }
                }
            }
        };

        Ok(Execution {
            status,
            session_ref: Some("mock-session".to_string()),
        })
    }
}
