//! GitHub Projects (v2) implementation of the ticket capability.
//!
//! Board reads go through GraphQL (project items carry their status column,
//! labels, linked-PR merge state and comment counts in one query); issue
//! mutations use the REST API. All transport failures are mapped into the
//! typed error taxonomy and transient failures are retried here so the core
//! never sees a single flaky request.
//!
//! One `Octocrab` client is kept per hostname so a single daemon can watch
//! boards that reference both github.com and GitHub Enterprise repositories.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use octocrab::models::reactions::ReactionContent;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::error::{AdapterError, AdapterErrorKind};
use super::retry::{RetryConfig, with_retry};
use super::{Board, TicketAdapter};
use crate::types::{
    Comment, CommentId, Item, ItemNodeId, ItemState, LinkedPullRequest, Reaction, RepoId, Status,
    TicketId,
};

/// Hard cap on board pagination, mirroring the platform's own item limits.
const MAX_BOARD_PAGES: usize = 100;

/// Cached project metadata needed for status mutations.
#[derive(Debug, Clone)]
struct ProjectMetadata {
    /// The project's node ID.
    project_id: String,
    /// The Status single-select field's node ID.
    status_field_id: String,
    /// Status option name to option ID.
    status_options: HashMap<String, String>,
}

/// GitHub implementation of [`TicketAdapter`].
pub struct GitHubAdapter {
    token: String,
    retry: RetryConfig,
    /// One authenticated client per hostname.
    clients: Mutex<HashMap<String, Octocrab>>,
    /// Project metadata per board URL, resolved on first use.
    projects: Mutex<HashMap<String, ProjectMetadata>>,
}

impl GitHubAdapter {
    pub fn new(token: impl Into<String>) -> Self {
        GitHubAdapter {
            token: token.into(),
            retry: RetryConfig::DEFAULT,
            clients: Mutex::new(HashMap::new()),
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the client for a hostname, building it on first use.
    ///
    /// Enterprise hosts use the `/api/v3` REST prefix; octocrab routes
    /// GraphQL relative to the same base.
    fn client_for(&self, host: &str) -> Result<Octocrab, AdapterError> {
        let mut clients = self.clients.lock().expect("client map poisoned");
        if let Some(client) = clients.get(host) {
            return Ok(client.clone());
        }

        let mut builder = Octocrab::builder().personal_token(self.token.clone());
        if host != "github.com" {
            builder = builder
                .base_uri(format!("https://{host}/api/v3"))
                .map_err(|e| AdapterError::schema(format!("invalid enterprise host: {e}")))?;
        }
        let client = builder
            .build()
            .map_err(|e| AdapterError::authorization(format!("failed to build client: {e}")))?;

        clients.insert(host.to_string(), client.clone());
        Ok(client)
    }

    /// Runs a GraphQL query with retry and returns the `data` payload.
    async fn graphql(&self, host: &str, query: &str, variables: Value) -> Result<Value, AdapterError> {
        let client = self.client_for(host)?;
        let payload = json!({ "query": query, "variables": variables });

        let response: Value = with_retry(self.retry, || async {
            client
                .graphql(&payload)
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;

        if let Some(errors) = response.get("errors").and_then(Value::as_array)
            && !errors.is_empty()
        {
            return Err(AdapterError::schema(format!(
                "GraphQL errors: {}",
                Value::Array(errors.clone())
            )));
        }

        response
            .get("data")
            .cloned()
            .ok_or_else(|| AdapterError::schema("GraphQL response missing data"))
    }

    /// Resolves and caches the project ID and Status field metadata.
    async fn project_metadata(&self, board: &Board) -> Result<ProjectMetadata, AdapterError> {
        if let Some(meta) = self
            .projects
            .lock()
            .expect("project map poisoned")
            .get(&board.url)
        {
            return Ok(meta.clone());
        }

        let query = format!(
            r#"
            query($login: String!, $projectNumber: Int!) {{
              {root}(login: $login) {{
                projectV2(number: $projectNumber) {{
                  id
                  field(name: "Status") {{
                    ... on ProjectV2SingleSelectField {{
                      id
                      options {{ id name }}
                    }}
                  }}
                }}
              }}
            }}
            "#,
            root = board.owner.graphql_field()
        );

        let data = self
            .graphql(
                &board.host,
                &query,
                json!({ "login": board.login, "projectNumber": board.number }),
            )
            .await?;

        let project = data
            .pointer(&format!("/{}/projectV2", board.owner.graphql_field()))
            .filter(|v| !v.is_null())
            .ok_or_else(|| AdapterError::not_found(format!("project not found: {board}")))?;

        let project_id = str_field(project, "/id")?;
        let status_field_id = str_field(project, "/field/id")?;
        let mut status_options = HashMap::new();
        for option in project
            .pointer("/field/options")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let (Some(id), Some(name)) = (
                option.get("id").and_then(Value::as_str),
                option.get("name").and_then(Value::as_str),
            ) {
                status_options.insert(name.to_string(), id.to_string());
            }
        }

        let meta = ProjectMetadata {
            project_id,
            status_field_id,
            status_options,
        };
        self.projects
            .lock()
            .expect("project map poisoned")
            .insert(board.url.clone(), meta.clone());
        Ok(meta)
    }

    /// Parses one project item node. Returns `None` for non-issue items
    /// (draft items, pull requests placed on the board).
    fn parse_item_node(node: &Value, board: &Board) -> Option<Item> {
        let node_id = node.get("id").and_then(Value::as_str)?;
        let content = node.get("content")?;
        let ticket = content.get("number").and_then(Value::as_u64)?;
        let title = content.get("title").and_then(Value::as_str)?;
        let name_with_owner = content
            .pointer("/repository/nameWithOwner")
            .and_then(Value::as_str)?;
        let repo = RepoId::parse(&format!("{}/{}", board.host, name_with_owner)).ok()?;

        let labels = content
            .pointer("/labels/nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|l| l.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();

        let state = content
            .get("state")
            .and_then(Value::as_str)
            .map(ItemState::parse)
            .unwrap_or(ItemState::Open);

        let has_merged_changes = content
            .pointer("/closedByPullRequestsReferences/nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .any(|pr| pr.get("merged").and_then(Value::as_bool).unwrap_or(false))
            })
            .unwrap_or(false);

        let comment_count = content
            .pointer("/comments/totalCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        // The Status single-select value, if the field is set at all.
        let mut status = Status::Unknown;
        for field_value in node
            .pointer("/fieldValues/nodes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if field_value.pointer("/field/name").and_then(Value::as_str) == Some("Status")
                && let Some(name) = field_value.get("name").and_then(Value::as_str)
            {
                status = Status::parse(name);
                break;
            }
        }

        Some(Item {
            node_id: ItemNodeId::new(node_id),
            board_url: board.url.clone(),
            repo,
            ticket: TicketId(ticket),
            title: title.to_string(),
            status,
            labels,
            state,
            has_merged_changes,
            comment_count,
        })
    }

    fn reaction_content(kind: Reaction) -> ReactionContent {
        match kind {
            Reaction::Eyes => ReactionContent::Eyes,
            Reaction::PlusOne => ReactionContent::PlusOne,
        }
    }
}

/// Extracts a required string field from a GraphQL value by JSON pointer.
fn str_field(value: &Value, pointer: &str) -> Result<String, AdapterError> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AdapterError::schema(format!("missing field {pointer} in response")))
}

#[async_trait]
impl TicketAdapter for GitHubAdapter {
    async fn authenticated_actor(&self) -> Result<String, AdapterError> {
        // The daemon identity is host-independent in practice; resolve it
        // against github.com unless only enterprise boards are configured.
        let client = self.client_for("github.com")?;
        let user = with_retry(self.retry, || async {
            client
                .current()
                .user()
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;
        Ok(user.login)
    }

    async fn list_items(&self, board: &Board) -> Result<Vec<Item>, AdapterError> {
        let query = format!(
            r#"
            query($login: String!, $projectNumber: Int!, $cursor: String) {{
              {root}(login: $login) {{
                projectV2(number: $projectNumber) {{
                  items(first: 100, after: $cursor) {{
                    pageInfo {{ hasNextPage endCursor }}
                    nodes {{
                      id
                      fieldValues(first: 20) {{
                        nodes {{
                          ... on ProjectV2ItemFieldSingleSelectValue {{
                            name
                            field {{ ... on ProjectV2SingleSelectField {{ name }} }}
                          }}
                        }}
                      }}
                      content {{
                        ... on Issue {{
                          number
                          title
                          state
                          repository {{ nameWithOwner }}
                          labels(first: 20) {{ nodes {{ name }} }}
                          closedByPullRequestsReferences(first: 10) {{ nodes {{ merged }} }}
                          comments {{ totalCount }}
                        }}
                      }}
                    }}
                  }}
                }}
              }}
            }}
            "#,
            root = board.owner.graphql_field()
        );

        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 0..MAX_BOARD_PAGES {
            let data = self
                .graphql(
                    &board.host,
                    &query,
                    json!({
                        "login": board.login,
                        "projectNumber": board.number,
                        "cursor": cursor,
                    }),
                )
                .await?;

            let items_data = data
                .pointer(&format!(
                    "/{}/projectV2/items",
                    board.owner.graphql_field()
                ))
                .ok_or_else(|| AdapterError::schema("unexpected board response structure"))?;

            for node in items_data
                .get("nodes")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(item) = Self::parse_item_node(node, board) {
                    items.push(item);
                } else {
                    debug!(board = %board, "Skipping non-issue board item");
                }
            }

            let has_next = items_data
                .pointer("/pageInfo/hasNextPage")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !has_next {
                return Ok(items);
            }

            let next_cursor = items_data
                .pointer("/pageInfo/endCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if next_cursor == cursor || next_cursor.is_none() {
                warn!(board = %board, page, "Pagination cursor not advancing, stopping");
                return Ok(items);
            }
            cursor = next_cursor;
        }

        warn!(board = %board, "Reached board pagination limit");
        Ok(items)
    }

    async fn get_body(&self, repo: &RepoId, id: TicketId) -> Result<String, AdapterError> {
        let client = self.client_for(&repo.host)?;
        let issue = with_retry(self.retry, || async {
            client
                .issues(&repo.owner, &repo.repo)
                .get(id.0)
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;
        Ok(issue.body.unwrap_or_default())
    }

    async fn update_body(
        &self,
        repo: &RepoId,
        id: TicketId,
        body: &str,
    ) -> Result<(), AdapterError> {
        let client = self.client_for(&repo.host)?;
        with_retry(self.retry, || async {
            client
                .issues(&repo.owner, &repo.repo)
                .update(id.0)
                .body(body)
                .send()
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;
        Ok(())
    }

    async fn get_ticket_labels(
        &self,
        repo: &RepoId,
        id: TicketId,
    ) -> Result<BTreeSet<String>, AdapterError> {
        let client = self.client_for(&repo.host)?;
        let issue = with_retry(self.retry, || async {
            client
                .issues(&repo.owner, &repo.repo)
                .get(id.0)
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;
        Ok(issue.labels.into_iter().map(|l| l.name).collect())
    }

    async fn add_label(
        &self,
        repo: &RepoId,
        id: TicketId,
        label: &str,
    ) -> Result<(), AdapterError> {
        let client = self.client_for(&repo.host)?;
        with_retry(self.retry, || async {
            client
                .issues(&repo.owner, &repo.repo)
                .add_labels(id.0, &[label.to_string()])
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;
        Ok(())
    }

    async fn remove_label(
        &self,
        repo: &RepoId,
        id: TicketId,
        label: &str,
    ) -> Result<(), AdapterError> {
        let client = self.client_for(&repo.host)?;
        let result = with_retry(self.retry, || async {
            client
                .issues(&repo.owner, &repo.repo)
                .remove_label(id.0, label)
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            // Removing an absent label must be a no-op.
            Err(e) if e.kind == AdapterErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_labels(&self, repo: &RepoId) -> Result<Vec<String>, AdapterError> {
        let client = self.client_for(&repo.host)?;
        let page = with_retry(self.retry, || async {
            client
                .issues(&repo.owner, &repo.repo)
                .list_labels_for_repo()
                .per_page(100)
                .send()
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;

        let labels = client
            .all_pages(page)
            .await
            .map_err(AdapterError::from_octocrab)?;

        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    async fn create_label(
        &self,
        repo: &RepoId,
        name: &str,
        description: &str,
        color: &str,
    ) -> Result<bool, AdapterError> {
        let client = self.client_for(&repo.host)?;
        let result = with_retry(self.retry, || async {
            client
                .issues(&repo.owner, &repo.repo)
                .create_label(name, color, description)
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            // 422 means the label already exists.
            Err(e) if e.status_code == Some(422) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn set_status(
        &self,
        board: &Board,
        item: &ItemNodeId,
        status: &str,
    ) -> Result<(), AdapterError> {
        let meta = self.project_metadata(board).await?;
        let option_id = meta.status_options.get(status).ok_or_else(|| {
            AdapterError::schema(format!("board {board} has no status column {status:?}"))
        })?;

        let mutation = r#"
            mutation($projectId: ID!, $itemId: ID!, $fieldId: ID!, $optionId: String!) {
              updateProjectV2ItemFieldValue(input: {
                projectId: $projectId,
                itemId: $itemId,
                fieldId: $fieldId,
                value: { singleSelectOptionId: $optionId }
              }) {
                projectV2Item { id }
              }
            }
        "#;

        self.graphql(
            &board.host,
            mutation,
            json!({
                "projectId": meta.project_id,
                "itemId": item.as_str(),
                "fieldId": meta.status_field_id,
                "optionId": option_id,
            }),
        )
        .await?;
        Ok(())
    }

    async fn archive(&self, board: &Board, item: &ItemNodeId) -> Result<bool, AdapterError> {
        let meta = self.project_metadata(board).await?;
        let mutation = r#"
            mutation($projectId: ID!, $itemId: ID!) {
              archiveProjectV2Item(input: { projectId: $projectId, itemId: $itemId }) {
                item { isArchived }
              }
            }
        "#;

        let data = self
            .graphql(
                &board.host,
                mutation,
                json!({ "projectId": meta.project_id, "itemId": item.as_str() }),
            )
            .await?;

        Ok(data
            .pointer("/archiveProjectV2Item/item/isArchived")
            .and_then(Value::as_bool)
            .unwrap_or(true))
    }

    async fn list_comments_since(
        &self,
        repo: &RepoId,
        id: TicketId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, AdapterError> {
        let client = self.client_for(&repo.host)?;

        // REST `since` is inclusive; fetch from the cursor and drop equal
        // timestamps afterwards so callers see strictly-newer comments.
        let page = with_retry(self.retry, || async {
            let issue_handler = client.issues(&repo.owner, &repo.repo);
            let mut req = issue_handler.list_comments(id.0).per_page(100);
            if let Some(since) = since {
                req = req.since(since);
            }
            req.send().await.map_err(AdapterError::from_octocrab)
        })
        .await?;

        let raw = client
            .all_pages(page)
            .await
            .map_err(AdapterError::from_octocrab)?;

        let mut comments: Vec<Comment> = raw
            .into_iter()
            .filter(|c| since.is_none_or(|s| c.created_at > s))
            .map(|c| {
                let reactions = BTreeSet::new();
                Comment {
                    id: CommentId(c.id.0),
                    author: c.user.login,
                    body: c.body.unwrap_or_default(),
                    created_at: c.created_at,
                    reactions,
                }
            })
            .collect();

        // Reactions are not embedded in the comment listing; fetch the
        // markers separately for each candidate comment.
        for comment in &mut comments {
            let route = format!(
                "/repos/{}/{}/issues/comments/{}/reactions",
                repo.owner, repo.repo, comment.id
            );
            let reactions: Vec<Value> = with_retry(self.retry, || async {
                client
                    .get(&route, None::<&()>)
                    .await
                    .map_err(AdapterError::from_octocrab)
            })
            .await?;

            comment.reactions = reactions
                .iter()
                .filter_map(|r| r.get("content").and_then(Value::as_str))
                .filter_map(Reaction::parse)
                .collect();
        }

        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn add_comment(
        &self,
        repo: &RepoId,
        id: TicketId,
        body: &str,
    ) -> Result<Comment, AdapterError> {
        let client = self.client_for(&repo.host)?;
        let comment = with_retry(self.retry, || async {
            client
                .issues(&repo.owner, &repo.repo)
                .create_comment(id.0, body)
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;

        Ok(Comment {
            id: CommentId(comment.id.0),
            author: comment.user.login,
            body: comment.body.unwrap_or_default(),
            created_at: comment.created_at,
            reactions: BTreeSet::new(),
        })
    }

    async fn set_reaction(
        &self,
        repo: &RepoId,
        comment: CommentId,
        kind: Reaction,
    ) -> Result<(), AdapterError> {
        let client = self.client_for(&repo.host)?;
        let route = format!(
            "/repos/{}/{}/issues/comments/{}/reactions",
            repo.owner, repo.repo, comment
        );
        let content = Self::reaction_content(kind);
        with_retry(self.retry, || async {
            client
                .post::<_, Value>(&route, Some(&json!({ "content": content })))
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        repo: &RepoId,
        comment: CommentId,
        kind: Reaction,
    ) -> Result<(), AdapterError> {
        let client = self.client_for(&repo.host)?;
        let list_route = format!(
            "/repos/{}/{}/issues/comments/{}/reactions",
            repo.owner, repo.repo, comment
        );

        let me = self.authenticated_actor().await?;
        let reactions: Vec<Value> = with_retry(self.retry, || async {
            client
                .get(&list_route, None::<&()>)
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;

        let wanted = serde_json::to_value(Self::reaction_content(kind))
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        for reaction in reactions {
            let is_mine = reaction.pointer("/user/login").and_then(Value::as_str) == Some(&me);
            let matches = reaction.get("content").and_then(Value::as_str) == Some(&wanted);
            if is_mine
                && matches
                && let Some(reaction_id) = reaction.get("id").and_then(Value::as_u64)
            {
                let delete_route = format!("{list_route}/{reaction_id}");
                with_retry(self.retry, || async {
                    client
                        ._delete(&delete_route, None::<&()>)
                        .await
                        .map_err(AdapterError::from_octocrab)
                })
                .await
                .ok();
            }
        }
        Ok(())
    }

    async fn last_status_actor(
        &self,
        repo: &RepoId,
        id: TicketId,
    ) -> Result<Option<String>, AdapterError> {
        let query = r#"
            query($owner: String!, $repo: String!, $issueNumber: Int!) {
              repository(owner: $owner, name: $repo) {
                issue(number: $issueNumber) {
                  timelineItems(last: 1, itemTypes: [PROJECT_V2_ITEM_STATUS_CHANGED_EVENT]) {
                    nodes {
                      ... on ProjectV2ItemStatusChangedEvent {
                        actor { login }
                      }
                    }
                  }
                }
              }
            }
        "#;

        let data = self
            .graphql(
                &repo.host,
                query,
                json!({ "owner": repo.owner, "repo": repo.repo, "issueNumber": id.0 }),
            )
            .await?;

        Ok(data
            .pointer("/repository/issue/timelineItems/nodes")
            .and_then(Value::as_array)
            .and_then(|nodes| nodes.last())
            .and_then(|node| node.pointer("/actor/login"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn last_label_actor(
        &self,
        repo: &RepoId,
        id: TicketId,
        label: &str,
    ) -> Result<Option<String>, AdapterError> {
        let query = r#"
            query($owner: String!, $repo: String!, $issueNumber: Int!) {
              repository(owner: $owner, name: $repo) {
                issue(number: $issueNumber) {
                  timelineItems(last: 50, itemTypes: [LABELED_EVENT]) {
                    nodes {
                      ... on LabeledEvent {
                        actor { login }
                        label { name }
                      }
                    }
                  }
                }
              }
            }
        "#;

        let data = self
            .graphql(
                &repo.host,
                query,
                json!({ "owner": repo.owner, "repo": repo.repo, "issueNumber": id.0 }),
            )
            .await?;

        Ok(data
            .pointer("/repository/issue/timelineItems/nodes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|node| node.pointer("/label/name").and_then(Value::as_str) == Some(label))
            .filter_map(|node| node.pointer("/actor/login").and_then(Value::as_str))
            .next_back()
            .map(str::to_string))
    }

    async fn list_linked_prs(
        &self,
        repo: &RepoId,
        id: TicketId,
    ) -> Result<Vec<LinkedPullRequest>, AdapterError> {
        let query = r#"
            query($owner: String!, $repo: String!, $issueNumber: Int!) {
              repository(owner: $owner, name: $repo) {
                issue(number: $issueNumber) {
                  closedByPullRequestsReferences(first: 10) {
                    nodes { number url state merged headRefName }
                  }
                }
              }
            }
        "#;

        let data = self
            .graphql(
                &repo.host,
                query,
                json!({ "owner": repo.owner, "repo": repo.repo, "issueNumber": id.0 }),
            )
            .await?;

        let nodes = data
            .pointer("/repository/issue/closedByPullRequestsReferences/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(nodes
            .iter()
            .filter(|n| !n.is_null())
            .filter_map(|pr| {
                Some(LinkedPullRequest {
                    number: pr.get("number").and_then(Value::as_u64)?,
                    url: pr.get("url").and_then(Value::as_str)?.to_string(),
                    state: pr
                        .get("state")
                        .and_then(Value::as_str)
                        .unwrap_or("OPEN")
                        .to_string(),
                    merged: pr.get("merged").and_then(Value::as_bool).unwrap_or(false),
                    head_ref: pr
                        .get("headRefName")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            })
            .collect())
    }

    async fn close_pull_request(
        &self,
        repo: &RepoId,
        number: u64,
        delete_branch: bool,
    ) -> Result<(), AdapterError> {
        let client = self.client_for(&repo.host)?;

        let pr = with_retry(self.retry, || async {
            client
                .pulls(&repo.owner, &repo.repo)
                .get(number)
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;

        with_retry(self.retry, || async {
            client
                .pulls(&repo.owner, &repo.repo)
                .update(number)
                .state(octocrab::params::pulls::State::Closed)
                .send()
                .await
                .map_err(AdapterError::from_octocrab)
        })
        .await?;

        if delete_branch {
            let branch = pr.head.ref_field;
            let route = format!(
                "/repos/{}/{}/git/refs/heads/{}",
                repo.owner, repo.repo, branch
            );
            let result = with_retry(self.retry, || async {
                client
                    ._delete(&route, None::<&()>)
                    .await
                    .map_err(AdapterError::from_octocrab)
            })
            .await;

            // The branch may already be gone; only surface real failures.
            if let Err(e) = result
                && e.kind != AdapterErrorKind::NotFound
            {
                return Err(e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> Board {
        Board::parse("https://github.com/orgs/acme/projects/1").unwrap()
    }

    fn issue_node(status: Option<&str>) -> Value {
        let mut field_values = vec![json!({ "name": "ignored", "field": { "name": "Priority" } })];
        if let Some(status) = status {
            field_values.push(json!({ "name": status, "field": { "name": "Status" } }));
        }
        json!({
            "id": "PVTI_abc123",
            "fieldValues": { "nodes": field_values },
            "content": {
                "number": 42,
                "title": "Fix the flux capacitor",
                "state": "OPEN",
                "repository": { "nameWithOwner": "acme/widgets" },
                "labels": { "nodes": [ { "name": "bug" }, { "name": "researching" } ] },
                "closedByPullRequestsReferences": { "nodes": [ { "merged": true } ] },
                "comments": { "totalCount": 3 }
            }
        })
    }

    #[test]
    fn parse_item_node_extracts_fields() {
        let item = GitHubAdapter::parse_item_node(&issue_node(Some("Research")), &board()).unwrap();
        assert_eq!(item.node_id.as_str(), "PVTI_abc123");
        assert_eq!(item.ticket, TicketId(42));
        assert_eq!(item.repo, RepoId::parse("github.com/acme/widgets").unwrap());
        assert_eq!(item.status, Status::Research);
        assert_eq!(item.state, ItemState::Open);
        assert!(item.has_merged_changes);
        assert_eq!(item.comment_count, 3);
        assert!(item.labels.contains("researching"));
        assert!(item.labels.contains("bug"));
    }

    #[test]
    fn parse_item_node_without_status_field_is_unknown() {
        let item = GitHubAdapter::parse_item_node(&issue_node(None), &board()).unwrap();
        assert_eq!(item.status, Status::Unknown);
    }

    #[test]
    fn parse_item_node_skips_non_issue_content() {
        let node = json!({ "id": "PVTI_x", "content": {} });
        assert!(GitHubAdapter::parse_item_node(&node, &board()).is_none());

        let node = json!({ "id": "PVTI_x", "content": null });
        assert!(GitHubAdapter::parse_item_node(&node, &board()).is_none());
    }

    #[test]
    fn parse_item_node_custom_status_passes_through() {
        let item =
            GitHubAdapter::parse_item_node(&issue_node(Some("Future Ideas")), &board()).unwrap();
        assert_eq!(item.status, Status::Other("Future Ideas".to_string()));
    }
}
