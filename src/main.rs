//! contextd glue binary.
//!
//! Reads newline-delimited JSON requests (`{"tool": "...", "arguments": {...}}`)
//! from stdin and writes newline-delimited JSON responses to stdout. Does no
//! validation or business logic of its own — it only deserializes, calls
//! into [`contextd::Engine`], and serializes the result. Real production
//! JSON-RPC framing, retries, and backpressure are out of scope; this exists
//! to exercise the library end-to-end, not to be a protocol implementation.

use contextd::checkpoint::{CopyDepth, MergeStrategy};
use contextd::model::RelationshipType;
use contextd::repository::{ItemPatch, KeySelector, QueryOptions, SaveInput, SearchIn, Sort};
use contextd::session::{NewSession, SessionUpdate};
use contextd::watcher::WatcherFilter;
use contextd::Engine;
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::time::Duration;

fn main() -> std::process::ExitCode {
    init_tracing();

    let db_path = contextd::config::resolve_db_path(None);
    let actor = contextd::config::default_actor(None);

    let engine = match db_path {
        Some(path) => Engine::open(&path, actor),
        None => Engine::open_memory(actor),
    };

    let engine = match engine {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{}", e.to_structured_json());
            return std::process::ExitCode::from(e.exit_code());
        }
    };

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => dispatch(&engine, &request),
            Err(e) => json!({ "error": { "code": "INVALID_ARGUMENT", "message": e.to_string() } }),
        };

        if writeln!(out, "{response}").is_err() {
            break;
        }
    }

    std::process::ExitCode::SUCCESS
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("contextd=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn dispatch(engine: &Engine, request: &Value) -> Value {
    let Some(tool) = request.get("tool").and_then(Value::as_str) else {
        return json!({ "error": { "code": "INVALID_ARGUMENT", "message": "missing 'tool'" } });
    };
    let empty = json!({});
    let args = request.get("arguments").unwrap_or(&empty);

    let result = handle(engine, tool, args);
    if result.is_ok() {
        // Best-effort cross-cutting audit record (spec §9): a failure here
        // is logged, never surfaced as the primary call's error.
        if let Some(session_id) = str_opt(args, "session_id") {
            if let Err(e) = engine.journal().record_tool_event(&session_id, tool, None) {
                tracing::warn!(error = %e, tool, "failed to record tool event");
            }
        }
    }
    match result {
        Ok(value) => json!({ "result": value }),
        Err(e) => e.to_structured_json(),
    }
}

fn handle(engine: &Engine, tool: &str, args: &Value) -> contextd::Result<Value> {
    match tool {
        "session_create" => {
            let session = engine.sessions().create(NewSession {
                name: str_opt(args, "name"),
                description: str_opt(args, "description"),
                parent_id: str_opt(args, "parent_id"),
                branch: str_opt(args, "branch"),
                working_dir: str_opt(args, "working_dir"),
                default_channel: str_opt(args, "default_channel"),
            })?;
            Ok(serde_json::to_value(session)?)
        }
        "session_get" => {
            let id = str_req(args, "id")?;
            Ok(serde_json::to_value(engine.sessions().get(&id)?)?)
        }
        "session_list" => {
            let limit = u32_opt(args, "limit");
            Ok(serde_json::to_value(engine.sessions().list(limit)?)?)
        }
        "session_update" => {
            let id = str_req(args, "id")?;
            let session = engine.sessions().update(&id, SessionUpdate {
                name: str_opt(args, "name"),
                description: str_opt(args, "description"),
                default_channel: str_opt(args, "default_channel"),
            })?;
            Ok(serde_json::to_value(session)?)
        }

        "save" => {
            let session_id = str_req(args, "session_id")?;
            let default_channel = str_opt(args, "default_channel").unwrap_or_else(|| "general".to_string());
            let item = engine.items().save(&session_id, &default_channel, SaveInput {
                key: str_req(args, "key")?,
                value: str_req(args, "value")?,
                category: str_opt(args, "category"),
                priority: str_opt(args, "priority"),
                channel: str_opt(args, "channel"),
                metadata: args.get("metadata").cloned(),
                is_private: args.get("is_private").and_then(Value::as_bool),
            })?;
            Ok(serde_json::to_value(item)?)
        }
        "get" => {
            let session_id = str_req(args, "session_id")?;
            let key = str_req(args, "key")?;
            Ok(serde_json::to_value(engine.items().get(&session_id, &key)?)?)
        }
        "delete" => {
            let session_id = str_req(args, "session_id")?;
            let key = str_req(args, "key")?;
            engine.items().delete(&session_id, &key)?;
            Ok(json!({ "deleted": key }))
        }
        "batch_save" => {
            let session_id = str_req(args, "session_id")?;
            let default_channel = str_opt(args, "default_channel").unwrap_or_else(|| "general".to_string());
            let items = args
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|item| SaveInput {
                    key: str_req(&item, "key").unwrap_or_default(),
                    value: str_req(&item, "value").unwrap_or_default(),
                    category: str_opt(&item, "category"),
                    priority: str_opt(&item, "priority"),
                    channel: str_opt(&item, "channel"),
                    metadata: item.get("metadata").cloned(),
                    is_private: item.get("is_private").and_then(Value::as_bool),
                })
                .collect();
            Ok(serde_json::to_value(engine.items().batch_save(&session_id, &default_channel, items)?)?)
        }
        "batch_update" => {
            let session_id = str_req(args, "session_id")?;
            let selector = key_selector(args)?;
            let patch = ItemPatch {
                value: str_opt(args, "value"),
                category: str_opt(args, "category"),
                priority: str_opt(args, "priority"),
                channel: str_opt(args, "channel"),
                metadata: args.get("metadata").cloned(),
            };
            Ok(serde_json::to_value(engine.items().batch_update(&session_id, selector, patch)?)?)
        }
        "batch_delete" => {
            let session_id = str_req(args, "session_id")?;
            let selector = key_selector(args)?;
            let dry_run = args.get("dry_run").and_then(Value::as_bool).unwrap_or(false);
            Ok(serde_json::to_value(engine.items().batch_delete(&session_id, selector, dry_run)?)?)
        }
        "query" => {
            let opts = QueryOptions {
                query: str_opt(args, "query"),
                search_in: str_opt(args, "search_in").and_then(|s| parse_search_in(&s)).unwrap_or_default(),
                viewer_session_id: str_req(args, "viewer_session_id")?,
                category: str_opt(args, "category"),
                channels: str_vec_opt(args, "channels"),
                priorities: str_vec_opt(args, "priorities"),
                key_pattern: str_opt(args, "key_pattern"),
                created_after: i64_opt(args, "created_after"),
                created_before: i64_opt(args, "created_before"),
                sort: str_opt(args, "sort").and_then(|s| parse_sort(&s)),
                limit: i64_opt(args, "limit"),
                offset: i64_opt(args, "offset"),
                include_metadata: args.get("include_metadata").and_then(Value::as_bool).unwrap_or(false),
            };
            Ok(serde_json::to_value(engine.items().query(opts)?)?)
        }
        "reassign_channel" => {
            let session_id = str_req(args, "session_id")?;
            let selector = key_selector(args)?;
            let new_channel = str_req(args, "new_channel")?;
            let dry_run = args.get("dry_run").and_then(Value::as_bool).unwrap_or(false);
            let category = str_opt(args, "category");
            let priority = str_opt(args, "priority");
            let moved = engine.items().reassign_channel(
                &session_id,
                selector,
                category.as_deref(),
                priority.as_deref(),
                &new_channel,
                dry_run,
            )?;
            Ok(serde_json::to_value(moved)?)
        }
        "copy_between_sessions" => {
            let source = str_req(args, "source_session_id")?;
            let target = str_req(args, "target_session_id")?;
            Ok(serde_json::to_value(engine.items().copy_between_sessions(&source, &target)?)?)
        }

        "link" => {
            let session_id = str_req(args, "session_id")?;
            let from_key = str_req(args, "from_key")?;
            let to_key = str_req(args, "to_key")?;
            let relationship_type = parse_relationship_type(&str_req(args, "relationship_type")?)?;
            let metadata = args.get("metadata").cloned();
            let rel = engine.links().link(&session_id, &from_key, &to_key, relationship_type, metadata)?;
            Ok(serde_json::to_value(rel)?)
        }
        "unlink" => {
            let id = str_req(args, "id")?;
            engine.links().unlink(&id)?;
            Ok(json!({ "unlinked": id }))
        }
        "get_related" => {
            let session_id = str_req(args, "session_id")?;
            let start_key = str_req(args, "start_key")?;
            let max_depth = u32_opt(args, "max_depth").unwrap_or(1);
            let direction = match str_opt(args, "direction").as_deref() {
                Some("incoming") => contextd::relationships::Direction::Incoming,
                Some("both") => contextd::relationships::Direction::Both,
                _ => contextd::relationships::Direction::Outgoing,
            };
            Ok(serde_json::to_value(engine.links().get_related(&session_id, &start_key, max_depth, direction)?)?)
        }
        "detect_dependency_cycle" => {
            let session_id = str_req(args, "session_id")?;
            Ok(serde_json::to_value(engine.links().detect_dependency_cycle(&session_id)?)?)
        }
        "relationship_statistics" => {
            let session_id = str_req(args, "session_id")?;
            Ok(serde_json::to_value(engine.links().statistics(&session_id)?)?)
        }

        "checkpoint_create" => {
            let session_id = str_req(args, "session_id")?;
            let name = str_req(args, "name")?;
            let description = str_opt(args, "description");
            let git_status = str_opt(args, "git_status");
            let git_branch = str_opt(args, "git_branch");
            let cp = engine.checkpoints().create(
                &session_id, &name, description.as_deref(), git_status.as_deref(), git_branch.as_deref(),
            )?;
            Ok(serde_json::to_value(cp)?)
        }
        "checkpoint_get" => {
            let id = str_req(args, "id")?;
            Ok(serde_json::to_value(engine.checkpoints().get(&id)?)?)
        }
        "checkpoint_list" => {
            let session_id = str_req(args, "session_id")?;
            Ok(serde_json::to_value(engine.checkpoints().list(&session_id)?)?)
        }
        "checkpoint_restore" => {
            let checkpoint_id = str_req(args, "checkpoint_id")?;
            Ok(json!({ "session_id": engine.checkpoints().restore(&checkpoint_id)? }))
        }
        "branch" => {
            let source_session_id = str_req(args, "source_session_id")?;
            let name = str_opt(args, "name");
            let branch_name = str_opt(args, "branch_name");
            let depth = match str_opt(args, "depth").as_deref() {
                Some("shallow") => CopyDepth::Shallow,
                _ => CopyDepth::Deep,
            };
            Ok(json!({ "session_id": engine.checkpoints().branch(&source_session_id, name, branch_name, depth)? }))
        }
        "merge" => {
            let source_session_id = str_req(args, "source_session_id")?;
            let target_session_id = str_req(args, "target_session_id")?;
            let strategy = match str_opt(args, "strategy").as_deref() {
                Some("keep_source") => MergeStrategy::KeepSource,
                Some("keep_newest") => MergeStrategy::KeepNewest,
                _ => MergeStrategy::KeepCurrent,
            };
            Ok(serde_json::to_value(engine.checkpoints().merge(&source_session_id, &target_session_id, strategy)?)?)
        }

        "compress" => {
            let session_id = str_req(args, "session_id")?;
            let older_than_millis = i64_opt(args, "older_than_millis").unwrap_or(0);
            let preserve_categories = str_vec_opt(args, "preserve_categories").unwrap_or_default();
            Ok(serde_json::to_value(engine.compression().compress(&session_id, older_than_millis, &preserve_categories)?)?)
        }
        "compressed_list" => {
            let session_id = str_req(args, "session_id")?;
            Ok(serde_json::to_value(engine.compression().list(&session_id)?)?)
        }

        "journal_add" => {
            let session_id = str_req(args, "session_id")?;
            let entry = str_req(args, "entry")?;
            let tags = str_opt(args, "tags");
            Ok(serde_json::to_value(engine.journal().add(&session_id, &entry, tags.as_deref())?)?)
        }
        "journal_list" => {
            let session_id = str_req(args, "session_id")?;
            Ok(serde_json::to_value(engine.journal().list(&session_id)?)?)
        }
        "tool_events_list" => {
            let session_id = str_req(args, "session_id")?;
            Ok(serde_json::to_value(engine.journal().tool_events(&session_id)?)?)
        }
        "timeline" => {
            let session_id = str_req(args, "session_id")?;
            Ok(serde_json::to_value(engine.journal().timeline(&session_id)?)?)
        }

        "watch_create" => {
            let filter = WatcherFilter {
                owner_session_id: str_opt(args, "owner_session_id"),
                channels: str_vec_opt(args, "channels"),
                entity_type: str_opt(args, "entity_type"),
                keys: str_vec_opt(args, "keys"),
                categories: str_vec_opt(args, "categories"),
                priorities: str_vec_opt(args, "priorities"),
            };
            let since_seq = i64_opt(args, "since_seq").unwrap_or(0);
            Ok(json!({ "watcher_id": engine.watchers().create(filter, since_seq) }))
        }
        "watch_cancel" => {
            let id = str_req(args, "id")?;
            engine.watchers().cancel(&id);
            Ok(json!({ "cancelled": id }))
        }
        "watch_poll" => {
            let id = str_req(args, "id")?;
            let timeout_ms = u32_opt(args, "timeout_ms").unwrap_or(5000);
            let rows = engine.watchers().poll(&id, Duration::from_millis(u64::from(timeout_ms)))?;
            Ok(serde_json::to_value(rows)?)
        }

        other => Err(contextd::Error::InvalidArgument(format!("unknown tool: {other}"))),
    }
}

fn str_req(args: &Value, field: &str) -> contextd::Result<String> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| contextd::Error::InvalidArgument(format!("missing required argument '{field}'")))
}

fn str_opt(args: &Value, field: &str) -> Option<String> {
    args.get(field).and_then(Value::as_str).map(str::to_string)
}

fn str_vec_opt(args: &Value, field: &str) -> Option<Vec<String>> {
    args.get(field).and_then(Value::as_array).map(|arr| {
        arr.iter().filter_map(Value::as_str).map(str::to_string).collect()
    })
}

fn i64_opt(args: &Value, field: &str) -> Option<i64> {
    args.get(field).and_then(Value::as_i64)
}

fn u32_opt(args: &Value, field: &str) -> Option<u32> {
    args.get(field).and_then(Value::as_u64).and_then(|v| u32::try_from(v).ok())
}

fn key_selector(args: &Value) -> contextd::Result<KeySelector> {
    if let Some(keys) = str_vec_opt(args, "keys") {
        return Ok(KeySelector::Keys(keys));
    }
    if let Some(pattern) = str_opt(args, "key_pattern") {
        return Ok(KeySelector::Pattern(pattern));
    }
    if let Some(channel) = str_opt(args, "channel") {
        return Ok(KeySelector::Channel(channel));
    }
    Err(contextd::Error::InvalidArgument(
        "one of 'keys', 'key_pattern', or 'channel' is required".to_string(),
    ))
}

fn parse_sort(s: &str) -> Option<Sort> {
    Some(match s {
        "created_desc" => Sort::CreatedDesc,
        "created_asc" => Sort::CreatedAsc,
        "updated_desc" => Sort::UpdatedDesc,
        "updated_asc" => Sort::UpdatedAsc,
        "key_asc" => Sort::KeyAsc,
        "key_desc" => Sort::KeyDesc,
        "priority" => Sort::Priority,
        _ => return None,
    })
}

fn parse_search_in(s: &str) -> Option<SearchIn> {
    Some(match s {
        "key" => SearchIn::Key,
        "value" => SearchIn::Value,
        "both" => SearchIn::Both,
        _ => return None,
    })
}

fn parse_relationship_type(s: &str) -> contextd::Result<RelationshipType> {
    RelationshipType::from_str(s)
        .ok_or_else(|| contextd::Error::InvalidArgument(format!("unknown relationship_type: {s}")))
}
