//! jivectl - command-line client for the jived tool surface.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::Client;
use serde_json::{json, Value};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "jivectl", about = "Client for the jive work-management engine")]
struct Args {
    /// Base URL of the daemon.
    #[arg(long, default_value = "http://127.0.0.1:8377", env = "JIVED_URL")]
    url: String,

    /// Print raw JSON responses instead of rendered output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a work item.
    Create {
        /// initiative, epic, feature, story, or task.
        item_type: String,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        tag: Vec<String>,
    },
    /// Show a work item.
    Get { identifier: String },
    /// Update fields of a work item.
    Update {
        identifier: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long)]
        progress: Option<f64>,
    },
    /// Delete a work item.
    Delete {
        identifier: String,
        #[arg(long)]
        cascade: bool,
    },
    /// List work items.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        item_type: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Search work items.
    Search {
        query: String,
        /// vector, keyword, or hybrid.
        #[arg(long, default_value = "hybrid")]
        mode: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show children of a work item.
    Children {
        identifier: String,
        #[arg(long)]
        recursive: bool,
    },
    /// Show dependencies of a work item.
    Deps {
        identifier: String,
        #[arg(long)]
        transitive: bool,
        #[arg(long)]
        blocking: bool,
    },
    /// Add a dependency edge.
    Depend {
        identifier: String,
        depends_on: String,
    },
    /// Validate the dependency graph.
    Validate {
        #[arg(long)]
        suggest_fixes: bool,
    },
    /// Start an autonomous execution.
    Execute {
        identifier: String,
        #[arg(long, default_value = "dependency_based")]
        mode: String,
        #[arg(long)]
        no_validate: bool,
    },
    /// Show execution status.
    Status {
        execution_id: String,
        #[arg(long)]
        logs: bool,
    },
    /// Cancel an execution.
    Cancel {
        execution_id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        rollback: bool,
        #[arg(long)]
        force: bool,
    },
    /// Write a work item to its task file.
    SyncToFile {
        identifier: String,
        #[arg(long, default_value = "md")]
        format: String,
        #[arg(long, default_value = "newest_wins")]
        resolution: String,
    },
    /// Reconcile every task file into the store.
    Reconcile {
        #[arg(long, default_value = "newest_wins")]
        resolution: String,
    },
    /// Daemon health.
    Health,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let client = Client::new(args.url.clone());

    match run(&client, &args).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(client: &Client, args: &Args) -> client::Result<()> {
    let response = match &args.command {
        Command::Create {
            item_type,
            title,
            description,
            priority,
            parent,
            tag,
        } => {
            let mut body = json!({
                "item_type": item_type,
                "title": title,
                "description": description,
                "tags": tag,
            });
            if let Some(priority) = priority {
                body["priority"] = json!(priority);
            }
            if let Some(parent) = parent {
                body["parent_id"] = json!(parent);
            }
            client.call("jive_create_work_item", body).await?
        }
        Command::Get { identifier } => {
            client
                .call("jive_get_work_item", json!({"work_item_id": identifier}))
                .await?
        }
        Command::Update {
            identifier,
            title,
            status,
            priority,
            assignee,
            progress,
        } => {
            let mut body = json!({"work_item_id": identifier});
            if let Some(title) = title {
                body["title"] = json!(title);
            }
            if let Some(status) = status {
                body["status"] = json!(status);
            }
            if let Some(priority) = priority {
                body["priority"] = json!(priority);
            }
            if let Some(assignee) = assignee {
                body["assignee"] = json!(assignee);
            }
            if let Some(progress) = progress {
                body["progress"] = json!(progress);
            }
            client.call("jive_update_work_item", body).await?
        }
        Command::Delete {
            identifier,
            cascade,
        } => {
            client
                .call(
                    "jive_delete_work_item",
                    json!({"work_item_id": identifier, "cascade": cascade}),
                )
                .await?
        }
        Command::List {
            status,
            item_type,
            limit,
        } => {
            let mut body = json!({});
            if let Some(status) = status {
                body["status"] = json!([status]);
            }
            if let Some(item_type) = item_type {
                body["item_type"] = json!([item_type]);
            }
            if let Some(limit) = limit {
                body["limit"] = json!(limit);
            }
            client.call("jive_list_work_items", body).await?
        }
        Command::Search { query, mode, limit } => {
            client
                .call(
                    "jive_search_work_items",
                    json!({"query": query, "search_type": mode, "limit": limit}),
                )
                .await?
        }
        Command::Children {
            identifier,
            recursive,
        } => {
            client
                .call(
                    "jive_get_children",
                    json!({"work_item_id": identifier, "recursive": recursive}),
                )
                .await?
        }
        Command::Deps {
            identifier,
            transitive,
            blocking,
        } => {
            client
                .call(
                    "jive_get_dependencies",
                    json!({
                        "work_item_id": identifier,
                        "transitive": transitive,
                        "only_blocking": blocking,
                    }),
                )
                .await?
        }
        Command::Depend {
            identifier,
            depends_on,
        } => {
            client
                .call(
                    "jive_add_dependency",
                    json!({"work_item_id": identifier, "depends_on": depends_on}),
                )
                .await?
        }
        Command::Validate { suggest_fixes } => {
            client
                .call(
                    "jive_validate_dependencies",
                    json!({"suggest_fixes": suggest_fixes}),
                )
                .await?
        }
        Command::Execute {
            identifier,
            mode,
            no_validate,
        } => {
            client
                .call(
                    "jive_execute_work_item",
                    json!({
                        "work_item_id": identifier,
                        "mode": mode,
                        "validate_before": !no_validate,
                    }),
                )
                .await?
        }
        Command::Status { execution_id, logs } => {
            client
                .call(
                    "jive_get_execution_status",
                    json!({
                        "execution_id": execution_id,
                        "include_logs": logs,
                        "include_validation": true,
                    }),
                )
                .await?
        }
        Command::Cancel {
            execution_id,
            reason,
            rollback,
            force,
        } => {
            client
                .call(
                    "jive_cancel_execution",
                    json!({
                        "execution_id": execution_id,
                        "reason": reason,
                        "rollback": rollback,
                        "force": force,
                    }),
                )
                .await?
        }
        Command::SyncToFile {
            identifier,
            format,
            resolution,
        } => {
            client
                .call(
                    "jive_sync_db_to_file",
                    json!({
                        "work_item_id": identifier,
                        "format": format,
                        "resolution": resolution,
                    }),
                )
                .await?
        }
        Command::Reconcile { resolution } => {
            client
                .call("jive_reconcile_sync", json!({"resolution": resolution}))
                .await?
        }
        Command::Health => client.health().await?,
    };

    print_response(&args.command, &response, args.json);
    Ok(())
}

fn print_response(command: &Command, response: &Value, raw: bool) {
    if raw {
        println!("{}", serde_json::to_string_pretty(response).unwrap_or_default());
        return;
    }

    match command {
        Command::Get { .. } => {
            if let Some(item) = response.get("work_item") {
                println!("{}", render::work_item_line(item));
            }
        }
        Command::List { .. } | Command::Children { .. } | Command::Deps { .. } => {
            let key = match command {
                Command::List { .. } => "work_items",
                Command::Children { .. } => "children",
                _ => "dependencies",
            };
            for item in response
                .get(key)
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                println!("{}", render::work_item_line(item));
            }
        }
        Command::Search { .. } => {
            for hit in response
                .get("results")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                println!("{}", render::search_hit_line(hit));
            }
            if response.get("fallback_used") == Some(&Value::Bool(true)) {
                eprintln!("(search fell back to the sibling mode)");
            }
        }
        Command::Status { .. } => {
            print!("{}", render::execution_status(response));
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(response).unwrap_or_default());
        }
    }
}
