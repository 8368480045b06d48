//! CLI entry point.
//!
//! # Responsibility
//! - Provide a minimal probe verifying `manuscript_core` linkage.
//! - Render one project's document tree from a cache database file.
//!
//! Usage:
//! - `manuscript_cli` prints ping and version.
//! - `manuscript_cli tree <db_path> <project_uuid>` prints the tree.
//!
//! `MANUSCRIPT_CONFIG` names a JSON engine config file; its `log_level` and
//! `log_dir` drive file logging. `MANUSCRIPT_LOG_DIR` overrides `log_dir`.

use log::info;
use manuscript_core::db::open_db;
use manuscript_core::{
    init_logging_from_config, load_config, CacheStore, EngineConfig, SqliteCacheStore, TreeIndex,
    ViewState,
};
use std::process::ExitCode;
use uuid::Uuid;

fn main() -> ExitCode {
    let config = match engine_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("error: {message}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = init_logging_from_config(&config) {
        eprintln!("logging disabled: {err}");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {
            println!("manuscript_core ping={}", manuscript_core::ping());
            println!("manuscript_core version={}", manuscript_core::core_version());
            ExitCode::SUCCESS
        }
        [command, db_path, project] if command == "tree" => match print_tree(db_path, project) {
            Ok(()) => ExitCode::SUCCESS,
            Err(message) => {
                eprintln!("error: {message}");
                ExitCode::FAILURE
            }
        },
        _ => {
            eprintln!("usage: manuscript_cli [tree <db_path> <project_uuid>]");
            ExitCode::from(2)
        }
    }
}

fn engine_config() -> Result<EngineConfig, String> {
    let mut config = match std::env::var("MANUSCRIPT_CONFIG") {
        Ok(path) => load_config(&path).map_err(|err| err.to_string())?,
        Err(_) => EngineConfig::default(),
    };
    if let Ok(log_dir) = std::env::var("MANUSCRIPT_LOG_DIR") {
        config.log_dir = Some(log_dir);
    }
    Ok(config)
}

fn print_tree(db_path: &str, project: &str) -> Result<(), String> {
    let project_id =
        Uuid::parse_str(project).map_err(|err| format!("invalid project id `{project}`: {err}"))?;
    let conn = open_db(db_path).map_err(|err| err.to_string())?;
    let store = SqliteCacheStore::try_new(conn).map_err(|err| err.to_string())?;
    let project = store
        .get_project(project_id)
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("project not found: {project_id}"))?;
    let nodes = store
        .list_project_nodes(project_id)
        .map_err(|err| err.to_string())?;

    let index = TreeIndex::build(&nodes);
    let mut view = ViewState::default();
    for node in nodes.iter().filter(|node| node.is_container()) {
        view.expand(node.id);
    }

    println!("{} [{}]", project.title, project.sync_status.as_str());
    for row in index.visible_rows(&view) {
        println!(
            "{}{} ({}, {} words)",
            "  ".repeat(row.depth + 1),
            row.node.title,
            row.node.kind,
            index.aggregate_word_count(row.node.id)
        );
    }
    info!(
        "event=cli_tree module=cli status=ok project_id={project_id} node_count={}",
        nodes.len()
    );
    Ok(())
}
