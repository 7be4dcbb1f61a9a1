//! Scout 命令行入口
//!
//! 用法：`scout [--config PATH] <调研命令...>`
//! 每个步骤事件以一行 JSON 写到 stdout，最后输出运行摘要；运行失败时以非零状态退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use scout::{config::load_config, core::AgentPhase, observability, OrchestratorBuilder};

fn parse_args() -> anyhow::Result<(Option<PathBuf>, String)> {
    let mut config_path = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            _ => words.push(arg),
        }
    }
    let command = words.join(" ");
    if command.trim().is_empty() {
        bail!("usage: scout [--config PATH] <command...>");
    }
    Ok((config_path, command))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let (config_path, command) = parse_args()?;
    let config = load_config(config_path).context("Failed to load config")?;
    let orchestrator = Arc::new(
        OrchestratorBuilder::new(config)
            .build()
            .context("Failed to build orchestrator")?,
    );

    let mut handle = orchestrator.run(command);
    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    while let Some(event) = handle.next_event().await {
        println!("{}", serde_json::to_string(&event)?);
    }

    let state = handle.join().await.context("Run task aborted")?;
    let summary = state.to_summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if state.current_phase == AgentPhase::Failed {
        std::process::exit(1);
    }
    Ok(())
}
