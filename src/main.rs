use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use hearth::{AgentConfig, AgentEvent, ChatHandler, MemoryStore, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hearth=debug")),
        )
        .init();

    tracing::info!("hearth starting...");

    let config = AgentConfig::load();
    let memory = Arc::new(
        MemoryStore::open(&config.data_dir)?.with_history_cap(config.history_cap),
    );
    if memory.api_key()?.is_none() {
        tracing::warn!(
            "No API key in {:?}; chat and autonomy stay idle until one is added",
            config.data_dir.join("config.json")
        );
    }

    let (event_tx, event_rx) = flume::unbounded::<AgentEvent>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(memory.clone(), config.clone(), event_tx);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    // Surface autonomy events on the console above the prompt.
    let event_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                AgentEvent::SelfInitiated { text } => {
                    println!("\n{}\n", text);
                }
                AgentEvent::DiaryWritten { date } => {
                    tracing::info!("Diary written for {}", date);
                }
                AgentEvent::Notify { title, body } => {
                    tracing::debug!("notify [{}] {}", title, body);
                }
            }
        }
    });

    let chat = ChatHandler::new(memory.clone(), config.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        match chat.send_streaming(input).await {
            Ok(mut deltas) => {
                let mut full = String::new();
                while let Some(delta) = deltas.recv().await {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                    full.push_str(&delta);
                }
                println!();
                chat.finish_streaming(&full)?;
            }
            Err(e) => {
                tracing::error!("Request failed: {:#}", e);
            }
        }
    }

    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    event_task.abort();
    tracing::info!("hearth stopped");
    Ok(())
}
