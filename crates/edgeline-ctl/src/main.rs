//! edgeline-ctl: command-line interface for the Edgeline daemon.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: edgeline-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                                   Show node status and decision stats");
    println!("  submit <task_type> <class> [k=v ...]     Route one task and print the decision");
    println!("  cache                                    Show decision cache entries and stats");
    println!("  cache clear                              Drop every cached decision");
    println!("  agents                                   List candidate agents by task type");
    println!("  agents set <task_type> <file.json>       Replace candidates for a task type");
    println!("  cluster                                  Show cluster role, epoch and peers");
    println!("  connectivity                             Show cloud connectivity and sync backlog");
    println!("  shutdown                                 Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
    println!("  --id <id>       Task id for submit (generated when omitted)");
    println!();
    println!("Classes: safety_critical, quality_critical, efficiency_critical, standard");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port / --id options
    let mut port = DEFAULT_PORT;
    let mut task_id = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--id" => {
                i += 1;
                task_id = Some(args.get(i).context("--id requires a value")?.clone());
            }
            _ => remaining.push(&args[i]),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["submit", task_type, class, ctx @ ..] => {
            cmd::tasks::cmd_submit(port, task_type, class, task_id, ctx).await
        }
        ["cache"] => cmd::status::cmd_cache(port).await,
        ["cache", "clear"] => cmd::status::cmd_cache_clear(port).await,
        ["agents"] => cmd::agents::cmd_agents(port).await,
        ["agents", "set", task_type, file] => cmd::agents::cmd_agents_set(port, task_type, file).await,
        ["cluster"] => cmd::cluster::cmd_cluster(port).await,
        ["connectivity"] => cmd::status::cmd_connectivity(port).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
