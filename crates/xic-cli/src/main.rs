//! xic - host an echo service or call a remote one from the command line.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use xic_core::Engine;

#[derive(Parser, Debug)]
#[command(name = "xic")]
#[command(about = "Host and call XIC services")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Engine settings as a JSON file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve an echo servant until interrupted
    Serve {
        /// Listen endpoint (port 0 = auto-assign)
        #[arg(long, default_value = "@tcp+127.0.0.1+0")]
        endpoint: String,

        /// Service name the echo servant registers under
        #[arg(long, default_value = "Echo")]
        service: String,
    },

    /// Invoke a method and print the answer as JSON
    Call {
        /// Proxy string, e.g. "Echo @tcp+127.0.0.1+5555"
        proxy: String,

        method: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        args: String,

        /// Send without waiting for an answer
        #[arg(long)]
        oneway: bool,
    },

    /// Check that a service answers
    Ping {
        proxy: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = commands::load_config(args.config.as_deref())?;
    let engine = Engine::new(config)?;

    match args.command {
        Command::Serve { endpoint, service } => {
            let port = commands::serve(&engine, &endpoint, &service).await?;

            // Port for scripts to read (intentional stdout)
            println!("XIC_PORT={}", port);

            engine.install_signal_handler();
            engine.wait_for_shutdown().await;
            info!("Server stopped");
            return Ok(());
        }
        Command::Call {
            proxy,
            method,
            args,
            oneway,
        } => {
            let answer = commands::call(&engine, &proxy, &method, &args, oneway).await;
            match answer {
                Ok(Some(out)) => println!("{}", serde_json::to_string_pretty(&out)?),
                Ok(None) => info!("One-way call sent"),
                Err(e) => {
                    stop(&engine).await;
                    return Err(e);
                }
            }
        }
        Command::Ping { proxy } => match commands::ping(&engine, &proxy).await {
            Ok(elapsed) => println!("{} answered in {:?}", proxy, elapsed),
            Err(e) => {
                stop(&engine).await;
                return Err(e);
            }
        },
    }

    stop(&engine).await;
    Ok(())
}

async fn stop(engine: &Engine) {
    engine.shutdown();
    engine.wait_for_shutdown().await;
}
