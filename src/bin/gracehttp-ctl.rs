use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[cfg_attr(not(unix), allow(dead_code))]
#[command(name = "gracehttp-ctl")]
#[command(about = "Control a running gracehttp process", long_about = None)]
struct Cli {
    /// Pid file written by the server
    #[arg(short, long, default_value = "gracehttp.pid")]
    pid_file: PathBuf,

    /// Base URL of a server exposing the status endpoint
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[cfg_attr(not(unix), allow(dead_code))]
enum Commands {
    /// Check that the process is alive and query its status endpoint
    Status,
    /// Hand listeners to a freshly started process (SIGUSR2)
    Restart,
    /// Rebuild routes in place (SIGHUP)
    Reload,
    /// Drain and exit (SIGTERM)
    Stop,
}

#[cfg(not(unix))]
fn main() {
    eprintln!("gracehttp-ctl controls servers through unix signals and is not available on this platform");
    std::process::exit(1);
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let pid = read_pid(&cli.pid_file)?;

    match cli.command {
        Commands::Status => {
            send(pid, 0)?;
            println!("pid {pid} is running");
            let res = reqwest::Client::new()
                .get(format!("{}/_gracehttp/status", cli.url))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Restart => {
            send(pid, libc::SIGUSR2)?;
            println!("restart requested for pid {pid}");
        }
        Commands::Reload => {
            send(pid, libc::SIGHUP)?;
            println!("reload requested for pid {pid}");
        }
        Commands::Stop => {
            send(pid, libc::SIGTERM)?;
            println!("shutdown requested for pid {pid}");
        }
    }

    Ok(())
}

#[cfg(unix)]
fn read_pid(path: &std::path::Path) -> Result<libc::pid_t, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read pid file {}: {e}", path.display()))?;
    Ok(content.trim().parse()?)
}

#[cfg(unix)]
fn send(pid: libc::pid_t, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill has no memory effects.
    if unsafe { libc::kill(pid, signal) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    if !res.status().is_success() {
        let code = res.status();
        let body = res.text().await.unwrap_or_default();
        eprintln!("status endpoint answered {code}: {body}");
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
