//! Non-Interactive Command Execution Example
//!
//! Runs commands on a remote SSH server, similar to `ssh user@host command`.
//!
//! Key features:
//! - Password authentication
//! - One session channel per command over a single connection
//! - Exit status and stderr reporting
//!
//! The host key is accepted on first use and its SHA-256 fingerprint is
//! printed; do not use this trust policy outside a lab.
//!
//! Usage:
//!   cargo run --example execute_command <host:port> <username> <password> <command1> [command2] [...]
//!
//! Example:
//!   cargo run --example execute_command 127.0.0.1:2222 admin secret "whoami" "pwd" "hostname"

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use skerry_platform::{AuthMethodKind, Credential, CredentialProvider, HostTrust};
use skerry_proto::ssh::{DefaultCryptoProvider, SshClient, SshClientConfig};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Accepts any host key after printing its fingerprint.
struct PrintFingerprint;

#[async_trait]
impl HostTrust for PrintFingerprint {
    async fn verify(&self, algorithm: &str, host_key: &[u8]) -> bool {
        let digest = Sha256::digest(host_key);
        println!("  Host key: {} SHA256:{}", algorithm, hex::encode(digest));
        true
    }
}

struct Password(String);

#[async_trait]
impl CredentialProvider for Password {
    async fn next_credential(&self, method: AuthMethodKind, _username: &str) -> Option<Credential> {
        (method == AuthMethodKind::Password).then(|| Credential::password(self.0.clone()))
    }
}

/// Execute a single command and display the result
async fn execute_command(client: &SshClient, command: &str) -> Result<bool, Box<dyn std::error::Error>> {
    println!("$ {}", command);

    let output = match timeout(Duration::from_secs(10), client.exec(command)).await {
        Ok(result) => result?,
        Err(_) => {
            eprintln!("Command timed out after 10 seconds");
            return Err("Command timeout".into());
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    print!("{}", stdout);
    if !stdout.is_empty() && !stdout.ends_with('\n') {
        println!();
    }
    if !output.stderr.is_empty() {
        eprint!("{}", String::from_utf8_lossy(&output.stderr));
    }

    match (output.exit_status, output.exit_signal) {
        (Some(0), _) => Ok(true),
        (Some(status), _) => {
            println!("(exit status {})", status);
            Ok(false)
        }
        (None, Some(signal)) => {
            println!("(killed by SIG{})", signal);
            Ok(false)
        }
        (None, None) => Ok(false),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        eprintln!(
            "Usage: {} <host:port> <username> <password> <command1> [command2] [...]",
            args[0]
        );
        std::process::exit(1);
    }

    let server_addr = &args[1];
    let username = &args[2];
    let password = Password(args[3].clone());
    let commands = &args[4..];

    println!("Connecting to {}...", server_addr);
    let stream = TcpStream::connect(server_addr).await?;
    let mut client = SshClient::connect(
        stream,
        SshClientConfig::default().with_handshake_timeout(Duration::from_secs(10)),
        Arc::new(DefaultCryptoProvider::new()),
        Arc::new(PrintFingerprint),
    )
    .await?;
    println!("✓ Connected to {}", client.server_version());

    println!("Authenticating as '{}'...", username);
    client.authenticate(username, &password).await?;
    println!("✓ Authenticated");
    println!();

    let mut failures = 0;
    for command in commands {
        match execute_command(&client, command).await {
            Ok(true) => {}
            Ok(false) => failures += 1,
            Err(e) => {
                eprintln!("Error executing command: {}", e);
                failures += 1;
            }
        }
        println!();
    }

    println!("{} of {} command(s) succeeded", commands.len() - failures, commands.len());
    client.disconnect().await?;

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
