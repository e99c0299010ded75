//! SFTP Directory Listing Example
//!
//! Lists a remote directory with `ls -l` style output and optionally
//! changes the permissions of one entry.
//!
//! Usage:
//!   cargo run --example sftp_list <host:port> <username> <password> <dir> [<name> <mode>]
//!
//! Example:
//!   cargo run --example sftp_list 127.0.0.1:22 admin secret /tmp notes.txt 640

use async_trait::async_trait;
use skerry_platform::{AuthMethodKind, Credential, CredentialProvider, HostTrust};
use skerry_proto::ssh::{DefaultCryptoProvider, SshClient, SshClientConfig};
use std::env;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Lab-only policy: accepts every host key.
struct AcceptAny;

#[async_trait]
impl HostTrust for AcceptAny {
    async fn verify(&self, _algorithm: &str, _host_key: &[u8]) -> bool {
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 5 && args.len() != 7 {
        eprintln!(
            "Usage: {} <host:port> <username> <password> <dir> [<name> <mode>]",
            args[0]
        );
        std::process::exit(1);
    }

    let stream = TcpStream::connect(&args[1]).await?;
    let mut client = SshClient::connect(
        stream,
        SshClientConfig::default(),
        Arc::new(DefaultCryptoProvider::new()),
        Arc::new(AcceptAny),
    )
    .await?;
    client
        .authenticate(&args[2], &Password(args[3].clone()))
        .await?;

    let sftp = client.sftp().await?;
    let dir = sftp.realpath(&args[4]).await?;
    println!("{} (SFTP v{})", dir, sftp.version());

    for entry in sftp.list_directory(&dir).await? {
        let mode = entry
            .attrs
            .mode()
            .map(|mode| mode.to_string())
            .unwrap_or_else(|| "?---------".to_string());
        let size = entry.attrs.size.unwrap_or(0);
        println!("{} {:>10} {}", mode, size, entry.filename);
    }

    if let (Some(name), Some(mode)) = (args.get(5), args.get(6)) {
        let path = format!("{}/{}", dir.trim_end_matches('/'), name);
        let mut file = sftp.metadata(&path).await?;
        let before = file.mode().map(|m| m.to_string()).unwrap_or_default();
        file.set_permissions(mode).await?;
        file.refresh().await?;
        let after = file.mode().map(|m| m.to_string()).unwrap_or_default();
        println!("{}: {} -> {}", file.name(), before, after);
    }

    sftp.shutdown().await?;
    client.disconnect().await?;
    Ok(())
}
