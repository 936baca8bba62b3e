use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

use agentlink_client::{default_socket_path, AgentClient};
use agentlink_proto::{
    parse_identity, AgentIdentity, SSH_AGENT_RSA_SHA2_256, SSH_AGENT_RSA_SHA2_512,
};

#[cfg(unix)]
mod spawn;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();
    if args.help {
        print_help();
        return Ok(());
    }
    if args.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    #[cfg(unix)]
    if let Some(pem_path) = args.demo.as_deref() {
        return run_demo(pem_path).await;
    }

    let client = match args.socket_path.clone() {
        Some(path) => AgentClient::new(path),
        None => match default_socket_path() {
            Some(path) => AgentClient::new(path),
            None => bail!("SSH_AUTH_SOCK is not set; pass --socket <path>"),
        },
    };

    if args.list {
        return list_identities(&client, args.json, args.json_compact).await;
    }

    if let Some(pem_path) = args.add.as_deref() {
        let pem = std::fs::read_to_string(pem_path)
            .with_context(|| format!("failed to read {pem_path}"))?;
        let identity = parse_identity(&pem)
            .with_context(|| format!("{pem_path} is not an unencrypted OpenSSH private key"))?;
        let key_type = String::from_utf8_lossy(identity.key_type()).into_owned();
        client.add_identity(&identity).await?;
        info!(key_type, "identity added");
        println!("added {key_type} key from {pem_path}");
        return Ok(());
    }

    if let Some(key_hex) = args.sign_key_blob.as_deref() {
        let key_blob = hex::decode(key_hex).context("--sign expects a hex key blob")?;
        let data = match args.data_path.as_deref() {
            Some(path) => {
                std::fs::read(path).with_context(|| format!("failed to read {path}"))?
            }
            None => {
                let mut buf = Vec::new();
                std::io::stdin().read_to_end(&mut buf)?;
                buf
            }
        };
        let signature_blob = client.sign(key_blob, data, args.flags).await?;
        println!("{}", hex::encode(signature_blob));
        return Ok(());
    }

    eprintln!("No command provided. Use --list, --add or --sign.");
    Ok(())
}

async fn list_identities(client: &AgentClient, json: bool, json_compact: bool) -> Result<()> {
    let identities = client.identities().await?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();

    if json {
        let items: Vec<JsonIdentity> = identities.iter().map(describe).collect();
        if json_compact {
            serde_json::to_writer(&mut handle, &items)?;
        } else {
            serde_json::to_writer_pretty(&mut handle, &items)?;
        }
        writeln!(handle)?;
        return Ok(());
    }

    for identity in &identities {
        let item = describe(identity);
        match (item.algorithm, item.fingerprint) {
            (Some(algorithm), Some(fingerprint)) => writeln!(
                handle,
                "{} {} {} {}",
                item.key_blob_hex, identity.comment, algorithm, fingerprint
            )?,
            _ => writeln!(handle, "{} {}", item.key_blob_hex, identity.comment)?,
        }
    }
    Ok(())
}

fn describe(identity: &AgentIdentity) -> JsonIdentity<'_> {
    let parsed = ssh_key::PublicKey::from_bytes(&identity.key_blob).ok();
    JsonIdentity {
        key_blob_hex: hex::encode(&identity.key_blob),
        comment: &identity.comment,
        algorithm: parsed
            .as_ref()
            .map(|key| key.algorithm().as_str().to_string()),
        fingerprint: parsed
            .as_ref()
            .map(|key| key.fingerprint(ssh_key::HashAlg::Sha256).to_string()),
    }
}

#[cfg(unix)]
async fn run_demo(pem_path: &str) -> Result<()> {
    let pem = std::fs::read_to_string(pem_path)
        .with_context(|| format!("failed to read {pem_path}"))?;
    let identity = parse_identity(&pem)
        .with_context(|| format!("{pem_path} is not an unencrypted OpenSSH private key"))?;

    let agent = spawn::SpawnedAgent::spawn().await?;
    println!("spawned ssh-agent at {}", agent.socket_path().display());

    let client = AgentClient::new(agent.socket_path());
    client.add_identity(&identity).await?;
    println!(
        "added {} key",
        String::from_utf8_lossy(identity.key_type())
    );

    let identities = client.identities().await?;
    for listed in &identities {
        println!("listed {} {}", hex::encode(&listed.key_blob), listed.comment);
    }

    let first = identities
        .first()
        .context("agent returned no identities")?;
    let signature = client
        .sign(first.key_blob.clone(), b"agentlink demo payload".to_vec(), 0)
        .await?;
    println!("signature {}", hex::encode(signature));

    agent.shutdown().await
}

#[derive(Serialize)]
struct JsonIdentity<'a> {
    key_blob_hex: String,
    comment: &'a str,
    algorithm: Option<String>,
    fingerprint: Option<String>,
}

#[derive(Debug, Default)]
struct Args {
    socket_path: Option<PathBuf>,
    list: bool,
    json: bool,
    json_compact: bool,
    add: Option<String>,
    sign_key_blob: Option<String>,
    data_path: Option<String>,
    flags: u32,
    demo: Option<String>,
    help: bool,
    version: bool,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut parsed = Args::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket" => parsed.socket_path = args.next().map(PathBuf::from),
            "--list" => parsed.list = true,
            "--json" => parsed.json = true,
            "--json-compact" => {
                parsed.json = true;
                parsed.json_compact = true;
            }
            "--add" => parsed.add = args.next(),
            "--sign" => parsed.sign_key_blob = args.next(),
            "--data" => parsed.data_path = args.next(),
            "--flags" => {
                if let Some(value) = args.next() {
                    if let Some(flags) = parse_flags(&value) {
                        parsed.flags = flags;
                    }
                }
            }
            "--demo" => parsed.demo = args.next(),
            "-h" | "--help" => parsed.help = true,
            "--version" => parsed.version = true,
            _ => {}
        }
    }

    parsed
}

fn print_help() {
    println!("agentlink usage:\n");
    println!("  --list [--json|--json-compact]");
    println!("  --add <pem-path>");
    println!("  --sign <key_blob_hex> [--data <path>] [--flags <u32>]");
    println!("  --demo <pem-path>");
    println!("  --socket <path>\n");
    println!("  --version\n");
    println!("Notes:");
    println!("  If --data is omitted, stdin is used for signing.");
    println!("  --flags accepts numeric values or rsa hash names (sha256/sha512/ssh-rsa).");
    println!("  --demo spawns a disposable ssh-agent, adds the key, lists and signs.");
    println!("  Without --socket, AGENTLINK_SOCK then SSH_AUTH_SOCK locate the agent.");
}

fn parse_flags(value: &str) -> Option<u32> {
    match value.trim().to_ascii_lowercase().as_str() {
        "sha256" | "rsa-sha2-256" => Some(SSH_AGENT_RSA_SHA2_256),
        "sha512" | "rsa-sha2-512" => Some(SSH_AGENT_RSA_SHA2_512),
        "sha1" | "ssh-rsa" => Some(0),
        other => other.parse().ok(),
    }
}
