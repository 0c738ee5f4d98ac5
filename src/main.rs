//! Command line interface: compile a parsed heading tree into records, sign
//! them, verify signatures locally, publish to a relay, reconcile the relay
//! against the signed file, and publish deletion markers.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scriptorium::{
    compile::{self, CompileOptions, Metadata, ParsedTree},
    config::Settings,
    delete,
    event::Event,
    keys::{SecretKeySigner, Signer},
    layout::{Layout, Records},
    publish::{self, PublishReport},
    qc, sign,
};
use tracing::info;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "scriptorium",
    author,
    version,
    about = "Publish hierarchical documents as Nostr event graphs"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Output directory; overrides `SCRIPTORIUM_OUT`.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Relay URL; overrides `SCRIPTORIUM_RELAY`.
    #[arg(long)]
    relay: Option<String>,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Compile a parsed heading tree (JSON) into unsigned records.
    Compile {
        /// `{"sections": [...], "leaf_level": n}` produced by the parser.
        #[arg(long)]
        tree: PathBuf,
        /// Optional publication metadata (JSON).
        #[arg(long)]
        metadata: Option<PathBuf>,
        #[arg(long)]
        collection_id: Option<String>,
        #[arg(long)]
        language: Option<String>,
    },
    /// Sign the compiled records with one shared timestamp.
    Sign {
        /// Discard existing signatures and sign again.
        #[arg(long)]
        resign: bool,
    },
    /// Check identifiers and signatures of the signed records.
    Verify {
        /// Check a random sample instead of every record.
        #[arg(long)]
        sample: Option<usize>,
    },
    /// Publish the records to the relay, signing first when needed.
    Publish {
        #[arg(long)]
        resign: bool,
        /// Skip the first-record spot-check.
        #[arg(long)]
        no_verify: bool,
    },
    /// Compare the signed records with what the relay holds.
    Qc {
        /// Resubmit missing records unchanged.
        #[arg(long)]
        republish: bool,
    },
    /// Publish deletion markers for every signed record.
    Delete {
        #[arg(long, default_value = "")]
        reason: String,
    },
}

/// Execute the selected CLI subcommand and return the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let mut cfg = Settings::from_env(&cli.env)?;
    if let Some(out) = cli.out {
        cfg.out_dir = out;
    }
    if let Some(relay) = cli.relay {
        cfg.relay = relay;
    }
    let layout = Layout::new(cfg.out_dir.clone());

    match cli.command {
        Commands::Compile {
            tree,
            metadata,
            collection_id,
            language,
        } => {
            let parsed: ParsedTree = read_json(&tree)?;
            let metadata: Metadata = match metadata {
                Some(path) => read_json(&path)?,
                None => Metadata::default(),
            };
            let Some(collection_id) = collection_id.or_else(|| metadata.collection_id.clone())
            else {
                bail!("--collection-id is required (or set collection_id in the metadata file)");
            };
            let language = language
                .or_else(|| metadata.language.clone())
                .unwrap_or_else(|| "en".into());
            let opts = CompileOptions {
                collection_id,
                language,
                relay_hint: cfg.relay_hint.clone(),
                metadata,
            };
            let graph = compile::compile(&parsed, &opts)?;
            layout.write_drafts(&graph.drafts)?;

            let r = &graph.report;
            println!(
                "compiled {} records ({} index, {} content) into {}",
                graph.drafts.len(),
                r.index_records,
                r.content_records,
                layout.events_path().display()
            );
            println!("preambles synthesized: {}", r.preambles);
            println!("duplicates dropped: {}", r.duplicates_dropped);
            for d in &r.duplicate_d_tags {
                println!("  duplicate: {d}");
            }
            if r.fallback_sections > 0 {
                println!("sections placed by fallback: {}", r.fallback_sections);
            }
            Ok(0)
        }
        Commands::Sign { resign } => {
            let signer = cfg.signer()?;
            let records = layout.read_records()?;
            if matches!(records, Records::Signed(_)) && !resign {
                bail!("records are already signed; pass --resign to sign them again");
            }
            let events = sign_records(&layout, records, &signer)?;
            println!(
                "signed {} records as {}",
                events.len(),
                signer.public_key_hex()
            );
            Ok(0)
        }
        Commands::Verify { sample } => {
            let events = layout.read_events()?;
            let checked = sign::verify_sample(&events, sample.unwrap_or(events.len()))?;
            println!("verified {checked} of {} records", events.len());
            Ok(0)
        }
        Commands::Publish { resign, no_verify } => {
            let signer = cfg.signer()?;
            let events = match layout.read_records()? {
                Records::Signed(events) if !resign => {
                    let pubkey = signer.public_key_hex();
                    if events.iter().any(|e| e.pubkey != pubkey) {
                        bail!("records were signed with a different key; pass --resign");
                    }
                    events
                }
                records => sign_records(&layout, records, &signer)?,
            };
            let mut opts = cfg.publish.clone();
            opts.verify = !no_verify;
            let report = publish::publish(
                &cfg.relay,
                cfg.tor_socks.as_deref(),
                &events,
                &opts,
                interrupted(),
            )
            .await?;
            print_publish(&report);
            Ok(report.status.exit_code())
        }
        Commands::Qc { republish } => {
            let events = layout.read_events()?;
            let report = qc::run(&cfg.relay, cfg.tor_socks.as_deref(), &events, &cfg.qc).await?;
            layout.write_json(&layout.qc_report_path(), &report)?;
            println!(
                "total {}: found by id {}, found by key {}, missing {}",
                report.total, report.found_by_id, report.found_by_key, report.missing
            );
            for m in &report.missing_records {
                println!(
                    "  missing kind {} d {} ({})",
                    m.kind,
                    m.d.as_deref().unwrap_or("-"),
                    if m.key_present { "stale copy on relay" } else { "absent" }
                );
            }
            for e in &report.errors {
                println!("  error: {e}");
            }
            if !republish || report.missing == 0 {
                return Ok(report.exit_code());
            }

            let missing = qc::missing_events(&events, &report);
            info!(records = missing.len(), "republishing missing records");
            let publish_report = publish::publish(
                &cfg.relay,
                cfg.tor_socks.as_deref(),
                &missing,
                &cfg.publish,
                interrupted(),
            )
            .await?;
            print_publish(&publish_report);
            Ok(publish_report.status.exit_code())
        }
        Commands::Delete { reason } => {
            let signer = cfg.signer()?;
            let events = layout.read_events()?;
            let drafts = delete::deletion_drafts(&events, &reason);
            let markers = sign::sign_batch(&drafts, &signer, sign::unix_now()?)?;
            let report = publish::publish(
                &cfg.relay,
                cfg.tor_socks.as_deref(),
                &markers,
                &cfg.publish,
                interrupted(),
            )
            .await?;
            print_publish(&report);
            Ok(report.status.exit_code())
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Sign (or re-sign) every record with one shared timestamp and persist them.
fn sign_records(layout: &Layout, records: Records, signer: &SecretKeySigner) -> Result<Vec<Event>> {
    let drafts = records.into_drafts();
    let created_at = sign::unix_now()?;
    let events = sign::sign_batch(&drafts, signer, created_at)?;
    layout.write_events(&events)?;
    info!(records = events.len(), created_at, "signed batch");
    Ok(events)
}

/// Resolves on Ctrl-C; never resolves where signals are unavailable.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn print_publish(report: &PublishReport) {
    println!(
        "{}: submitted {}/{}, accepted {}, rejected {}, unacknowledged {}, send failures {}",
        report.relay,
        report.submitted,
        report.total,
        report.accepted,
        report.rejected,
        report.unacknowledged,
        report.send_failures
    );
    for r in &report.rejections {
        println!("  rejected {} ({}): {}", r.id, r.d.as_deref().unwrap_or("-"), r.message);
    }
    println!("verified: {}", report.verified);
    println!("status: {:?}", report.status);
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> std::process::ExitCode {
    use std::process::ExitCode;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    match run(Cli::parse()).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use scriptorium::keys::KeyError;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEY: &str = "67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa";

    fn clear_env() {
        for v in [
            "SCRIPTORIUM_KEY",
            "SCRIPTORIUM_RELAY",
            "SCRIPTORIUM_RELAY_HINT",
            "SCRIPTORIUM_OUT",
            "TOR_SOCKS",
            "SCRIPTORIUM_SETTLE_SECS",
        ] {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir, extra: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "SCRIPTORIUM_OUT={}\nSCRIPTORIUM_RELAY_HINT=wss://hint.example\nSCRIPTORIUM_SETTLE_SECS=2\n{}",
            dir.path().join("out").to_str().unwrap(),
            extra
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn write_tree(dir: &TempDir) -> PathBuf {
        let tree = json!({
            "sections": [
                {"path_titles": ["Bible", "Genesis", "Genesis Chapter 1", "1:1"], "path_levels": [1, 2, 3, 4], "content": "In the beginning"},
                {"path_titles": ["Bible", "Genesis", "Genesis Chapter 1", "1:2"], "path_levels": [1, 2, 3, 4], "content": "And the earth"}
            ],
            "leaf_level": 4
        });
        let path = dir.path().join("tree.json");
        fs::write(&path, tree.to_string()).unwrap();
        path
    }

    fn cli(env: &str, command: Commands) -> Cli {
        Cli {
            env: env.into(),
            out: None,
            relay: None,
            command,
        }
    }

    fn compile_cmd(tree: PathBuf) -> Commands {
        Commands::Compile {
            tree,
            metadata: None,
            collection_id: Some("bible".into()),
            language: None,
        }
    }

    #[tokio::test]
    async fn compile_sign_verify() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, &format!("SCRIPTORIUM_KEY={KEY}\n"));
        let tree = write_tree(&dir);

        assert_eq!(run(cli(&env, compile_cmd(tree))).await.unwrap(), 0);
        let layout = Layout::new(dir.path().join("out"));
        let drafts = layout.read_records().unwrap();
        assert!(matches!(drafts, Records::Unsigned(ref d) if d.len() == 5));

        assert_eq!(run(cli(&env, Commands::Sign { resign: false })).await.unwrap(), 0);
        let events = layout.read_events().unwrap();
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.created_at == events[0].created_at));
        let a = events[0].tags.iter().find(|t| t.is("a")).unwrap();
        assert_eq!(a.0[2], "wss://hint.example");

        assert!(run(cli(&env, Commands::Sign { resign: false })).await.is_err());
        assert_eq!(run(cli(&env, Commands::Sign { resign: true })).await.unwrap(), 0);
        assert_eq!(run(cli(&env, Commands::Verify { sample: None })).await.unwrap(), 0);
        clear_env();
    }

    #[tokio::test]
    async fn compile_requires_collection_id() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, "");
        let tree = write_tree(&dir);
        let cmd = Commands::Compile {
            tree,
            metadata: None,
            collection_id: None,
            language: None,
        };
        assert!(run(cli(&env, cmd)).await.is_err());
    }

    #[tokio::test]
    async fn bad_key_fails_before_connecting() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let env = write_env(
            &dir,
            &format!("SCRIPTORIUM_KEY=abcd\nSCRIPTORIUM_RELAY=ws://{addr}\n"),
        );
        let tree = write_tree(&dir);
        run(cli(&env, compile_cmd(tree))).await.unwrap();

        let err = run(cli(&env, Commands::Publish { resign: false, no_verify: false }))
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<KeyError>(), Some(&KeyError::Length(2)));
        let accepted = tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "no connection may be opened");
        clear_env();
    }

    #[tokio::test]
    async fn publish_signs_and_verifies() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut stored: Vec<Value> = Vec::new();
            while let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let v: Value = serde_json::from_str(&txt).unwrap();
                match v[0].as_str() {
                    Some("EVENT") => {
                        let ok = json!(["OK", v[1]["id"], true, ""]);
                        stored.push(v[1].clone());
                        ws.send(TMsg::Text(ok.to_string())).await.unwrap();
                    }
                    Some("REQ") => {
                        let sub = v[1].clone();
                        let d = v[2]["#d"][0].clone();
                        for ev in stored.iter().filter(|e| e["tags"][0][1] == d) {
                            let frame = json!(["EVENT", sub, ev]);
                            ws.send(TMsg::Text(frame.to_string())).await.unwrap();
                        }
                        ws.send(TMsg::Text(json!(["EOSE", sub]).to_string())).await.unwrap();
                    }
                    _ => {}
                }
            }
        });

        let dir = TempDir::new().unwrap();
        let env = write_env(
            &dir,
            &format!("SCRIPTORIUM_KEY={KEY}\nSCRIPTORIUM_RELAY=ws://{addr}\n"),
        );
        let tree = write_tree(&dir);
        run(cli(&env, compile_cmd(tree))).await.unwrap();

        let code = run(cli(&env, Commands::Publish { resign: false, no_verify: false }))
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(Layout::new(dir.path().join("out")).read_events().is_ok());
        clear_env();
    }
}
