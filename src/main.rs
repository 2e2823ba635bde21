use std::sync::Arc;

use clap::Parser;
use kubesync::k8s::backend::KubeBackend;
use kubesync::k8s::descriptor::WatchDescriptor;
use kubesync::k8s::sync::{SubscriptionCoordinator, SyncStore};
use kubesync::k8s::{USER_AGENT, client};
use kubesync::net::ChannelRegistry;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kind to keep in sync (one of the builtin workload kinds)
    #[arg(short, long, default_value = "Pod")]
    kind: String,

    /// Namespace to scope the query to; all namespaces when omitted
    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector, repeatable as key=value
    #[arg(short = 'l', long = "selector")]
    selectors: Vec<String>,
}

#[tokio::main]
async fn main() -> kubesync::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // kube's TLS stack needs a process-wide crypto provider.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();

    let mut descriptor = WatchDescriptor::new(&args.kind);
    if let Some(namespace) = &args.namespace {
        descriptor = descriptor.namespace(namespace);
    }
    for selector in &args.selectors {
        let Some((key, value)) = selector.split_once('=') else {
            return Err(kubesync::Error::Custom(format!(
                "selector {selector} is not key=value"
            )));
        };
        descriptor = descriptor.label(key, value);
    }

    let client = client::new(Some(USER_AGENT)).await?;
    let backend = Arc::new(KubeBackend::new(client).with_builtin_kinds());
    let coordinator = Arc::new(SubscriptionCoordinator::new(
        Arc::new(SyncStore::new()),
        Arc::new(ChannelRegistry::new()),
        backend.clone(),
        backend,
    ));

    let handle = coordinator.subscribe(&descriptor);
    let mut changes = coordinator.changed();

    info!(kind = %args.kind, "syncing; ctrl-c to exit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(entry) = coordinator.snapshot(&handle) {
                    let status = entry
                        .load_error
                        .as_deref()
                        .unwrap_or(if entry.loaded { "loaded" } else { "loading" });
                    println!("{} {} objects ({status})", entry.data.len(), args.kind);
                }
            }
        }
    }

    coordinator.unsubscribe(handle);
    Ok(())
}
