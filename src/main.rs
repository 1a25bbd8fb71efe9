use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshchat::{
    DEFAULT_RENDEZVOUS_TAG, DhtMode, Node, NodeConfig, PeerDescriptor, TransportKind,
};

#[derive(Parser, Debug)]
#[command(name = "meshchat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port to listen on (0 picks one).
    #[arg(short, long, default_value = "0")]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// quic or quic6; repeat to enable both.
    #[arg(long = "transport", value_name = "KIND", default_value = "quic")]
    transports: Vec<TransportKind>,

    /// Bootstrap peer as IP:PORT/IDENTITY.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<PeerDescriptor>,

    #[arg(short, long, default_value = DEFAULT_RENDEZVOUS_TAG)]
    tag: String,

    /// single or dual (separate LAN and WAN tables).
    #[arg(long, default_value = "single")]
    dht_mode: DhtMode,

    #[arg(long, default_value = "10")]
    dial_timeout_secs: u64,

    /// Re-run the rendezvous lookup on this interval; 0 runs it once.
    #[arg(long, default_value = "60")]
    rediscover_secs: u64,
}

impl Args {
    fn into_config(self) -> NodeConfig {
        let mut config = NodeConfig {
            listen_host: self.host,
            listen_port: self.port,
            transports: self.transports,
            bootstrap: self.bootstrap,
            rendezvous_tag: self.tag,
            ..NodeConfig::default()
        };
        config.dht.mode = self.dht_mode;
        config.timeouts.dial = Duration::from_secs(self.dial_timeout_secs);
        config.discovery.rediscover_interval =
            (self.rediscover_secs > 0).then(|| Duration::from_secs(self.rediscover_secs));
        config
    }
}

fn format_incoming(text: &str) -> String {
    format!("\x1b[32m{text}\n\x1b[0m> ")
}

/// Publishes every non-empty line of `input` until EOF or a read error.
async fn forward_input<R>(input: R, outgoing: &broadcast::Sender<String>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        // No subscribers just means no peers yet.
        let _ = outgoing.send(line);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node = Arc::new(Node::bind(args.into_config()).await?);
    info!("Host created, we are: {}", node.identity());
    info!("Bootstrap string for other nodes: {}", node.descriptor());

    let mut chat = node.enable_chat();

    node.connect_bootstrap_set().await;

    let discovery = {
        let node = node.clone();
        tokio::spawn(async move {
            let result = node.run_discovery().await;
            if let Err(e) = &result {
                error!(error = %format!("{e:#}"), "discovery failed");
                node.cancel_token().cancel();
            }
            result
        })
    };

    let outgoing = chat.outgoing.clone();
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        match forward_input(stdin, &outgoing).await {
            Ok(()) => debug!("stdin closed, no more outgoing chat lines"),
            Err(e) => warn!(error = %e, "error reading from stdin"),
        }
    });

    let cancel = node.cancel_token();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = cancel.cancelled() => break,
            line = chat.incoming.recv() => {
                let Some(line) = line else { break };
                stdout.write_all(format_incoming(&line.text).as_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }

    node.shutdown().await;
    match discovery.await {
        Ok(result) => result,
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn input_skips_blank_lines() {
        let (tx, mut rx) = broadcast::channel(8);
        forward_input(&b"one\n\n  \ntwo\n"[..], &tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_utf8_input_is_reported() {
        let (tx, mut rx) = broadcast::channel(8);
        let err = forward_input(&b"hello\n\xff\xfe\nlater\n"[..], &tx)
            .await
            .expect_err("invalid UTF-8 ends the input");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn incoming_lines_are_green_with_prompt() {
        assert_eq!(format_incoming("hi"), "\x1b[32mhi\n\x1b[0m> ");
    }
}
