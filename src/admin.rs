use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::env::ScEnv;
use crate::error::ScError;
use crate::partition::{apply_partition, PartitionCommand};
use crate::traits::PartitionOps;

/// Line-oriented admin socket. A connection names its request on the first
/// line; `partition` is followed by the partition exchange.
pub struct AdminServer {
    host: String,
    port: u16,
    env: Arc<ScEnv>,
    ops: Arc<dyn PartitionOps>,
}

impl AdminServer {
    pub fn new(host: String, port: u16, env: Arc<ScEnv>, ops: Arc<dyn PartitionOps>) -> Self {
        Self {
            host,
            port,
            env,
            ops,
        }
    }

    /// Serve until Ctrl-C
    pub async fn start(&self) -> Result<(), ScError> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ScError::Error(format!("Invalid address: {}", e)))?;
        let listener = TcpListener::bind(addr).await?;

        println!("livesc admin socket listening on {}", addr);
        info!("Admin socket listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping admin socket");
                let _ = shutdown_tx.send(());
            }
        });

        self.run(listener, shutdown_rx).await
    }

    /// Accept connections on `listener` until a shutdown message arrives
    pub async fn run(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ScError> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Admin accept failed: {}", e);
                            continue;
                        }
                    };
                    debug!("Admin connection from {}", peer);
                    let env = Arc::clone(&self.env);
                    let ops = Arc::clone(&self.ops);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, env, ops).await {
                            warn!("Admin connection from {} failed: {}", peer, e);
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("Admin socket shut down");
                    return Ok(());
                }
            }
        }
    }
}

/// Serve one admin connection
pub async fn handle_connection<S>(
    stream: S,
    env: Arc<ScEnv>,
    ops: Arc<dyn PartitionOps>,
) -> Result<(), ScError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    match line.trim() {
        "partition" => {
            let reply = match PartitionCommand::read_from(&mut stream).await? {
                Some(cmd) => {
                    info!("Partition command for '{}'", cmd.target);
                    tokio::task::spawn_blocking(move || apply_partition(&env, ops.as_ref(), &cmd))
                        .await
                        .map_err(|e| ScError::Error(format!("partition task failed: {}", e)))?
                }
                None => return Ok(()),
            };
            stream.write_all(reply.as_bytes()).await?;
        }
        other => {
            warn!("Unknown admin request '{}'", other);
            stream
                .write_all(format!("!unknown request '{}'\nFAILED\n", other).as_bytes())
                .await?;
        }
    }
    stream.flush().await?;
    Ok(())
}
