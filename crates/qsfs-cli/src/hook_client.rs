//! Client side of the hook socket, for wiring zdb's hook flag to qsfsd
//! and for poking a running daemon by hand.

use std::path::Path;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::warn;

/// Join the arguments into one hook line, send it and print the reply.
/// A daemon that is not running is reported but exits clean, so zdb is
/// never blocked by a missing supervisor.
pub async fn run(socket_path: &Path, args: &[String]) -> Result<()> {
    let mut stream = match UnixStream::connect(socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                socket = %socket_path.display(),
                error = %e,
                "Daemon is not reachable, dropping hook"
            );
            return Ok(());
        }
    };

    let line = format!("{}\n", args.join(" "));
    if let Err(e) = stream.write_all(line.as_bytes()).await {
        warn!(error = %e, "Could not send hook message");
        return Ok(());
    }

    let mut reply = String::new();
    if let Err(e) = BufReader::new(stream).read_line(&mut reply).await {
        warn!(error = %e, "Could not read hook reply");
        return Ok(());
    }
    let reply = reply.trim_end();
    println!("Hook response from daemon: {}", reply);

    if let Some(reason) = reply.strip_prefix("ERROR: ") {
        bail!("hook failed: {}", reason);
    }
    Ok(())
}
