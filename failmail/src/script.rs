//! Scripted SMTP sessions, for smoke-testing a deployment.
//!
//! The script file holds one client command per line; blank lines and `#`
//! comments are skipped. Inside a DATA body (after a `DATA` line, until the
//! lone `.`) lines are sent without waiting for replies, matching the wire
//! protocol. The driver shuts the pipeline down once the script completes.

use std::{net::SocketAddr, path::Path};

use failmail_common::{incoming, internal, outgoing};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

/// Replay the script against the listener.
///
/// # Errors
/// On connection failures or when the server hangs up mid-script.
pub async fn run_script(path: &Path, address: SocketAddr) -> anyhow::Result<()> {
    let script = tokio::fs::read_to_string(path).await?;

    let stream = TcpStream::connect(address).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut replies = BufReader::new(read_half).lines();

    read_reply(&mut replies).await?;

    let mut in_data = false;
    for line in script.lines() {
        if !in_data && (line.is_empty() || line.starts_with('#')) {
            continue;
        }

        outgoing!("{line}");
        write_half.write_all(format!("{line}\r\n").as_bytes()).await?;

        if in_data {
            if line == "." {
                in_data = false;
                read_reply(&mut replies).await?;
            }
            continue;
        }

        let reply = read_reply(&mut replies).await?;
        if line.eq_ignore_ascii_case("DATA") && reply.starts_with("354") {
            in_data = true;
        }
    }

    internal!("script finished");
    Ok(())
}

/// Read one complete (possibly multi-line) reply, returning its final line.
async fn read_reply(
    replies: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
) -> anyhow::Result<String> {
    loop {
        let Some(line) = replies.next_line().await? else {
            anyhow::bail!("server closed the connection mid-script");
        };
        incoming!("{line}");

        // Continuation lines look like "250-..."; the final line has a space.
        if line.len() < 4 || line.as_bytes()[3] != b'-' {
            return Ok(line);
        }
    }
}
