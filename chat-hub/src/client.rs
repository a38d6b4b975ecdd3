use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as Frame,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{cli::ClientArgs, message::Message};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let url = endpoint_url(&args.server, args.username.as_deref())?;
    let (mut socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!("connected to {}", url);

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut socket, &mut stdin, &mut input).await?;
    shutdown_connection(&mut socket).await;

    Ok(())
}

/// Appends the optional `username` query parameter to the hub endpoint.
pub fn endpoint_url(server: &str, username: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(server).with_context(|| format!("invalid hub url '{server}'"))?;
    if let Some(username) = username {
        url.query_pairs_mut().append_pair("username", username);
    }
    Ok(url)
}

async fn run_client_loop(
    socket: &mut Socket,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        select! {
            frame = socket.next() => {
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            // `read_line` keeps partial input in `input` when another branch
            // wins, so the buffer is only cleared once a full line is handled.
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, socket).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(
    frame: Option<Result<Frame, tokio_tungstenite::tungstenite::Error>>,
) -> Result<bool> {
    match frame {
        Some(Ok(Frame::Text(text))) => {
            match Message::from_json(&text) {
                Ok(message) => write_stdout(&render(&message)).await?,
                Err(err) => debug!(error = %err, "ignoring malformed frame from hub"),
            }
            Ok(true)
        }
        Some(Ok(Frame::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("failed to read from hub"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    socket: &mut Socket,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    socket
        .send(Frame::Text(text.to_string()))
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(socket: &mut Socket) {
    if let Err(error) = socket.close(None).await {
        warn!(?error, "failed to close websocket cleanly");
    }
}

/// Formats one envelope as a terminal line.
pub fn render(message: &Message) -> String {
    match message {
        Message::Chat { author, body } => format!("<{author}> {body}"),
        Message::System { body, .. } => format!("*** {body}"),
        Message::Roster { users } => format!("*** online: {}", users.join(", ")),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_encodes_username() {
        let url = endpoint_url("ws://127.0.0.1:8080/ws", Some("ada lovelace")).expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/ws?username=ada+lovelace");
    }

    #[test]
    fn endpoint_url_without_username() {
        let url = endpoint_url("ws://localhost:9000/ws", None).expect("url");
        assert_eq!(url.as_str(), "ws://localhost:9000/ws");
    }

    #[test]
    fn renders_each_kind() {
        assert_eq!(render(&Message::chat("alice", "hi")), "<alice> hi");
        assert_eq!(render(&Message::joined("bob")), "*** bob joined the chat");
        assert_eq!(
            render(&Message::roster(["bob", "alice"])),
            "*** online: alice, bob"
        );
    }
}
