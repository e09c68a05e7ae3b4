use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::ConnectArgs,
    config::matches_sentinel,
    session::LineReader,
};

pub async fn run(args: ConnectArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args.server).await?;
    let mut stdin = spawn_stdin_reader();

    let sentinel = args.exit_sentinel();

    run_client_loop(&mut reader, &mut writer, &mut stdin, sentinel).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

/// Stdin is read on a plain thread so a pending read never holds up runtime
/// shutdown once the loop exits.
fn spawn_stdin_reader() -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn establish_connection(
    server: &str,
) -> Result<(LineReader<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;

    info!("connected to {server}");

    let (reader, writer) = stream.into_split();
    Ok((LineReader::new(BufReader::new(reader)), writer))
}

async fn run_client_loop(
    reader: &mut LineReader<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut mpsc::Receiver<io::Result<String>>,
    sentinel: Option<&str>,
) -> Result<()> {
    loop {
        select! {
            server_line = reader.receive_line() => {
                if !handle_server_line(server_line.context("failed to read from relay")?).await? {
                    break;
                }
            }
            input = stdin.recv() => {
                if !handle_stdin_input(input, writer, sentinel).await? {
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

async fn handle_server_line(line: Option<String>) -> Result<bool> {
    match line {
        Some(line) => {
            write_stdout(&line).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    input: Option<io::Result<String>>,
    writer: &mut OwnedWriteHalf,
    sentinel: Option<&str>,
) -> Result<bool> {
    let Some(text) = input.transpose()? else {
        return Ok(false);
    };

    send_line(writer, &text)
        .await
        .context("failed to send line to relay")?;

    if matches_sentinel(sentinel, &text) {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    Ok(true)
}

async fn send_line(writer: &mut OwnedWriteHalf, text: &str) -> io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
