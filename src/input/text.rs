use std::io::BufRead;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::agent_engine::engine::SessionHandle;
use crate::agent_engine::state::{ConnectionState, ReconnectOutcome};
use crate::errors::DeskPilotResult;

/// The most recent command typed by the user, kept so it can be resent after
/// a reconnect.
#[derive(Clone, Default)]
pub struct LastCommand(Arc<Mutex<Option<String>>>);

impl LastCommand {
    pub fn set(&self, command: &str) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(command.to_string());
        }
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }

    /// Tells the user what happened to the connection and how to retry.
    pub fn announce(&self, outcome: &ReconnectOutcome) {
        match outcome {
            ReconnectOutcome::Restored { attempts } => {
                println!("\n[connection restored after {attempts} attempt(s)]");
                if let Some(cmd) = self.get() {
                    println!("Type 'resend' to retry: {cmd}");
                }
            }
            ReconnectOutcome::Exhausted { attempts, last_error } => {
                println!("\n[connection lost; gave up after {attempts} attempt(s): {last_error}]");
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Empty,
    Quit,
    Resend,
    Text(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    match line.to_lowercase().as_str() {
        "" => Command::Empty,
        "exit" | "quit" | "q" => Command::Quit,
        "resend" | "retry" => Command::Resend,
        _ => Command::Text(line),
    }
}

/// Lines typed on stdin, read on a detached OS thread. A read that is still
/// blocked at exit never holds the process open.
pub fn stdin_lines() -> DeskPilotResult<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// Reads commands line by line and sends each as a user turn. `quit` or end
/// of input (the channel closing) stops the session.
pub async fn run_text_input(
    handle: SessionHandle,
    mut lines: mpsc::Receiver<String>,
    last: LastCommand,
) -> DeskPilotResult<()> {
    if handle.wait_ready().await != ConnectionState::Active {
        return Ok(());
    }
    println!("Type a command for the agent ('quit' to exit).");

    loop {
        let line = tokio::select! {
            _ = handle.stopped() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            tracing::info!("input closed");
            handle.stop();
            break;
        };

        let text = match parse_command(&line) {
            Command::Empty => continue,
            Command::Quit => {
                handle.stop();
                break;
            }
            Command::Resend => match last.get() {
                Some(cmd) => cmd,
                None => {
                    println!("Nothing to resend.");
                    continue;
                }
            },
            Command::Text(text) => {
                last.set(text);
                text.to_string()
            }
        };

        if let Err(e) = handle.send_text(&text).await {
            tracing::warn!(error = %e, "command not sent");
            println!("Not connected, command not sent. Type 'resend' once the connection is back.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{active_session, sent_texts};

    /// A closed channel already holding `input`, one entry per line.
    fn typed(input: &str) -> mpsc::Receiver<String> {
        let lines: Vec<&str> = input.lines().collect();
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.try_send(line.to_string()).unwrap();
        }
        rx
    }

    #[test]
    fn commands_are_recognised() {
        assert_eq!(parse_command("  "), Command::Empty);
        assert_eq!(parse_command("QUIT"), Command::Quit);
        assert_eq!(parse_command("resend"), Command::Resend);
        assert_eq!(parse_command(" open spotify "), Command::Text("open spotify"));
    }

    #[tokio::test]
    async fn lines_become_user_turns_and_resend_repeats_the_last() {
        let (handle, run, connector) = active_session().await;
        let last = LastCommand::default();
        let input = typed("resend\nopen spotify\n\nresend\nquit\nnever sent\n");

        run_text_input(handle.clone(), input, last.clone()).await.unwrap();
        run.await.unwrap().unwrap();

        assert!(handle.is_stopped());
        assert_eq!(sent_texts(&connector), vec!["open spotify", "open spotify"]);
        assert_eq!(last.get().as_deref(), Some("open spotify"));
    }

    #[tokio::test]
    async fn end_of_input_stops_the_session() {
        let (handle, run, _connector) = active_session().await;
        run_text_input(handle.clone(), typed(""), LastCommand::default()).await.unwrap();
        run.await.unwrap().unwrap();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_a_pending_line() {
        let (handle, run, _connector) = active_session().await;
        // sender kept alive: the reader is still blocked on a line
        let (_tx, rx) = mpsc::channel::<String>(1);
        let input = tokio::spawn(run_text_input(handle.clone(), rx, LastCommand::default()));

        handle.stop();
        tokio::time::timeout(std::time::Duration::from_secs(3), input)
            .await
            .expect("producer should end on stop")
            .unwrap()
            .unwrap();
        run.await.unwrap().unwrap();
    }
}
