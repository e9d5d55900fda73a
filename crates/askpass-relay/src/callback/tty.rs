//! Terminal credential callback.
//!
//! Asks on the terminal of the application, not of the git process, which
//! never has one. Secrets are read with `rpassword` (no echo); usernames
//! and host key confirmations are read as plain lines.

use std::io::{self, BufRead, Write};

use askpass_relay_core::{CallbackFuture, CredentialCallback, PromptRequest};
use secrecy::SecretString;
use tracing::{debug, warn};

/// Credential callback that prompts on the controlling terminal.
///
/// An empty answer refuses the prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct TtyCallback;

impl TtyCallback {
    /// Create a new terminal callback.
    pub fn new() -> Self {
        Self
    }
}

impl CredentialCallback for TtyCallback {
    fn respond(&self, request: PromptRequest) -> CallbackFuture<'_> {
        Box::pin(async move {
            // stdin reads block, keep them off the runtime threads
            let result = tokio::task::spawn_blocking(move || read_answer(&request)).await;

            match result {
                Ok(Ok(answer)) if answer.is_empty() => {
                    debug!("Empty answer entered; refusing prompt");
                    None
                }
                Ok(Ok(answer)) => Some(SecretString::from(answer)),
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to read answer from terminal");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Terminal prompt task failed");
                    None
                }
            }
        })
    }
}

fn read_answer(request: &PromptRequest) -> io::Result<String> {
    let prompt = display_prompt(&request.prompt);

    if request.kind.is_visible() {
        read_visible(&prompt, &mut io::stdin().lock())
    } else {
        rpassword::prompt_password(prompt)
    }
}

/// Show `prompt` and read one echoed line from `input`.
///
/// stderr is only locked while the prompt is written. Log output goes to
/// stderr too and must not stall while the user hasn't answered.
fn read_visible(prompt: &str, input: &mut impl BufRead) -> io::Result<String> {
    {
        let mut stderr = io::stderr().lock();
        stderr.write_all(prompt.as_bytes())?;
        stderr.flush()?;
    }

    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Make sure the cursor ends up after a space, as git's own prompts do.
fn display_prompt(prompt: &str) -> String {
    if prompt.ends_with(' ') {
        prompt.to_string()
    } else {
        format!("{prompt} ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_create_tty_callback() {
        let _callback = TtyCallback::new();
    }

    /// Input that checks from another thread that stderr can be locked
    /// while the answer is being read.
    struct StderrCheckingInput {
        answer: &'static [u8],
    }

    impl io::Read for StderrCheckingInput {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _stderr = io::stderr().lock();
                let _ = tx.send(());
            });
            rx.recv_timeout(std::time::Duration::from_secs(5))
                .map_err(|_| io::Error::other("stderr stayed locked while reading"))?;

            let n = self.answer.len().min(buf.len());
            buf[..n].copy_from_slice(&self.answer[..n]);
            self.answer = &self.answer[n..];
            Ok(n)
        }
    }

    #[test]
    fn stderr_is_free_while_waiting_for_input() {
        let mut input = io::BufReader::new(StderrCheckingInput {
            answer: b"alice\n",
        });
        let answer = read_visible("Username: ", &mut input).unwrap();
        assert_eq!(answer, "alice");
    }

    #[test]
    fn visible_answer_strips_line_ending() {
        let mut input: &[u8] = b"bob\r\nignored\n";
        assert_eq!(read_visible("Username: ", &mut input).unwrap(), "bob");
    }

    #[test]
    fn display_prompt_adds_trailing_space_once() {
        assert_eq!(display_prompt("Password:"), "Password: ");
        assert_eq!(display_prompt("Password: "), "Password: ");
    }
}
